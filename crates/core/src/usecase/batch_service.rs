use std::sync::Arc;

use crate::domain::error::AppError;
use crate::domain::job::{AudioFile, BatchJob, JobDetail, JobOptions, JobStatus};
use crate::domain::settings::BatchSettings;
use crate::domain::transcribe::Transcriber;
use crate::domain::types::{JobList, JobResult, SubmitReceipt};
use crate::infra::metrics::{Metrics, MetricsSummary};
use crate::infra::storage::JobStore;
use crate::infra::stt::create_transcriber;
use crate::usecase::worker_pool::{JobOutcome, WorkerPool};

/// バッチ文字起こしサービス（トランスポート層から呼ばれる窓口）
pub struct BatchService {
    store: Arc<JobStore>,
    pool: WorkerPool,
    metrics: Arc<Metrics>,
    settings: BatchSettings,
}

impl BatchService {
    pub fn new(store: JobStore, transcriber: Arc<dyn Transcriber>, settings: BatchSettings) -> Self {
        let store = Arc::new(store);
        let metrics = Arc::new(Metrics::new());
        let pool = WorkerPool::new(
            Arc::clone(&store),
            transcriber,
            settings.max_concurrent,
            Arc::clone(&metrics),
        );
        log::info!(
            "Batch service ready (workers={}, default_model={})",
            settings.max_concurrent,
            settings.default_model
        );
        Self {
            store,
            pool,
            metrics,
            settings,
        }
    }

    /// 設定からストアとエンジンを構築する
    pub fn from_settings(settings: BatchSettings) -> Result<Self, AppError> {
        let store = JobStore::open(&settings.db_path)?;
        let transcriber = create_transcriber(&settings);
        Ok(Self::new(store, transcriber, settings))
    }

    pub fn settings(&self) -> &BatchSettings {
        &self.settings
    }

    // ==================== Jobs ====================

    /// ジョブを登録してワーカープールへ回す。処理完了は待たない。
    ///
    /// Tokio ランタイム内から呼ぶこと。
    pub fn submit(
        &self,
        files: Vec<AudioFile>,
        model: Option<String>,
        options: JobOptions,
    ) -> Result<SubmitReceipt, AppError> {
        if files.is_empty() {
            return Err(AppError::invalid_input("at least one file is required"));
        }
        let max_files = self.settings.max_files_per_job;
        if files.len() > max_files {
            return Err(AppError::invalid_input(format!(
                "too many files: {} (max {max_files} per job)",
                files.len()
            )));
        }

        let model = model
            .filter(|m| !m.trim().is_empty())
            .unwrap_or_else(|| self.settings.default_model.clone());
        let job_id = uuid::Uuid::new_v4().to_string();
        let filenames: Vec<String> = files.iter().map(|f| f.filename.clone()).collect();

        let job = BatchJob::new(
            job_id.clone(),
            model.clone(),
            filenames,
            options.clone(),
            chrono::Utc::now(),
        );
        self.store.create(&job)?;
        self.pool.submit(job_id.clone(), files, model, options);

        log::info!("Batch job {} queued ({} files)", job_id, job.files.len());
        Ok(SubmitReceipt {
            job_id,
            status: JobStatus::Queued,
            file_count: job.files.len(),
        })
    }

    pub fn list_jobs(
        &self,
        status: Option<JobStatus>,
        limit: Option<u32>,
    ) -> Result<JobList, AppError> {
        let limit = limit.unwrap_or(self.settings.default_list_limit);
        let jobs = self.store.list(limit, status)?;
        let total = self.store.count(status)?;
        Ok(JobList {
            jobs: jobs.iter().map(BatchJob::summary).collect(),
            total,
        })
    }

    pub fn get_job(&self, job_id: &str) -> Result<Option<JobDetail>, AppError> {
        Ok(self.store.get(job_id)?.map(BatchJob::into_detail))
    }

    /// done のときだけ結果を返す。それ以外は現在の状態と再試行までの秒数。
    pub fn get_result(&self, job_id: &str) -> Result<Option<JobResult>, AppError> {
        let Some(job) = self.store.get(job_id)? else {
            return Ok(None);
        };
        let result = if job.status == JobStatus::Done {
            JobResult::Ready {
                job_id: job.job_id,
                results: job.results,
            }
        } else {
            JobResult::NotReady {
                job_id: job.job_id,
                status: job.status,
                retry_after: self.settings.result_retry_after_secs,
            }
        };
        Ok(Some(result))
    }

    /// レコードを削除する。キャンセルはしないため、実行中のタスクは処理中のファイルを
    /// 終えてから次の書き込みで不在を検知し、`JobOutcome::Vanished` で終わる。
    pub fn delete_job(&self, job_id: &str) -> Result<bool, AppError> {
        let deleted = self.store.delete(job_id)?;
        if deleted && self.pool.is_active(job_id) {
            log::warn!("Batch job {job_id} deleted while still active");
        }
        Ok(deleted)
    }

    pub fn cancel_job(&self, job_id: &str) -> bool {
        self.pool.cancel(job_id)
    }

    pub fn active_jobs(&self) -> usize {
        self.pool.active_count()
    }

    // ==================== Metrics / lifecycle ====================

    pub fn metrics(&self) -> MetricsSummary {
        self.metrics.summary()
    }

    /// 投入済みジョブが全て終わるまで待つ
    pub async fn wait_idle(&self) -> Vec<(String, JobOutcome)> {
        self.pool.wait_all().await
    }

    pub async fn shutdown(&self) -> Vec<(String, JobOutcome)> {
        log::info!("Batch service shutting down");
        self.pool.shutdown().await
    }
}
