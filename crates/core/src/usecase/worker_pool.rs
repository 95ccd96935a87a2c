use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::domain::error::AppError;
use crate::domain::job::{AudioFile, JobOptions, JobUpdate};
use crate::domain::transcribe::{TranscribeOptions, Transcriber};
use crate::infra::metrics::Metrics;
use crate::infra::storage::JobStore;
use crate::usecase::file_pipeline::FilePipeline;

/// キャンセル時に記録されるエラー文字列
pub const CANCELLED_ERROR: &str = "Cancelled";

/// ジョブタスクの終了結果（タスクの JoinHandle の出力）
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobOutcome {
    /// 全ファイル処理済み（ファイル単位の失敗を含む）
    Done { files: usize },
    /// ジョブ境界で捕捉した障害
    Failed { error: String },
    /// キャンセル要求により中断
    Cancelled,
    /// 実行中にレコードが削除された。削除自体はタスクを止めないが、
    /// 処理中のファイルを終えた後の書き込みで不在を検知して停止する。
    Vanished,
}

type TaskMap = Arc<Mutex<HashMap<String, TaskEntry>>>;

struct TaskEntry {
    cancel: CancellationToken,
    handle: Option<JoinHandle<JobOutcome>>,
}

impl TaskEntry {
    fn is_live(&self) -> bool {
        self.handle.as_ref().map_or(true, |h| !h.is_finished())
    }
}

/// ワーカープール: ジョブごとに Tokio タスクを発行し、セマフォで同時実行数を制限する。
///
/// タスクは完了時（成功・失敗・キャンセル・パニック）に自身のエントリを追跡マップから外す。
pub struct WorkerPool {
    store: Arc<JobStore>,
    pipeline: Arc<FilePipeline>,
    metrics: Arc<Metrics>,
    semaphore: Arc<Semaphore>,
    tasks: TaskMap,
}

impl WorkerPool {
    /// `max_concurrent` が 0 の場合は 1 として扱う
    pub fn new(
        store: Arc<JobStore>,
        transcriber: Arc<dyn Transcriber>,
        max_concurrent: usize,
        metrics: Arc<Metrics>,
    ) -> Self {
        let pipeline = Arc::new(FilePipeline::new(transcriber));
        let permits = max_concurrent.max(1);
        log::info!(
            "Worker pool started (engine={}, max_concurrent={})",
            pipeline.engine_name(),
            permits
        );
        Self {
            store,
            pipeline,
            metrics,
            semaphore: Arc::new(Semaphore::new(permits)),
            tasks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// ジョブをバックグラウンド処理に回す。処理の長さにかかわらず即座に戻る。
    ///
    /// Tokio ランタイム内から呼ぶこと。
    pub fn submit(
        &self,
        job_id: String,
        files: Vec<AudioFile>,
        model: String,
        options: JobOptions,
    ) {
        let cancel = CancellationToken::new();
        let runner = JobRunner {
            job_id: job_id.clone(),
            store: Arc::clone(&self.store),
            pipeline: Arc::clone(&self.pipeline),
            metrics: Arc::clone(&self.metrics),
            semaphore: Arc::clone(&self.semaphore),
            cancel: cancel.clone(),
        };
        let untrack = Untrack {
            tasks: Arc::clone(&self.tasks),
            job_id: job_id.clone(),
        };

        self.metrics.inc_jobs_submitted();

        // spawn と登録を同じロック内で行い、完了時の削除が登録より先に走らないようにする
        let mut tasks = self.tasks.lock();
        let handle = tokio::spawn(async move {
            let _untrack = untrack;
            runner.run(files, model, options).await
        });
        if tasks
            .insert(
                job_id.clone(),
                TaskEntry {
                    cancel,
                    handle: Some(handle),
                },
            )
            .is_some()
        {
            log::warn!("Batch job {job_id} was already tracked; previous handle replaced");
        }
        log::debug!("Batch job {job_id} submitted");
    }

    /// 実行中ジョブのキャンセルを要求する。
    ///
    /// 未知の job_id や既に完了したタスクには何もせず `false` を返す。
    pub fn cancel(&self, job_id: &str) -> bool {
        let tasks = self.tasks.lock();
        match tasks.get(job_id) {
            Some(entry) if entry.is_live() => {
                entry.cancel.cancel();
                log::info!("Batch job {job_id} cancellation requested");
                true
            }
            _ => false,
        }
    }

    pub fn is_active(&self, job_id: &str) -> bool {
        self.tasks.lock().get(job_id).is_some_and(TaskEntry::is_live)
    }

    pub fn active_count(&self) -> usize {
        self.tasks.lock().values().filter(|e| e.is_live()).count()
    }

    /// 現在追跡中の全タスクの完了を待ち、結果を返す。
    pub async fn wait_all(&self) -> Vec<(String, JobOutcome)> {
        let handles: Vec<(String, JoinHandle<JobOutcome>)> = {
            let mut tasks = self.tasks.lock();
            tasks
                .iter_mut()
                .filter_map(|(id, entry)| entry.handle.take().map(|h| (id.clone(), h)))
                .collect()
        };

        let mut outcomes = Vec::with_capacity(handles.len());
        for (job_id, handle) in handles {
            match handle.await {
                Ok(outcome) => outcomes.push((job_id, outcome)),
                Err(e) => log::error!("Batch job {job_id} task ended abnormally: {e}"),
            }
        }
        outcomes
    }

    /// 全ジョブにキャンセルを要求し、完了を待つ。
    pub async fn shutdown(&self) -> Vec<(String, JobOutcome)> {
        {
            let tasks = self.tasks.lock();
            for entry in tasks.values() {
                entry.cancel.cancel();
            }
        }
        self.wait_all().await
    }
}

/// タスク終了時に追跡マップからエントリを外す
struct Untrack {
    tasks: TaskMap,
    job_id: String,
}

impl Drop for Untrack {
    fn drop(&mut self) {
        self.tasks.lock().remove(&self.job_id);
    }
}

/// ジョブ処理を中断させた理由
enum Interrupt {
    Cancelled,
    Vanished,
    Fault(AppError),
}

/// 1ジョブ分の状態遷移を駆動する。ジョブの変更はこのタスクだけが行う。
struct JobRunner {
    job_id: String,
    store: Arc<JobStore>,
    pipeline: Arc<FilePipeline>,
    metrics: Arc<Metrics>,
    semaphore: Arc<Semaphore>,
    cancel: CancellationToken,
}

impl JobRunner {
    async fn run(self, files: Vec<AudioFile>, model: String, options: JobOptions) -> JobOutcome {
        let permit = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                log::info!("Batch job {} cancelled before start", self.job_id);
                self.persist_failure(CANCELLED_ERROR);
                self.metrics.inc_jobs_cancelled();
                return JobOutcome::Cancelled;
            }
            permit = Arc::clone(&self.semaphore).acquire_owned() => permit,
        };
        let _permit = match permit {
            Ok(permit) => permit,
            Err(e) => {
                let error = format!("worker pool closed: {e}");
                self.persist_failure(&error);
                self.metrics.inc_jobs_failed();
                return JobOutcome::Failed { error };
            }
        };

        match self.process(files, &model, &options).await {
            Ok(count) => {
                log::info!("Batch job {} completed: {} files", self.job_id, count);
                self.metrics.inc_jobs_done();
                JobOutcome::Done { files: count }
            }
            Err(Interrupt::Cancelled) => {
                log::info!("Batch job {} cancelled", self.job_id);
                self.persist_failure(CANCELLED_ERROR);
                self.metrics.inc_jobs_cancelled();
                JobOutcome::Cancelled
            }
            Err(Interrupt::Vanished) => {
                log::warn!("Batch job {} was deleted while running; stopping", self.job_id);
                JobOutcome::Vanished
            }
            Err(Interrupt::Fault(e)) => {
                log::error!("Batch job {} failed: {}", self.job_id, e);
                let error = e.to_string();
                self.persist_failure(&error);
                self.metrics.inc_jobs_failed();
                JobOutcome::Failed { error }
            }
        }
    }

    /// ファイルを投入順に処理し、1件ごとに途中結果を保存する。
    async fn process(
        &self,
        files: Vec<AudioFile>,
        model: &str,
        options: &JobOptions,
    ) -> Result<usize, Interrupt> {
        self.write(JobUpdate::running(Utc::now()))?;
        log::debug!("Batch job {} running ({} files)", self.job_id, files.len());

        let forwarded = TranscribeOptions::from_job_options(options);
        let mut results = Vec::with_capacity(files.len());

        for file in files {
            let result = tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(Interrupt::Cancelled),
                result = self.pipeline.run(file, model, &forwarded) => result,
            };
            self.metrics
                .record_file(&result.filename, result.is_done(), result.processing_time_ms);
            results.push(result);
            self.write(JobUpdate::progress(results.clone()))?;
        }

        let count = results.len();
        self.write(JobUpdate::done(Utc::now(), results))?;
        Ok(count)
    }

    // ストア操作は短い同期 I/O なので、ワーカースレッド上で直接実行する。
    // `Ok(false)` はレコード削除済みを意味し、以降の処理は行わない。
    fn write(&self, update: JobUpdate) -> Result<(), Interrupt> {
        match self.store.update(&self.job_id, update) {
            Ok(true) => Ok(()),
            Ok(false) => Err(Interrupt::Vanished),
            Err(e) => Err(Interrupt::Fault(e)),
        }
    }

    /// failed として終端化する。ここでの失敗はログのみ。
    fn persist_failure(&self, error: &str) {
        match self.store.update(&self.job_id, JobUpdate::failed(Utc::now(), error)) {
            Ok(true) => {}
            Ok(false) => log::warn!("Batch job {} no longer exists; failure not recorded", self.job_id),
            Err(e) => log::error!("Batch job {}: could not record failure: {}", self.job_id, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::job::{BatchJob, JobStatus};
    use crate::domain::transcribe::{TranscribeError, Transcription};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    struct StubEngine {
        calls: AtomicUsize,
        fail_on_call: Option<usize>,
        delay: Duration,
    }

    impl StubEngine {
        fn new(delay: Duration) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail_on_call: None,
                delay,
            }
        }
    }

    impl Transcriber for StubEngine {
        fn transcribe(
            &self,
            _audio: &[u8],
            _model: &str,
            _options: &TranscribeOptions,
        ) -> Result<Transcription, TranscribeError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            std::thread::sleep(self.delay);
            if self.fail_on_call == Some(call) {
                return Err(TranscribeError::TranscriptionFailed(format!("call {call} failed")));
            }
            Ok(Transcription {
                text: "hello world".into(),
                language: "en".into(),
                duration: 1.0,
                segments: vec![],
            })
        }

        fn name(&self) -> &str {
            "stub"
        }
    }

    fn setup(engine: Arc<dyn Transcriber>, limit: usize) -> (Arc<JobStore>, WorkerPool) {
        let _ = env_logger::builder().is_test(true).try_init();
        let store = Arc::new(JobStore::open_in_memory().unwrap());
        let pool = WorkerPool::new(Arc::clone(&store), engine, limit, Arc::new(Metrics::new()));
        (store, pool)
    }

    fn create(store: &JobStore, job_id: &str, names: &[&str]) -> Vec<AudioFile> {
        let job = BatchJob::new(
            job_id.into(),
            "test-model".into(),
            names.iter().map(|n| n.to_string()).collect(),
            JobOptions::new(),
            Utc::now(),
        );
        store.create(&job).unwrap();
        names
            .iter()
            .map(|n| AudioFile::new(*n, vec![0u8; 16]))
            .collect()
    }

    async fn wait_for_results(store: &JobStore, job_id: &str, n: usize) {
        for _ in 0..200 {
            if store.get(job_id).unwrap().is_some_and(|j| j.results.len() >= n) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("job {job_id} never reached {n} results");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_lifecycle_to_done() {
        let (store, pool) = setup(Arc::new(StubEngine::new(Duration::ZERO)), 2);
        let files = create(&store, "job-1", &["a.wav", "b.wav"]);

        pool.submit("job-1".into(), files, "test-model".into(), JobOptions::new());
        let outcomes = pool.wait_all().await;

        assert_eq!(outcomes, vec![("job-1".to_string(), JobOutcome::Done { files: 2 })]);
        let job = store.get("job-1").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.results.len(), 2);
        assert!(job.finished_at.unwrap() >= job.started_at.unwrap());
        assert_eq!(pool.active_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_mid_processing() {
        let (store, pool) = setup(Arc::new(StubEngine::new(Duration::from_millis(100))), 2);
        let files = create(&store, "job-1", &["a.wav", "b.wav", "c.wav", "d.wav"]);

        pool.submit("job-1".into(), files, "test-model".into(), JobOptions::new());
        wait_for_results(&store, "job-1", 1).await;

        assert!(pool.cancel("job-1"));
        let outcomes = pool.wait_all().await;
        assert_eq!(outcomes[0].1, JobOutcome::Cancelled);

        let job = store.get("job-1").unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some(CANCELLED_ERROR));
        assert!(job.finished_at.is_some());
        assert!(!job.results.is_empty() && job.results.len() < 4);

        assert!(!pool.cancel("job-1"));
        assert!(!pool.cancel("unknown"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_cancel_while_waiting_for_permit() {
        let (store, pool) = setup(Arc::new(StubEngine::new(Duration::from_millis(100))), 1);
        let first = create(&store, "first", &["a.wav", "b.wav"]);
        let second = create(&store, "second", &["c.wav"]);

        pool.submit("first".into(), first, "m".into(), JobOptions::new());
        wait_for_results(&store, "first", 1).await;
        pool.submit("second".into(), second, "m".into(), JobOptions::new());

        assert!(pool.cancel("second"));
        pool.wait_all().await;

        let second = store.get("second").unwrap().unwrap();
        assert_eq!(second.status, JobStatus::Failed);
        assert_eq!(second.error.as_deref(), Some(CANCELLED_ERROR));
        assert!(second.started_at.is_none());
        assert!(second.results.is_empty());
        assert_eq!(store.get("first").unwrap().unwrap().status, JobStatus::Done);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_deleted_job_stops_processing() {
        let (store, pool) = setup(Arc::new(StubEngine::new(Duration::from_millis(50))), 1);
        let files = create(&store, "job-1", &["a.wav", "b.wav", "c.wav"]);

        pool.submit("job-1".into(), files, "m".into(), JobOptions::new());
        wait_for_results(&store, "job-1", 1).await;
        assert!(store.delete("job-1").unwrap());

        let outcomes = pool.wait_all().await;
        assert_eq!(outcomes[0].1, JobOutcome::Vanished);
        assert!(store.get("job-1").unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_store_fault_fails_job_without_affecting_others() {
        let (store, pool) = setup(Arc::new(StubEngine::new(Duration::ZERO)), 2);
        // 終端済みのレコードは running へ遷移できず、ジョブ境界の障害になる
        let mut finished = BatchJob::new(
            "finished".into(),
            "m".into(),
            vec!["x.wav".into()],
            JobOptions::new(),
            Utc::now(),
        );
        finished.status = JobStatus::Done;
        store.create(&finished).unwrap();
        let ok_files = create(&store, "ok", &["y.wav"]);

        pool.submit(
            "finished".into(),
            vec![AudioFile::new("x.wav", vec![1])],
            "m".into(),
            JobOptions::new(),
        );
        pool.submit("ok".into(), ok_files, "m".into(), JobOptions::new());
        let outcomes: HashMap<String, JobOutcome> = pool.wait_all().await.into_iter().collect();

        assert!(matches!(outcomes["finished"], JobOutcome::Failed { .. }));
        assert_eq!(outcomes["ok"], JobOutcome::Done { files: 1 });
        assert_eq!(store.get("ok").unwrap().unwrap().status, JobStatus::Done);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_shutdown_cancels_everything() {
        let (store, pool) = setup(Arc::new(StubEngine::new(Duration::from_millis(100))), 1);
        for id in ["j1", "j2"] {
            let files = create(&store, id, &["a.wav", "b.wav", "c.wav"]);
            pool.submit(id.into(), files, "m".into(), JobOptions::new());
        }

        let outcomes = pool.shutdown().await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|(_, o)| *o == JobOutcome::Cancelled));
        for id in ["j1", "j2"] {
            let job = store.get(id).unwrap().unwrap();
            assert_eq!(job.status, JobStatus::Failed);
            assert_eq!(job.error.as_deref(), Some(CANCELLED_ERROR));
        }
        assert!(!pool.is_active("j1"));
    }
}
