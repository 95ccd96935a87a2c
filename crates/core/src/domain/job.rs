use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::error::AppError;
use super::transcribe::{Segment, Transcription};

/// ジョブオプション（不透明な key/value。文字起こしエンジンへ転送される）
pub type JobOptions = serde_json::Map<String, serde_json::Value>;

/// ジョブ状態
///
/// 遷移は queued → running → {done, failed} の前進のみ。終端状態からは動かない。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Done => "done",
            Self::Failed => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Queued => 0,
            Self::Running => 1,
            Self::Done | Self::Failed => 2,
        }
    }

    /// `self` から `next` への遷移が許されるか。
    /// 非終端の同一状態は no-op として許可する。
    pub fn can_advance_to(&self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        *self == next || next.rank() > self.rank()
    }
}

impl std::str::FromStr for JobStatus {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "done" => Ok(Self::Done),
            "failed" => Ok(Self::Failed),
            other => Err(AppError::invalid_input(format!("unknown job status: {other}"))),
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 投入された音声ファイル（ファイル名 + 生バイト列）
#[derive(Debug, Clone)]
pub struct AudioFile {
    pub filename: String,
    pub data: Vec<u8>,
}

impl AudioFile {
    pub fn new(filename: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            filename: filename.into(),
            data,
        }
    }
}

// ─── FileResult ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Done,
    Failed,
}

/// 1ファイル分の処理結果。`status` タグで成功/失敗を区別する。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum FileOutcome {
    Done {
        text: String,
        language: String,
        duration: f64,
        model: String,
        segments: Vec<Segment>,
    },
    Failed {
        error: String,
    },
}

/// ファイル単位の結果。処理時間は成否にかかわらず計測される。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileResult {
    pub filename: String,
    #[serde(flatten)]
    pub outcome: FileOutcome,
    pub processing_time_ms: u64,
}

impl FileResult {
    pub fn done(
        filename: impl Into<String>,
        transcription: Transcription,
        model: impl Into<String>,
        processing_time_ms: u64,
    ) -> Self {
        Self {
            filename: filename.into(),
            outcome: FileOutcome::Done {
                text: transcription.text,
                language: transcription.language,
                duration: transcription.duration,
                model: model.into(),
                segments: transcription.segments,
            },
            processing_time_ms,
        }
    }

    pub fn failed(
        filename: impl Into<String>,
        error: impl Into<String>,
        processing_time_ms: u64,
    ) -> Self {
        Self {
            filename: filename.into(),
            outcome: FileOutcome::Failed {
                error: error.into(),
            },
            processing_time_ms,
        }
    }

    pub fn status(&self) -> FileStatus {
        match self.outcome {
            FileOutcome::Done { .. } => FileStatus::Done,
            FileOutcome::Failed { .. } => FileStatus::Failed,
        }
    }

    pub fn is_done(&self) -> bool {
        self.status() == FileStatus::Done
    }

    pub fn text(&self) -> Option<&str> {
        match &self.outcome {
            FileOutcome::Done { text, .. } => Some(text),
            FileOutcome::Failed { .. } => None,
        }
    }

    pub fn error(&self) -> Option<&str> {
        match &self.outcome {
            FileOutcome::Done { .. } => None,
            FileOutcome::Failed { error } => Some(error),
        }
    }
}

// ─── BatchJob ────────────────────────────────────────────────────

/// バッチ文字起こしジョブ
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchJob {
    pub job_id: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub model: String,
    pub files: Vec<String>,
    pub options: JobOptions,
    pub results: Vec<FileResult>,
    pub error: Option<String>,
}

impl BatchJob {
    /// queued 状態の新規ジョブ
    pub fn new(
        job_id: String,
        model: String,
        files: Vec<String>,
        options: JobOptions,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            job_id,
            status: JobStatus::Queued,
            created_at: now,
            started_at: None,
            finished_at: None,
            model,
            files,
            options,
            results: Vec::new(),
            error: None,
        }
    }

    /// 結果 blob を含まないサマリー
    pub fn summary(&self) -> JobSummary {
        JobSummary {
            job_id: self.job_id.clone(),
            status: self.status,
            created_at: self.created_at,
            started_at: self.started_at,
            finished_at: self.finished_at,
            model: self.model.clone(),
            file_count: self.files.len(),
            error: self.error.clone(),
        }
    }

    pub fn into_detail(self) -> JobDetail {
        JobDetail {
            summary: self.summary(),
            files: self.files,
            options: self.options,
            results: self.results,
        }
    }
}

/// ジョブ一覧用サマリー
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobSummary {
    pub job_id: String,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub model: String,
    pub file_count: usize,
    pub error: Option<String>,
}

/// ジョブ詳細（ファイル・オプション・結果付き）
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobDetail {
    #[serde(flatten)]
    pub summary: JobSummary,
    pub files: Vec<String>,
    pub options: JobOptions,
    pub results: Vec<FileResult>,
}

// ─── JobUpdate ───────────────────────────────────────────────────

/// 部分更新。`Some` のフィールドだけが書き換えられる。
#[derive(Debug, Clone, Default)]
pub struct JobUpdate {
    pub status: Option<JobStatus>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub results: Option<Vec<FileResult>>,
    pub error: Option<String>,
}

impl JobUpdate {
    pub fn running(now: DateTime<Utc>) -> Self {
        Self {
            status: Some(JobStatus::Running),
            started_at: Some(now),
            ..Default::default()
        }
    }

    pub fn progress(results: Vec<FileResult>) -> Self {
        Self {
            results: Some(results),
            ..Default::default()
        }
    }

    pub fn done(now: DateTime<Utc>, results: Vec<FileResult>) -> Self {
        Self {
            status: Some(JobStatus::Done),
            finished_at: Some(now),
            results: Some(results),
            ..Default::default()
        }
    }

    pub fn failed(now: DateTime<Utc>, error: impl Into<String>) -> Self {
        Self {
            status: Some(JobStatus::Failed),
            finished_at: Some(now),
            error: Some(error.into()),
            ..Default::default()
        }
    }

    /// ジョブへ適用する。不正な更新は拒否し、ジョブは変更しない。
    ///
    /// - status は前進のみ（終端からは動かない）
    /// - started_at は queued → running の更新でのみ設定できる
    /// - finished_at は終端状態を設定する更新でのみ設定できる
    /// - results は短くできない
    pub fn apply_to(self, job: &mut BatchJob) -> Result<(), AppError> {
        self.check(job)?;

        if let Some(next) = self.status {
            job.status = next;
        }
        if let Some(started_at) = self.started_at {
            job.started_at = Some(started_at);
        }
        if let Some(finished_at) = self.finished_at {
            job.finished_at = Some(finished_at);
        }
        if let Some(results) = self.results {
            job.results = results;
        }
        if let Some(error) = self.error {
            job.error = Some(error);
        }
        Ok(())
    }

    fn check(&self, job: &BatchJob) -> Result<(), AppError> {
        if let Some(next) = self.status {
            if !job.status.can_advance_to(next) {
                return Err(AppError::invalid_state(format!(
                    "job {}: {} -> {} is not a forward transition",
                    job.job_id, job.status, next
                )));
            }
        }
        if self.started_at.is_some()
            && !(job.status == JobStatus::Queued && self.status == Some(JobStatus::Running))
        {
            return Err(AppError::invalid_state(format!(
                "job {}: started_at can only be set when leaving queued for running",
                job.job_id
            )));
        }
        if self.finished_at.is_some() && !self.status.is_some_and(|s| s.is_terminal()) {
            return Err(AppError::invalid_state(format!(
                "job {}: finished_at requires a terminal status",
                job.job_id
            )));
        }
        if let Some(results) = &self.results {
            if results.len() < job.results.len() {
                return Err(AppError::invalid_state(format!(
                    "job {}: results cannot shrink ({} -> {})",
                    job.job_id,
                    job.results.len(),
                    results.len()
                )));
            }
        }
        Ok(())
    }
}
