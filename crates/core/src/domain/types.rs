use serde::{Deserialize, Serialize};

use super::job::{FileResult, JobStatus, JobSummary};

/// ジョブ投入の受領応答
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitReceipt {
    pub job_id: String,
    pub status: JobStatus,
    pub file_count: usize,
}

/// ジョブ一覧ページ
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobList {
    pub jobs: Vec<JobSummary>,
    /// フィルタに一致する総件数（limit 適用前）
    pub total: u64,
}

/// 結果取得の応答。done 以外は NotReady。
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum JobResult {
    Ready {
        job_id: String,
        results: Vec<FileResult>,
    },
    NotReady {
        job_id: String,
        status: JobStatus,
        /// 再試行までの推奨待機秒数
        retry_after: u64,
    },
}
