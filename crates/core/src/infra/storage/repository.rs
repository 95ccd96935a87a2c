use std::path::Path;

use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, TransactionBehavior};
use serde::{Deserialize, Serialize};

use crate::domain::error::AppError;
use crate::domain::job::{BatchJob, FileResult, JobOptions, JobStatus, JobUpdate};

const SELECT_COLUMNS: &str =
    "SELECT job_id, status, created_at, started_at, finished_at, payload FROM batch_jobs";

/// SQLite ジョブストア（batch_jobs）
///
/// 単一コネクションを1つのロックで保護し、全操作を直列化する。
/// ライフサイクル列 (status / created_at / started_at / finished_at) は索引付きの列、
/// それ以外は payload 列の JSON blob に格納する。
pub struct JobStore {
    conn: Mutex<Connection>,
}

/// payload 列 (書き込み用)
#[derive(Serialize)]
struct PayloadRef<'a> {
    model: &'a str,
    files: &'a [String],
    options: &'a JobOptions,
    results: &'a [FileResult],
    error: Option<&'a str>,
}

/// payload 列 (読み込み用)
#[derive(Deserialize)]
struct Payload {
    #[serde(default)]
    model: String,
    #[serde(default)]
    files: Vec<String>,
    #[serde(default)]
    options: JobOptions,
    #[serde(default)]
    results: Vec<FileResult>,
    #[serde(default)]
    error: Option<String>,
}

impl JobStore {
    /// 新規接続（ファイルパス指定）。親ディレクトリが無ければ作成する。
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AppError> {
        let path = path.as_ref();
        if let Some(dir) = path.parent().filter(|d| !d.as_os_str().is_empty()) {
            std::fs::create_dir_all(dir)
                .map_err(|e| AppError::storage(format!("DBディレクトリ作成に失敗: {e}")))?;
        }
        let conn = Connection::open(path)
            .map_err(|e| AppError::storage(format!("DB接続に失敗: {e}")))?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })
        .map_err(|e| AppError::storage(format!("journal_mode 設定に失敗: {e}")))?;
        log::debug!("Opened job store at {}", path.display());
        Self::init(conn)
    }

    /// in-memory DB（テスト用）
    pub fn open_in_memory() -> Result<Self, AppError> {
        let conn = Connection::open_in_memory()
            .map_err(|e| AppError::storage(format!("in-memory DB作成に失敗: {e}")))?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> Result<Self, AppError> {
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// スキーママイグレーション
    fn migrate(conn: &Connection) -> Result<(), AppError> {
        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS batch_jobs (
                job_id      TEXT PRIMARY KEY,
                status      TEXT NOT NULL DEFAULT 'queued',
                created_at  TEXT NOT NULL,
                started_at  TEXT,
                finished_at TEXT,
                payload     TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_batch_jobs_created
                ON batch_jobs(created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_batch_jobs_status
                ON batch_jobs(status, created_at DESC);
            CREATE INDEX IF NOT EXISTS idx_batch_jobs_started
                ON batch_jobs(started_at);
            CREATE INDEX IF NOT EXISTS idx_batch_jobs_finished
                ON batch_jobs(finished_at);
            ",
        )
        .map_err(|e| AppError::storage(format!("マイグレーション失敗: {e}")))?;
        Ok(())
    }

    // --- Jobs ---

    /// ジョブを挿入する。job_id が既存なら Duplicate。
    pub fn create(&self, job: &BatchJob) -> Result<(), AppError> {
        let payload = encode_payload(job)?;
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO batch_jobs (job_id, status, created_at, started_at, finished_at, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                job.job_id,
                job.status.as_str(),
                format_ts(&job.created_at),
                job.started_at.as_ref().map(format_ts),
                job.finished_at.as_ref().map(format_ts),
                payload,
            ],
        )
        .map_err(|e| match e {
            rusqlite::Error::SqliteFailure(err, _)
                if err.code == rusqlite::ErrorCode::ConstraintViolation =>
            {
                AppError::duplicate(format!("job_id が重複しています: {}", job.job_id))
            }
            other => AppError::storage(format!("ジョブ挿入失敗: {other}")),
        })?;
        Ok(())
    }

    pub fn get(&self, job_id: &str) -> Result<Option<BatchJob>, AppError> {
        let conn = self.conn.lock();
        select_job(&conn, job_id)
    }

    /// 指定フィールドだけを read-modify-write で更新する。
    ///
    /// 存在しなければ `Ok(false)`。読み込みから書き込みまで1トランザクションで行い、
    /// 状態遷移が前進でなければ `E_INVALID_STATE` でロールバックする。
    pub fn update(&self, job_id: &str, update: JobUpdate) -> Result<bool, AppError> {
        let mut conn = self.conn.lock();
        let tx = conn
            .transaction_with_behavior(TransactionBehavior::Immediate)
            .map_err(|e| AppError::storage(format!("トランザクション開始失敗: {e}")))?;

        let Some(mut job) = select_job(&tx, job_id)? else {
            return Ok(false);
        };
        update.apply_to(&mut job)?;

        let payload = encode_payload(&job)?;
        tx.execute(
            "UPDATE batch_jobs
             SET status = ?1, started_at = ?2, finished_at = ?3, payload = ?4
             WHERE job_id = ?5",
            params![
                job.status.as_str(),
                job.started_at.as_ref().map(format_ts),
                job.finished_at.as_ref().map(format_ts),
                payload,
                job_id,
            ],
        )
        .map_err(|e| AppError::storage(format!("ジョブ更新失敗: {e}")))?;
        tx.commit()
            .map_err(|e| AppError::storage(format!("コミット失敗: {e}")))?;
        Ok(true)
    }

    /// 作成日時の降順で最大 `limit` 件。`status` 指定時はその状態のみ。
    pub fn list(&self, limit: u32, status: Option<JobStatus>) -> Result<Vec<BatchJob>, AppError> {
        let conn = self.conn.lock();
        let mut stmt;
        let jobs: Vec<BatchJob>;

        if let Some(status) = status {
            stmt = conn
                .prepare(&format!(
                    "{SELECT_COLUMNS} WHERE status = ?1 ORDER BY created_at DESC, rowid DESC LIMIT ?2"
                ))
                .map_err(|e| AppError::storage(format!("クエリ準備失敗: {e}")))?;
            jobs = stmt
                .query_map(params![status.as_str(), limit], map_job_row)
                .map_err(|e| AppError::storage(format!("クエリ実行失敗: {e}")))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| AppError::storage(format!("行読み取り失敗: {e}")))?;
        } else {
            stmt = conn
                .prepare(&format!(
                    "{SELECT_COLUMNS} ORDER BY created_at DESC, rowid DESC LIMIT ?1"
                ))
                .map_err(|e| AppError::storage(format!("クエリ準備失敗: {e}")))?;
            jobs = stmt
                .query_map(params![limit], map_job_row)
                .map_err(|e| AppError::storage(format!("クエリ実行失敗: {e}")))?
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| AppError::storage(format!("行読み取り失敗: {e}")))?;
        }

        Ok(jobs)
    }

    pub fn count(&self, status: Option<JobStatus>) -> Result<u64, AppError> {
        let conn = self.conn.lock();
        let count: i64 = match status {
            Some(status) => conn.query_row(
                "SELECT COUNT(*) FROM batch_jobs WHERE status = ?1",
                params![status.as_str()],
                |row| row.get(0),
            ),
            None => conn.query_row("SELECT COUNT(*) FROM batch_jobs", [], |row| row.get(0)),
        }
        .map_err(|e| AppError::storage(format!("件数取得失敗: {e}")))?;
        Ok(count.max(0) as u64)
    }

    pub fn delete(&self, job_id: &str) -> Result<bool, AppError> {
        let conn = self.conn.lock();
        let affected = conn
            .execute("DELETE FROM batch_jobs WHERE job_id = ?1", params![job_id])
            .map_err(|e| AppError::storage(format!("ジョブ削除失敗: {e}")))?;
        Ok(affected > 0)
    }
}

fn select_job(conn: &Connection, job_id: &str) -> Result<Option<BatchJob>, AppError> {
    conn.query_row(
        &format!("{SELECT_COLUMNS} WHERE job_id = ?1"),
        params![job_id],
        map_job_row,
    )
    .optional()
    .map_err(|e| AppError::storage(format!("ジョブ取得失敗: {e}")))
}

fn map_job_row(row: &rusqlite::Row) -> rusqlite::Result<BatchJob> {
    let status_str: String = row.get(1)?;
    let status = status_str
        .parse::<JobStatus>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(1, Type::Text, Box::new(e)))?;
    let payload_str: String = row.get(5)?;
    let payload: Payload = serde_json::from_str(&payload_str)
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(5, Type::Text, Box::new(e)))?;

    Ok(BatchJob {
        job_id: row.get(0)?,
        status,
        created_at: parse_ts(2, row.get(2)?)?,
        started_at: row
            .get::<_, Option<String>>(3)?
            .map(|s| parse_ts(3, s))
            .transpose()?,
        finished_at: row
            .get::<_, Option<String>>(4)?
            .map(|s| parse_ts(4, s))
            .transpose()?,
        model: payload.model,
        files: payload.files,
        options: payload.options,
        results: payload.results,
        error: payload.error,
    })
}

fn encode_payload(job: &BatchJob) -> Result<String, AppError> {
    serde_json::to_string(&PayloadRef {
        model: &job.model,
        files: &job.files,
        options: &job.options,
        results: &job.results,
        error: job.error.as_deref(),
    })
    .map_err(|e| AppError::internal(format!("payload serialize: {e}")))
}

/// 固定幅 RFC3339 (ナノ秒, Z)。文字列順 = 時刻順。
fn format_ts(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_ts(idx: usize, s: String) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(&s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}
