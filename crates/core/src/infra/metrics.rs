use parking_lot::Mutex;
use serde::Serialize;

/// 最新N件のみ保持する
const LATENCY_CAPACITY: usize = 1000;

/// ローカルメトリクス収集器
pub struct Metrics {
    counters: Mutex<MetricsCounters>,
    latencies: Mutex<Vec<LatencyRecord>>,
}

#[derive(Debug, Default)]
struct MetricsCounters {
    jobs_submitted: u64,
    jobs_done: u64,
    jobs_failed: u64,
    jobs_cancelled: u64,
    files_done: u64,
    files_failed: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct LatencyRecord {
    pub filename: String,
    pub duration_ms: u64,
    pub timestamp: String,
}

/// メトリクスサマリー（サービス層に返す用）
#[derive(Debug, Clone, Serialize)]
pub struct MetricsSummary {
    pub jobs_submitted: u64,
    pub jobs_done: u64,
    pub jobs_failed: u64,
    pub jobs_cancelled: u64,
    pub files_done: u64,
    pub files_failed: u64,
    pub avg_file_latency_ms: Option<f64>,
    pub recent_latencies: Vec<LatencyRecord>,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            counters: Mutex::new(MetricsCounters::default()),
            latencies: Mutex::new(Vec::new()),
        }
    }

    pub fn inc_jobs_submitted(&self) {
        self.counters.lock().jobs_submitted += 1;
    }

    pub fn inc_jobs_done(&self) {
        self.counters.lock().jobs_done += 1;
    }

    pub fn inc_jobs_failed(&self) {
        self.counters.lock().jobs_failed += 1;
    }

    pub fn inc_jobs_cancelled(&self) {
        self.counters.lock().jobs_cancelled += 1;
    }

    /// ファイル1件の結果と処理時間を記録する
    pub fn record_file(&self, filename: &str, ok: bool, duration_ms: u64) {
        {
            let mut c = self.counters.lock();
            if ok {
                c.files_done += 1;
            } else {
                c.files_failed += 1;
            }
        }

        let record = LatencyRecord {
            filename: filename.to_string(),
            duration_ms,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };
        let mut latencies = self.latencies.lock();
        latencies.push(record);
        if latencies.len() > LATENCY_CAPACITY {
            let excess = latencies.len() - LATENCY_CAPACITY;
            latencies.drain(0..excess);
        }
    }

    pub fn summary(&self) -> MetricsSummary {
        let c = self.counters.lock();
        let latencies = self.latencies.lock();

        let avg_file_latency_ms = if latencies.is_empty() {
            None
        } else {
            Some(
                latencies.iter().map(|r| r.duration_ms as f64).sum::<f64>()
                    / latencies.len() as f64,
            )
        };

        let recent: Vec<LatencyRecord> = latencies.iter().rev().take(20).cloned().collect();

        MetricsSummary {
            jobs_submitted: c.jobs_submitted,
            jobs_done: c.jobs_done,
            jobs_failed: c.jobs_failed,
            jobs_cancelled: c.jobs_cancelled,
            files_done: c.files_done,
            files_failed: c.files_failed,
            avg_file_latency_ms,
            recent_latencies: recent,
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
