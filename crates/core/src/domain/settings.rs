use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// バッチ処理設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchSettings {
    /// ジョブDBのパス
    pub db_path: PathBuf,
    /// 同時実行ジョブ数の上限
    pub max_concurrent: usize,
    /// model 未指定時のモデルID
    pub default_model: String,
    /// 1ジョブあたりの最大ファイル数
    pub max_files_per_job: usize,
    /// 結果未完了時に返す retry-after (秒)
    pub result_retry_after_secs: u64,
    /// 一覧取得のデフォルト件数
    pub default_list_limit: u32,
    /// whisper.cpp sidecar 設定（None = 未設定）
    pub whisper: Option<WhisperSettings>,
}

/// whisper.cpp sidecar 設定
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhisperSettings {
    pub binary_path: PathBuf,
    pub model_path: PathBuf,
}

impl Default for BatchSettings {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            max_concurrent: 2,
            default_model: "deepdml/faster-whisper-large-v3-turbo-ct2".to_string(),
            max_files_per_job: 20,
            result_retry_after_secs: 5,
            default_list_limit: 50,
            whisper: None,
        }
    }
}

impl BatchSettings {
    /// 環境変数でデフォルト値を上書きする
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut settings = Self::default();

        if let Some(path) = lookup("OS_BATCH_DB_PATH") {
            settings.db_path = PathBuf::from(path);
        }
        if let Some(raw) = lookup("OS_BATCH_WORKERS") {
            match raw.trim().parse::<usize>() {
                Ok(n) if n > 0 => settings.max_concurrent = n,
                _ => log::warn!(
                    "OS_BATCH_WORKERS={raw:?} is not a positive integer, using {}",
                    settings.max_concurrent
                ),
            }
        }
        if let Some(model) = lookup("STT_DEFAULT_MODEL").filter(|m| !m.is_empty()) {
            settings.default_model = model;
        }
        if let Some(model_path) = lookup("WHISPER_MODEL") {
            settings.whisper = Some(WhisperSettings {
                binary_path: lookup("WHISPER_BIN")
                    .map(PathBuf::from)
                    .unwrap_or_else(|| PathBuf::from("whisper-cli")),
                model_path: PathBuf::from(model_path),
            });
        }

        settings
    }
}

/// データディレクトリ配下のデフォルトDBパス
fn default_db_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("batchscribe")
        .join("batch_jobs.db")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults() {
        let s = BatchSettings::default();
        assert_eq!(s.max_concurrent, 2);
        assert_eq!(s.max_files_per_job, 20);
        assert_eq!(s.result_retry_after_secs, 5);
        assert!(s.db_path.ends_with("batch_jobs.db"));
        assert!(s.whisper.is_none());
    }

    #[test]
    fn env_overrides() {
        let s = BatchSettings::from_lookup(lookup(&[
            ("OS_BATCH_WORKERS", "4"),
            ("OS_BATCH_DB_PATH", "/tmp/jobs.db"),
            ("STT_DEFAULT_MODEL", "tiny"),
            ("WHISPER_MODEL", "/models/ggml-base.bin"),
        ]));
        assert_eq!(s.max_concurrent, 4);
        assert_eq!(s.db_path, PathBuf::from("/tmp/jobs.db"));
        assert_eq!(s.default_model, "tiny");
        let whisper = s.whisper.unwrap();
        assert_eq!(whisper.binary_path, PathBuf::from("whisper-cli"));
        assert_eq!(whisper.model_path, PathBuf::from("/models/ggml-base.bin"));
    }

    #[test]
    fn invalid_worker_count_falls_back() {
        let s = BatchSettings::from_lookup(lookup(&[("OS_BATCH_WORKERS", "zero")]));
        assert_eq!(s.max_concurrent, 2);
        let s = BatchSettings::from_lookup(lookup(&[("OS_BATCH_WORKERS", "0")]));
        assert_eq!(s.max_concurrent, 2);
    }
}
