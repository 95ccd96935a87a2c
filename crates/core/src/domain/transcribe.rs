use serde::{Deserialize, Serialize};

use super::job::JobOptions;

// ─── Transcription ───────────────────────────────────────────────

/// セグメント単位のタイミング情報（秒）。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Segment {
    pub start: f64,
    pub end: f64,
    pub text: String,
}

/// 文字起こし結果。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transcription {
    /// 全文テキスト
    pub text: String,
    /// 検出言語。エンジンが返さない場合は空文字列。
    #[serde(default)]
    pub language: String,
    /// 音声長 (秒)
    #[serde(default)]
    pub duration: f64,
    #[serde(default)]
    pub segments: Vec<Segment>,
}

// ─── TranscribeOptions ───────────────────────────────────────────

/// エンジンへ転送するオプション。ジョブオプションに存在するものだけが入る。
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TranscribeOptions {
    pub language: Option<String>,
    pub response_format: Option<String>,
    pub temperature: Option<f32>,
}

impl TranscribeOptions {
    /// ジョブオプションから転送対象を抽出する。
    /// 空文字列の language / response_format は未指定として扱う。
    pub fn from_job_options(options: &JobOptions) -> Self {
        let non_empty = |key: &str| {
            options
                .get(key)
                .and_then(|v| v.as_str())
                .filter(|s| !s.is_empty())
                .map(str::to_string)
        };
        Self {
            language: non_empty("language"),
            response_format: non_empty("response_format"),
            temperature: options
                .get("temperature")
                .and_then(|v| v.as_f64())
                .map(|t| t as f32),
        }
    }
}

// ─── TranscribeError ─────────────────────────────────────────────

/// 文字起こしエンジンのエラー
#[derive(Debug, thiserror::Error)]
pub enum TranscribeError {
    #[error("Audio format error: {0}")]
    AudioFormat(String),
    #[error("Engine not available: {0}")]
    EngineNotAvailable(String),
    #[error("Transcription failed: {0}")]
    TranscriptionFailed(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

// ─── Transcriber trait ───────────────────────────────────────────

/// 文字起こしエンジン（外部能力）の境界。
///
/// 実装はブロッキングしてよい。呼び出し側 (`FilePipeline`) が
/// ブロッキングスレッドへ退避させる。
pub trait Transcriber: Send + Sync {
    fn transcribe(
        &self,
        audio: &[u8],
        model: &str,
        options: &TranscribeOptions,
    ) -> Result<Transcription, TranscribeError>;

    /// エンジン名 (例: "whisper.cpp", "noop")。
    fn name(&self) -> &str;
}
