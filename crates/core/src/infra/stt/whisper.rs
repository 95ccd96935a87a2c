use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use crate::domain::settings::WhisperSettings;
use crate::domain::transcribe::{
    Segment, TranscribeError, TranscribeOptions, Transcriber, Transcription,
};

/// Whisper.cpp sidecar の設定。
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct WhisperConfig {
    /// whisper-cli バイナリのパス
    pub binary_path: PathBuf,
    /// GGML モデルファイルのパス (model ID がファイルでない場合に使用)
    pub model_path: PathBuf,
    /// デフォルト言語 (例: "ja", "en", "auto")
    pub language: String,
    /// サンプリング温度 (0.0 = greedy)
    pub temperature: f32,
    /// ビームサーチサイズ (1 = greedy)
    pub beam_size: u32,
    /// 使用スレッド数
    pub threads: u32,
}

impl Default for WhisperConfig {
    fn default() -> Self {
        Self {
            binary_path: PathBuf::from("whisper-cli"),
            model_path: PathBuf::from("models/ggml-base.bin"),
            language: "auto".into(),
            temperature: 0.0,
            beam_size: 1,
            threads: 4,
        }
    }
}

impl From<&WhisperSettings> for WhisperConfig {
    fn from(settings: &WhisperSettings) -> Self {
        Self {
            binary_path: settings.binary_path.clone(),
            model_path: settings.model_path.clone(),
            ..Default::default()
        }
    }
}

/// Whisper.cpp sidecar。
///
/// 音声バイト列を一時WAVファイルへ書き出し、`whisper-cli --output-json` を同期実行する。
/// 呼び出しはブロッキングなので、非同期側からはブロッキングスレッドで呼ぶこと。
pub struct WhisperSidecar {
    config: WhisperConfig,
}

impl WhisperSidecar {
    pub fn new(config: WhisperConfig) -> Self {
        Self { config }
    }

    /// whisper バイナリとモデルの存在を検証する。
    pub fn validate(&self) -> Result<(), TranscribeError> {
        let config = &self.config;
        if !config.binary_path.exists() && which_binary(&config.binary_path).is_none() {
            return Err(TranscribeError::EngineNotAvailable(format!(
                "Whisper binary not found: {:?}",
                config.binary_path
            )));
        }
        if !config.model_path.exists() {
            return Err(TranscribeError::EngineNotAvailable(format!(
                "Whisper model not found: {:?}",
                config.model_path
            )));
        }
        Ok(())
    }

    /// model ID が既存ファイルならそれを、そうでなければ設定のモデルを使う。
    fn resolve_model(config: &WhisperConfig, model: &str) -> PathBuf {
        let candidate = Path::new(model);
        if !model.is_empty() && candidate.is_file() {
            candidate.to_path_buf()
        } else {
            config.model_path.clone()
        }
    }

    /// whisper-cli 用のコマンドライン引数を構築する。
    fn build_args(
        config: &WhisperConfig,
        model_path: &Path,
        wav_path: &Path,
        output_base: &Path,
        options: &TranscribeOptions,
    ) -> Vec<String> {
        let language = options.language.as_deref().unwrap_or(&config.language);
        let temperature = options.temperature.unwrap_or(config.temperature);
        vec![
            "--model".into(),
            model_path.to_string_lossy().into(),
            "--language".into(),
            language.into(),
            "--threads".into(),
            config.threads.to_string(),
            "--temperature".into(),
            temperature.to_string(),
            "--beam-size".into(),
            config.beam_size.to_string(),
            "--no-prints".into(),
            "--output-json".into(),
            "--output-file".into(),
            output_base.to_string_lossy().into(),
            "--file".into(),
            wav_path.to_string_lossy().into(),
        ]
    }
}

// ─── Whisper JSON デシリアライゼーション ──────────────────────────

/// whisper-cli --output-json の出力フォーマット。
#[derive(Debug, serde::Deserialize)]
struct WhisperJsonOutput {
    #[serde(default)]
    result: Option<WhisperJsonResult>,
    transcription: Vec<WhisperJsonSegment>,
}

#[derive(Debug, serde::Deserialize)]
struct WhisperJsonResult {
    #[serde(default)]
    language: String,
}

#[derive(Debug, serde::Deserialize)]
struct WhisperJsonSegment {
    offsets: WhisperOffsets,
    text: String,
}

#[derive(Debug, serde::Deserialize)]
struct WhisperOffsets {
    from: u32,
    to: u32,
}

/// whisper JSON 出力をパースする。
fn parse_whisper_output(output: &str) -> Result<Transcription, TranscribeError> {
    let json_str = output.trim();

    if json_str.is_empty() {
        return Ok(Transcription {
            text: String::new(),
            language: String::new(),
            duration: 0.0,
            segments: Vec::new(),
        });
    }

    let parsed: WhisperJsonOutput = serde_json::from_str(json_str).map_err(|e| {
        TranscribeError::TranscriptionFailed(format!(
            "Failed to parse whisper JSON: {}. Raw: {}",
            e,
            json_str.chars().take(500).collect::<String>()
        ))
    })?;

    let segments: Vec<Segment> = parsed
        .transcription
        .iter()
        .map(|seg| Segment {
            start: f64::from(seg.offsets.from) / 1000.0,
            end: f64::from(seg.offsets.to) / 1000.0,
            text: seg.text.trim().to_string(),
        })
        .collect();

    let text = segments
        .iter()
        .map(|seg| seg.text.as_str())
        .filter(|t| !t.is_empty())
        .collect::<Vec<&str>>()
        .join(" ");

    Ok(Transcription {
        text,
        language: parsed.result.map(|r| r.language).unwrap_or_default(),
        duration: segments.last().map(|seg| seg.end).unwrap_or(0.0),
        segments,
    })
}

/// PATH 上でバイナリを検索する簡易ヘルパー。
fn which_binary(name: &Path) -> Option<PathBuf> {
    let name_str = name.to_string_lossy();
    if name_str.contains('/') || name_str.contains('\\') {
        return if name.exists() { Some(name.to_path_buf()) } else { None };
    }
    let path_var = std::env::var_os("PATH")?;
    std::env::split_paths(&path_var)
        .map(|dir| dir.join(name))
        .find(|full_path| full_path.exists())
}

// ─── Transcriber 実装 ───────────────────────────────────────────

impl Transcriber for WhisperSidecar {
    fn transcribe(
        &self,
        audio: &[u8],
        model: &str,
        options: &TranscribeOptions,
    ) -> Result<Transcription, TranscribeError> {
        if audio.is_empty() {
            return Err(TranscribeError::AudioFormat("empty audio payload".into()));
        }

        let config = &self.config;
        let model_path = Self::resolve_model(config, model);

        let workdir = tempfile::Builder::new().prefix("batchscribe-").tempdir()?;
        let wav_path = workdir.path().join("input.wav");
        std::fs::write(&wav_path, audio)?;
        let output_base = workdir.path().join("output");

        let args = Self::build_args(config, &model_path, &wav_path, &output_base, options);
        log::debug!("Running whisper: {:?} {:?}", config.binary_path, args);

        let output = Command::new(&config.binary_path)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => TranscribeError::EngineNotAvailable(format!(
                    "Whisper binary not found: {:?}",
                    config.binary_path
                )),
                _ => TranscribeError::TranscriptionFailed(format!(
                    "Failed to spawn whisper process: {e}"
                )),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TranscribeError::TranscriptionFailed(format!(
                "Whisper exited with status {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let json = std::fs::read_to_string(output_base.with_extension("json"))?;
        parse_whisper_output(&json)
    }

    fn name(&self) -> &str {
        "whisper.cpp"
    }
}

// ─── テスト ─────────────────────────────────────────────────────
