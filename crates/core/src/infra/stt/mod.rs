mod noop;
pub mod whisper;

pub use noop::NoopTranscriber;

use std::sync::Arc;

use crate::domain::settings::BatchSettings;
use crate::domain::transcribe::Transcriber;
use whisper::{WhisperConfig, WhisperSidecar};

/// 文字起こしエンジンを構築する（whisper 設定があり検証に通れば whisper.cpp, 他: Noop）
pub fn create_transcriber(settings: &BatchSettings) -> Arc<dyn Transcriber> {
    if let Some(whisper) = &settings.whisper {
        let engine = WhisperSidecar::new(WhisperConfig::from(whisper));
        match engine.validate() {
            Ok(()) => {
                log::info!("whisper.cpp transcriber selected ({:?})", whisper.model_path);
                return Arc::new(engine);
            }
            Err(e) => log::warn!("whisper.cpp not available, falling back to noop: {e}"),
        }
    }

    log::info!("Using noop transcriber");
    Arc::new(NoopTranscriber)
}
