use crate::domain::transcribe::{
    TranscribeError, TranscribeOptions, Transcriber, Transcription,
};

/// NoopTranscriber: 固定文字列を返すモック実装。
/// 実エンジンが未設定の環境でのフォールバック。
pub struct NoopTranscriber;

impl Transcriber for NoopTranscriber {
    fn transcribe(
        &self,
        _audio: &[u8],
        _model: &str,
        options: &TranscribeOptions,
    ) -> Result<Transcription, TranscribeError> {
        Ok(Transcription {
            text: "[STT stub] no transcription engine configured".to_string(),
            language: options.language.clone().unwrap_or_default(),
            duration: 0.0,
            segments: Vec::new(),
        })
    }

    fn name(&self) -> &str {
        "noop"
    }
}
