use std::any::Any;
use std::sync::Arc;
use std::time::Instant;

use crate::domain::job::{AudioFile, FileResult};
use crate::domain::transcribe::{TranscribeOptions, Transcriber};

/// ファイル単位の文字起こしパイプライン。
///
/// 1ファイルを文字起こしし、成否にかかわらず `FileResult` を返す。
/// エンジン呼び出しはブロッキングスレッドへ退避させ、他ジョブの進行を妨げない。
/// エンジンのエラーやパニックはここで失敗結果に変換され、ジョブには伝播しない。
pub struct FilePipeline {
    transcriber: Arc<dyn Transcriber>,
}

impl FilePipeline {
    pub fn new(transcriber: Arc<dyn Transcriber>) -> Self {
        Self { transcriber }
    }

    pub fn engine_name(&self) -> &str {
        self.transcriber.name()
    }

    pub async fn run(
        &self,
        file: AudioFile,
        model: &str,
        options: &TranscribeOptions,
    ) -> FileResult {
        let start = Instant::now();
        let AudioFile { filename, data } = file;

        let transcriber = Arc::clone(&self.transcriber);
        let call_model = model.to_string();
        let call_options = options.clone();
        let joined = tokio::task::spawn_blocking(move || {
            transcriber.transcribe(&data, &call_model, &call_options)
        })
        .await;

        let elapsed_ms = u64::try_from(start.elapsed().as_millis()).unwrap_or(u64::MAX);

        match joined {
            Ok(Ok(transcription)) => {
                log::debug!("Batch file {filename} transcribed in {elapsed_ms}ms");
                FileResult::done(filename, transcription, model, elapsed_ms)
            }
            Ok(Err(e)) => {
                log::warn!("Batch file {filename} failed: {e}");
                FileResult::failed(filename, e.to_string(), elapsed_ms)
            }
            Err(join_err) => {
                let message = if join_err.is_panic() {
                    format!(
                        "transcriber panicked: {}",
                        panic_message(&*join_err.into_panic())
                    )
                } else {
                    "transcription task was cancelled".to_string()
                };
                log::warn!("Batch file {filename} failed: {message}");
                FileResult::failed(filename, message, elapsed_ms)
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        *s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.as_str()
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::job::FileStatus;
    use crate::domain::transcribe::{Segment, TranscribeError, Transcription};
    use parking_lot::Mutex;
    use std::time::Duration;

    // ── テスト用モックエンジン ──────────────────────────────

    struct MockEngine {
        fail: bool,
        delay: Option<Duration>,
        seen: Mutex<Vec<(String, TranscribeOptions)>>,
    }

    impl MockEngine {
        fn ok() -> Self {
            Self {
                fail: false,
                delay: None,
                seen: Mutex::new(Vec::new()),
            }
        }
    }

    impl Transcriber for MockEngine {
        fn transcribe(
            &self,
            _audio: &[u8],
            model: &str,
            options: &TranscribeOptions,
        ) -> Result<Transcription, TranscribeError> {
            self.seen.lock().push((model.to_string(), options.clone()));
            if let Some(delay) = self.delay {
                std::thread::sleep(delay);
            }
            if self.fail {
                return Err(TranscribeError::TranscriptionFailed("bad audio".into()));
            }
            Ok(Transcription {
                text: "hello world".into(),
                language: "en".into(),
                duration: 1.0,
                segments: vec![Segment {
                    start: 0.0,
                    end: 1.0,
                    text: "hello world".into(),
                }],
            })
        }

        fn name(&self) -> &str {
            "mock"
        }
    }

    struct PanickingEngine;

    impl Transcriber for PanickingEngine {
        fn transcribe(
            &self,
            _audio: &[u8],
            _model: &str,
            _options: &TranscribeOptions,
        ) -> Result<Transcription, TranscribeError> {
            panic!("model blew up");
        }

        fn name(&self) -> &str {
            "panicking"
        }
    }

    fn file(name: &str) -> AudioFile {
        AudioFile::new(name, vec![0u8; 32])
    }

    #[tokio::test]
    async fn success_builds_done_result() {
        let engine = Arc::new(MockEngine::ok());
        let pipeline = FilePipeline::new(engine.clone());
        let options = TranscribeOptions {
            language: Some("en".into()),
            ..Default::default()
        };

        let result = pipeline.run(file("a.wav"), "tiny", &options).await;

        assert_eq!(result.filename, "a.wav");
        assert_eq!(result.status(), FileStatus::Done);
        assert_eq!(result.text(), Some("hello world"));
        match &result.outcome {
            crate::domain::job::FileOutcome::Done { model, segments, .. } => {
                assert_eq!(model, "tiny");
                assert_eq!(segments.len(), 1);
            }
            other => panic!("expected done, got {other:?}"),
        }

        let seen = engine.seen.lock();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "tiny");
        assert_eq!(seen[0].1, options);
    }

    #[tokio::test]
    async fn engine_error_becomes_failed_result() {
        let engine = Arc::new(MockEngine {
            fail: true,
            ..MockEngine::ok()
        });
        let pipeline = FilePipeline::new(engine);

        let result = pipeline
            .run(file("bad.wav"), "tiny", &TranscribeOptions::default())
            .await;

        assert_eq!(result.status(), FileStatus::Failed);
        assert!(result.error().unwrap().contains("bad audio"));
    }

    #[tokio::test]
    async fn engine_panic_becomes_failed_result() {
        let pipeline = FilePipeline::new(Arc::new(PanickingEngine));

        let result = pipeline
            .run(file("boom.wav"), "tiny", &TranscribeOptions::default())
            .await;

        assert_eq!(result.status(), FileStatus::Failed);
        assert!(result.error().unwrap().contains("model blew up"));
    }

    #[tokio::test]
    async fn processing_time_is_measured_on_failure() {
        let engine = Arc::new(MockEngine {
            fail: true,
            delay: Some(Duration::from_millis(30)),
            ..MockEngine::ok()
        });
        let pipeline = FilePipeline::new(engine);

        let result = pipeline
            .run(file("slow.wav"), "tiny", &TranscribeOptions::default())
            .await;

        assert!(result.processing_time_ms >= 30);
    }

    #[tokio::test(flavor = "current_thread")]
    async fn blocking_engine_does_not_stall_scheduler() {
        let engine = Arc::new(MockEngine {
            delay: Some(Duration::from_millis(200)),
            ..MockEngine::ok()
        });
        let pipeline = FilePipeline::new(engine);

        let options = TranscribeOptions::default();
        let run = pipeline.run(file("a.wav"), "tiny", &options);
        tokio::pin!(run);

        let mut ticks = 0u32;
        let result = loop {
            tokio::select! {
                result = &mut run => break result,
                _ = tokio::time::sleep(Duration::from_millis(10)) => ticks += 1,
            }
        };

        assert!(result.is_done());
        assert!(ticks >= 5, "scheduler only ticked {ticks} times");
    }

    #[test]
    fn engine_name_passthrough() {
        let pipeline = FilePipeline::new(Arc::new(MockEngine::ok()));
        assert_eq!(pipeline.engine_name(), "mock");
    }
}
