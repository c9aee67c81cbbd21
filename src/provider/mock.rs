use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::debug;

use super::{AudioInput, ProviderError, ProviderTranscript, SpeechToText, TranscribeOptions};
use crate::domain::TranscriptSegment;

/// Fixed transcript text returned by the mock.
pub const MOCK_TEXT: &str =
    "This is a mock transcription. The real service is not connected yet.";

/// Deterministic speech-to-text double for tests and offline development.
///
/// Returns a fixed two-speaker transcript after a simulated delay. Configure
/// `fail_with_status` to exercise provider-failure paths without a network.
pub struct MockSpeechToText {
    delay: Duration,
    failure: Mutex<Option<(u16, String)>>,
    calls: Arc<AtomicUsize>,
}

impl Default for MockSpeechToText {
    fn default() -> Self {
        Self {
            delay: Duration::from_millis(25),
            failure: Mutex::new(None),
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl MockSpeechToText {
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    /// Make every subsequent call fail as if the API had answered `status`.
    pub fn fail_with_status(&self, status: u16, body: impl Into<String>) {
        *self.failure.lock().unwrap() = Some((status, body.into()));
    }

    /// Go back to succeeding.
    pub fn succeed(&self) {
        *self.failure.lock().unwrap() = None;
    }

    /// Number of transcribe calls observed.
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// The fixed segments a successful call returns.
    pub fn segments() -> Vec<TranscriptSegment> {
        vec![
            TranscriptSegment {
                speaker: "speaker_1".to_string(),
                start_seconds: 0.0,
                end_seconds: 5.0,
                text: "This is a mock transcription.".to_string(),
            },
            TranscriptSegment {
                speaker: "speaker_2".to_string(),
                start_seconds: 5.0,
                end_seconds: 10.0,
                text: "The real service is not connected yet.".to_string(),
            },
        ]
    }
}

#[async_trait]
impl SpeechToText for MockSpeechToText {
    fn name(&self) -> &'static str {
        "mock"
    }

    async fn transcribe(
        &self,
        audio: AudioInput,
        options: &TranscribeOptions,
    ) -> Result<ProviderTranscript, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        debug!("Mock transcription called with options: {:?}", options);

        // Drain the input so stream-based callers behave as they would
        // against the real adapter.
        let bytes = audio.into_bytes().await?;
        debug!("Mock received {} audio bytes", bytes.len());

        tokio::time::sleep(self.delay).await;

        if let Some((status, body)) = self.failure.lock().unwrap().clone() {
            return Err(ProviderError::Api {
                provider: "mock",
                status,
                body,
            });
        }

        Ok(ProviderTranscript {
            text: MOCK_TEXT.to_string(),
            language: Some(options.language.clone()),
            segments: Self::segments(),
            processing_time_ms: self.delay.as_millis() as u64,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_mock_returns_fixed_transcript() {
        let mock = MockSpeechToText::with_delay(Duration::from_millis(1));
        let result = mock
            .transcribe(
                AudioInput::Buffer(vec![0u8; 16]),
                &TranscribeOptions::default(),
            )
            .await
            .unwrap();

        assert_eq!(result.text, MOCK_TEXT);
        assert_eq!(result.segments.len(), 2);
        assert_eq!(result.speaker_count(), 2);
        assert_eq!(result.language.as_deref(), Some("en"));
        assert_eq!(mock.calls(), 1);
    }

    #[tokio::test]
    async fn test_mock_failure_mode() {
        let mock = MockSpeechToText::with_delay(Duration::from_millis(1));
        mock.fail_with_status(401, "invalid api key");

        let err = mock
            .transcribe(
                AudioInput::Buffer(Vec::new()),
                &TranscribeOptions::default(),
            )
            .await
            .unwrap_err();
        assert!(err.to_string().contains("error (401)"));

        mock.succeed();
        assert!(mock
            .transcribe(
                AudioInput::Buffer(Vec::new()),
                &TranscribeOptions::default(),
            )
            .await
            .is_ok());
        assert_eq!(mock.calls(), 2);
    }
}
