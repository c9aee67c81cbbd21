use async_trait::async_trait;
use serde::Deserialize;
use std::collections::HashSet;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::domain::TranscriptSegment;

pub mod elevenlabs;
pub mod mock;

pub use elevenlabs::ElevenLabsProvider;
pub use mock::MockSpeechToText;

/// Speaker label assigned to segments the provider did not diarize.
pub const DEFAULT_SPEAKER: &str = "speaker_1";

/// Errors from a speech-to-text provider.
///
/// API and transport failures are ordinary results rather than panics so the
/// worker can persist the rendered message directly as the transcription
/// error.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provider rejected the request with a non-2xx response
    #[error("{provider} API error ({status}): {body}")]
    Api {
        provider: &'static str,
        status: u16,
        body: String,
    },

    /// The request never produced a response (connect, timeout, TLS, ...)
    #[error("{0}")]
    Transport(String),

    /// The provider answered 2xx with a body we could not interpret
    #[error("invalid response from {provider}: {message}")]
    InvalidResponse {
        provider: &'static str,
        message: String,
    },

    /// Reading the audio input failed before the request was made
    #[error("failed to read audio input: {0}")]
    AudioInput(#[from] std::io::Error),

    /// No API key was supplied at construction time
    #[error("{provider} API key is not configured")]
    MissingApiKey { provider: &'static str },
}

/// Audio handed to a provider: either a finite byte stream or an in-memory
/// buffer.
pub enum AudioInput {
    Buffer(Vec<u8>),
    Stream(Box<dyn AsyncRead + Send + Unpin>),
}

impl AudioInput {
    /// Drain the input into a single buffer. Providers upload whole files, so
    /// streams are collected before the request is built.
    pub async fn into_bytes(self) -> Result<Vec<u8>, std::io::Error> {
        match self {
            AudioInput::Buffer(bytes) => Ok(bytes),
            AudioInput::Stream(mut reader) => {
                let mut bytes = Vec::new();
                reader.read_to_end(&mut bytes).await?;
                Ok(bytes)
            }
        }
    }
}

impl From<Vec<u8>> for AudioInput {
    fn from(bytes: Vec<u8>) -> Self {
        AudioInput::Buffer(bytes)
    }
}

/// Options for a transcription request. Defaults match the pipeline's
/// standard diarized English pass.
#[derive(Debug, Clone)]
pub struct TranscribeOptions {
    pub language: String,
    pub model_id: String,
    pub diarize: bool,
}

impl Default for TranscribeOptions {
    fn default() -> Self {
        Self {
            language: "en".to_string(),
            model_id: "scribe_v1".to_string(),
            diarize: true,
        }
    }
}

/// Normalized transcription result.
#[derive(Debug, Clone)]
pub struct ProviderTranscript {
    pub text: String,
    pub language: Option<String>,
    pub segments: Vec<TranscriptSegment>,
    pub processing_time_ms: u64,
}

impl ProviderTranscript {
    /// Number of distinct speaker labels across segments.
    pub fn speaker_count(&self) -> u32 {
        count_speakers(&self.segments)
    }
}

/// External speech-to-text service.
#[async_trait]
pub trait SpeechToText: Send + Sync {
    /// Short provider name, used in error messages and logs.
    fn name(&self) -> &'static str;

    async fn transcribe(
        &self,
        audio: AudioInput,
        options: &TranscribeOptions,
    ) -> Result<ProviderTranscript, ProviderError>;
}

/// Segment as it appears on the wire, before normalization.
#[derive(Debug, Clone, Deserialize)]
pub struct RawSegment {
    pub text: String,
    pub start: f64,
    pub end: f64,
    pub speaker: Option<String>,
}

/// Map wire segments into the domain shape, defaulting the speaker label for
/// providers that did not diarize.
pub fn normalize_segments(raw: Vec<RawSegment>) -> Vec<TranscriptSegment> {
    raw.into_iter()
        .map(|segment| TranscriptSegment {
            speaker: segment
                .speaker
                .unwrap_or_else(|| DEFAULT_SPEAKER.to_string()),
            start_seconds: segment.start,
            end_seconds: segment.end,
            text: segment.text,
        })
        .collect()
}

/// Count distinct speaker labels.
pub fn count_speakers(segments: &[TranscriptSegment]) -> u32 {
    segments
        .iter()
        .map(|segment| segment.speaker.as_str())
        .collect::<HashSet<_>>()
        .len() as u32
}
