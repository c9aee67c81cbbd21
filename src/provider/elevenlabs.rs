use async_trait::async_trait;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tracing::debug;

use super::{
    normalize_segments, AudioInput, ProviderError, ProviderTranscript, RawSegment, SpeechToText,
    TranscribeOptions,
};

const PROVIDER_NAME: &str = "elevenlabs";
const DEFAULT_BASE_URL: &str = "https://api.elevenlabs.io/v1";
const API_KEY_ENV: &str = "ELEVENLABS_API_KEY";
const REQUEST_TIMEOUT_SECS: u64 = 300;

/// Speech-to-text response as returned by the ElevenLabs API.
#[derive(Debug, Deserialize)]
struct SpeechToTextResponse {
    text: String,
    language: Option<String>,
    #[serde(default)]
    segments: Vec<RawSegment>,
}

/// ElevenLabs speech-to-text adapter.
///
/// Uploads the audio as a multipart form to `{base}/speech-to-text` with the
/// `xi-api-key` header. A missing API key fails construction, not individual
/// calls.
#[derive(Debug)]
pub struct ElevenLabsProvider {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

impl ElevenLabsProvider {
    pub fn new(api_key: impl Into<String>) -> Result<Self, ProviderError> {
        let api_key = api_key.into();
        if api_key.trim().is_empty() {
            return Err(ProviderError::MissingApiKey {
                provider: PROVIDER_NAME,
            });
        }

        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
            .build()
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        Ok(Self {
            client,
            api_key,
            base_url: DEFAULT_BASE_URL.to_string(),
        })
    }

    /// Read the API key from `ELEVENLABS_API_KEY`.
    pub fn from_env() -> Result<Self, ProviderError> {
        let api_key = std::env::var(API_KEY_ENV).unwrap_or_default();
        Self::new(api_key)
    }

    /// Point the adapter at a different endpoint (self-hosted gateway, tests).
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }
}

#[async_trait]
impl SpeechToText for ElevenLabsProvider {
    fn name(&self) -> &'static str {
        PROVIDER_NAME
    }

    async fn transcribe(
        &self,
        audio: AudioInput,
        options: &TranscribeOptions,
    ) -> Result<ProviderTranscript, ProviderError> {
        let audio_bytes = audio.into_bytes().await?;
        let started = Instant::now();

        let file_part = reqwest::multipart::Part::bytes(audio_bytes)
            .file_name("audio.mp3")
            .mime_str("audio/mpeg")
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let form = reqwest::multipart::Form::new()
            .part("file", file_part)
            .text("model_id", options.model_id.clone())
            .text("language_code", options.language.clone())
            .text("diarize", options.diarize.to_string())
            .text("tag_audio_events", "true");

        let url = format!("{}/speech-to-text", self.base_url);
        debug!("Sending transcription request to {}", url);

        let response = self
            .client
            .post(&url)
            .header("xi-api-key", &self.api_key)
            .multipart(form)
            .send()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string());
            return Err(ProviderError::Api {
                provider: PROVIDER_NAME,
                status: status.as_u16(),
                body,
            });
        }

        let body = response
            .text()
            .await
            .map_err(|e| ProviderError::Transport(e.to_string()))?;
        let parsed: SpeechToTextResponse =
            serde_json::from_str(&body).map_err(|e| ProviderError::InvalidResponse {
                provider: PROVIDER_NAME,
                message: e.to_string(),
            })?;

        let processing_time_ms = started.elapsed().as_millis() as u64;
        debug!(
            "Transcribed {} segments in {}ms",
            parsed.segments.len(),
            processing_time_ms
        );

        Ok(ProviderTranscript {
            text: parsed.text,
            language: parsed.language,
            segments: normalize_segments(parsed.segments),
            processing_time_ms,
        })
    }
}
