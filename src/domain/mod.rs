use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Job name for transcription work delivered through the queue.
pub const JOB_TRANSCRIBE: &str = "transcribe-audio";

/// Where a recording's bytes came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordingSource {
    /// Raw bytes were uploaded directly.
    Upload,
    /// The bytes already live in a remote object store; only the key was imported.
    RemoteImport,
}

/// Lifecycle status of a recording.
///
/// `Duplicate` is part of the published vocabulary (the duplicate-check
/// surface reports against it) but is never persisted: duplicate uploads are
/// rejected before a row is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RecordingStatus {
    Uploaded,
    PendingTranscription,
    Transcribing,
    Completed,
    FailedTranscription,
    Duplicate,
}

impl RecordingStatus {
    /// Whether a transcription job for this recording is pending or running.
    pub fn transcription_in_flight(&self) -> bool {
        matches!(
            self,
            RecordingStatus::PendingTranscription | RecordingStatus::Transcribing
        )
    }
}

/// One uploaded audio asset.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Recording {
    /// Unique identifier, assigned at creation
    pub id: Uuid,
    /// Original filename as supplied by the uploader
    pub filename: String,
    /// Size of the raw bytes
    pub filesize: u64,
    /// Hex SHA-256 digest of the raw bytes; `None` for remote imports, which
    /// never pass their bytes through the ingest path
    pub content_hash: Option<String>,
    /// Opaque storage locator, interpreted only by the file store that issued it
    pub locator: String,
    pub source: RecordingSource,
    pub status: RecordingStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Lifecycle status of a transcription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TranscriptionStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// One diarized span of transcript text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    /// Speaker label, e.g. "speaker_1"
    pub speaker: String,
    pub start_seconds: f64,
    pub end_seconds: f64,
    pub text: String,
}

/// Transcription state and results for a recording (at most one per recording).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transcription {
    pub id: Uuid,
    pub recording_id: Uuid,
    pub status: TranscriptionStatus,
    /// Full transcript text, present once completed
    pub text: Option<String>,
    /// Language the audio was transcribed in (ISO 639-1 code)
    pub language: Option<String>,
    /// Model used by the speech-to-text provider
    pub model_id: Option<String>,
    /// Number of distinct speakers detected across segments
    pub speakers: u32,
    /// Ordered diarized segments
    pub segments: Vec<TranscriptSegment>,
    pub processing_time_ms: Option<u64>,
    /// Failure message, present only when status is `Failed`
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Transcription {
    /// Create a fresh pending transcription for a recording.
    pub fn pending(recording_id: Uuid) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            recording_id,
            status: TranscriptionStatus::Pending,
            text: None,
            language: None,
            model_id: None,
            speakers: 0,
            segments: Vec::new(),
            processing_time_ms: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Finished transcription results, persisted as one unit on success.
#[derive(Debug, Clone)]
pub struct CompletedTranscript {
    pub text: String,
    pub language: Option<String>,
    pub model_id: Option<String>,
    pub speakers: u32,
    pub segments: Vec<TranscriptSegment>,
    pub processing_time_ms: u64,
}

/// Payload of a transcription job message.
///
/// Both ids are required; the worker rejects envelopes that do not carry a
/// known job name before touching either row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscribeJob {
    pub recording_id: Uuid,
    pub transcription_id: Uuid,
}

impl TranscribeJob {
    pub fn new(recording_id: Uuid, transcription_id: Uuid) -> Self {
        Self {
            recording_id,
            transcription_id,
        }
    }
}
