use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{
    CompletedTranscript, Recording, RecordingSource, RecordingStatus, Transcription,
    TranscriptionStatus, TranscriptSegment,
};

pub mod sled;

pub use self::sled::SledCatalog;

/// Errors from catalog operations.
#[derive(Debug, Error)]
pub enum RepoError {
    #[error("recording {0} not found")]
    RecordingNotFound(Uuid),

    #[error("transcription {0} not found")]
    TranscriptionNotFound(Uuid),

    #[error("no transcription exists for recording {0}")]
    TranscriptionMissingForRecording(Uuid),

    /// A non-duplicate recording with this content hash already exists. The
    /// authoritative dedup guard: raised by `save` even when two ingests race
    /// past the pre-check.
    #[error("a recording with content hash {hash} already exists")]
    DuplicateHash {
        hash: String,
        existing: Box<Recording>,
    },

    #[error("catalog backend error: {0}")]
    Backend(String),

    #[error("catalog serialization error: {0}")]
    Codec(String),
}

/// Fields for a recording row about to be created. The store assigns the id
/// and both timestamps.
#[derive(Debug, Clone)]
pub struct NewRecording {
    pub filename: String,
    pub filesize: u64,
    pub content_hash: Option<String>,
    pub locator: String,
    pub source: RecordingSource,
    pub status: RecordingStatus,
}

/// Mutable recording fields. `id`, `created_at` and `updated_at` are not
/// representable here, so callers cannot overwrite the immutable columns;
/// the store bumps `updated_at` itself.
#[derive(Debug, Clone, Default)]
pub struct RecordingPatch {
    pub filename: Option<String>,
    pub status: Option<RecordingStatus>,
    pub locator: Option<String>,
}

/// Mutable transcription fields, same immutable-column rules as
/// [`RecordingPatch`]. `error` is doubly optional: `Some(None)` clears a
/// previously recorded failure.
#[derive(Debug, Clone, Default)]
pub struct TranscriptionPatch {
    pub status: Option<TranscriptionStatus>,
    pub text: Option<String>,
    pub language: Option<String>,
    pub model_id: Option<String>,
    pub speakers: Option<u32>,
    pub segments: Option<Vec<TranscriptSegment>>,
    pub processing_time_ms: Option<u64>,
    pub error: Option<Option<String>>,
}

/// Query filter for listing recordings. All fields are conjunctive; `query`
/// is a case-insensitive filename substring match.
#[derive(Debug, Clone, Default)]
pub struct RecordingFilter {
    pub status: Option<RecordingStatus>,
    pub source: Option<RecordingSource>,
    pub query: Option<String>,
}

impl RecordingFilter {
    pub fn matches(&self, recording: &Recording) -> bool {
        if let Some(status) = self.status {
            if recording.status != status {
                return false;
            }
        }
        if let Some(source) = self.source {
            if recording.source != source {
                return false;
            }
        }
        if let Some(query) = &self.query {
            if !recording
                .filename
                .to_lowercase()
                .contains(&query.to_lowercase())
            {
                return false;
            }
        }
        true
    }
}

/// One page of query results.
#[derive(Debug, Clone)]
pub struct Page<T> {
    pub items: Vec<T>,
    /// Total rows matching the filter, across all pages
    pub total: u64,
    /// 1-based page number
    pub page: u64,
    pub limit: u64,
}

/// CRUD plus filtered listing over recording rows. The single source of
/// truth for recording status.
#[async_trait]
pub trait RecordingStore: Send + Sync {
    async fn find_all(
        &self,
        filter: &RecordingFilter,
        page: u64,
        limit: u64,
    ) -> Result<Page<Recording>, RepoError>;

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Recording>, RepoError>;

    async fn find_by_content_hash(&self, hash: &str) -> Result<Option<Recording>, RepoError>;

    async fn save(&self, new: NewRecording) -> Result<Recording, RepoError>;

    async fn update(&self, id: Uuid, patch: RecordingPatch) -> Result<Recording, RepoError>;

    async fn delete(&self, id: Uuid) -> Result<(), RepoError>;
}

/// CRUD over transcription rows, keyed 1:1 with recordings.
#[async_trait]
pub trait TranscriptionStore: Send + Sync {
    async fn find_by_recording_id(
        &self,
        recording_id: Uuid,
    ) -> Result<Option<Transcription>, RepoError>;

    /// Create the transcription row for a recording, or patch the existing one.
    async fn upsert(
        &self,
        recording_id: Uuid,
        fields: TranscriptionPatch,
    ) -> Result<Transcription, RepoError>;

    async fn update(&self, id: Uuid, fields: TranscriptionPatch)
        -> Result<Transcription, RepoError>;
}

/// Lock-step status transitions over a recording and its transcription.
///
/// Every method applies both rows as one atomic unit; observing one row
/// flipped without the other is an invariant violation.
#[async_trait]
pub trait StatusStore: Send + Sync {
    /// Transcription requested (first time or retry): transcription upserted
    /// to `Pending` with error and prior results cleared, recording to
    /// `PendingTranscription`.
    async fn mark_requested(&self, recording_id: Uuid) -> Result<Transcription, RepoError>;

    /// Job dequeued, work begins: `Transcribing` / `InProgress`.
    async fn mark_in_progress(
        &self,
        recording_id: Uuid,
        transcription_id: Uuid,
    ) -> Result<(), RepoError>;

    /// Provider call succeeded: results persisted, `Completed` / `Completed`.
    /// Overwrites segments and speakers so re-delivery never appends.
    async fn mark_completed(
        &self,
        recording_id: Uuid,
        transcription_id: Uuid,
        outcome: CompletedTranscript,
    ) -> Result<(), RepoError>;

    /// Provider call or pipeline step failed: error persisted,
    /// `FailedTranscription` / `Failed`.
    async fn mark_failed(
        &self,
        recording_id: Uuid,
        transcription_id: Uuid,
        error: &str,
    ) -> Result<(), RepoError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn recording(filename: &str, status: RecordingStatus, source: RecordingSource) -> Recording {
        let now = Utc::now();
        Recording {
            id: Uuid::new_v4(),
            filename: filename.to_string(),
            filesize: 100,
            content_hash: None,
            locator: "/uploads/1-x.mp3".to_string(),
            source,
            status,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_empty_filter_matches_everything() {
        let filter = RecordingFilter::default();
        let rec = recording("a.mp3", RecordingStatus::Uploaded, RecordingSource::Upload);
        assert!(filter.matches(&rec));
    }

    #[test]
    fn test_filter_by_status_and_source() {
        let filter = RecordingFilter {
            status: Some(RecordingStatus::Completed),
            source: Some(RecordingSource::Upload),
            query: None,
        };

        let hit = recording("a.mp3", RecordingStatus::Completed, RecordingSource::Upload);
        let wrong_status = recording("a.mp3", RecordingStatus::Uploaded, RecordingSource::Upload);
        let wrong_source = recording(
            "a.mp3",
            RecordingStatus::Completed,
            RecordingSource::RemoteImport,
        );

        assert!(filter.matches(&hit));
        assert!(!filter.matches(&wrong_status));
        assert!(!filter.matches(&wrong_source));
    }

    #[test]
    fn test_filename_query_is_case_insensitive() {
        let filter = RecordingFilter {
            query: Some("STANDUP".to_string()),
            ..Default::default()
        };

        let hit = recording(
            "weekly-standup.mp3",
            RecordingStatus::Uploaded,
            RecordingSource::Upload,
        );
        let miss = recording(
            "retro.mp3",
            RecordingStatus::Uploaded,
            RecordingSource::Upload,
        );

        assert!(filter.matches(&hit));
        assert!(!filter.matches(&miss));
    }
}
