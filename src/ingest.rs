use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::domain::{Recording, RecordingSource, RecordingStatus};
use crate::hash::content_hash;
use crate::repo::{NewRecording, RecordingStore, RepoError};
use crate::store::{FileStore, StoreError};

/// Errors surfaced by the ingestion path. None of these are retried: they go
/// straight back to the caller.
#[derive(Debug, Error)]
pub enum IngestError {
    /// Byte-identical content was already ingested; carries the conflicting
    /// recording so the caller can point at it.
    #[error("duplicate content: identical bytes already ingested as recording {}", existing.id)]
    DuplicateContent { existing: Box<Recording> },

    #[error("invalid upload: {0}")]
    Invalid(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Repo(RepoError),
}

/// Answer from the upload-time duplicate pre-check surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct DuplicateCheck {
    pub duplicate: bool,
    pub existing: Option<Recording>,
}

/// Input to [`IngestService::ingest`]: exactly one of raw bytes (upload) or a
/// remote object key (import).
pub enum IngestSource {
    Upload { bytes: Vec<u8> },
    RemoteImport { remote_key: String },
}

/// Orchestrates upload ingestion: hash, dedup check, store, create the
/// recording row. Never triggers transcription itself; callers enqueue a job
/// separately.
pub struct IngestService {
    store: Arc<dyn FileStore>,
    recordings: Arc<dyn RecordingStore>,
}

impl IngestService {
    pub fn new(store: Arc<dyn FileStore>, recordings: Arc<dyn RecordingStore>) -> Self {
        Self { store, recordings }
    }

    /// Ingest one recording. Duplicate content is rejected before any storage
    /// write; the repository's uniqueness guard covers ingests racing past
    /// the pre-check.
    pub async fn ingest(
        &self,
        filename: &str,
        source: IngestSource,
    ) -> Result<Recording, IngestError> {
        if filename.trim().is_empty() {
            return Err(IngestError::Invalid("filename must not be empty".into()));
        }

        let (hash, filesize) = match &source {
            IngestSource::Upload { bytes } => {
                if bytes.is_empty() {
                    return Err(IngestError::Invalid("upload contains no bytes".into()));
                }
                (Some(content_hash(bytes)), bytes.len() as u64)
            }
            IngestSource::RemoteImport { remote_key } => {
                if remote_key.trim().is_empty() {
                    return Err(IngestError::Invalid("remote key must not be empty".into()));
                }
                (None, 0)
            }
        };

        // Cheap check before the expensive write
        if let Some(hash) = &hash {
            if let Some(existing) = self
                .recordings
                .find_by_content_hash(hash)
                .await
                .map_err(IngestError::Repo)?
            {
                debug!(
                    "Rejecting duplicate upload of {} (matches recording {})",
                    filename, existing.id
                );
                return Err(IngestError::DuplicateContent {
                    existing: Box::new(existing),
                });
            }
        }

        let (locator, recording_source) = match source {
            IngestSource::Upload { bytes } => {
                let locator = self.store.save(filename, &bytes).await?;
                (locator, RecordingSource::Upload)
            }
            IngestSource::RemoteImport { remote_key } => {
                (remote_key, RecordingSource::RemoteImport)
            }
        };

        let saved = self
            .recordings
            .save(NewRecording {
                filename: filename.to_string(),
                filesize,
                content_hash: hash,
                locator,
                source: recording_source,
                status: RecordingStatus::Uploaded,
            })
            .await
            .map_err(|e| match e {
                RepoError::DuplicateHash { existing, .. } => {
                    IngestError::DuplicateContent { existing }
                }
                other => IngestError::Repo(other),
            })?;

        info!(
            "Ingested recording {} ({}, {} bytes)",
            saved.id, saved.filename, saved.filesize
        );
        Ok(saved)
    }

    /// Client-facing duplicate pre-check by content hash. Advisory only; the
    /// authoritative check happens inside [`IngestService::ingest`].
    pub async fn check_duplicate(&self, hash: &str) -> Result<DuplicateCheck, IngestError> {
        if hash.trim().is_empty() {
            return Err(IngestError::Invalid("content hash is required".into()));
        }

        let existing = self
            .recordings
            .find_by_content_hash(hash)
            .await
            .map_err(IngestError::Repo)?;

        Ok(DuplicateCheck {
            duplicate: existing.is_some(),
            existing,
        })
    }
}
