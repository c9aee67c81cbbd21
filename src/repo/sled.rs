use async_trait::async_trait;
use chrono::Utc;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use ::sled::transaction::{ConflictableTransactionError, TransactionError};
use ::sled::{Db, Transactional, Tree};

use super::{
    NewRecording, Page, RecordingFilter, RecordingPatch, RecordingStore, RepoError, StatusStore,
    TranscriptionPatch, TranscriptionStore,
};
use crate::domain::{
    CompletedTranscript, Recording, RecordingStatus, Transcription, TranscriptionStatus,
};

/// Sled-backed catalog of recordings and transcriptions.
///
/// Trees:
/// - `recordings`: recording id -> recording row
/// - `recordings_by_hash`: content hash -> recording id (uniqueness guard)
/// - `transcriptions`: recording id -> transcription row (the 1:1 key)
/// - `transcription_ids`: transcription id -> recording id
///
/// Values are MessagePack. Lock-step status updates run as multi-tree sled
/// transactions so a recording and its transcription can never be observed
/// with only one of the pair flipped.
#[derive(Clone)]
pub struct SledCatalog {
    db: Db,
    recordings: Tree,
    recordings_by_hash: Tree,
    transcriptions: Tree,
    transcription_ids: Tree,
}

fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, RepoError> {
    rmp_serde::to_vec(value).map_err(|e| RepoError::Codec(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, RepoError> {
    rmp_serde::from_slice(bytes).map_err(|e| RepoError::Codec(e.to_string()))
}

fn abort<T>(err: RepoError) -> Result<T, ConflictableTransactionError<RepoError>> {
    Err(ConflictableTransactionError::Abort(err))
}

fn unwrap_tx<T>(result: Result<T, TransactionError<RepoError>>) -> Result<T, RepoError> {
    result.map_err(|e| match e {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => RepoError::Backend(e.to_string()),
    })
}

fn apply_recording_patch(recording: &mut Recording, patch: &RecordingPatch) {
    if let Some(filename) = &patch.filename {
        recording.filename = filename.clone();
    }
    if let Some(status) = patch.status {
        recording.status = status;
    }
    if let Some(locator) = &patch.locator {
        recording.locator = locator.clone();
    }
    recording.updated_at = Utc::now();
}

fn apply_transcription_patch(transcription: &mut Transcription, patch: &TranscriptionPatch) {
    if let Some(status) = patch.status {
        transcription.status = status;
    }
    if let Some(text) = &patch.text {
        transcription.text = Some(text.clone());
    }
    if let Some(language) = &patch.language {
        transcription.language = Some(language.clone());
    }
    if let Some(model_id) = &patch.model_id {
        transcription.model_id = Some(model_id.clone());
    }
    if let Some(speakers) = patch.speakers {
        transcription.speakers = speakers;
    }
    if let Some(segments) = &patch.segments {
        transcription.segments = segments.clone();
    }
    if let Some(processing_time_ms) = patch.processing_time_ms {
        transcription.processing_time_ms = Some(processing_time_ms);
    }
    if let Some(error) = &patch.error {
        transcription.error = error.clone();
    }
    transcription.updated_at = Utc::now();
}

impl SledCatalog {
    /// Open (or create) a catalog at the given path.
    pub fn open<P: AsRef<std::path::Path>>(path: P) -> Result<Self, RepoError> {
        let db = ::sled::open(&path).map_err(|e| RepoError::Backend(e.to_string()))?;
        info!("Opened catalog at {}", path.as_ref().display());
        Self::from_db(db)
    }

    /// Open an in-memory catalog (useful for testing).
    pub fn open_temp() -> Result<Self, RepoError> {
        let db = ::sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| RepoError::Backend(e.to_string()))?;
        Self::from_db(db)
    }

    fn from_db(db: Db) -> Result<Self, RepoError> {
        let open = |name: &str| {
            db.open_tree(name)
                .map_err(|e| RepoError::Backend(e.to_string()))
        };

        Ok(Self {
            recordings: open("recordings")?,
            recordings_by_hash: open("recordings_by_hash")?,
            transcriptions: open("transcriptions")?,
            transcription_ids: open("transcription_ids")?,
            db,
        })
    }

    /// Flush all pending writes to disk.
    pub async fn flush(&self) -> Result<(), RepoError> {
        self.db
            .flush_async()
            .await
            .map_err(|e| RepoError::Backend(e.to_string()))?;
        Ok(())
    }

    fn get_recording(&self, id: Uuid) -> Result<Option<Recording>, RepoError> {
        match self
            .recordings
            .get(id.as_bytes())
            .map_err(|e| RepoError::Backend(e.to_string()))?
        {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn get_transcription(&self, recording_id: Uuid) -> Result<Option<Transcription>, RepoError> {
        match self
            .transcriptions
            .get(recording_id.as_bytes())
            .map_err(|e| RepoError::Backend(e.to_string()))?
        {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    fn index_transcription_id(&self, transcription: &Transcription) -> Result<(), RepoError> {
        self.transcription_ids
            .insert(
                transcription.id.as_bytes().to_vec(),
                transcription.recording_id.as_bytes().to_vec(),
            )
            .map_err(|e| RepoError::Backend(e.to_string()))?;
        Ok(())
    }

    /// Apply a lock-step recording + transcription mutation in one sled
    /// transaction. `mutate` receives the current pair and returns the rows
    /// to write back.
    fn transition<F>(
        &self,
        recording_id: Uuid,
        transcription_id: Uuid,
        mutate: F,
    ) -> Result<(), RepoError>
    where
        F: Fn(Recording, Transcription) -> (Recording, Transcription),
    {
        let result = (&self.recordings, &self.transcriptions).transaction(|(recs, trs)| {
            let recording = match recs.get(recording_id.as_bytes())? {
                Some(bytes) => match decode::<Recording>(&bytes) {
                    Ok(r) => r,
                    Err(e) => return abort(e),
                },
                None => return abort(RepoError::RecordingNotFound(recording_id)),
            };

            let transcription = match trs.get(recording_id.as_bytes())? {
                Some(bytes) => match decode::<Transcription>(&bytes) {
                    Ok(t) => t,
                    Err(e) => return abort(e),
                },
                None => {
                    return abort(RepoError::TranscriptionMissingForRecording(recording_id))
                }
            };

            // A stale job (older transcription id) must not clobber a newer row.
            if transcription.id != transcription_id {
                return abort(RepoError::TranscriptionNotFound(transcription_id));
            }

            let (recording, transcription) = mutate(recording, transcription);

            let rec_bytes = match encode(&recording) {
                Ok(b) => b,
                Err(e) => return abort(e),
            };
            let tr_bytes = match encode(&transcription) {
                Ok(b) => b,
                Err(e) => return abort(e),
            };

            recs.insert(recording_id.as_bytes().to_vec(), rec_bytes)?;
            trs.insert(recording_id.as_bytes().to_vec(), tr_bytes)?;
            Ok(())
        });

        unwrap_tx(result)
    }
}

#[async_trait]
impl RecordingStore for SledCatalog {
    async fn find_all(
        &self,
        filter: &RecordingFilter,
        page: u64,
        limit: u64,
    ) -> Result<Page<Recording>, RepoError> {
        let page = page.max(1);
        let limit = limit.max(1);

        let mut matched: Vec<Recording> = Vec::new();
        for entry in self.recordings.iter() {
            let (_, bytes) = entry.map_err(|e| RepoError::Backend(e.to_string()))?;
            let recording: Recording = decode(&bytes)?;
            if filter.matches(&recording) {
                matched.push(recording);
            }
        }

        // Newest first; id as tiebreaker for a stable order
        matched.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.id.cmp(&a.id))
        });

        let total = matched.len() as u64;
        let start = ((page - 1) * limit) as usize;
        let items: Vec<Recording> = matched
            .into_iter()
            .skip(start)
            .take(limit as usize)
            .collect();

        Ok(Page {
            items,
            total,
            page,
            limit,
        })
    }

    async fn find_by_id(&self, id: Uuid) -> Result<Option<Recording>, RepoError> {
        self.get_recording(id)
    }

    async fn find_by_content_hash(&self, hash: &str) -> Result<Option<Recording>, RepoError> {
        let id_bytes = match self
            .recordings_by_hash
            .get(hash.as_bytes())
            .map_err(|e| RepoError::Backend(e.to_string()))?
        {
            Some(bytes) => bytes,
            None => return Ok(None),
        };

        let id = Uuid::from_slice(&id_bytes).map_err(|e| RepoError::Codec(e.to_string()))?;
        self.get_recording(id)
    }

    async fn save(&self, new: NewRecording) -> Result<Recording, RepoError> {
        let now = Utc::now();
        let recording = Recording {
            id: Uuid::new_v4(),
            filename: new.filename,
            filesize: new.filesize,
            content_hash: new.content_hash,
            locator: new.locator,
            source: new.source,
            status: new.status,
            created_at: now,
            updated_at: now,
        };

        let encoded = encode(&recording)?;

        let result =
            (&self.recordings, &self.recordings_by_hash).transaction(|(recs, by_hash)| {
                if let Some(hash) = &recording.content_hash {
                    if let Some(existing_id) = by_hash.get(hash.as_bytes())? {
                        // Authoritative uniqueness guard: losing a dedup race
                        // surfaces here rather than creating a second row.
                        let existing_id = match Uuid::from_slice(&existing_id) {
                            Ok(id) => id,
                            Err(e) => return abort(RepoError::Codec(e.to_string())),
                        };
                        let existing = match recs.get(existing_id.as_bytes())? {
                            Some(bytes) => match decode::<Recording>(&bytes) {
                                Ok(r) => r,
                                Err(e) => return abort(e),
                            },
                            None => return abort(RepoError::RecordingNotFound(existing_id)),
                        };
                        return abort(RepoError::DuplicateHash {
                            hash: hash.clone(),
                            existing: Box::new(existing),
                        });
                    }
                    by_hash.insert(hash.as_bytes().to_vec(), recording.id.as_bytes().to_vec())?;
                }

                recs.insert(recording.id.as_bytes().to_vec(), encoded.clone())?;
                Ok(())
            });

        unwrap_tx(result)?;
        debug!("Created recording {} ({})", recording.id, recording.filename);
        Ok(recording)
    }

    async fn update(&self, id: Uuid, patch: RecordingPatch) -> Result<Recording, RepoError> {
        let result = self.recordings.transaction(|recs| {
            let mut recording = match recs.get(id.as_bytes())? {
                Some(bytes) => match decode::<Recording>(&bytes) {
                    Ok(r) => r,
                    Err(e) => return abort(e),
                },
                None => return abort(RepoError::RecordingNotFound(id)),
            };

            apply_recording_patch(&mut recording, &patch);

            let encoded = match encode(&recording) {
                Ok(b) => b,
                Err(e) => return abort(e),
            };
            recs.insert(id.as_bytes().to_vec(), encoded)?;
            Ok(recording)
        });

        unwrap_tx(result)
    }

    async fn delete(&self, id: Uuid) -> Result<(), RepoError> {
        let result =
            (&self.recordings, &self.recordings_by_hash).transaction(|(recs, by_hash)| {
                let recording = match recs.remove(id.as_bytes().to_vec())? {
                    Some(bytes) => match decode::<Recording>(&bytes) {
                        Ok(r) => r,
                        Err(e) => return abort(e),
                    },
                    None => return abort(RepoError::RecordingNotFound(id)),
                };

                if let Some(hash) = &recording.content_hash {
                    by_hash.remove(hash.as_bytes().to_vec())?;
                }
                Ok(())
            });

        unwrap_tx(result)
    }
}

#[async_trait]
impl TranscriptionStore for SledCatalog {
    async fn find_by_recording_id(
        &self,
        recording_id: Uuid,
    ) -> Result<Option<Transcription>, RepoError> {
        self.get_transcription(recording_id)
    }

    async fn upsert(
        &self,
        recording_id: Uuid,
        fields: TranscriptionPatch,
    ) -> Result<Transcription, RepoError> {
        let fresh = Transcription::pending(recording_id);

        let result = self.transcriptions.transaction(|trs| {
            let mut transcription = match trs.get(recording_id.as_bytes())? {
                Some(bytes) => match decode::<Transcription>(&bytes) {
                    Ok(t) => t,
                    Err(e) => return abort(e),
                },
                None => fresh.clone(),
            };

            apply_transcription_patch(&mut transcription, &fields);

            let encoded = match encode(&transcription) {
                Ok(b) => b,
                Err(e) => return abort(e),
            };
            trs.insert(recording_id.as_bytes().to_vec(), encoded)?;
            Ok(transcription)
        });

        let transcription = unwrap_tx(result)?;
        self.index_transcription_id(&transcription)?;
        Ok(transcription)
    }

    async fn update(
        &self,
        id: Uuid,
        fields: TranscriptionPatch,
    ) -> Result<Transcription, RepoError> {
        let recording_id = match self
            .transcription_ids
            .get(id.as_bytes())
            .map_err(|e| RepoError::Backend(e.to_string()))?
        {
            Some(bytes) => Uuid::from_slice(&bytes).map_err(|e| RepoError::Codec(e.to_string()))?,
            None => return Err(RepoError::TranscriptionNotFound(id)),
        };

        let result = self.transcriptions.transaction(|trs| {
            let mut transcription = match trs.get(recording_id.as_bytes())? {
                Some(bytes) => match decode::<Transcription>(&bytes) {
                    Ok(t) => t,
                    Err(e) => return abort(e),
                },
                None => return abort(RepoError::TranscriptionNotFound(id)),
            };

            if transcription.id != id {
                return abort(RepoError::TranscriptionNotFound(id));
            }

            apply_transcription_patch(&mut transcription, &fields);

            let encoded = match encode(&transcription) {
                Ok(b) => b,
                Err(e) => return abort(e),
            };
            trs.insert(recording_id.as_bytes().to_vec(), encoded)?;
            Ok(transcription)
        });

        unwrap_tx(result)
    }
}

#[async_trait]
impl StatusStore for SledCatalog {
    async fn mark_requested(&self, recording_id: Uuid) -> Result<Transcription, RepoError> {
        let fresh = Transcription::pending(recording_id);

        let result = (&self.recordings, &self.transcriptions).transaction(|(recs, trs)| {
            let mut recording = match recs.get(recording_id.as_bytes())? {
                Some(bytes) => match decode::<Recording>(&bytes) {
                    Ok(r) => r,
                    Err(e) => return abort(e),
                },
                None => return abort(RepoError::RecordingNotFound(recording_id)),
            };

            // Reset to a clean pending slate, clearing any prior error and
            // results but keeping the row identity across retries.
            let mut transcription = match trs.get(recording_id.as_bytes())? {
                Some(bytes) => match decode::<Transcription>(&bytes) {
                    Ok(existing) => {
                        let mut reset = fresh.clone();
                        reset.id = existing.id;
                        reset.created_at = existing.created_at;
                        reset
                    }
                    Err(e) => return abort(e),
                },
                None => fresh.clone(),
            };
            transcription.updated_at = Utc::now();

            recording.status = RecordingStatus::PendingTranscription;
            recording.updated_at = Utc::now();

            let rec_bytes = match encode(&recording) {
                Ok(b) => b,
                Err(e) => return abort(e),
            };
            let tr_bytes = match encode(&transcription) {
                Ok(b) => b,
                Err(e) => return abort(e),
            };

            recs.insert(recording_id.as_bytes().to_vec(), rec_bytes)?;
            trs.insert(recording_id.as_bytes().to_vec(), tr_bytes)?;
            Ok(transcription)
        });

        let transcription = unwrap_tx(result)?;
        self.index_transcription_id(&transcription)?;
        Ok(transcription)
    }

    async fn mark_in_progress(
        &self,
        recording_id: Uuid,
        transcription_id: Uuid,
    ) -> Result<(), RepoError> {
        self.transition(recording_id, transcription_id, |mut rec, mut tr| {
            rec.status = RecordingStatus::Transcribing;
            rec.updated_at = Utc::now();
            tr.status = TranscriptionStatus::InProgress;
            tr.updated_at = Utc::now();
            (rec, tr)
        })
    }

    async fn mark_completed(
        &self,
        recording_id: Uuid,
        transcription_id: Uuid,
        outcome: CompletedTranscript,
    ) -> Result<(), RepoError> {
        self.transition(recording_id, transcription_id, move |mut rec, mut tr| {
            rec.status = RecordingStatus::Completed;
            rec.updated_at = Utc::now();

            tr.status = TranscriptionStatus::Completed;
            tr.text = Some(outcome.text.clone());
            tr.language = outcome.language.clone();
            tr.model_id = outcome.model_id.clone();
            tr.speakers = outcome.speakers;
            // Overwrite, never append: re-delivery of a job must converge
            tr.segments = outcome.segments.clone();
            tr.processing_time_ms = Some(outcome.processing_time_ms);
            tr.error = None;
            tr.updated_at = Utc::now();
            (rec, tr)
        })
    }

    async fn mark_failed(
        &self,
        recording_id: Uuid,
        transcription_id: Uuid,
        error: &str,
    ) -> Result<(), RepoError> {
        self.transition(recording_id, transcription_id, |mut rec, mut tr| {
            rec.status = RecordingStatus::FailedTranscription;
            rec.updated_at = Utc::now();
            tr.status = TranscriptionStatus::Failed;
            tr.error = Some(error.to_string());
            tr.updated_at = Utc::now();
            (rec, tr)
        })
    }
}
