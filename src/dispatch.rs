use std::sync::Arc;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

use crate::domain::{Recording, RecordingStatus, TranscribeJob, Transcription, JOB_TRANSCRIBE};
use crate::queue::{JobQueue, QueueError};
use crate::repo::{RecordingStore, RepoError, StatusStore};

/// Errors from requesting a transcription.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("recording {0} not found")]
    RecordingNotFound(Uuid),

    /// A job for this recording is already pending or running. Wait for it to
    /// reach a terminal status before requesting again.
    #[error("transcription for recording {recording_id} is already {status:?}")]
    AlreadyInFlight {
        recording_id: Uuid,
        status: RecordingStatus,
    },

    #[error(transparent)]
    Repo(#[from] RepoError),

    #[error(transparent)]
    Queue(#[from] QueueError),
}

/// Requests (and re-requests) transcription for a recording: resets the
/// status pair to pending and enqueues the job. This is the only place jobs
/// enter the queue, which is how re-transcription of a single recording stays
/// serialized.
pub struct TranscriptionDispatcher {
    recordings: Arc<dyn RecordingStore>,
    status: Arc<dyn StatusStore>,
    queue: JobQueue<TranscribeJob>,
}

impl TranscriptionDispatcher {
    pub fn new(
        recordings: Arc<dyn RecordingStore>,
        status: Arc<dyn StatusStore>,
        queue: JobQueue<TranscribeJob>,
    ) -> Self {
        Self {
            recordings,
            status,
            queue,
        }
    }

    /// Request transcription of a recording. Terminal recordings (completed
    /// or failed) may be re-requested; a prior failure is cleared. Requests
    /// while a job is pending or running are rejected.
    pub async fn request(
        &self,
        recording_id: Uuid,
    ) -> Result<(Recording, Transcription), DispatchError> {
        let recording = self
            .recordings
            .find_by_id(recording_id)
            .await?
            .ok_or(DispatchError::RecordingNotFound(recording_id))?;

        if recording.status.transcription_in_flight() {
            return Err(DispatchError::AlreadyInFlight {
                recording_id,
                status: recording.status,
            });
        }

        let transcription = self.status.mark_requested(recording_id).await?;
        let job = TranscribeJob::new(recording_id, transcription.id);
        let job_id = self.queue.enqueue(JOB_TRANSCRIBE, &job).await?;

        info!(
            "Queued transcription job {} for recording {}",
            job_id, recording_id
        );

        let recording = self
            .recordings
            .find_by_id(recording_id)
            .await?
            .ok_or(DispatchError::RecordingNotFound(recording_id))?;
        Ok((recording, transcription))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{RecordingSource, TranscriptionStatus};
    use crate::repo::sled::SledCatalog;
    use crate::repo::NewRecording;

    async fn saved_recording(catalog: &SledCatalog) -> Recording {
        catalog
            .save(NewRecording {
                filename: "a.mp3".to_string(),
                filesize: 100,
                content_hash: Some("h1".to_string()),
                locator: "/uploads/1-a.mp3".to_string(),
                source: RecordingSource::Upload,
                status: RecordingStatus::Uploaded,
            })
            .await
            .unwrap()
    }

    fn dispatcher(catalog: Arc<SledCatalog>, queue: JobQueue<TranscribeJob>) -> TranscriptionDispatcher {
        TranscriptionDispatcher::new(catalog.clone(), catalog, queue)
    }

    #[tokio::test]
    async fn test_request_resets_pair_and_enqueues() {
        let catalog = Arc::new(SledCatalog::open_temp().unwrap());
        let queue: JobQueue<TranscribeJob> = JobQueue::open_temp().unwrap();
        let recording = saved_recording(&catalog).await;

        let dispatcher = dispatcher(catalog.clone(), queue.clone());
        let (recording, transcription) = dispatcher.request(recording.id).await.unwrap();

        assert_eq!(recording.status, RecordingStatus::PendingTranscription);
        assert_eq!(transcription.status, TranscriptionStatus::Pending);

        let delivery = queue.dequeue().await.unwrap().unwrap();
        assert_eq!(delivery.envelope.name, JOB_TRANSCRIBE);
        assert_eq!(delivery.envelope.payload.recording_id, recording.id);
        assert_eq!(delivery.envelope.payload.transcription_id, transcription.id);
    }

    #[tokio::test]
    async fn test_concurrent_request_is_rejected() {
        let catalog = Arc::new(SledCatalog::open_temp().unwrap());
        let queue: JobQueue<TranscribeJob> = JobQueue::open_temp().unwrap();
        let recording = saved_recording(&catalog).await;

        let dispatcher = dispatcher(catalog.clone(), queue.clone());
        dispatcher.request(recording.id).await.unwrap();

        let err = dispatcher.request(recording.id).await.unwrap_err();
        assert!(matches!(err, DispatchError::AlreadyInFlight { .. }));

        // Only the first request made it into the queue
        assert_eq!(queue.depth().await.unwrap().ready, 1);
    }

    #[tokio::test]
    async fn test_retry_after_failure_clears_error() {
        let catalog = Arc::new(SledCatalog::open_temp().unwrap());
        let queue: JobQueue<TranscribeJob> = JobQueue::open_temp().unwrap();
        let recording = saved_recording(&catalog).await;

        let dispatcher = dispatcher(catalog.clone(), queue.clone());
        let (_, transcription) = dispatcher.request(recording.id).await.unwrap();

        catalog
            .mark_in_progress(recording.id, transcription.id)
            .await
            .unwrap();
        catalog
            .mark_failed(recording.id, transcription.id, "provider exploded")
            .await
            .unwrap();

        let (retried_recording, retried) = dispatcher.request(recording.id).await.unwrap();
        assert_eq!(
            retried_recording.status,
            RecordingStatus::PendingTranscription
        );
        assert_eq!(retried.status, TranscriptionStatus::Pending);
        assert!(retried.error.is_none());
        assert_eq!(retried.id, transcription.id);
    }

    #[tokio::test]
    async fn test_unknown_recording_is_rejected() {
        let catalog = Arc::new(SledCatalog::open_temp().unwrap());
        let queue: JobQueue<TranscribeJob> = JobQueue::open_temp().unwrap();

        let dispatcher = dispatcher(catalog, queue);
        let err = dispatcher.request(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, DispatchError::RecordingNotFound(_)));
    }
}
