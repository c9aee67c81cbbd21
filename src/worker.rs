use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, RwLock};
use tokio::time::interval;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::domain::{CompletedTranscript, TranscribeJob, JOB_TRANSCRIBE};
use crate::provider::{AudioInput, SpeechToText, TranscribeOptions};
use crate::queue::{Delivery, JobQueue, NackOutcome, QueueError};
use crate::repo::{RecordingStore, RepoError, StatusStore};
use crate::store::{FileStore, StoreError};

/// Configuration for the transcription worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// How often the queue is polled when idle
    pub poll_interval: Duration,
    /// Maximum jobs drained per poll tick
    pub batch_size: usize,
    /// Options passed to the speech-to-text provider
    pub options: TranscribeOptions,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(250),
            batch_size: 10,
            options: TranscribeOptions::default(),
        }
    }
}

/// Counters for worker observability.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    pub processed: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub dead_lettered: u64,
}

impl std::fmt::Display for WorkerStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "processed={}, succeeded={}, failed={}, dead_lettered={}",
            self.processed, self.succeeded, self.failed, self.dead_lettered
        )
    }
}

/// Outcome of one processing attempt.
enum JobOutcome {
    Completed,
    Failed { error: String, retryable: bool },
}

/// Queue consumer that drives the recording/transcription state machine.
///
/// Per delivered job it transitions both rows to in-progress, streams the
/// stored audio into the provider, and persists either the completed
/// transcript or the failure - each transition as one atomic unit. Failures
/// are classified: missing rows or missing stored objects cannot succeed on
/// retry and are buried; provider and storage I/O failures are nacked so the
/// queue's backoff policy governs further attempts.
#[derive(Clone)]
pub struct TranscriptionWorker {
    queue: JobQueue<TranscribeJob>,
    recordings: Arc<dyn RecordingStore>,
    status: Arc<dyn StatusStore>,
    store: Arc<dyn FileStore>,
    provider: Arc<dyn SpeechToText>,
    config: WorkerConfig,
    stats: Arc<RwLock<WorkerStats>>,
    worker_id: String,
}

impl TranscriptionWorker {
    pub fn new(
        queue: JobQueue<TranscribeJob>,
        recordings: Arc<dyn RecordingStore>,
        status: Arc<dyn StatusStore>,
        store: Arc<dyn FileStore>,
        provider: Arc<dyn SpeechToText>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            queue,
            recordings,
            status,
            store,
            provider,
            config,
            stats: Arc::new(RwLock::new(WorkerStats::default())),
            worker_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn id(&self) -> &str {
        &self.worker_id
    }

    pub async fn stats(&self) -> WorkerStats {
        self.stats.read().await.clone()
    }

    /// Run the consumer loop until a shutdown signal arrives.
    pub async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            "Worker {} started (provider: {}, poll interval: {:?})",
            self.worker_id,
            self.provider.name(),
            self.config.poll_interval
        );

        let mut ticker = interval(self.config.poll_interval);
        loop {
            tokio::select! {
                _ = shutdown_rx.recv() => break,
                _ = ticker.tick() => {
                    for _ in 0..self.config.batch_size {
                        match self.run_once().await {
                            Ok(true) => {}
                            Ok(false) => break,
                            Err(e) => {
                                error!("Worker {} queue error: {}", self.worker_id, e);
                                break;
                            }
                        }
                    }
                }
            }
        }

        info!("Worker {} stopped", self.worker_id);
    }

    /// Process at most one job. Returns whether a job was delivered.
    pub async fn run_once(&self) -> Result<bool, QueueError> {
        let Some(delivery) = self.queue.dequeue().await? else {
            return Ok(false);
        };

        self.handle(delivery).await;
        Ok(true)
    }

    async fn handle(&self, delivery: Delivery<TranscribeJob>) {
        self.stats.write().await.processed += 1;

        // Payload validation at the queue boundary: unknown names never
        // reach the state machine.
        if delivery.envelope.name != JOB_TRANSCRIBE {
            let error = format!("unknown job name: {}", delivery.envelope.name);
            error!("Job {}: {}", delivery.envelope.job_id, error);
            if let Err(e) = self.queue.bury(&delivery, &error).await {
                error!("Failed to bury job {}: {}", delivery.envelope.job_id, e);
            }
            self.stats.write().await.dead_lettered += 1;
            return;
        }

        let job = delivery.envelope.payload.clone();
        debug!(
            "Job {}: transcribing recording {} (attempt {})",
            delivery.envelope.job_id,
            job.recording_id,
            delivery.envelope.attempt + 1
        );

        match self.process(&job).await {
            JobOutcome::Completed => {
                if let Err(e) = self.queue.ack(&delivery).await {
                    error!("Failed to ack job {}: {}", delivery.envelope.job_id, e);
                }
                self.stats.write().await.succeeded += 1;
                info!(
                    "Job {}: recording {} transcribed",
                    delivery.envelope.job_id, job.recording_id
                );
            }
            JobOutcome::Failed { error, retryable } if retryable => {
                warn!(
                    "Job {}: attempt {} failed: {}",
                    delivery.envelope.job_id,
                    delivery.envelope.attempt + 1,
                    error
                );
                match self.queue.nack(&delivery, &error).await {
                    Ok(NackOutcome::Retry { .. }) => {
                        self.stats.write().await.failed += 1;
                    }
                    Ok(NackOutcome::DeadLettered) => {
                        let mut stats = self.stats.write().await;
                        stats.failed += 1;
                        stats.dead_lettered += 1;
                    }
                    Err(e) => {
                        error!("Failed to nack job {}: {}", delivery.envelope.job_id, e)
                    }
                }
            }
            JobOutcome::Failed { error, .. } => {
                warn!(
                    "Job {}: failed without retry: {}",
                    delivery.envelope.job_id, error
                );
                if let Err(e) = self.queue.bury(&delivery, &error).await {
                    error!("Failed to bury job {}: {}", delivery.envelope.job_id, e);
                }
                let mut stats = self.stats.write().await;
                stats.failed += 1;
                stats.dead_lettered += 1;
            }
        }
    }

    /// Drive one job through the state machine. Every failure is persisted to
    /// the status pair before it is reported back to the queue.
    async fn process(&self, job: &TranscribeJob) -> JobOutcome {
        // Step 1: both rows flip to in-progress together
        if let Err(e) = self
            .status
            .mark_in_progress(job.recording_id, job.transcription_id)
            .await
        {
            let retryable = !is_missing_row(&e);
            return self.fail(job, e.to_string(), retryable).await;
        }

        // Step 2: load the recording; it existed a moment ago, so a miss here
        // means it was deleted out from under the job
        let recording = match self.recordings.find_by_id(job.recording_id).await {
            Ok(Some(recording)) => recording,
            Ok(None) => {
                let error = format!("recording {} not found", job.recording_id);
                return self.fail(job, error, false).await;
            }
            Err(e) => return self.fail(job, e.to_string(), true).await,
        };

        // Step 3: open the stored audio; a missing object cannot come back
        let reader = match self.store.open_read_stream(&recording.locator).await {
            Ok(reader) => reader,
            Err(e @ StoreError::NotFound(_)) => {
                let error = format!("audio for recording {}: {}", recording.id, e);
                return self.fail(job, error, false).await;
            }
            Err(e) => return self.fail(job, e.to_string(), true).await,
        };

        // Step 4: provider call
        let result = self
            .provider
            .transcribe(AudioInput::Stream(reader), &self.config.options)
            .await;

        match result {
            Ok(transcript) => {
                // Step 5: persist results and flip both rows to completed
                let outcome = CompletedTranscript {
                    speakers: transcript.speaker_count(),
                    language: transcript.language.clone(),
                    model_id: Some(self.config.options.model_id.clone()),
                    text: transcript.text,
                    segments: transcript.segments,
                    processing_time_ms: transcript.processing_time_ms,
                };

                match self
                    .status
                    .mark_completed(job.recording_id, job.transcription_id, outcome)
                    .await
                {
                    Ok(()) => JobOutcome::Completed,
                    Err(e) => JobOutcome::Failed {
                        error: e.to_string(),
                        retryable: !is_missing_row(&e),
                    },
                }
            }
            // Step 6: persist the failure, then let the queue decide on retry
            Err(e) => self.fail(job, e.to_string(), true).await,
        }
    }

    /// Persist the failed status pair, then report the outcome. A failure is
    /// never swallowed without a status update first.
    async fn fail(&self, job: &TranscribeJob, error: String, retryable: bool) -> JobOutcome {
        if let Err(e) = self
            .status
            .mark_failed(job.recording_id, job.transcription_id, &error)
            .await
        {
            // The rows may be gone entirely; nothing left to record on them
            warn!(
                "Could not persist failure for recording {}: {}",
                job.recording_id, e
            );
        }

        JobOutcome::Failed { error, retryable }
    }
}

/// Row-level misses cannot be fixed by retrying the job.
fn is_missing_row(e: &RepoError) -> bool {
    matches!(
        e,
        RepoError::RecordingNotFound(_)
            | RepoError::TranscriptionNotFound(_)
            | RepoError::TranscriptionMissingForRecording(_)
    )
}
