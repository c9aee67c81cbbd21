//! End-to-end pipeline tests: ingest -> dedup -> dispatch -> worker ->
//! terminal status, exercised against the real catalog, file store and queue
//! with the deterministic mock provider.

use std::sync::Arc;
use std::time::Duration;

use callscribe::dispatch::{DispatchError, TranscriptionDispatcher};
use callscribe::domain::{RecordingStatus, TranscribeJob, TranscriptionStatus};
use callscribe::ingest::{IngestError, IngestService, IngestSource};
use callscribe::provider::mock::{MockSpeechToText, MOCK_TEXT};
use callscribe::queue::{JobQueue, QueueConfig};
use callscribe::repo::sled::SledCatalog;
use callscribe::repo::{RecordingFilter, RecordingStore, TranscriptionStore};
use callscribe::store::local::LocalFileStore;
use callscribe::worker::{TranscriptionWorker, WorkerConfig};
use tempfile::TempDir;

struct Pipeline {
    _temp_dir: TempDir,
    catalog: Arc<SledCatalog>,
    store: Arc<LocalFileStore>,
    queue: JobQueue<TranscribeJob>,
    mock: Arc<MockSpeechToText>,
    ingest: IngestService,
    dispatcher: TranscriptionDispatcher,
    worker: TranscriptionWorker,
}

fn pipeline() -> Pipeline {
    let temp_dir = TempDir::new().unwrap();
    let catalog = Arc::new(SledCatalog::open_temp().unwrap());
    let store = Arc::new(
        LocalFileStore::new(temp_dir.path().join("uploads"), "http://localhost:3000").unwrap(),
    );
    let queue: JobQueue<TranscribeJob> = JobQueue::open_temp_with_config(QueueConfig {
        max_attempts: 3,
        base_delay: Duration::from_millis(5),
        ..QueueConfig::default()
    })
    .unwrap();
    let mock = Arc::new(MockSpeechToText::with_delay(Duration::from_millis(1)));

    let ingest = IngestService::new(store.clone(), catalog.clone());
    let dispatcher =
        TranscriptionDispatcher::new(catalog.clone(), catalog.clone(), queue.clone());
    let worker = TranscriptionWorker::new(
        queue.clone(),
        catalog.clone(),
        catalog.clone(),
        store.clone(),
        mock.clone(),
        WorkerConfig::default(),
    );

    Pipeline {
        _temp_dir: temp_dir,
        catalog,
        store,
        queue,
        mock,
        ingest,
        dispatcher,
        worker,
    }
}

/// Drain the queue until it is idle, waiting out retry backoffs.
async fn drain(p: &Pipeline) {
    loop {
        if p.worker.run_once().await.unwrap() {
            continue;
        }
        let depth = p.queue.depth().await.unwrap();
        if depth.ready == 0 && depth.inflight == 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Assert the lock-step invariant: the pair is either both completed or both
/// failed, never split.
async fn assert_lock_step(p: &Pipeline, recording_id: uuid::Uuid) {
    let recording = p.catalog.find_by_id(recording_id).await.unwrap().unwrap();
    let transcription = p
        .catalog
        .find_by_recording_id(recording_id)
        .await
        .unwrap()
        .unwrap();

    match recording.status {
        RecordingStatus::Completed => {
            assert_eq!(transcription.status, TranscriptionStatus::Completed);
            assert!(transcription.error.is_none());
        }
        RecordingStatus::FailedTranscription => {
            assert_eq!(transcription.status, TranscriptionStatus::Failed);
            assert!(transcription.error.is_some());
        }
        RecordingStatus::Transcribing => {
            assert_eq!(transcription.status, TranscriptionStatus::InProgress)
        }
        RecordingStatus::PendingTranscription => {
            assert_eq!(transcription.status, TranscriptionStatus::Pending)
        }
        other => panic!("unexpected recording status {other:?}"),
    }
}

// Scenario A: upload, transcribe via the mock provider, end completed with
// the mock's fixed text and segments.
#[tokio::test]
async fn upload_and_transcribe_to_completion() {
    let p = pipeline();

    let recording = p
        .ingest
        .ingest(
            "a.mp3",
            IngestSource::Upload {
                bytes: vec![0xA5; 500],
            },
        )
        .await
        .unwrap();
    assert_eq!(recording.status, RecordingStatus::Uploaded);
    assert_eq!(recording.filesize, 500);

    p.dispatcher.request(recording.id).await.unwrap();
    drain(&p).await;

    let recording = p.catalog.find_by_id(recording.id).await.unwrap().unwrap();
    let transcription = p
        .catalog
        .find_by_recording_id(recording.id)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(recording.status, RecordingStatus::Completed);
    assert_eq!(transcription.status, TranscriptionStatus::Completed);
    assert_eq!(transcription.text.as_deref(), Some(MOCK_TEXT));
    assert_eq!(transcription.segments.len(), 2);
    assert_eq!(transcription.speakers, 2);
    assert!(transcription.processing_time_ms.is_some());
    assert_lock_step(&p, recording.id).await;
}

// Scenario B: identical bytes are rejected before any storage write.
#[tokio::test]
async fn duplicate_upload_is_rejected() {
    let p = pipeline();
    let bytes = vec![0x42; 1000];

    let first = p
        .ingest
        .ingest("original.mp3", IngestSource::Upload { bytes: bytes.clone() })
        .await
        .unwrap();

    let err = p
        .ingest
        .ingest("copy.mp3", IngestSource::Upload { bytes })
        .await
        .unwrap_err();

    match err {
        IngestError::DuplicateContent { existing } => assert_eq!(existing.id, first.id),
        other => panic!("expected DuplicateContent, got {other:?}"),
    }

    // Recording count unchanged, no second object stored
    let page = p
        .catalog
        .find_all(&RecordingFilter::default(), 1, 100)
        .await
        .unwrap();
    assert_eq!(page.total, 1);

    let stored = std::fs::read_dir(p.store.base_dir()).unwrap().count();
    assert_eq!(stored, 1);
}

// Scenario C: provider rejects with 401; the pair ends failed with the
// status in the persisted error, and the exhausted job is dead-lettered.
#[tokio::test]
async fn provider_error_marks_pair_failed() {
    let p = pipeline();
    p.mock.fail_with_status(401, "invalid api key");

    let recording = p
        .ingest
        .ingest("a.mp3", IngestSource::Upload { bytes: vec![1; 100] })
        .await
        .unwrap();
    p.dispatcher.request(recording.id).await.unwrap();

    drain(&p).await;

    let recording = p.catalog.find_by_id(recording.id).await.unwrap().unwrap();
    let transcription = p
        .catalog
        .find_by_recording_id(recording.id)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(recording.status, RecordingStatus::FailedTranscription);
    assert_eq!(transcription.status, TranscriptionStatus::Failed);
    assert!(transcription.error.unwrap().contains("error (401)"));
    assert_lock_step(&p, recording.id).await;

    // Three attempts, then the dead set
    assert_eq!(p.mock.calls(), 3);
    let dead = p.queue.dead_jobs().await.unwrap();
    assert_eq!(dead.len(), 1);
    assert_eq!(dead[0].attempt, 3);
}

// Scenario D: the stored object is gone; the worker fails the pair without
// ever calling the provider and does not retry.
#[tokio::test]
async fn missing_audio_fails_without_provider_call() {
    let p = pipeline();

    let recording = p
        .ingest
        .ingest("a.mp3", IngestSource::Upload { bytes: vec![2; 100] })
        .await
        .unwrap();

    let name = recording.locator.strip_prefix("/uploads/").unwrap();
    std::fs::remove_file(p.store.base_dir().join(name)).unwrap();

    p.dispatcher.request(recording.id).await.unwrap();
    drain(&p).await;

    let recording = p.catalog.find_by_id(recording.id).await.unwrap().unwrap();
    assert_eq!(recording.status, RecordingStatus::FailedTranscription);
    assert_eq!(p.mock.calls(), 0);
    assert_lock_step(&p, recording.id).await;

    // Non-retryable: one delivery, straight to the dead set
    let dead = p.queue.dead_jobs().await.unwrap();
    assert_eq!(dead.len(), 1);
}

// At-least-once idempotence: processing the same payload again after a
// failure converges to one terminal state without duplicating segments.
#[tokio::test]
async fn redelivery_converges_without_duplicating_segments() {
    let p = pipeline();

    let recording = p
        .ingest
        .ingest("a.mp3", IngestSource::Upload { bytes: vec![3; 100] })
        .await
        .unwrap();
    let (_, transcription) = p.dispatcher.request(recording.id).await.unwrap();

    // First delivery fails
    p.mock.fail_with_status(500, "hiccup");
    assert!(p.worker.run_once().await.unwrap());
    assert_lock_step(&p, recording.id).await;

    // Redelivery of the same payload succeeds
    p.mock.succeed();
    tokio::time::sleep(Duration::from_millis(10)).await;
    drain(&p).await;

    let after_first = p
        .catalog
        .find_by_recording_id(recording.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after_first.status, TranscriptionStatus::Completed);
    assert_eq!(after_first.segments.len(), 2);
    assert!(after_first.error.is_none());

    // A human-triggered retry of the completed recording re-runs the whole
    // job; segments are overwritten, not appended
    p.dispatcher.request(recording.id).await.unwrap();
    drain(&p).await;

    let after_retry = p
        .catalog
        .find_by_recording_id(recording.id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(after_retry.status, TranscriptionStatus::Completed);
    assert_eq!(after_retry.segments.len(), 2);
    assert_eq!(after_retry.id, transcription.id);
    assert_lock_step(&p, recording.id).await;
}

// A second transcription request while one is in flight is rejected; after
// the terminal state it is allowed again.
#[tokio::test]
async fn in_flight_request_is_rejected_then_retry_allowed() {
    let p = pipeline();

    let recording = p
        .ingest
        .ingest("a.mp3", IngestSource::Upload { bytes: vec![4; 100] })
        .await
        .unwrap();

    p.dispatcher.request(recording.id).await.unwrap();
    let err = p.dispatcher.request(recording.id).await.unwrap_err();
    assert!(matches!(err, DispatchError::AlreadyInFlight { .. }));

    drain(&p).await;

    // Terminal now; a retry request is accepted
    p.dispatcher.request(recording.id).await.unwrap();
    drain(&p).await;

    let recording = p.catalog.find_by_id(recording.id).await.unwrap().unwrap();
    assert_eq!(recording.status, RecordingStatus::Completed);
}

// Distinct payloads hash apart and both ingest.
#[tokio::test]
async fn distinct_payloads_all_ingest() {
    let p = pipeline();

    let mut hashes = std::collections::HashSet::new();
    for i in 0u8..10 {
        let recording = p
            .ingest
            .ingest(
                &format!("clip-{i}.mp3"),
                IngestSource::Upload {
                    bytes: vec![i; 64],
                },
            )
            .await
            .unwrap();
        hashes.insert(recording.content_hash.unwrap());
    }

    assert_eq!(hashes.len(), 10);
    let page = p
        .catalog
        .find_all(&RecordingFilter::default(), 1, 100)
        .await
        .unwrap();
    assert_eq!(page.total, 10);
}

// Several recordings flow through the queue independently.
#[tokio::test]
async fn multiple_recordings_complete_independently() {
    let p = pipeline();

    let mut ids = Vec::new();
    for i in 0u8..4 {
        let recording = p
            .ingest
            .ingest(
                &format!("call-{i}.mp3"),
                IngestSource::Upload {
                    bytes: vec![0x10 + i; 256],
                },
            )
            .await
            .unwrap();
        p.dispatcher.request(recording.id).await.unwrap();
        ids.push(recording.id);
    }

    drain(&p).await;

    for id in ids {
        let recording = p.catalog.find_by_id(id).await.unwrap().unwrap();
        assert_eq!(recording.status, RecordingStatus::Completed);
        assert_lock_step(&p, id).await;
    }

    let stats = p.worker.stats().await;
    assert_eq!(stats.succeeded, 4);
    assert_eq!(stats.processed, 4);
}
