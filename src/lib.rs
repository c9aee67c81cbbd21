//! Callscribe - recording ingestion and asynchronous transcription
//!
//! This crate ingests uploaded audio recordings, deduplicates them by content
//! hash, stores the raw bytes, and transcribes them out-of-band through an
//! external speech-to-text API. It features:
//!
//! - SHA-256 content-hash deduplication at ingestion time
//! - A sled-backed catalog of recordings and transcriptions with lock-step
//!   status updates applied transactionally
//! - A durable, at-least-once job queue with exponential retry backoff and
//!   dead-lettering
//! - A long-running worker that drives the transcription state machine
//! - Interchangeable local-disk and remote-object file stores
//!
//! # Example
//!
//! ```no_run
//! use callscribe::{
//!     dispatch::TranscriptionDispatcher,
//!     domain::TranscribeJob,
//!     ingest::{IngestService, IngestSource},
//!     provider::mock::MockSpeechToText,
//!     queue::JobQueue,
//!     repo::sled::SledCatalog,
//!     store::local::LocalFileStore,
//!     worker::{TranscriptionWorker, WorkerConfig},
//! };
//! use std::sync::Arc;
//!
//! # #[tokio::main]
//! # async fn main() -> anyhow::Result<()> {
//! let catalog = Arc::new(SledCatalog::open_temp()?);
//! let store = Arc::new(LocalFileStore::new("/tmp/callscribe/uploads", "http://localhost:3000")?);
//! let queue: JobQueue<TranscribeJob> = JobQueue::open_temp()?;
//!
//! let ingest = IngestService::new(store.clone(), catalog.clone());
//! let recording = ingest
//!     .ingest("a.mp3", IngestSource::Upload { bytes: vec![0u8; 500] })
//!     .await?;
//!
//! let dispatcher = TranscriptionDispatcher::new(catalog.clone(), catalog.clone(), queue.clone());
//! dispatcher.request(recording.id).await?;
//!
//! let worker = TranscriptionWorker::new(
//!     queue,
//!     catalog.clone(),
//!     catalog,
//!     store,
//!     Arc::new(MockSpeechToText::default()),
//!     WorkerConfig::default(),
//! );
//! worker.run_once().await?;
//! # Ok(())
//! # }
//! ```

pub mod dispatch;
pub mod domain;
pub mod hash;
pub mod ingest;
pub mod provider;
pub mod queue;
pub mod repo;
pub mod store;
pub mod worker;

// Re-export commonly used types for convenience
pub use dispatch::{DispatchError, TranscriptionDispatcher};
pub use domain::{
    Recording, RecordingSource, RecordingStatus, TranscribeJob, Transcription,
    TranscriptionStatus, TranscriptSegment,
};
pub use ingest::{DuplicateCheck, IngestError, IngestService, IngestSource};
pub use provider::{ProviderError, SpeechToText, TranscribeOptions};
pub use queue::{JobQueue, QueueConfig, QueueError};
pub use repo::{RecordingStore, RepoError, StatusStore, TranscriptionStore};
pub use store::{FileStore, StoreError};
pub use worker::{TranscriptionWorker, WorkerConfig, WorkerStats};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
