use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{error, info, warn};
use uuid::Uuid;

use callscribe::{
    dispatch::TranscriptionDispatcher,
    domain::TranscribeJob,
    ingest::{IngestService, IngestSource},
    provider::{ElevenLabsProvider, MockSpeechToText, SpeechToText, TranscribeOptions},
    queue::{JobQueue, QueueConfig},
    repo::{sled::SledCatalog, RecordingFilter, RecordingStore, TranscriptionStore},
    store::{local::LocalFileStore, FileStore},
    worker::{TranscriptionWorker, WorkerConfig},
};

#[derive(Parser)]
#[command(name = "callscribe")]
#[command(about = "Recording ingestion and asynchronous transcription service")]
#[command(version = env!("CARGO_PKG_VERSION"))]
struct Args {
    /// Data directory holding the catalog, queue and uploaded files
    #[arg(long, default_value = "./callscribe-data")]
    data_dir: PathBuf,

    /// Public base URL used when rendering download links
    #[arg(long, default_value = "http://localhost:3000")]
    base_url: String,

    /// Log level
    #[arg(long, value_enum, default_value = "info")]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the transcription worker service
    Serve {
        /// Number of concurrent worker consumers
        #[arg(long, default_value = "1")]
        concurrency: usize,

        /// Queue poll interval in milliseconds
        #[arg(long, default_value = "250")]
        poll_interval: u64,

        /// Delivery attempts before a job is dead-lettered
        #[arg(long, default_value = "3")]
        max_attempts: u32,

        /// Base retry backoff in seconds (doubles per attempt)
        #[arg(long, default_value = "5")]
        retry_base: u64,

        /// Speech-to-text provider
        #[arg(long, value_enum, default_value = "elevenlabs")]
        provider: ProviderKind,

        /// Transcription language hint
        #[arg(long, default_value = "en")]
        language: String,

        /// Provider model id
        #[arg(long, default_value = "scribe_v1")]
        model_id: String,

        /// Disable speaker diarization
        #[arg(long)]
        no_diarize: bool,
    },

    /// Ingest an audio file from disk
    Ingest {
        /// Path to the audio file
        file: PathBuf,

        /// Override the stored filename (defaults to the file's name)
        #[arg(long)]
        filename: Option<String>,
    },

    /// Register a recording that already lives in remote object storage
    Import {
        /// Remote object key
        remote_key: String,

        /// Filename to record for the import
        #[arg(long)]
        filename: String,
    },

    /// Request (or retry) transcription of a recording
    Transcribe {
        recording_id: Uuid,
    },

    /// Show a recording with its transcription
    Status {
        recording_id: Uuid,
    },

    /// List recordings
    List {
        /// Filename substring filter
        #[arg(long)]
        query: Option<String>,

        #[arg(long, default_value = "1")]
        page: u64,

        #[arg(long, default_value = "20")]
        limit: u64,
    },

    /// Check whether a file's content was already ingested
    CheckDuplicate {
        file: PathBuf,
    },
}

#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, ValueEnum, Debug)]
enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for tracing::Level {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => tracing::Level::TRACE,
            LogLevel::Debug => tracing::Level::DEBUG,
            LogLevel::Info => tracing::Level::INFO,
            LogLevel::Warn => tracing::Level::WARN,
            LogLevel::Error => tracing::Level::ERROR,
        }
    }
}

#[derive(Copy, Clone, PartialEq, Eq, ValueEnum, Debug)]
enum ProviderKind {
    /// Deterministic offline mock
    Mock,
    /// ElevenLabs speech-to-text (requires ELEVENLABS_API_KEY)
    Elevenlabs,
}

/// Shared components, wired from the data directory.
struct Components {
    catalog: Arc<SledCatalog>,
    store: Arc<LocalFileStore>,
}

impl Components {
    fn open(args: &Args) -> Result<Self> {
        let catalog = Arc::new(
            SledCatalog::open(args.data_dir.join("catalog"))
                .context("Failed to open catalog")?,
        );
        let store = Arc::new(
            LocalFileStore::new(args.data_dir.join("uploads"), args.base_url.as_str())
                .context("Failed to open file store")?,
        );
        Ok(Self { catalog, store })
    }
}

fn open_queue(args: &Args, config: QueueConfig) -> Result<JobQueue<TranscribeJob>> {
    JobQueue::open_with_config(args.data_dir.join("queue"), config)
        .context("Failed to open job queue")
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let log_level: tracing::Level = args.log_level.into();
    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_target(false)
        .init();

    match &args.command {
        Command::Serve {
            concurrency,
            poll_interval,
            max_attempts,
            retry_base,
            provider,
            language,
            model_id,
            no_diarize,
        } => {
            serve(
                &args,
                *concurrency,
                *poll_interval,
                *max_attempts,
                *retry_base,
                *provider,
                TranscribeOptions {
                    language: language.clone(),
                    model_id: model_id.clone(),
                    diarize: !no_diarize,
                },
            )
            .await
        }
        Command::Ingest { file, filename } => ingest_file(&args, file, filename.clone()).await,
        Command::Import {
            remote_key,
            filename,
        } => import_remote(&args, remote_key, filename).await,
        Command::Transcribe { recording_id } => transcribe(&args, *recording_id).await,
        Command::Status { recording_id } => status(&args, *recording_id).await,
        Command::List { query, page, limit } => list(&args, query.clone(), *page, *limit).await,
        Command::CheckDuplicate { file } => check_duplicate(&args, file).await,
    }
}

#[allow(clippy::too_many_arguments)]
async fn serve(
    args: &Args,
    concurrency: usize,
    poll_interval: u64,
    max_attempts: u32,
    retry_base: u64,
    provider_kind: ProviderKind,
    options: TranscribeOptions,
) -> Result<()> {
    info!("Starting callscribe v{}", callscribe::VERSION);
    info!("Configuration:");
    info!("  Data dir: {}", args.data_dir.display());
    info!("  Concurrency: {}", concurrency);
    info!("  Provider: {:?}", provider_kind);
    info!("  Max attempts: {}", max_attempts);

    let components = Components::open(args)?;
    let queue = open_queue(
        args,
        QueueConfig {
            max_attempts,
            base_delay: Duration::from_secs(retry_base),
            ..QueueConfig::default()
        },
    )?;

    let provider: Arc<dyn SpeechToText> = match provider_kind {
        ProviderKind::Mock => Arc::new(MockSpeechToText::default()),
        ProviderKind::Elevenlabs => Arc::new(
            ElevenLabsProvider::from_env().context("Failed to construct ElevenLabs provider")?,
        ),
    };

    let worker = TranscriptionWorker::new(
        queue.clone(),
        components.catalog.clone(),
        components.catalog.clone(),
        components.store.clone(),
        provider,
        WorkerConfig {
            poll_interval: Duration::from_millis(poll_interval),
            options,
            ..WorkerConfig::default()
        },
    );

    let (shutdown_tx, _) = broadcast::channel(1);

    let mut handles = Vec::new();
    for _ in 0..concurrency.max(1) {
        handles.push(tokio::spawn(
            worker.clone().run(shutdown_tx.subscribe()),
        ));
    }

    // Periodic stats and retention pruning
    let stats_handle = {
        let queue = queue.clone();
        let worker = worker.clone();
        let mut shutdown_rx = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let mut ticker = interval(Duration::from_secs(60));
            ticker.tick().await; // first tick is immediate
            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => break,
                    _ = ticker.tick() => {
                        match queue.depth().await {
                            Ok(depth) => info!("Queue: {}; worker: {}", depth, worker.stats().await),
                            Err(e) => error!("Failed to read queue depth: {}", e),
                        }
                        if let Err(e) = queue.prune().await {
                            error!("Failed to prune queue: {}", e);
                        }
                    }
                }
            }
        })
    };

    info!("Service started; waiting for jobs");

    tokio::select! {
        _ = signal::ctrl_c() => info!("Received Ctrl+C signal"),
        _ = wait_for_term_signal() => info!("Received TERM signal"),
    }

    let _ = shutdown_tx.send(());
    for handle in handles {
        let _ = handle.await;
    }
    let _ = stats_handle.await;

    queue.flush().await?;
    components.catalog.flush().await?;
    info!("Service stopped");
    Ok(())
}

async fn ingest_file(args: &Args, file: &PathBuf, filename: Option<String>) -> Result<()> {
    let components = Components::open(args)?;
    let ingest = IngestService::new(components.store.clone(), components.catalog.clone());

    let bytes = tokio::fs::read(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let filename = filename.unwrap_or_else(|| {
        file.file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "unnamed".to_string())
    });

    let recording = ingest
        .ingest(&filename, IngestSource::Upload { bytes })
        .await?;
    components.catalog.flush().await?;

    println!("{}", serde_json::to_string_pretty(&recording)?);
    Ok(())
}

async fn import_remote(args: &Args, remote_key: &str, filename: &str) -> Result<()> {
    let components = Components::open(args)?;
    let ingest = IngestService::new(components.store.clone(), components.catalog.clone());

    let recording = ingest
        .ingest(
            filename,
            IngestSource::RemoteImport {
                remote_key: remote_key.to_string(),
            },
        )
        .await?;
    components.catalog.flush().await?;

    println!("{}", serde_json::to_string_pretty(&recording)?);
    Ok(())
}

async fn transcribe(args: &Args, recording_id: Uuid) -> Result<()> {
    let components = Components::open(args)?;
    let queue = open_queue(args, QueueConfig::default())?;
    let dispatcher = TranscriptionDispatcher::new(
        components.catalog.clone(),
        components.catalog.clone(),
        queue.clone(),
    );

    let (recording, transcription) = dispatcher.request(recording_id).await?;
    queue.flush().await?;
    components.catalog.flush().await?;

    info!(
        "Transcription requested for {} ({})",
        recording.id, recording.filename
    );
    println!("{}", serde_json::to_string_pretty(&transcription)?);
    Ok(())
}

async fn status(args: &Args, recording_id: Uuid) -> Result<()> {
    let components = Components::open(args)?;

    let recording = components
        .catalog
        .find_by_id(recording_id)
        .await?
        .with_context(|| format!("Recording {recording_id} not found"))?;
    let transcription = components
        .catalog
        .find_by_recording_id(recording_id)
        .await?;

    let output = serde_json::json!({
        "recording": recording,
        "transcription": transcription,
        "download_url": components.store.url_for(&recording.locator),
    });
    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn list(args: &Args, query: Option<String>, page: u64, limit: u64) -> Result<()> {
    let components = Components::open(args)?;

    let filter = RecordingFilter {
        query,
        ..Default::default()
    };
    let results = components.catalog.find_all(&filter, page, limit).await?;

    info!(
        "Showing page {} of {} matching recordings",
        results.page, results.total
    );
    println!("{}", serde_json::to_string_pretty(&results.items)?);
    Ok(())
}

async fn check_duplicate(args: &Args, file: &PathBuf) -> Result<()> {
    let components = Components::open(args)?;
    let ingest = IngestService::new(components.store.clone(), components.catalog.clone());

    let bytes = tokio::fs::read(file)
        .await
        .with_context(|| format!("Failed to read {}", file.display()))?;
    let hash = callscribe::hash::content_hash(&bytes);

    let check = ingest.check_duplicate(&hash).await?;
    if check.duplicate {
        warn!("Content already ingested");
    }
    println!("{}", serde_json::to_string_pretty(&check)?);
    Ok(())
}

/// Wait for TERM signal (Unix only)
#[cfg(unix)]
async fn wait_for_term_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    if let Ok(mut stream) = signal(SignalKind::terminate()) {
        stream.recv().await;
    }
}

#[cfg(not(unix))]
async fn wait_for_term_signal() {
    futures::future::pending::<()>().await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parsing() {
        let args = Args::parse_from([
            "callscribe",
            "--data-dir",
            "/tmp/cs-data",
            "--log-level",
            "debug",
            "serve",
            "--concurrency",
            "2",
            "--provider",
            "mock",
        ]);

        assert_eq!(args.data_dir, PathBuf::from("/tmp/cs-data"));
        assert!(matches!(args.log_level, LogLevel::Debug));
        match args.command {
            Command::Serve {
                concurrency,
                provider,
                ..
            } => {
                assert_eq!(concurrency, 2);
                assert_eq!(provider, ProviderKind::Mock);
            }
            _ => panic!("expected serve command"),
        }
    }

    #[test]
    fn test_transcribe_args_require_uuid() {
        let result = Args::try_parse_from(["callscribe", "transcribe", "not-a-uuid"]);
        assert!(result.is_err());

        let id = Uuid::new_v4();
        let args = Args::parse_from(["callscribe", "transcribe", &id.to_string()]);
        match args.command {
            Command::Transcribe { recording_id } => assert_eq!(recording_id, id),
            _ => panic!("expected transcribe command"),
        }
    }
}
