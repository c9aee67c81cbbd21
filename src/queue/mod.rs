use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::marker::PhantomData;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use ::sled::transaction::TransactionError;
use ::sled::{Db, Transactional, Tree};

/// Errors from queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("queue backend error: {0}")]
    Backend(String),

    #[error("failed to encode job: {0}")]
    Encode(String),

    #[error("failed to decode job: {0}")]
    Decode(String),
}

/// Retry and retention policy for a queue.
#[derive(Debug, Clone)]
pub struct QueueConfig {
    /// Total delivery attempts before a job is dead-lettered
    pub max_attempts: u32,
    /// Backoff before the second attempt; doubles per attempt after that
    pub base_delay: Duration,
    /// How long completed jobs are kept for observability
    pub done_retention: Duration,
    /// How long dead-lettered jobs are kept for inspection
    pub dead_retention: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(5),
            done_retention: Duration::from_secs(24 * 3600),
            dead_retention: Duration::from_secs(7 * 24 * 3600),
        }
    }
}

/// A job and its delivery bookkeeping, as stored in the queue trees.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEnvelope<T> {
    pub job_id: Uuid,
    /// Job name; consumers dispatch on it and reject names they do not know
    pub name: String,
    pub payload: T,
    /// Completed delivery attempts
    pub attempt: u32,
    pub enqueued_at: DateTime<Utc>,
    /// Earliest instant the job may be delivered (moved forward by backoff)
    pub not_before: DateTime<Utc>,
    pub last_error: Option<String>,
}

/// One delivered job. Hand it back via `ack`, `nack` or `bury`.
#[derive(Debug, Clone)]
pub struct Delivery<T> {
    seq: u64,
    pub envelope: JobEnvelope<T>,
}

/// What `nack` decided to do with the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NackOutcome {
    /// Scheduled for another attempt after backoff
    Retry {
        attempt: u32,
        next_attempt_at: DateTime<Utc>,
    },
    /// Attempt cap exhausted; parked in the dead set
    DeadLettered,
}

/// Current depth of each queue set.
#[derive(Debug, Clone, Default)]
pub struct QueueDepth {
    pub ready: usize,
    pub inflight: usize,
    pub done: usize,
    pub dead: usize,
}

impl std::fmt::Display for QueueDepth {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "ready={}, inflight={}, done={}, dead={}",
            self.ready, self.inflight, self.done, self.dead
        )
    }
}

/// Durable at-least-once job queue backed by Sled.
///
/// Trees:
/// - `ready`: sequence -> envelope, FIFO by sequence, gated by `not_before`
/// - `inflight`: delivered but not yet acked; recovered back to `ready` on open
/// - `done`: acked jobs, keyed by completion time for pruning
/// - `dead`: jobs past the attempt cap, keyed by failure time
///
/// Failed deliveries are retried with exponential backoff until the attempt
/// cap, then dead-lettered. A crash between delivery and ack re-delivers the
/// job on the next open, which is the at-least-once contract consumers must
/// be idempotent against.
#[derive(Clone)]
pub struct JobQueue<T> {
    db: Db,
    ready: Tree,
    inflight: Tree,
    done: Tree,
    dead: Tree,
    counter: Arc<AtomicU64>,
    config: QueueConfig,
    _phantom: PhantomData<T>,
}

fn seq_key(seq: u64) -> [u8; 8] {
    seq.to_be_bytes()
}

/// Key for the done/dead sets: completion millis then sequence, so the trees
/// iterate oldest-first for pruning.
fn timed_key(at: DateTime<Utc>, seq: u64) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&(at.timestamp_millis().max(0) as u64).to_be_bytes());
    key[8..].copy_from_slice(&seq.to_be_bytes());
    key
}

fn backend(e: ::sled::Error) -> QueueError {
    QueueError::Backend(e.to_string())
}

fn unwrap_tx<A>(result: Result<A, TransactionError<QueueError>>) -> Result<A, QueueError> {
    result.map_err(|e| match e {
        TransactionError::Abort(e) => e,
        TransactionError::Storage(e) => backend(e),
    })
}

impl<T> JobQueue<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync,
{
    /// Open (or create) a queue at the specified path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, QueueError> {
        Self::open_with_config(path, QueueConfig::default())
    }

    pub fn open_with_config<P: AsRef<Path>>(
        path: P,
        config: QueueConfig,
    ) -> Result<Self, QueueError> {
        let db = ::sled::open(&path).map_err(backend)?;
        info!("Opened job queue at {}", path.as_ref().display());
        Self::from_db(db, config)
    }

    /// Open an in-memory queue (useful for testing).
    pub fn open_temp() -> Result<Self, QueueError> {
        Self::open_temp_with_config(QueueConfig::default())
    }

    pub fn open_temp_with_config(config: QueueConfig) -> Result<Self, QueueError> {
        let db = ::sled::Config::new()
            .temporary(true)
            .open()
            .map_err(backend)?;
        Self::from_db(db, config)
    }

    fn from_db(db: Db, config: QueueConfig) -> Result<Self, QueueError> {
        let ready = db.open_tree("ready").map_err(backend)?;
        let inflight = db.open_tree("inflight").map_err(backend)?;
        let done = db.open_tree("done").map_err(backend)?;
        let dead = db.open_tree("dead").map_err(backend)?;

        // Resume the sequence after the highest key still in circulation
        let mut next_seq = 0u64;
        for tree in [&ready, &inflight] {
            if let Some((key, _)) = tree.last().map_err(backend)? {
                let bytes: [u8; 8] = key
                    .as_ref()
                    .try_into()
                    .map_err(|_| QueueError::Decode("invalid sequence key".to_string()))?;
                next_seq = next_seq.max(u64::from_be_bytes(bytes) + 1);
            }
        }

        let queue = Self {
            db,
            ready,
            inflight,
            done,
            dead,
            counter: Arc::new(AtomicU64::new(next_seq)),
            config,
            _phantom: PhantomData,
        };

        let recovered = queue.recover_inflight()?;
        if recovered > 0 {
            warn!("Recovered {} in-flight jobs back to ready", recovered);
        }

        Ok(queue)
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Move any jobs that were delivered but never acked back into the ready
    /// set. Runs at open; at-least-once delivery comes from here.
    fn recover_inflight(&self) -> Result<usize, QueueError> {
        let mut recovered = 0;
        loop {
            let Some((key, value)) = self.inflight.first().map_err(backend)? else {
                break;
            };

            let result = (&self.inflight, &self.ready).transaction(|(inflight, ready)| {
                if inflight.remove(key.to_vec())?.is_some() {
                    ready.insert(key.to_vec(), value.to_vec())?;
                }
                Ok(())
            });
            unwrap_tx(result)?;
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Enqueue a named job for delivery, returning its id.
    pub async fn enqueue(&self, name: &str, payload: &T) -> Result<Uuid, QueueError> {
        let now = Utc::now();
        let envelope = JobEnvelope {
            job_id: Uuid::new_v4(),
            name: name.to_string(),
            payload: payload.clone(),
            attempt: 0,
            enqueued_at: now,
            not_before: now,
            last_error: None,
        };

        let bytes = rmp_serde::to_vec(&envelope).map_err(|e| QueueError::Encode(e.to_string()))?;
        let seq = self.counter.fetch_add(1, Ordering::SeqCst);
        self.ready
            .insert(seq_key(seq).to_vec(), bytes)
            .map_err(backend)?;

        debug!("Enqueued job {} ({}) at sequence {}", envelope.job_id, name, seq);
        Ok(envelope.job_id)
    }

    /// Deliver the oldest ready job whose backoff window has passed. The job
    /// moves to the in-flight set until acked or nacked.
    pub async fn dequeue(&self) -> Result<Option<Delivery<T>>, QueueError> {
        let now = Utc::now();

        for entry in self.ready.iter() {
            let (key, value) = entry.map_err(backend)?;
            let envelope: JobEnvelope<T> =
                rmp_serde::from_slice(&value).map_err(|e| QueueError::Decode(e.to_string()))?;

            if envelope.not_before > now {
                continue;
            }

            let claimed = {
                let result =
                    (&self.ready, &self.inflight).transaction(|(ready, inflight)| {
                        if ready.remove(key.to_vec())?.is_some() {
                            inflight.insert(key.to_vec(), value.to_vec())?;
                            Ok(true)
                        } else {
                            // Another consumer claimed it between the scan
                            // and this transaction
                            Ok(false)
                        }
                    });
                unwrap_tx(result)?
            };

            if claimed {
                let bytes: [u8; 8] = key
                    .as_ref()
                    .try_into()
                    .map_err(|_| QueueError::Decode("invalid sequence key".to_string()))?;
                let seq = u64::from_be_bytes(bytes);
                debug!("Delivered job {} (attempt {})", envelope.job_id, envelope.attempt + 1);
                return Ok(Some(Delivery { seq, envelope }));
            }
        }

        Ok(None)
    }

    /// Acknowledge a successfully processed job. It moves to the done set and
    /// is pruned after the retention window.
    pub async fn ack(&self, delivery: &Delivery<T>) -> Result<(), QueueError> {
        let key = seq_key(delivery.seq);
        let done_key = timed_key(Utc::now(), delivery.seq);

        let result = (&self.inflight, &self.done).transaction(|(inflight, done)| {
            if let Some(value) = inflight.remove(key.to_vec())? {
                done.insert(done_key.to_vec(), value)?;
            }
            Ok(())
        });
        unwrap_tx(result)?;

        debug!("Acked job {}", delivery.envelope.job_id);
        Ok(())
    }

    /// Report a failed attempt. Below the attempt cap the job is re-readied
    /// with exponential backoff; at the cap it is dead-lettered.
    pub async fn nack(
        &self,
        delivery: &Delivery<T>,
        error: &str,
    ) -> Result<NackOutcome, QueueError> {
        let attempt = delivery.envelope.attempt + 1;

        if attempt >= self.config.max_attempts {
            self.move_to_dead(delivery, attempt, error)?;
            warn!(
                "Job {} dead-lettered after {} attempts: {}",
                delivery.envelope.job_id, attempt, error
            );
            return Ok(NackOutcome::DeadLettered);
        }

        // 5s, 10s, 20s, ... per additional attempt
        let shift = (attempt - 1).min(20);
        let delay_ms = (self.config.base_delay.as_millis() as u64).saturating_mul(1 << shift);
        let next_attempt_at = Utc::now() + ChronoDuration::milliseconds(delay_ms as i64);

        let mut envelope = delivery.envelope.clone();
        envelope.attempt = attempt;
        envelope.not_before = next_attempt_at;
        envelope.last_error = Some(error.to_string());

        let bytes = rmp_serde::to_vec(&envelope).map_err(|e| QueueError::Encode(e.to_string()))?;
        let key = seq_key(delivery.seq);

        let result = (&self.inflight, &self.ready).transaction(|(inflight, ready)| {
            inflight.remove(key.to_vec())?;
            ready.insert(key.to_vec(), bytes.clone())?;
            Ok(())
        });
        unwrap_tx(result)?;

        debug!(
            "Job {} scheduled for attempt {} at {}",
            envelope.job_id, attempt + 1, next_attempt_at
        );
        Ok(NackOutcome::Retry {
            attempt,
            next_attempt_at,
        })
    }

    /// Park a job in the dead set immediately, skipping remaining attempts.
    /// Used for failures that cannot succeed on retry.
    pub async fn bury(&self, delivery: &Delivery<T>, error: &str) -> Result<(), QueueError> {
        self.move_to_dead(delivery, delivery.envelope.attempt + 1, error)?;
        warn!("Job {} buried: {}", delivery.envelope.job_id, error);
        Ok(())
    }

    fn move_to_dead(
        &self,
        delivery: &Delivery<T>,
        attempt: u32,
        error: &str,
    ) -> Result<(), QueueError> {
        let mut envelope = delivery.envelope.clone();
        envelope.attempt = attempt;
        envelope.last_error = Some(error.to_string());

        let bytes = rmp_serde::to_vec(&envelope).map_err(|e| QueueError::Encode(e.to_string()))?;
        let key = seq_key(delivery.seq);
        let dead_key = timed_key(Utc::now(), delivery.seq);

        let result = (&self.inflight, &self.dead).transaction(|(inflight, dead)| {
            inflight.remove(key.to_vec())?;
            dead.insert(dead_key.to_vec(), bytes.clone())?;
            Ok(())
        });
        unwrap_tx(result)
    }

    /// Drop done and dead entries past their retention windows.
    pub async fn prune(&self) -> Result<(usize, usize), QueueError> {
        let now = Utc::now();
        let done_pruned = prune_tree(
            &self.done,
            now - ChronoDuration::from_std(self.config.done_retention).unwrap_or_default(),
        )?;
        let dead_pruned = prune_tree(
            &self.dead,
            now - ChronoDuration::from_std(self.config.dead_retention).unwrap_or_default(),
        )?;

        if done_pruned > 0 || dead_pruned > 0 {
            debug!("Pruned {} done and {} dead jobs", done_pruned, dead_pruned);
        }
        Ok((done_pruned, dead_pruned))
    }

    /// Envelopes currently parked in the dead set, oldest first.
    pub async fn dead_jobs(&self) -> Result<Vec<JobEnvelope<T>>, QueueError> {
        let mut jobs = Vec::new();
        for entry in self.dead.iter() {
            let (_, value) = entry.map_err(backend)?;
            jobs.push(
                rmp_serde::from_slice(&value).map_err(|e| QueueError::Decode(e.to_string()))?,
            );
        }
        Ok(jobs)
    }

    pub async fn depth(&self) -> Result<QueueDepth, QueueError> {
        Ok(QueueDepth {
            ready: self.ready.len(),
            inflight: self.inflight.len(),
            done: self.done.len(),
            dead: self.dead.len(),
        })
    }

    /// Flush all pending writes to disk.
    pub async fn flush(&self) -> Result<(), QueueError> {
        self.db.flush_async().await.map_err(backend)?;
        Ok(())
    }
}

fn prune_tree(tree: &Tree, cutoff: DateTime<Utc>) -> Result<usize, QueueError> {
    let cutoff_millis = cutoff.timestamp_millis().max(0) as u64;
    let mut pruned = 0;

    for entry in tree.iter() {
        let (key, _) = entry.map_err(backend)?;
        if key.len() < 8 {
            continue;
        }
        let millis = u64::from_be_bytes(key[..8].try_into().unwrap());
        if millis >= cutoff_millis {
            // Keys are time-ordered; everything after this is newer
            break;
        }
        tree.remove(&key).map_err(backend)?;
        pruned += 1;
    }

    Ok(pruned)
}
