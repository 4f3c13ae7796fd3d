//! The worker loop: claim a batch, process it, sweep, sleep, repeat.
//!
//! One worker is one long-lived loop. Horizontal scale comes from running
//! several worker processes against the same store; `FOR UPDATE SKIP LOCKED`
//! claims keep them from stepping on each other. Shutdown is cooperative:
//! a cancellation observed mid-cycle lets the cycle finish, so no lock stamp
//! outlives its worker.

use std::{sync::Arc, time::Duration};

use rand::{distr::Alphanumeric, Rng};
use surety_core::{Clock, RequestId, Storage, StoredRequest};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    error::{DeliveryError, Result},
    processor::{Applied, Processor},
    retry::BackoffPolicy,
    sweeper::SecondGate,
    transport::Transport,
};

/// Sleep applied after a cycle-level error before the next tick.
const ERROR_PENALTY: Duration = Duration::from_secs(5);

/// Claim durations at or above these thresholds indicate contention or a
/// missing index.
const CLAIM_INFO_THRESHOLD: Duration = Duration::from_secs(30);
const CLAIM_WARN_THRESHOLD: Duration = Duration::from_secs(60);
const CLAIM_CRITICAL_THRESHOLD: Duration = Duration::from_secs(80);

/// Configuration for one worker instance.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Rows claimed per cycle.
    pub batch_size: usize,

    /// Minimum cycle period; the loop sleeps whatever the cycle left of it.
    pub tick: Duration,

    /// HTTP transport timeout per attempt.
    pub timeout: Duration,

    /// Attempts counted against a row before it fails.
    pub max_retries: i32,

    /// Backoff curve for deferred rows.
    pub backoff: BackoffPolicy,

    /// Cool-down applied when the processor itself faults on a row.
    pub pause_delay: Duration,

    /// Ping the database at the start of each tick so the pool re-establishes
    /// dropped connections before the claim transaction.
    pub reconnect: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            batch_size: crate::DEFAULT_BATCH_SIZE,
            tick: Duration::from_micros(crate::DEFAULT_TICK_MICROS),
            timeout: Duration::from_secs(crate::DEFAULT_TIMEOUT_SECONDS),
            max_retries: crate::DEFAULT_MAX_RETRIES,
            backoff: BackoffPolicy::default(),
            pause_delay: Duration::from_secs(60),
            reconnect: true,
        }
    }
}

impl WorkerConfig {
    fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(DeliveryError::Configuration {
                message: "batch_size must be greater than 0".to_string(),
            });
        }
        if self.tick.is_zero() {
            return Err(DeliveryError::Configuration {
                message: "tick must be greater than 0".to_string(),
            });
        }
        if self.timeout.is_zero() {
            return Err(DeliveryError::Configuration {
                message: "timeout must be greater than 0".to_string(),
            });
        }
        Ok(())
    }
}

/// Counters a worker accumulates over its lifetime.
#[derive(Debug, Clone, Default)]
pub struct WorkerStats {
    /// Rows claimed across all cycles.
    pub claimed: u64,
    /// Rows that reached a state write this cycle or earlier.
    pub processed: u64,
    /// Rows that reached `completed`.
    pub completed: u64,
    /// Rows that reached `failed`.
    pub failed: u64,
    /// Rows deferred back to `waiting`.
    pub deferred: u64,
    /// Rows paused because the processor faulted.
    pub paused: u64,
    /// Waiting rows promoted by this worker's sweeper.
    pub promoted: u64,
}

/// A single worker instance draining the shared request store.
pub struct Worker {
    storage: Arc<Storage>,
    processor: Processor,
    config: WorkerConfig,
    clock: Arc<dyn Clock>,
    cancellation_token: CancellationToken,
    stats: Arc<RwLock<WorkerStats>>,
    gate: SecondGate,
    tag: String,
}

impl Worker {
    /// Creates a worker over the given store and transport.
    ///
    /// The worker tags every log line with an 8-character random identifier
    /// so interleaved output from multiple instances stays attributable.
    ///
    /// # Errors
    ///
    /// Returns `DeliveryError::Configuration` for impossible configurations.
    pub fn new(
        storage: Arc<Storage>,
        transport: Arc<dyn Transport>,
        config: WorkerConfig,
        cancellation_token: CancellationToken,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;

        let processor = Processor::new(
            storage.clone(),
            transport,
            clock.clone(),
            config.timeout,
            config.max_retries,
            config.backoff.clone(),
        );

        let tag: String =
            rand::rng().sample_iter(&Alphanumeric).take(8).map(char::from).collect();
        let gate = SecondGate::new(clock.now());

        Ok(Self {
            storage,
            processor,
            config,
            clock,
            cancellation_token,
            stats: Arc::new(RwLock::new(WorkerStats::default())),
            gate,
            tag,
        })
    }

    /// This worker's log tag.
    pub fn tag(&self) -> &str {
        &self.tag
    }

    /// Returns a snapshot of the worker's counters.
    pub async fn stats(&self) -> WorkerStats {
        self.stats.read().await.clone()
    }

    /// Main loop: runs cycles until the cancellation token fires.
    ///
    /// A shutdown signal is only observed between cycles; a cycle in
    /// progress runs to completion so every claimed row is written back and
    /// unlocked before the loop exits.
    pub async fn run(&self) {
        info!(
            worker = %self.tag,
            batch_size = self.config.batch_size,
            tick_us = self.config.tick.as_micros(),
            "worker starting"
        );

        loop {
            if self.cancellation_token.is_cancelled() {
                break;
            }

            let started = self.clock.now();

            match self.cycle().await {
                Ok(claimed) => {
                    if claimed > 0 {
                        debug!(worker = %self.tag, claimed, "cycle complete");
                    }
                },
                Err(err) if err.is_claim_failure() => {
                    // Lost the claim race to a concurrent worker; the next
                    // tick will find whatever is still ready.
                    error!(worker = %self.tag, error = %err, "claim lost, skipping cycle");
                },
                Err(err) => {
                    error!(worker = %self.tag, error = %err, "cycle failed");
                    // Penalty sleep keeps a persistent fault from flooding
                    // the log at tick frequency.
                    tokio::select! {
                        () = self.clock.sleep(ERROR_PENALTY) => {},
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
            }

            let elapsed = self.clock.now().saturating_duration_since(started);
            let remainder = self.config.tick.saturating_sub(elapsed);
            if !remainder.is_zero() {
                tokio::select! {
                    () = self.clock.sleep(remainder) => {},
                    () = self.cancellation_token.cancelled() => break,
                }
            }
        }

        let stats = self.stats.read().await.clone();
        info!(
            worker = %self.tag,
            processed = stats.processed,
            completed = stats.completed,
            failed = stats.failed,
            deferred = stats.deferred,
            "worker stopped"
        );
    }

    /// One claim-and-process cycle plus the gated sweeper.
    ///
    /// Public so embedders and tests can drive the engine tick by tick.
    /// Returns the number of rows claimed.
    ///
    /// # Errors
    ///
    /// Returns error on claim or sweep failure; per-row faults are absorbed
    /// by pausing the row and never abort the cycle.
    pub async fn cycle(&self) -> Result<usize> {
        if self.config.reconnect {
            self.storage.health_check().await?;
        }

        let claim_started = self.clock.now();
        let ids = self.storage.requests.claim_ready_batch(self.config.batch_size).await?;
        self.observe_claim_duration(self.clock.now().saturating_duration_since(claim_started));

        let claimed = ids.len();
        if claimed > 0 {
            let rows = self.storage.requests.load(&ids).await?;
            {
                let mut stats = self.stats.write().await;
                stats.claimed += claimed as u64;
            }

            // The whole batch is processed even if shutdown was signalled
            // mid-batch: interrupting here would leak lock stamps.
            for request in rows {
                self.process_one(request).await;
            }
        }

        if self.gate.try_enter(self.clock.now()) {
            let promoted = self.storage.requests.promote_waiting_to_ready().await?;
            if promoted > 0 {
                debug!(worker = %self.tag, promoted, "promoted waiting requests");
                let mut stats = self.stats.write().await;
                stats.promoted += promoted;
            }
        }

        Ok(claimed)
    }

    /// Processes one row and unconditionally releases its lock.
    ///
    /// A fault inside the processor pauses the row: back to `waiting` with a
    /// short retry and an unchanged count, so an operator can intervene
    /// without losing the request.
    async fn process_one(&self, request: StoredRequest) {
        let id = request.id;

        let applied = self.processor.process(&request).await;

        match applied {
            Ok(applied) => {
                let mut stats = self.stats.write().await;
                stats.processed += 1;
                match applied {
                    Applied::Completed => stats.completed += 1,
                    Applied::Failed => stats.failed += 1,
                    Applied::Deferred => stats.deferred += 1,
                }
            },
            Err(err) => {
                error!(
                    worker = %self.tag,
                    request_id = %id,
                    error = %err,
                    "processor fault, pausing request"
                );
                self.pause(id, request.retry_count).await;
                let mut stats = self.stats.write().await;
                stats.processed += 1;
                stats.paused += 1;
            },
        }

        if let Err(err) = self.storage.requests.unlock(id).await {
            error!(worker = %self.tag, request_id = %id, error = %err, "failed to release lock");
        }
    }

    async fn pause(&self, id: RequestId, retry_count: i32) {
        let retry_at = self.clock.now_utc()
            + chrono::Duration::from_std(self.config.pause_delay)
                .unwrap_or_else(|_| chrono::Duration::seconds(60));

        if let Err(err) = self.storage.requests.defer(id, retry_at, retry_count, None).await {
            error!(worker = %self.tag, request_id = %id, error = %err, "failed to pause request");
        }
    }

    fn observe_claim_duration(&self, elapsed: Duration) {
        if elapsed >= CLAIM_CRITICAL_THRESHOLD {
            error!(worker = %self.tag, elapsed_s = elapsed.as_secs(), "claim critically slow");
        } else if elapsed >= CLAIM_WARN_THRESHOLD {
            warn!(worker = %self.tag, elapsed_s = elapsed.as_secs(), "claim very slow");
        } else if elapsed >= CLAIM_INFO_THRESHOLD {
            info!(worker = %self.tag, elapsed_s = elapsed.as_secs(), "claim slow");
        } else {
            debug!(worker = %self.tag, elapsed_ms = elapsed.as_millis(), "claim finished");
        }
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("tag", &self.tag)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}
