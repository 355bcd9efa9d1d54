//! Generic queue worker loop.
//!
//! One loop per queue claims batches under a lease and fans the claimed rows
//! out to at most `max_concurrency` concurrent handler tasks. An empty claim
//! sleeps for the poll interval; a non-empty claim is followed immediately by
//! the next claim. Every per-row outcome becomes a queue state transition and
//! nothing a handler does can stop the loop.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc,
    },
    time::Duration,
};

use async_trait::async_trait;
use courier_core::{ClaimRequest, Clock, QueueEntry, Resolution};
use tokio::{
    sync::{OwnedSemaphorePermit, RwLock, Semaphore},
    task::JoinSet,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    config::WorkerConfig,
    error::{PipelineError, Result},
    retry::{RetryContext, RetryDecision, RetryPolicy},
    storage::QueueStore,
};

/// Pause after a failed claim before claiming again.
pub const STORE_ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// How a handler disposed of one row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Terminal success.
    Done,
    /// Transient failure; retried with backoff until the attempt ceiling.
    Retry {
        /// Failure description
        error: String,
        /// Minimum wait requested by the remote side
        retry_after: Option<Duration>,
    },
    /// Permanent failure; no retry.
    Fail {
        /// Failure description
        error: String,
    },
}

impl Outcome {
    /// Transient failure without a requested wait.
    pub fn retry(error: impl Into<String>) -> Self {
        Self::Retry { error: error.into(), retry_after: None }
    }

    /// Permanent failure.
    pub fn fail(error: impl Into<String>) -> Self {
        Self::Fail { error: error.into() }
    }
}

/// Processes one claimed row.
#[async_trait]
pub trait Handler<E>: Send + Sync + 'static {
    /// Handles `entry`. Must not panic for bad data; report it as
    /// [`Outcome::Fail`].
    async fn handle(&self, entry: &E) -> Outcome;
}

/// Counters for one queue.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueStats {
    /// Rows claimed.
    pub claimed: u64,
    /// Rows moved to terminal success.
    pub succeeded: u64,
    /// Rows scheduled for retry.
    pub retried: u64,
    /// Rows moved to terminal failure.
    pub failed: u64,
    /// Outcomes discarded because the claim had been superseded.
    pub superseded: u64,
    /// Rows currently being handled.
    pub in_flight: u64,
}

struct WorkerContext<S: QueueStore + ?Sized> {
    queue: &'static str,
    store: Arc<S>,
    handler: Arc<dyn Handler<S::Entry>>,
    config: WorkerConfig,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    stats: Arc<RwLock<QueueStats>>,
    in_flight: Arc<AtomicU64>,
}

/// Counts one row as in flight until dropped, including by a panic.
struct InFlightGuard(Arc<AtomicU64>);

impl InFlightGuard {
    fn enter(counter: &Arc<AtomicU64>) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter.clone())
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Worker loop over one queue.
pub struct QueueWorker<S: QueueStore + ?Sized> {
    context: Arc<WorkerContext<S>>,
    semaphore: Arc<Semaphore>,
    cancellation_token: CancellationToken,
}

impl<S: QueueStore + ?Sized> QueueWorker<S> {
    /// Creates a worker. `config` should already be clamped.
    pub fn new(
        queue: &'static str,
        store: Arc<S>,
        handler: Arc<dyn Handler<S::Entry>>,
        config: WorkerConfig,
        policy: RetryPolicy,
        clock: Arc<dyn Clock>,
        cancellation_token: CancellationToken,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
        let context = Arc::new(WorkerContext {
            queue,
            store,
            handler,
            config,
            policy,
            clock,
            stats: Arc::new(RwLock::new(QueueStats::default())),
            in_flight: Arc::new(AtomicU64::new(0)),
        });

        Self { context, semaphore, cancellation_token }
    }

    /// Queue name used in logs.
    pub fn queue(&self) -> &'static str {
        self.context.queue
    }

    /// Current counters.
    pub async fn stats(&self) -> QueueStats {
        let mut stats = self.context.stats.read().await.clone();
        stats.in_flight = self.context.in_flight.load(Ordering::Acquire);
        stats
    }

    /// Runs until cancelled, then waits for in-flight rows to finish.
    pub async fn run(&self) {
        let queue = self.context.queue;
        info!(
            queue,
            batch_size = self.context.config.batch_size,
            max_concurrency = self.context.config.max_concurrency,
            "worker loop starting"
        );

        let mut tasks = JoinSet::new();

        loop {
            while let Some(result) = tasks.try_join_next() {
                log_task_result(queue, result);
            }

            let first_permit = tokio::select! {
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                () = self.cancellation_token.cancelled() => break,
            };

            let limit = self
                .context
                .config
                .batch_size
                .min(self.semaphore.available_permits().saturating_add(1));

            match self.context.claim(limit).await {
                Ok(entries) if entries.is_empty() => {
                    drop(first_permit);
                    tokio::select! {
                        () = self.context.clock.sleep(self.context.config.poll_interval) => {},
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
                Ok(entries) => {
                    let mut first_permit = Some(first_permit);
                    for entry in entries {
                        let permit = match first_permit.take() {
                            Some(permit) => permit,
                            None => match self.next_permit().await {
                                Some(permit) => permit,
                                None => break,
                            },
                        };
                        let context = self.context.clone();
                        tasks.spawn(async move { context.process(entry, permit).await });
                    }
                },
                Err(e) => {
                    drop(first_permit);
                    error!(queue, error = %e, "failed to claim batch");
                    tokio::select! {
                        () = self.context.clock.sleep(STORE_ERROR_BACKOFF) => {},
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
            }
        }

        let in_flight = tasks.len();
        if in_flight > 0 {
            info!(queue, in_flight, "worker loop draining in-flight rows");
        }
        while let Some(result) = tasks.join_next().await {
            log_task_result(queue, result);
        }

        info!(queue, "worker loop stopped");
    }

    /// Claims one batch and handles every row before returning.
    ///
    /// Returns the number of rows claimed.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Database` if the claim fails, or
    /// `PipelineError::WorkerPanic` if a handler task panicked.
    pub async fn run_once(&self) -> Result<usize> {
        let entries = self.context.claim(self.context.config.batch_size).await?;
        let claimed = entries.len();

        let mut tasks = JoinSet::new();
        for entry in entries {
            let permit = self
                .semaphore
                .clone()
                .acquire_owned()
                .await
                .map_err(|_| PipelineError::internal("worker semaphore closed"))?;
            let context = self.context.clone();
            tasks.spawn(async move { context.process(entry, permit).await });
        }

        while let Some(result) = tasks.join_next().await {
            result.map_err(|e| PipelineError::WorkerPanic {
                task: self.context.queue.to_string(),
                error: e.to_string(),
            })?;
        }

        Ok(claimed)
    }

    async fn next_permit(&self) -> Option<OwnedSemaphorePermit> {
        if let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
            return Some(permit);
        }
        self.semaphore.clone().acquire_owned().await.ok()
    }
}

impl<S: QueueStore + ?Sized> WorkerContext<S> {
    async fn claim(&self, limit: usize) -> Result<Vec<S::Entry>> {
        let request = ClaimRequest {
            limit,
            now: self.clock.now_utc(),
            lease: self.config.lease_chrono(),
            max_attempts: self.config.max_attempts,
        };

        let entries = self.store.claim_batch(request).await.map_err(|e| {
            PipelineError::database(format!("failed to claim {} rows: {e}", self.queue))
        })?;

        if !entries.is_empty() {
            debug!(queue = self.queue, claimed = entries.len(), "claimed batch");
            self.stats.write().await.claimed += entries.len() as u64;
        }

        Ok(entries)
    }

    async fn process(&self, entry: S::Entry, _permit: OwnedSemaphorePermit) {
        let _in_flight = InFlightGuard::enter(&self.in_flight);

        debug!(
            queue = self.queue,
            entry_id = %entry.id(),
            attempts = entry.state().attempts,
            "handling row"
        );
        let outcome = self.handler.handle(&entry).await;

        if let Err(e) = self.resolve(&entry, outcome).await {
            error!(
                queue = self.queue,
                entry_id = %entry.id(),
                error = %e,
                "failed to record outcome, row will be reclaimed after its lease"
            );
        }
    }

    async fn resolve(&self, entry: &S::Entry, outcome: Outcome) -> Result<()> {
        let Some(claim) = entry.claim() else {
            return Err(PipelineError::internal(format!("row {} was not claimed", entry.id())));
        };
        let queue = self.queue;
        let entry_id = entry.id();
        let attempts = u32::try_from(entry.state().attempts).unwrap_or(0);
        let now = self.clock.now_utc();

        let (error, retryable, retry_after) = match outcome {
            Outcome::Done => {
                if self.store.mark_done(claim, now).await? {
                    self.stats.write().await.succeeded += 1;
                    info!(queue, %entry_id, attempts, "row completed");
                } else {
                    self.superseded(entry_id).await;
                }
                return Ok(());
            },
            Outcome::Retry { error, retry_after } => (error, true, retry_after),
            Outcome::Fail { error } => (error, false, None),
        };

        let decision = RetryContext {
            attempts,
            max_attempts: self.config.max_attempts,
            retryable,
            retry_after,
            failed_at: now,
            policy: &self.policy,
        }
        .decide_retry();

        match decision {
            RetryDecision::Retry { next_attempt_at } => {
                let resolution = Resolution::retry(&error, next_attempt_at);
                if self.store.mark_outcome(claim, resolution).await? {
                    self.stats.write().await.retried += 1;
                    warn!(
                        queue,
                        %entry_id,
                        attempts,
                        %next_attempt_at,
                        error = %error,
                        "row scheduled for retry"
                    );
                } else {
                    self.superseded(entry_id).await;
                }
            },
            RetryDecision::GiveUp { reason } => {
                let resolution = Resolution::failed(&error, now);
                if self.store.mark_outcome(claim, resolution).await? {
                    self.stats.write().await.failed += 1;
                    error!(queue, %entry_id, attempts, error = %error, reason = %reason, "row failed");
                } else {
                    self.superseded(entry_id).await;
                }
            },
        }

        Ok(())
    }

    async fn superseded(&self, entry_id: courier_core::EntryId) {
        self.stats.write().await.superseded += 1;
        warn!(
            queue = self.queue,
            %entry_id,
            "claim superseded before outcome was recorded, discarding outcome"
        );
    }
}

fn log_task_result(queue: &str, result: std::result::Result<(), tokio::task::JoinError>) {
    if let Err(e) = result {
        if e.is_panic() {
            error!(queue, error = %e, "row handler panicked, row will be reclaimed after its lease");
        }
    }
}
