//! Pipeline assembly and lifecycle.
//!
//! [`Pipeline`] wires both queues to their handlers, runs one worker loop
//! per queue as a background task and shuts them down together. Work still
//! in flight when the shutdown timeout expires is abandoned; its lease
//! expires and another worker reclaims it.

use std::{future::Future, sync::Arc};

use courier_core::Clock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    client::ApiClient,
    config::PipelineConfig,
    enqueuer::Enqueuer,
    error::{PipelineError, Result},
    inbound::InboundHandler,
    outbound::OutboundHandler,
    poller::UpdatePoller,
    rate_limit::RateLimiter,
    router::Router,
    storage::{InboundStore, OutboundStore},
    worker::{QueueStats, QueueWorker},
};

/// Counters for both queues.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EngineStats {
    /// Inbound queue counters.
    pub inbound: QueueStats,
    /// Outbound queue counters.
    pub outbound: QueueStats,
}

/// Non-terminal row counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueDepths {
    /// Inbound rows not yet terminal.
    pub inbound: u64,
    /// Outbound rows not yet terminal.
    pub outbound: u64,
}

/// Collaborators the pipeline is built from.
pub struct PipelineParts {
    /// Inbound queue.
    pub inbound_store: Arc<InboundStore>,
    /// Outbound queue.
    pub outbound_store: Arc<OutboundStore>,
    /// Platform API client.
    pub client: Arc<dyn ApiClient>,
    /// Business router for inbound updates.
    pub router: Arc<dyn Router>,
    /// Time source.
    pub clock: Arc<dyn Clock>,
}

/// The inbound and outbound worker loops.
pub struct Pipeline {
    config: PipelineConfig,
    inbound: Arc<QueueWorker<InboundStore>>,
    outbound: Arc<QueueWorker<OutboundStore>>,
    inbound_store: Arc<InboundStore>,
    outbound_store: Arc<OutboundStore>,
    clock: Arc<dyn Clock>,
    cancellation_token: CancellationToken,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl Pipeline {
    /// Builds a pipeline. The configuration is clamped first.
    pub fn new(parts: PipelineParts, config: PipelineConfig) -> Self {
        let config = config.clamped();
        let cancellation_token = CancellationToken::new();
        let limiter = Arc::new(RateLimiter::new(config.destination_interval, parts.clock.clone()));

        let inbound = Arc::new(QueueWorker::new(
            "inbound",
            parts.inbound_store.clone(),
            Arc::new(InboundHandler::new(parts.router)),
            config.inbound.clone(),
            config.retry.clone(),
            parts.clock.clone(),
            cancellation_token.clone(),
        ));
        let outbound = Arc::new(QueueWorker::new(
            "outbound",
            parts.outbound_store.clone(),
            Arc::new(OutboundHandler::new(parts.client, limiter, parts.clock.clone())),
            config.outbound.clone(),
            config.retry.clone(),
            parts.clock.clone(),
            cancellation_token.clone(),
        ));

        Self {
            config,
            inbound,
            outbound,
            inbound_store: parts.inbound_store,
            outbound_store: parts.outbound_store,
            clock: parts.clock,
            cancellation_token,
            tasks: Vec::new(),
        }
    }

    /// Effective, clamped configuration.
    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Token cancelled on shutdown.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancellation_token.clone()
    }

    /// Producer handle for outbound sends.
    pub fn enqueuer(&self) -> Enqueuer {
        Enqueuer::new(self.outbound_store.clone(), self.clock.clone())
    }

    /// Spawns both worker loops. Returns immediately.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Configuration` if already started.
    pub fn start(&mut self) -> Result<()> {
        if !self.tasks.is_empty() {
            return Err(PipelineError::configuration("pipeline already started"));
        }

        info!(
            inbound_batch = self.config.inbound.batch_size,
            outbound_batch = self.config.outbound.batch_size,
            destination_interval_ms = self.config.destination_interval.as_millis(),
            "starting pipeline"
        );

        let inbound = self.inbound.clone();
        self.spawn("inbound", async move { inbound.run().await });
        let outbound = self.outbound.clone();
        self.spawn("outbound", async move { outbound.run().await });

        Ok(())
    }

    /// Runs the update poller under the pipeline's lifecycle.
    pub fn attach_poller(&mut self, poller: UpdatePoller) {
        let token = self.cancellation_token.clone();
        self.spawn("poller", poller.run(token));
    }

    fn spawn<F>(&mut self, name: &'static str, task: F)
    where
        F: Future<Output = ()> + Send + 'static,
    {
        self.tasks.push((name, tokio::spawn(task)));
    }

    /// Stops every task, waiting up to the shutdown timeout for in-flight
    /// rows.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::ShutdownTimeout` if tasks were still running
    /// at the deadline (they are aborted), or `PipelineError::WorkerPanic` if
    /// a task panicked.
    pub async fn shutdown(mut self) -> Result<()> {
        let timeout = self.config.shutdown_timeout;
        info!(tasks = self.tasks.len(), timeout_seconds = timeout.as_secs(), "shutting down pipeline");

        self.cancellation_token.cancel();

        let tasks = std::mem::take(&mut self.tasks);
        let abort_handles: Vec<_> = tasks.iter().map(|(_, handle)| handle.abort_handle()).collect();

        let join_all = async move {
            let mut first_panic = None;
            for (name, handle) in tasks {
                if let Err(join_error) = handle.await {
                    error!(task = name, error = %join_error, "task panicked during shutdown");
                    first_panic.get_or_insert(PipelineError::WorkerPanic {
                        task: name.to_string(),
                        error: join_error.to_string(),
                    });
                }
            }
            first_panic
        };

        match tokio::time::timeout(timeout, join_all).await {
            Ok(None) => {
                info!("pipeline shutdown completed");
                Ok(())
            },
            Ok(Some(panic)) => Err(panic),
            Err(_elapsed) => {
                warn!(
                    timeout_seconds = timeout.as_secs(),
                    "shutdown timed out, abandoning in-flight rows to lease expiry"
                );
                for handle in abort_handles {
                    handle.abort();
                }
                Err(PipelineError::ShutdownTimeout { timeout })
            },
        }
    }

    /// Current counters.
    pub async fn stats(&self) -> EngineStats {
        EngineStats { inbound: self.inbound.stats().await, outbound: self.outbound.stats().await }
    }

    /// Non-terminal row counts of both queues.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Database` if either count fails.
    pub async fn depth(&self) -> Result<QueueDepths> {
        Ok(QueueDepths {
            inbound: self.inbound_store.depth().await?,
            outbound: self.outbound_store.depth().await?,
        })
    }

    /// Claims and handles one inbound batch without the background loop.
    ///
    /// # Errors
    ///
    /// See [`QueueWorker::run_once`].
    pub async fn run_inbound_once(&self) -> Result<usize> {
        self.inbound.run_once().await
    }

    /// Claims and handles one outbound batch without the background loop.
    ///
    /// # Errors
    ///
    /// See [`QueueWorker::run_once`].
    pub async fn run_outbound_once(&self) -> Result<usize> {
        self.outbound.run_once().await
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        self.cancellation_token.cancel();
    }
}
