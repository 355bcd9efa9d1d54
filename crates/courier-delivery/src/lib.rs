//! Reliable inbound and outbound messaging for chat bots.
//!
//! Updates received from the platform and calls sent to it both go through
//! durable PostgreSQL queues. Worker loops claim rows with
//! `FOR UPDATE SKIP LOCKED` under a time-bounded lease, so a crashed worker
//! delays a row instead of losing it.
//!
//! # Architecture
//!
//! 1. **Ingest** - [`Ingestor`] checks the [`IdempotencyGuard`] and stores
//!    each new update in the inbound queue
//! 2. **Route** - the inbound worker hands updates to a [`Router`]
//! 3. **Enqueue** - application code schedules replies with [`Enqueuer`]
//! 4. **Send** - the outbound worker paces each destination through the
//!    [`RateLimiter`] and calls the platform through an [`ApiClient`]
//!
//! Failures are classified per row: transient ones retry with bounded
//! exponential backoff up to the attempt ceiling, permanent ones fail at
//! once.
//!
//! # Example
//!
//! ```no_run
//! use std::{sync::Arc, time::Duration};
//!
//! use courier_core::{ChatId, RealClock, Storage};
//! use courier_delivery::{
//!     storage::{PostgresInboundStore, PostgresOutboundStore},
//!     HttpApiClient, HttpRouter, Pipeline, PipelineConfig, PipelineError, PipelineParts,
//! };
//! use sqlx::PgPool;
//!
//! # async fn example(pool: PgPool) -> std::result::Result<(), PipelineError> {
//! let storage = Arc::new(Storage::new(pool));
//! let parts = PipelineParts {
//!     inbound_store: Arc::new(PostgresInboundStore::new(storage.clone())),
//!     outbound_store: Arc::new(PostgresOutboundStore::new(storage)),
//!     client: Arc::new(HttpApiClient::new(Default::default())?),
//!     router: Arc::new(HttpRouter::new("http://localhost:8081/updates", Duration::from_secs(10))?),
//!     clock: Arc::new(RealClock::new()),
//! };
//!
//! let mut pipeline = Pipeline::new(parts, PipelineConfig::default());
//! pipeline.start()?;
//!
//! pipeline
//!     .enqueuer()
//!     .enqueue_send(ChatId(42), "sendMessage", &serde_json::json!({"chat_id": 42, "text": "hi"}))
//!     .await?;
//!
//! pipeline.shutdown().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod engine;
pub mod enqueuer;
pub mod error;
pub mod idempotency;
mod inbound;
pub mod ingest;
mod outbound;
pub mod poller;
pub mod rate_limit;
pub mod retry;
pub mod router;
pub mod storage;
pub mod update;
pub mod worker;

pub use client::{ApiClient, ApiClientConfig, ApiFailure, ApiResult, HttpApiClient, MethodClass};
pub use config::{PipelineConfig, WorkerConfig};
pub use engine::{EngineStats, Pipeline, PipelineParts, QueueDepths};
pub use enqueuer::Enqueuer;
pub use error::{PipelineError, Result};
pub use idempotency::{IdempotencyGuard, MockIdempotencyGuard, PostgresIdempotencyGuard};
pub use inbound::InboundHandler;
pub use ingest::{IngestOutcome, Ingestor};
pub use outbound::OutboundHandler;
pub use poller::{PollerConfig, UpdatePoller};
pub use rate_limit::RateLimiter;
pub use retry::{RetryContext, RetryDecision, RetryPolicy};
pub use router::{HttpRouter, Router, RouterError};
pub use update::{DecodeError, IncomingUpdate, UpdateHints};
pub use worker::{Handler, Outcome, QueueStats, QueueWorker};
