//! Long-polling source of inbound updates.
//!
//! Calls `getUpdates` in a loop and feeds every update to the [`Ingestor`].
//! The offset only advances past updates that were durably accepted, so an
//! ingestion failure makes the platform redeliver from that update.

use std::{sync::Arc, time::Duration};

use courier_core::Clock;
use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::{
    client::{ApiClient, ApiResult},
    error::{PipelineError, Result},
    ingest::Ingestor,
};

/// Settings of the update poller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollerConfig {
    /// Server-side long-poll timeout in seconds.
    pub timeout_seconds: u64,
    /// Maximum updates per call.
    pub limit: u32,
    /// Pause after a failed poll.
    pub error_backoff: Duration,
    /// Update kinds to receive; empty means the platform default.
    pub allowed_updates: Vec<String>,
}

impl Default for PollerConfig {
    fn default() -> Self {
        Self {
            timeout_seconds: 30,
            limit: 100,
            error_backoff: Duration::from_secs(5),
            allowed_updates: Vec::new(),
        }
    }
}

/// Long-polls the platform for updates.
pub struct UpdatePoller {
    client: Arc<dyn ApiClient>,
    ingestor: Arc<Ingestor>,
    config: PollerConfig,
    clock: Arc<dyn Clock>,
    offset: Option<i64>,
}

impl UpdatePoller {
    /// Creates a poller starting from the platform's oldest unconfirmed
    /// update.
    pub fn new(
        client: Arc<dyn ApiClient>,
        ingestor: Arc<Ingestor>,
        config: PollerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { client, ingestor, config, clock, offset: None }
    }

    /// Next offset requested from the platform.
    pub fn offset(&self) -> Option<i64> {
        self.offset
    }

    /// Polls until cancelled.
    pub async fn run(mut self, cancellation_token: CancellationToken) {
        info!(timeout_seconds = self.config.timeout_seconds, "update poller starting");

        loop {
            let result = tokio::select! {
                result = self.poll_once() => result,
                () = cancellation_token.cancelled() => break,
            };

            if let Err(e) = result {
                error!(error = %e, offset = ?self.offset, "update poll failed");
                tokio::select! {
                    () = self.clock.sleep(self.config.error_backoff) => {},
                    () = cancellation_token.cancelled() => break,
                }
            }
        }

        info!(offset = ?self.offset, "update poller stopped");
    }

    /// Fetches one batch of updates and ingests them in order.
    ///
    /// Returns the number of updates fetched.
    ///
    /// # Errors
    ///
    /// Returns an error if the call fails, the response is not a list, or an
    /// update could not be stored. The offset keeps every update ingested
    /// before the failure.
    pub async fn poll_once(&mut self) -> Result<usize> {
        let mut request = json!({
            "timeout": self.config.timeout_seconds,
            "limit": self.config.limit,
        });
        if let Some(offset) = self.offset {
            request["offset"] = json!(offset);
        }
        if !self.config.allowed_updates.is_empty() {
            request["allowed_updates"] = json!(self.config.allowed_updates);
        }

        let updates = match self.client.call("getUpdates", &request).await {
            ApiResult::Success(Value::Array(updates)) => updates,
            ApiResult::Success(other) => {
                return Err(PipelineError::internal(format!(
                    "getUpdates returned a non-array result: {other}"
                )));
            },
            ApiResult::Failure(failure) => {
                return Err(PipelineError::internal(format!("getUpdates failed: {failure}")));
            },
        };

        let fetched = updates.len();
        for update in updates {
            let update_id = update.get("update_id").and_then(Value::as_i64);
            let outcome = self.ingestor.ingest_value(update).await?;
            debug!(?outcome, "update ingested");

            if let Some(update_id) = update_id {
                let next = update_id.saturating_add(1);
                self.offset = Some(self.offset.map_or(next, |offset| offset.max(next)));
            }
        }

        Ok(fetched)
    }
}
