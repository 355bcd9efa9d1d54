//! Outbound row handling: decode, pace, call, classify.

use std::sync::Arc;

use async_trait::async_trait;
use courier_core::{Clock, OutboundMessage};
use serde_json::Value;
use tracing::{debug, warn};

use crate::{
    client::{ApiClient, ApiResult, MethodClass},
    rate_limit::RateLimiter,
    worker::{Handler, Outcome},
};

/// Sends stored messages through the API client.
///
/// | Result                          | Outcome                     |
/// |---------------------------------|-----------------------------|
/// | success                         | done                        |
/// | failure of an `answer*` method  | fail                        |
/// | retryable failure               | retry, honouring retry_after|
/// | other failure                   | fail                        |
/// | undecodable payload             | fail                        |
/// | lease expired while pacing      | retry, without calling      |
#[derive(Debug)]
pub struct OutboundHandler {
    client: Arc<dyn ApiClient>,
    limiter: Arc<RateLimiter>,
    clock: Arc<dyn Clock>,
}

impl OutboundHandler {
    /// Creates a handler calling `client` and pacing through `limiter`.
    pub fn new(
        client: Arc<dyn ApiClient>,
        limiter: Arc<RateLimiter>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { client, limiter, clock }
    }
}

#[async_trait]
impl Handler<OutboundMessage> for OutboundHandler {
    async fn handle(&self, entry: &OutboundMessage) -> Outcome {
        let payload: Value = match serde_json::from_str(&entry.payload) {
            Ok(payload) => payload,
            Err(e) => return Outcome::fail(format!("malformed payload: {e}")),
        };

        let class = MethodClass::of(&entry.method);
        if class.requires_pacing() {
            self.limiter.acquire(entry.destination).await;
        }

        // Past the lease another worker may already own the row.
        let now = self.clock.now_utc();
        if entry.state.locked_until.is_some_and(|until| until <= now) {
            warn!(
                entry_id = %entry.id,
                destination = %entry.destination,
                "lease expired while waiting for a send slot, not calling api"
            );
            return Outcome::retry("lease expired before send");
        }

        debug!(
            entry_id = %entry.id,
            destination = %entry.destination,
            method = %entry.method,
            attempts = entry.state.attempts,
            "calling api"
        );

        match self.client.call(&entry.method, &payload).await {
            ApiResult::Success(_) => Outcome::Done,
            ApiResult::Failure(failure) if class.is_answer() => Outcome::fail(failure.to_string()),
            ApiResult::Failure(failure) if failure.is_retryable() => Outcome::Retry {
                error: failure.to_string(),
                retry_after: failure.retry_after(),
            },
            ApiResult::Failure(failure) => Outcome::fail(failure.to_string()),
        }
    }
}
