//! Recording business router.

use std::{collections::VecDeque, fmt, time::Duration};

use async_trait::async_trait;
use courier_core::UpdateId;
use courier_delivery::{IncomingUpdate, Router, RouterError};
use tokio::sync::Mutex;

/// Router that records every update and answers from a script.
///
/// Unscripted calls succeed.
#[derive(Default)]
pub struct RecordingRouter {
    script: Mutex<VecDeque<Result<(), RouterError>>>,
    seen: Mutex<Vec<IncomingUpdate>>,
    latency: Option<Duration>,
}

impl RecordingRouter {
    /// Creates a router that accepts everything.
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call take `latency` on the tokio timer.
    #[must_use]
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Queues a transient failure.
    pub async fn push_transient(&self, reason: &str) {
        self.script.lock().await.push_back(Err(RouterError::Transient(reason.to_string())));
    }

    /// Queues a rejection.
    pub async fn push_rejected(&self, reason: &str) {
        self.script.lock().await.push_back(Err(RouterError::Rejected(reason.to_string())));
    }

    /// Queues a success.
    pub async fn push_ok(&self) {
        self.script.lock().await.push_back(Ok(()));
    }

    /// Update identifiers routed so far, in order.
    pub async fn seen_ids(&self) -> Vec<UpdateId> {
        self.seen.lock().await.iter().map(|update| update.update_id).collect()
    }

    /// Updates routed so far, in order.
    pub async fn seen(&self) -> Vec<IncomingUpdate> {
        self.seen.lock().await.clone()
    }
}

impl fmt::Debug for RecordingRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordingRouter").field("latency", &self.latency).finish_non_exhaustive()
    }
}

#[async_trait]
impl Router for RecordingRouter {
    async fn process(&self, update: &IncomingUpdate) -> Result<(), RouterError> {
        self.seen.lock().await.push(update.clone());

        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }

        self.script.lock().await.pop_front().unwrap_or(Ok(()))
    }
}
