//! Producer facade for outbound sends.
//!
//! Application code schedules API calls through [`Enqueuer`] and never talks
//! to the platform directly. The enqueuer knows nothing about workers,
//! retries or transport.

use std::sync::Arc;

use courier_core::{ChatId, Clock, EntryId, NewOutboundMessage};
use serde::Serialize;
use tracing::debug;

use crate::{
    error::{PipelineError, Result},
    storage::OutboundStore,
};

/// Schedules outbound API calls.
#[derive(Clone)]
pub struct Enqueuer {
    store: Arc<OutboundStore>,
    clock: Arc<dyn Clock>,
}

impl Enqueuer {
    /// Creates an enqueuer writing to `store`.
    pub fn new(store: Arc<OutboundStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Serializes `payload` and enqueues a call of `method` for
    /// `destination`.
    ///
    /// # Errors
    ///
    /// Returns `PipelineError::Serialization` if the payload cannot be
    /// serialized and `PipelineError::Database` if the insert fails.
    pub async fn enqueue_send<P>(&self, destination: ChatId, method: &str, payload: &P) -> Result<EntryId>
    where
        P: Serialize + ?Sized,
    {
        if method.trim().is_empty() {
            return Err(PipelineError::configuration("method must not be empty"));
        }

        let payload = serde_json::to_string(payload)?;
        let new = NewOutboundMessage { destination, method: method.to_string(), payload };

        let row = self
            .store
            .enqueue(new, self.clock.now_utc())
            .await?
            .ok_or_else(|| PipelineError::internal("outbound enqueue was deduplicated"))?;

        debug!(entry_id = %row.id, %destination, method, "outbound message enqueued");
        Ok(row.id)
    }
}
