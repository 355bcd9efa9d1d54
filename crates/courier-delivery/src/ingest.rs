//! Raw-ingestion path for inbound updates.
//!
//! An update is enqueued only after the idempotency guard accepts its
//! identifier. The inbound table's unique constraint is a second line of
//! defence behind the guard.

use std::sync::Arc;

use courier_core::{Clock, EntryId, NewInboundUpdate, UpdateId};
use serde_json::Value;
use tracing::{debug, error, warn};

use crate::{
    error::Result,
    idempotency::IdempotencyGuard,
    storage::InboundStore,
    update::{DecodeError, IncomingUpdate},
};

/// What happened to an ingested update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    /// Stored as a new inbound row.
    Enqueued {
        /// Platform update identifier
        update_id: UpdateId,
        /// Surrogate key of the stored row
        entry_id: EntryId,
    },
    /// Seen before, or the guard could not be consulted; dropped.
    Duplicate {
        /// Platform update identifier
        update_id: UpdateId,
    },
    /// Not an update; dropped.
    Invalid {
        /// Why the payload was rejected
        reason: String,
    },
}

/// Accepts raw platform updates into the inbound queue.
pub struct Ingestor {
    guard: Arc<dyn IdempotencyGuard>,
    store: Arc<InboundStore>,
    clock: Arc<dyn Clock>,
}

impl Ingestor {
    /// Creates an ingestor.
    pub fn new(
        guard: Arc<dyn IdempotencyGuard>,
        store: Arc<InboundStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { guard, store, clock }
    }

    /// Ingests one raw update.
    ///
    /// # Errors
    ///
    /// Returns an error only if storing the update failed after the guard
    /// accepted it. The guard key is released first, so redelivery of the
    /// same update is accepted.
    pub async fn ingest(&self, raw: &str) -> Result<IngestOutcome> {
        match IncomingUpdate::parse(raw) {
            Ok(update) => self.ingest_update(update, raw.to_string()).await,
            Err(e) => Ok(invalid(&e)),
        }
    }

    /// Ingests an update already parsed as JSON.
    ///
    /// # Errors
    ///
    /// See [`Ingestor::ingest`].
    pub async fn ingest_value(&self, body: Value) -> Result<IngestOutcome> {
        let raw = body.to_string();
        match IncomingUpdate::from_value(body) {
            Ok(update) => self.ingest_update(update, raw).await,
            Err(e) => Ok(invalid(&e)),
        }
    }

    async fn ingest_update(&self, update: IncomingUpdate, raw: String) -> Result<IngestOutcome> {
        let update_id = update.update_id;

        match self.guard.acquire(update_id, &update.hints).await {
            Ok(true) => {},
            Ok(false) => {
                debug!(%update_id, "duplicate update dropped");
                return Ok(IngestOutcome::Duplicate { update_id });
            },
            Err(e) => {
                error!(%update_id, error = %e, "idempotency guard unavailable, dropping update");
                return Ok(IngestOutcome::Duplicate { update_id });
            },
        }

        let new = NewInboundUpdate { external_id: update_id, payload: raw };
        match self.store.enqueue(new, self.clock.now_utc()).await {
            Ok(Some(row)) => {
                debug!(
                    %update_id,
                    entry_id = %row.id,
                    kind = update.hints.kind.as_deref().unwrap_or("unknown"),
                    "update enqueued"
                );
                Ok(IngestOutcome::Enqueued { update_id, entry_id: row.id })
            },
            Ok(None) => {
                debug!(%update_id, "update already queued");
                Ok(IngestOutcome::Duplicate { update_id })
            },
            Err(e) => {
                error!(%update_id, error = %e, "failed to enqueue update, releasing guard");
                if let Err(release_error) = self.guard.release(update_id).await {
                    warn!(%update_id, error = %release_error, "failed to release idempotency key");
                }
                Err(e.into())
            },
        }
    }
}

fn invalid(error: &DecodeError) -> IngestOutcome {
    warn!(error = %error, "ignoring malformed update");
    IngestOutcome::Invalid { reason: error.to_string() }
}
