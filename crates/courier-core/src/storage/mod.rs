//! PostgreSQL repositories for the pipeline's three tables.
//!
//! Queue rows are only mutated through claim and outcome operations defined
//! here; no other code path writes `inbound_updates` or `outbound_messages`.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

pub mod inbound_updates;
pub mod outbound_messages;
pub mod processed_updates;
pub mod schema;

use crate::error::Result;

/// Reason recorded when a crashed final attempt is swept to `FAILED`.
pub const LEASE_EXPIRED_ON_FINAL_ATTEMPT: &str = "lease expired on final attempt";

/// Parameters of one claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClaimRequest {
    /// Maximum number of rows to claim.
    pub limit: usize,
    /// Claim time. Lease expiry and retry eligibility are judged against it.
    pub now: DateTime<Utc>,
    /// Lease granted to claimed rows.
    pub lease: chrono::Duration,
    /// Attempt ceiling. Expired leases at the ceiling fail instead of being
    /// reclaimed.
    pub max_attempts: u32,
}

impl ClaimRequest {
    /// Lease expiry written to claimed rows.
    pub fn locked_until(&self) -> DateTime<Utc> {
        self.now.checked_add_signed(self.lease).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub(crate) fn limit_i64(&self) -> i64 {
        i64::try_from(self.limit).unwrap_or(i64::MAX)
    }

    pub(crate) fn max_attempts_i32(&self) -> i32 {
        i32::try_from(self.max_attempts).unwrap_or(i32::MAX)
    }
}

/// Container for all repository instances.
#[derive(Clone)]
pub struct Storage {
    /// Inbound update queue.
    pub inbound_updates: Arc<inbound_updates::Repository>,

    /// Outbound message queue.
    pub outbound_messages: Arc<outbound_messages::Repository>,

    /// Idempotency guard keys.
    pub processed_updates: Arc<processed_updates::Repository>,
}

impl Storage {
    /// Creates a new storage instance sharing one pool across repositories.
    pub fn new(pool: PgPool) -> Self {
        let pool = Arc::new(pool);

        Self {
            inbound_updates: Arc::new(inbound_updates::Repository::new(pool.clone())),
            outbound_messages: Arc::new(outbound_messages::Repository::new(pool.clone())),
            processed_updates: Arc::new(processed_updates::Repository::new(pool)),
        }
    }

    /// Creates the tables and indexes if they do not exist.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if any DDL statement fails.
    pub async fn migrate(&self) -> Result<()> {
        schema::apply(&self.inbound_updates.pool()).await
    }

    /// Verifies database connectivity.
    ///
    /// # Errors
    ///
    /// Returns `CoreError::Database` if the connection is unhealthy.
    pub async fn health_check(&self) -> Result<()> {
        let _: (i32,) =
            sqlx::query_as("SELECT 1").fetch_one(&*self.inbound_updates.pool()).await?;

        Ok(())
    }
}
