//! Repository for the inbound update queue.
//!
//! Inbound rows are unique per platform `update_id`; enqueueing the same
//! update twice leaves exactly one row.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{Executor, PgPool, Postgres, Transaction};

use super::{ClaimRequest, LEASE_EXPIRED_ON_FINAL_ATTEMPT};
use crate::{
    error::Result,
    models::{Claim, EntryId, InboundUpdate, NewInboundUpdate, QueueStatus, Resolution, UpdateId},
};

/// Repository for inbound update queue operations.
pub struct Repository {
    pool: Arc<PgPool>,
}

impl Repository {
    /// Creates a new repository instance.
    pub fn new(pool: Arc<PgPool>) -> Self {
        Self { pool }
    }

    /// Returns a reference to the database pool.
    pub fn pool(&self) -> Arc<PgPool> {
        self.pool.clone()
    }

    /// Stores a new update as `pending`.
    ///
    /// Returns `None` when a row with the same `external_id` already exists;
    /// the existing row is left untouched.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn enqueue(
        &self,
        update: &NewInboundUpdate,
        received_at: DateTime<Utc>,
    ) -> Result<Option<InboundUpdate>> {
        self.enqueue_impl(&*self.pool, update, received_at).await
    }

    /// Stores a new update within a transaction.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn enqueue_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        update: &NewInboundUpdate,
        received_at: DateTime<Utc>,
    ) -> Result<Option<InboundUpdate>> {
        self.enqueue_impl(&mut **tx, update, received_at).await
    }

    async fn enqueue_impl<'e, E>(
        &self,
        executor: E,
        update: &NewInboundUpdate,
        received_at: DateTime<Utc>,
    ) -> Result<Option<InboundUpdate>>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let row = sqlx::query_as::<_, InboundUpdate>(
            r#"
            INSERT INTO inbound_updates (external_id, payload, status, attempts, received_at)
            VALUES ($1, $2, 'pending', 0, $3)
            ON CONFLICT (external_id) DO NOTHING
            RETURNING id, external_id, payload, received_at, status, attempts, last_error,
                      processed_at, next_attempt_at, locked_until, claim_token
            "#,
        )
        .bind(update.external_id)
        .bind(&update.payload)
        .bind(received_at)
        .fetch_optional(executor)
        .await?;

        Ok(row)
    }

    /// Claims up to `request.limit` claimable updates, oldest first.
    ///
    /// Rows locked by a concurrent claimer are skipped rather than waited
    /// on. Every returned row is `processing` with its attempt counter
    /// already incremented and a fresh claim token.
    ///
    /// Before claiming, rows whose lease expired on their final attempt are
    /// moved to `failed`.
    ///
    /// # Errors
    ///
    /// Returns error if the claim transaction fails.
    pub async fn claim_batch(&self, request: &ClaimRequest) -> Result<Vec<InboundUpdate>> {
        if request.limit == 0 {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE inbound_updates
            SET status = 'failed', last_error = $3, processed_at = $1,
                locked_until = NULL, next_attempt_at = NULL
            WHERE id IN (
                SELECT id FROM inbound_updates
                WHERE status = 'processing'
                  AND (locked_until IS NULL OR locked_until <= $1)
                  AND attempts >= $2
                FOR UPDATE SKIP LOCKED
            )
            "#,
        )
        .bind(request.now)
        .bind(request.max_attempts_i32())
        .bind(LEASE_EXPIRED_ON_FINAL_ATTEMPT)
        .execute(&mut *tx)
        .await?;

        let ids: Vec<EntryId> = sqlx::query_scalar(
            r#"
            SELECT id FROM inbound_updates
            WHERE (status IN ('pending', 'retry')
                   AND (next_attempt_at IS NULL OR next_attempt_at <= $1))
               OR (status = 'processing'
                   AND (locked_until IS NULL OR locked_until <= $1))
            ORDER BY received_at ASC, id ASC
            LIMIT $2
            FOR UPDATE SKIP LOCKED
            "#,
        )
        .bind(request.now)
        .bind(request.limit_i64())
        .fetch_all(&mut *tx)
        .await?;

        if ids.is_empty() {
            tx.commit().await?;
            return Ok(Vec::new());
        }

        let raw_ids: Vec<i64> = ids.iter().map(|id| id.0).collect();
        let mut updates = sqlx::query_as::<_, InboundUpdate>(
            r#"
            UPDATE inbound_updates
            SET status = 'processing', attempts = attempts + 1, locked_until = $2,
                next_attempt_at = NULL, claim_token = gen_random_uuid()
            WHERE id = ANY($1)
            RETURNING id, external_id, payload, received_at, status, attempts, last_error,
                      processed_at, next_attempt_at, locked_until, claim_token
            "#,
        )
        .bind(&raw_ids)
        .bind(request.locked_until())
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        updates.sort_by_key(|update| (update.received_at, update.id));
        Ok(updates)
    }

    /// Marks a claimed update `processed`.
    ///
    /// Returns `false` without writing if the row is no longer held by
    /// `claim`, which makes a repeated call a no-op.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_done(&self, claim: Claim, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE inbound_updates
            SET status = 'processed', processed_at = $3, locked_until = NULL,
                next_attempt_at = NULL
            WHERE id = $1 AND status = 'processing' AND claim_token = $2
            "#,
        )
        .bind(claim.id)
        .bind(claim.token)
        .bind(at)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Moves a claimed update to `retry` or `failed`.
    ///
    /// Returns `false` without writing if the row is no longer held by
    /// `claim`.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_outcome(&self, claim: Claim, resolution: &Resolution) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE inbound_updates
            SET status = $3, last_error = $4, processed_at = $5, next_attempt_at = $6,
                locked_until = NULL
            WHERE id = $1 AND status = 'processing' AND claim_token = $2
            "#,
        )
        .bind(claim.id)
        .bind(claim.token)
        .bind(resolution.status())
        .bind(resolution.last_error())
        .bind(resolution.processed_at())
        .bind(resolution.next_attempt_at())
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Counts rows that are not yet terminal.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn depth(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*) FROM inbound_updates
            WHERE status IN ('pending', 'processing', 'retry')
            "#,
        )
        .fetch_one(&*self.pool)
        .await?;

        Ok(count)
    }

    /// Counts rows in the given status.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn count_by_status(&self, status: QueueStatus) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM inbound_updates WHERE status = $1")
                .bind(status)
                .fetch_one(&*self.pool)
                .await?;

        Ok(count)
    }

    /// Finds an update by surrogate key.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, id: EntryId) -> Result<Option<InboundUpdate>> {
        let row = sqlx::query_as::<_, InboundUpdate>(
            r#"
            SELECT id, external_id, payload, received_at, status, attempts, last_error,
                   processed_at, next_attempt_at, locked_until, claim_token
            FROM inbound_updates
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(row)
    }

    /// Finds an update by platform update identifier.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_external_id(&self, external_id: UpdateId) -> Result<Option<InboundUpdate>> {
        let row = sqlx::query_as::<_, InboundUpdate>(
            r#"
            SELECT id, external_id, payload, received_at, status, attempts, last_error,
                   processed_at, next_attempt_at, locked_until, claim_token
            FROM inbound_updates
            WHERE external_id = $1
            "#,
        )
        .bind(external_id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(row)
    }
}
