//! Repository for the outbound message queue.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::{Executor, PgPool, Postgres, Transaction};

use super::{ClaimRequest, LEASE_EXPIRED_ON_FINAL_ATTEMPT};
use crate::{
    error::Result,
    models::{ChatId, Claim, EntryId, NewOutboundMessage, OutboundMessage, QueueStatus, Resolution},
};

/// Repository for outbound message queue operations.
///
/// Claims use `FOR UPDATE SKIP LOCKED` so any number of workers, in this or
/// other processes, can share the queue without blocking one another.
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

    /// Stores a new message as `pending` with zero attempts.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn enqueue(
        &self,
        message: &NewOutboundMessage,
        created_at: DateTime<Utc>,
    ) -> Result<OutboundMessage> {
        self.enqueue_impl(&*self.pool, message, created_at).await
    }

    /// Stores a new message within a transaction, so business writes and
    /// the send they trigger commit together.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn enqueue_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        message: &NewOutboundMessage,
        created_at: DateTime<Utc>,
    ) -> Result<OutboundMessage> {
        self.enqueue_impl(&mut **tx, message, created_at).await
    }

    async fn enqueue_impl<'e, E>(
        &self,
        executor: E,
        message: &NewOutboundMessage,
        created_at: DateTime<Utc>,
    ) -> Result<OutboundMessage>
    where
        E: Executor<'e, Database = Postgres>,
    {
        let row = sqlx::query_as::<_, OutboundMessage>(
            r#"
            INSERT INTO outbound_messages (destination, method, payload, status, attempts, created_at)
            VALUES ($1, $2, $3, 'pending', 0, $4)
            RETURNING id, destination, method, payload, created_at, status, attempts, last_error,
                      processed_at, next_attempt_at, locked_until, claim_token
            "#,
        )
        .bind(message.destination)
        .bind(&message.method)
        .bind(&message.payload)
        .bind(created_at)
        .fetch_one(executor)
        .await?;

        Ok(row)
    }

    /// Claims up to `request.limit` claimable messages, oldest first.
    ///
    /// Expired leases on a final attempt are failed first, then eligible
    /// `pending`/`retry` rows and expired `processing` rows are claimed.
    ///
    /// # Errors
    ///
    /// Returns error if the claim transaction fails.
    pub async fn claim_batch(&self, request: &ClaimRequest) -> Result<Vec<OutboundMessage>> {
        if request.limit == 0 {
            return Ok(Vec::new());
        }

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            UPDATE outbound_messages
            SET status = 'failed', last_error = $3, processed_at = $1,
                locked_until = NULL, next_attempt_at = NULL
            WHERE id IN (
                SELECT id FROM outbound_messages
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
            SELECT id FROM outbound_messages
            WHERE (status IN ('pending', 'retry')
                   AND (next_attempt_at IS NULL OR next_attempt_at <= $1))
               OR (status = 'processing'
                   AND (locked_until IS NULL OR locked_until <= $1))
            ORDER BY created_at ASC, id ASC
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
        let mut messages = sqlx::query_as::<_, OutboundMessage>(
            r#"
            UPDATE outbound_messages
            SET status = 'processing', attempts = attempts + 1, locked_until = $2,
                next_attempt_at = NULL, claim_token = gen_random_uuid()
            WHERE id = ANY($1)
            RETURNING id, destination, method, payload, created_at, status, attempts, last_error,
                      processed_at, next_attempt_at, locked_until, claim_token
            "#,
        )
        .bind(&raw_ids)
        .bind(request.locked_until())
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        messages.sort_by_key(|message| (message.created_at, message.id));
        Ok(messages)
    }

    /// Marks a claimed message `sent`.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_done(&self, claim: Claim, at: DateTime<Utc>) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE outbound_messages
            SET status = 'sent', processed_at = $3, locked_until = NULL,
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

    /// Moves a claimed message to `retry` or `failed`.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn mark_outcome(&self, claim: Claim, resolution: &Resolution) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE outbound_messages
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
            SELECT COUNT(*) FROM outbound_messages
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
            sqlx::query_scalar("SELECT COUNT(*) FROM outbound_messages WHERE status = $1")
                .bind(status)
                .fetch_one(&*self.pool)
                .await?;

        Ok(count)
    }

    /// Finds a message by surrogate key.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_id(&self, id: EntryId) -> Result<Option<OutboundMessage>> {
        let row = sqlx::query_as::<_, OutboundMessage>(
            r#"
            SELECT id, destination, method, payload, created_at, status, attempts, last_error,
                   processed_at, next_attempt_at, locked_until, claim_token
            FROM outbound_messages
            WHERE id = $1
            "#,
        )
        .bind(id)
        .fetch_optional(&*self.pool)
        .await?;

        Ok(row)
    }

    /// Lists the most recent messages for a chat, newest first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn find_by_destination(
        &self,
        destination: ChatId,
        limit: i64,
    ) -> Result<Vec<OutboundMessage>> {
        let rows = sqlx::query_as::<_, OutboundMessage>(
            r#"
            SELECT id, destination, method, payload, created_at, status, attempts, last_error,
                   processed_at, next_attempt_at, locked_until, claim_token
            FROM outbound_messages
            WHERE destination = $1
            ORDER BY created_at DESC, id DESC
            LIMIT $2
            "#,
        )
        .bind(destination)
        .bind(limit)
        .fetch_all(&*self.pool)
        .await?;

        Ok(rows)
    }
}
