//! Repository for idempotency guard keys.
//!
//! One row per platform update identifier ever accepted. The primary key
//! resolves concurrent acquisitions; there is no read-before-write.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::PgPool;

use crate::{
    error::Result,
    models::{ChatId, UpdateId},
};

/// Repository for idempotency key operations.
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

    /// Records `update_id` as seen.
    ///
    /// Returns `true` if this call inserted the key, `false` if it already
    /// existed.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn try_insert(
        &self,
        update_id: UpdateId,
        update_kind: Option<&str>,
        chat_id: Option<ChatId>,
        seen_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            INSERT INTO processed_updates (update_id, update_kind, chat_id, seen_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (update_id) DO NOTHING
            "#,
        )
        .bind(update_id)
        .bind(update_kind)
        .bind(chat_id)
        .bind(seen_at)
        .execute(&*self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Forgets `update_id`, so a redelivery is accepted again.
    ///
    /// # Errors
    ///
    /// Returns error if the delete fails.
    pub async fn remove(&self, update_id: UpdateId) -> Result<bool> {
        let result = sqlx::query("DELETE FROM processed_updates WHERE update_id = $1")
            .bind(update_id)
            .execute(&*self.pool)
            .await?;

        Ok(result.rows_affected() == 1)
    }
}
