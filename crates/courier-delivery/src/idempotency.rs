//! Idempotency guard for inbound updates.
//!
//! The guard records each platform update identifier once. Concurrent
//! acquisitions of the same key are resolved by the store's uniqueness
//! constraint, never by a preceding read.

use std::{collections::HashSet, future::Future, pin::Pin, sync::Arc};

use courier_core::{error::Result, storage::Storage, Clock, CoreError, UpdateId};
use tokio::sync::Mutex;

use crate::update::UpdateHints;

/// Boxed future returned by guard operations.
pub type GuardFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Records inbound update identifiers exactly once.
pub trait IdempotencyGuard: Send + Sync + 'static {
    /// Returns `true` the first time `update_id` is seen and `false` for a
    /// duplicate.
    fn acquire(&self, update_id: UpdateId, hints: &UpdateHints) -> GuardFuture<'_, bool>;

    /// Forgets `update_id` so a later redelivery is accepted.
    fn release(&self, update_id: UpdateId) -> GuardFuture<'_, ()>;
}

/// Guard backed by the `processed_updates` table.
pub struct PostgresIdempotencyGuard {
    storage: Arc<Storage>,
    clock: Arc<dyn Clock>,
}

impl PostgresIdempotencyGuard {
    /// Creates a guard over the shared repositories.
    pub fn new(storage: Arc<Storage>, clock: Arc<dyn Clock>) -> Self {
        Self { storage, clock }
    }
}

impl IdempotencyGuard for PostgresIdempotencyGuard {
    fn acquire(&self, update_id: UpdateId, hints: &UpdateHints) -> GuardFuture<'_, bool> {
        let storage = self.storage.clone();
        let kind = hints.kind.clone();
        let chat_id = hints.chat_id;
        let seen_at = self.clock.now_utc();
        Box::pin(async move {
            storage.processed_updates.try_insert(update_id, kind.as_deref(), chat_id, seen_at).await
        })
    }

    fn release(&self, update_id: UpdateId) -> GuardFuture<'_, ()> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.processed_updates.remove(update_id).await.map(|_| ()) })
    }
}

/// In-memory guard for tests.
#[derive(Default)]
pub struct MockIdempotencyGuard {
    seen: Arc<Mutex<HashSet<UpdateId>>>,
    acquire_error: Arc<Mutex<Option<String>>>,
}

impl MockIdempotencyGuard {
    /// Creates an empty guard.
    pub fn new() -> Self {
        Self::default()
    }

    /// Fails the next acquisition with a database error.
    pub async fn inject_acquire_error(&self, error: impl Into<String>) {
        *self.acquire_error.lock().await = Some(error.into());
    }

    /// Whether `update_id` is currently recorded.
    pub async fn contains(&self, update_id: UpdateId) -> bool {
        self.seen.lock().await.contains(&update_id)
    }
}

impl IdempotencyGuard for MockIdempotencyGuard {
    fn acquire(&self, update_id: UpdateId, _hints: &UpdateHints) -> GuardFuture<'_, bool> {
        let seen = self.seen.clone();
        let acquire_error = self.acquire_error.clone();
        Box::pin(async move {
            if let Some(error) = acquire_error.lock().await.take() {
                return Err(CoreError::Database(error));
            }
            Ok(seen.lock().await.insert(update_id))
        })
    }

    fn release(&self, update_id: UpdateId) -> GuardFuture<'_, ()> {
        let seen = self.seen.clone();
        Box::pin(async move {
            seen.lock().await.remove(&update_id);
            Ok(())
        })
    }
}
