//! Queue store abstraction used by the workers.
//!
//! Production stores wrap the PostgreSQL repositories in
//! `courier_core::storage`; tests use [`mock::MockQueueStore`], which
//! applies the same claim, lease and attempt rules in memory.

use std::{future::Future, pin::Pin, sync::Arc};

use chrono::{DateTime, Utc};
use courier_core::{
    error::Result, storage::Storage, Claim, ClaimRequest, InboundUpdate, NewInboundUpdate,
    NewOutboundMessage, NewQueueEntry, OutboundMessage, QueueEntry, Resolution,
};

pub mod mock;

/// Boxed future returned by store operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Store operations over one queue.
pub trait QueueStore: Send + Sync + 'static {
    /// Stored row type.
    type Entry: QueueEntry;

    /// Row type accepted by [`QueueStore::enqueue`].
    type NewEntry: NewQueueEntry<Entry = Self::Entry>;

    /// Inserts a row as `pending` with zero attempts.
    ///
    /// Returns `None` if the row's deduplication key is already present.
    fn enqueue(&self, entry: Self::NewEntry, at: DateTime<Utc>)
        -> StoreFuture<'_, Option<Self::Entry>>;

    /// Atomically claims up to `request.limit` claimable rows, oldest first.
    ///
    /// Returned rows are `processing`, hold a fresh claim token and show the
    /// incremented attempt count. Expired leases already at the attempt
    /// ceiling are failed instead of claimed.
    fn claim_batch(&self, request: ClaimRequest) -> StoreFuture<'_, Vec<Self::Entry>>;

    /// Marks a claimed row as terminally successful.
    ///
    /// Returns `false` if the row is no longer held by `claim`.
    fn mark_done(&self, claim: Claim, at: DateTime<Utc>) -> StoreFuture<'_, bool>;

    /// Moves a claimed row to `retry` or `failed`.
    ///
    /// Returns `false` if the row is no longer held by `claim`.
    fn mark_outcome(&self, claim: Claim, resolution: Resolution) -> StoreFuture<'_, bool>;

    /// Number of rows not yet terminal.
    fn depth(&self) -> StoreFuture<'_, u64>;
}

/// Inbound update queue.
pub type InboundStore = dyn QueueStore<Entry = InboundUpdate, NewEntry = NewInboundUpdate>;

/// Outbound message queue.
pub type OutboundStore = dyn QueueStore<Entry = OutboundMessage, NewEntry = NewOutboundMessage>;

fn depth_to_u64(depth: i64) -> u64 {
    u64::try_from(depth).unwrap_or(0)
}

/// PostgreSQL inbound queue.
pub struct PostgresInboundStore {
    storage: Arc<Storage>,
}

impl PostgresInboundStore {
    /// Creates a new adapter over the shared repositories.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

impl QueueStore for PostgresInboundStore {
    type Entry = InboundUpdate;
    type NewEntry = NewInboundUpdate;

    fn enqueue(
        &self,
        entry: NewInboundUpdate,
        at: DateTime<Utc>,
    ) -> StoreFuture<'_, Option<InboundUpdate>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.inbound_updates.enqueue(&entry, at).await })
    }

    fn claim_batch(&self, request: ClaimRequest) -> StoreFuture<'_, Vec<InboundUpdate>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.inbound_updates.claim_batch(&request).await })
    }

    fn mark_done(&self, claim: Claim, at: DateTime<Utc>) -> StoreFuture<'_, bool> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.inbound_updates.mark_done(claim, at).await })
    }

    fn mark_outcome(&self, claim: Claim, resolution: Resolution) -> StoreFuture<'_, bool> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.inbound_updates.mark_outcome(claim, &resolution).await })
    }

    fn depth(&self) -> StoreFuture<'_, u64> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.inbound_updates.depth().await.map(depth_to_u64) })
    }
}

/// PostgreSQL outbound queue.
pub struct PostgresOutboundStore {
    storage: Arc<Storage>,
}

impl PostgresOutboundStore {
    /// Creates a new adapter over the shared repositories.
    pub fn new(storage: Arc<Storage>) -> Self {
        Self { storage }
    }
}

impl QueueStore for PostgresOutboundStore {
    type Entry = OutboundMessage;
    type NewEntry = NewOutboundMessage;

    fn enqueue(
        &self,
        entry: NewOutboundMessage,
        at: DateTime<Utc>,
    ) -> StoreFuture<'_, Option<OutboundMessage>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.outbound_messages.enqueue(&entry, at).await.map(Some) })
    }

    fn claim_batch(&self, request: ClaimRequest) -> StoreFuture<'_, Vec<OutboundMessage>> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.outbound_messages.claim_batch(&request).await })
    }

    fn mark_done(&self, claim: Claim, at: DateTime<Utc>) -> StoreFuture<'_, bool> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.outbound_messages.mark_done(claim, at).await })
    }

    fn mark_outcome(&self, claim: Claim, resolution: Resolution) -> StoreFuture<'_, bool> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.outbound_messages.mark_outcome(claim, &resolution).await })
    }

    fn depth(&self) -> StoreFuture<'_, u64> {
        let storage = self.storage.clone();
        Box::pin(async move { storage.outbound_messages.depth().await.map(depth_to_u64) })
    }
}
