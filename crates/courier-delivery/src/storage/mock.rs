//! In-memory queue store for tests.
//!
//! Applies the same rules as the PostgreSQL repositories: deduplication on
//! enqueue, oldest-first claims, lease expiry, attempt counting, the
//! exhausted-lease sweep and claim-token fencing. A single lock makes every
//! operation atomic, standing in for row locks.

use std::{
    collections::{BTreeMap, HashSet},
    marker::PhantomData,
    sync::Arc,
};

use chrono::{DateTime, Utc};
use courier_core::{
    error::CoreError,
    storage::LEASE_EXPIRED_ON_FINAL_ATTEMPT,
    Claim, ClaimRequest, EntryId, NewQueueEntry, QueueEntry, QueueStatus, Resolution,
};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{QueueStore, StoreFuture};

struct Inner<E> {
    rows: BTreeMap<EntryId, E>,
    dedup_keys: HashSet<i64>,
    next_id: i64,
    claim_error: Option<String>,
    enqueue_error: Option<String>,
}

/// In-memory queue store.
pub struct MockQueueStore<N: NewQueueEntry> {
    inner: Arc<Mutex<Inner<N::Entry>>>,
    _new: PhantomData<fn(N)>,
}

impl<N: NewQueueEntry> MockQueueStore<N> {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner {
                rows: BTreeMap::new(),
                dedup_keys: HashSet::new(),
                next_id: 1,
                claim_error: None,
                enqueue_error: None,
            })),
            _new: PhantomData,
        }
    }

    /// Fails the next claim with a database error.
    pub async fn inject_claim_error(&self, error: impl Into<String>) {
        self.inner.lock().await.claim_error = Some(error.into());
    }

    /// Fails the next enqueue with a database error.
    pub async fn inject_enqueue_error(&self, error: impl Into<String>) {
        self.inner.lock().await.enqueue_error = Some(error.into());
    }

    /// Returns a row by id.
    pub async fn get(&self, id: EntryId) -> Option<N::Entry> {
        self.inner.lock().await.rows.get(&id).cloned()
    }

    /// Returns every row in id order.
    pub async fn entries(&self) -> Vec<N::Entry> {
        self.inner.lock().await.rows.values().cloned().collect()
    }

    /// Counts rows in `status`.
    pub async fn count_by_status(&self, status: QueueStatus) -> usize {
        self.inner.lock().await.rows.values().filter(|row| row.state().status == status).count()
    }

    /// Counts all rows.
    pub async fn len(&self) -> usize {
        self.inner.lock().await.rows.len()
    }

    /// Whether the store holds no rows.
    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

impl<N: NewQueueEntry> Default for MockQueueStore<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<N: NewQueueEntry> QueueStore for MockQueueStore<N> {
    type Entry = N::Entry;
    type NewEntry = N;

    fn enqueue(&self, entry: N, at: DateTime<Utc>) -> StoreFuture<'_, Option<N::Entry>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            let mut inner = inner.lock().await;

            if let Some(error) = inner.enqueue_error.take() {
                return Err(CoreError::Database(error));
            }

            if let Some(key) = entry.dedup_key() {
                if !inner.dedup_keys.insert(key) {
                    return Ok(None);
                }
            }

            let id = EntryId(inner.next_id);
            inner.next_id += 1;
            let row = entry.into_entry(id, at);
            inner.rows.insert(id, row.clone());

            Ok(Some(row))
        })
    }

    fn claim_batch(&self, request: ClaimRequest) -> StoreFuture<'_, Vec<N::Entry>> {
        let inner = self.inner.clone();
        Box::pin(async move {
            let mut inner = inner.lock().await;

            if let Some(error) = inner.claim_error.take() {
                return Err(CoreError::Database(error));
            }

            let sweep = Resolution::failed(LEASE_EXPIRED_ON_FINAL_ATTEMPT, request.now);
            for row in inner.rows.values_mut() {
                if row.state().is_exhausted_lease(request.now, request.max_attempts) {
                    row.state_mut().resolve(&sweep);
                }
            }

            let mut candidates: Vec<(DateTime<Utc>, EntryId)> = inner
                .rows
                .values()
                .filter(|row| row.state().is_claimable(request.now))
                .map(|row| (row.arrived_at(), row.id()))
                .collect();
            candidates.sort();
            candidates.truncate(request.limit);

            let mut claimed = Vec::with_capacity(candidates.len());
            for (_, id) in candidates {
                if let Some(row) = inner.rows.get_mut(&id) {
                    row.state_mut().claim(request.now, request.lease, Uuid::new_v4());
                    claimed.push(row.clone());
                }
            }

            Ok(claimed)
        })
    }

    fn mark_done(&self, claim: Claim, at: DateTime<Utc>) -> StoreFuture<'_, bool> {
        let inner = self.inner.clone();
        Box::pin(async move {
            let mut inner = inner.lock().await;
            match inner.rows.get_mut(&claim.id) {
                Some(row) if row.state().is_held_by(claim.token) => {
                    row.state_mut().complete(<N::Entry as QueueEntry>::DONE, at);
                    Ok(true)
                },
                _ => Ok(false),
            }
        })
    }

    fn mark_outcome(&self, claim: Claim, resolution: Resolution) -> StoreFuture<'_, bool> {
        let inner = self.inner.clone();
        Box::pin(async move {
            let mut inner = inner.lock().await;
            match inner.rows.get_mut(&claim.id) {
                Some(row) if row.state().is_held_by(claim.token) => {
                    row.state_mut().resolve(&resolution);
                    Ok(true)
                },
                _ => Ok(false),
            }
        })
    }

    fn depth(&self) -> StoreFuture<'_, u64> {
        let inner = self.inner.clone();
        Box::pin(async move {
            let inner = inner.lock().await;
            let depth = inner.rows.values().filter(|row| !row.state().status.is_terminal()).count();
            Ok(u64::try_from(depth).unwrap_or(u64::MAX))
        })
    }
}
