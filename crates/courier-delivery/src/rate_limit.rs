//! Per-destination send pacing.
//!
//! Each destination has an earliest next-send instant. A caller either
//! proceeds at once or reserves the next free slot and sleeps until it, so
//! senders to one destination are serialized in time while other
//! destinations are unaffected.
//!
//! The slot map is process-local. Several pipeline processes sharing one
//! database each pace independently.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use courier_core::{ChatId, Clock};
use tracing::trace;

/// Slot maps larger than this are pruned of elapsed entries.
const PRUNE_THRESHOLD: usize = 1024;

/// Enforces a minimum interval between sends to the same destination.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: Duration,
    next_slots: Mutex<HashMap<ChatId, Instant>>,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Creates a limiter with the given per-destination interval.
    pub fn new(min_interval: Duration, clock: Arc<dyn Clock>) -> Self {
        Self { min_interval, next_slots: Mutex::new(HashMap::new()), clock }
    }

    /// Configured minimum interval.
    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Waits until sending to `destination` respects the minimum interval.
    ///
    /// The slot is reserved before sleeping, so concurrent callers for the
    /// same destination queue up behind each other in reservation order.
    pub async fn acquire(&self, destination: ChatId) {
        let wait = self.reserve(destination);

        if !wait.is_zero() {
            trace!(%destination, wait_ms = wait.as_millis(), "pacing send");
            self.clock.sleep(wait).await;
        }
    }

    /// Reserves the next slot for `destination` and returns how long the
    /// caller must wait for it.
    fn reserve(&self, destination: ChatId) -> Duration {
        if self.min_interval.is_zero() {
            return Duration::ZERO;
        }

        let now = self.clock.now();
        let mut slots = self.slots();

        let slot = slots.get(&destination).copied().filter(|next| *next > now).unwrap_or(now);
        slots.insert(destination, slot + self.min_interval);

        if slots.len() > PRUNE_THRESHOLD {
            slots.retain(|_, next| *next > now);
        }

        slot.saturating_duration_since(now)
    }

    /// Number of destinations currently tracked.
    pub fn tracked_destinations(&self) -> usize {
        self.slots().len()
    }

    fn slots(&self) -> MutexGuard<'_, HashMap<ChatId, Instant>> {
        self.next_slots.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}
