//! Core domain models for the courier messaging pipeline.
//!
//! Provides the persisted queue rows shared by the inbound update queue and
//! the outbound message queue, the queue state machine, strongly-typed
//! identifiers, the clock abstraction and the PostgreSQL repositories. The
//! delivery crate builds its workers on top of these types.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod models;
pub mod storage;
pub mod time;

pub use error::{CoreError, Result};
pub use models::{
    truncate_error, ChatId, Claim, EntryId, InboundUpdate, NewInboundUpdate, NewOutboundMessage,
    NewQueueEntry, OutboundMessage, QueueEntry, QueueState, QueueStatus, Resolution, UpdateId,
    MAX_ERROR_LEN,
};
pub use storage::{ClaimRequest, Storage, LEASE_EXPIRED_ON_FINAL_ATTEMPT};
pub use time::{Clock, RealClock, TestClock};
