//! Queue rows, identifiers and the queue state machine.
//!
//! Inbound updates and outbound messages share one lifecycle:
//!
//! ```text
//! PENDING ──claim──▶ PROCESSING ──▶ SENT / PROCESSED
//!                        │  ▲
//!                        │  └──claim── RETRY (after next_attempt_at)
//!                        └──────────▶ FAILED
//! ```
//!
//! A `PROCESSING` row whose lease has expired is claimable again; that is the
//! only crash-recovery mechanism. Terminal rows never change again.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

type PgDb = sqlx::Postgres;
type PgValueRef<'r> = sqlx::postgres::PgValueRef<'r>;
type PgTypeInfo = sqlx::postgres::PgTypeInfo;
type PgArgumentBuffer = sqlx::postgres::PgArgumentBuffer;
type EncodeResult = Result<sqlx::encode::IsNull, sqlx::error::BoxDynError>;
type BoxDynError = sqlx::error::BoxDynError;

/// Longest failure description persisted in `last_error`.
pub const MAX_ERROR_LEN: usize = 500;

macro_rules! bigint_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub i64);

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<i64> for $name {
            fn from(value: i64) -> Self {
                Self(value)
            }
        }

        impl sqlx::Type<PgDb> for $name {
            fn type_info() -> PgTypeInfo {
                <i64 as sqlx::Type<PgDb>>::type_info()
            }
        }

        impl<'r> sqlx::Decode<'r, PgDb> for $name {
            fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
                Ok(Self(<i64 as sqlx::Decode<PgDb>>::decode(value)?))
            }
        }

        impl sqlx::Encode<'_, PgDb> for $name {
            fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
                <i64 as sqlx::Encode<PgDb>>::encode_by_ref(&self.0, buf)
            }
        }
    };
}

bigint_id!(
    /// Surrogate key of a queue row, assigned at insertion.
    EntryId
);

bigint_id!(
    /// Chat (conversation) identifier on the bot platform.
    ChatId
);

bigint_id!(
    /// The platform's identifier for an inbound update.
    ///
    /// Unique per update; the idempotency key of the inbound queue.
    UpdateId
);

/// Lifecycle status of a queue row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueStatus {
    /// Waiting for its first claim.
    Pending,
    /// Claimed by a worker under a lease.
    Processing,
    /// Waiting for `next_attempt_at` after a transient failure.
    Retry,
    /// Outbound terminal success.
    Sent,
    /// Inbound terminal success.
    Processed,
    /// Terminal failure. Kept with its last error for operators.
    Failed,
}

impl QueueStatus {
    /// Database representation.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Retry => "retry",
            Self::Sent => "sent",
            Self::Processed => "processed",
            Self::Failed => "failed",
        }
    }

    /// Whether no further transition can happen from this status.
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Sent | Self::Processed | Self::Failed)
    }
}

impl fmt::Display for QueueStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for QueueStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "retry" => Ok(Self::Retry),
            "sent" => Ok(Self::Sent),
            "processed" => Ok(Self::Processed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("invalid queue status: {other}")),
        }
    }
}

impl sqlx::Type<PgDb> for QueueStatus {
    fn type_info() -> PgTypeInfo {
        <&str as sqlx::Type<PgDb>>::type_info()
    }
}

impl<'r> sqlx::Decode<'r, PgDb> for QueueStatus {
    fn decode(value: PgValueRef<'r>) -> Result<Self, BoxDynError> {
        let s = <&str as sqlx::Decode<PgDb>>::decode(value)?;
        Ok(s.parse()?)
    }
}

impl sqlx::Encode<'_, PgDb> for QueueStatus {
    fn encode_by_ref(&self, buf: &mut PgArgumentBuffer) -> EncodeResult {
        <&str as sqlx::Encode<PgDb>>::encode_by_ref(&self.as_str(), buf)
    }
}

/// Proof of a claim: the row and the token stamped on it when claimed.
///
/// Outcome updates only apply while the row is still held under this token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Claim {
    /// Claimed row.
    pub id: EntryId,
    /// Token written by the claim.
    pub token: Uuid,
}

/// How a claimed row that did not succeed is resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Make the row claimable again at `next_attempt_at`.
    Retry {
        /// Truncated failure description.
        last_error: String,
        /// Earliest time of the next claim.
        next_attempt_at: DateTime<Utc>,
    },
    /// Terminal failure.
    Failed {
        /// Truncated failure description.
        last_error: String,
        /// When the row became terminal.
        failed_at: DateTime<Utc>,
    },
}

impl Resolution {
    /// Schedules another attempt.
    pub fn retry(error: &str, next_attempt_at: DateTime<Utc>) -> Self {
        Self::Retry { last_error: truncate_error(error), next_attempt_at }
    }

    /// Fails the row permanently.
    pub fn failed(error: &str, failed_at: DateTime<Utc>) -> Self {
        Self::Failed { last_error: truncate_error(error), failed_at }
    }

    /// Status written by this resolution.
    pub const fn status(&self) -> QueueStatus {
        match self {
            Self::Retry { .. } => QueueStatus::Retry,
            Self::Failed { .. } => QueueStatus::Failed,
        }
    }

    /// Failure description written to `last_error`.
    pub fn last_error(&self) -> &str {
        match self {
            Self::Retry { last_error, .. } | Self::Failed { last_error, .. } => last_error,
        }
    }

    /// `processed_at` column value.
    pub const fn processed_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Retry { .. } => None,
            Self::Failed { failed_at, .. } => Some(*failed_at),
        }
    }

    /// `next_attempt_at` column value.
    pub const fn next_attempt_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Retry { next_attempt_at, .. } => Some(*next_attempt_at),
            Self::Failed { .. } => None,
        }
    }
}

/// Truncates a failure description to [`MAX_ERROR_LEN`] characters.
pub fn truncate_error(error: &str) -> String {
    match error.char_indices().nth(MAX_ERROR_LEN) {
        Some((byte_index, _)) => error[..byte_index].to_string(),
        None => error.to_string(),
    }
}

/// Mutable queue bookkeeping shared by both queues.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct QueueState {
    /// Current lifecycle status.
    pub status: QueueStatus,
    /// Number of claims so far. Never decremented.
    pub attempts: i32,
    /// Last failure reason.
    pub last_error: Option<String>,
    /// Set on terminal success or terminal failure.
    pub processed_at: Option<DateTime<Utc>>,
    /// Earliest claim time of a `RETRY` row; `None` means immediately.
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Lease expiry of a `PROCESSING` row.
    pub locked_until: Option<DateTime<Utc>>,
    /// Token of the current claim.
    pub claim_token: Option<Uuid>,
}

impl QueueState {
    /// State of a freshly enqueued row.
    pub const fn pending() -> Self {
        Self {
            status: QueueStatus::Pending,
            attempts: 0,
            last_error: None,
            processed_at: None,
            next_attempt_at: None,
            locked_until: None,
            claim_token: None,
        }
    }

    /// Whether a claim at `now` may take this row.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            QueueStatus::Pending | QueueStatus::Retry => {
                self.next_attempt_at.map_or(true, |at| at <= now)
            },
            QueueStatus::Processing => self.locked_until.map_or(true, |until| until <= now),
            QueueStatus::Sent | QueueStatus::Processed | QueueStatus::Failed => false,
        }
    }

    /// Whether the row is an abandoned final attempt: its lease expired and
    /// the attempt ceiling is already reached.
    pub fn is_exhausted_lease(&self, now: DateTime<Utc>, max_attempts: u32) -> bool {
        self.status == QueueStatus::Processing
            && self.locked_until.map_or(true, |until| until <= now)
            && i64::from(self.attempts) >= i64::from(max_attempts)
    }

    /// Applies a claim: one more attempt under a fresh lease.
    pub fn claim(&mut self, now: DateTime<Utc>, lease: chrono::Duration, token: Uuid) {
        self.status = QueueStatus::Processing;
        self.attempts = self.attempts.saturating_add(1);
        self.locked_until = Some(now.checked_add_signed(lease).unwrap_or(DateTime::<Utc>::MAX_UTC));
        self.next_attempt_at = None;
        self.claim_token = Some(token);
    }

    /// Whether the row is still held by the claim carrying `token`.
    pub fn is_held_by(&self, token: Uuid) -> bool {
        self.status == QueueStatus::Processing && self.claim_token == Some(token)
    }

    /// Moves the row to its terminal success status.
    pub fn complete(&mut self, done: QueueStatus, at: DateTime<Utc>) {
        self.status = done;
        self.processed_at = Some(at);
        self.locked_until = None;
        self.next_attempt_at = None;
    }

    /// Applies a retry or failure resolution.
    pub fn resolve(&mut self, resolution: &Resolution) {
        self.status = resolution.status();
        self.last_error = Some(resolution.last_error().to_string());
        self.processed_at = resolution.processed_at();
        self.next_attempt_at = resolution.next_attempt_at();
        self.locked_until = None;
    }
}

/// Behaviour shared by inbound and outbound queue rows.
pub trait QueueEntry: Clone + Send + Sync + fmt::Debug + 'static {
    /// Terminal success status of this queue.
    const DONE: QueueStatus;

    /// Surrogate key.
    fn id(&self) -> EntryId;

    /// Insertion time, used for oldest-first claiming.
    fn arrived_at(&self) -> DateTime<Utc>;

    /// Queue bookkeeping.
    fn state(&self) -> &QueueState;

    /// Mutable queue bookkeeping.
    fn state_mut(&mut self) -> &mut QueueState;

    /// Deduplication key, if the queue deduplicates.
    fn dedup_key(&self) -> Option<i64> {
        None
    }

    /// The claim this row is currently held under.
    fn claim(&self) -> Option<Claim> {
        let state = self.state();
        match (state.status, state.claim_token) {
            (QueueStatus::Processing, Some(token)) => Some(Claim { id: self.id(), token }),
            _ => None,
        }
    }
}

/// A row about to be enqueued.
pub trait NewQueueEntry: Send + Sync + fmt::Debug + 'static {
    /// Stored row type.
    type Entry: QueueEntry;

    /// Deduplication key, if the queue deduplicates.
    fn dedup_key(&self) -> Option<i64> {
        None
    }

    /// Builds the stored row in its pending state.
    fn into_entry(self, id: EntryId, arrived_at: DateTime<Utc>) -> Self::Entry;
}

/// An update received from the chat platform.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct InboundUpdate {
    /// Surrogate key.
    pub id: EntryId,
    /// Platform update identifier. Unique.
    pub external_id: UpdateId,
    /// Raw update body as received.
    pub payload: String,
    /// When the update was stored.
    pub received_at: DateTime<Utc>,
    /// Queue bookkeeping.
    #[sqlx(flatten)]
    pub state: QueueState,
}

impl QueueEntry for InboundUpdate {
    const DONE: QueueStatus = QueueStatus::Processed;

    fn id(&self) -> EntryId {
        self.id
    }

    fn arrived_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    fn state(&self) -> &QueueState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut QueueState {
        &mut self.state
    }

    fn dedup_key(&self) -> Option<i64> {
        Some(self.external_id.0)
    }
}

/// An inbound update to enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewInboundUpdate {
    /// Platform update identifier.
    pub external_id: UpdateId,
    /// Raw update body.
    pub payload: String,
}

impl NewQueueEntry for NewInboundUpdate {
    type Entry = InboundUpdate;

    fn dedup_key(&self) -> Option<i64> {
        Some(self.external_id.0)
    }

    fn into_entry(self, id: EntryId, arrived_at: DateTime<Utc>) -> InboundUpdate {
        InboundUpdate {
            id,
            external_id: self.external_id,
            payload: self.payload,
            received_at: arrived_at,
            state: QueueState::pending(),
        }
    }
}

/// A request to invoke a remote API method for a chat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct OutboundMessage {
    /// Surrogate key.
    pub id: EntryId,
    /// Target chat.
    pub destination: ChatId,
    /// Remote method name, e.g. `sendMessage`.
    pub method: String,
    /// Serialized JSON request body.
    pub payload: String,
    /// When the message was enqueued.
    pub created_at: DateTime<Utc>,
    /// Queue bookkeeping.
    #[sqlx(flatten)]
    pub state: QueueState,
}

impl QueueEntry for OutboundMessage {
    const DONE: QueueStatus = QueueStatus::Sent;

    fn id(&self) -> EntryId {
        self.id
    }

    fn arrived_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    fn state(&self) -> &QueueState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut QueueState {
        &mut self.state
    }
}

/// An outbound message to enqueue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewOutboundMessage {
    /// Target chat.
    pub destination: ChatId,
    /// Remote method name.
    pub method: String,
    /// Serialized JSON request body.
    pub payload: String,
}

impl NewQueueEntry for NewOutboundMessage {
    type Entry = OutboundMessage;

    fn into_entry(self, id: EntryId, arrived_at: DateTime<Utc>) -> OutboundMessage {
        OutboundMessage {
            id,
            destination: self.destination,
            method: self.method,
            payload: self.payload,
            created_at: arrived_at,
            state: QueueState::pending(),
        }
    }
}
