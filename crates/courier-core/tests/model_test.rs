//! Integration tests for the queue models.
//!
//! Covers the queue state machine transitions, claimability rules and JSON
//! serialization of rows.

use chrono::{Duration, TimeZone, Utc};
use courier_core::{
    ChatId, EntryId, NewInboundUpdate, NewOutboundMessage, NewQueueEntry, QueueEntry, QueueState,
    QueueStatus, Resolution, UpdateId, MAX_ERROR_LEN,
};
use uuid::Uuid;

fn t0() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

#[test]
fn new_rows_start_pending_with_zero_attempts() {
    let update = NewInboundUpdate { external_id: UpdateId(42), payload: "{}".into() }
        .into_entry(EntryId(1), t0());

    assert_eq!(update.state, QueueState::pending());
    assert_eq!(update.state.attempts, 0);
    assert_eq!(update.received_at, t0());
    assert_eq!(update.dedup_key(), Some(42));
    assert!(update.state.is_claimable(t0()));
}

#[test]
fn outbound_rows_do_not_deduplicate() {
    let new = NewOutboundMessage {
        destination: ChatId(-100),
        method: "sendMessage".into(),
        payload: r#"{"chat_id":-100,"text":"hi"}"#.into(),
    };
    assert_eq!(new.dedup_key(), None);

    let message = new.into_entry(EntryId(9), t0());
    assert_eq!(message.dedup_key(), None);
    assert_eq!(message.arrived_at(), t0());
}

#[test]
fn claimed_row_is_hidden_until_its_lease_expires() {
    let mut state = QueueState::pending();
    state.claim(t0(), Duration::seconds(30), Uuid::new_v4());

    assert_eq!(state.status, QueueStatus::Processing);
    assert_eq!(state.attempts, 1);
    assert!(!state.is_claimable(t0() + Duration::seconds(29)));
    assert!(state.is_claimable(t0() + Duration::seconds(30)));
}

#[test]
fn reclaim_after_expiry_increments_attempts_and_rotates_token() {
    let mut state = QueueState::pending();
    let first = Uuid::new_v4();
    state.claim(t0(), Duration::seconds(30), first);

    let second = Uuid::new_v4();
    state.claim(t0() + Duration::seconds(31), Duration::seconds(30), second);

    assert_eq!(state.attempts, 2);
    assert!(!state.is_held_by(first));
    assert!(state.is_held_by(second));
}

#[test]
fn retry_row_waits_for_next_attempt_at() {
    let mut state = QueueState::pending();
    state.claim(t0(), Duration::seconds(30), Uuid::new_v4());
    state.resolve(&Resolution::retry("HTTP 502", t0() + Duration::seconds(5)));

    assert_eq!(state.status, QueueStatus::Retry);
    assert_eq!(state.last_error.as_deref(), Some("HTTP 502"));
    assert_eq!(state.processed_at, None);
    assert_eq!(state.locked_until, None);
    assert!(!state.is_claimable(t0() + Duration::seconds(4)));
    assert!(state.is_claimable(t0() + Duration::seconds(5)));
}

#[test]
fn terminal_states_are_never_claimable() {
    let far_future = t0() + Duration::days(3650);

    let mut sent = QueueState::pending();
    sent.claim(t0(), Duration::seconds(30), Uuid::new_v4());
    sent.complete(QueueStatus::Sent, t0());
    assert!(sent.status.is_terminal());
    assert_eq!(sent.processed_at, Some(t0()));
    assert!(!sent.is_claimable(far_future));

    let mut failed = QueueState::pending();
    failed.claim(t0(), Duration::seconds(30), Uuid::new_v4());
    failed.resolve(&Resolution::failed("Bad Request: chat not found", t0()));
    assert_eq!(failed.status, QueueStatus::Failed);
    assert_eq!(failed.processed_at, Some(t0()));
    assert_eq!(failed.next_attempt_at, None);
    assert!(!failed.is_claimable(far_future));
}

#[test]
fn exhausted_lease_detection_requires_expiry_and_ceiling() {
    let mut state = QueueState::pending();
    state.claim(t0(), Duration::seconds(30), Uuid::new_v4());

    assert!(!state.is_exhausted_lease(t0() + Duration::seconds(10), 1));
    assert!(state.is_exhausted_lease(t0() + Duration::seconds(30), 1));
    assert!(!state.is_exhausted_lease(t0() + Duration::seconds(30), 2));
}

#[test]
fn resolutions_truncate_long_errors() {
    let long = "x".repeat(MAX_ERROR_LEN * 2);

    let retry = Resolution::retry(&long, t0());
    assert_eq!(retry.last_error().len(), MAX_ERROR_LEN);
    assert_eq!(retry.next_attempt_at(), Some(t0()));

    let failed = Resolution::failed(&long, t0());
    assert_eq!(failed.last_error().len(), MAX_ERROR_LEN);
    assert_eq!(failed.status(), QueueStatus::Failed);
}

#[test]
fn rows_serialize_with_snake_case_status() {
    let message = NewOutboundMessage {
        destination: ChatId(5),
        method: "sendMessage".into(),
        payload: "{}".into(),
    }
    .into_entry(EntryId(3), t0());

    let json = serde_json::to_value(&message).unwrap();
    assert_eq!(json["state"]["status"], "pending");
    assert_eq!(json["destination"], 5);
    assert_eq!(json["id"], 3);
}
