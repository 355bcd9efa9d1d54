//! Property-based tests for the queue state machine.
//!
//! Drives a single row through random sequences of claims, outcomes and
//! clock movements and checks the lifecycle invariants after every step.

use chrono::{Duration, TimeZone, Utc};
use courier_core::{QueueState, QueueStatus, Resolution};
use proptest::{prelude::*, test_runner::Config as ProptestConfig};
use uuid::Uuid;

fn proptest_config() -> ProptestConfig {
    ProptestConfig {
        cases: 200,
        fork: false,
        failure_persistence: None,
        ..ProptestConfig::default()
    }
}

#[derive(Debug, Clone)]
enum Step {
    Advance(i64),
    Claim,
    Done,
    Retry(i64),
    Fail,
}

fn step_strategy() -> impl Strategy<Value = Step> {
    prop_oneof![
        (0i64..120).prop_map(Step::Advance),
        Just(Step::Claim),
        Just(Step::Done),
        (0i64..60).prop_map(Step::Retry),
        Just(Step::Fail),
    ]
}

proptest! {
    #![proptest_config(proptest_config())]

    #[test]
    fn lifecycle_invariants_hold(steps in prop::collection::vec(step_strategy(), 1..60)) {
        let lease = Duration::seconds(30);
        let mut now = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let mut state = QueueState::pending();
        let mut token = None;

        for step in steps {
            let before = state.clone();

            match step {
                Step::Advance(secs) => now += Duration::seconds(secs),
                Step::Claim => {
                    if state.is_claimable(now) {
                        let fresh = Uuid::new_v4();
                        state.claim(now, lease, fresh);
                        token = Some(fresh);
                        prop_assert_eq!(state.attempts, before.attempts + 1);
                        prop_assert!(!state.is_claimable(now));
                    }
                },
                Step::Done => {
                    if token.is_some_and(|t| state.is_held_by(t)) {
                        state.complete(QueueStatus::Sent, now);
                    }
                },
                Step::Retry(delay) => {
                    if token.is_some_and(|t| state.is_held_by(t)) {
                        state.resolve(&Resolution::retry("transient", now + Duration::seconds(delay)));
                    }
                },
                Step::Fail => {
                    if token.is_some_and(|t| state.is_held_by(t)) {
                        state.resolve(&Resolution::failed("permanent", now));
                    }
                },
            }

            prop_assert!(state.attempts >= before.attempts);
            if before.status.is_terminal() {
                prop_assert_eq!(&state, &before);
            }
            if state.status.is_terminal() {
                prop_assert!(state.processed_at.is_some());
                prop_assert!(!state.is_claimable(now + Duration::days(365)));
            }
            if state.status == QueueStatus::Processing {
                prop_assert!(state.locked_until.is_some());
            }
        }
    }
}
