//! Property-based tests for backoff, transition planning, and the sweeper
//! gate. In-memory and deterministic.

use std::time::{Duration, Instant};

use chrono::Utc;
use proptest::{prelude::*, test_runner::Config as ProptestConfig};
use surety_delivery::{plan_transition, BackoffPolicy, OutcomeKind, SecondGate, Transition};

/// Deterministic property test configuration for CI stability.
fn proptest_config() -> ProptestConfig {
    ProptestConfig {
        cases: 100,
        timeout: 5000,
        fork: false,
        failure_persistence: None,
        source_file: None,
        ..ProptestConfig::default()
    }
}

fn kind_strategy() -> impl Strategy<Value = OutcomeKind> {
    prop::sample::select(vec![
        OutcomeKind::Successful,
        OutcomeKind::ClientError,
        OutcomeKind::ServerError,
        OutcomeKind::OtherStatus,
        OutcomeKind::TimedOut,
        OutcomeKind::Inconsistent,
    ])
}

proptest! {
    #![proptest_config(proptest_config())]

    /// Delays never shrink as the attempt count grows, and never exceed the
    /// ceiling.
    #[test]
    fn backoff_is_monotone_and_capped(
        factor in 1i32..6,
        base_ms in 100u64..5000,
        max_s in 1u64..7200,
    ) {
        let policy = BackoffPolicy {
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_secs(max_s),
        };

        let mut previous = Duration::ZERO;
        for count in 0..30 {
            let delay = policy.delay_for(factor, count);
            prop_assert!(delay >= previous, "delay shrank at count {count}");
            prop_assert!(delay <= policy.max_delay.max(policy.base_delay));
            previous = delay;
        }
    }

    /// Successive retry timestamps strictly increase for a retryable row,
    /// because each is offset from a later `now` by a no-smaller delay.
    #[test]
    fn retry_timestamps_strictly_increase(factor in 1i32..4) {
        let policy = BackoffPolicy::default();
        let mut now = Utc::now();
        let mut previous = now;

        for count in 0..12 {
            let at = policy.retry_at(now, factor, count);
            prop_assert!(at > previous);
            previous = at;
            // The next attempt happens once the cool-down has elapsed.
            now = at + chrono::Duration::milliseconds(1);
        }
    }

    /// The persisted attempt count never decreases, whatever the outcome.
    #[test]
    fn attempt_count_is_monotone(
        kind in kind_strategy(),
        retry_inconsistent in any::<bool>(),
        retry_count in 0i32..50,
        max_retries in 0i32..50,
        factor in 1i32..4,
    ) {
        let transition = plan_transition(
            kind,
            retry_inconsistent,
            retry_count,
            max_retries,
            factor,
            &BackoffPolicy::default(),
            Utc::now(),
        );

        match transition {
            Transition::Complete => {},
            Transition::Fail { retry_count: written } => prop_assert!(written >= retry_count),
            Transition::Defer { retry_count: written, .. } => {
                prop_assert_eq!(written, retry_count + 1);
            },
        }
    }

    /// Only successful outcomes complete; only retryable ones defer; a
    /// deferred row never exceeds its retry budget.
    #[test]
    fn transition_targets_are_consistent(
        kind in kind_strategy(),
        retry_inconsistent in any::<bool>(),
        retry_count in 0i32..50,
        max_retries in 0i32..50,
    ) {
        let now = Utc::now();
        let transition = plan_transition(
            kind,
            retry_inconsistent,
            retry_count,
            max_retries,
            2,
            &BackoffPolicy::default(),
            now,
        );

        match transition {
            Transition::Complete => prop_assert_eq!(kind, OutcomeKind::Successful),
            Transition::Defer { retry_at, retry_count: written } => {
                prop_assert!(kind.is_retryable(retry_inconsistent));
                prop_assert!(written <= max_retries);
                prop_assert!(retry_at > now);
            },
            Transition::Fail { .. } => {
                let out_of_budget = retry_count >= max_retries;
                let non_retryable = !kind.is_retryable(retry_inconsistent);
                prop_assert!(out_of_budget || non_retryable);
                prop_assert_ne!(kind, OutcomeKind::Successful);
            },
        }
    }

    /// Within any single second the gate opens at most once.
    #[test]
    fn gate_opens_at_most_once_per_second(offsets_ms in prop::collection::vec(0u64..1000, 1..50)) {
        let start = Instant::now();
        let gate = SecondGate::new(start);

        // Baseline second: never fires.
        for offset in &offsets_ms {
            prop_assert!(!gate.try_enter(start + Duration::from_millis(*offset)));
        }

        // One rolled-over second: fires exactly once however often polled.
        let mut opened = 0;
        for offset in &offsets_ms {
            if gate.try_enter(start + Duration::from_millis(1000 + offset)) {
                opened += 1;
            }
        }
        prop_assert_eq!(opened, 1);
    }
}
