//! Property-based tests for retry decisions.
//!
//! Validates:
//! 1. Never retries once max_attempts is reached
//! 2. Never retries auth errors
//! 3. Base delay non-decreasing in attempt number
//! 4. Base delay bounded by max_delay
//! 5. Jitter is non-negative and at most jitter_fraction of the base delay
//! 6. Rate-limit retry_after acts as a floor
//! 7. RetryState never counts past max_attempts

use std::time::Duration;

use chrono::NaiveDate;
use proptest::prelude::*;
use rand::SeedableRng;
use rand::rngs::StdRng;

use watchkeep_core::retry::{ErrorClass, RetryPolicy, RetryState, StopReason};

// =============================================================================
// Strategies
// =============================================================================

fn arb_class() -> impl Strategy<Value = ErrorClass> {
    prop::sample::select(ErrorClass::ALL.to_vec())
}

fn arb_policy(jitter: f64) -> impl Strategy<Value = RetryPolicy> {
    (1_u32..10, 1_u64..10_000, 1.0_f64..4.0, 1_000_u64..600_000)
        .prop_map(move |(max_attempts, base_ms, mult, max_ms)| {
            RetryPolicy::new(
                max_attempts,
                Duration::from_millis(base_ms),
                mult,
                Duration::from_millis(max_ms),
                jitter,
            )
        })
}

// =============================================================================
// Property: attempt and class limits
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(500))]

    #[test]
    fn never_retries_at_or_past_max(
        policy in arb_policy(0.1),
        class in arb_class(),
        extra in 0_u32..20,
    ) {
        let attempt = policy.max_attempts + extra;
        let decision = policy.should_retry(attempt, class, None);
        prop_assert!(!decision.retry);
        prop_assert_eq!(decision.delay, Duration::ZERO);
    }

    #[test]
    fn never_retries_auth(
        policy in arb_policy(0.1),
        attempt in 0_u32..20,
    ) {
        let decision = policy.should_retry(attempt, ErrorClass::Auth, Some(Duration::from_secs(1)));
        prop_assert!(!decision.retry);
        prop_assert_eq!(decision.stop, Some(StopReason::Fatal));
    }

    #[test]
    fn retryable_classes_retry_below_max(
        policy in arb_policy(0.1),
        class in arb_class(),
        seed in any::<u64>(),
    ) {
        prop_assume!(class != ErrorClass::Auth);
        let mut rng = StdRng::seed_from_u64(seed);
        for attempt in 1..policy.max_attempts {
            let decision = policy.should_retry_with_rng(&mut rng, attempt, class, None);
            prop_assert!(decision.retry, "attempt {} of {} not retried", attempt, policy.max_attempts);
        }
    }
}

// =============================================================================
// Property: delay shape
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(300))]

    #[test]
    fn base_delay_non_decreasing_and_capped(policy in arb_policy(0.0)) {
        let mut prev = policy.base_delay_for_attempt(1);
        prop_assert!(prev <= policy.max_delay);
        for attempt in 2..40_u32 {
            let curr = policy.base_delay_for_attempt(attempt);
            prop_assert!(curr >= prev,
                "delay decreased: attempt {} {:?} < {:?}", attempt, curr, prev);
            prop_assert!(curr <= policy.max_delay);
            prev = curr;
        }
    }

    #[test]
    fn jitter_bounded(
        policy in arb_policy(0.1),
        seed in any::<u64>(),
        class in arb_class(),
    ) {
        prop_assume!(class != ErrorClass::Auth && class != ErrorClass::RateLimit);
        let mut rng = StdRng::seed_from_u64(seed);
        for attempt in 1..policy.max_attempts {
            let base = policy.base_delay_for_attempt(attempt);
            let decision = policy.should_retry_with_rng(&mut rng, attempt, class, None);
            prop_assert!(decision.delay >= base);
            let ceiling = base + base.mul_f64(policy.jitter_fraction) + Duration::from_millis(1);
            prop_assert!(decision.delay <= ceiling,
                "delay {:?} exceeds jittered ceiling {:?}", decision.delay, ceiling);
        }
    }

    #[test]
    fn rate_limit_respects_retry_after(
        policy in arb_policy(0.1),
        after_ms in 0_u64..1_000_000,
        seed in any::<u64>(),
    ) {
        prop_assume!(policy.max_attempts > 1);
        let mut rng = StdRng::seed_from_u64(seed);
        let after = Duration::from_millis(after_ms);
        let decision = policy.should_retry_with_rng(&mut rng, 1, ErrorClass::RateLimit, Some(after));
        prop_assert!(decision.retry);
        prop_assert!(decision.delay >= after);
    }
}

// =============================================================================
// Property: RetryState bookkeeping
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(200))]

    #[test]
    fn retry_state_bounded(
        policy in arb_policy(0.0),
        classes in prop::collection::vec(arb_class(), 1..20),
    ) {
        let now = NaiveDate::from_ymd_opt(2026, 1, 1).unwrap().and_hms_opt(0, 0, 0).unwrap();
        let mut state = RetryState::new(policy.max_attempts);
        for (i, class) in classes.iter().enumerate() {
            let decision = policy.should_retry(i as u32 + 1, *class, None);
            state.record_failure(*class, &decision, now);
            prop_assert!(state.attempts <= state.max_attempts);
            prop_assert_eq!(state.last_error_class, Some(*class));
            prop_assert_eq!(state.next_retry_at.is_some(), decision.retry);
        }
    }
}
