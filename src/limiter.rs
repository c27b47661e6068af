//! Per-session token bucket rate limiting.
//!
//! Classic continuous bucket: tokens accrue at `capacity / 60s` up to
//! `capacity`, each allowed call spends one. The bucket state itself lives
//! inside the session store (one [`RateLimitState`] per session, dropped
//! with the session); this module holds the bucket arithmetic so it can be
//! tested on its own.
//!
//! Denial is a policy signal surfaced to the caller with a retry hint -
//! it is never treated as a transient fault to retry internally.

use std::time::{Duration, Instant};

/// Refill window: a full bucket's worth of tokens accrues over one minute.
const REFILL_WINDOW_SECS: f64 = 60.0;

/// Mutable per-session bucket state. Owned by the session store.
#[derive(Debug, Clone)]
pub struct RateLimitState {
    tokens_remaining: f64,
    last_refill_at: Instant,
}

/// Outcome of a single acquisition attempt. Never blocks; the caller
/// decides whether to wait out `retry_after` or fail fast.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AcquireDecision {
    Allowed { remaining: u32 },
    Denied { remaining: u32, retry_after: Duration },
}

/// Bucket parameters, shared by every session.
#[derive(Debug, Clone, Copy)]
pub struct TokenBucket {
    capacity: f64,
    refill_per_sec: f64,
}

impl TokenBucket {
    pub fn new(capacity: u32) -> Self {
        let capacity = f64::from(capacity.max(1));
        Self {
            capacity,
            refill_per_sec: capacity / REFILL_WINDOW_SECS,
        }
    }

    /// A brand-new session starts with a full bucket, so its first burst
    /// up to `capacity` calls is never throttled.
    pub fn new_state(&self, now: Instant) -> RateLimitState {
        RateLimitState {
            tokens_remaining: self.capacity,
            last_refill_at: now,
        }
    }

    /// Refill from elapsed time, then try to spend one token.
    pub fn try_acquire(&self, state: &mut RateLimitState, now: Instant) -> AcquireDecision {
        self.refill(state, now);

        if state.tokens_remaining >= 1.0 {
            state.tokens_remaining -= 1.0;
            AcquireDecision::Allowed {
                remaining: state.tokens_remaining as u32,
            }
        } else {
            let deficit = 1.0 - state.tokens_remaining;
            let retry_after = Duration::from_secs_f64(deficit / self.refill_per_sec);
            AcquireDecision::Denied {
                remaining: state.tokens_remaining as u32,
                retry_after,
            }
        }
    }

    fn refill(&self, state: &mut RateLimitState, now: Instant) {
        let elapsed = now.saturating_duration_since(state.last_refill_at);
        let refilled = state.tokens_remaining + elapsed.as_secs_f64() * self.refill_per_sec;
        state.tokens_remaining = refilled.min(self.capacity);
        state.last_refill_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_burst_then_denied() {
        let bucket = TokenBucket::new(100);
        let now = Instant::now();
        let mut state = bucket.new_state(now);

        for i in 0..100 {
            match bucket.try_acquire(&mut state, now) {
                AcquireDecision::Allowed { .. } => {}
                AcquireDecision::Denied { .. } => panic!("call {i} should be allowed"),
            }
        }

        match bucket.try_acquire(&mut state, now) {
            AcquireDecision::Denied { remaining, retry_after } => {
                assert_eq!(remaining, 0);
                assert!(retry_after > Duration::ZERO);
            }
            AcquireDecision::Allowed { .. } => panic!("call 101 should be denied"),
        }
    }

    #[test]
    fn refills_after_waiting() {
        let bucket = TokenBucket::new(100);
        let now = Instant::now();
        let mut state = bucket.new_state(now);

        for _ in 0..100 {
            bucket.try_acquire(&mut state, now);
        }
        assert!(matches!(
            bucket.try_acquire(&mut state, now),
            AcquireDecision::Denied { .. }
        ));

        // A full refill window later the bucket is full again.
        let later = now + Duration::from_secs(60);
        for _ in 0..100 {
            assert!(matches!(
                bucket.try_acquire(&mut state, later),
                AcquireDecision::Allowed { .. }
            ));
        }
    }

    #[test]
    fn partial_refill_grants_partial_tokens() {
        let bucket = TokenBucket::new(60);
        let now = Instant::now();
        let mut state = bucket.new_state(now);

        for _ in 0..60 {
            bucket.try_acquire(&mut state, now);
        }

        // 60 capacity / 60s window = 1 token per second.
        let later = now + Duration::from_secs(2);
        assert!(matches!(
            bucket.try_acquire(&mut state, later),
            AcquireDecision::Allowed { .. }
        ));
        assert!(matches!(
            bucket.try_acquire(&mut state, later),
            AcquireDecision::Allowed { .. }
        ));
        assert!(matches!(
            bucket.try_acquire(&mut state, later),
            AcquireDecision::Denied { .. }
        ));
    }

    #[test]
    fn tokens_never_exceed_capacity() {
        let bucket = TokenBucket::new(10);
        let now = Instant::now();
        let mut state = bucket.new_state(now);

        // Long idle period must not bank more than capacity.
        let later = now + Duration::from_secs(3600);
        for _ in 0..10 {
            assert!(matches!(
                bucket.try_acquire(&mut state, later),
                AcquireDecision::Allowed { .. }
            ));
        }
        assert!(matches!(
            bucket.try_acquire(&mut state, later),
            AcquireDecision::Denied { .. }
        ));
    }

    #[test]
    fn denial_reports_time_until_next_token() {
        let bucket = TokenBucket::new(60);
        let now = Instant::now();
        let mut state = bucket.new_state(now);

        for _ in 0..60 {
            bucket.try_acquire(&mut state, now);
        }

        match bucket.try_acquire(&mut state, now) {
            AcquireDecision::Denied { retry_after, .. } => {
                // 1 token per second, empty bucket: next token in ~1s.
                assert!(retry_after > Duration::from_millis(900));
                assert!(retry_after <= Duration::from_secs(1));
            }
            AcquireDecision::Allowed { .. } => panic!("bucket should be empty"),
        }
    }
}
