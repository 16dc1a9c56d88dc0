// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Retry with backoff while a predicate holds.
//!
//! The delay before retry `n` (zero based) is `first × factor^n`, clamped to
//! `max`, plus a random extra of up to `jitter × delay`. Delays are derived
//! from the attempt number only, so jitter never compounds.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::debug;

use crate::cluster::StoreError;

/// Delay growth between attempts.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry.
    pub first: Duration,
    /// Upper bound for the un-jittered delay.
    pub max: Duration,
    /// Multiplicative growth per attempt.
    pub factor: f64,
    /// Fraction of the delay added at random (0.0 disables jitter).
    pub jitter: f64,
}

impl BackoffPolicy {
    /// Delay before retry number `attempt`.
    pub fn next(&self, attempt: u32) -> Duration {
        let exp = attempt.min(i32::MAX as u32) as i32;
        let secs = self.first.as_secs_f64() * self.factor.powi(exp);
        let base = if !secs.is_finite() || secs < 0.0 || secs > self.max.as_secs_f64() {
            self.max
        } else {
            Duration::from_secs_f64(secs)
        };
        self.apply_jitter(base)
    }

    fn apply_jitter(&self, base: Duration) -> Duration {
        if self.jitter <= 0.0 || !self.jitter.is_finite() {
            return base;
        }
        let extra = rand::rng().random_range(0.0..=self.jitter);
        base + base.mul_f64(extra)
    }
}

/// Bounded number of attempts with a backoff between them.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Maximum number of attempts, including the first one.
    pub steps: u32,
    /// Delay between attempts.
    pub backoff: BackoffPolicy,
}

impl RetryPolicy {
    /// Policy for conflicting writes: 5 steps, 10ms apart, 10% jitter.
    pub fn default_retry() -> Self {
        Self {
            steps: 5,
            backoff: BackoffPolicy {
                first: Duration::from_millis(10),
                max: Duration::from_secs(10),
                factor: 1.0,
                jitter: 0.1,
            },
        }
    }

    /// Policy for transient failures: 4 steps starting at 10ms, growing 5x.
    pub fn default_backoff() -> Self {
        Self {
            steps: 4,
            backoff: BackoffPolicy {
                first: Duration::from_millis(10),
                max: Duration::from_secs(10),
                factor: 5.0,
                jitter: 0.1,
            },
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::default_retry()
    }
}

/// Run `operation` until it succeeds, `retriable` rejects its error, or the
/// policy runs out of steps. The last error is returned.
pub async fn retry_on<T, E, P, F, Fut>(
    policy: &RetryPolicy,
    retriable: P,
    mut operation: F,
) -> Result<T, E>
where
    P: Fn(&E) -> bool,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let steps = policy.steps.max(1);
    let mut attempt = 0;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt + 1 < steps && retriable(&e) => {
                let delay = policy.backoff.next(attempt);
                debug!(
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    "Retrying operation"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}

/// Errors that can report an optimistic-concurrency conflict.
pub trait ConflictError {
    /// Whether the error is a stale-write conflict.
    fn is_conflict(&self) -> bool;
}

impl ConflictError for StoreError {
    fn is_conflict(&self) -> bool {
        StoreError::is_conflict(self)
    }
}

/// [`retry_on`] retrying only [`StoreError::Conflict`].
pub async fn retry_on_conflict<T, E, F, Fut>(policy: &RetryPolicy, operation: F) -> Result<T, E>
where
    E: ConflictError,
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    retry_on(policy, |e: &E| e.is_conflict(), operation).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_jitter(first_ms: u64, factor: f64) -> BackoffPolicy {
        BackoffPolicy {
            first: Duration::from_millis(first_ms),
            max: Duration::from_secs(1),
            factor,
            jitter: 0.0,
        }
    }

    #[test]
    fn test_backoff_growth_and_cap() {
        let policy = no_jitter(10, 5.0);
        assert_eq!(policy.next(0), Duration::from_millis(10));
        assert_eq!(policy.next(1), Duration::from_millis(50));
        assert_eq!(policy.next(2), Duration::from_millis(250));
        assert_eq!(policy.next(3), Duration::from_secs(1));
        assert_eq!(policy.next(u32::MAX), Duration::from_secs(1));
    }

    #[test]
    fn test_jitter_stays_within_fraction() {
        let policy = RetryPolicy::default_retry().backoff;
        for attempt in 0..50 {
            let d = policy.next(attempt);
            assert!(d >= Duration::from_millis(10));
            assert!(d < Duration::from_millis(12));
        }
    }

    #[test]
    fn test_default_policies() {
        let retry = RetryPolicy::default_retry();
        assert_eq!(retry.steps, 5);
        assert_eq!(retry.backoff.factor, 1.0);
        let backoff = RetryPolicy::default_backoff();
        assert_eq!(backoff.steps, 4);
        assert_eq!(backoff.backoff.factor, 5.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_stops_after_steps() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::default_retry();
        let result: Result<(), &str> = retry_on(
            &policy,
            |_| true,
            || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("busy")
                }
            },
        )
        .await;

        assert_eq!(result, Err("busy"));
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_skips_unretriable_error() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::default_retry();
        let result: Result<(), &str> = retry_on(
            &policy,
            |e| *e == "transient",
            || {
                let calls = calls.clone();
                async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("fatal")
                }
            },
        )
        .await;

        assert_eq!(result, Err("fatal"));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_succeeds_after_conflicts() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::default_retry();
        let result: Result<u32, StoreError> = retry_on_conflict(&policy, || {
            let calls = calls.clone();
            async move {
                let n = calls.fetch_add(1, Ordering::SeqCst);
                if n < 2 {
                    Err(StoreError::Conflict("stale".to_string()))
                } else {
                    Ok(n)
                }
            }
        })
        .await;

        assert_eq!(result.unwrap(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_on_conflict_ignores_other_errors() {
        let calls = Arc::new(AtomicU32::new(0));
        let policy = RetryPolicy::default_retry();
        let result: Result<(), StoreError> = retry_on_conflict(&policy, || {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(StoreError::Unavailable("down".to_string()))
            }
        })
        .await;

        assert!(matches!(result, Err(StoreError::Unavailable(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
