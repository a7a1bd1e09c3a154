//! Retry policies for sources, sinks and batch restarts.
//!
//! The engine retries in three places: source polls, sink emits and whole
//! batches (the restart policy). Each takes a [`RetryPolicy`], and the
//! first two run through [`with_retry`].

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

/// Wait between consecutive tries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backoff {
    /// Retry immediately.
    None,
    /// Same wait before every retry.
    Fixed(Duration),
    /// Wait `base` before the first retry and double it each time, never
    /// exceeding `cap`.
    Exponential {
        /// First wait.
        base: Duration,
        /// Longest wait.
        cap: Duration,
    },
}

impl Backoff {
    /// Wait before retry number `retry` (1-based).
    #[must_use]
    pub fn delay(&self, retry: usize) -> Duration {
        match *self {
            Backoff::None => Duration::ZERO,
            Backoff::Fixed(delay) => delay,
            Backoff::Exponential { base, cap } => {
                let doublings = u32::try_from(retry.saturating_sub(1)).unwrap_or(u32::MAX);
                base.saturating_mul(2u32.saturating_pow(doublings)).min(cap)
            }
        }
    }
}

/// How many times a failed poll, emit or batch is tried again, and how long
/// to wait in between.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first failure.
    pub max_retries: usize,
    /// Wait before each retry.
    pub backoff: Backoff,
}

impl RetryPolicy {
    /// Gives up on the first failure.
    #[must_use]
    pub fn none() -> Self {
        Self {
            max_retries: 0,
            backoff: Backoff::None,
        }
    }

    /// `max_retries` retries spaced `delay` apart.
    #[must_use]
    pub fn fixed(max_retries: usize, delay: Duration) -> Self {
        Self {
            max_retries,
            backoff: if delay.is_zero() {
                Backoff::None
            } else {
                Backoff::Fixed(delay)
            },
        }
    }

    /// `max_retries` retries starting at `base` and doubling up to 30s.
    #[must_use]
    pub fn exponential(max_retries: usize, base: Duration) -> Self {
        Self {
            max_retries,
            backoff: Backoff::Exponential {
                base,
                cap: Duration::from_secs(30),
            },
        }
    }

    /// Whether another retry is allowed after `retries` have been made.
    #[must_use]
    pub fn allows_retry(&self, retries: usize) -> bool {
        retries < self.max_retries
    }
}

/// Three retries from 100ms.
impl Default for RetryPolicy {
    fn default() -> Self {
        Self::exponential(3, Duration::from_millis(100))
    }
}

/// Boxed future borrowing from `'a`, the shape `async_trait` methods return.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Runs `op` against `target`, retrying while `retryable` accepts the error
/// and the policy allows another attempt.
///
/// `target` is lent to each attempt, so `op` can call `&mut self` async
/// methods such as [`SourceAdapter::poll`](rill_core::source::SourceAdapter::poll).
/// `on_error` sees every failure with the number of retries made so far.
///
/// # Errors
///
/// Returns the last error once it is not retryable or retries run out.
pub async fn with_retry<S, T, E, F, R, H>(
    policy: &RetryPolicy,
    target: &mut S,
    mut op: F,
    retryable: R,
    mut on_error: H,
) -> Result<T, E>
where
    S: ?Sized,
    F: for<'a> FnMut(&'a mut S) -> BoxFuture<'a, Result<T, E>>,
    R: Fn(&E) -> bool,
    H: FnMut(usize, &E),
{
    let mut attempt = 0;

    loop {
        match op(&mut *target).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                on_error(attempt, &e);
                if !retryable(&e) || !policy.allows_retry(attempt) {
                    return Err(e);
                }
                attempt += 1;
                let delay = policy.backoff.delay(attempt);
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exponential_backoff_doubles_and_caps() {
        let backoff = Backoff::Exponential {
            base: Duration::from_millis(100),
            cap: Duration::from_millis(300),
        };
        assert_eq!(backoff.delay(1), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(200));
        assert_eq!(backoff.delay(3), Duration::from_millis(300));
        assert_eq!(backoff.delay(usize::MAX), Duration::from_millis(300));
    }

    #[test]
    fn test_policy_bounds() {
        assert!(!RetryPolicy::none().allows_retry(0));
        let policy = RetryPolicy::fixed(2, Duration::from_millis(5));
        assert!(policy.allows_retry(1));
        assert!(!policy.allows_retry(2));
        assert_eq!(policy.backoff.delay(7), Duration::from_millis(5));
        assert_eq!(RetryPolicy::fixed(1, Duration::ZERO).backoff, Backoff::None);
    }

    #[tokio::test]
    async fn test_retries_until_success() {
        let mut calls = 0usize;
        let policy = RetryPolicy::fixed(3, Duration::ZERO);
        let result: Result<usize, &str> = with_retry(
            &policy,
            &mut calls,
            |calls| {
                Box::pin(async move {
                    *calls += 1;
                    if *calls < 3 {
                        Err("transient")
                    } else {
                        Ok(*calls)
                    }
                })
            },
            |_| true,
            |_, _| {},
        )
        .await;
        assert_eq!(result, Ok(3));
        assert_eq!(calls, 3);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let mut calls = 0usize;
        let mut seen = Vec::new();
        let result: Result<(), &str> = with_retry(
            &RetryPolicy::fixed(2, Duration::ZERO),
            &mut calls,
            |calls| {
                Box::pin(async move {
                    *calls += 1;
                    Err("down")
                })
            },
            |_| true,
            |attempt, _| seen.push(attempt),
        )
        .await;
        assert_eq!(result, Err("down"));
        assert_eq!(calls, 3);
        assert_eq!(seen, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_fatal_errors_are_not_retried() {
        let mut calls = 0usize;
        let result: Result<(), &str> = with_retry(
            &RetryPolicy::fixed(5, Duration::ZERO),
            &mut calls,
            |calls| {
                Box::pin(async move {
                    *calls += 1;
                    Err("fatal")
                })
            },
            |e| *e != "fatal",
            |_, _| {},
        )
        .await;
        assert!(result.is_err());
        assert_eq!(calls, 1);
    }
}
