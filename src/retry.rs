//! Retry Logic
//!
//! Bounded retry with a configurable backoff schedule, used by the
//! dispatcher to re-poll admission while a verdict is reject or unknown.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use tokio_prompt_admission::retry::{RetryPolicy, RetryResult};
//!
//! let policy = RetryPolicy::exponential(3, Duration::from_millis(100));
//!
//! match policy.retry_until(&mut shutdown_rx, |attempt| check(attempt)).await {
//!     RetryResult::Success { value, .. } => use_it(value),
//!     RetryResult::Exhausted { last_error, attempts } => give_up(last_error, attempts),
//!     RetryResult::Cancelled { attempts, .. } => stop(attempts),
//! }
//! ```

use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, warn};

/// Retry policy configuration
#[derive(Clone, Debug, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first. Always at least 1.
    pub max_attempts: u32,
    /// Delay schedule between attempts.
    pub strategy: RetryStrategy,
    /// Add up to 25% random jitter to every delay.
    pub jitter: bool,
}

/// Retry backoff strategy
#[derive(Clone, Debug, PartialEq)]
pub enum RetryStrategy {
    /// Fixed delay between retries
    Fixed(Duration),
    /// Exponential backoff (delay multiplies each time, capped)
    Exponential {
        /// Delay before the second attempt.
        initial_delay: Duration,
        /// Upper bound on any delay.
        max_delay: Duration,
        /// Growth factor per attempt.
        multiplier: f64,
    },
    /// Linear backoff (delay increases linearly, capped)
    Linear {
        /// Delay before the second attempt.
        initial_delay: Duration,
        /// Added per further attempt.
        increment: Duration,
        /// Upper bound on any delay.
        max_delay: Duration,
    },
}

/// Outcome of [`RetryPolicy::retry_until`].
#[derive(Debug, PartialEq)]
pub enum RetryResult<T, E> {
    /// Operation succeeded
    Success {
        /// Value returned by the successful attempt.
        value: T,
        /// Attempt number that succeeded (1-based).
        attempts: u32,
    },
    /// All attempts failed
    Exhausted {
        /// Error from the final attempt.
        last_error: E,
        /// Attempts made.
        attempts: u32,
    },
    /// Cancellation fired while waiting between attempts
    Cancelled {
        /// Error from the latest attempt, if any ran.
        last_error: Option<E>,
        /// Attempts made.
        attempts: u32,
    },
}

impl RetryPolicy {
    /// Create policy with fixed delay
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            strategy: RetryStrategy::Fixed(delay),
            jitter: false,
        }
    }

    /// Create policy with exponential backoff (doubling, capped at 60s)
    pub fn exponential(max_attempts: u32, initial_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            strategy: RetryStrategy::Exponential {
                initial_delay,
                max_delay: Duration::from_secs(60),
                multiplier: 2.0,
            },
            jitter: false,
        }
    }

    /// Create policy with linear backoff (capped at 60s)
    pub fn linear(max_attempts: u32, initial_delay: Duration, increment: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            strategy: RetryStrategy::Linear {
                initial_delay,
                increment,
                max_delay: Duration::from_secs(60),
            },
            jitter: false,
        }
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Run `attempt` until it succeeds, attempts run out, or `cancel`
    /// flips to `true` during a backoff wait.
    ///
    /// `attempt` receives the 1-based attempt number. Cancellation is only
    /// observed between attempts; an attempt in progress always completes.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub async fn retry_until<F, T, E>(
        &self,
        cancel: &mut watch::Receiver<bool>,
        mut attempt: F,
    ) -> RetryResult<T, E>
    where
        F: FnMut(u32) -> Result<T, E>,
        E: std::fmt::Display,
    {
        let mut n = 0;
        loop {
            n += 1;
            debug!(attempt = n, max = self.max_attempts, "retry: attempting operation");

            let error = match attempt(n) {
                Ok(value) => {
                    if n > 1 {
                        debug!(attempt = n, "retry: operation succeeded after retries");
                    }
                    return RetryResult::Success { value, attempts: n };
                }
                Err(e) => e,
            };

            if n >= self.max_attempts {
                warn!(attempts = n, error = %error, "retry: all attempts exhausted");
                return RetryResult::Exhausted {
                    last_error: error,
                    attempts: n,
                };
            }

            let delay = self.delay_for(n);
            debug!(
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                error = %error,
                "retry: waiting before next attempt"
            );

            if *cancel.borrow() {
                return RetryResult::Cancelled {
                    last_error: Some(error),
                    attempts: n,
                };
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                changed = cancel.changed() => {
                    // A dropped sender cannot cancel anymore; keep the schedule.
                    if changed.is_ok() && *cancel.borrow() {
                        return RetryResult::Cancelled {
                            last_error: Some(error),
                            attempts: n,
                        };
                    }
                    if changed.is_err() {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }

    /// Delay to wait after failed attempt number `attempt` (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        if self.jitter {
            with_jitter(base)
        } else {
            base
        }
    }

    fn base_delay(&self, attempt: u32) -> Duration {
        let step = attempt.saturating_sub(1);
        match &self.strategy {
            RetryStrategy::Fixed(delay) => *delay,
            RetryStrategy::Exponential {
                initial_delay,
                max_delay,
                multiplier,
            } => {
                let exp = i32::try_from(step).unwrap_or(i32::MAX);
                let ms = initial_delay.as_millis() as f64 * multiplier.powi(exp);
                if !ms.is_finite() || ms >= max_delay.as_millis() as f64 {
                    *max_delay
                } else {
                    Duration::from_millis(ms as u64).min(*max_delay)
                }
            }
            RetryStrategy::Linear {
                initial_delay,
                increment,
                max_delay,
            } => increment
                .checked_mul(step)
                .and_then(|inc| initial_delay.checked_add(inc))
                .unwrap_or(*max_delay)
                .min(*max_delay),
        }
    }

    /// Upper bound on total time spent waiting between attempts (no jitter).
    pub fn total_backoff(&self) -> Duration {
        (1..self.max_attempts).map(|n| self.base_delay(n)).sum()
    }
}

/// Add up to 25% jitter to prevent synchronized re-polling
pub fn with_jitter(duration: Duration) -> Duration {
    use rand::Rng;
    let quarter = u64::try_from(duration.as_millis() / 4).unwrap_or(u64::MAX);
    if quarter == 0 {
        return duration;
    }
    let jitter = rand::thread_rng().gen_range(0..quarter);
    duration + Duration::from_millis(jitter)
}
