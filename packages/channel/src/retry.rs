//! Retry helpers for transient channel errors.
//!
//! Channel reads and writes that fail with a transient error (see
//! [`ChannelError::is_transient`]) are retried with exponential backoff.
//! Permanent errors are returned immediately.
//!
//! # Usage
//!
//! ```ignore
//! use crime_stream_channel::retry::{RetryPolicy, retry_transient};
//!
//! let policy = RetryPolicy::default();
//! let position = retry_transient(&policy, "publish", || producer.send(topic, None, &payload)).await?;
//! ```

use std::future::Future;
use std::time::Duration;

use crate::ChannelError;

/// Bounded exponential backoff settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry. Doubles on each subsequent retry.
    pub initial_backoff: Duration,
    /// Upper bound for a single delay.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    /// Five retries starting at one second: 1s, 2s, 4s, 8s, 16s.
    fn default() -> Self {
        Self {
            max_retries: 5,
            initial_backoff: Duration::from_secs(1),
            max_backoff: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Starts a fresh backoff sequence for one logical operation.
    #[must_use]
    pub const fn backoff(&self) -> Backoff {
        Backoff {
            policy: *self,
            attempt: 0,
        }
    }

    /// Delay before retry number `retry` (1-based).
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        let factor = 1u32.checked_shl(retry.saturating_sub(1)).unwrap_or(u32::MAX);
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Backoff state for one logical operation.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    attempt: u32,
}

impl Backoff {
    /// Returns the delay before the next retry, or `None` when the retry
    /// budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.attempt >= self.policy.max_retries {
            return None;
        }
        self.attempt += 1;
        Some(self.policy.delay_for(self.attempt))
    }

    /// Number of retries handed out so far.
    #[must_use]
    pub const fn retries(&self) -> u32 {
        self.attempt
    }

    /// Forgets previous failures after a success.
    pub const fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Consumes the backoff and wraps `error` as a retries-exhausted error.
    #[must_use]
    pub fn exhausted(self, error: ChannelError) -> ChannelError {
        ChannelError::RetriesExhausted {
            attempts: self.attempt + 1,
            source: Box::new(error),
        }
    }
}

/// Runs `operation`, retrying transient failures according to `policy`.
///
/// The closure is called once per attempt so that each attempt gets a fresh
/// future.
///
/// # Errors
///
/// Returns the first permanent error, or [`ChannelError::RetriesExhausted`]
/// wrapping the last transient error once the retry budget is spent.
pub async fn retry_transient<T, F, Fut>(
    policy: &RetryPolicy,
    label: &str,
    operation: F,
) -> Result<T, ChannelError>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T, ChannelError>>,
{
    let mut backoff = policy.backoff();

    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if e.is_transient() => match backoff.next_delay() {
                Some(delay) => {
                    log::warn!(
                        "{label}: transient error ({e}), retry {}/{} in {delay:?}...",
                        backoff.retries(),
                        policy.max_retries,
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    log::error!("{label}: giving up after {} retries: {e}", policy.max_retries);
                    return Err(backoff.exhausted(e));
                }
            },
            Err(e) => return Err(e),
        }
    }
}
