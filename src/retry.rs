//! Retry and reconnect backoff utilities.
//!
//! `RetryPolicy` bounds the retries of plain record requests, while
//! `ReconnectStrategy` paces the unbounded reconnect loop of a realtime
//! subscription.

use std::collections::hash_map::RandomState;
use std::future::Future;
use std::hash::{BuildHasher, Hasher};
use std::time::Duration;

use tracing::debug;

/// Bounded retry schedule for record requests.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    /// Total attempts, counting the first one.
    pub max_attempts: usize,
    pub initial_backoff: Duration,
    /// The delay doubles per retry until it reaches this cap.
    pub max_backoff: Duration,
    /// Upper bound of the random delay added on top.
    pub jitter: Duration,
}

impl RetryPolicy {
    /// Mirrors the backend transport defaults: three retries waiting 3s,
    /// growing to at most 10s.
    pub fn transport_default() -> Self {
        Self {
            max_attempts: 4,
            initial_backoff: Duration::from_secs(3),
            max_backoff: Duration::from_secs(10),
            jitter: Duration::from_millis(250),
        }
    }

    /// A policy that performs exactly one attempt.
    pub fn no_retry() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::ZERO,
            max_backoff: Duration::ZERO,
            jitter: Duration::ZERO,
        }
    }

    /// Delay to wait after the 1-based `attempt` failed.
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        let doublings = u32::try_from(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX)
            .min(31);
        let base = self
            .initial_backoff
            .saturating_mul(1u32 << doublings)
            .min(self.max_backoff.max(self.initial_backoff));
        base + jitter_duration(self.jitter, attempt)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::transport_default()
    }
}

/// Runs `op` until it succeeds, `should_retry` rejects its error, or the
/// policy runs out of attempts. `op` receives the 1-based attempt number.
pub async fn retry_async<T, E, Op, Fut, ShouldRetry>(
    policy: &RetryPolicy,
    mut op: Op,
    mut should_retry: ShouldRetry,
) -> Result<T, E>
where
    Op: FnMut(usize) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    ShouldRetry: FnMut(&E) -> bool,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;

    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(error) => {
                if attempt >= max_attempts || !should_retry(&error) {
                    return Err(error);
                }

                let delay = policy.delay_for_attempt(attempt);
                debug!(
                    event = "request_retry_scheduled",
                    attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64
                );
                if !delay.is_zero() {
                    tokio::time::sleep(delay).await;
                }
                attempt += 1;
            }
        }
    }
}

/// Delay between consecutive failed attempts under [`ReconnectStrategy::None`].
pub const IMMEDIATE_RETRY_FLOOR: Duration = Duration::from_millis(100);

/// Pacing applied between realtime reconnect attempts.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReconnectStrategy {
    /// Wait the same delay before every attempt.
    Constant(Duration),
    /// Double the delay after every consecutive failure, capped at `max`.
    Exponential {
        /// Delay before the first reconnect attempt.
        initial: Duration,
        /// Upper bound for the delay.
        max: Duration,
    },
    /// Reconnect immediately after a session drops. Attempts that keep
    /// failing back to back wait [`IMMEDIATE_RETRY_FLOOR`] between them.
    None,
}

impl Default for ReconnectStrategy {
    fn default() -> Self {
        Self::Constant(Duration::from_secs(1))
    }
}

impl ReconnectStrategy {
    /// Creates the mutable backoff state driven by the reconnect loop.
    pub fn backoff(&self) -> ReconnectBackoff {
        ReconnectBackoff {
            strategy: self.clone(),
            failures: 0,
        }
    }
}

/// Stateful delay sequence for one reconnect loop.
///
/// The sequence restarts from its initial delay once a stream session reaches
/// the relaying state.
#[derive(Clone, Debug)]
pub struct ReconnectBackoff {
    strategy: ReconnectStrategy,
    failures: u32,
}

impl ReconnectBackoff {
    /// Returns the delay to wait before the next attempt and advances the
    /// sequence.
    pub fn next_delay(&mut self) -> Duration {
        let delay = match &self.strategy {
            ReconnectStrategy::Constant(delay) => *delay,
            ReconnectStrategy::Exponential { initial, max } => {
                let factor = 1u32.checked_shl(self.failures.min(31)).unwrap_or(u32::MAX);
                std::cmp::min(initial.saturating_mul(factor), *max)
            }
            ReconnectStrategy::None if self.failures == 0 => Duration::ZERO,
            ReconnectStrategy::None => IMMEDIATE_RETRY_FLOOR,
        };
        self.failures = self.failures.saturating_add(1);
        delay
    }

    /// Resets the sequence after a healthy connection.
    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

fn jitter_duration(max_jitter: Duration, attempt: usize) -> Duration {
    let max_nanos = u64::try_from(max_jitter.as_nanos()).unwrap_or(u64::MAX);
    if max_nanos == 0 {
        return Duration::ZERO;
    }

    let mut hasher = RandomState::new().build_hasher();
    hasher.write_usize(attempt);
    Duration::from_nanos(hasher.finish() % max_nanos.saturating_add(1))
}
