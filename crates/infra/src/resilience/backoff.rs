//! Exponential backoff with jitter.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

/// Redrive delay: doubling from this base...
pub const REDRIVE_BASE_DELAY: Duration = Duration::from_secs(1);
/// ...capped here before jitter...
pub const REDRIVE_MAX_BACKOFF: Duration = Duration::from_secs(300);
/// ...and never more than the transport's maximum send delay.
pub const REDRIVE_MAX_DELAY: Duration = Duration::from_secs(900);

/// Fraction of the capped delay added as uniform jitter.
pub const JITTER_FRACTION: f64 = 0.1;

/// Retry policy for transient failures.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts including the first one.
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    /// Delay before retrying after the given attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        backoff_delay(attempt, self.base_delay, self.max_delay)
    }
}

/// `min(base * 2^(attempt-1), max)` without jitter.
pub fn capped_exponential(attempt: u32, base: Duration, max: Duration) -> Duration {
    if attempt == 0 {
        return Duration::ZERO;
    }
    let exp = 2_f64.powi(attempt.saturating_sub(1).min(62) as i32);
    let secs = (base.as_secs_f64() * exp).min(max.as_secs_f64());
    Duration::from_secs_f64(secs)
}

/// Capped exponential delay plus uniform jitter in `[0, 10%]` of it.
pub fn backoff_delay(attempt: u32, base: Duration, max: Duration) -> Duration {
    let delay = capped_exponential(attempt, base, max);
    let jitter = delay.as_secs_f64() * JITTER_FRACTION * rand::random::<f64>();
    delay + Duration::from_secs_f64(jitter)
}

/// Redelivery delay for a dead-lettered message, seeded by how many times
/// it was received.
pub fn redrive_delay(receive_count: u32) -> Duration {
    backoff_delay(receive_count.max(1), REDRIVE_BASE_DELAY, REDRIVE_MAX_BACKOFF).min(REDRIVE_MAX_DELAY)
}

/// Uniform extra spread of up to `jitter_minutes` minutes.
pub fn spread_jitter(jitter_minutes: u32) -> Duration {
    if jitter_minutes == 0 {
        return Duration::ZERO;
    }
    let max_secs = u64::from(jitter_minutes) * 60;
    Duration::from_secs(rand::rng().random_range(0..=max_secs))
}

/// Run `op` until it succeeds, the policy is exhausted, or `retryable`
/// rejects the error. The last error is returned.
pub async fn retry_with_backoff<T, E, F, Fut, P>(
    policy: &RetryPolicy,
    mut op: F,
    retryable: P,
) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    P: Fn(&E) -> bool,
    E: std::fmt::Display,
{
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < policy.max_attempts && retryable(&e) => {
                let delay = policy.delay_for_attempt(attempt);
                warn!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "attempt failed; retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(e) => return Err(e),
        }
    }
}
