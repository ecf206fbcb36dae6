/*
[INPUT]:  A retry policy, a transience classifier, and an async operation
[OUTPUT]: The operation's result after bounded retries with backoff
[POS]:    Execution layer - the single retry combinator
[UPDATE]: When backoff shape or attempt accounting changes
*/

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tracing::warn;

use perpgrid_exchange::{ExchangeError, Result};

use crate::config::RetryConfig;

/// Capped exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff: Duration::from_millis(config.initial_backoff_ms),
            max_backoff: Duration::from_millis(config.max_backoff_ms),
        }
    }

    /// Delay before retrying after `attempt` (1-based) failed, jittered
    /// into `[delay/2, delay]` so retries from many symbols spread out.
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self
            .initial_backoff
            .saturating_mul(2_u32.saturating_pow(exp))
            .min(self.max_backoff);
        let half = delay / 2;
        half + rand::thread_rng().gen_range(Duration::ZERO..=half)
    }
}

/// Runs `op`, retrying while `is_transient` says so, up to the policy's
/// attempt budget. Every retry emits a telemetry event via `on_retry`.
pub async fn retry<T, F, Fut, C, R>(
    policy: &RetryPolicy,
    is_transient: C,
    mut on_retry: R,
    mut op: F,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
    C: Fn(&ExchangeError) -> bool,
    R: FnMut(u32, &ExchangeError),
{
    let mut attempt = 1;
    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < policy.max_attempts && is_transient(&err) => {
                let delay = policy.backoff(attempt);
                warn!(attempt, max_attempts = policy.max_attempts, ?delay, error = %err, "transient error; retrying");
                on_retry(attempt, &err);
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}
