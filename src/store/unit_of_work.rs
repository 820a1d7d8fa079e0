// Transaction runner with bounded retry on lock contention

use rand::Rng;
use std::time::Duration;

use super::{Store, Tx};
use crate::error::EngineResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(20),
            max_delay: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Exponential delay before retry number `attempt` (1-based), with jitter
    pub fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay.saturating_mul(1u32 << exp).min(self.max_delay);
        let jitter_ms = (self.base_delay.as_millis() as u64 / 2).max(1);
        let jitter = Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms));
        (delay + jitter).min(self.max_delay)
    }
}

impl Store {
    /// Run `body` as one atomic unit of work.
    ///
    /// `Ok` commits and publishes staged events. Any error rolls back;
    /// transient lock conflicts are retried per `policy`, every other error
    /// is returned as is.
    pub async fn transaction<T, F>(&self, policy: &RetryPolicy, mut body: F) -> EngineResult<T>
    where
        F: FnMut(&mut Tx<'_>) -> EngineResult<T>,
    {
        let mut attempt = 0u32;
        loop {
            attempt += 1;
            let outcome = {
                let mut tx = Tx::new(self);
                match body(&mut tx) {
                    Ok(value) => {
                        tx.commit();
                        Ok(value)
                    }
                    Err(e) => Err(e),
                }
            };

            match outcome {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < policy.max_attempts => {
                    let delay = policy.backoff(attempt);
                    tracing::debug!(attempt, ?delay, error = %e, "retrying unit of work");
                    tokio::time::sleep(delay).await;
                }
                Err(e) => {
                    if e.is_transient() {
                        tracing::warn!(attempts = attempt, error = %e, "unit of work gave up after lock conflicts");
                    }
                    return Err(e);
                }
            }
        }
    }
}
