//! Bounded retry with exponential backoff for provider calls

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;

use crate::{DrError, ProviderError};

/// Retry policy applied to every provider call
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 200,
            max_delay_ms: 5_000,
        }
    }
}

/// Value produced by a retried call, with the number of attempts it took
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Retried<T> {
    pub value: T,
    pub attempts: u32,
}

impl<T> Retried<T> {
    /// Map the value, keeping the attempt count
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Retried<U> {
        Retried {
            value: f(self.value),
            attempts: self.attempts,
        }
    }
}

impl RetryPolicy {
    /// Policy that never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    /// Delay before the next attempt, after `attempt` attempts have failed
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self.base_delay_ms.saturating_mul(1u64 << exp);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }

    /// Run `op`, retrying transient failures until `max_attempts` is reached.
    ///
    /// Exhausting the attempts yields [`DrError::ProviderUnavailable`]; a
    /// non-transient failure returns [`DrError::ProviderRejected`] at once.
    pub async fn run<T, F, Fut>(&self, operation: &str, mut op: F) -> Result<Retried<T>, DrError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;
            match op().await {
                Ok(value) => return Ok(Retried { value, attempts: attempt }),
                Err(e) if e.is_transient() && attempt < max_attempts => {
                    let delay = self.delay_for(attempt);
                    tracing::warn!(
                        "{} failed (attempt {}/{}): {}, retrying in {:?}",
                        operation,
                        attempt,
                        max_attempts,
                        e,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
                Err(e) if e.is_transient() => {
                    return Err(DrError::ProviderUnavailable {
                        operation: operation.to_string(),
                        attempts: attempt,
                        message: e.to_string(),
                    });
                }
                Err(e) => {
                    return Err(DrError::ProviderRejected {
                        operation: operation.to_string(),
                        message: e.to_string(),
                    });
                }
            }
        }
    }
}
