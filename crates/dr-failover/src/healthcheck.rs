//! Health Check Control
//!
//! Wraps the DNS health check that gates failover routing. Disabling it is
//! how a drill simulates a primary outage, so every mutation starts from a
//! captured [`HealthCheckState`] that can be restored afterwards.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::retry::{Retried, RetryPolicy};
use crate::{DrError, ProviderError};

/// Status reported by a single health checker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CheckerStatus {
    Success,
    Failure,
}

/// One checker's latest report
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckerObservation {
    /// Checker region
    pub region: String,
    pub status: CheckerStatus,
    #[serde(default)]
    pub message: Option<String>,
}

impl CheckerObservation {
    pub fn new(region: impl Into<String>, status: CheckerStatus) -> Self {
        Self {
            region: region.into(),
            status,
            message: None,
        }
    }
}

/// Aggregated health-check status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum HealthCheckStatus {
    Healthy,
    Unhealthy,
}

/// Healthy iff strictly more than half of the reporting checkers succeed.
/// Ties and an empty report are `Unhealthy`.
pub fn quorum_status(observations: &[CheckerObservation]) -> HealthCheckStatus {
    let healthy = observations
        .iter()
        .filter(|o| o.status == CheckerStatus::Success)
        .count();
    if healthy * 2 > observations.len() {
        HealthCheckStatus::Healthy
    } else {
        HealthCheckStatus::Unhealthy
    }
}

/// Snapshot taken before mutating a health check
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthCheckState {
    pub health_check_id: String,
    pub disabled: bool,
    pub observations: Vec<CheckerObservation>,
    pub captured_at: DateTime<Utc>,
}

/// Result of a restore
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestoreOutcome {
    /// The flag was changed back to the snapshot value
    Restored,
    /// The flag already matched the snapshot; no mutation issued
    AlreadyInPlace,
}

/// Health-check API
#[async_trait]
pub trait HealthCheckProvider: Send + Sync {
    async fn is_disabled(&self, id: &str) -> Result<bool, ProviderError>;

    async fn observations(&self, id: &str) -> Result<Vec<CheckerObservation>, ProviderError>;

    async fn set_disabled(&self, id: &str, disabled: bool) -> Result<(), ProviderError>;
}

/// Health check controller
pub struct HealthCheckController {
    provider: Arc<dyn HealthCheckProvider>,
    retry: RetryPolicy,
}

impl HealthCheckController {
    pub fn new(provider: Arc<dyn HealthCheckProvider>, retry: RetryPolicy) -> Self {
        Self { provider, retry }
    }

    /// Quorum status of the health check
    pub async fn status(&self, id: &str) -> Result<Retried<HealthCheckStatus>, DrError> {
        let provider = &self.provider;
        let observed = self
            .retry
            .run("get_health_check_status", move || provider.observations(id))
            .await?;
        Ok(observed.map(|o| quorum_status(&o)))
    }

    /// Capture the current flag and checker votes
    pub async fn snapshot(&self, id: &str) -> Result<Retried<HealthCheckState>, DrError> {
        let provider = &self.provider;
        let disabled = self
            .retry
            .run("get_health_check", move || provider.is_disabled(id))
            .await?;
        let observations = self
            .retry
            .run("get_health_check_status", move || provider.observations(id))
            .await?;

        Ok(Retried {
            value: HealthCheckState {
                health_check_id: id.to_string(),
                disabled: disabled.value,
                observations: observations.value,
                captured_at: Utc::now(),
            },
            attempts: disabled.attempts + observations.attempts,
        })
    }

    /// Disable the health check described by `prior`
    pub async fn apply_disable(&self, prior: &HealthCheckState) -> Result<Retried<()>, DrError> {
        tracing::info!("Disabling health check {} to simulate failover", prior.health_check_id);
        let provider = &self.provider;
        let id = prior.health_check_id.as_str();
        self.retry
            .run("disable_health_check", move || provider.set_disabled(id, true))
            .await
    }

    /// Snapshot then disable, returning the prior state for a later restore
    pub async fn disable(&self, id: &str) -> Result<Retried<HealthCheckState>, DrError> {
        let prior = self.snapshot(id).await?;
        let disabled = self.apply_disable(&prior.value).await?;
        Ok(Retried {
            attempts: prior.attempts + disabled.attempts,
            value: prior.value,
        })
    }

    /// Put the enabled/disabled flag back to the snapshot value.
    ///
    /// Idempotent: a second call with the same snapshot finds the flag in
    /// place and issues no mutation. If the flag cannot be read, the write is
    /// issued anyway.
    pub async fn restore(&self, prior: &HealthCheckState) -> Result<Retried<RestoreOutcome>, DrError> {
        let provider = &self.provider;
        let id = prior.health_check_id.as_str();
        let read_attempts = match self
            .retry
            .run("get_health_check", move || provider.is_disabled(id))
            .await
        {
            Ok(current) if current.value == prior.disabled => {
                tracing::debug!("Health check {} already in captured state", id);
                return Ok(current.map(|_| RestoreOutcome::AlreadyInPlace));
            }
            Ok(current) => current.attempts,
            Err(e) => {
                tracing::warn!("Health check {} state unreadable ({}), restoring unconditionally", id, e);
                e.attempts()
            }
        };

        tracing::info!("Restoring health check {} (disabled={})", id, prior.disabled);
        let target = prior.disabled;
        let updated = self
            .retry
            .run("restore_health_check", move || provider.set_disabled(id, target))
            .await?;

        Ok(Retried {
            value: RestoreOutcome::Restored,
            attempts: read_attempts + updated.attempts,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryHealthCheck;

    fn votes(success: usize, failure: usize) -> Vec<CheckerObservation> {
        let mut v = Vec::new();
        for i in 0..success {
            v.push(CheckerObservation::new(format!("ok-{}", i), CheckerStatus::Success));
        }
        for i in 0..failure {
            v.push(CheckerObservation::new(format!("bad-{}", i), CheckerStatus::Failure));
        }
        v
    }

    #[test]
    fn test_quorum() {
        assert_eq!(quorum_status(&votes(3, 1)), HealthCheckStatus::Healthy);
        assert_eq!(quorum_status(&votes(2, 2)), HealthCheckStatus::Unhealthy);
        assert_eq!(quorum_status(&votes(1, 2)), HealthCheckStatus::Unhealthy);
        assert_eq!(quorum_status(&[]), HealthCheckStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_disable_returns_prior_state() {
        let provider = Arc::new(InMemoryHealthCheck::new("hc-1", votes(3, 0)));
        let controller = HealthCheckController::new(provider.clone(), RetryPolicy::none());

        let prior = controller.disable("hc-1").await.unwrap().value;
        assert!(!prior.disabled);
        assert_eq!(prior.observations.len(), 3);
        assert!(provider.is_disabled_now());
        assert_eq!(provider.updates(), vec![true]);
    }

    #[tokio::test]
    async fn test_restore_is_idempotent() {
        let provider = Arc::new(InMemoryHealthCheck::new("hc-1", votes(3, 0)));
        let controller = HealthCheckController::new(provider.clone(), RetryPolicy::none());
        let prior = controller.disable("hc-1").await.unwrap().value;

        let first = controller.restore(&prior).await.unwrap().value;
        let second = controller.restore(&prior).await.unwrap().value;

        assert_eq!(first, RestoreOutcome::Restored);
        assert_eq!(second, RestoreOutcome::AlreadyInPlace);
        assert!(!provider.is_disabled_now());
        assert_eq!(provider.updates(), vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_restore_writes_when_flag_unreadable() {
        let provider = Arc::new(InMemoryHealthCheck::new("hc-1", votes(3, 0)));
        let controller = HealthCheckController::new(provider.clone(), RetryPolicy::default());
        let prior = controller.disable("hc-1").await.unwrap().value;
        provider.fail_next_reads(3);

        let restored = controller.restore(&prior).await.unwrap();

        assert_eq!(restored.value, RestoreOutcome::Restored);
        assert_eq!(restored.attempts, 4);
        assert!(!provider.is_disabled_now());
        assert_eq!(provider.updates(), vec![true, false]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_update_errors_are_retried() {
        let provider = Arc::new(InMemoryHealthCheck::new("hc-1", votes(3, 0)));
        provider.fail_next_updates(2);
        let controller = HealthCheckController::new(provider.clone(), RetryPolicy::default());

        let result = controller.disable("hc-1").await.unwrap();
        assert!(provider.is_disabled_now());
        // two reads + three update attempts
        assert_eq!(result.attempts, 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_exhaustion_is_provider_unavailable() {
        let provider = Arc::new(InMemoryHealthCheck::new("hc-1", votes(3, 0)));
        provider.fail_next_updates(10);
        let controller = HealthCheckController::new(provider.clone(), RetryPolicy::default());

        let err = controller.disable("hc-1").await.unwrap_err();
        assert!(matches!(err, DrError::ProviderUnavailable { attempts: 3, .. }));
        assert!(!provider.is_disabled_now());
    }

    #[tokio::test]
    async fn test_status_uses_quorum() {
        let provider = Arc::new(InMemoryHealthCheck::new("hc-1", votes(2, 2)));
        let controller = HealthCheckController::new(provider, RetryPolicy::none());
        assert_eq!(controller.status("hc-1").await.unwrap().value, HealthCheckStatus::Unhealthy);
    }
}
