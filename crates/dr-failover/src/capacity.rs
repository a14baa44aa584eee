//! Compute Capacity Switching
//!
//! Moves a node group between the preemptible (`SPOT`) and guaranteed
//! (`ON_DEMAND`) capacity classes, then resizes dependent scaling groups.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

use crate::retry::{Retried, RetryPolicy};
use crate::{DrError, ProviderError};

/// Capacity class of a compute pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CapacityClass {
    /// Elastic, preemptible capacity
    Spot,
    /// Guaranteed capacity
    OnDemand,
}

impl CapacityClass {
    /// Wire name, as the control plane spells it
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Spot => "SPOT",
            Self::OnDemand => "ON_DEMAND",
        }
    }
}

impl fmt::Display for CapacityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Node group scaling bounds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalingBounds {
    pub min_size: u32,
    pub desired_size: u32,
    pub max_size: u32,
}

impl ScalingBounds {
    pub fn validate(&self) -> Result<(), DrError> {
        if self.min_size > self.desired_size || self.desired_size > self.max_size {
            return Err(DrError::Config(format!(
                "scaling bounds must satisfy min <= desired <= max (got {}/{}/{})",
                self.min_size, self.desired_size, self.max_size
            )));
        }
        Ok(())
    }
}

/// Scaling group resized after the capacity class changes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScalingGroupTarget {
    pub name: String,
    pub desired_capacity: u32,
}

/// Desired capacity state for a pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapacityPlan {
    pub target_class: CapacityClass,
    pub scaling: Option<ScalingBounds>,
    pub scaling_groups: Vec<ScalingGroupTarget>,
}

/// Node group identity
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolRef {
    pub cluster: String,
    pub node_group: String,
}

impl PoolRef {
    pub fn new(cluster: impl Into<String>, node_group: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            node_group: node_group.into(),
        }
    }
}

impl fmt::Display for PoolRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.cluster, self.node_group)
    }
}

/// Provider view of a pool
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PoolDescription {
    pub capacity_class: CapacityClass,
    pub scaling: Option<ScalingBounds>,
}

/// Compute pool and scaling group API
#[async_trait]
pub trait CapacityProvider: Send + Sync {
    async fn describe_pool(&self, pool: &PoolRef) -> Result<PoolDescription, ProviderError>;

    async fn update_pool(
        &self,
        pool: &PoolRef,
        class: CapacityClass,
        scaling: Option<ScalingBounds>,
    ) -> Result<(), ProviderError>;

    async fn set_desired_capacity(&self, group: &str, desired: u32) -> Result<(), ProviderError>;
}

/// Result of a capacity switch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "camelCase")]
pub enum SwitchOutcome {
    /// Pool already runs the target class; nothing was mutated
    AlreadyInDesiredState { class: CapacityClass },
    #[serde(rename_all = "camelCase")]
    Applied {
        from: CapacityClass,
        to: CapacityClass,
        scaling_groups_updated: Vec<String>,
    },
    /// Pool updated, but some scaling groups could not be resized
    #[serde(rename_all = "camelCase")]
    PartiallyApplied {
        from: CapacityClass,
        to: CapacityClass,
        scaling_groups_updated: Vec<String>,
        failed_groups: Vec<String>,
    },
}

impl SwitchOutcome {
    pub fn is_partial(&self) -> bool {
        matches!(self, Self::PartiallyApplied { .. })
    }
}

/// Capacity switcher
pub struct CapacitySwitcher {
    provider: Arc<dyn CapacityProvider>,
    retry: RetryPolicy,
}

impl CapacitySwitcher {
    pub fn new(provider: Arc<dyn CapacityProvider>, retry: RetryPolicy) -> Self {
        Self { provider, retry }
    }

    /// Current capacity class of the pool
    pub async fn current_class(&self, pool: &PoolRef) -> Result<Retried<CapacityClass>, DrError> {
        let provider = &self.provider;
        let described = self
            .retry
            .run("describe_pool", move || provider.describe_pool(pool))
            .await?;
        Ok(described.map(|d| d.capacity_class))
    }

    /// Move the pool to the plan's capacity class.
    ///
    /// Scaling groups are only touched once the pool update has succeeded.
    pub async fn switch_to(&self, pool: &PoolRef, plan: &CapacityPlan) -> Result<Retried<SwitchOutcome>, DrError> {
        if let Some(bounds) = &plan.scaling {
            bounds.validate()?;
        }

        let current = self.current_class(pool).await?;
        let mut attempts = current.attempts;
        let from = current.value;

        if from == plan.target_class {
            tracing::info!("Node group {} already uses {} capacity, no action needed", pool, from);
            return Ok(Retried {
                value: SwitchOutcome::AlreadyInDesiredState { class: from },
                attempts,
            });
        }

        tracing::info!("Updating node group {} from {} to {}", pool, from, plan.target_class);
        let provider = &self.provider;
        let target = plan.target_class;
        let scaling = plan.scaling;
        let updated = self
            .retry
            .run("update_pool", move || provider.update_pool(pool, target, scaling))
            .await?;
        attempts += updated.attempts;

        let mut succeeded = Vec::new();
        let mut failed = Vec::new();
        for group in &plan.scaling_groups {
            tracing::info!("Updating scaling group {} to desired capacity {}", group.name, group.desired_capacity);
            let name = group.name.as_str();
            let desired = group.desired_capacity;
            match self
                .retry
                .run("set_desired_capacity", move || provider.set_desired_capacity(name, desired))
                .await
            {
                Ok(r) => {
                    attempts += r.attempts;
                    succeeded.push(group.name.clone());
                }
                Err(e) => {
                    tracing::error!("Scaling group {} update failed: {}", group.name, e);
                    attempts += e.attempts();
                    failed.push(group.name.clone());
                }
            }
        }

        let value = if failed.is_empty() {
            SwitchOutcome::Applied {
                from,
                to: plan.target_class,
                scaling_groups_updated: succeeded,
            }
        } else {
            SwitchOutcome::PartiallyApplied {
                from,
                to: plan.target_class,
                scaling_groups_updated: succeeded,
                failed_groups: failed,
            }
        };
        Ok(Retried { value, attempts })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryCapacity;

    fn pool() -> PoolRef {
        PoolRef::new("prod", "workers")
    }

    fn plan(groups: &[&str]) -> CapacityPlan {
        CapacityPlan {
            target_class: CapacityClass::OnDemand,
            scaling: Some(ScalingBounds { min_size: 2, desired_size: 3, max_size: 5 }),
            scaling_groups: groups
                .iter()
                .map(|g| ScalingGroupTarget { name: g.to_string(), desired_capacity: 3 })
                .collect(),
        }
    }

    #[tokio::test]
    async fn test_switch_spot_to_on_demand() {
        let provider = Arc::new(InMemoryCapacity::new());
        provider.add_pool(pool(), CapacityClass::Spot);
        provider.add_group("asg-a", 1);

        let switcher = CapacitySwitcher::new(provider.clone(), RetryPolicy::none());
        let outcome = switcher.switch_to(&pool(), &plan(&["asg-a"])).await.unwrap().value;

        assert_eq!(
            outcome,
            SwitchOutcome::Applied {
                from: CapacityClass::Spot,
                to: CapacityClass::OnDemand,
                scaling_groups_updated: vec!["asg-a".into()],
            }
        );
        assert_eq!(provider.pool_class(&pool()), Some(CapacityClass::OnDemand));
        assert_eq!(provider.group_capacity("asg-a"), Some(3));
        assert_eq!(provider.pool_updates(), 1);
    }

    #[tokio::test]
    async fn test_switch_is_idempotent_when_already_on_demand() {
        let provider = Arc::new(InMemoryCapacity::new());
        provider.add_pool(pool(), CapacityClass::OnDemand);
        provider.add_group("asg-a", 1);
        let switcher = CapacitySwitcher::new(provider.clone(), RetryPolicy::none());

        for _ in 0..2 {
            let outcome = switcher.switch_to(&pool(), &plan(&["asg-a"])).await.unwrap().value;
            assert_eq!(outcome, SwitchOutcome::AlreadyInDesiredState { class: CapacityClass::OnDemand });
        }
        assert_eq!(provider.pool_updates(), 0);
        assert_eq!(provider.group_updates(), 0);
        assert_eq!(provider.group_capacity("asg-a"), Some(1));
    }

    #[tokio::test]
    async fn test_partial_failure_is_reported() {
        let provider = Arc::new(InMemoryCapacity::new());
        provider.add_pool(pool(), CapacityClass::Spot);
        provider.add_group("asg-a", 1);
        provider.add_group("asg-b", 1);
        provider.fail_group("asg-b");

        let switcher = CapacitySwitcher::new(provider.clone(), RetryPolicy::none());
        let outcome = switcher.switch_to(&pool(), &plan(&["asg-a", "asg-b"])).await.unwrap().value;

        match outcome {
            SwitchOutcome::PartiallyApplied { scaling_groups_updated, failed_groups, .. } => {
                assert_eq!(scaling_groups_updated, vec!["asg-a".to_string()]);
                assert_eq!(failed_groups, vec!["asg-b".to_string()]);
            }
            other => panic!("expected partial outcome, got {:?}", other),
        }
        assert_eq!(provider.pool_class(&pool()), Some(CapacityClass::OnDemand));
    }

    #[tokio::test]
    async fn test_pool_failure_skips_scaling_groups() {
        let provider = Arc::new(InMemoryCapacity::new());
        provider.add_pool(pool(), CapacityClass::Spot);
        provider.add_group("asg-a", 1);
        provider.fail_pool_updates(true);

        let switcher = CapacitySwitcher::new(provider.clone(), RetryPolicy::none());
        let err = switcher.switch_to(&pool(), &plan(&["asg-a"])).await.unwrap_err();

        assert_eq!(err.kind(), "ProviderUnavailable");
        assert_eq!(provider.group_updates(), 0);
    }

    #[tokio::test]
    async fn test_invalid_bounds_rejected_before_any_call() {
        let provider = Arc::new(InMemoryCapacity::new());
        provider.add_pool(pool(), CapacityClass::Spot);
        let switcher = CapacitySwitcher::new(provider.clone(), RetryPolicy::none());

        let mut bad = plan(&[]);
        bad.scaling = Some(ScalingBounds { min_size: 4, desired_size: 3, max_size: 5 });
        assert!(switcher.switch_to(&pool(), &bad).await.is_err());
        assert_eq!(provider.describe_calls(), 0);
    }

    #[test]
    fn test_capacity_class_wire_format() {
        assert_eq!(serde_json::to_string(&CapacityClass::OnDemand).unwrap(), "\"ON_DEMAND\"");
        let parsed: CapacityClass = serde_json::from_str("\"SPOT\"").unwrap();
        assert_eq!(parsed, CapacityClass::Spot);
    }
}
