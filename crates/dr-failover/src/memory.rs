//! In-memory providers (for testing and dry runs)
//!
//! Each provider keeps its state behind a `parking_lot` lock and counts the
//! calls it receives, so tests can assert on exactly which mutations a run
//! issued.

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use crate::capacity::{CapacityClass, CapacityProvider, PoolDescription, PoolRef, ScalingBounds};
use crate::config::EndpointTarget;
use crate::dns::{DnsResolver, ResolvedTarget, TrafficClassifier, TrafficTarget};
use crate::healthcheck::{CheckerObservation, HealthCheckProvider};
use crate::prober::{EndpointProber, ProbeResult, ProbeStatus};
use crate::ProviderError;

/// Region tags used by [`ScriptedResolver`] records
pub const SCRIPTED_PRIMARY_REGION: &str = "us-east-1";
pub const SCRIPTED_DR_REGION: &str = "us-west-2";

/// Prober answering from a fixed table keyed by base URL
pub struct StaticProber {
    statuses: RwLock<HashMap<String, ProbeStatus>>,
    delay: RwLock<HashMap<String, Duration>>,
    calls: AtomicU32,
}

impl StaticProber {
    pub fn new() -> Self {
        Self {
            statuses: RwLock::new(HashMap::new()),
            delay: RwLock::new(HashMap::new()),
            calls: AtomicU32::new(0),
        }
    }

    pub fn set(&self, base_url: &str, status: ProbeStatus) {
        self.statuses.write().insert(base_url.to_string(), status);
    }

    /// Make the endpoint slow to answer
    pub fn set_delay(&self, base_url: &str, delay: Duration) {
        self.delay.write().insert(base_url.to_string(), delay);
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Default for StaticProber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EndpointProber for StaticProber {
    async fn probe(&self, endpoint: &EndpointTarget, timeout: Duration) -> ProbeResult {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay.read().get(&endpoint.base_url).copied().unwrap_or_default();
        if delay >= timeout {
            tokio::time::sleep(timeout).await;
            return ProbeResult::unhealthy(endpoint, timeout, "timeout");
        }
        tokio::time::sleep(delay).await;

        match self.statuses.read().get(&endpoint.base_url).copied() {
            Some(ProbeStatus::Healthy) => ProbeResult::healthy(endpoint, delay, "HTTP 200"),
            Some(ProbeStatus::Unhealthy) => ProbeResult::unhealthy(endpoint, delay, "HTTP 503"),
            None => ProbeResult::unhealthy(endpoint, delay, "unknown endpoint"),
        }
    }
}

#[derive(Debug, Default)]
struct HealthCheckRecord {
    disabled: bool,
    observations: Vec<CheckerObservation>,
    updates: Vec<bool>,
}

/// Health-check provider holding a single check
pub struct InMemoryHealthCheck {
    id: String,
    state: Mutex<HealthCheckRecord>,
    transient_update_failures: AtomicU32,
    transient_read_failures: AtomicU32,
    /// Fail every update once the check has been disabled
    fail_restores: Mutex<bool>,
}

impl InMemoryHealthCheck {
    pub fn new(id: &str, observations: Vec<CheckerObservation>) -> Self {
        Self {
            id: id.to_string(),
            state: Mutex::new(HealthCheckRecord {
                disabled: false,
                observations,
                updates: Vec::new(),
            }),
            transient_update_failures: AtomicU32::new(0),
            transient_read_failures: AtomicU32::new(0),
            fail_restores: Mutex::new(false),
        }
    }

    /// Fail the next `n` `set_disabled` calls with a transient error
    pub fn fail_next_updates(&self, n: u32) {
        self.transient_update_failures.store(n, Ordering::SeqCst);
    }

    /// Fail the next `n` reads with a transient error
    pub fn fail_next_reads(&self, n: u32) {
        self.transient_read_failures.store(n, Ordering::SeqCst);
    }

    /// Reject every attempt to re-enable the check
    pub fn fail_restores(&self, fail: bool) {
        *self.fail_restores.lock() = fail;
    }

    pub fn set_observations(&self, observations: Vec<CheckerObservation>) {
        self.state.lock().observations = observations;
    }

    pub fn is_disabled_now(&self) -> bool {
        self.state.lock().disabled
    }

    /// Values passed to successful `set_disabled` calls, in order
    pub fn updates(&self) -> Vec<bool> {
        self.state.lock().updates.clone()
    }

    fn check_id(&self, id: &str) -> Result<(), ProviderError> {
        if id == self.id {
            Ok(())
        } else {
            Err(ProviderError::NotFound(id.to_string()))
        }
    }
}

fn take_failure(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

#[async_trait]
impl HealthCheckProvider for InMemoryHealthCheck {
    async fn is_disabled(&self, id: &str) -> Result<bool, ProviderError> {
        self.check_id(id)?;
        if take_failure(&self.transient_read_failures) {
            return Err(ProviderError::Transient("throttled".into()));
        }
        Ok(self.state.lock().disabled)
    }

    async fn observations(&self, id: &str) -> Result<Vec<CheckerObservation>, ProviderError> {
        self.check_id(id)?;
        if take_failure(&self.transient_read_failures) {
            return Err(ProviderError::Transient("throttled".into()));
        }
        Ok(self.state.lock().observations.clone())
    }

    async fn set_disabled(&self, id: &str, disabled: bool) -> Result<(), ProviderError> {
        self.check_id(id)?;
        if take_failure(&self.transient_update_failures) {
            return Err(ProviderError::Transient("service unavailable".into()));
        }
        if !disabled && *self.fail_restores.lock() {
            return Err(ProviderError::Transient("service unavailable".into()));
        }
        let mut state = self.state.lock();
        state.disabled = disabled;
        state.updates.push(disabled);
        Ok(())
    }
}

/// Resolver replaying a scripted sequence; the last entry repeats forever
pub struct ScriptedResolver {
    script: Mutex<VecDeque<Result<Vec<String>, ProviderError>>>,
    last: Mutex<Option<Result<Vec<String>, ProviderError>>>,
    calls: AtomicU32,
}

impl ScriptedResolver {
    /// Script expressed as classifications, using the scripted region tags
    pub fn new(sequence: Vec<TrafficTarget>) -> Self {
        Self::from_records(sequence.into_iter().map(Self::records_for).collect())
    }

    pub fn from_records(sequence: Vec<Vec<String>>) -> Self {
        Self {
            script: Mutex::new(sequence.into_iter().map(Ok).collect()),
            last: Mutex::new(None),
            calls: AtomicU32::new(0),
        }
    }

    /// Resolver whose every lookup fails
    pub fn failing() -> Self {
        let script = VecDeque::from(vec![Err(ProviderError::Transient("SERVFAIL".into()))]);
        Self {
            script: Mutex::new(script),
            last: Mutex::new(None),
            calls: AtomicU32::new(0),
        }
    }

    /// Classifier that understands the scripted records
    pub fn classifier() -> TrafficClassifier {
        TrafficClassifier::new(
            EndpointTarget {
                name: "primary".into(),
                base_url: "https://primary.example.com".into(),
                region: SCRIPTED_PRIMARY_REGION.into(),
                networks: Vec::new(),
            },
            EndpointTarget {
                name: "dr".into(),
                base_url: "https://dr.example.com".into(),
                region: SCRIPTED_DR_REGION.into(),
                networks: Vec::new(),
            },
        )
    }

    pub fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }

    fn records_for(target: TrafficTarget) -> Vec<String> {
        match target {
            TrafficTarget::PointsToPrimary => vec![format!("lb-1.{}.elb.amazonaws.com", SCRIPTED_PRIMARY_REGION)],
            TrafficTarget::PointsToDr => vec![format!("lb-1.{}.elb.amazonaws.com", SCRIPTED_DR_REGION)],
            TrafficTarget::Ambiguous => Vec::new(),
        }
    }
}

#[async_trait]
impl DnsResolver for ScriptedResolver {
    async fn resolve(&self, domain: &str) -> Result<ResolvedTarget, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let next = {
            let mut script = self.script.lock();
            let mut last = self.last.lock();
            if let Some(entry) = script.pop_front() {
                *last = Some(entry.clone());
                entry
            } else {
                last.clone().unwrap_or_else(|| Ok(Vec::new()))
            }
        };
        next.map(|records| ResolvedTarget {
            domain: domain.to_string(),
            records,
        })
    }
}

#[derive(Debug, Default)]
struct CapacityState {
    pools: HashMap<PoolRef, PoolDescription>,
    groups: HashMap<String, u32>,
    failing_groups: HashSet<String>,
    fail_pool_updates: bool,
}

/// Capacity provider for node groups and scaling groups
pub struct InMemoryCapacity {
    state: RwLock<CapacityState>,
    describe_calls: AtomicU32,
    pool_updates: AtomicU32,
    group_updates: AtomicU32,
}

impl InMemoryCapacity {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(CapacityState::default()),
            describe_calls: AtomicU32::new(0),
            pool_updates: AtomicU32::new(0),
            group_updates: AtomicU32::new(0),
        }
    }

    pub fn add_pool(&self, pool: PoolRef, class: CapacityClass) {
        self.state.write().pools.insert(
            pool,
            PoolDescription {
                capacity_class: class,
                scaling: None,
            },
        );
    }

    pub fn add_group(&self, name: &str, desired: u32) {
        self.state.write().groups.insert(name.to_string(), desired);
    }

    /// Make every update of this scaling group fail
    pub fn fail_group(&self, name: &str) {
        self.state.write().failing_groups.insert(name.to_string());
    }

    pub fn fail_pool_updates(&self, fail: bool) {
        self.state.write().fail_pool_updates = fail;
    }

    pub fn pool_class(&self, pool: &PoolRef) -> Option<CapacityClass> {
        self.state.read().pools.get(pool).map(|p| p.capacity_class)
    }

    pub fn pool_scaling(&self, pool: &PoolRef) -> Option<ScalingBounds> {
        self.state.read().pools.get(pool).and_then(|p| p.scaling)
    }

    pub fn group_capacity(&self, name: &str) -> Option<u32> {
        self.state.read().groups.get(name).copied()
    }

    pub fn describe_calls(&self) -> u32 {
        self.describe_calls.load(Ordering::SeqCst)
    }

    /// Successful pool updates
    pub fn pool_updates(&self) -> u32 {
        self.pool_updates.load(Ordering::SeqCst)
    }

    /// Scaling-group update attempts, failed ones included
    pub fn group_updates(&self) -> u32 {
        self.group_updates.load(Ordering::SeqCst)
    }
}

impl Default for InMemoryCapacity {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CapacityProvider for InMemoryCapacity {
    async fn describe_pool(&self, pool: &PoolRef) -> Result<PoolDescription, ProviderError> {
        self.describe_calls.fetch_add(1, Ordering::SeqCst);
        self.state
            .read()
            .pools
            .get(pool)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(pool.to_string()))
    }

    async fn update_pool(
        &self,
        pool: &PoolRef,
        class: CapacityClass,
        scaling: Option<ScalingBounds>,
    ) -> Result<(), ProviderError> {
        let mut state = self.state.write();
        if state.fail_pool_updates {
            return Err(ProviderError::Transient("update in progress".into()));
        }
        let entry = state
            .pools
            .get_mut(pool)
            .ok_or_else(|| ProviderError::NotFound(pool.to_string()))?;
        entry.capacity_class = class;
        if scaling.is_some() {
            entry.scaling = scaling;
        }
        self.pool_updates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn set_desired_capacity(&self, group: &str, desired: u32) -> Result<(), ProviderError> {
        self.group_updates.fetch_add(1, Ordering::SeqCst);
        let mut state = self.state.write();
        if state.failing_groups.contains(group) {
            return Err(ProviderError::Transient(format!("scaling group {} unavailable", group)));
        }
        match state.groups.get_mut(group) {
            Some(current) => {
                *current = desired;
                Ok(())
            }
            None => Err(ProviderError::NotFound(group.to_string())),
        }
    }
}
