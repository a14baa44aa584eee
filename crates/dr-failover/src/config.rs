//! Drill Configuration

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::capacity::{CapacityClass, CapacityPlan, PoolRef, ScalingBounds, ScalingGroupTarget};
use crate::retry::RetryPolicy;
use crate::DrError;

/// Failover drill configuration
///
/// Every parameter of an invocation comes from here; the invocation payload
/// itself carries nothing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DrConfig {
    /// Primary environment base URL
    pub primary_endpoint: String,
    /// DR environment base URL
    pub dr_endpoint: String,
    pub primary_region: String,
    pub dr_region: String,
    /// Address ranges served by the primary environment
    pub primary_networks: Vec<IpNetwork>,
    /// Address ranges served by the DR environment
    pub dr_networks: Vec<IpNetwork>,
    pub health_check_id: String,
    /// Domain whose routing is expected to move to DR
    pub domain_name: String,
    pub cluster_name: Option<String>,
    pub node_group_name: Option<String>,
    /// Apply scaling bounds when switching capacity
    pub scale_up: bool,
    pub desired_size: u32,
    pub min_size: u32,
    pub max_size: u32,
    pub auto_scale_group_names: Vec<String>,
    pub asg_desired_size: u32,
    /// Notification target (webhook URL or topic name)
    pub notify_topic: Option<String>,
    /// Control-plane API base URL for provider calls
    pub control_plane_url: Option<String>,
    /// Metric dimension value
    pub environment: String,
    pub timing: TimingConfig,
    pub retry: RetryPolicy,
}

impl Default for DrConfig {
    fn default() -> Self {
        Self {
            primary_endpoint: String::new(),
            dr_endpoint: String::new(),
            primary_region: String::new(),
            dr_region: String::new(),
            primary_networks: Vec::new(),
            dr_networks: Vec::new(),
            health_check_id: String::new(),
            domain_name: String::new(),
            cluster_name: None,
            node_group_name: None,
            scale_up: false,
            desired_size: 3,
            min_size: 2,
            max_size: 5,
            auto_scale_group_names: Vec::new(),
            asg_desired_size: 3,
            notify_topic: None,
            control_plane_url: None,
            environment: "Production".into(),
            timing: TimingConfig::default(),
            retry: RetryPolicy::default(),
        }
    }
}

/// Probe and convergence timing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TimingConfig {
    pub probe_timeout_ms: u64,
    pub poll_interval_ms: u64,
    pub max_wait_ms: u64,
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            probe_timeout_ms: 5_000,
            poll_interval_ms: 10_000,
            max_wait_ms: 120_000,
        }
    }
}

impl TimingConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn max_wait(&self) -> Duration {
        Duration::from_millis(self.max_wait_ms)
    }
}

/// A probed and classified environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointTarget {
    /// Logical name ("primary" / "dr")
    pub name: String,
    pub base_url: String,
    /// Region tag expected in resolved host names
    pub region: String,
    #[serde(default)]
    pub networks: Vec<IpNetwork>,
}

impl DrConfig {
    /// Load from a JSON file
    pub fn load(path: &str) -> Result<Self, DrError> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| DrError::Config(format!("cannot read {}: {}", path, e)))?;
        Self::from_json(&content)
    }

    /// Parse from JSON text
    pub fn from_json(content: &str) -> Result<Self, DrError> {
        serde_json::from_str(content).map_err(|e| DrError::Config(format!("invalid config: {}", e)))
    }

    /// Overlay values from environment-style variables.
    ///
    /// `lookup` is usually `std::env::var(..).ok()`; passing it in keeps the
    /// library free of process-wide reads.
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), DrError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let set = |key: &str, field: &mut String| {
            if let Some(v) = lookup(key) {
                *field = v;
            }
        };
        set("PRIMARY_ENDPOINT", &mut self.primary_endpoint);
        set("DR_ENDPOINT", &mut self.dr_endpoint);
        set("PRIMARY_REGION", &mut self.primary_region);
        set("DR_REGION", &mut self.dr_region);
        set("HEALTH_CHECK_ID", &mut self.health_check_id);
        set("DOMAIN_NAME", &mut self.domain_name);

        if let Some(v) = lookup("CLUSTER_NAME") {
            self.cluster_name = Some(v);
        }
        if let Some(v) = lookup("NODE_GROUP_NAME") {
            self.node_group_name = Some(v);
        }
        if let Some(v) = lookup("SCALE_UP") {
            self.scale_up = v.trim().eq_ignore_ascii_case("true");
        }
        for (key, field) in [
            ("DESIRED_SIZE", &mut self.desired_size),
            ("MIN_SIZE", &mut self.min_size),
            ("MAX_SIZE", &mut self.max_size),
            ("ASG_DESIRED_SIZE", &mut self.asg_desired_size),
        ] {
            if let Some(v) = lookup(key) {
                *field = v
                    .trim()
                    .parse()
                    .map_err(|_| DrError::Config(format!("{} must be a non-negative integer, got {:?}", key, v)))?;
            }
        }
        if let Some(v) = lookup("AUTO_SCALE_GROUPS") {
            self.auto_scale_group_names = v
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(String::from)
                .collect();
        }
        if let Some(v) = lookup("NOTIFY_TOPIC").or_else(|| lookup("SNS_TOPIC_ARN")) {
            self.notify_topic = Some(v);
        }
        if let Some(v) = lookup("CONTROL_PLANE_URL") {
            self.control_plane_url = Some(v);
        }
        Ok(())
    }

    /// Check that the configuration can drive a drill
    pub fn validate(&self) -> Result<(), DrError> {
        let required = [
            ("primaryEndpoint", &self.primary_endpoint),
            ("drEndpoint", &self.dr_endpoint),
            ("primaryRegion", &self.primary_region),
            ("drRegion", &self.dr_region),
            ("healthCheckId", &self.health_check_id),
            ("domainName", &self.domain_name),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(DrError::Config(format!("{} is required", name)));
            }
        }

        for (name, url) in [("primaryEndpoint", &self.primary_endpoint), ("drEndpoint", &self.dr_endpoint)] {
            let parsed = reqwest::Url::parse(url)
                .map_err(|e| DrError::Config(format!("{} is not a valid URL: {}", name, e)))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(DrError::Config(format!("{} must be http or https", name)));
            }
        }

        if self.primary_region.eq_ignore_ascii_case(&self.dr_region) {
            return Err(DrError::Config("primaryRegion and drRegion must differ".into()));
        }

        if self.scale_up {
            self.scaling_bounds().validate()?;
        }

        if self.timing.poll_interval_ms == 0 {
            return Err(DrError::Config("timing.pollIntervalMs must be positive".into()));
        }
        if self.timing.max_wait_ms < self.timing.poll_interval_ms {
            return Err(DrError::Config("timing.maxWaitMs must be at least timing.pollIntervalMs".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(DrError::Config("retry.maxAttempts must be at least 1".into()));
        }
        Ok(())
    }

    pub fn primary_target(&self) -> EndpointTarget {
        EndpointTarget {
            name: "primary".into(),
            base_url: self.primary_endpoint.clone(),
            region: self.primary_region.clone(),
            networks: self.primary_networks.clone(),
        }
    }

    pub fn dr_target(&self) -> EndpointTarget {
        EndpointTarget {
            name: "dr".into(),
            base_url: self.dr_endpoint.clone(),
            region: self.dr_region.clone(),
            networks: self.dr_networks.clone(),
        }
    }

    /// Node group to switch, if one is configured
    pub fn pool(&self) -> Option<PoolRef> {
        match (&self.cluster_name, &self.node_group_name) {
            (Some(cluster), Some(node_group)) if !cluster.is_empty() && !node_group.is_empty() => {
                Some(PoolRef::new(cluster.clone(), node_group.clone()))
            }
            _ => None,
        }
    }

    fn scaling_bounds(&self) -> ScalingBounds {
        ScalingBounds {
            min_size: self.min_size,
            desired_size: self.desired_size,
            max_size: self.max_size,
        }
    }

    /// Capacity plan applied after a confirmed failover, if a pool is configured
    pub fn capacity_plan(&self) -> Option<CapacityPlan> {
        self.pool()?;
        Some(CapacityPlan {
            target_class: CapacityClass::OnDemand,
            scaling: self.scale_up.then(|| self.scaling_bounds()),
            scaling_groups: self
                .auto_scale_group_names
                .iter()
                .map(|name| ScalingGroupTarget {
                    name: name.clone(),
                    desired_capacity: self.asg_desired_size,
                })
                .collect(),
        })
    }

    /// Lock key for the orchestrated resource.
    ///
    /// Every run against the same domain shares one key, whatever capacity
    /// pool it is configured with.
    pub fn resource_key(&self) -> String {
        self.domain_name.trim().trim_end_matches('.').to_ascii_lowercase()
    }
}
