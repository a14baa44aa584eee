//! DR Failover Orchestrator
//!
//! Drives a disaster-recovery failover drill as an explicit state machine:
//! verify both environments, disable the primary health check, wait for DNS
//! to converge on the DR target, switch compute capacity, and always restore
//! the health check before the run ends.
//!
//! # Lifecycle
//!
//! | Phase | Action | On failure |
//! |-------|--------|------------|
//! | PreflightCheck | Probe primary + DR, read health-check quorum | Restoring -> Aborted |
//! | FailoverTrigger | Snapshot + disable health check | Restoring -> Aborted |
//! | AwaitingConvergence | Poll DNS until it points to DR | Restoring -> Failed |
//! | PostFailoverAction | Switch node group to guaranteed capacity | Restoring -> Failed |
//! | Restoring | Restore captured health-check state | Failed (critical alert) |
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                        FAILOVER ORCHESTRATOR                            │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 STATE MACHINE + RUN LOCK                         │   │
//! │  │   Init → Preflight → Trigger → Converge → PostAction → Restore   │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! │                                                                         │
//! │  ┌──────────────┐  ┌──────────────┐  ┌──────────────┐  ┌─────────────┐ │
//! │  │   Endpoint   │  │ Health Check │  │  DNS/Traffic │  │  Capacity   │ │
//! │  │    Prober    │  │  Controller  │  │   Verifier   │  │  Switcher   │ │
//! │  └──────────────┘  └──────────────┘  └──────────────┘  └─────────────┘ │
//! │                                                                         │
//! │  ┌─────────────────────────────────────────────────────────────────┐   │
//! │  │                 NOTIFIER / METRICS SINK                          │   │
//! │  │   Alerts | Step events | DRFailoverTestSuccess | Latency         │   │
//! │  └─────────────────────────────────────────────────────────────────┘   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

pub mod capacity;
pub mod config;
pub mod control_plane;
pub mod dns;
pub mod healthcheck;
pub mod lock;
pub mod memory;
pub mod metrics;
pub mod notify;
pub mod orchestrator;
pub mod prober;
pub mod retry;
pub mod run;

use thiserror::Error;
use uuid::Uuid;

pub use capacity::{CapacityClass, CapacityPlan, CapacityProvider, CapacitySwitcher, SwitchOutcome};
pub use config::{DrConfig, EndpointTarget};
pub use dns::{Convergence, DnsResolver, TrafficTarget, TrafficVerifier};
pub use healthcheck::{HealthCheckController, HealthCheckProvider, HealthCheckState, HealthCheckStatus};
pub use lock::{FileRunLocks, RunLock, RunLocks};
pub use metrics::{InMemoryMetrics, MetricsSink};
pub use notify::{Alert, AlertKind, AlertSeverity, Notifier};
pub use orchestrator::{Collaborators, FailoverOrchestrator, InvocationResponse};
pub use prober::{EndpointProber, HttpProber, ProbeStatus};
pub use retry::RetryPolicy;
pub use run::{FailoverRun, Phase, RunOutcome, StepResult, StepStatus};

/// Failover error taxonomy
#[derive(Debug, Clone, Error)]
pub enum DrError {
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    #[error("provider unavailable during {operation} after {attempts} attempts: {message}")]
    ProviderUnavailable {
        operation: String,
        attempts: u32,
        message: String,
    },
    #[error("provider rejected {operation}: {message}")]
    ProviderRejected { operation: String, message: String },
    #[error("traffic did not converge within {waited_ms}ms (last observed: {last_observed})")]
    ConvergenceTimeout {
        waited_ms: u64,
        last_observed: TrafficTarget,
    },
    #[error("capacity switch partially applied, failed scaling groups: {}", .failed_groups.join(", "))]
    PartiallyApplied { failed_groups: Vec<String> },
    #[error("health check restoration failed: {0}")]
    RestorationFailed(String),
    #[error("failover already in progress for {0}")]
    RunInProgress(String),
    #[error("run cancelled")]
    Cancelled,
    #[error("invalid phase transition {from:?} -> {to:?}")]
    InvalidTransition { from: Phase, to: Phase },
    #[error("run {0} is already terminal")]
    RunTerminal(Uuid),
    #[error("config error: {0}")]
    Config(String),
}

impl DrError {
    /// Short machine-readable name, used in step logs and alerts
    pub fn kind(&self) -> &'static str {
        match self {
            Self::PreconditionFailed(_) => "PreconditionFailed",
            Self::ProviderUnavailable { .. } => "ProviderUnavailable",
            Self::ProviderRejected { .. } => "ProviderRejected",
            Self::ConvergenceTimeout { .. } => "ConvergenceTimeout",
            Self::PartiallyApplied { .. } => "PartiallyApplied",
            Self::RestorationFailed(_) => "RestorationFailed",
            Self::RunInProgress(_) => "RunInProgress",
            Self::Cancelled => "Cancelled",
            Self::InvalidTransition { .. } => "InvalidTransition",
            Self::RunTerminal(_) => "RunTerminal",
            Self::Config(_) => "Config",
        }
    }

    /// Provider attempts consumed before this error surfaced
    pub fn attempts(&self) -> u32 {
        match self {
            Self::ProviderUnavailable { attempts, .. } => *attempts,
            _ => 1,
        }
    }
}

/// Errors returned by provider adapters (health checks, DNS, capacity)
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProviderError {
    #[error("transient provider error: {0}")]
    Transient(String),
    #[error("provider rejected request: {0}")]
    Rejected(String),
    #[error("resource not found: {0}")]
    NotFound(String),
}

impl ProviderError {
    /// Whether the call may succeed if retried
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Transient(_))
    }
}
