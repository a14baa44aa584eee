//! Failover Orchestrator
//!
//! Drives one drill through the phase machine in [`crate::run`]. Every error
//! is attached to the step that raised it and routes the run to `Restoring`;
//! the only thing returned to the caller is the [`InvocationResponse`].

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::capacity::{CapacityPlan, CapacityProvider, CapacitySwitcher, PoolRef, SwitchOutcome};
use crate::config::DrConfig;
use crate::dns::{Convergence, DnsResolver, TrafficClassifier, TrafficTarget, TrafficVerifier};
use crate::healthcheck::{HealthCheckController, HealthCheckProvider, HealthCheckState, HealthCheckStatus};
use crate::lock::{RunLock, RunLockGuard};
use crate::metrics::{MetricPoint, MetricsSink};
use crate::notify::{Alert, AlertKind, AlertSeverity, Notifier};
use crate::prober::{EndpointProber, ProbeResult};
use crate::run::{FailoverRun, Phase, RunOutcome, StepResult};
use crate::DrError;

/// Invocation result: `200` on success, `500` on failure or abort
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InvocationResponse<T> {
    /// `200` or `500`
    pub status_code: u16,
    /// Run record or report
    pub body: T,
}

impl<T> InvocationResponse<T> {
    pub fn new(success: bool, body: T) -> Self {
        Self {
            status_code: if success { 200 } else { 500 },
            body,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status_code == 200
    }
}

/// Read-only precondition checks
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PreflightReport {
    pub primary: ProbeResult,
    pub dr: ProbeResult,
    pub health_check: Option<HealthCheckStatus>,
    pub health_check_error: Option<String>,
    /// Where DNS points right now (standalone preflight only)
    pub current_traffic: Option<TrafficTarget>,
    pub ready: bool,
}

/// A failed precondition and the alert it raises
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreconditionFailure {
    pub kind: AlertKind,
    pub severity: AlertSeverity,
    pub message: String,
}

impl PreflightReport {
    fn new(primary: ProbeResult, dr: ProbeResult, health: Result<HealthCheckStatus, String>) -> Self {
        let (health_check, health_check_error) = match health {
            Ok(status) => (Some(status), None),
            Err(e) => (None, Some(e)),
        };
        let mut report = Self {
            primary,
            dr,
            health_check,
            health_check_error,
            current_traffic: None,
            ready: false,
        };
        report.ready = report.failures().is_empty();
        report
    }

    pub fn failures(&self) -> Vec<PreconditionFailure> {
        let mut failures = Vec::new();
        if !self.primary.is_healthy() {
            failures.push(PreconditionFailure {
                kind: AlertKind::Primary,
                severity: AlertSeverity::Critical,
                message: format!("CRITICAL: Primary environment not available! ({})", detail(&self.primary)),
            });
        }
        if !self.dr.is_healthy() {
            failures.push(PreconditionFailure {
                kind: AlertKind::Dr,
                severity: AlertSeverity::Critical,
                message: format!("CRITICAL: DR environment not available! ({})", detail(&self.dr)),
            });
        }
        match (self.health_check, &self.health_check_error) {
            (Some(HealthCheckStatus::Healthy), _) => {}
            (_, Some(err)) => failures.push(PreconditionFailure {
                kind: AlertKind::HealthCheck,
                severity: AlertSeverity::Warning,
                message: format!("WARNING: Health check status could not be read: {}", err),
            }),
            _ => failures.push(PreconditionFailure {
                kind: AlertKind::HealthCheck,
                severity: AlertSeverity::Warning,
                message: "WARNING: Health check is not healthy!".to_string(),
            }),
        }
        failures
    }
}

fn detail(probe: &ProbeResult) -> &str {
    probe.detail.as_deref().unwrap_or("no detail")
}

/// Result of a standalone capacity switch
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CapacityReport {
    pub pool: Option<PoolRef>,
    pub outcome: Option<SwitchOutcome>,
    pub attempts: u32,
    pub error: Option<String>,
}

/// Provider implementations used by the orchestrator
#[derive(Clone)]
pub struct Collaborators {
    pub prober: Arc<dyn EndpointProber>,
    pub health_checks: Arc<dyn HealthCheckProvider>,
    pub resolver: Arc<dyn DnsResolver>,
    pub capacity: Arc<dyn CapacityProvider>,
    pub notifier: Arc<dyn Notifier>,
    pub metrics: Arc<dyn MetricsSink>,
}

/// Per-run bookkeeping that does not belong in the audit record
#[derive(Default)]
struct Drill {
    snapshot: Option<HealthCheckState>,
    lock: Option<RunLockGuard>,
    converged: bool,
    waited_ms: Option<u64>,
    /// Terminal phase forced by the error that ended the forward path
    ending: Option<(Phase, DrError)>,
}

impl Drill {
    fn end(&mut self, phase: Phase, error: DrError) {
        self.ending = Some((phase, error));
    }

    fn error(&self) -> Option<&DrError> {
        self.ending.as_ref().map(|(_, e)| e)
    }
}

/// DR failover orchestrator
pub struct FailoverOrchestrator {
    config: DrConfig,
    prober: Arc<dyn EndpointProber>,
    health: HealthCheckController,
    traffic: TrafficVerifier,
    capacity: CapacitySwitcher,
    notifier: Arc<dyn Notifier>,
    metrics: Arc<dyn MetricsSink>,
    locks: Arc<dyn RunLock>,
}

impl FailoverOrchestrator {
    pub fn new(config: DrConfig, collaborators: Collaborators, locks: Arc<dyn RunLock>) -> Self {
        let retry = config.retry;
        let classifier = TrafficClassifier::new(config.primary_target(), config.dr_target());
        Self {
            prober: collaborators.prober,
            health: HealthCheckController::new(collaborators.health_checks, retry),
            traffic: TrafficVerifier::new(collaborators.resolver, classifier),
            capacity: CapacitySwitcher::new(collaborators.capacity, retry),
            notifier: collaborators.notifier,
            metrics: collaborators.metrics,
            locks,
            config,
        }
    }

    pub fn config(&self) -> &DrConfig {
        &self.config
    }

    /// Run a full failover drill
    pub async fn execute(&self, cancel: &CancellationToken) -> InvocationResponse<FailoverRun> {
        let mut run = FailoverRun::new(self.config.resource_key());
        tracing::info!("Starting DR failover test {} for {}", run.id, run.resource);

        let mut drill = Drill::default();
        self.advance(&mut run, &mut drill, cancel).await;

        self.enter(&mut run, Phase::Restoring);
        let restore_error = self.restore(&mut run, &drill).await;
        // Lock is held until restoration has completed
        drop(drill.lock.take());

        let terminal = match (&restore_error, &drill.ending) {
            (Some(_), _) => Phase::Failed,
            (None, Some((phase, _))) => *phase,
            (None, None) if drill.converged => Phase::Succeeded,
            (None, None) => Phase::Failed,
        };
        let step = match restore_error.as_ref().or_else(|| drill.error()) {
            Some(err) => StepResult::from_error(terminal, err),
            None => StepResult::ok(terminal),
        };
        self.record(&mut run, step).await;
        self.enter(&mut run, terminal);

        self.summarize(&run, &drill, restore_error.as_ref()).await;
        tracing::info!(
            "DR failover test {} finished: {} ({} steps)",
            run.id,
            run.phase,
            run.steps.len()
        );

        InvocationResponse::new(run.outcome == Some(RunOutcome::Success), run)
    }

    /// Read-only checks: endpoint probes, health-check quorum and current DNS target
    pub async fn preflight(&self) -> InvocationResponse<PreflightReport> {
        let (mut report, _) = self.check_preconditions().await;
        report.current_traffic = Some(self.traffic.observe(&self.config.domain_name).await);
        for failure in report.failures() {
            tracing::warn!("Preflight: {}", failure.message);
        }
        InvocationResponse::new(report.ready, report)
    }

    /// Switch the configured node group to guaranteed capacity
    pub async fn switch_capacity(&self) -> InvocationResponse<CapacityReport> {
        let (pool, plan) = match self.capacity_target() {
            Some(target) => target,
            None => {
                let report = CapacityReport {
                    pool: None,
                    outcome: None,
                    attempts: 0,
                    error: Some("clusterName and nodeGroupName are required".into()),
                };
                return InvocationResponse::new(false, report);
            }
        };

        let _lock = match self.locks.try_acquire(&self.config.resource_key()) {
            Ok(guard) => guard,
            Err(e) => {
                tracing::warn!("Capacity switch refused: {}", e);
                let report = CapacityReport {
                    pool: Some(pool),
                    outcome: None,
                    attempts: 0,
                    error: Some(e.to_string()),
                };
                return InvocationResponse::new(false, report);
            }
        };

        match self.capacity.switch_to(&pool, &plan).await {
            Ok(switched) => {
                self.alert(capacity_alert(&switched.value)).await;
                let success = !switched.value.is_partial();
                let report = CapacityReport {
                    pool: Some(pool),
                    outcome: Some(switched.value),
                    attempts: switched.attempts,
                    error: None,
                };
                InvocationResponse::new(success, report)
            }
            Err(e) => {
                tracing::error!("Capacity switch for {} failed: {}", pool, e);
                self.alert(capacity_error_alert(&plan, &e)).await;
                let report = CapacityReport {
                    pool: Some(pool),
                    outcome: None,
                    attempts: e.attempts(),
                    error: Some(e.to_string()),
                };
                InvocationResponse::new(false, report)
            }
        }
    }

    fn capacity_target(&self) -> Option<(PoolRef, CapacityPlan)> {
        Some((self.config.pool()?, self.config.capacity_plan()?))
    }

    /// Forward path: PreflightCheck through PostFailoverAction.
    ///
    /// Returns as soon as the run has to go to `Restoring`.
    async fn advance(&self, run: &mut FailoverRun, drill: &mut Drill, cancel: &CancellationToken) {
        self.enter(run, Phase::PreflightCheck);
        if cancel.is_cancelled() {
            self.record(run, StepResult::from_error(Phase::PreflightCheck, &DrError::Cancelled)).await;
            drill.end(Phase::Aborted, DrError::Cancelled);
            return;
        }

        let started = Instant::now();
        let (report, attempts) = self.check_preconditions().await;
        let failures = report.failures();
        if !failures.is_empty() {
            for failure in &failures {
                let alert = Alert::drill(failure.severity, failure.kind, failure.message.clone(), run.id);
                self.alert(alert).await;
            }
            let reasons: Vec<&str> = failures.iter().map(|f| f.message.as_str()).collect();
            let err = DrError::PreconditionFailed(reasons.join("; "));
            let step = StepResult::from_error(Phase::PreflightCheck, &err)
                .with_attempts(attempts)
                .with_duration(started.elapsed());
            self.record(run, step).await;
            drill.end(Phase::Aborted, err);
            return;
        }

        match self.locks.try_acquire(&run.resource) {
            Ok(guard) => drill.lock = Some(guard),
            Err(err) => {
                tracing::warn!("Run {}: {}", run.id, err);
                let step = StepResult::from_error(Phase::PreflightCheck, &err).with_duration(started.elapsed());
                self.record(run, step).await;
                drill.end(Phase::Aborted, err);
                return;
            }
        }
        let step = StepResult::ok(Phase::PreflightCheck)
            .with_attempts(attempts)
            .with_duration(started.elapsed());
        self.record(run, step).await;

        if self.cancelled(drill, cancel) {
            return;
        }

        self.enter(run, Phase::FailoverTrigger);
        let started = Instant::now();
        let snapshot = match self.health.snapshot(&self.config.health_check_id).await {
            Ok(snapshot) => snapshot,
            Err(err) => {
                let step = StepResult::from_error(Phase::FailoverTrigger, &err).with_duration(started.elapsed());
                self.record(run, step).await;
                drill.end(Phase::Aborted, err);
                return;
            }
        };
        if snapshot.value.disabled {
            // Restoring this snapshot would leave the check disabled
            let err = DrError::PreconditionFailed(format!(
                "health check {} is already disabled; another drill may be running or an earlier one was not restored",
                snapshot.value.health_check_id
            ));
            let alert = Alert::drill(
                AlertSeverity::Critical,
                AlertKind::HealthCheck,
                format!(
                    "CRITICAL: Health check {} is already disabled, refusing to start failover",
                    snapshot.value.health_check_id
                ),
                run.id,
            );
            self.alert(alert).await;
            let step = StepResult::from_error(Phase::FailoverTrigger, &err)
                .with_attempts(snapshot.attempts)
                .with_duration(started.elapsed());
            self.record(run, step).await;
            drill.end(Phase::Aborted, err);
            return;
        }
        drill.snapshot = Some(snapshot.value.clone());

        match self.health.apply_disable(&snapshot.value).await {
            Ok(disabled) => {
                let step = StepResult::ok(Phase::FailoverTrigger)
                    .with_attempts(snapshot.attempts + disabled.attempts)
                    .with_duration(started.elapsed());
                self.record(run, step).await;
            }
            Err(err) => {
                let step = StepResult::from_error(Phase::FailoverTrigger, &err)
                    .with_attempts(snapshot.attempts + err.attempts())
                    .with_duration(started.elapsed());
                self.record(run, step).await;
                drill.end(Phase::Aborted, err);
                return;
            }
        }

        if self.cancelled(drill, cancel) {
            return;
        }

        self.enter(run, Phase::AwaitingConvergence);
        let timing = self.config.timing;
        let convergence = self
            .traffic
            .poll_until_converged(
                &self.config.domain_name,
                TrafficTarget::PointsToDr,
                timing.poll_interval(),
                timing.max_wait(),
                cancel,
            )
            .await;
        drill.waited_ms = Some(convergence.elapsed_ms());
        let waited = std::time::Duration::from_millis(convergence.elapsed_ms());

        match convergence {
            Convergence::Converged { polls, elapsed_ms, .. } => {
                run.convergence_ms = Some(elapsed_ms);
                drill.converged = true;
                let step = StepResult::ok(Phase::AwaitingConvergence)
                    .with_attempts(polls)
                    .with_duration(waited)
                    .with_detail(format!("{} points to DR after {} polls", self.config.domain_name, polls));
                self.record(run, step).await;
            }
            Convergence::TimedOut { last_observed, polls, elapsed_ms } => {
                let err = DrError::ConvergenceTimeout {
                    waited_ms: elapsed_ms,
                    last_observed,
                };
                let step = StepResult::from_error(Phase::AwaitingConvergence, &err)
                    .with_attempts(polls)
                    .with_duration(waited);
                self.record(run, step).await;
                drill.end(Phase::Failed, err);
                return;
            }
            Convergence::Cancelled { polls, .. } => {
                let step = StepResult::from_error(Phase::AwaitingConvergence, &DrError::Cancelled)
                    .with_attempts(polls)
                    .with_duration(waited);
                self.record(run, step).await;
                drill.end(Phase::Aborted, DrError::Cancelled);
                return;
            }
        }

        if self.cancelled(drill, cancel) {
            return;
        }

        self.enter(run, Phase::PostFailoverAction);
        let (pool, plan) = match self.capacity_target() {
            Some(target) => target,
            None => {
                let step = StepResult::skipped(Phase::PostFailoverAction, "no capacity plan configured");
                self.record(run, step).await;
                return;
            }
        };

        let started = Instant::now();
        match self.capacity.switch_to(&pool, &plan).await {
            Ok(switched) => {
                self.alert(capacity_alert(&switched.value).for_run(run.id)).await;
                let step = match &switched.value {
                    SwitchOutcome::PartiallyApplied { failed_groups, .. } => {
                        let err = DrError::PartiallyApplied {
                            failed_groups: failed_groups.clone(),
                        };
                        StepResult::from_error(Phase::PostFailoverAction, &err)
                    }
                    outcome => StepResult::ok(Phase::PostFailoverAction).with_detail(describe_switch(outcome)),
                };
                let step = step.with_attempts(switched.attempts).with_duration(started.elapsed());
                self.record(run, step).await;
            }
            Err(err) => {
                self.alert(capacity_error_alert(&plan, &err).for_run(run.id)).await;
                let step = StepResult::from_error(Phase::PostFailoverAction, &err).with_duration(started.elapsed());
                self.record(run, step).await;
                drill.end(Phase::Failed, err);
            }
        }
    }

    /// Between-phase cancellation check
    fn cancelled(&self, drill: &mut Drill, cancel: &CancellationToken) -> bool {
        if cancel.is_cancelled() {
            tracing::warn!("Cancellation requested, routing to restoration");
            drill.end(Phase::Aborted, DrError::Cancelled);
            true
        } else {
            false
        }
    }

    async fn check_preconditions(&self) -> (PreflightReport, u32) {
        let primary = self.config.primary_target();
        let dr = self.config.dr_target();
        let timeout = self.config.timing.probe_timeout();

        let (primary, dr, health) = tokio::join!(
            self.prober.probe(&primary, timeout),
            self.prober.probe(&dr, timeout),
            self.health.status(&self.config.health_check_id),
        );

        let (health, attempts) = match health {
            Ok(status) => {
                tracing::info!("Health check {} status: {:?}", self.config.health_check_id, status.value);
                (Ok(status.value), status.attempts)
            }
            Err(e) => (Err(e.to_string()), e.attempts()),
        };
        (PreflightReport::new(primary, dr, health), attempts)
    }

    /// Restore the captured health-check state, if a mutation may have happened
    async fn restore(&self, run: &mut FailoverRun, drill: &Drill) -> Option<DrError> {
        if !run.visited(Phase::FailoverTrigger) {
            let step = StepResult::skipped(Phase::Restoring, "failover was not triggered, nothing to restore");
            self.record(run, step).await;
            return None;
        }
        let snapshot = match &drill.snapshot {
            Some(snapshot) => snapshot,
            None => {
                let step = StepResult::skipped(Phase::Restoring, "no health-check mutation was issued");
                self.record(run, step).await;
                return None;
            }
        };

        let started = Instant::now();
        match self.health.restore(snapshot).await {
            Ok(restored) => {
                let step = StepResult::ok(Phase::Restoring)
                    .with_attempts(restored.attempts)
                    .with_duration(started.elapsed())
                    .with_detail(format!("{:?}", restored.value));
                self.record(run, step).await;
                None
            }
            Err(e) => {
                tracing::error!("Run {}: health check {} restore failed: {}", run.id, snapshot.health_check_id, e);
                let err = DrError::RestorationFailed(e.to_string());
                let step = StepResult::from_error(Phase::Restoring, &err)
                    .with_attempts(e.attempts())
                    .with_duration(started.elapsed());
                self.record(run, step).await;
                Some(err)
            }
        }
    }

    /// Summary alert and metrics for a terminal run
    async fn summarize(&self, run: &FailoverRun, drill: &Drill, restore_error: Option<&DrError>) {
        let alert = match (restore_error, run.outcome) {
            (Some(err), _) => Alert::drill(
                AlertSeverity::Critical,
                AlertKind::Restoration,
                format!(
                    "CRITICAL: Health check {} could not be restored and production routing may remain altered: {}",
                    self.config.health_check_id, err
                ),
                run.id,
            ),
            (None, Some(RunOutcome::Success)) => Alert::drill(
                AlertSeverity::Info,
                AlertKind::Test,
                "SUCCESS: DR failover test completed successfully",
                run.id,
            ),
            (None, Some(RunOutcome::Failed)) => {
                let message = match drill.error() {
                    Some(DrError::ConvergenceTimeout { .. }) | None => {
                        "FAILURE: DR failover test failed! DNS did not resolve to DR endpoint.".to_string()
                    }
                    Some(err) => format!("FAILURE: DR failover test failed: {}", err),
                };
                Alert::drill(AlertSeverity::Critical, AlertKind::Test, message, run.id)
            }
            (None, _) => {
                let reason = drill.error().map(|e| e.to_string()).unwrap_or_else(|| "unknown".into());
                match drill.error() {
                    Some(DrError::ProviderUnavailable { .. } | DrError::ProviderRejected { .. }) => Alert::drill(
                        AlertSeverity::Critical,
                        AlertKind::Error,
                        format!("ABORTED: DR failover test failed with error: {}", reason),
                        run.id,
                    ),
                    _ => Alert::drill(
                        AlertSeverity::Warning,
                        AlertKind::Test,
                        format!("ABORTED: DR failover test aborted: {}", reason),
                        run.id,
                    ),
                }
            }
        };
        self.alert(alert).await;

        let environment = &self.config.environment;
        let mut points = vec![MetricPoint::success(environment, run.outcome == Some(RunOutcome::Success))];
        if let Some(waited) = drill.waited_ms {
            points.push(MetricPoint::latency(environment, waited));
        }
        if let Err(e) = self.metrics.publish(&points).await {
            tracing::warn!("Failed to publish metrics for run {}: {}", run.id, e);
        }
    }

    fn enter(&self, run: &mut FailoverRun, phase: Phase) {
        if let Err(e) = run.transition(phase) {
            tracing::error!("Run {}: {}", run.id, e);
        }
    }

    async fn record(&self, run: &mut FailoverRun, step: StepResult) {
        if let Err(e) = self.notifier.step_recorded(run.id, &step).await {
            tracing::warn!("Failed to report step {} of run {}: {}", step.name, run.id, e);
        }
        if let Err(e) = run.record(step) {
            tracing::error!("Run {}: {}", run.id, e);
        }
    }

    async fn alert(&self, alert: Alert) {
        if let Err(e) = self.notifier.notify(&alert).await {
            tracing::warn!("Failed to send alert '{}': {}", alert.subject, e);
        }
    }
}

fn describe_switch(outcome: &SwitchOutcome) -> String {
    match outcome {
        SwitchOutcome::AlreadyInDesiredState { class } => {
            format!("already using {} capacity, no action needed", class)
        }
        SwitchOutcome::Applied {
            from,
            to,
            scaling_groups_updated,
        } => format!(
            "switched {} -> {}, {} scaling groups updated",
            from,
            to,
            scaling_groups_updated.len()
        ),
        SwitchOutcome::PartiallyApplied { failed_groups, .. } => {
            format!("scaling groups failed: {}", failed_groups.join(", "))
        }
    }
}

fn capacity_alert(outcome: &SwitchOutcome) -> Alert {
    match outcome {
        SwitchOutcome::AlreadyInDesiredState { class } => Alert::capacity(
            AlertSeverity::Info,
            format!("Node group is already using {} capacity type. No action needed.", class),
        ),
        SwitchOutcome::Applied { from, to, .. } => Alert::capacity(
            AlertSeverity::Info,
            format!("Successfully changed node group from {} to {} during failover", from, to),
        ),
        SwitchOutcome::PartiallyApplied {
            from,
            to,
            failed_groups,
            ..
        } => Alert::capacity(
            AlertSeverity::Warning,
            format!(
                "Node group changed from {} to {}, but scaling groups could not be resized: {}",
                from,
                to,
                failed_groups.join(", ")
            ),
        ),
    }
}

fn capacity_error_alert(plan: &CapacityPlan, err: &DrError) -> Alert {
    Alert::capacity(
        AlertSeverity::Critical,
        format!("Error updating node group to {}: {}", plan.target_class, err),
    )
}
