//! Failover run record and phase rules

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

use crate::DrError;

/// Orchestration phase
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Phase {
    /// Run created, nothing checked yet
    Init,
    /// Probing both environments and reading the health-check quorum
    PreflightCheck,
    /// Snapshotting and disabling the primary health check
    FailoverTrigger,
    /// Polling DNS until it points to DR
    AwaitingConvergence,
    /// Switching compute capacity
    PostFailoverAction,
    /// Putting the health check back to its snapshot
    Restoring,
    /// Drill converged and restoration succeeded
    Succeeded,
    /// Drill ran but did not converge, or restoration failed
    Failed,
    /// Drill stopped before it could prove anything
    Aborted,
}

impl Phase {
    /// `Succeeded`, `Failed` or `Aborted`
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Aborted)
    }

    fn rank(self) -> u8 {
        match self {
            Self::Init => 0,
            Self::PreflightCheck => 1,
            Self::FailoverTrigger => 2,
            Self::AwaitingConvergence => 3,
            Self::PostFailoverAction => 4,
            Self::Restoring => 5,
            Self::Succeeded | Self::Failed | Self::Aborted => 6,
        }
    }

    /// Phases only move forward; terminal phases are entered from `Restoring` only
    pub fn can_transition_to(self, next: Phase) -> bool {
        if self.is_terminal() {
            return false;
        }
        if next.is_terminal() {
            return self == Self::Restoring;
        }
        next.rank() > self.rank()
    }

    /// Snake-case name, used as the step name
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Init => "init",
            Self::PreflightCheck => "preflight_check",
            Self::FailoverTrigger => "failover_trigger",
            Self::AwaitingConvergence => "awaiting_convergence",
            Self::PostFailoverAction => "post_failover_action",
            Self::Restoring => "restoring",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Aborted => "aborted",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunOutcome {
    /// Reached `Succeeded`
    Success,
    /// Reached `Failed`
    Failed,
    /// Reached `Aborted`
    Aborted,
}

impl RunOutcome {
    fn from_phase(phase: Phase) -> Option<Self> {
        match phase {
            Phase::Succeeded => Some(Self::Success),
            Phase::Failed => Some(Self::Failed),
            Phase::Aborted => Some(Self::Aborted),
            _ => None,
        }
    }
}

/// How a step ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepStatus {
    /// Work done
    Ok,
    /// Work attempted and failed; `error` says why
    Failed,
    /// Nothing to do; `detail` says why
    Skipped,
}

/// Audit entry for one phase's work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StepResult {
    /// Phase name
    pub name: String,
    /// Phase the step belongs to
    pub phase: Phase,
    /// Provider calls made, retries included
    pub attempts: u32,
    /// How the step ended
    pub status: StepStatus,
    /// Failure detail, set only on `Failed` steps
    pub error: Option<String>,
    /// Informational note on `Ok` and `Skipped` steps
    pub detail: Option<String>,
    /// Wall time spent in the step
    pub duration_ms: u64,
    /// When the step was appended
    pub recorded_at: DateTime<Utc>,
}

impl StepResult {
    fn new(phase: Phase, status: StepStatus) -> Self {
        Self {
            name: phase.as_str().to_string(),
            phase,
            attempts: 0,
            status,
            error: None,
            detail: None,
            duration_ms: 0,
            recorded_at: Utc::now(),
        }
    }

    /// Successful step
    pub fn ok(phase: Phase) -> Self {
        Self::new(phase, StepStatus::Ok)
    }

    /// Failed step with its error detail
    pub fn failed(phase: Phase, error: impl Into<String>) -> Self {
        let mut step = Self::new(phase, StepStatus::Failed);
        step.error = Some(error.into());
        step
    }

    /// Failed step carrying a [`DrError`], prefixed with its kind
    pub fn from_error(phase: Phase, error: &DrError) -> Self {
        Self::failed(phase, format!("{}: {}", error.kind(), error)).with_attempts(error.attempts())
    }

    /// Step with nothing to do
    pub fn skipped(phase: Phase, reason: impl Into<String>) -> Self {
        Self::new(phase, StepStatus::Skipped).with_detail(reason)
    }

    /// Set the provider call count
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempts = attempts;
        self
    }

    /// Set the wall time
    pub fn with_duration(mut self, duration: Duration) -> Self {
        self.duration_ms = duration.as_millis() as u64;
        self
    }

    /// Attach an informational note; never touches `error`
    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

/// One failover drill
///
/// Mutated only by the orchestrator; immutable once terminal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailoverRun {
    /// Run identifier, also attached to alerts
    pub id: Uuid,
    /// Locked resource (cluster/domain)
    pub resource: String,
    /// Creation time
    pub started_at: DateTime<Utc>,
    /// Set when the run turns terminal
    pub ended_at: Option<DateTime<Utc>>,
    /// Current phase
    pub phase: Phase,
    /// Every phase entered, in order
    pub phases: Vec<Phase>,
    /// Set when the run turns terminal
    pub outcome: Option<RunOutcome>,
    /// Audit log, one entry per transition
    pub steps: Vec<StepResult>,
    /// Observed time for DNS to reach the DR target
    pub convergence_ms: Option<u64>,
}

impl FailoverRun {
    /// Fresh run in `Init` for `resource`
    pub fn new(resource: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            resource: resource.into(),
            started_at: Utc::now(),
            ended_at: None,
            phase: Phase::Init,
            phases: vec![Phase::Init],
            outcome: None,
            steps: Vec::new(),
            convergence_ms: None,
        }
    }

    /// Whether the run has reached a terminal phase
    pub fn is_terminal(&self) -> bool {
        self.phase.is_terminal()
    }

    /// Whether the run ever entered `phase`
    pub fn visited(&self, phase: Phase) -> bool {
        self.phases.contains(&phase)
    }

    /// Move to `next`, enforcing the phase ordering
    pub fn transition(&mut self, next: Phase) -> Result<(), DrError> {
        if self.is_terminal() {
            return Err(DrError::RunTerminal(self.id));
        }
        if !self.phase.can_transition_to(next) {
            return Err(DrError::InvalidTransition { from: self.phase, to: next });
        }
        tracing::debug!("Run {}: {} -> {}", self.id, self.phase, next);
        self.phase = next;
        self.phases.push(next);
        if let Some(outcome) = RunOutcome::from_phase(next) {
            self.outcome = Some(outcome);
            self.ended_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Append a step to the audit log
    pub fn record(&mut self, step: StepResult) -> Result<(), DrError> {
        if self.is_terminal() {
            return Err(DrError::RunTerminal(self.id));
        }
        self.steps.push(step);
        Ok(())
    }

    /// First step recorded for `phase`
    pub fn step(&self, phase: Phase) -> Option<&StepResult> {
        self.steps.iter().find(|s| s.phase == phase)
    }

    /// Start to end, once terminal
    pub fn duration_ms(&self) -> Option<u64> {
        self.ended_at
            .map(|end| (end - self.started_at).num_milliseconds().max(0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forward_only() {
        assert!(Phase::Init.can_transition_to(Phase::PreflightCheck));
        assert!(Phase::PreflightCheck.can_transition_to(Phase::Restoring));
        assert!(!Phase::AwaitingConvergence.can_transition_to(Phase::FailoverTrigger));
        assert!(!Phase::Restoring.can_transition_to(Phase::Restoring));
    }

    #[test]
    fn test_terminal_only_from_restoring() {
        for phase in [Phase::Init, Phase::PreflightCheck, Phase::FailoverTrigger, Phase::PostFailoverAction] {
            assert!(!phase.can_transition_to(Phase::Succeeded));
            assert!(!phase.can_transition_to(Phase::Aborted));
        }
        assert!(Phase::Restoring.can_transition_to(Phase::Failed));
        assert!(!Phase::Failed.can_transition_to(Phase::Succeeded));
    }

    #[test]
    fn test_run_becomes_immutable_when_terminal() {
        let mut run = FailoverRun::new("prod/example.com");
        run.transition(Phase::PreflightCheck).unwrap();
        run.record(StepResult::failed(Phase::PreflightCheck, "primary down")).unwrap();
        run.transition(Phase::Restoring).unwrap();
        run.transition(Phase::Aborted).unwrap();

        assert_eq!(run.outcome, Some(RunOutcome::Aborted));
        assert!(run.ended_at.is_some());
        assert!(matches!(run.record(StepResult::ok(Phase::Restoring)), Err(DrError::RunTerminal(_))));
        assert!(matches!(run.transition(Phase::Failed), Err(DrError::RunTerminal(_))));
        assert_eq!(
            run.phases,
            vec![Phase::Init, Phase::PreflightCheck, Phase::Restoring, Phase::Aborted]
        );
    }

    #[test]
    fn test_invalid_transition_rejected() {
        let mut run = FailoverRun::new("example.com");
        let err = run.transition(Phase::Succeeded).unwrap_err();
        assert!(matches!(err, DrError::InvalidTransition { from: Phase::Init, to: Phase::Succeeded }));
        assert_eq!(run.phase, Phase::Init);
    }

    #[test]
    fn test_step_from_error() {
        let err = DrError::ProviderUnavailable {
            operation: "disable_health_check".into(),
            attempts: 3,
            message: "503".into(),
        };
        let step = StepResult::from_error(Phase::FailoverTrigger, &err);
        assert_eq!(step.status, StepStatus::Failed);
        assert_eq!(step.attempts, 3);
        assert!(step.error.unwrap().starts_with("ProviderUnavailable"));
        assert!(step.detail.is_none());
    }

    #[test]
    fn test_notes_never_land_in_error() {
        let step = StepResult::ok(Phase::Restoring).with_detail("AlreadyInPlace");
        assert_eq!(step.detail.as_deref(), Some("AlreadyInPlace"));
        assert!(step.error.is_none());

        let step = StepResult::skipped(Phase::PostFailoverAction, "no capacity plan configured");
        assert_eq!(step.status, StepStatus::Skipped);
        assert!(step.error.is_none());
        assert_eq!(step.detail.as_deref(), Some("no capacity plan configured"));
    }
}
