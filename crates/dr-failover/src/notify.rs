//! Alerts and step events

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use uuid::Uuid;

use crate::run::StepResult;

/// Subject used by capacity-switch alerts
pub const CAPACITY_SUBJECT: &str = "DR Failover - Capacity Type Update";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

/// What the alert is about
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertKind {
    Primary,
    Dr,
    #[serde(rename = "HEALTHCHECK")]
    HealthCheck,
    Test,
    Error,
    Capacity,
    Restoration,
}

impl AlertKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::Primary => "PRIMARY",
            Self::Dr => "DR",
            Self::HealthCheck => "HEALTHCHECK",
            Self::Test => "TEST",
            Self::Error => "ERROR",
            Self::Capacity => "CAPACITY",
            Self::Restoration => "RESTORATION",
        }
    }
}

impl fmt::Display for AlertKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Operator alert
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Alert {
    pub severity: AlertSeverity,
    pub kind: AlertKind,
    pub subject: String,
    pub message: String,
    pub run_id: Option<Uuid>,
}

impl Alert {
    /// Alert raised by a failover drill
    pub fn drill(severity: AlertSeverity, kind: AlertKind, message: impl Into<String>, run_id: Uuid) -> Self {
        Self {
            severity,
            kind,
            subject: format!("DR Failover Test - {}", kind.label()),
            message: message.into(),
            run_id: Some(run_id),
        }
    }

    /// Alert raised by a capacity switch
    pub fn capacity(severity: AlertSeverity, message: impl Into<String>) -> Self {
        Self {
            severity,
            kind: AlertKind::Capacity,
            subject: CAPACITY_SUBJECT.to_string(),
            message: message.into(),
            run_id: None,
        }
    }

    pub fn for_run(mut self, run_id: Uuid) -> Self {
        self.run_id = Some(run_id);
        self
    }
}

/// Delivery errors for alerts and metrics
#[derive(Debug, Clone, Error)]
pub enum NotifyError {
    #[error("delivery failed: {0}")]
    Delivery(String),
    #[error("serialization failed: {0}")]
    Serialization(String),
}

/// Alert and step-event sink
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, alert: &Alert) -> Result<(), NotifyError>;

    /// Called once for every step appended to a run
    async fn step_recorded(&self, _run_id: Uuid, _step: &StepResult) -> Result<(), NotifyError> {
        Ok(())
    }
}

/// Writes alerts and steps to the tracing subscriber
#[derive(Debug, Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, alert: &Alert) -> Result<(), NotifyError> {
        match alert.severity {
            AlertSeverity::Critical => tracing::error!("[{}] {}", alert.subject, alert.message),
            AlertSeverity::Warning => tracing::warn!("[{}] {}", alert.subject, alert.message),
            AlertSeverity::Info => tracing::info!("[{}] {}", alert.subject, alert.message),
        }
        Ok(())
    }

    async fn step_recorded(&self, run_id: Uuid, step: &StepResult) -> Result<(), NotifyError> {
        tracing::info!(
            "Run {} step {}: {:?} (attempts={}, {}ms){}",
            run_id,
            step.name,
            step.status,
            step.attempts,
            step.duration_ms,
            step.error
                .as_deref()
                .or(step.detail.as_deref())
                .map(|e| format!(" - {}", e))
                .unwrap_or_default()
        );
        Ok(())
    }
}

/// Posts alerts as JSON to a webhook URL
pub struct WebhookNotifier {
    url: String,
    client: reqwest::Client,
}

impl WebhookNotifier {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::Client::new(),
        }
    }

    /// Whether `target` is something this notifier can post to
    pub fn accepts(target: &str) -> bool {
        target.starts_with("http://") || target.starts_with("https://")
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, alert: &Alert) -> Result<(), NotifyError> {
        let payload = serde_json::to_string(alert).map_err(|e| NotifyError::Serialization(e.to_string()))?;

        let resp = self
            .client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .header("X-DR-Alert-Kind", alert.kind.label())
            .body(payload)
            .timeout(Duration::from_secs(30))
            .send()
            .await
            .map_err(|e| NotifyError::Delivery(e.to_string()))?;

        if resp.status().is_success() {
            tracing::debug!("Alert '{}' delivered to {}", alert.subject, self.url);
            Ok(())
        } else {
            Err(NotifyError::Delivery(format!("HTTP {}", resp.status())))
        }
    }
}

/// Keeps every alert and step in memory
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    alerts: Mutex<Vec<Alert>>,
    steps: Mutex<Vec<(Uuid, StepResult)>>,
    failing: Mutex<bool>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every delivery fail (after recording it)
    pub fn set_failing(&self, failing: bool) {
        *self.failing.lock() = failing;
    }

    pub fn alerts(&self) -> Vec<Alert> {
        self.alerts.lock().clone()
    }

    pub fn alerts_of(&self, kind: AlertKind) -> Vec<Alert> {
        self.alerts.lock().iter().filter(|a| a.kind == kind).cloned().collect()
    }

    pub fn steps(&self) -> Vec<StepResult> {
        self.steps.lock().iter().map(|(_, s)| s.clone()).collect()
    }

    fn result(&self) -> Result<(), NotifyError> {
        if *self.failing.lock() {
            Err(NotifyError::Delivery("notifier offline".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, alert: &Alert) -> Result<(), NotifyError> {
        self.alerts.lock().push(alert.clone());
        self.result()
    }

    async fn step_recorded(&self, run_id: Uuid, step: &StepResult) -> Result<(), NotifyError> {
        self.steps.lock().push((run_id, step.clone()));
        self.result()
    }
}
