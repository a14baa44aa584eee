//! Drill Metrics

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::notify::NotifyError;

/// Namespace every drill metric is published under
pub const NAMESPACE: &str = "DR/FailoverTests";
/// 1 for a successful drill, 0 otherwise
pub const SUCCESS_METRIC: &str = "DRFailoverTestSuccess";
/// Milliseconds spent waiting for DNS to converge
pub const LATENCY_METRIC: &str = "DRFailoverTestLatency";
/// Dimension carrying the configured environment name
pub const ENVIRONMENT_DIMENSION: &str = "Environment";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MetricUnit {
    Count,
    Milliseconds,
}

/// One data point
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MetricPoint {
    pub namespace: String,
    pub name: String,
    pub dimensions: Vec<(String, String)>,
    pub unit: MetricUnit,
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl MetricPoint {
    fn new(name: &str, environment: &str, unit: MetricUnit, value: f64) -> Self {
        Self {
            namespace: NAMESPACE.to_string(),
            name: name.to_string(),
            dimensions: vec![(ENVIRONMENT_DIMENSION.to_string(), environment.to_string())],
            unit,
            value,
            timestamp: Utc::now(),
        }
    }

    /// Success indicator: 1 for a successful drill, 0 otherwise
    pub fn success(environment: &str, successful: bool) -> Self {
        Self::new(SUCCESS_METRIC, environment, MetricUnit::Count, if successful { 1.0 } else { 0.0 })
    }

    /// Measured time spent waiting for DNS convergence
    pub fn latency(environment: &str, waited_ms: u64) -> Self {
        Self::new(LATENCY_METRIC, environment, MetricUnit::Milliseconds, waited_ms as f64)
    }
}

/// Time-series sink
#[async_trait]
pub trait MetricsSink: Send + Sync {
    async fn publish(&self, points: &[MetricPoint]) -> Result<(), NotifyError>;
}

/// Metrics store keeping the published points
pub struct InMemoryMetrics {
    points: Arc<RwLock<Vec<MetricPoint>>>,
}

impl InMemoryMetrics {
    pub fn new() -> Self {
        Self {
            points: Arc::new(RwLock::new(Vec::new())),
        }
    }

    pub fn points(&self) -> Vec<MetricPoint> {
        self.points.read().clone()
    }

    /// Most recent value of a series
    pub fn latest(&self, name: &str) -> Option<f64> {
        self.points.read().iter().rev().find(|p| p.name == name).map(|p| p.value)
    }

    /// Export as Prometheus format
    pub fn prometheus(&self) -> String {
        let points = self.points.read();
        let mut output = String::new();

        for (name, help) in [
            (SUCCESS_METRIC, "Whether the last DR failover test succeeded"),
            (LATENCY_METRIC, "Time waited for DNS to converge on DR, in milliseconds"),
        ] {
            let series: Vec<&MetricPoint> = points.iter().filter(|p| p.name == name).collect();
            if series.is_empty() {
                continue;
            }
            output.push_str(&format!("# HELP {} {}\n", name, help));
            output.push_str(&format!("# TYPE {} gauge\n", name));
            for point in series {
                let labels: Vec<String> = point
                    .dimensions
                    .iter()
                    .map(|(k, v)| format!("{}=\"{}\"", k, escape_label(v)))
                    .collect();
                output.push_str(&format!(
                    "{}{{{}}} {} {}\n",
                    name,
                    labels.join(","),
                    point.value,
                    point.timestamp.timestamp_millis()
                ));
            }
        }

        output
    }
}

/// Escape a label value for the Prometheus text format
fn escape_label(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        match c {
            '\\' => escaped.push_str("\\\\"),
            '"' => escaped.push_str("\\\""),
            '\n' => escaped.push_str("\\n"),
            c => escaped.push(c),
        }
    }
    escaped
}

impl Default for InMemoryMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetricsSink for InMemoryMetrics {
    async fn publish(&self, points: &[MetricPoint]) -> Result<(), NotifyError> {
        self.points.write().extend_from_slice(points);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_and_export() {
        let metrics = InMemoryMetrics::new();
        metrics
            .publish(&[MetricPoint::success("Production", true), MetricPoint::latency("Production", 20_000)])
            .await
            .unwrap();

        assert_eq!(metrics.latest(SUCCESS_METRIC), Some(1.0));
        assert_eq!(metrics.latest(LATENCY_METRIC), Some(20_000.0));

        let text = metrics.prometheus();
        assert!(text.contains("# TYPE DRFailoverTestSuccess gauge"));
        assert!(text.contains("DRFailoverTestSuccess{Environment=\"Production\"} 1 "));
        assert!(text.contains("DRFailoverTestLatency{Environment=\"Production\"} 20000 "));
    }

    #[test]
    fn test_points_carry_namespace() {
        let point = MetricPoint::success("Staging", false);
        assert_eq!(point.namespace, NAMESPACE);
        assert_eq!(point.value, 0.0);
        assert_eq!(point.unit, MetricUnit::Count);
        assert_eq!(point.dimensions, vec![("Environment".to_string(), "Staging".to_string())]);
    }

    #[tokio::test]
    async fn test_label_values_are_escaped() {
        let metrics = InMemoryMetrics::new();
        metrics
            .publish(&[MetricPoint::success("Prod \"east\"\\a\nb", true)])
            .await
            .unwrap();

        let text = metrics.prometheus();
        assert!(text.contains(r#"DRFailoverTestSuccess{Environment="Prod \"east\"\\a\nb"} 1 "#));
        assert_eq!(text.lines().count(), 3);
    }

    #[test]
    fn test_empty_export() {
        assert!(InMemoryMetrics::new().prometheus().is_empty());
    }
}
