//! DR Runner - Main Entry Point
//!
//! Scheduled entry point for DR failover drills.
//!
//! # Usage
//!
//! ```bash
//! dr-runner --config /etc/dr/failover.json
//! dr-runner --config failover.json preflight
//! dr-runner --config failover.json switch-capacity
//! dr-runner --config failover.json --metrics-file /var/lib/node_exporter/dr.prom failover-test
//! dr-runner --config failover.json --lock-dir /run/dr-failover
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use dr_failover::control_plane::HttpControlPlane;
use dr_failover::dns::SystemResolver;
use dr_failover::notify::{LogNotifier, WebhookNotifier};
use dr_failover::{
    Collaborators, DrConfig, FailoverOrchestrator, FileRunLocks, HttpProber, InMemoryMetrics, InvocationResponse,
    Notifier,
};

#[derive(Parser)]
#[command(name = "dr-runner")]
#[command(version)]
#[command(about = "Run DR failover drills against a primary/DR environment pair", long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(long, env = "DR_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Control-plane API base URL (overrides controlPlaneUrl)
    #[arg(long, env = "DR_CONTROL_PLANE_URL")]
    control_plane_url: Option<String>,

    /// Write published metrics here in Prometheus text format
    #[arg(long)]
    metrics_file: Option<PathBuf>,

    /// Directory for run lock files, shared by every invocation on this host
    #[arg(long, env = "DR_LOCK_DIR")]
    lock_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    /// Full drill: preflight, disable health check, await DNS, switch capacity, restore
    FailoverTest,
    /// Switch the configured node group from spot to on-demand capacity
    SwitchCapacity,
    /// Read-only environment and health-check checks
    Preflight,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    tracing::info!("DR Runner v{}", env!("CARGO_PKG_VERSION"));

    let cli = Cli::parse();
    let status = run(cli).await?;
    if status != 200 {
        std::process::exit(1);
    }
    Ok(())
}

async fn run(cli: Cli) -> Result<u16> {
    let config = load_config(&cli, |key| std::env::var(key).ok())?;

    let control_plane_url = config
        .control_plane_url
        .as_deref()
        .context("controlPlaneUrl is required (--control-plane-url or DR_CONTROL_PLANE_URL)")?;
    let control_plane = Arc::new(HttpControlPlane::new(control_plane_url)?);
    let metrics = Arc::new(InMemoryMetrics::new());

    let collaborators = Collaborators {
        prober: Arc::new(HttpProber::new()),
        health_checks: control_plane.clone(),
        resolver: Arc::new(SystemResolver::new()),
        capacity: control_plane,
        notifier: build_notifier(config.notify_topic.as_deref()),
        metrics: metrics.clone(),
    };
    let lock_dir = cli.lock_dir.clone().unwrap_or_else(std::env::temp_dir);
    tracing::debug!("Run locks under {}", lock_dir.display());
    let orchestrator = FailoverOrchestrator::new(config, collaborators, Arc::new(FileRunLocks::new(lock_dir)));

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupt received, cancelling run");
            on_signal.cancel();
        }
    });

    let status = match cli.command.unwrap_or(Command::FailoverTest) {
        Command::FailoverTest => emit(&orchestrator.execute(&cancel).await)?,
        Command::SwitchCapacity => emit(&orchestrator.switch_capacity().await)?,
        Command::Preflight => emit(&orchestrator.preflight().await)?,
    };

    if let Some(path) = &cli.metrics_file {
        write_metrics(path, &metrics).await?;
    }
    Ok(status)
}

/// File (if any), then environment overrides, then validation
fn load_config<F>(cli: &Cli, lookup: F) -> Result<DrConfig>
where
    F: Fn(&str) -> Option<String>,
{
    let mut config = match &cli.config {
        Some(path) => {
            let path = path.to_string_lossy();
            tracing::info!("Loading config from {}", path);
            DrConfig::load(&path)?
        }
        None => {
            tracing::warn!("No config file given, using environment only");
            DrConfig::default()
        }
    };

    config.apply_env_overrides(lookup)?;
    if let Some(url) = &cli.control_plane_url {
        config.control_plane_url = Some(url.clone());
    }
    config.validate()?;
    Ok(config)
}

/// Webhook URL to post alerts to, if the topic is one
fn webhook_target(topic: Option<&str>) -> Option<&str> {
    topic.filter(|t| WebhookNotifier::accepts(t))
}

fn build_notifier(topic: Option<&str>) -> Arc<dyn Notifier> {
    match (webhook_target(topic), topic) {
        (Some(url), _) => {
            tracing::info!("Sending alerts to {}", url);
            Arc::new(WebhookNotifier::new(url))
        }
        (None, Some(topic)) => {
            tracing::warn!("Notify topic {} is not a webhook URL, alerts will only be logged", topic);
            Arc::new(LogNotifier)
        }
        (None, None) => Arc::new(LogNotifier),
    }
}

fn emit<T: Serialize>(response: &InvocationResponse<T>) -> Result<u16> {
    let json = serde_json::to_string_pretty(response)?;
    println!("{}", json);
    Ok(response.status_code)
}

async fn write_metrics(path: &Path, metrics: &InMemoryMetrics) -> Result<()> {
    let text = metrics.prometheus();
    if text.is_empty() {
        bail!("no metrics were published");
    }
    tokio::fs::write(path, text)
        .await
        .with_context(|| format!("writing metrics to {}", path.display()))?;
    tracing::info!("Metrics written to {}", path.display());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use dr_failover::metrics::MetricPoint;
    use dr_failover::MetricsSink;
    use std::collections::HashMap;

    fn env(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    fn drill_env() -> HashMap<String, String> {
        env(&[
            ("PRIMARY_ENDPOINT", "https://app.example.com"),
            ("DR_ENDPOINT", "https://dr.example.com"),
            ("PRIMARY_REGION", "us-east-1"),
            ("DR_REGION", "us-west-2"),
            ("HEALTH_CHECK_ID", "hc-1"),
            ("DOMAIN_NAME", "app.example.com"),
        ])
    }

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_default_command_is_failover_test() {
        let cli = Cli::try_parse_from(["dr-runner"]).unwrap();
        assert_eq!(cli.command.unwrap_or(Command::FailoverTest), Command::FailoverTest);

        let cli = Cli::try_parse_from(["dr-runner", "--metrics-file", "/tmp/dr.prom", "switch-capacity"]).unwrap();
        assert_eq!(cli.command, Some(Command::SwitchCapacity));
        assert_eq!(cli.metrics_file, Some(PathBuf::from("/tmp/dr.prom")));
    }

    #[test]
    fn test_config_from_environment() {
        let cli = Cli::try_parse_from(["dr-runner", "--control-plane-url", "http://cp.internal"]).unwrap();
        let vars = drill_env();
        let config = load_config(&cli, |k| vars.get(k).cloned()).unwrap();

        assert_eq!(config.health_check_id, "hc-1");
        assert_eq!(config.control_plane_url.as_deref(), Some("http://cp.internal"));
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let cli = Cli::try_parse_from(["dr-runner"]).unwrap();
        let mut vars = drill_env();
        vars.insert("DR_REGION".into(), "us-east-1".into());
        assert!(load_config(&cli, |k| vars.get(k).cloned()).is_err());
    }

    #[test]
    fn test_webhook_selected_for_urls() {
        assert_eq!(
            webhook_target(Some("https://hooks.example.com/dr")),
            Some("https://hooks.example.com/dr")
        );
        assert_eq!(webhook_target(Some("arn:aws:sns:us-east-1:123456789012:dr-alerts")), None);
        assert_eq!(webhook_target(None), None);
    }

    #[test]
    fn test_lock_dir_flag() {
        let cli = Cli::try_parse_from(["dr-runner", "--lock-dir", "/run/dr-failover", "preflight"]).unwrap();
        assert_eq!(cli.lock_dir, Some(PathBuf::from("/run/dr-failover")));
        assert_eq!(cli.command, Some(Command::Preflight));
    }

    #[test]
    fn test_metrics_file_written() {
        let metrics = InMemoryMetrics::new();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("dr.prom");

        tokio_test::block_on(async {
            assert!(write_metrics(&path, &metrics).await.is_err());

            metrics.publish(&[MetricPoint::success("Production", true)]).await.unwrap();
            write_metrics(&path, &metrics).await.unwrap();
        });

        let text = std::fs::read_to_string(&path).unwrap();
        assert!(text.contains("DRFailoverTestSuccess{Environment=\"Production\"} 1"));
    }
}
