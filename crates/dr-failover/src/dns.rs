//! DNS / Traffic Verification
//!
//! Resolves the drill domain and decides whether it currently routes to the
//! primary or the DR environment. Polling replaces a fixed post-failover
//! sleep: it stops as soon as routing converges, when `max_wait` elapses, or
//! when the run is cancelled.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::config::EndpointTarget;
use crate::ProviderError;

/// Where the domain currently routes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrafficTarget {
    PointsToPrimary,
    PointsToDr,
    Ambiguous,
}

impl fmt::Display for TrafficTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PointsToPrimary => "primary",
            Self::PointsToDr => "dr",
            Self::Ambiguous => "ambiguous",
        };
        f.write_str(s)
    }
}

/// Records returned for a domain (host names or addresses)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedTarget {
    pub domain: String,
    pub records: Vec<String>,
}

/// Name resolution backend
#[async_trait]
pub trait DnsResolver: Send + Sync {
    async fn resolve(&self, domain: &str) -> Result<ResolvedTarget, ProviderError>;
}

/// Resolver backed by the system resolver
pub struct SystemResolver {
    port: u16,
}

impl SystemResolver {
    pub fn new() -> Self {
        Self { port: 443 }
    }
}

impl Default for SystemResolver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DnsResolver for SystemResolver {
    async fn resolve(&self, domain: &str) -> Result<ResolvedTarget, ProviderError> {
        let addrs = tokio::net::lookup_host((domain, self.port))
            .await
            .map_err(|e| ProviderError::Transient(format!("lookup {} failed: {}", domain, e)))?;

        let mut records: Vec<String> = addrs.map(|a| a.ip().to_string()).collect();
        records.sort();
        records.dedup();
        Ok(ResolvedTarget {
            domain: domain.to_string(),
            records,
        })
    }
}

/// Classifies resolved records against the primary and DR targets
#[derive(Debug, Clone)]
pub struct TrafficClassifier {
    primary: EndpointTarget,
    dr: EndpointTarget,
}

impl TrafficClassifier {
    pub fn new(primary: EndpointTarget, dr: EndpointTarget) -> Self {
        Self { primary, dr }
    }

    /// Every record must point at exactly one side for a definitive answer
    pub fn classify(&self, resolved: &ResolvedTarget) -> TrafficTarget {
        if resolved.records.is_empty() {
            return TrafficTarget::Ambiguous;
        }

        let mut primary = 0;
        let mut dr = 0;
        for record in &resolved.records {
            match (record_matches(&self.primary, record), record_matches(&self.dr, record)) {
                (true, false) => primary += 1,
                (false, true) => dr += 1,
                _ => return TrafficTarget::Ambiguous,
            }
        }

        match (primary, dr) {
            (0, _) => TrafficTarget::PointsToDr,
            (_, 0) => TrafficTarget::PointsToPrimary,
            _ => TrafficTarget::Ambiguous,
        }
    }
}

/// A record matches if it is an address inside one of the target's networks,
/// or a host name with a label equal to the target's region tag.
fn record_matches(target: &EndpointTarget, record: &str) -> bool {
    if let Ok(ip) = record.parse::<IpAddr>() {
        return target.networks.iter().any(|n| n.contains(ip));
    }
    let region = target.region.trim();
    !region.is_empty()
        && record
            .trim_end_matches('.')
            .split('.')
            .any(|label| label.eq_ignore_ascii_case(region))
}

/// Outcome of a convergence wait
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "camelCase")]
pub enum Convergence {
    #[serde(rename_all = "camelCase")]
    Converged { target: TrafficTarget, polls: u32, elapsed_ms: u64 },
    #[serde(rename_all = "camelCase")]
    TimedOut { last_observed: TrafficTarget, polls: u32, elapsed_ms: u64 },
    #[serde(rename_all = "camelCase")]
    Cancelled { polls: u32, elapsed_ms: u64 },
}

impl Convergence {
    pub fn elapsed_ms(&self) -> u64 {
        match self {
            Self::Converged { elapsed_ms, .. }
            | Self::TimedOut { elapsed_ms, .. }
            | Self::Cancelled { elapsed_ms, .. } => *elapsed_ms,
        }
    }

    pub fn polls(&self) -> u32 {
        match self {
            Self::Converged { polls, .. } | Self::TimedOut { polls, .. } | Self::Cancelled { polls, .. } => *polls,
        }
    }
}

/// DNS/traffic verifier
pub struct TrafficVerifier {
    resolver: Arc<dyn DnsResolver>,
    classifier: TrafficClassifier,
}

impl TrafficVerifier {
    pub fn new(resolver: Arc<dyn DnsResolver>, classifier: TrafficClassifier) -> Self {
        Self { resolver, classifier }
    }

    /// Resolve the domain
    pub async fn resolve(&self, domain: &str) -> Result<ResolvedTarget, ProviderError> {
        self.resolver.resolve(domain).await
    }

    /// Resolve and classify once; resolution errors read as `Ambiguous`
    pub async fn observe(&self, domain: &str) -> TrafficTarget {
        match self.resolve(domain).await {
            Ok(resolved) => {
                let target = self.classifier.classify(&resolved);
                tracing::debug!("DNS {} resolved to {:?} ({})", domain, resolved.records, target);
                target
            }
            Err(e) => {
                tracing::warn!("DNS resolution for {} failed: {}", domain, e);
                TrafficTarget::Ambiguous
            }
        }
    }

    /// Poll every `interval` until `expected` is observed, `max_wait`
    /// elapses, or `cancel` fires.
    pub async fn poll_until_converged(
        &self,
        domain: &str,
        expected: TrafficTarget,
        interval: Duration,
        max_wait: Duration,
        cancel: &CancellationToken,
    ) -> Convergence {
        let start = Instant::now();
        let deadline = start + max_wait;
        let elapsed_ms = || start.elapsed().as_millis() as u64;
        let mut polls = 0;
        let mut last_observed = TrafficTarget::Ambiguous;

        loop {
            if cancel.is_cancelled() {
                return Convergence::Cancelled { polls, elapsed_ms: elapsed_ms() };
            }

            polls += 1;
            let observed = tokio::select! {
                _ = cancel.cancelled() => {
                    return Convergence::Cancelled { polls, elapsed_ms: elapsed_ms() };
                }
                res = tokio::time::timeout_at(deadline, self.observe(domain)) => match res {
                    Ok(target) => target,
                    Err(_) => {
                        return Convergence::TimedOut { last_observed, polls, elapsed_ms: elapsed_ms() };
                    }
                },
            };
            last_observed = observed;

            if observed == expected {
                tracing::info!("DNS for {} converged on {} after {} polls", domain, observed, polls);
                return Convergence::Converged {
                    target: observed,
                    polls,
                    elapsed_ms: elapsed_ms(),
                };
            }

            let wake = (Instant::now() + interval).min(deadline);
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Convergence::Cancelled { polls, elapsed_ms: elapsed_ms() };
                }
                _ = tokio::time::sleep_until(wake) => {}
            }

            if Instant::now() >= deadline {
                tracing::warn!(
                    "DNS for {} did not converge on {} within {:?} (last observed {})",
                    domain,
                    expected,
                    max_wait,
                    last_observed
                );
                return Convergence::TimedOut { last_observed, polls, elapsed_ms: elapsed_ms() };
            }
        }
    }
}
