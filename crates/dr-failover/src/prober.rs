//! Endpoint Probing

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;

use crate::config::EndpointTarget;

/// Well-known health path appended to every base URL
pub const HEALTH_PATH: &str = "/health";

/// Probe verdict
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProbeStatus {
    Healthy,
    Unhealthy,
}

/// Result of one probe
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProbeResult {
    pub endpoint: String,
    pub status: ProbeStatus,
    pub latency_ms: u64,
    pub detail: Option<String>,
}

impl ProbeResult {
    pub fn healthy(endpoint: &EndpointTarget, latency: Duration, detail: impl Into<String>) -> Self {
        Self::new(endpoint, ProbeStatus::Healthy, latency, detail)
    }

    pub fn unhealthy(endpoint: &EndpointTarget, latency: Duration, detail: impl Into<String>) -> Self {
        Self::new(endpoint, ProbeStatus::Unhealthy, latency, detail)
    }

    fn new(endpoint: &EndpointTarget, status: ProbeStatus, latency: Duration, detail: impl Into<String>) -> Self {
        Self {
            endpoint: endpoint.name.clone(),
            status,
            latency_ms: latency.as_millis() as u64,
            detail: Some(detail.into()),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == ProbeStatus::Healthy
    }
}

/// Reachability check against an endpoint.
///
/// Implementations never fail: every error maps to `Unhealthy`.
#[async_trait]
pub trait EndpointProber: Send + Sync {
    async fn probe(&self, endpoint: &EndpointTarget, timeout: Duration) -> ProbeResult;
}

/// HTTP prober (`GET {base_url}/health`, 2xx is healthy)
pub struct HttpProber {
    client: reqwest::Client,
}

impl HttpProber {
    pub fn new() -> Self {
        Self::with_client(reqwest::Client::new())
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }

    pub fn health_url(base_url: &str) -> String {
        format!("{}{}", base_url.trim_end_matches('/'), HEALTH_PATH)
    }
}

impl Default for HttpProber {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EndpointProber for HttpProber {
    async fn probe(&self, endpoint: &EndpointTarget, timeout: Duration) -> ProbeResult {
        let url = Self::health_url(&endpoint.base_url);
        let start = Instant::now();
        let request = self.client.get(&url).timeout(timeout).send();

        let result = match tokio::time::timeout(timeout, request).await {
            Ok(Ok(resp)) if resp.status().is_success() => {
                ProbeResult::healthy(endpoint, start.elapsed(), format!("HTTP {}", resp.status().as_u16()))
            }
            Ok(Ok(resp)) => ProbeResult::unhealthy(endpoint, start.elapsed(), format!("HTTP {}", resp.status().as_u16())),
            Ok(Err(e)) if e.is_timeout() => {
                ProbeResult::unhealthy(endpoint, start.elapsed(), format!("timeout after {:?}", timeout))
            }
            Ok(Err(e)) => ProbeResult::unhealthy(endpoint, start.elapsed(), format!("request failed: {}", e)),
            Err(_) => ProbeResult::unhealthy(endpoint, start.elapsed(), format!("timeout after {:?}", timeout)),
        };

        tracing::info!(
            "{} endpoint ({}) available: {}",
            endpoint.name,
            endpoint.base_url,
            result.is_healthy()
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn target(base_url: &str) -> EndpointTarget {
        EndpointTarget {
            name: "primary".into(),
            base_url: base_url.to_string(),
            region: "us-east-1".into(),
            networks: Vec::new(),
        }
    }

    #[test]
    fn test_health_url() {
        assert_eq!(HttpProber::health_url("https://app.example.com/"), "https://app.example.com/health");
        assert_eq!(HttpProber::health_url("http://10.0.0.1:8080"), "http://10.0.0.1:8080/health");
    }

    #[tokio::test]
    async fn test_2xx_is_healthy() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(204))
            .expect(1)
            .mount(&server)
            .await;

        let result = HttpProber::new().probe(&target(&server.uri()), Duration::from_secs(2)).await;
        assert_eq!(result.status, ProbeStatus::Healthy);
        assert_eq!(result.detail.as_deref(), Some("HTTP 204"));
    }

    #[tokio::test]
    async fn test_non_2xx_is_unhealthy() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let result = HttpProber::new().probe(&target(&server.uri()), Duration::from_secs(2)).await;
        assert_eq!(result.status, ProbeStatus::Unhealthy);
    }

    #[tokio::test]
    async fn test_slow_endpoint_times_out() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/health"))
            .respond_with(ResponseTemplate::new(200).set_delay(Duration::from_secs(5)))
            .mount(&server)
            .await;

        let result = HttpProber::new().probe(&target(&server.uri()), Duration::from_millis(200)).await;
        assert_eq!(result.status, ProbeStatus::Unhealthy);
        assert!(result.detail.unwrap().contains("timeout"));
    }

    #[tokio::test]
    async fn test_unreachable_is_unhealthy() {
        // port 9 (discard) on localhost is not expected to serve HTTP
        let result = HttpProber::new()
            .probe(&target("http://127.0.0.1:9"), Duration::from_secs(1))
            .await;
        assert_eq!(result.status, ProbeStatus::Unhealthy);
    }
}
