//! Control-plane HTTP client
//!
//! REST implementation of [`HealthCheckProvider`] and [`CapacityProvider`].
//! Each method issues a single request; retries belong to the controllers.
//!
//! | Call | Request |
//! |------|---------|
//! | `is_disabled` | `GET /health-checks/{id}` |
//! | `observations` | `GET /health-checks/{id}/observations` |
//! | `set_disabled` | `PATCH /health-checks/{id}` |
//! | `describe_pool` | `GET /clusters/{c}/node-groups/{n}` |
//! | `update_pool` | `POST /clusters/{c}/node-groups/{n}/update-config` |
//! | `set_desired_capacity` | `PUT /auto-scaling-groups/{name}/desired-capacity` |

use async_trait::async_trait;
use reqwest::{Method, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::capacity::{CapacityClass, CapacityProvider, PoolDescription, PoolRef, ScalingBounds};
use crate::healthcheck::{CheckerObservation, HealthCheckProvider};
use crate::ProviderError;

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize, Deserialize)]
struct HealthCheckFlag {
    disabled: bool,
}

#[derive(Debug, Deserialize)]
struct ObservationsResponse {
    observations: Vec<CheckerObservation>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NodeGroupResponse {
    capacity_type: CapacityClass,
    #[serde(default)]
    scaling_config: Option<ScalingBounds>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct UpdateNodeGroupRequest {
    capacity_type: CapacityClass,
    #[serde(skip_serializing_if = "Option::is_none")]
    scaling_config: Option<ScalingBounds>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct DesiredCapacityRequest {
    desired_capacity: u32,
}

/// Map an HTTP status to a provider error
fn status_error(status: StatusCode, body: &str) -> ProviderError {
    let detail = if body.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("HTTP {}: {}", status.as_u16(), body)
    };
    match status {
        StatusCode::NOT_FOUND => ProviderError::NotFound(detail),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => ProviderError::Transient(detail),
        s if s.is_server_error() => ProviderError::Transient(detail),
        _ => ProviderError::Rejected(detail),
    }
}

/// Control-plane API client
#[derive(Clone)]
pub struct HttpControlPlane {
    base_url: Url,
    http: reqwest::Client,
}

impl HttpControlPlane {
    pub fn new(base_url: &str) -> Result<Self, ProviderError> {
        let http = reqwest::Client::builder()
            .timeout(DEFAULT_TIMEOUT)
            .build()
            .map_err(|e| ProviderError::Rejected(format!("failed to build HTTP client: {}", e)))?;
        Self::with_client(base_url, http)
    }

    pub fn with_client(base_url: &str, http: reqwest::Client) -> Result<Self, ProviderError> {
        let base_url =
            Url::parse(base_url).map_err(|e| ProviderError::Rejected(format!("invalid control-plane URL: {}", e)))?;
        if base_url.cannot_be_a_base() {
            return Err(ProviderError::Rejected(format!("invalid control-plane URL: {}", base_url)));
        }
        Ok(Self { base_url, http })
    }

    fn url(&self, segments: &[&str]) -> Result<Url, ProviderError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| ProviderError::Rejected(format!("invalid control-plane URL: {}", self.base_url)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    async fn send<B: Serialize>(&self, method: Method, segments: &[&str], body: Option<&B>) -> Result<String, ProviderError> {
        let url = self.url(segments)?;
        tracing::debug!("{} {}", method, url);

        let mut request = self.http.request(method, url);
        if let Some(body) = body {
            request = request.json(body);
        }

        let response = request.send().await.map_err(|e| ProviderError::Transient(e.to_string()))?;
        let status = response.status();
        let text = response.text().await.map_err(|e| ProviderError::Transient(e.to_string()))?;

        if status.is_success() {
            Ok(text)
        } else {
            Err(status_error(status, &text))
        }
    }

    async fn get<T: DeserializeOwned>(&self, segments: &[&str]) -> Result<T, ProviderError> {
        let text = self.send::<()>(Method::GET, segments, None).await?;
        serde_json::from_str(&text).map_err(|e| ProviderError::Rejected(format!("malformed response: {}", e)))
    }
}

#[async_trait]
impl HealthCheckProvider for HttpControlPlane {
    async fn is_disabled(&self, id: &str) -> Result<bool, ProviderError> {
        let flag: HealthCheckFlag = self.get(&["health-checks", id]).await?;
        Ok(flag.disabled)
    }

    async fn observations(&self, id: &str) -> Result<Vec<CheckerObservation>, ProviderError> {
        let resp: ObservationsResponse = self.get(&["health-checks", id, "observations"]).await?;
        Ok(resp.observations)
    }

    async fn set_disabled(&self, id: &str, disabled: bool) -> Result<(), ProviderError> {
        self.send(Method::PATCH, &["health-checks", id], Some(&HealthCheckFlag { disabled }))
            .await
            .map(|_| ())
    }
}

#[async_trait]
impl CapacityProvider for HttpControlPlane {
    async fn describe_pool(&self, pool: &PoolRef) -> Result<PoolDescription, ProviderError> {
        let resp: NodeGroupResponse = self
            .get(&["clusters", &pool.cluster, "node-groups", &pool.node_group])
            .await?;
        Ok(PoolDescription {
            capacity_class: resp.capacity_type,
            scaling: resp.scaling_config,
        })
    }

    async fn update_pool(
        &self,
        pool: &PoolRef,
        class: CapacityClass,
        scaling: Option<ScalingBounds>,
    ) -> Result<(), ProviderError> {
        let body = UpdateNodeGroupRequest {
            capacity_type: class,
            scaling_config: scaling,
        };
        self.send(
            Method::POST,
            &["clusters", &pool.cluster, "node-groups", &pool.node_group, "update-config"],
            Some(&body),
        )
        .await
        .map(|_| ())
    }

    async fn set_desired_capacity(&self, group: &str, desired: u32) -> Result<(), ProviderError> {
        let body = DesiredCapacityRequest {
            desired_capacity: desired,
        };
        self.send(Method::PUT, &["auto-scaling-groups", group, "desired-capacity"], Some(&body))
            .await
            .map(|_| ())
    }
}
