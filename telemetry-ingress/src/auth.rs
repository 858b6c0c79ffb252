use std::time::Duration;

use async_trait::async_trait;
use moka::sync::Cache;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::warn;
use url::Url;

use crate::config::DeviceAuthConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthDecision {
    Allow,
    Deny,
    /// The identity service could not give an answer in time.
    Unavailable,
}

#[async_trait]
pub trait DeviceAuthenticator: Send + Sync {
    async fn authenticate(&self, device_id: &str, credentials: Option<&str>) -> AuthDecision;
}

pub struct AllowAll {}

#[async_trait]
impl DeviceAuthenticator for AllowAll {
    async fn authenticate(&self, _device_id: &str, _credentials: Option<&str>) -> AuthDecision {
        AuthDecision::Allow
    }
}

#[derive(Serialize)]
struct AuthenticateRequest<'a> {
    device_id: &'a str,
    credentials: Option<&'a str>,
}

#[derive(Deserialize)]
struct AuthenticateResponse {
    allowed: bool,
}

/// Asks the device identity service, caching allow decisions for a short period.
/// Denials are never cached so that a newly provisioned device is let in right away.
pub struct HttpDeviceAuthenticator {
    client: reqwest::Client,
    endpoint: Url,
    allowed: Cache<(String, String), ()>,
}

impl HttpDeviceAuthenticator {
    pub fn new(base_url: &str, timeout: Duration, cache_ttl: Duration) -> anyhow::Result<Self> {
        let endpoint = Url::parse(base_url)?.join("authenticate")?;
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        let allowed = Cache::builder()
            .time_to_live(cache_ttl)
            .max_capacity(100_000)
            .build();

        Ok(Self {
            client,
            endpoint,
            allowed,
        })
    }

    pub fn from_config(config: &DeviceAuthConfig) -> anyhow::Result<Self> {
        Self::new(
            &config.device_auth_url,
            config.device_auth_timeout_ms.0,
            Duration::from_secs(config.device_auth_cache_ttl_secs),
        )
    }
}

#[async_trait]
impl DeviceAuthenticator for HttpDeviceAuthenticator {
    async fn authenticate(&self, device_id: &str, credentials: Option<&str>) -> AuthDecision {
        let cache_key = (device_id.to_owned(), credentials.unwrap_or_default().to_owned());
        if self.allowed.contains_key(&cache_key) {
            return AuthDecision::Allow;
        }

        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&AuthenticateRequest {
                device_id,
                credentials,
            })
            .send()
            .await;

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                warn!("device identity service request failed: {}", e);
                return AuthDecision::Unavailable;
            }
        };

        match response.status() {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN | StatusCode::NOT_FOUND => {
                return AuthDecision::Deny
            }
            status if !status.is_success() => {
                warn!("device identity service answered {}", status);
                return AuthDecision::Unavailable;
            }
            _ => {}
        }

        match response.json::<AuthenticateResponse>().await {
            Ok(AuthenticateResponse { allowed: true }) => {
                self.allowed.insert(cache_key, ());
                AuthDecision::Allow
            }
            Ok(AuthenticateResponse { allowed: false }) => AuthDecision::Deny,
            Err(e) => {
                warn!("invalid response from device identity service: {}", e);
                AuthDecision::Unavailable
            }
        }
    }
}
