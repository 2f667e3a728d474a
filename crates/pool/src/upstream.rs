//! Pooled HTTP connections to the upstream chat-completions API.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use gateway_core::{Error, Result};
use reqwest::Client;
use url::Url;

use crate::pool::Resource;

/// Shared construction parameters for every [`UpstreamConnection`].
#[derive(Debug, Clone)]
pub struct UpstreamConfig {
    /// Base URL of the upstream API, e.g. `https://api.openai.com`.
    pub base_url: Url,
    /// Per-request timeout applied to the underlying `reqwest::Client`.
    pub request_timeout: std::time::Duration,
}

/// One pooled HTTP client bound to the upstream base URL.
///
/// `reqwest::Client` already keeps its own internal keep-alive
/// connection pool; what this type adds is the gateway's own
/// acquire/health-check/eviction lifecycle on top, matching the
/// `POOL_*` configuration surface the spec exposes.
pub struct UpstreamConnection {
    client: Client,
    base_url: Url,
    request_count: AtomicU64,
}

impl UpstreamConnection {
    /// The underlying HTTP client.
    #[must_use]
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// The upstream base URL this connection targets.
    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// Requests served through this connection since creation.
    #[must_use]
    pub fn request_count(&self) -> u64 {
        self.request_count.load(Ordering::Relaxed)
    }

    /// Record a completed request. Called by the dispatcher after each
    /// forward, independent of the pool's own bookkeeping.
    pub fn record_request(&self) {
        self.request_count.fetch_add(1, Ordering::Relaxed);
    }
}

#[async_trait]
impl Resource for UpstreamConnection {
    type Config = UpstreamConfig;

    async fn create(config: &Self::Config) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| Error::internal(format!("build upstream http client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.base_url.clone(),
            request_count: AtomicU64::new(0),
        })
    }

    async fn health_check(&self) -> bool {
        match self.client.head(self.base_url.clone()).send().await {
            Ok(resp) => resp.status().as_u16() < 500,
            Err(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn create_builds_client_bound_to_base_url() {
        let config = UpstreamConfig {
            base_url: Url::parse("https://api.example.com").unwrap(),
            request_timeout: std::time::Duration::from_secs(5),
        };
        let conn = UpstreamConnection::create(&config).await.unwrap();
        assert_eq!(conn.base_url().as_str(), "https://api.example.com/");
        assert_eq!(conn.request_count(), 0);
    }

    #[tokio::test]
    async fn record_request_increments_counter() {
        let config = UpstreamConfig {
            base_url: Url::parse("https://api.example.com").unwrap(),
            request_timeout: std::time::Duration::from_secs(5),
        };
        let conn = UpstreamConnection::create(&config).await.unwrap();
        conn.record_request();
        conn.record_request();
        assert_eq!(conn.request_count(), 2);
    }

    #[tokio::test]
    async fn health_check_true_on_non_5xx_head_response() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("HEAD"))
            .respond_with(wiremock::ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let config = UpstreamConfig {
            base_url: Url::parse(&server.uri()).unwrap(),
            request_timeout: std::time::Duration::from_secs(5),
        };
        let conn = UpstreamConnection::create(&config).await.unwrap();
        assert!(conn.health_check().await);
    }

    #[tokio::test]
    async fn health_check_false_on_5xx_head_response() {
        let server = wiremock::MockServer::start().await;
        wiremock::Mock::given(wiremock::matchers::method("HEAD"))
            .respond_with(wiremock::ResponseTemplate::new(503))
            .mount(&server)
            .await;

        let config = UpstreamConfig {
            base_url: Url::parse(&server.uri()).unwrap(),
            request_timeout: std::time::Duration::from_secs(5),
        };
        let conn = UpstreamConnection::create(&config).await.unwrap();
        assert!(!conn.health_check().await);
    }

    #[tokio::test]
    async fn health_check_false_when_unreachable() {
        let config = UpstreamConfig {
            base_url: Url::parse("http://127.0.0.1:1").unwrap(),
            request_timeout: std::time::Duration::from_millis(200),
        };
        let conn = UpstreamConnection::create(&config).await.unwrap();
        assert!(!conn.health_check().await);
    }
}
