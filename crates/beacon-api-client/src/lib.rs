use anyhow::Context;
use async_trait::async_trait;
use beacon_types::DeliveryEvent;
use std::time::Duration;

pub use reqwest::Url;

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// Carries delivery events to the tracking service.
/// Implementations are shared between concurrent dispatches and
/// must not require any coordination from the caller.
#[async_trait]
pub trait DeliveryTransport: Send + Sync {
    async fn post_delivery_event(&self, url: &Url, event: &DeliveryEvent) -> anyhow::Result<()>;
}

/// HTTP client for the tracking service.
///
/// A single `reqwest::Client` is shared by all requests made through
/// this instance; it pools connections internally and is safe to use
/// from many tasks at once.
#[derive(Clone, Debug)]
pub struct TrackingApiClient {
    client: reqwest::Client,
    timeout: Duration,
}

impl TrackingApiClient {
    pub fn new() -> anyhow::Result<Self> {
        Self::with_timeout(DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .user_agent(concat!("beacond/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("building http client")?;
        Ok(Self { client, timeout })
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Send `body` as json and return the response body text.
    /// The response is always read to completion so that the
    /// connection can be returned to the pool.
    pub async fn request_with_text_response<T: reqwest::IntoUrl, B: serde::Serialize>(
        &self,
        method: reqwest::Method,
        url: T,
        body: &B,
    ) -> anyhow::Result<String> {
        let response = self
            .client
            .request(method, url)
            .json(body)
            .send()
            .await?;

        let status = response.status();
        let body_bytes = response.bytes().await.with_context(|| {
            format!(
                "request status {}: {}, and failed to read response body",
                status.as_u16(),
                status.canonical_reason().unwrap_or("")
            )
        })?;
        let body_text = String::from_utf8_lossy(&body_bytes);
        if !status.is_success() {
            anyhow::bail!(
                "request status {}: {}. Response body: {body_text}",
                status.as_u16(),
                status.canonical_reason().unwrap_or(""),
            );
        }

        Ok(body_text.to_string())
    }
}

#[async_trait]
impl DeliveryTransport for TrackingApiClient {
    async fn post_delivery_event(&self, url: &Url, event: &DeliveryEvent) -> anyhow::Result<()> {
        let response = self
            .request_with_text_response(reqwest::Method::POST, url.clone(), event)
            .await?;
        tracing::trace!("{url} responded: {response}");
        Ok(())
    }
}
