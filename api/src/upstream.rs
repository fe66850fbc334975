use std::time::Duration;

use async_trait::async_trait;
use axum::http::header::CONTENT_TYPE;
use serde_json::Value;

use crate::config::AppConfig;

const API_KEY_HEADER: &str = "x-api-key";

/// Raw upstream answer: whatever text came back and the status it came with.
/// Nothing about `body` is guaranteed to be JSON.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamReply {
    pub status: u16,
    pub body: String,
}

impl UpstreamReply {
    pub fn is_ok(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Upstream request timed out after {} seconds", .0.as_secs())]
    Timeout(Duration),
    #[error("Upstream request failed: {0}")]
    Request(#[from] reqwest::Error),
}

/// Delivers one payload to the inference service.
///
/// Implementations only report I/O-level failures; any status code and any
/// body text is a successful delivery.
#[async_trait]
pub trait InferenceTransport: Send + Sync {
    async fn send(&self, api_key: &str, payload: &Value) -> Result<UpstreamReply, TransportError>;
}

/// HTTP transport for the hosted inference endpoint.
pub struct LyzrTransport {
    client: reqwest::Client,
    url: String,
    timeout: Duration,
}

impl LyzrTransport {
    pub fn new(config: &AppConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(config.upstream_timeout)
            .build()?;
        Ok(Self {
            client,
            url: config.upstream_url.clone(),
            timeout: config.upstream_timeout,
        })
    }

    fn classify(&self, err: reqwest::Error) -> TransportError {
        if err.is_timeout() {
            TransportError::Timeout(self.timeout)
        } else {
            TransportError::Request(err)
        }
    }
}

#[async_trait]
impl InferenceTransport for LyzrTransport {
    async fn send(&self, api_key: &str, payload: &Value) -> Result<UpstreamReply, TransportError> {
        let response = self
            .client
            .post(&self.url)
            .header(CONTENT_TYPE, "application/json")
            .header(API_KEY_HEADER, api_key)
            .json(payload)
            .send()
            .await
            .map_err(|err| self.classify(err))?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(|err| self.classify(err))?;
        Ok(UpstreamReply { status, body })
    }
}
