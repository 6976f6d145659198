//! HTTP client for the ingestion and decide endpoints
//!
//! Batches are posted as a form body `data=<base64 JSON array>`. The server
//! answers `1` (accepted) or `0` (rejected) for the whole batch.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use base64::{engine::general_purpose, Engine as _};
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, CONTENT_TYPE, RETRY_AFTER};

use crate::config::{ApiConfig, LIB_VERSION};
use crate::error::{Error, Result};
use crate::types::MessageKind;

/// Result of one batch transmission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransmitOutcome {
    /// The server took the batch
    Accepted,
    /// The batch can never succeed; drop it
    PermanentRejection(String),
    /// Try again later
    TransientFailure {
        reason: String,
        retry_after: Option<Duration>,
    },
}

impl TransmitOutcome {
    /// Whether the records should leave the queue.
    pub fn removes_records(&self) -> bool {
        !matches!(self, TransmitOutcome::TransientFailure { .. })
    }
}

/// Classify an HTTP response to a batch post.
pub fn classify_response(
    status: u16,
    body: &str,
    retry_after: Option<Duration>,
) -> TransmitOutcome {
    match status {
        200..=299 => match body.trim() {
            "1" => TransmitOutcome::Accepted,
            "0" => TransmitOutcome::PermanentRejection("server rejected batch".to_string()),
            other => TransmitOutcome::PermanentRejection(format!(
                "malformed response body: {:?}",
                truncate(other, 64)
            )),
        },
        408 | 429 => TransmitOutcome::TransientFailure {
            reason: format!("HTTP {}", status),
            retry_after,
        },
        400..=499 => TransmitOutcome::PermanentRejection(format!(
            "HTTP {}: {}",
            status,
            truncate(body.trim(), 128)
        )),
        _ => TransmitOutcome::TransientFailure {
            reason: format!("HTTP {}", status),
            retry_after,
        },
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

/// Base64 the JSON array and wrap it in a form body.
pub fn encode_form_body(data: &str) -> String {
    let encoded = general_purpose::STANDARD.encode(data.as_bytes());
    format!("data={}", urlencoding::encode(&encoded))
}

/// Network seam used by the dispatcher worker.
pub trait Transport: Send + Sync + 'static {
    /// Post one JSON array of wire messages to the endpoint for `kind`.
    fn send_batch(
        &self,
        kind: MessageKind,
        data: &str,
    ) -> impl Future<Output = TransmitOutcome> + Send;

    /// Fetch the decide document for a distinct id.
    fn fetch_decide(
        &self,
        token: &str,
        distinct_id: &str,
    ) -> impl Future<Output = Result<serde_json::Value>> + Send;
}

impl<T: Transport> Transport for Arc<T> {
    fn send_batch(
        &self,
        kind: MessageKind,
        data: &str,
    ) -> impl Future<Output = TransmitOutcome> + Send {
        (**self).send_batch(kind, data)
    }

    fn fetch_decide(
        &self,
        token: &str,
        distinct_id: &str,
    ) -> impl Future<Output = Result<serde_json::Value>> + Send {
        (**self).fetch_decide(token, distinct_id)
    }
}

/// reqwest-backed transport
pub struct HttpTransport {
    http_client: reqwest::Client,
    base_url: String,
}

impl HttpTransport {
    /// Create a new transport from configuration
    pub fn new(api: &ApiConfig) -> Result<Self> {
        api.validate()?;

        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/json, text/plain"));

        let http_client = reqwest::Client::builder()
            .timeout(api.timeout())
            .user_agent(format!("mmp-rust/{}", LIB_VERSION))
            .default_headers(headers)
            .build()
            .map_err(|e| Error::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            http_client,
            base_url: api.endpoint_base().to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

impl Transport for HttpTransport {
    async fn send_batch(&self, kind: MessageKind, data: &str) -> TransmitOutcome {
        let url = format!("{}{}", self.base_url, kind.path());

        let response = match self
            .http_client
            .post(&url)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(encode_form_body(data))
            .send()
            .await
        {
            Ok(response) => response,
            Err(e) => {
                return TransmitOutcome::TransientFailure {
                    reason: format!("HTTP request failed: {}", e),
                    retry_after: None,
                }
            }
        };

        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs);

        match response.text().await {
            Ok(body) => classify_response(status, &body, retry_after),
            Err(e) => TransmitOutcome::TransientFailure {
                reason: format!("failed to read response: {}", e),
                retry_after,
            },
        }
    }

    async fn fetch_decide(&self, token: &str, distinct_id: &str) -> Result<serde_json::Value> {
        let url = format!(
            "{}/decide?version=1&lib=rust&token={}&distinct_id={}",
            self.base_url,
            urlencoding::encode(token),
            urlencoding::encode(distinct_id)
        );

        let response = self
            .http_client
            .get(&url)
            .send()
            .await
            .map_err(|e| Error::Transport(format!("HTTP request failed: {}", e)))?;

        let status = response.status();

        if status.is_success() {
            response
                .json()
                .await
                .map_err(|e| Error::Transport(format!("failed to parse decide response: {}", e)))
        } else {
            let error_text = response
                .text()
                .await
                .unwrap_or_else(|_| "unknown".to_string());
            Err(Error::Transport(format!(
                "decide error ({}): {}",
                status, error_text
            )))
        }
    }
}
