//! HTTP transport
//!
//! POSTs a JSON [`WireEnvelope`] to the worker's URL and decodes a JSON
//! [`WireResponse`]. Non-2xx statuses and connection failures are transport
//! errors (retryable); a well-formed reply with `success: false` is a worker
//! error (not retryable).

use async_trait::async_trait;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::Request;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use std::time::Duration;
use tokio::time::Instant;

use super::Transport;
use crate::protocol::{BrokerError, Envelope, Payload, Result, WireEnvelope, WireResponse};

/// Upper bound on a single HTTP exchange, independent of envelope deadlines.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Transport that delivers envelopes to a worker over HTTP.
pub struct HttpTransport {
    url: String,
    client: Client<HttpConnector, Full<Bytes>>,
    request_timeout: Duration,
}

impl HttpTransport {
    /// Creates a transport for the worker listening at `url`.
    ///
    /// # Errors
    ///
    /// Returns `BrokerError::Validation` unless `url` starts with `http://`.
    pub fn new(url: impl Into<String>) -> Result<Self> {
        let url = url.into();
        if !url.starts_with("http://") {
            return Err(BrokerError::Validation(format!(
                "worker url '{}' must start with http://",
                url
            )));
        }

        Ok(Self {
            url,
            client: Client::builder(TokioExecutor::new()).build_http(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
        })
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send(&self, envelope: Envelope) -> Result<Payload> {
        let wire = WireEnvelope::from_envelope(&envelope, Instant::now());
        let body = serde_json::to_vec(&wire)?;

        let request = Request::builder()
            .method("POST")
            .uri(&self.url)
            .header("Content-Type", "application/json")
            .body(Full::new(Bytes::from(body)))
            .map_err(|e| BrokerError::Transport(format!("Failed to build request: {}", e)))?;

        let response = tokio::time::timeout(self.request_timeout, self.client.request(request))
            .await
            .map_err(|_| BrokerError::Timeout(self.request_timeout.as_millis() as u64))?
            .map_err(|e| BrokerError::Transport(format!("HTTP request failed: {}", e)))?;

        let status = response.status();
        let body = response
            .into_body()
            .collect()
            .await
            .map_err(|e| BrokerError::Transport(format!("Failed to read response: {}", e)))?
            .to_bytes();

        if !status.is_success() {
            return Err(BrokerError::Transport(format!(
                "worker at {} returned HTTP {}",
                self.url, status
            )));
        }

        let reply: WireResponse = serde_json::from_slice(&body)?;
        if !reply.success {
            return Err(BrokerError::WorkerError(
                reply.error.unwrap_or_else(|| "Unknown error".to_string()),
            ));
        }

        Ok(reply.payload)
    }

    fn endpoint(&self) -> String {
        self.url.clone()
    }
}
