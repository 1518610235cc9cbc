//! Downstream sink forwarding.
//!
//! Every reading the relay accepts is POSTed verbatim to a configured HTTP
//! endpoint. Forwarding is fire-and-forget: a slow or dead sink never blocks
//! the live fan-out, and failures are logged and dropped.

use crate::config::SinkConfig;
use anyhow::{Context, Result};
use std::time::Duration;
use tracing::{debug, error};

/// HTTP forwarder for accepted readings.
///
/// Cheap to clone; each dispatch clones the forwarder into a spawned task so
/// the ingest path returns immediately.
#[derive(Clone)]
pub struct SinkForwarder {
    /// Endpoint that receives one POST per reading
    url: String,
    /// HTTP client with the configured request timeout
    http_client: reqwest::Client,
}

impl SinkForwarder {
    /// Creates a forwarder from sink configuration.
    pub fn new(config: &SinkConfig) -> Result<Self> {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_seconds))
            .build()
            .context("Failed to build sink HTTP client")?;

        Ok(Self {
            url: config.url.clone(),
            http_client,
        })
    }

    /// POSTs one reading payload to the sink endpoint.
    pub async fn forward(&self, payload: &str) -> Result<()> {
        let response = self
            .http_client
            .post(&self.url)
            .header("Content-Type", "application/json")
            .body(payload.to_string())
            .send()
            .await
            .context("Failed to send reading to sink")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<failed to read body>".to_string());
            anyhow::bail!("Sink returned error status {}: {}", status, body);
        }

        debug!(url = %self.url, "Reading forwarded to sink");
        Ok(())
    }

    /// Forwards a payload in a background task so ingest never waits on the
    /// sink. Errors are logged here; there is no retry.
    pub fn dispatch(&self, payload: String) {
        let forwarder = self.clone();
        tokio::spawn(async move {
            if let Err(e) = forwarder.forward(&payload).await {
                error!(error = %e, "Sink forward failed");
            }
        });
    }
}
