//! Signed JSON webhook channel

use super::{ChannelError, ChannelPayload, ChannelSender};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const SIGNATURE_HEADER: &str = "X-OpenSASE-Signature";
pub const EVENT_HEADER: &str = "X-OpenSASE-Event";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub url: String,
    /// Shared secret for request signing; unsigned when absent
    pub secret: Option<String>,
    pub timeout_ms: u64,
    pub enabled: bool,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            secret: None,
            timeout_ms: 30_000,
            enabled: true,
        }
    }
}

pub struct WebhookChannel {
    config: WebhookConfig,
    client: reqwest::Client,
}

impl WebhookChannel {
    pub fn new(config: WebhookConfig) -> Self {
        Self {
            config,
            client: reqwest::Client::new(),
        }
    }

    pub fn config(&self) -> &WebhookConfig {
        &self.config
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.config.timeout_ms)
    }
}

/// `sha256=<hex>` over secret followed by body
pub fn sign(payload: &str, secret: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut mac = Sha256::new();
    mac.update(secret.as_bytes());
    mac.update(payload.as_bytes());
    format!("sha256={}", hex::encode(mac.finalize()))
}

fn classify(err: reqwest::Error, timeout: Duration) -> ChannelError {
    if err.is_timeout() {
        ChannelError::Timeout(timeout)
    } else if let Some(status) = err.status() {
        ChannelError::Http { status: status.as_u16() }
    } else {
        ChannelError::Transport(err.to_string())
    }
}

#[async_trait]
impl ChannelSender for WebhookChannel {
    fn name(&self) -> &str {
        "webhook"
    }

    async fn send(&self, payload: &ChannelPayload) -> Result<(), ChannelError> {
        if !self.is_enabled() {
            return Err(ChannelError::Disabled(self.name().to_string()));
        }
        let body = serde_json::to_string(payload).map_err(|e| ChannelError::Rejected(e.to_string()))?;

        let mut request = self
            .client
            .post(&self.config.url)
            .header("Content-Type", "application/json")
            .header(EVENT_HEADER, "alert.dispatch")
            .timeout(self.timeout());
        if let Some(secret) = &self.config.secret {
            request = request.header(SIGNATURE_HEADER, sign(&body, secret));
        }

        let resp = request
            .body(body)
            .send()
            .await
            .map_err(|e| classify(e, self.timeout()))?;

        if resp.status().is_success() {
            tracing::debug!(alert_id = %payload.alert_id, status = resp.status().as_u16(), "webhook delivered");
            Ok(())
        } else {
            Err(ChannelError::Http {
                status: resp.status().as_u16(),
            })
        }
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled && !self.config.url.is_empty()
    }

    async fn health_check(&self) -> bool {
        if !self.is_enabled() {
            return false;
        }
        match self
            .client
            .head(&self.config.url)
            .timeout(Duration::from_secs(5))
            .send()
            .await
        {
            Ok(resp) => !resp.status().is_server_error(),
            Err(e) => {
                tracing::debug!(error = %e, "webhook health check failed");
                false
            }
        }
    }
}
