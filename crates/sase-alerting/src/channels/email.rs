//! Email channel
//!
//! Rendering and recipient handling live here; actual delivery goes through a
//! [`MailTransport`] so SMTP or a provider API can be plugged in.

use super::{ChannelError, ChannelPayload, ChannelSender};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EmailConfig {
    pub from: String,
    pub recipients: Vec<String>,
    pub enabled: bool,
}

impl Default for EmailConfig {
    fn default() -> Self {
        Self {
            from: "alerts@opensase.local".to_string(),
            recipients: Vec::new(),
            enabled: true,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EmailMessage {
    pub from: String,
    pub to: Vec<String>,
    pub subject: String,
    pub body: String,
    /// X-Priority, 1 (highest) to 5
    pub priority: u8,
}

#[async_trait]
pub trait MailTransport: Send + Sync {
    async fn deliver(&self, message: &EmailMessage) -> Result<(), ChannelError>;

    async fn is_reachable(&self) -> bool {
        true
    }
}

/// Transport that only logs; used when no mail relay is configured
#[derive(Debug, Default)]
pub struct LogMailTransport;

#[async_trait]
impl MailTransport for LogMailTransport {
    async fn deliver(&self, message: &EmailMessage) -> Result<(), ChannelError> {
        tracing::info!(
            to = ?message.to,
            subject = %message.subject,
            priority = message.priority,
            "email delivered to log transport"
        );
        Ok(())
    }
}

pub struct EmailChannel {
    config: EmailConfig,
    transport: Arc<dyn MailTransport>,
}

impl EmailChannel {
    pub fn new(config: EmailConfig, transport: Arc<dyn MailTransport>) -> Self {
        Self { config, transport }
    }

    fn message(&self, payload: &ChannelPayload) -> EmailMessage {
        EmailMessage {
            from: self.config.from.clone(),
            to: self.config.recipients.clone(),
            subject: payload.subject.clone(),
            body: payload.body.clone(),
            priority: payload.priority.min(5),
        }
    }
}

#[async_trait]
impl ChannelSender for EmailChannel {
    fn name(&self) -> &str {
        "email"
    }

    async fn send(&self, payload: &ChannelPayload) -> Result<(), ChannelError> {
        if !self.config.enabled {
            return Err(ChannelError::Disabled(self.name().to_string()));
        }
        if self.config.recipients.is_empty() {
            return Err(ChannelError::Rejected("no email recipients configured".to_string()));
        }
        self.transport.deliver(&self.message(payload)).await
    }

    fn is_enabled(&self) -> bool {
        self.config.enabled && !self.config.recipients.is_empty()
    }

    async fn health_check(&self) -> bool {
        self.is_enabled() && self.transport.is_reachable().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::Severity;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct CapturingTransport {
        messages: Mutex<Vec<EmailMessage>>,
    }

    #[async_trait]
    impl MailTransport for CapturingTransport {
        async fn deliver(&self, message: &EmailMessage) -> Result<(), ChannelError> {
            self.messages.lock().push(message.clone());
            Ok(())
        }
    }

    fn payload() -> ChannelPayload {
        ChannelPayload {
            alert_id: "a1".into(),
            subject: "[CRITICAL] Data Exfiltration".into(),
            body: "body".into(),
            severity: Severity::Critical,
            priority: 1,
            metadata: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn test_delivers_to_configured_recipients() {
        let transport = Arc::new(CapturingTransport::default());
        let channel = EmailChannel::new(
            EmailConfig {
                recipients: vec!["soc@example.com".into()],
                ..EmailConfig::default()
            },
            transport.clone(),
        );

        channel.send(&payload()).await.unwrap();
        let messages = transport.messages.lock();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].to, vec!["soc@example.com"]);
        assert_eq!(messages[0].subject, "[CRITICAL] Data Exfiltration");
        assert_eq!(messages[0].priority, 1);
    }

    #[tokio::test]
    async fn test_no_recipients_is_rejected() {
        let channel = EmailChannel::new(EmailConfig::default(), Arc::new(LogMailTransport));
        assert!(!channel.is_enabled());
        assert!(matches!(channel.send(&payload()).await, Err(ChannelError::Rejected(_))));
    }
}
