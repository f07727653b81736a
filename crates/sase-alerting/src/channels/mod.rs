//! Notification channels
//!
//! Every outbound channel implements [`ChannelSender`]. The dispatcher looks
//! channels up by name in a [`ChannelRegistry`] and wraps each send in a
//! circuit breaker and retry executor.

pub mod email;
pub mod webhook;

pub use email::{EmailChannel, EmailConfig, EmailMessage, LogMailTransport, MailTransport};
pub use webhook::{WebhookChannel, WebhookConfig};

use crate::model::{Alert, Severity};
use async_trait::async_trait;
use dashmap::DashMap;
use sase_resilience::{BreakerError, BreakerOpenError, CircuitBreakerRegistry, CircuitState, Retryable};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("channel responded with HTTP {status}")]
    Http { status: u16 },

    #[error("send timed out after {0:?}")]
    Timeout(Duration),

    #[error("payload rejected: {0}")]
    Rejected(String),

    #[error("channel '{0}' is disabled")]
    Disabled(String),

    #[error("channel '{0}' is not registered")]
    NotRegistered(String),

    #[error("channel '{0}' send rate exceeded")]
    RateLimited(String),

    #[error(transparent)]
    CircuitOpen(#[from] BreakerOpenError),
}

impl ChannelError {
    pub fn is_circuit_open(&self) -> bool {
        matches!(self, ChannelError::CircuitOpen(_))
    }
}

impl Retryable for ChannelError {
    fn is_retryable(&self) -> bool {
        match self {
            ChannelError::Transport(_) | ChannelError::Timeout(_) => true,
            ChannelError::Http { status } => *status >= 500 || *status == 429,
            _ => false,
        }
    }

    fn timed_out(after: Duration) -> Self {
        ChannelError::Timeout(after)
    }
}

impl From<BreakerError<ChannelError>> for ChannelError {
    fn from(err: BreakerError<ChannelError>) -> Self {
        match err {
            BreakerError::Open(open) => ChannelError::CircuitOpen(open),
            BreakerError::Inner(inner) => inner,
        }
    }
}

// =============================================================================
// Payload
// =============================================================================

/// Channel-neutral rendering of an alert
#[derive(Debug, Clone, Serialize)]
pub struct ChannelPayload {
    pub alert_id: String,
    pub subject: String,
    pub body: String,
    pub severity: Severity,
    pub priority: u8,
    pub metadata: serde_json::Value,
}

impl ChannelPayload {
    pub fn for_alert(alert: &Alert) -> Self {
        Self {
            alert_id: alert.id.clone(),
            subject: render_subject(alert),
            body: render_body(alert),
            severity: alert.severity,
            priority: alert.severity.priority(),
            metadata: serde_json::json!({
                "fingerprint": alert.fingerprint,
                "alert_type": alert.alert_type,
                "status": alert.status,
                "rule_id": alert.rule_id,
                "user_id": alert.user_id,
                "ip_address": alert.ip_address,
                "occurrence_count": alert.occurrence_count,
                "score": alert.score,
                "correlation_id": alert.correlation_id,
                "tags": alert.tags,
                "first_seen": alert.first_seen,
                "last_seen": alert.last_seen,
            }),
        }
    }
}

/// `[SEVERITY] rule name`, falling back to the alert title
pub fn render_subject(alert: &Alert) -> String {
    let name = alert.rule_name.as_deref().unwrap_or(&alert.title);
    format!("[{}] {}", alert.severity, name)
}

pub fn render_body(alert: &Alert) -> String {
    let mut lines = vec![
        alert.description.clone(),
        String::new(),
        format!("Alert ID:    {}", alert.id),
        format!("Type:        {}", alert.alert_type),
        format!("Severity:    {}", alert.severity),
        format!("Score:       {:.1}", alert.score),
        format!("Occurrences: {}", alert.occurrence_count),
        format!("First seen:  {}", alert.first_seen.to_rfc3339()),
        format!("Last seen:   {}", alert.last_seen.to_rfc3339()),
    ];
    if let Some(user) = &alert.user_id {
        lines.push(format!("User:        {user}"));
    }
    if let Some(ip) = &alert.ip_address {
        lines.push(format!("Source IP:   {ip}"));
    }
    if let Some(correlation) = &alert.correlation_id {
        lines.push(format!("Correlation: {correlation}"));
    }
    if !alert.tags.is_empty() {
        lines.push(format!("Tags:        {}", alert.tags.join(", ")));
    }
    lines.join("\n")
}

// =============================================================================
// Sender & Registry
// =============================================================================

#[async_trait]
pub trait ChannelSender: Send + Sync {
    fn name(&self) -> &str;

    /// One delivery attempt
    async fn send(&self, payload: &ChannelPayload) -> Result<(), ChannelError>;

    fn is_enabled(&self) -> bool {
        true
    }

    async fn health_check(&self) -> bool {
        true
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChannelHealth {
    pub name: String,
    pub enabled: bool,
    pub healthy: bool,
    pub circuit_state: CircuitState,
}

#[derive(Default)]
pub struct ChannelRegistry {
    channels: DashMap<String, Arc<dyn ChannelSender>>,
}

impl ChannelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, channel: Arc<dyn ChannelSender>) {
        tracing::info!(channel = channel.name(), enabled = channel.is_enabled(), "channel registered");
        self.channels.insert(channel.name().to_string(), channel);
    }

    pub fn unregister(&self, name: &str) -> Option<Arc<dyn ChannelSender>> {
        self.channels.remove(name).map(|(_, c)| c)
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn ChannelSender>> {
        self.channels.get(name).map(|c| Arc::clone(c.value()))
    }

    /// Registered and enabled
    pub fn is_available(&self, name: &str) -> bool {
        self.channels.get(name).map_or(false, |c| c.is_enabled())
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.iter().map(|c| c.key().clone()).collect();
        names.sort();
        names
    }

    pub fn enabled_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .channels
            .iter()
            .filter(|c| c.is_enabled())
            .map(|c| c.key().clone())
            .collect();
        names.sort();
        names
    }

    /// Health of every channel together with its breaker state
    pub async fn health_report(&self, breakers: &CircuitBreakerRegistry) -> Vec<ChannelHealth> {
        let channels: Vec<Arc<dyn ChannelSender>> =
            self.channels.iter().map(|c| Arc::clone(c.value())).collect();

        let mut report = Vec::with_capacity(channels.len());
        for channel in channels {
            let circuit_state = breakers
                .get(channel.name())
                .map_or(CircuitState::Closed, |b| b.state());
            report.push(ChannelHealth {
                name: channel.name().to_string(),
                enabled: channel.is_enabled(),
                healthy: channel.health_check().await,
                circuit_state,
            });
        }
        report.sort_by(|a, b| a.name.cmp(&b.name));
        report
    }
}


#[cfg(test)]
mod tests {
    use super::testing::MockChannel;
    use super::*;
    use crate::model::{RuleEvaluationResult, SecurityEvent};
    use sase_common::SystemClock;
    use sase_resilience::CircuitBreakerConfig;

    fn alert() -> Alert {
        let event = SecurityEvent::new("login_failed").with_user("alice").with_ip("10.1.1.1");
        let result = RuleEvaluationResult {
            matched: true,
            rule_id: "brute-force".into(),
            rule_name: "Brute Force Attack".into(),
            score: 60.0,
            reason: "7 failed logins".into(),
            severity: Some(Severity::High),
            evidence: serde_json::Value::Null,
            suggested_actions: vec![],
            tags: vec!["authentication".into()],
        };
        Alert::from_match(&event, &result, "fp".into(), chrono::Utc::now())
    }

    #[test]
    fn test_render_subject_and_body() {
        let alert = alert();
        assert_eq!(render_subject(&alert), "[HIGH] Brute Force Attack");

        let body = render_body(&alert);
        assert!(body.starts_with("7 failed logins"));
        assert!(body.contains("User:        alice"));
        assert!(body.contains("Source IP:   10.1.1.1"));
    }

    #[test]
    fn test_retry_classification() {
        assert!(ChannelError::Transport("reset".into()).is_retryable());
        assert!(ChannelError::Http { status: 503 }.is_retryable());
        assert!(ChannelError::Http { status: 429 }.is_retryable());
        assert!(!ChannelError::Http { status: 400 }.is_retryable());
        assert!(!ChannelError::Rejected("bad".into()).is_retryable());
    }

    #[tokio::test]
    async fn test_registry_enabled_and_health() {
        let registry = ChannelRegistry::new();
        registry.register(MockChannel::ok("email"));
        registry.register(MockChannel::disabled("sms"));

        assert_eq!(registry.names(), vec!["email", "sms"]);
        assert_eq!(registry.enabled_names(), vec!["email"]);
        assert!(registry.is_available("email"));
        assert!(!registry.is_available("sms"));
        assert!(!registry.is_available("pager"));

        let breakers = CircuitBreakerRegistry::new(CircuitBreakerConfig::default(), SystemClock::shared());
        breakers.get_or_create("email").force_open();
        let report = registry.health_report(&breakers).await;
        assert_eq!(report.len(), 2);
        assert_eq!(report[0].circuit_state, CircuitState::Open);
        assert_eq!(report[1].circuit_state, CircuitState::Closed);
    }
}
