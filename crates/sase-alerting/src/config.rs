//! Pipeline configuration
//!
//! Built-in defaults, optionally replaced by a JSON file
//! (`ALERTING_CONFIG_PATH`), then overridden field by field from `ALERT_*`
//! environment variables.

use crate::channels::{EmailConfig, WebhookConfig};
use crate::correlation::CorrelationConfig;
use crate::dedup::DedupConfig;
use crate::model::Severity;
use crate::queue::QueueConfig;
use crate::ratelimit::RateLimitConfig;
use sase_resilience::{CircuitBreakerConfig, RetryConfig};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use std::str::FromStr;

pub const CONFIG_PATH_ENV: &str = "ALERTING_CONFIG_PATH";

/// Channel names routing may refer to
pub const KNOWN_CHANNELS: &[&str] = &["email", "webhook"];

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid value for {key}: '{value}'")]
    InvalidValue { key: String, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Severity → channel names
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RoutingConfig(pub BTreeMap<Severity, Vec<String>>);

impl RoutingConfig {
    pub fn channels_for(&self, severity: Severity) -> &[String] {
        self.0.get(&severity).map_or(&[], Vec::as_slice)
    }

    pub fn set(&mut self, severity: Severity, channels: Vec<String>) {
        self.0.insert(severity, channels);
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        let email = || vec!["email".to_string()];
        let both = || vec!["email".to_string(), "webhook".to_string()];
        Self(BTreeMap::from([
            (Severity::Low, email()),
            (Severity::Medium, email()),
            (Severity::High, both()),
            (Severity::Critical, both()),
        ]))
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelsConfig {
    pub email: Option<EmailConfig>,
    pub webhook: Option<WebhookConfig>,
    /// Per-channel send ceiling per minute
    pub max_per_minute: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertingConfig {
    pub dedup: DedupConfig,
    pub correlation: CorrelationConfig,
    pub circuit_breaker: CircuitBreakerConfig,
    pub retry: RetryConfig,
    pub rate_limit: RateLimitConfig,
    pub queue: QueueConfig,
    pub routing: RoutingConfig,
    pub channels: ChannelsConfig,
    /// LOW alerts are stored but not dispatched unless set
    pub dispatch_low_severity: bool,
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            dedup: DedupConfig::default(),
            correlation: CorrelationConfig::default(),
            circuit_breaker: CircuitBreakerConfig::default(),
            retry: RetryConfig::default(),
            rate_limit: RateLimitConfig::default(),
            queue: QueueConfig::default(),
            routing: RoutingConfig::default(),
            channels: ChannelsConfig::default(),
            dispatch_low_severity: false,
        }
    }
}

fn parse<T: FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn parse_bool(key: &str, value: &str) -> Result<bool, ConfigError> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            value: value.to_string(),
        }),
    }
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

impl AlertingConfig {
    /// Load from a JSON file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })
    }

    /// Defaults, then `ALERTING_CONFIG_PATH` if set, then `ALERT_*` overrides
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// [`AlertingConfig::from_env`] over an arbitrary variable source. The
    /// result is validated; any error is returned rather than defaulted.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = match lookup(CONFIG_PATH_ENV) {
            Some(path) => Self::load(&path)?,
            None => Self::default(),
        };
        config.apply_overrides(lookup)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `ALERT_*` overrides read through `lookup`
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        macro_rules! set {
            ($key:literal, $field:expr) => {
                if let Some(v) = lookup($key) {
                    $field = parse($key, &v)?;
                }
            };
        }

        set!("ALERT_DEDUP_WINDOW_MS", self.dedup.window_ms);
        set!("ALERT_DEDUP_PENDING_INSERT_WAIT_MS", self.dedup.pending_insert_wait_ms);
        set!("ALERT_CB_FAILURE_THRESHOLD", self.circuit_breaker.failure_threshold);
        set!("ALERT_CB_OPEN_STATE_MS", self.circuit_breaker.open_state_duration_ms);
        set!("ALERT_CB_SUCCESS_THRESHOLD", self.circuit_breaker.success_threshold);
        set!("ALERT_RETRY_MAX_ATTEMPTS", self.retry.max_attempts);
        set!("ALERT_RETRY_BACKOFF_MULTIPLIER", self.retry.backoff_multiplier);
        set!("ALERT_RETRY_MAX_BACKOFF_MS", self.retry.max_backoff_ms);
        set!("ALERT_RATE_LIMIT_PER_USER_HOUR", self.rate_limit.max_per_hour_per_user);
        set!("ALERT_RATE_LIMIT_GLOBAL_HOUR", self.rate_limit.max_per_hour_global);
        set!("ALERT_QUEUE_CONCURRENCY", self.queue.concurrency);

        if let Some(v) = lookup("ALERT_DISPATCH_LOW") {
            self.dispatch_low_severity = parse_bool("ALERT_DISPATCH_LOW", &v)?;
        }

        for severity in Severity::ALL {
            let key = format!("ALERT_CHANNELS_{}", severity.as_str());
            if let Some(v) = lookup(&key) {
                self.routing.set(severity, split_list(&v));
            }
        }

        if let Some(url) = lookup("ALERT_WEBHOOK_URL") {
            self.channels.webhook.get_or_insert_with(WebhookConfig::default).url = url;
        }
        if let Some(secret) = lookup("ALERT_WEBHOOK_SECRET") {
            self.channels.webhook.get_or_insert_with(WebhookConfig::default).secret = Some(secret);
        }
        if let Some(recipients) = lookup("ALERT_EMAIL_RECIPIENTS") {
            self.channels.email.get_or_insert_with(EmailConfig::default).recipients = split_list(&recipients);
        }

        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));

        if self.dedup.window_ms == 0 {
            return invalid("dedup.window_ms must be > 0");
        }
        if self.circuit_breaker.failure_threshold == 0 || self.circuit_breaker.success_threshold == 0 {
            return invalid("circuit breaker thresholds must be > 0");
        }
        if !(0.0..=100.0).contains(&self.circuit_breaker.failure_rate_threshold) {
            return invalid("circuit_breaker.failure_rate_threshold must be within 0-100");
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be >= 1");
        }
        if self.retry.backoff_multiplier < 1.0 {
            return invalid("retry.backoff_multiplier must be >= 1.0");
        }
        if !(0.0..=1.0).contains(&self.retry.jitter_factor) {
            return invalid("retry.jitter_factor must be within 0-1");
        }
        if self.queue.concurrency == 0 {
            return invalid("queue.concurrency must be > 0");
        }
        if self.queue.max_attempts == 0 {
            return invalid("queue.max_attempts must be >= 1");
        }
        if self.correlation.max_child_alerts == 0 {
            return invalid("correlation.max_child_alerts must be > 0");
        }
        for (severity, channels) in &self.routing.0 {
            if let Some(unknown) = channels.iter().find(|c| !KNOWN_CHANNELS.contains(&c.as_str())) {
                return Err(ConfigError::Invalid(format!(
                    "routing for {severity} names unknown channel '{unknown}'"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        move |key: &str| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = AlertingConfig::default();
        config.validate().unwrap();
        assert_eq!(config.dedup.window_ms, 300_000);
        assert_eq!(config.routing.channels_for(Severity::Critical), ["email", "webhook"]);
        assert!(!config.dispatch_low_severity);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = AlertingConfig::default();
        config
            .apply_overrides(lookup(&[
                ("ALERT_DEDUP_WINDOW_MS", "60000"),
                ("ALERT_CB_FAILURE_THRESHOLD", "3"),
                ("ALERT_RETRY_BACKOFF_MULTIPLIER", "1.5"),
                ("ALERT_DISPATCH_LOW", "true"),
                ("ALERT_CHANNELS_LOW", "email, webhook"),
                ("ALERT_WEBHOOK_URL", "https://hooks.example.com"),
                ("ALERT_EMAIL_RECIPIENTS", "a@example.com,b@example.com"),
            ]))
            .unwrap();

        assert_eq!(config.dedup.window_ms, 60_000);
        assert_eq!(config.circuit_breaker.failure_threshold, 3);
        assert_eq!(config.retry.backoff_multiplier, 1.5);
        assert!(config.dispatch_low_severity);
        assert_eq!(config.routing.channels_for(Severity::Low), ["email", "webhook"]);
        assert_eq!(config.channels.webhook.as_ref().map(|w| w.url.as_str()), Some("https://hooks.example.com"));
        assert_eq!(config.channels.email.as_ref().map(|e| e.recipients.len()), Some(2));
    }

    #[test]
    fn test_bad_override_is_reported() {
        let mut config = AlertingConfig::default();
        let err = config
            .apply_overrides(lookup(&[("ALERT_QUEUE_CONCURRENCY", "lots")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "ALERT_QUEUE_CONCURRENCY"));
    }

    #[test]
    fn test_from_lookup_surfaces_errors() {
        let config = AlertingConfig::from_lookup(lookup(&[("ALERT_DEDUP_PENDING_INSERT_WAIT_MS", "500")])).unwrap();
        assert_eq!(config.dedup.pending_insert_wait_ms, 500);

        let err = AlertingConfig::from_lookup(lookup(&[("ALERT_QUEUE_CONCURRENCY", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = AlertingConfig::from_lookup(lookup(&[(CONFIG_PATH_ENV, "/nonexistent/alerting.json")])).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_validate_rejects_zero_window() {
        let mut config = AlertingConfig::default();
        config.dedup.window_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_unknown_routed_channel() {
        let mut config = AlertingConfig::default();
        config.routing.set(Severity::High, vec!["email".into(), "pager".into()]);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("pager"));
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let config: AlertingConfig = serde_json::from_str(
            r#"{ "dispatch_low_severity": true, "routing": { "CRITICAL": ["webhook"] } }"#,
        )
        .unwrap();
        assert!(config.dispatch_low_severity);
        assert_eq!(config.routing.channels_for(Severity::Critical), ["webhook"]);
        assert_eq!(config.queue.concurrency, 5);
    }
}
