//! Alert Correlation
//!
//! Relate a new alert to recent alerts that share a correlation key (actor,
//! source address, type, session), score the relationship and decide whether
//! the alert should be escalated.

use crate::model::{Alert, AlertStatus, CorrelationResult, Severity};
use crate::repository::{AlertRepository, RepoResult};
use chrono::Duration;
use sase_common::{AtomicCounter, SharedClock};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CorrelationKey {
    UserId,
    IpAddress,
    AlertType,
    SessionId,
}

impl CorrelationKey {
    fn weight(self) -> f64 {
        match self {
            CorrelationKey::UserId => 30.0,
            CorrelationKey::IpAddress => 25.0,
            CorrelationKey::SessionId => 20.0,
            CorrelationKey::AlertType => 15.0,
        }
    }

    fn shared(self, a: &Alert, b: &Alert) -> bool {
        fn both(x: &Option<String>, y: &Option<String>) -> bool {
            matches!((x, y), (Some(x), Some(y)) if x == y)
        }
        match self {
            CorrelationKey::UserId => both(&a.user_id, &b.user_id),
            CorrelationKey::IpAddress => both(&a.ip_address, &b.ip_address),
            CorrelationKey::SessionId => both(&a.session_id, &b.session_id),
            CorrelationKey::AlertType => a.alert_type == b.alert_type,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationConfig {
    pub enabled: bool,
    pub window_ms: u64,
    pub keys: Vec<CorrelationKey>,
    /// Score at or above which an alert is escalated
    pub escalation_threshold: f64,
    /// Distinct HIGH+ alerts from one actor that trigger escalation
    pub high_severity_pattern_count: usize,
    /// Distinct source addresses for one user that flag a pattern
    pub multi_source_count: usize,
    pub max_child_alerts: usize,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_ms: 3_600_000,
            keys: vec![CorrelationKey::UserId, CorrelationKey::IpAddress, CorrelationKey::AlertType],
            escalation_threshold: 70.0,
            high_severity_pattern_count: 3,
            multi_source_count: 3,
            max_child_alerts: 10,
        }
    }
}

fn severity_factor(severity: Severity) -> f64 {
    match severity {
        Severity::Low => 0.5,
        Severity::Medium => 0.75,
        Severity::High => 1.0,
        Severity::Critical => 1.25,
    }
}

#[derive(Default)]
struct CorrelatorStats {
    correlated: AtomicCounter,
    uncorrelated: AtomicCounter,
    escalations: AtomicCounter,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct CorrelationStats {
    pub correlated: u64,
    pub uncorrelated: u64,
    pub escalations: u64,
}

pub struct CorrelationEngine {
    config: CorrelationConfig,
    repository: Arc<dyn AlertRepository>,
    clock: SharedClock,
    stats: CorrelatorStats,
}

impl CorrelationEngine {
    pub fn new(config: CorrelationConfig, repository: Arc<dyn AlertRepository>, clock: SharedClock) -> Self {
        Self {
            config,
            repository,
            clock,
            stats: CorrelatorStats::default(),
        }
    }

    pub fn config(&self) -> &CorrelationConfig {
        &self.config
    }

    pub async fn correlate(&self, alert: &Alert) -> RepoResult<CorrelationResult> {
        if !self.config.enabled {
            return Ok(self.uncorrelated(alert));
        }

        let since = self.clock.now() - Duration::milliseconds(self.config.window_ms as i64);
        let candidates = self.repository.recent(since).await?;

        // (alert, matched-key weight)
        let mut related: Vec<(Alert, f64)> = candidates
            .into_iter()
            .filter(|c| c.id != alert.id && c.status != AlertStatus::Resolved)
            .filter_map(|c| {
                let weight: f64 = self
                    .config
                    .keys
                    .iter()
                    .filter(|k| k.shared(alert, &c))
                    .map(|k| k.weight())
                    .sum();
                (weight > 0.0).then_some((c, weight))
            })
            .collect();

        if related.is_empty() {
            self.stats.uncorrelated.inc();
            return Ok(self.uncorrelated(alert));
        }
        // Most recent first
        related.sort_by(|a, b| b.0.last_seen.cmp(&a.0.last_seen));

        let mut score: f64 = related
            .iter()
            .map(|(c, weight)| weight * severity_factor(c.severity))
            .sum();

        let mut patterns = Vec::new();
        let mut pattern_reason = None;

        if let Some(actor) = alert.user_id.as_deref().or(alert.ip_address.as_deref()) {
            let same_actor = |c: &Alert| {
                c.user_id.as_deref() == Some(actor) || (alert.user_id.is_none() && c.ip_address.as_deref() == Some(actor))
            };
            let mut high: HashSet<&str> = related
                .iter()
                .filter(|(c, _)| c.severity >= Severity::High && same_actor(c))
                .map(|(c, _)| c.id.as_str())
                .collect();
            if alert.severity >= Severity::High {
                high.insert(alert.id.as_str());
            }
            if high.len() >= self.config.high_severity_pattern_count {
                patterns.push("repeated_high_severity_actor".to_string());
                pattern_reason = Some(format!(
                    "{} HIGH or CRITICAL alerts from {} within {}m",
                    high.len(),
                    actor,
                    self.config.window_ms / 60_000
                ));
            }
        }

        if let Some(user) = alert.user_id.as_deref() {
            let mut sources: HashSet<&str> = related
                .iter()
                .filter(|(c, _)| c.user_id.as_deref() == Some(user))
                .filter_map(|(c, _)| c.ip_address.as_deref())
                .collect();
            if let Some(ip) = alert.ip_address.as_deref() {
                sources.insert(ip);
            }
            if sources.len() >= self.config.multi_source_count {
                patterns.push("multi_source_actor".to_string());
                score += 10.0;
            }
        }

        let repeats = related.iter().filter(|(c, _)| c.alert_type == alert.alert_type).count();
        if repeats + 1 >= self.config.high_severity_pattern_count {
            patterns.push("repeated_alert_type".to_string());
        }

        let score = score.min(100.0);
        let over_threshold = score >= self.config.escalation_threshold;
        let should_escalate = over_threshold || pattern_reason.is_some();
        let escalation_reason = if should_escalate {
            pattern_reason.or_else(|| {
                Some(format!(
                    "correlation score {:.1} reached threshold {:.1} across {} related alerts",
                    score,
                    self.config.escalation_threshold,
                    related.len()
                ))
            })
        } else {
            None
        };

        // Join an existing group when one of the related alerts already has one
        let correlation_id = related
            .iter()
            .find_map(|(c, _)| c.correlation_id.clone())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let related_alerts: Vec<String> = related
            .into_iter()
            .take(self.config.max_child_alerts)
            .map(|(c, _)| c.id)
            .collect();

        self.stats.correlated.inc();
        if should_escalate {
            self.stats.escalations.inc();
        }
        tracing::debug!(
            alert_id = %alert.id,
            %correlation_id,
            related = related_alerts.len(),
            score,
            should_escalate,
            "alert correlated"
        );

        Ok(CorrelationResult {
            correlation_id,
            related_alerts,
            correlation_score: score,
            should_escalate,
            escalation_reason,
            patterns,
        })
    }

    fn uncorrelated(&self, alert: &Alert) -> CorrelationResult {
        CorrelationResult {
            correlation_id: alert.correlation_id.clone().unwrap_or_else(|| Uuid::new_v4().to_string()),
            related_alerts: Vec::new(),
            correlation_score: 0.0,
            should_escalate: false,
            escalation_reason: None,
            patterns: Vec::new(),
        }
    }

    pub fn stats(&self) -> CorrelationStats {
        CorrelationStats {
            correlated: self.stats.correlated.get(),
            uncorrelated: self.stats.uncorrelated.get(),
            escalations: self.stats.escalations.get(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RuleEvaluationResult, SecurityEvent};
    use crate::repository::InMemoryAlertRepository;
    use sase_common::{Clock, ManualClock};

    fn alert(event_type: &str, user: Option<&str>, ip: Option<&str>, severity: Severity, clock: &ManualClock) -> Alert {
        let mut event = SecurityEvent::new(event_type);
        event.user_id = user.map(str::to_string);
        event.ip_address = ip.map(str::to_string);
        let result = RuleEvaluationResult {
            matched: true,
            rule_id: "r".into(),
            rule_name: "rule".into(),
            score: 10.0,
            reason: String::new(),
            severity: Some(severity),
            evidence: serde_json::Value::Null,
            suggested_actions: vec![],
            tags: vec![],
        };
        Alert::from_match(&event, &result, Uuid::new_v4().to_string(), clock.now())
    }

    fn engine(clock: &Arc<ManualClock>) -> (Arc<InMemoryAlertRepository>, CorrelationEngine) {
        let repo = Arc::new(InMemoryAlertRepository::new());
        let engine = CorrelationEngine::new(CorrelationConfig::default(), repo.clone(), clock.clone());
        (repo, engine)
    }

    #[tokio::test]
    async fn test_no_history_is_uncorrelated() {
        let clock = ManualClock::starting_now();
        let (_repo, engine) = engine(&clock);

        let result = engine
            .correlate(&alert("login_failed", Some("u1"), None, Severity::High, &clock))
            .await
            .unwrap();
        assert!(!result.is_correlated());
        assert!(!result.should_escalate);
        assert_eq!(engine.stats().uncorrelated, 1);
    }

    #[tokio::test]
    async fn test_three_high_alerts_from_actor_escalate() {
        let clock = ManualClock::starting_now();
        let (repo, engine) = engine(&clock);

        repo.save(&alert("login_failed", Some("u1"), None, Severity::High, &clock)).await.unwrap();
        repo.save(&alert("mfa_bypass", Some("u1"), None, Severity::Critical, &clock)).await.unwrap();

        let current = alert("data_export", Some("u1"), None, Severity::High, &clock);
        let result = engine.correlate(&current).await.unwrap();

        assert_eq!(result.related_alerts.len(), 2);
        assert!(result.should_escalate);
        assert!(result.patterns.contains(&"repeated_high_severity_actor".to_string()));
        assert!(result.escalation_reason.unwrap().contains("u1"));
    }

    #[tokio::test]
    async fn test_reuses_existing_correlation_id_and_caps_children() {
        let clock = ManualClock::starting_now();
        let (repo, engine) = engine(&clock);

        for i in 0..12 {
            let mut a = alert("port_scan", None, Some("10.0.0.5"), Severity::Low, &clock);
            if i == 0 {
                a.correlation_id = Some("group-1".into());
            }
            repo.save(&a).await.unwrap();
        }

        let result = engine
            .correlate(&alert("port_scan", None, Some("10.0.0.5"), Severity::Low, &clock))
            .await
            .unwrap();
        assert_eq!(result.correlation_id, "group-1");
        assert_eq!(result.related_alerts.len(), 10);
        assert!(result.correlation_score <= 100.0);
    }

    #[tokio::test]
    async fn test_window_and_resolved_are_excluded() {
        let clock = ManualClock::starting_now();
        let (repo, engine) = engine(&clock);

        repo.save(&alert("login_failed", Some("u1"), None, Severity::High, &clock)).await.unwrap();
        clock.advance(Duration::hours(2));
        let mut resolved = alert("login_failed", Some("u1"), None, Severity::High, &clock);
        resolved.status = AlertStatus::Resolved;
        repo.save(&resolved).await.unwrap();

        let result = engine
            .correlate(&alert("login_failed", Some("u1"), None, Severity::Medium, &clock))
            .await
            .unwrap();
        assert!(!result.is_correlated());
    }
}
