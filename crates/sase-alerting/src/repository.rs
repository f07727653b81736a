//! Alert persistence boundary
//!
//! The pipeline only talks to storage through [`AlertRepository`]. The
//! in-memory implementation backs tests and single-node deployments.

use crate::model::{Alert, AlertStatus, Severity};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, VecDeque};

/// Dispatch log entries kept by the in-memory repository; oldest go first
pub const DEFAULT_DISPATCH_LOG_CAPACITY: usize = 10_000;

/// Repository result type
pub type RepoResult<T> = Result<T, RepositoryError>;

/// In-place change applied to a stored alert
pub type AlertUpdate = Box<dyn FnOnce(&mut Alert) + Send>;

/// Repository errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum RepositoryError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("storage error: {0}")]
    StorageError(String),
}

/// Outcome of one channel send attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DispatchLogStatus {
    Success,
    Failed,
}

/// One row per channel per dispatch round
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchLogEntry {
    pub alert_id: String,
    pub channel: String,
    pub status: DispatchLogStatus,
    pub attempt: u32,
    pub error: Option<String>,
    pub duration_ms: u64,
    pub created_at: DateTime<Utc>,
}

/// Grouped alert counts
#[derive(Debug, Clone, Default, Serialize)]
pub struct AlertCounts {
    pub total: u64,
    pub by_status: BTreeMap<String, u64>,
    pub by_severity: BTreeMap<String, u64>,
    pub by_type: BTreeMap<String, u64>,
    pub correlated: u64,
    pub escalated: u64,
}

/// Alert Repository trait
#[async_trait]
pub trait AlertRepository: Send + Sync {
    /// Insert a new alert; fails with `Conflict` if the id exists
    async fn insert(&self, alert: &Alert) -> RepoResult<()>;

    /// Get alert by ID
    async fn get(&self, id: &str) -> RepoResult<Alert>;

    /// Save (upsert) alert
    async fn save(&self, alert: &Alert) -> RepoResult<()>;

    /// Apply `change` to the stored alert atomically and return the result.
    /// Concurrent writers of other fields are not lost.
    async fn update(&self, id: &str, change: AlertUpdate) -> RepoResult<Alert>;

    /// Fold a repeat occurrence into a stored alert
    async fn record_occurrence(
        &self,
        id: &str,
        at: DateTime<Utc>,
        score: f64,
        evidence: &serde_json::Value,
    ) -> RepoResult<Alert> {
        let evidence = evidence.clone();
        self.update(id, Box::new(move |alert| alert.record_occurrence(at, score, &evidence)))
            .await
    }

    /// Alerts seen at or after `since`, most recent first
    async fn recent(&self, since: DateTime<Utc>) -> RepoResult<Vec<Alert>>;

    /// Alerts in `status` last updated before `updated_before`
    async fn find_by_status(
        &self,
        status: AlertStatus,
        updated_before: Option<DateTime<Utc>>,
    ) -> RepoResult<Vec<Alert>>;

    /// Alerts with a dispatch attempt at or after `since`, optionally
    /// restricted to one user and excluding one alert
    async fn count_dispatch_attempted(
        &self,
        user_id: Option<&str>,
        since: DateTime<Utc>,
        exclude_alert: Option<&str>,
    ) -> RepoResult<u64>;

    async fn append_dispatch_log(&self, entry: DispatchLogEntry) -> RepoResult<()>;

    async fn dispatch_logs(&self, alert_id: &str) -> RepoResult<Vec<DispatchLogEntry>>;

    /// Counts grouped by status, severity and type for alerts created at or after `since`
    async fn counts(&self, since: Option<DateTime<Utc>>) -> RepoResult<AlertCounts>;
}

/// In-memory alert repository (for testing and development)
pub struct InMemoryAlertRepository {
    alerts: RwLock<HashMap<String, Alert>>,
    logs: RwLock<VecDeque<DispatchLogEntry>>,
    log_capacity: usize,
}

impl InMemoryAlertRepository {
    pub fn new() -> Self {
        Self::with_log_capacity(DEFAULT_DISPATCH_LOG_CAPACITY)
    }

    pub fn with_log_capacity(log_capacity: usize) -> Self {
        Self {
            alerts: RwLock::new(HashMap::new()),
            logs: RwLock::new(VecDeque::new()),
            log_capacity: log_capacity.max(1),
        }
    }

    pub fn len(&self) -> usize {
        self.alerts.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.alerts.read().is_empty()
    }
}

impl Default for InMemoryAlertRepository {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AlertRepository for InMemoryAlertRepository {
    async fn insert(&self, alert: &Alert) -> RepoResult<()> {
        let mut alerts = self.alerts.write();
        if alerts.contains_key(&alert.id) {
            return Err(RepositoryError::Conflict(alert.id.clone()));
        }
        alerts.insert(alert.id.clone(), alert.clone());
        Ok(())
    }

    async fn get(&self, id: &str) -> RepoResult<Alert> {
        self.alerts
            .read()
            .get(id)
            .cloned()
            .ok_or_else(|| RepositoryError::NotFound(id.to_string()))
    }

    async fn save(&self, alert: &Alert) -> RepoResult<()> {
        self.alerts.write().insert(alert.id.clone(), alert.clone());
        Ok(())
    }

    async fn update(&self, id: &str, change: AlertUpdate) -> RepoResult<Alert> {
        let mut alerts = self.alerts.write();
        let alert = alerts
            .get_mut(id)
            .ok_or_else(|| RepositoryError::NotFound(id.to_string()))?;
        change(alert);
        Ok(alert.clone())
    }

    async fn recent(&self, since: DateTime<Utc>) -> RepoResult<Vec<Alert>> {
        let mut found: Vec<Alert> = self
            .alerts
            .read()
            .values()
            .filter(|a| a.last_seen >= since)
            .cloned()
            .collect();
        found.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        Ok(found)
    }

    async fn find_by_status(
        &self,
        status: AlertStatus,
        updated_before: Option<DateTime<Utc>>,
    ) -> RepoResult<Vec<Alert>> {
        Ok(self
            .alerts
            .read()
            .values()
            .filter(|a| a.status == status)
            .filter(|a| updated_before.map_or(true, |t| a.updated_at < t))
            .cloned()
            .collect())
    }

    async fn count_dispatch_attempted(
        &self,
        user_id: Option<&str>,
        since: DateTime<Utc>,
        exclude_alert: Option<&str>,
    ) -> RepoResult<u64> {
        let count = self
            .alerts
            .read()
            .values()
            .filter(|a| a.dispatch_attempts > 0)
            .filter(|a| a.last_dispatch_at.map_or(false, |t| t >= since))
            .filter(|a| user_id.map_or(true, |u| a.user_id.as_deref() == Some(u)))
            .filter(|a| exclude_alert != Some(a.id.as_str()))
            .count();
        Ok(count as u64)
    }

    async fn append_dispatch_log(&self, entry: DispatchLogEntry) -> RepoResult<()> {
        let mut logs = self.logs.write();
        if logs.len() >= self.log_capacity {
            logs.pop_front();
        }
        logs.push_back(entry);
        Ok(())
    }

    async fn dispatch_logs(&self, alert_id: &str) -> RepoResult<Vec<DispatchLogEntry>> {
        Ok(self
            .logs
            .read()
            .iter()
            .filter(|e| e.alert_id == alert_id)
            .cloned()
            .collect())
    }

    async fn counts(&self, since: Option<DateTime<Utc>>) -> RepoResult<AlertCounts> {
        let alerts = self.alerts.read();
        let mut counts = AlertCounts::default();

        for alert in alerts.values().filter(|a| since.map_or(true, |t| a.created_at >= t)) {
            counts.total += 1;
            *counts.by_status.entry(alert.status.to_string()).or_default() += 1;
            *counts.by_severity.entry(alert.severity.to_string()).or_default() += 1;
            *counts.by_type.entry(alert.alert_type.clone()).or_default() += 1;
            if alert.is_correlated {
                counts.correlated += 1;
            }
            if alert.tags.iter().any(|t| t == "escalated") {
                counts.escalated += 1;
            }
        }

        for severity in Severity::ALL {
            counts.by_severity.entry(severity.to_string()).or_default();
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{RuleEvaluationResult, SecurityEvent};
    use chrono::Duration;

    fn alert(user: &str, at: DateTime<Utc>) -> Alert {
        let event = SecurityEvent::new("login_failed").with_user(user);
        let result = RuleEvaluationResult {
            matched: true,
            rule_id: "r".into(),
            rule_name: "rule".into(),
            score: 10.0,
            reason: String::new(),
            severity: Some(Severity::High),
            evidence: serde_json::Value::Null,
            suggested_actions: vec![],
            tags: vec![],
        };
        Alert::from_match(&event, &result, format!("fp-{}", uuid::Uuid::new_v4()), at)
    }

    #[tokio::test]
    async fn test_insert_conflict_and_get() {
        let repo = InMemoryAlertRepository::new();
        let a = alert("u1", Utc::now());
        repo.insert(&a).await.unwrap();
        assert!(matches!(repo.insert(&a).await, Err(RepositoryError::Conflict(_))));
        assert_eq!(repo.get(&a.id).await.unwrap().user_id.as_deref(), Some("u1"));
        assert!(matches!(repo.get("missing").await, Err(RepositoryError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_update_and_record_occurrence() {
        let repo = InMemoryAlertRepository::new();
        let now = Utc::now();
        let a = alert("u1", now);
        repo.insert(&a).await.unwrap();

        let merged = repo
            .record_occurrence(&a.id, now + Duration::seconds(5), 80.0, &serde_json::json!({ "k": 1 }))
            .await
            .unwrap();
        assert_eq!(merged.occurrence_count, 2);
        assert_eq!(merged.score, 80.0);

        let updated = repo
            .update(&a.id, Box::new(|alert| alert.status = AlertStatus::Processing))
            .await
            .unwrap();
        assert_eq!(updated.status, AlertStatus::Processing);
        assert_eq!(updated.occurrence_count, 2);
        assert!(matches!(
            repo.update("missing", Box::new(|_| {})).await,
            Err(RepositoryError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_count_dispatch_attempted() {
        let repo = InMemoryAlertRepository::new();
        let now = Utc::now();

        for i in 0..3 {
            let mut a = alert(if i < 2 { "u1" } else { "u2" }, now);
            a.dispatch_attempts = 1;
            a.last_dispatch_at = Some(now - Duration::minutes(10));
            repo.save(&a).await.unwrap();
        }
        let mut stale = alert("u1", now);
        stale.dispatch_attempts = 1;
        stale.last_dispatch_at = Some(now - Duration::hours(2));
        repo.save(&stale).await.unwrap();
        repo.save(&alert("u1", now)).await.unwrap();

        let hour_ago = now - Duration::hours(1);
        assert_eq!(repo.count_dispatch_attempted(Some("u1"), hour_ago, None).await.unwrap(), 2);
        assert_eq!(repo.count_dispatch_attempted(None, hour_ago, None).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_counts_grouping() {
        let repo = InMemoryAlertRepository::new();
        let mut a = alert("u1", Utc::now());
        a.status = AlertStatus::Dispatched;
        repo.save(&a).await.unwrap();
        repo.save(&alert("u2", Utc::now())).await.unwrap();

        let counts = repo.counts(None).await.unwrap();
        assert_eq!(counts.total, 2);
        assert_eq!(counts.by_status.get("DISPATCHED"), Some(&1));
        assert_eq!(counts.by_status.get("PENDING"), Some(&1));
        assert_eq!(counts.by_severity.get("HIGH"), Some(&2));
        assert_eq!(counts.by_severity.get("LOW"), Some(&0));
    }

    #[tokio::test]
    async fn test_dispatch_log_is_bounded() {
        let repo = InMemoryAlertRepository::with_log_capacity(3);
        for attempt in 1..=5 {
            repo.append_dispatch_log(DispatchLogEntry {
                alert_id: "a1".into(),
                channel: "email".into(),
                status: DispatchLogStatus::Failed,
                attempt,
                error: Some("timeout".into()),
                duration_ms: 5,
                created_at: Utc::now(),
            })
            .await
            .unwrap();
        }

        let attempts: Vec<u32> = repo.dispatch_logs("a1").await.unwrap().iter().map(|e| e.attempt).collect();
        assert_eq!(attempts, vec![3, 4, 5]);
    }
}
