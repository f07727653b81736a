//! Core alert types

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Job priority used when an alert carries no usable severity
pub const DEFAULT_JOB_PRIORITY: u8 = 5;

/// Upper bound on the occurrence trail kept in an alert's evidence
const MAX_OCCURRENCE_TRAIL: usize = 100;

// =============================================================================
// Severity & Status
// =============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Low = 1,
    Medium = 2,
    High = 3,
    Critical = 4,
}

impl Severity {
    pub const ALL: [Severity; 4] = [Severity::Low, Severity::Medium, Severity::High, Severity::Critical];

    /// One step up the ladder; CRITICAL stays CRITICAL
    pub fn escalate(self) -> Self {
        match self {
            Severity::Low => Severity::Medium,
            Severity::Medium => Severity::High,
            Severity::High | Severity::Critical => Severity::Critical,
        }
    }

    /// Queue priority, 1 is served first
    pub fn priority(self) -> u8 {
        match self {
            Severity::Critical => 1,
            Severity::High => 2,
            Severity::Medium => 3,
            Severity::Low => 4,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "LOW",
            Severity::Medium => "MEDIUM",
            Severity::High => "HIGH",
            Severity::Critical => "CRITICAL",
        }
    }
}

/// Priority for a job whose severity may be missing
pub fn job_priority(severity: Option<Severity>) -> u8 {
    severity.map_or(DEFAULT_JOB_PRIORITY, Severity::priority)
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LOW" => Ok(Severity::Low),
            "MEDIUM" => Ok(Severity::Medium),
            "HIGH" => Ok(Severity::High),
            "CRITICAL" => Ok(Severity::Critical),
            other => Err(format!("unknown severity '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "UPPERCASE")]
pub enum AlertStatus {
    Pending,
    Processing,
    Dispatched,
    Failed,
    Resolved,
}

impl AlertStatus {
    /// Dispatch work is finished for this alert
    pub fn is_terminal(&self) -> bool {
        matches!(self, AlertStatus::Dispatched | AlertStatus::Resolved)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AlertStatus::Pending => "PENDING",
            AlertStatus::Processing => "PROCESSING",
            AlertStatus::Dispatched => "DISPATCHED",
            AlertStatus::Failed => "FAILED",
            AlertStatus::Resolved => "RESOLVED",
        }
    }
}

impl fmt::Display for AlertStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// Metadata
// =============================================================================

/// Typed metadata value. Maps are ordered so canonical renderings are stable.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    List(Vec<MetaValue>),
    Map(Metadata),
}

/// Key-ordered metadata map
pub type Metadata = BTreeMap<String, MetaValue>;

impl MetaValue {
    /// Deterministic textual form, independent of insertion order
    pub fn canonical(&self) -> String {
        match self {
            MetaValue::Null => "null".to_string(),
            MetaValue::Bool(b) => b.to_string(),
            MetaValue::Int(i) => i.to_string(),
            MetaValue::Float(f) if f.is_finite() && f.fract() == 0.0 && f.abs() < 9.0e15 => {
                (*f as i64).to_string()
            }
            MetaValue::Float(f) => f.to_string(),
            MetaValue::Text(s) => s.clone(),
            MetaValue::List(items) => {
                let parts: Vec<String> = items.iter().map(MetaValue::canonical).collect();
                format!("[{}]", parts.join(","))
            }
            MetaValue::Map(map) => format!("{{{}}}", canonical_metadata(map)),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetaValue::Text(s) => Some(s),
            _ => None,
        }
    }

    pub fn to_json(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }
}

/// `k=v` pairs joined by `;`, in key order
pub fn canonical_metadata(map: &Metadata) -> String {
    map.iter()
        .map(|(k, v)| format!("{}={}", k, v.canonical()))
        .collect::<Vec<_>>()
        .join(";")
}

impl From<&str> for MetaValue {
    fn from(s: &str) -> Self {
        MetaValue::Text(s.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(s: String) -> Self {
        MetaValue::Text(s)
    }
}

impl From<i64> for MetaValue {
    fn from(i: i64) -> Self {
        MetaValue::Int(i)
    }
}

impl From<f64> for MetaValue {
    fn from(f: f64) -> Self {
        MetaValue::Float(f)
    }
}

impl From<bool> for MetaValue {
    fn from(b: bool) -> Self {
        MetaValue::Bool(b)
    }
}

impl From<serde_json::Value> for MetaValue {
    fn from(value: serde_json::Value) -> Self {
        use serde_json::Value;
        match value {
            Value::Null => MetaValue::Null,
            Value::Bool(b) => MetaValue::Bool(b),
            Value::Number(n) => match n.as_i64() {
                Some(i) => MetaValue::Int(i),
                None => MetaValue::Float(n.as_f64().unwrap_or(0.0)),
            },
            Value::String(s) => MetaValue::Text(s),
            Value::Array(items) => MetaValue::List(items.into_iter().map(MetaValue::from).collect()),
            Value::Object(map) => MetaValue::Map(map.into_iter().map(|(k, v)| (k, MetaValue::from(v))).collect()),
        }
    }
}

// =============================================================================
// Inputs
// =============================================================================

fn new_id() -> String {
    Uuid::new_v4().to_string()
}

/// Event fed into the pipeline
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    #[serde(default = "new_id")]
    pub id: String,
    pub event_type: String,
    #[serde(default)]
    pub user_id: Option<String>,
    #[serde(default)]
    pub ip_address: Option<String>,
    #[serde(default)]
    pub user_agent: Option<String>,
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: serde_json::Value,
}

impl SecurityEvent {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            id: new_id(),
            event_type: event_type.into(),
            user_id: None,
            ip_address: None,
            user_agent: None,
            session_id: None,
            timestamp: Utc::now(),
            data: serde_json::Value::Null,
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    pub fn with_ip(mut self, ip: impl Into<String>) -> Self {
        self.ip_address = Some(ip.into());
        self
    }

    pub fn with_session(mut self, session_id: impl Into<String>) -> Self {
        self.session_id = Some(session_id.into());
        self
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }
}

/// Output of rule evaluation for one rule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleEvaluationResult {
    pub matched: bool,
    pub rule_id: String,
    pub rule_name: String,
    pub score: f64,
    #[serde(default)]
    pub reason: String,
    /// Missing or unrecognised severities deserialize to `None`
    #[serde(default, deserialize_with = "lenient_severity")]
    pub severity: Option<Severity>,
    #[serde(default)]
    pub evidence: serde_json::Value,
    #[serde(default)]
    pub suggested_actions: Vec<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

fn lenient_severity<'de, D>(deserializer: D) -> Result<Option<Severity>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw: Option<String> = Option::deserialize(deserializer)?;
    Ok(raw.and_then(|s| s.parse().ok()))
}

/// Result of correlating one alert against recent history
#[derive(Debug, Clone, Serialize)]
pub struct CorrelationResult {
    pub correlation_id: String,
    pub related_alerts: Vec<String>,
    pub correlation_score: f64,
    pub should_escalate: bool,
    pub escalation_reason: Option<String>,
    pub patterns: Vec<String>,
}

impl CorrelationResult {
    pub fn is_correlated(&self) -> bool {
        !self.related_alerts.is_empty()
    }
}

// =============================================================================
// Alert
// =============================================================================

/// Persisted alert
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Alert {
    pub id: String,
    pub fingerprint: String,
    pub alert_type: String,
    pub severity: Severity,
    pub status: AlertStatus,
    pub title: String,
    pub description: String,

    pub rule_id: Option<String>,
    pub rule_name: Option<String>,
    pub event_type: String,

    pub user_id: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub session_id: Option<String>,

    pub occurrence_count: u32,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,

    pub score: f64,
    pub evidence: serde_json::Value,
    pub correlation_id: Option<String>,
    pub is_correlated: bool,
    pub tags: Vec<String>,

    pub dispatched_channels: Vec<String>,
    pub dispatch_attempts: u32,
    pub last_dispatch_at: Option<DateTime<Utc>>,
    pub dispatch_errors: BTreeMap<String, String>,
    pub suppressed_until: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Alert {
    /// Fresh PENDING alert built from a rule match
    pub fn from_match(
        event: &SecurityEvent,
        result: &RuleEvaluationResult,
        fingerprint: String,
        now: DateTime<Utc>,
    ) -> Self {
        let severity = result.severity.unwrap_or(Severity::Medium);
        let description = if result.reason.is_empty() {
            format!("Rule '{}' matched event '{}'", result.rule_name, event.event_type)
        } else {
            result.reason.clone()
        };

        Self {
            id: new_id(),
            fingerprint,
            alert_type: event.event_type.clone(),
            severity,
            status: AlertStatus::Pending,
            title: format!("{}: {}", result.rule_name, event.event_type),
            description,
            rule_id: Some(result.rule_id.clone()),
            rule_name: Some(result.rule_name.clone()),
            event_type: event.event_type.clone(),
            user_id: event.user_id.clone(),
            ip_address: event.ip_address.clone(),
            user_agent: event.user_agent.clone(),
            session_id: event.session_id.clone(),
            occurrence_count: 1,
            first_seen: now,
            last_seen: now,
            score: result.score,
            evidence: result.evidence.clone(),
            correlation_id: None,
            is_correlated: false,
            tags: result.tags.clone(),
            dispatched_channels: Vec::new(),
            dispatch_attempts: 0,
            last_dispatch_at: None,
            dispatch_errors: BTreeMap::new(),
            suppressed_until: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Fold a repeat occurrence into this alert
    pub fn record_occurrence(&mut self, at: DateTime<Utc>, score: f64, evidence: &serde_json::Value) {
        self.occurrence_count = self.occurrence_count.saturating_add(1);
        if at > self.last_seen {
            self.last_seen = at;
        }
        if score > self.score {
            self.score = score;
        }
        self.merge_evidence(at, score, evidence);
        self.updated_at = at;
    }

    fn merge_evidence(&mut self, at: DateTime<Utc>, score: f64, evidence: &serde_json::Value) {
        use serde_json::{json, Value};

        if !self.evidence.is_object() {
            let initial = std::mem::take(&mut self.evidence);
            self.evidence = if initial.is_null() { json!({}) } else { json!({ "initial": initial }) };
        }
        let Value::Object(merged) = &mut self.evidence else {
            return;
        };

        if let Value::Object(incoming) = evidence {
            for (key, value) in incoming {
                if key != "occurrences" {
                    merged.insert(key.clone(), value.clone());
                }
            }
        }

        let trail = merged
            .entry("occurrences")
            .or_insert_with(|| Value::Array(Vec::new()));
        if let Value::Array(entries) = trail {
            entries.push(json!({ "at": at.to_rfc3339(), "score": score, "evidence": evidence }));
            if entries.len() > MAX_OCCURRENCE_TRAIL {
                let excess = entries.len() - MAX_OCCURRENCE_TRAIL;
                entries.drain(..excess);
            }
        }
    }

    /// Raise severity one step and record why. Returns the previous severity.
    pub fn escalate(&mut self, reason: &str, at: DateTime<Utc>) -> Severity {
        let previous = self.severity;
        self.severity = previous.escalate();
        if !self.tags.iter().any(|t| t == "escalated") {
            self.tags.push("escalated".to_string());
        }
        self.description = format!("[ESCALATED: {}] {}", reason, self.description);
        self.updated_at = at;
        previous
    }

    pub fn is_suppressed(&self, now: DateTime<Utc>) -> bool {
        self.suppressed_until.map_or(false, |until| until > now)
    }

    /// Merge newly delivered channels, keeping order and uniqueness
    pub fn add_dispatched_channels<'a>(&mut self, channels: impl IntoIterator<Item = &'a String>) {
        for channel in channels {
            if !self.dispatched_channels.contains(channel) {
                self.dispatched_channels.push(channel.clone());
            }
        }
    }

    pub fn set_status(&mut self, status: AlertStatus, at: DateTime<Utc>) {
        self.status = status;
        self.updated_at = at;
    }
}
