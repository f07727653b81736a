//! Rule evaluation boundary
//!
//! The pipeline asks a [`RuleEngine`] which rules an event matched. The
//! static engine shipped here matches on event type plus optional numeric
//! conditions over the event's `data` payload.

use crate::model::{RuleEvaluationResult, SecurityEvent, Severity};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, thiserror::Error)]
pub enum RuleError {
    #[error("rule evaluation failed: {0}")]
    Evaluation(String),

    #[error("rule source unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait RuleEngine: Send + Sync {
    /// Evaluate every rule for `event`; only matched results are returned
    async fn evaluate(&self, event: &SecurityEvent) -> Result<Vec<RuleEvaluationResult>, RuleError>;
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConditionOp {
    Equals,
    GreaterOrEqual,
    LessThan,
    Exists,
}

/// Condition over a top-level field of the event's `data`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataCondition {
    pub field: String,
    pub op: ConditionOp,
    #[serde(default)]
    pub value: serde_json::Value,
}

impl DataCondition {
    fn matches(&self, data: &serde_json::Value) -> bool {
        let Some(actual) = data.get(&self.field) else {
            return false;
        };
        match self.op {
            ConditionOp::Exists => true,
            ConditionOp::Equals => actual == &self.value,
            ConditionOp::GreaterOrEqual => match (actual.as_f64(), self.value.as_f64()) {
                (Some(a), Some(b)) => a >= b,
                _ => false,
            },
            ConditionOp::LessThan => match (actual.as_f64(), self.value.as_f64()) {
                (Some(a), Some(b)) => a < b,
                _ => false,
            },
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventRule {
    pub id: String,
    pub name: String,
    pub event_types: Vec<String>,
    #[serde(default)]
    pub conditions: Vec<DataCondition>,
    pub severity: Severity,
    pub score: f64,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub suggested_actions: Vec<String>,
    #[serde(default = "enabled")]
    pub enabled: bool,
}

fn enabled() -> bool {
    true
}

impl EventRule {
    fn evaluate(&self, event: &SecurityEvent) -> Option<RuleEvaluationResult> {
        if !self.enabled || !self.event_types.iter().any(|t| t == &event.event_type) {
            return None;
        }
        if !self.conditions.iter().all(|c| c.matches(&event.data)) {
            return None;
        }

        Some(RuleEvaluationResult {
            matched: true,
            rule_id: self.id.clone(),
            rule_name: self.name.clone(),
            score: self.score,
            reason: format!("{} matched {}", self.name, event.event_type),
            severity: Some(self.severity),
            evidence: serde_json::json!({
                "event_id": event.id,
                "event_type": event.event_type,
                "data": event.data,
            }),
            suggested_actions: self.suggested_actions.clone(),
            tags: self.tags.clone(),
        })
    }
}

/// In-process rule set
pub struct StaticRuleEngine {
    rules: DashMap<String, EventRule>,
}

impl StaticRuleEngine {
    pub fn new() -> Self {
        Self { rules: DashMap::new() }
    }

    /// Engine preloaded with the built-in detection rules
    pub fn with_default_rules() -> Self {
        let engine = Self::new();
        engine.load_default_rules();
        engine
    }

    fn load_default_rules(&self) {
        // Brute force
        self.add_rule(EventRule {
            id: "brute-force".to_string(),
            name: "Brute Force Attack".to_string(),
            event_types: vec!["login_failed".to_string()],
            conditions: vec![DataCondition {
                field: "failed_attempts".to_string(),
                op: ConditionOp::GreaterOrEqual,
                value: serde_json::json!(5),
            }],
            severity: Severity::High,
            score: 60.0,
            tags: vec!["authentication".to_string()],
            suggested_actions: vec!["lock_account".to_string()],
            enabled: true,
        });

        // Impossible travel
        self.add_rule(EventRule {
            id: "impossible-travel".to_string(),
            name: "Impossible Travel".to_string(),
            event_types: vec!["login_success".to_string()],
            conditions: vec![DataCondition {
                field: "travel_speed_kmh".to_string(),
                op: ConditionOp::GreaterOrEqual,
                value: serde_json::json!(1000),
            }],
            severity: Severity::High,
            score: 70.0,
            tags: vec!["identity".to_string()],
            suggested_actions: vec!["require_mfa".to_string()],
            enabled: true,
        });

        // Data exfiltration
        self.add_rule(EventRule {
            id: "data-exfil".to_string(),
            name: "Data Exfiltration".to_string(),
            event_types: vec!["data_export".to_string(), "bulk_download".to_string()],
            conditions: vec![DataCondition {
                field: "bytes".to_string(),
                op: ConditionOp::GreaterOrEqual,
                value: serde_json::json!(1_073_741_824u64),
            }],
            severity: Severity::Critical,
            score: 90.0,
            tags: vec!["data".to_string()],
            suggested_actions: vec!["revoke_session".to_string()],
            enabled: true,
        });

        // Privilege change
        self.add_rule(EventRule {
            id: "privilege-change".to_string(),
            name: "Privilege Change".to_string(),
            event_types: vec!["role_changed".to_string()],
            conditions: vec![],
            severity: Severity::Medium,
            score: 30.0,
            tags: vec!["identity".to_string()],
            suggested_actions: vec![],
            enabled: true,
        });
    }

    pub fn add_rule(&self, rule: EventRule) {
        self.rules.insert(rule.id.clone(), rule);
    }

    pub fn remove_rule(&self, id: &str) -> Option<EventRule> {
        self.rules.remove(id).map(|(_, r)| r)
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

impl Default for StaticRuleEngine {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RuleEngine for StaticRuleEngine {
    async fn evaluate(&self, event: &SecurityEvent) -> Result<Vec<RuleEvaluationResult>, RuleError> {
        let mut matched: Vec<RuleEvaluationResult> =
            self.rules.iter().filter_map(|rule| rule.evaluate(event)).collect();
        // Stable order regardless of map iteration
        matched.sort_by(|a, b| a.rule_id.cmp(&b.rule_id));
        Ok(matched)
    }
}
