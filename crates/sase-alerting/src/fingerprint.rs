//! Alert fingerprinting
//!
//! Stable identity for "the same alert": sha256 over the alert's identifying
//! attributes plus the dedup time bucket it falls into. Two occurrences
//! within the same bucket hash identically; crossing a bucket boundary yields
//! a new fingerprint.

use crate::model::{canonical_metadata, Alert, MetaValue, Metadata};
use sha2::{Digest, Sha256};

/// Builder for alert fingerprints
#[derive(Debug, Clone, Default)]
pub struct Fingerprint {
    alert_type: String,
    actor_id: Option<String>,
    source_address: Option<String>,
    rule_id: Option<String>,
    session_id: Option<String>,
    extra: Metadata,
}

impl Fingerprint {
    pub fn new(alert_type: impl Into<String>) -> Self {
        Self {
            alert_type: alert_type.into(),
            ..Default::default()
        }
    }

    /// Seed from an alert's identifying attributes
    pub fn for_alert(alert: &Alert) -> Self {
        Self {
            alert_type: alert.alert_type.clone(),
            actor_id: alert.user_id.clone(),
            source_address: alert.ip_address.clone(),
            rule_id: alert.rule_id.clone(),
            session_id: alert.session_id.clone(),
            extra: Metadata::new(),
        }
    }

    pub fn actor(mut self, actor_id: Option<&str>) -> Self {
        self.actor_id = actor_id.map(str::to_string);
        self
    }

    pub fn source(mut self, address: Option<&str>) -> Self {
        self.source_address = address.map(str::to_string);
        self
    }

    pub fn rule(mut self, rule_id: Option<&str>) -> Self {
        self.rule_id = rule_id.map(str::to_string);
        self
    }

    pub fn session(mut self, session_id: Option<&str>) -> Self {
        self.session_id = session_id.map(str::to_string);
        self
    }

    pub fn extra(mut self, key: impl Into<String>, value: impl Into<MetaValue>) -> Self {
        self.extra.insert(key.into(), value.into());
        self
    }

    pub fn extras(mut self, extra: Metadata) -> Self {
        self.extra.extend(extra);
        self
    }

    /// Canonical pre-image for the bucket containing `now_ms`
    pub fn canonical(&self, now_ms: i64, window_ms: u64) -> String {
        let bucket = now_ms.div_euclid(window_ms.max(1) as i64);
        format!(
            "{}|{}|{}|{}|{}|{}|{}",
            self.alert_type,
            self.actor_id.as_deref().unwrap_or("anonymous"),
            self.source_address.as_deref().unwrap_or("unknown"),
            self.rule_id.as_deref().unwrap_or("manual"),
            self.session_id.as_deref().unwrap_or("no-session"),
            canonical_metadata(&self.extra),
            bucket,
        )
    }

    /// Hex-encoded digest for the bucket containing `now_ms`
    pub fn compute(&self, now_ms: i64, window_ms: u64) -> String {
        let hash = Sha256::digest(self.canonical(now_ms, window_ms).as_bytes());
        hex::encode(&hash[..16])
    }
}
