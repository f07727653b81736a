//! Pipeline notifications
//!
//! Fire-and-forget broadcast of lifecycle events. Publishing never blocks the
//! pipeline; a lagging or absent subscriber only loses messages.

use crate::model::{AlertStatus, Severity};
use chrono::{DateTime, Utc};
use sase_common::AtomicCounter;
use serde::Serialize;
use tokio::sync::broadcast;

const EVENT_BUS_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "event")]
pub enum AlertEvent {
    #[serde(rename = "alert.created")]
    Created {
        alert_id: String,
        fingerprint: String,
        severity: Severity,
        alert_type: String,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "alert.escalated")]
    Escalated {
        alert_id: String,
        from: Severity,
        to: Severity,
        reason: String,
        correlation_id: Option<String>,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "alert.processing.failed")]
    ProcessingFailed {
        event_id: String,
        alert_id: Option<String>,
        error: String,
        timestamp: DateTime<Utc>,
    },

    #[serde(rename = "alert.dispatch.completed")]
    DispatchCompleted {
        alert_id: String,
        success: bool,
        status: AlertStatus,
        dispatched_channels: Vec<String>,
        failed_channels: Vec<String>,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
}

impl AlertEvent {
    pub fn name(&self) -> &'static str {
        match self {
            AlertEvent::Created { .. } => "alert.created",
            AlertEvent::Escalated { .. } => "alert.escalated",
            AlertEvent::ProcessingFailed { .. } => "alert.processing.failed",
            AlertEvent::DispatchCompleted { .. } => "alert.dispatch.completed",
        }
    }

    pub fn alert_id(&self) -> Option<&str> {
        match self {
            AlertEvent::Created { alert_id, .. }
            | AlertEvent::Escalated { alert_id, .. }
            | AlertEvent::DispatchCompleted { alert_id, .. } => Some(alert_id),
            AlertEvent::ProcessingFailed { alert_id, .. } => alert_id.as_deref(),
        }
    }
}

pub struct EventBus {
    sender: broadcast::Sender<AlertEvent>,
    published: AtomicCounter,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_BUS_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            published: AtomicCounter::new(0),
        }
    }

    pub fn publish(&self, event: AlertEvent) {
        tracing::trace!(event = event.name(), alert_id = ?event.alert_id(), "publishing");
        self.published.inc();
        // No receivers is fine
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AlertEvent> {
        self.sender.subscribe()
    }

    pub fn published(&self) -> u64 {
        self.published.get()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
