//! Hourly dispatch ceilings
//!
//! Counts come from the repository (alerts with a dispatch attempt in the
//! last hour), so the limit holds across restarts and pipeline instances
//! sharing a store. Dispatches admitted by [`DispatchRateLimiter::reserve`]
//! but not yet recorded count as in flight, so concurrent workers in one
//! process cannot overshoot a ceiling. Separate processes sharing a store
//! are only bounded by what each has recorded.

use crate::model::Alert;
use crate::repository::{AlertRepository, RepoResult};
use chrono::Duration;
use parking_lot::Mutex;
use sase_common::SharedClock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub max_per_hour_per_user: u64,
    pub max_per_hour_global: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_per_hour_per_user: 10,
            max_per_hour_global: 100,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum RateLimitDecision {
    Allowed,
    UserLimited { user_id: String, count: u64, limit: u64 },
    GlobalLimited { count: u64, limit: u64 },
}

impl RateLimitDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateLimitDecision::Allowed)
    }
}

impl fmt::Display for RateLimitDecision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RateLimitDecision::Allowed => f.write_str("allowed"),
            RateLimitDecision::UserLimited { user_id, count, limit } => {
                write!(f, "user {user_id} reached {count}/{limit} dispatches in the last hour")
            }
            RateLimitDecision::GlobalLimited { count, limit } => {
                write!(f, "global ceiling reached: {count}/{limit} dispatches in the last hour")
            }
        }
    }
}

pub struct DispatchRateLimiter {
    config: RateLimitConfig,
    repository: Arc<dyn AlertRepository>,
    clock: SharedClock,
    /// Admitted dispatches not yet recorded: alert id → user id
    in_flight: Mutex<HashMap<String, Option<String>>>,
    /// Serializes check-then-reserve
    admission: tokio::sync::Mutex<()>,
}

/// An admitted dispatch; the slot is released on drop, which must happen
/// after the attempt is recorded in the repository
pub struct DispatchSlot {
    limiter: Arc<DispatchRateLimiter>,
    alert_id: String,
}

impl Drop for DispatchSlot {
    fn drop(&mut self) {
        self.limiter.in_flight.lock().remove(&self.alert_id);
    }
}

impl fmt::Debug for DispatchSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchSlot").field("alert_id", &self.alert_id).finish()
    }
}

impl DispatchRateLimiter {
    pub fn new(config: RateLimitConfig, repository: Arc<dyn AlertRepository>, clock: SharedClock) -> Self {
        Self {
            config,
            repository,
            clock,
            in_flight: Mutex::new(HashMap::new()),
            admission: tokio::sync::Mutex::new(()),
        }
    }

    /// Check `alert` and, if allowed, hold a slot for it until the returned
    /// [`DispatchSlot`] is dropped
    pub async fn reserve(self: &Arc<Self>, alert: &Alert) -> RepoResult<Result<DispatchSlot, RateLimitDecision>> {
        let _admission = self.admission.lock().await;
        let decision = self.check(alert).await?;
        if !decision.is_allowed() {
            return Ok(Err(decision));
        }
        self.in_flight
            .lock()
            .insert(alert.id.clone(), alert.user_id.clone());
        Ok(Ok(DispatchSlot {
            limiter: Arc::clone(self),
            alert_id: alert.id.clone(),
        }))
    }

    /// In-flight slots held by other alerts: (same user, all)
    fn in_flight_for(&self, alert: &Alert) -> (u64, u64) {
        let in_flight = self.in_flight.lock();
        let others = in_flight.iter().filter(|(id, _)| **id != alert.id);
        let (mut user, mut total) = (0, 0);
        for (_, user_id) in others {
            total += 1;
            if alert.user_id.is_some() && *user_id == alert.user_id {
                user += 1;
            }
        }
        (user, total)
    }

    /// Per-user ceiling first (skipped for anonymous alerts), then global.
    /// The alert itself is never counted against its own limit.
    pub async fn check(&self, alert: &Alert) -> RepoResult<RateLimitDecision> {
        let since = self.clock.now() - Duration::hours(1);
        // Read before the repository: a slot released in between is then
        // counted twice rather than missed
        let (user_in_flight, total_in_flight) = self.in_flight_for(alert);

        if let Some(user_id) = alert.user_id.as_deref() {
            let count = user_in_flight
                + self
                    .repository
                    .count_dispatch_attempted(Some(user_id), since, Some(&alert.id))
                    .await?;
            if count >= self.config.max_per_hour_per_user {
                return Ok(RateLimitDecision::UserLimited {
                    user_id: user_id.to_string(),
                    count,
                    limit: self.config.max_per_hour_per_user,
                });
            }
        }

        let count = total_in_flight
            + self
                .repository
                .count_dispatch_attempted(None, since, Some(&alert.id))
                .await?;
        if count >= self.config.max_per_hour_global {
            return Ok(RateLimitDecision::GlobalLimited {
                count,
                limit: self.config.max_per_hour_global,
            });
        }

        Ok(RateLimitDecision::Allowed)
    }
}
