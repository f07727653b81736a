//! Alert deduplication
//!
//! Fingerprint → record map with sliding TTLs. `check_and_register` runs the
//! lookup and the first registration under one map-shard lock, so concurrent
//! first occurrences of a fingerprint produce exactly one `New`.

use crate::model::{Metadata, Severity};
use crate::task::BackgroundTask;
use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use sase_common::{AtomicCounter, SharedClock};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DedupConfig {
    /// Dedup window; also the fingerprint time bucket and default TTL
    pub window_ms: u64,
    /// Sweep period for stale records
    pub sweep_interval_ms: u64,
    /// How long a duplicate waits for its first occurrence to be stored
    pub pending_insert_wait_ms: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window_ms: 300_000,
            sweep_interval_ms: 60_000,
            pending_insert_wait_ms: 2_000,
        }
    }
}

/// What is known about a fingerprint
#[derive(Debug, Clone, Serialize)]
pub struct DedupRecord {
    pub fingerprint: String,
    pub alert_id: String,
    pub alert_type: String,
    pub severity: Severity,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub count: u64,
    pub metadata: Metadata,
    pub ttl_ms: u64,
    pub expires_at: DateTime<Utc>,
}

impl DedupRecord {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.count += 1;
        self.last_seen = now;
        self.expires_at = now + Duration::milliseconds(self.ttl_ms as i64);
    }
}

/// Data registered alongside a fingerprint
#[derive(Debug, Clone)]
pub struct DedupRegistration {
    pub alert_id: String,
    pub alert_type: String,
    pub severity: Severity,
    pub metadata: Metadata,
}

/// Outcome of [`DeduplicationStore::check_and_register`]
#[derive(Debug, Clone)]
pub enum DedupOutcome {
    /// First occurrence; the registration was stored
    New,
    /// Live record existed and was bumped
    Duplicate(DedupRecord),
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct DedupStats {
    pub checks: u64,
    pub duplicates: u64,
    pub registered: u64,
    pub expired: u64,
    pub swept: u64,
    pub active_records: usize,
    pub duplicate_rate: f64,
}

#[derive(Default)]
struct DedupCounters {
    checks: AtomicCounter,
    duplicates: AtomicCounter,
    registered: AtomicCounter,
    expired: AtomicCounter,
    swept: AtomicCounter,
}

pub struct DeduplicationStore {
    config: DedupConfig,
    clock: SharedClock,
    records: DashMap<String, DedupRecord>,
    stats: DedupCounters,
}

impl DeduplicationStore {
    pub fn new(config: DedupConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            records: DashMap::new(),
            stats: DedupCounters::default(),
        }
    }

    pub fn config(&self) -> &DedupConfig {
        &self.config
    }

    fn ttl_or_default(&self, ttl: Option<Duration>) -> u64 {
        ttl.and_then(|t| u64::try_from(t.num_milliseconds()).ok())
            .unwrap_or(self.config.window_ms)
    }

    fn record(&self, fingerprint: &str, registration: DedupRegistration, ttl_ms: u64, now: DateTime<Utc>) -> DedupRecord {
        DedupRecord {
            fingerprint: fingerprint.to_string(),
            alert_id: registration.alert_id,
            alert_type: registration.alert_type,
            severity: registration.severity,
            first_seen: now,
            last_seen: now,
            count: 1,
            metadata: registration.metadata,
            ttl_ms,
            expires_at: now + Duration::milliseconds(ttl_ms as i64),
        }
    }

    /// True if a live record exists; bumps its count, last-seen and TTL.
    /// An expired record is removed and reported as absent.
    pub fn check_duplicate(&self, fingerprint: &str) -> bool {
        self.stats.checks.inc();
        let now = self.clock.now();

        if let Some(mut record) = self.records.get_mut(fingerprint) {
            if !record.is_expired(now) {
                record.touch(now);
                self.stats.duplicates.inc();
                return true;
            }
        }

        if self.records.remove_if(fingerprint, |_, r| r.is_expired(now)).is_some() {
            self.stats.expired.inc();
        }
        false
    }

    /// Store a record, overwriting any existing one
    pub fn register_alert(&self, fingerprint: &str, registration: DedupRegistration, ttl: Option<Duration>) {
        let now = self.clock.now();
        let ttl_ms = self.ttl_or_default(ttl);
        let record = self.record(fingerprint, registration, ttl_ms, now);
        self.records.insert(fingerprint.to_string(), record);
        self.stats.registered.inc();
    }

    /// Atomic check-then-register
    pub fn check_and_register(
        &self,
        fingerprint: &str,
        registration: DedupRegistration,
        ttl: Option<Duration>,
    ) -> DedupOutcome {
        self.stats.checks.inc();
        let now = self.clock.now();
        let ttl_ms = self.ttl_or_default(ttl);

        match self.records.entry(fingerprint.to_string()) {
            Entry::Occupied(mut occupied) if !occupied.get().is_expired(now) => {
                occupied.get_mut().touch(now);
                self.stats.duplicates.inc();
                DedupOutcome::Duplicate(occupied.get().clone())
            }
            Entry::Occupied(mut occupied) => {
                self.stats.expired.inc();
                occupied.insert(self.record(fingerprint, registration, ttl_ms, now));
                self.stats.registered.inc();
                DedupOutcome::New
            }
            Entry::Vacant(vacant) => {
                vacant.insert(self.record(fingerprint, registration, ttl_ms, now));
                self.stats.registered.inc();
                DedupOutcome::New
            }
        }
    }

    /// Live record for a fingerprint
    pub fn get_alert_info(&self, fingerprint: &str) -> Option<DedupRecord> {
        let now = self.clock.now();
        self.records
            .get(fingerprint)
            .filter(|r| !r.is_expired(now))
            .map(|r| r.value().clone())
    }

    /// Bump a live record and merge extra metadata into it
    pub fn update_occurrence(&self, fingerprint: &str, extra: Option<Metadata>) -> Option<DedupRecord> {
        let now = self.clock.now();
        let mut record = self.records.get_mut(fingerprint)?;
        if record.is_expired(now) {
            return None;
        }
        record.touch(now);
        if let Some(extra) = extra {
            record.metadata.extend(extra);
        }
        Some(record.value().clone())
    }

    /// Forget a fingerprint
    pub fn remove(&self, fingerprint: &str) -> Option<DedupRecord> {
        self.records.remove(fingerprint).map(|(_, r)| r)
    }

    /// Drop expired records and records not seen within the window
    pub fn sweep(&self) -> usize {
        let now = self.clock.now();
        let stale_before = now - Duration::milliseconds(self.config.window_ms as i64);
        let before = self.records.len();

        self.records
            .retain(|_, r| !r.is_expired(now) && r.last_seen >= stale_before);

        let removed = before.saturating_sub(self.records.len());
        if removed > 0 {
            self.stats.swept.add(removed as u64);
            tracing::debug!(removed, remaining = self.records.len(), "dedup sweep");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Exact counters since start
    pub fn get_cache_stats(&self) -> DedupStats {
        let checks = self.stats.checks.get();
        let duplicates = self.stats.duplicates.get();
        DedupStats {
            checks,
            duplicates,
            registered: self.stats.registered.get(),
            expired: self.stats.expired.get(),
            swept: self.stats.swept.get(),
            active_records: self.records.len(),
            duplicate_rate: if checks == 0 { 0.0 } else { duplicates as f64 / checks as f64 },
        }
    }

    /// Periodic sweep on a background task
    pub fn spawn_sweeper(self: &Arc<Self>) -> BackgroundTask {
        let store = Arc::clone(self);
        let period = std::time::Duration::from_millis(self.config.sweep_interval_ms.max(1));
        BackgroundTask::every("dedup-sweeper", period, move || {
            let store = Arc::clone(&store);
            async move {
                store.sweep();
            }
        })
    }
}
