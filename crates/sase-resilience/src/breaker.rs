//! Circuit Breaker
//!
//! Per-resource failure isolation with a sliding call window.
//!
//! ```text
//!            failures >= threshold or failure rate >= limit
//!            (and enough calls in the window)
//!   CLOSED ─────────────────────────────────────────────▶ OPEN
//!     ▲                                                   │  ▲
//!     │ success_threshold successes        open duration  │  │ any failure
//!     │                                    elapsed        ▼  │
//!     └─────────────────────────────────────────────── HALF_OPEN
//! ```
//!
//! The call history is pruned lazily on every recorded outcome, so the failure
//! rate always reflects the last `failure_count_window_ms` only.

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use sase_common::{AtomicCounter, SharedClock, SystemClock};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::future::Future;
use std::sync::Arc;

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CircuitState {
    /// Calls pass through
    Closed,
    /// Calls are rejected without being attempted
    Open,
    /// Probing recovery; calls pass through
    HalfOpen,
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Closed => write!(f, "CLOSED"),
            Self::Open => write!(f, "OPEN"),
            Self::HalfOpen => write!(f, "HALF_OPEN"),
        }
    }
}

/// Breaker thresholds
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CircuitBreakerConfig {
    /// Failures (without an intervening success) that open the circuit
    pub failure_threshold: u32,
    /// Consecutive half-open successes that close the circuit
    pub success_threshold: u32,
    /// How long the circuit stays open before probing
    pub open_state_duration_ms: u64,
    /// Sliding window over which calls are counted
    pub failure_count_window_ms: u64,
    /// Calls required in the window before the circuit may open
    pub minimum_number_of_calls: u32,
    /// Failure percentage (0-100) in the window that opens the circuit
    pub failure_rate_threshold: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 3,
            open_state_duration_ms: 60_000,
            failure_count_window_ms: 60_000,
            minimum_number_of_calls: 5,
            failure_rate_threshold: 50.0,
        }
    }
}

/// Returned when a call is refused because the circuit is open
#[derive(Debug, Clone, thiserror::Error)]
#[error("circuit breaker '{name}' is open (retry in {retry_after_ms}ms)")]
pub struct BreakerOpenError {
    /// Breaker name
    pub name: String,
    /// Milliseconds until the breaker will admit a probe
    pub retry_after_ms: u64,
    /// Last recorded failure, if any
    pub last_error: Option<String>,
}

/// Error from [`CircuitBreaker::execute`]
#[derive(Debug)]
pub enum BreakerError<E> {
    /// The call was not attempted
    Open(BreakerOpenError),
    /// The call was attempted and failed
    Inner(E),
}

impl<E> BreakerError<E> {
    /// `true` for a breaker-open rejection
    pub fn is_open(&self) -> bool {
        matches!(self, Self::Open(_))
    }

    /// Unwrap the inner error, if the call was attempted
    pub fn into_inner(self) -> Option<E> {
        match self {
            Self::Open(_) => None,
            Self::Inner(e) => Some(e),
        }
    }
}

impl<E: std::fmt::Display> std::fmt::Display for BreakerError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open(e) => write!(f, "{e}"),
            Self::Inner(e) => write!(f, "{e}"),
        }
    }
}

impl<E: std::error::Error + 'static> std::error::Error for BreakerError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Open(e) => Some(e),
            Self::Inner(e) => Some(e),
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct CallRecord {
    at: DateTime<Utc>,
    success: bool,
}

/// All mutable state, updated under one lock so transitions are atomic
#[derive(Debug)]
struct BreakerInner {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    last_failure_time: Option<DateTime<Utc>>,
    opened_at: Option<DateTime<Utc>>,
    call_history: VecDeque<CallRecord>,
    last_error: Option<String>,
}

impl BreakerInner {
    fn new() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            last_failure_time: None,
            opened_at: None,
            call_history: VecDeque::new(),
            last_error: None,
        }
    }

    fn prune(&mut self, now: DateTime<Utc>, window: Duration) {
        let cutoff = now - window;
        while let Some(front) = self.call_history.front() {
            if front.at < cutoff {
                self.call_history.pop_front();
            } else {
                break;
            }
        }
    }

    fn failure_rate(&self) -> f64 {
        if self.call_history.is_empty() {
            return 0.0;
        }
        let failures = self.call_history.iter().filter(|c| !c.success).count();
        failures as f64 / self.call_history.len() as f64 * 100.0
    }
}

/// Per-resource circuit breaker
pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    clock: SharedClock,
    inner: Mutex<BreakerInner>,
    total_calls: AtomicCounter,
    rejected_calls: AtomicCounter,
}

impl CircuitBreaker {
    /// Create a breaker on the system clock
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_clock(name, config, SystemClock::shared())
    }

    /// Create a breaker on an injected clock
    pub fn with_clock(name: impl Into<String>, config: CircuitBreakerConfig, clock: SharedClock) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            inner: Mutex::new(BreakerInner::new()),
            total_calls: AtomicCounter::new(0),
            rejected_calls: AtomicCounter::new(0),
        }
    }

    /// Breaker name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current state as last recorded. An open breaker whose duration has
    /// elapsed still reports `Open` until the next call arrives.
    pub fn state(&self) -> CircuitState {
        self.inner.lock().state
    }

    /// Failures counted toward the threshold
    pub fn failure_count(&self) -> u32 {
        self.inner.lock().failure_count
    }

    /// Half-open successes so far
    pub fn success_count(&self) -> u32 {
        self.inner.lock().success_count
    }

    /// Admit or reject a call. Transitions OPEN to HALF_OPEN once the open
    /// duration has elapsed, admitting the calling request as the probe.
    pub fn try_acquire(&self) -> Result<(), BreakerOpenError> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed | CircuitState::HalfOpen => {
                self.total_calls.inc();
                Ok(())
            }
            CircuitState::Open => {
                let open_for = Duration::milliseconds(self.config.open_state_duration_ms as i64);
                let opened_at = inner.opened_at.unwrap_or(now);
                let elapsed = now - opened_at;

                if elapsed >= open_for {
                    inner.state = CircuitState::HalfOpen;
                    inner.success_count = 0;
                    self.total_calls.inc();
                    tracing::info!(circuit = %self.name, "circuit breaker half-open, probing");
                    Ok(())
                } else {
                    self.rejected_calls.inc();
                    Err(BreakerOpenError {
                        name: self.name.clone(),
                        retry_after_ms: (open_for - elapsed).num_milliseconds().max(0) as u64,
                        last_error: inner.last_error.clone(),
                    })
                }
            }
        }
    }

    /// Record a successful call
    pub fn record_success(&self) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();

        match inner.state {
            CircuitState::Closed => {
                inner.call_history.push_back(CallRecord { at: now, success: true });
                inner.prune(now, self.window());
                inner.failure_count = 0;
            }
            CircuitState::HalfOpen => {
                inner.success_count += 1;
                if inner.success_count >= self.config.success_threshold {
                    self.close(&mut inner);
                }
            }
            // Admitted before another caller tripped the breaker
            CircuitState::Open => {}
        }
    }

    /// Record a failed call
    pub fn record_failure(&self, error: Option<&str>) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        inner.last_failure_time = Some(now);
        if let Some(e) = error {
            inner.last_error = Some(e.to_string());
        }

        match inner.state {
            CircuitState::Closed => {
                inner.call_history.push_back(CallRecord { at: now, success: false });
                inner.prune(now, self.window());
                inner.failure_count += 1;

                let calls = inner.call_history.len() as u32;
                let rate = inner.failure_rate();
                if calls >= self.config.minimum_number_of_calls
                    && (inner.failure_count >= self.config.failure_threshold
                        || rate >= self.config.failure_rate_threshold)
                {
                    tracing::warn!(
                        circuit = %self.name,
                        failures = inner.failure_count,
                        failure_rate = rate,
                        "circuit breaker opened"
                    );
                    self.open(&mut inner, now);
                }
            }
            CircuitState::HalfOpen => {
                tracing::warn!(circuit = %self.name, "probe failed, circuit breaker re-opened");
                self.open(&mut inner, now);
            }
            CircuitState::Open => {}
        }
    }

    /// Run `f` through the breaker, recording its outcome
    pub async fn execute<T, E, F, Fut>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: std::fmt::Display,
    {
        self.try_acquire().map_err(BreakerError::Open)?;

        match f().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure(Some(&e.to_string()));
                Err(BreakerError::Inner(e))
            }
        }
    }

    /// Force the circuit open
    pub fn force_open(&self) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        self.open(&mut inner, now);
    }

    /// Force CLOSED with all counters and history cleared
    pub fn reset(&self) {
        *self.inner.lock() = BreakerInner::new();
        tracing::info!(circuit = %self.name, "circuit breaker reset");
    }

    /// Snapshot of breaker state
    pub fn stats(&self) -> CircuitBreakerStats {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        inner.prune(now, self.window());

        CircuitBreakerStats {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failure_count,
            success_count: inner.success_count,
            calls_in_window: inner.call_history.len(),
            failure_rate: inner.failure_rate(),
            opened_at: inner.opened_at,
            last_failure_time: inner.last_failure_time,
            last_error: inner.last_error.clone(),
            total_calls: self.total_calls.get(),
            rejected_calls: self.rejected_calls.get(),
        }
    }

    fn window(&self) -> Duration {
        Duration::milliseconds(self.config.failure_count_window_ms as i64)
    }

    fn open(&self, inner: &mut BreakerInner, now: DateTime<Utc>) {
        inner.state = CircuitState::Open;
        inner.opened_at = Some(now);
        inner.failure_count = 0;
        inner.success_count = 0;
    }

    fn close(&self, inner: &mut BreakerInner) {
        inner.state = CircuitState::Closed;
        inner.failure_count = 0;
        inner.success_count = 0;
        inner.opened_at = None;
        inner.call_history.clear();
        tracing::info!(circuit = %self.name, "circuit breaker closed");
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("state", &self.state())
            .finish()
    }
}

/// Breaker statistics
#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    /// Breaker name
    pub name: String,
    /// Current state
    pub state: CircuitState,
    /// Consecutive failures counted toward opening
    pub failure_count: u32,
    /// Consecutive HALF_OPEN successes counted toward closing
    pub success_count: u32,
    /// Calls recorded in the failure window
    pub calls_in_window: usize,
    /// Failure share of the calls in the window, 0.0 to 1.0
    pub failure_rate: f64,
    /// When the breaker last opened
    pub opened_at: Option<DateTime<Utc>>,
    /// When the last failure was recorded
    pub last_failure_time: Option<DateTime<Utc>>,
    /// Message of the last recorded failure
    pub last_error: Option<String>,
    /// Calls admitted since creation
    pub total_calls: u64,
    /// Calls refused while OPEN
    pub rejected_calls: u64,
}

/// Name → breaker map; one breaker per protected resource
pub struct CircuitBreakerRegistry {
    config: CircuitBreakerConfig,
    clock: SharedClock,
    breakers: DashMap<String, Arc<CircuitBreaker>>,
}

impl CircuitBreakerRegistry {
    /// Registry whose breakers share `config`
    pub fn new(config: CircuitBreakerConfig, clock: SharedClock) -> Self {
        Self {
            config,
            clock,
            breakers: DashMap::new(),
        }
    }

    /// Fetch the breaker for `name`, creating it with the registry defaults
    pub fn get_or_create(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_or_create_with(name, self.config.clone())
    }

    /// Fetch the breaker for `name`, creating it with `config` if absent
    pub fn get_or_create_with(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        self.breakers
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(CircuitBreaker::with_clock(name, config, self.clock.clone())))
            .clone()
    }

    /// Fetch an existing breaker
    pub fn get(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.get(name).map(|b| b.clone())
    }

    /// Stats for every breaker, sorted by name
    pub fn stats(&self) -> Vec<CircuitBreakerStats> {
        let mut stats: Vec<_> = self.breakers.iter().map(|b| b.stats()).collect();
        stats.sort_by(|a, b| a.name.cmp(&b.name));
        stats
    }

    /// Names of breakers currently open
    pub fn open_circuits(&self) -> Vec<String> {
        self.breakers
            .iter()
            .filter(|b| b.state() == CircuitState::Open)
            .map(|b| b.key().clone())
            .collect()
    }

    /// Reset every breaker
    pub fn reset_all(&self) {
        for breaker in self.breakers.iter() {
            breaker.reset();
        }
    }
}
