//! OpenSASE Resilience Framework (OSRF)
//!
//! Failure isolation for outbound calls to external channels.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                     RESILIENCE FRAMEWORK (OSRF)                         │
//! │                                                                         │
//! │   caller ──▶ ┌──────────────┐ ──▶ ┌──────────────┐ ──▶ ┌─────────────┐  │
//! │              │ Rate Limiter │     │   Circuit    │     │    Retry    │  │
//! │              │ (per key)    │     │   Breaker    │     │  Executor   │  │
//! │              └──────────────┘     └──────────────┘     └──────┬──────┘  │
//! │                                                               │         │
//! │                                                               ▼         │
//! │                                                    single attempt (I/O) │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! The breaker wraps the whole retry sequence, so one exhausted retry run
//! counts as one failure toward the breaker, and an open breaker is never
//! retried against.

#![warn(missing_docs)]

pub mod breaker;
pub mod limiter;
pub mod retry;

pub use breaker::{
    BreakerError, BreakerOpenError, CircuitBreaker, CircuitBreakerConfig, CircuitBreakerRegistry,
    CircuitBreakerStats, CircuitState,
};
pub use limiter::{KeyedRateLimiter, SlidingWindow};
pub use retry::{RetryConfig, RetryExecutor, Retryable};
