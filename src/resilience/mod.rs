//! # Stage: Resilient Backend Calls
//!
//! ## Responsibility
//! Wrap every backend invocation with a bounded timeout, retry with
//! exponential backoff for transient failures, and a per-endpoint circuit
//! breaker.
//!
//! ## Guarantees
//! - At most `max_retries` retries per call, with non-decreasing delays.
//! - Only transient error classes are retried; an open circuit is never
//!   retried.
//! - Breaker state is per endpoint and guarded by its own lock; no global
//!   lock on the request path.
//! - A timed-out attempt is dropped, releasing its connection.
//!
//! ## NOT Responsible For
//! - Choosing the deployment (that belongs to `routing`)
//! - Cross-provider fallback (that belongs to `coordinator`)

pub mod circuit_breaker;
pub mod client;
pub mod retry;

// Re-exports for convenience
pub use circuit_breaker::{
    CircuitBreaker, CircuitBreakerError, CircuitBreakerRegistry, CircuitStats, CircuitStatus,
};
pub use client::{ResilienceSettings, ResilientClient};
pub use retry::{RetryPolicy, RetryStrategy};
