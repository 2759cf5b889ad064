//! # Stage: Metrics
//!
//! ## Responsibility
//! Aggregate per-provider outcomes (counts, error rate, latency percentiles,
//! cost, per-model breakdown) for the rollback controller and operator
//! tooling, and mirror them into a Prometheus registry for scraping.
//!
//! ## Guarantees
//! - Thread-safe: counters are atomics, latency windows use short-held locks.
//! - Bounded: at most `window` latency samples are retained per provider.
//! - Non-blocking: percentiles are computed on snapshot, off the hot path.
//!
//! ## NOT Responsible For
//! - Deciding whether metrics are healthy (that belongs to `canary`)

pub mod collector;
pub mod prometheus;

// Re-exports for convenience
pub use collector::{LatencySummary, MetricsCollector, ModelMetrics, Outcome, ProviderMetrics};
