//! Per-provider request metrics.
//!
//! Counters and cost are atomics; latency samples go into a bounded ring
//! behind a short-held mutex. Percentiles are computed on
//! [`MetricsCollector::snapshot`], which copies the ring and sorts the copy
//! after releasing the lock, so the recording path never waits on a sort.

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::prometheus::observe_request;
use crate::routing::pricing::{micro_to_usd, usd_to_micro};

/// Latency samples retained per provider by default.
pub const DEFAULT_WINDOW: usize = 1_000;

/// Outcome of one provider call, as recorded by the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct Outcome {
    /// Model that handled (or was meant to handle) the call, if known.
    pub model: Option<String>,
    /// Wall-clock latency of the call.
    pub latency: Duration,
    /// Cost in USD; zero for failures.
    pub cost_usd: f64,
    /// Error code for failures, `None` on success.
    pub error: Option<&'static str>,
}

impl Outcome {
    /// Successful call.
    pub fn success(model: impl Into<String>, latency: Duration, cost_usd: f64) -> Self {
        Self {
            model: Some(model.into()),
            latency,
            cost_usd: cost_usd.max(0.0),
            error: None,
        }
    }

    /// Failed call with a machine-readable error code.
    pub fn failure(latency: Duration, error_code: &'static str) -> Self {
        Self {
            model: None,
            latency,
            cost_usd: 0.0,
            error: Some(error_code),
        }
    }

    /// `true` if the call succeeded.
    pub fn is_success(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Default)]
struct Counters {
    requests: AtomicU64,
    errors: AtomicU64,
    cost_micro: AtomicU64,
}

impl Counters {
    fn record(&self, outcome: &Outcome) {
        self.requests.fetch_add(1, Ordering::Relaxed);
        if outcome.is_success() {
            self.cost_micro
                .fetch_add(usd_to_micro(outcome.cost_usd), Ordering::Relaxed);
        } else {
            self.errors.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn reset(&self) {
        self.requests.store(0, Ordering::Relaxed);
        self.errors.store(0, Ordering::Relaxed);
        self.cost_micro.store(0, Ordering::Relaxed);
    }
}

#[derive(Debug)]
struct ProviderStats {
    totals: Counters,
    per_model: DashMap<String, Counters>,
    latencies: Mutex<VecDeque<u64>>,
    window: usize,
}

impl ProviderStats {
    fn new(window: usize) -> Self {
        Self {
            totals: Counters::default(),
            per_model: DashMap::new(),
            latencies: Mutex::new(VecDeque::with_capacity(window.min(DEFAULT_WINDOW))),
            window,
        }
    }
}

/// Latency percentiles over the retained window, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct LatencySummary {
    /// Median.
    pub p50_ms: u64,
    /// 95th percentile.
    pub p95_ms: u64,
    /// 99th percentile.
    pub p99_ms: u64,
    /// Samples the percentiles were computed from.
    pub samples: usize,
}

/// Per-model slice of a provider's metrics.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ModelMetrics {
    /// Calls attributed to the model.
    pub request_count: u64,
    /// Failed calls.
    pub error_count: u64,
    /// Accumulated cost in USD.
    pub total_cost_usd: f64,
}

/// Point-in-time metrics for one provider.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProviderMetrics {
    /// Provider name.
    pub provider: String,
    /// Calls recorded since start or last reset.
    pub request_count: u64,
    /// Failed calls.
    pub error_count: u64,
    /// `error_count / request_count`, 0 when idle.
    pub error_rate: f64,
    /// Latency percentiles.
    pub latency: LatencySummary,
    /// Accumulated cost in USD.
    pub total_cost_usd: f64,
    /// Cost divided by successful calls, 0 when none.
    pub avg_cost_per_request_usd: f64,
    /// Breakdown by model; failures before a model was chosen are not listed.
    pub per_model: BTreeMap<String, ModelMetrics>,
}

/// Aggregates call outcomes per provider.
///
/// Provider entries are created on first record and never removed;
/// [`MetricsCollector::reset`] zeroes one in place.
///
/// # Panics
///
/// This type and its methods never panic.
#[derive(Debug, Clone)]
pub struct MetricsCollector {
    providers: Arc<DashMap<String, ProviderStats>>,
    window: usize,
}

impl MetricsCollector {
    /// Collector retaining [`DEFAULT_WINDOW`] latency samples per provider.
    pub fn new() -> Self {
        Self::with_window(DEFAULT_WINDOW)
    }

    /// Collector retaining `window` latency samples per provider (min 1).
    pub fn with_window(window: usize) -> Self {
        Self {
            providers: Arc::new(DashMap::new()),
            window: window.max(1),
        }
    }

    /// Record one outcome for `provider`.
    pub fn record(&self, provider: &str, outcome: &Outcome) {
        let latency_ms = u64::try_from(outcome.latency.as_millis()).unwrap_or(u64::MAX);

        {
            let stats = self
                .providers
                .entry(provider.to_string())
                .or_insert_with(|| ProviderStats::new(self.window));
            let stats = stats.downgrade();

            stats.totals.record(outcome);
            if let Some(model) = &outcome.model {
                stats
                    .per_model
                    .entry(model.clone())
                    .or_default()
                    .record(outcome);
            }

            let mut ring = stats.latencies.lock();
            if ring.len() >= stats.window {
                ring.pop_front();
            }
            ring.push_back(latency_ms);
        }

        observe_request(
            provider,
            outcome.model.as_deref().unwrap_or("none"),
            outcome.latency,
            outcome.cost_usd,
            outcome.error,
        );
    }

    /// Metrics for `provider`; zeroed if nothing was recorded yet.
    pub fn snapshot(&self, provider: &str) -> ProviderMetrics {
        let Some(stats) = self.providers.get(provider) else {
            return ProviderMetrics {
                provider: provider.to_string(),
                ..ProviderMetrics::default()
            };
        };

        let samples: Vec<u64> = stats.latencies.lock().iter().copied().collect();
        let request_count = stats.totals.requests.load(Ordering::Relaxed);
        let error_count = stats.totals.errors.load(Ordering::Relaxed);
        let cost_micro = stats.totals.cost_micro.load(Ordering::Relaxed);
        let per_model = stats
            .per_model
            .iter()
            .map(|entry| {
                let c = entry.value();
                (
                    entry.key().clone(),
                    ModelMetrics {
                        request_count: c.requests.load(Ordering::Relaxed),
                        error_count: c.errors.load(Ordering::Relaxed),
                        total_cost_usd: micro_to_usd(c.cost_micro.load(Ordering::Relaxed)),
                    },
                )
            })
            .collect();
        drop(stats);

        let successes = request_count.saturating_sub(error_count);

        ProviderMetrics {
            provider: provider.to_string(),
            request_count,
            error_count,
            error_rate: ratio(error_count, request_count),
            latency: summarize(samples),
            total_cost_usd: micro_to_usd(cost_micro),
            avg_cost_per_request_usd: if successes == 0 {
                0.0
            } else {
                micro_to_usd(cost_micro) / successes as f64
            },
            per_model,
        }
    }

    /// Snapshots of every provider seen, sorted by name.
    pub fn snapshot_all(&self) -> Vec<ProviderMetrics> {
        let mut names: Vec<String> = self.providers.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names.iter().map(|n| self.snapshot(n)).collect()
    }

    /// Zero `provider`'s counters and latency window, opening a fresh
    /// evaluation window.
    ///
    /// Counters and the latency window are cleared one after the other, not
    /// atomically. A `record` racing with a reset may land in only one of
    /// them, so the next snapshot can be off by that one outcome. Resets only
    /// happen at phase transitions.
    pub fn reset(&self, provider: &str) {
        if let Some(stats) = self.providers.get(provider) {
            stats.totals.reset();
            stats.per_model.clear();
            stats.latencies.lock().clear();
        }
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

fn ratio(num: u64, den: u64) -> f64 {
    if den == 0 {
        0.0
    } else {
        num as f64 / den as f64
    }
}

/// Nearest-rank percentiles of `samples`.
fn summarize(mut samples: Vec<u64>) -> LatencySummary {
    if samples.is_empty() {
        return LatencySummary::default();
    }
    samples.sort_unstable();
    LatencySummary {
        p50_ms: percentile(&samples, 50.0),
        p95_ms: percentile(&samples, 95.0),
        p99_ms: percentile(&samples, 99.0),
        samples: samples.len(),
    }
}

/// Nearest-rank percentile of an ascending, non-empty slice.
fn percentile(sorted: &[u64], p: f64) -> u64 {
    let rank = ((p / 100.0) * sorted.len() as f64).ceil() as usize;
    let idx = rank.saturating_sub(1).min(sorted.len().saturating_sub(1));
    sorted.get(idx).copied().unwrap_or(0)
}
