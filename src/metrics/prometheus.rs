//! Prometheus metrics for the router.
//!
//! ## Usage
//!
//! Call [`init_metrics`] once at process startup. The helper functions
//! (`observe_request`, `set_canary_percentage`, …) are no-ops if
//! `init_metrics` was never called, so routing is always safe to run and
//! observability simply degrades gracefully.
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `router_requests_total` | Counter | `provider`, `model` |
//! | `router_errors_total` | Counter | `provider`, `code` |
//! | `router_request_duration_seconds` | Histogram | `provider` |
//! | `router_cost_usd_total` | Counter | `provider` |
//! | `router_canary_percentage` | Gauge | |
//! | `router_rollbacks_total` | Counter | `metric` |
//! | `router_circuit_state` | Gauge | `endpoint` |
//! | `router_fallbacks_total` | Counter | `reason` |
//! | `router_retries_total` | Counter | `endpoint` |

use ::prometheus::{
    core::Collector, CounterVec, Encoder, HistogramOpts, HistogramVec, IntCounterVec, IntGauge,
    IntGaugeVec, Opts, Registry, TextEncoder,
};
use std::sync::OnceLock;
use std::time::Duration;

use crate::RouterError;

// ── Internal metrics bundle ────────────────────────────────────────────────

/// All Prometheus metrics for the router, bundled together so they can be
/// stored in a single [`OnceLock`] and initialised atomically.
pub struct Metrics {
    /// Registry that owns all metric descriptors.
    pub registry: Registry,
    /// Requests per provider and model.
    pub requests_total: CounterVec,
    /// Failures per provider and error code.
    pub errors_total: CounterVec,
    /// End-to-end latency per provider.
    pub request_duration: HistogramVec,
    /// Accumulated cost per provider.
    pub cost_usd_total: CounterVec,
    /// Current new-provider percentage.
    pub canary_percentage: IntGauge,
    /// Rollbacks by triggering metric.
    pub rollbacks_total: IntCounterVec,
    /// Circuit state per endpoint (0 closed, 1 half-open, 2 open).
    pub circuit_state: IntGaugeVec,
    /// Fallbacks to legacy by the new provider's error code.
    pub fallbacks_total: IntCounterVec,
    /// Backend retries per endpoint.
    pub retries_total: IntCounterVec,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

fn register<C>(registry: &Registry, collector: C) -> Result<C, RouterError>
where
    C: Collector + Clone + 'static,
{
    registry
        .register(Box::new(collector.clone()))
        .map_err(|e| RouterError::Other(format!("metrics registration failed: {e}")))?;
    Ok(collector)
}

fn build_err(e: ::prometheus::Error) -> RouterError {
    RouterError::Other(format!("metrics init failed: {e}"))
}

impl Metrics {
    /// Build a bundle on a fresh registry, prefixing every metric name.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::Other`] if a descriptor is invalid or a name
    /// is registered twice.
    pub fn build(prefix: &str) -> Result<Self, RouterError> {
        let registry = Registry::new();
        let name = |n: &str| format!("{prefix}_{n}");

        let requests_total = register(
            &registry,
            CounterVec::new(
                Opts::new(name("requests_total"), "Requests by provider and model"),
                &["provider", "model"],
            )
            .map_err(build_err)?,
        )?;
        let errors_total = register(
            &registry,
            CounterVec::new(
                Opts::new(name("errors_total"), "Failed requests by provider and code"),
                &["provider", "code"],
            )
            .map_err(build_err)?,
        )?;
        let request_duration = register(
            &registry,
            HistogramVec::new(
                HistogramOpts::new(name("request_duration_seconds"), "End-to-end latency")
                    .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]),
                &["provider"],
            )
            .map_err(build_err)?,
        )?;
        let cost_usd_total = register(
            &registry,
            CounterVec::new(
                Opts::new(name("cost_usd_total"), "Accumulated cost in USD"),
                &["provider"],
            )
            .map_err(build_err)?,
        )?;
        let canary_percentage = register(
            &registry,
            IntGauge::new(name("canary_percentage"), "New-provider traffic percentage")
                .map_err(build_err)?,
        )?;
        let rollbacks_total = register(
            &registry,
            IntCounterVec::new(
                Opts::new(name("rollbacks_total"), "Rollbacks by triggering metric"),
                &["metric"],
            )
            .map_err(build_err)?,
        )?;
        let circuit_state = register(
            &registry,
            IntGaugeVec::new(
                Opts::new(name("circuit_state"), "0 closed, 1 half-open, 2 open"),
                &["endpoint"],
            )
            .map_err(build_err)?,
        )?;

        let fallbacks_total = register(
            &registry,
            IntCounterVec::new(
                Opts::new(name("fallbacks_total"), "Fallbacks to legacy by failure code"),
                &["reason"],
            )
            .map_err(build_err)?,
        )?;
        let retries_total = register(
            &registry,
            IntCounterVec::new(
                Opts::new(name("retries_total"), "Backend retries by endpoint"),
                &["endpoint"],
            )
            .map_err(build_err)?,
        )?;

        Ok(Self {
            registry,
            requests_total,
            errors_total,
            request_duration,
            cost_usd_total,
            canary_percentage,
            rollbacks_total,
            circuit_state,
            fallbacks_total,
            retries_total,
        })
    }

    /// Record one completed or failed request.
    pub fn observe(
        &self,
        provider: &str,
        model: &str,
        latency: Duration,
        cost_usd: f64,
        error: Option<&str>,
    ) {
        if let Ok(c) = self.requests_total.get_metric_with_label_values(&[provider, model]) {
            c.inc();
        }
        if let Ok(h) = self.request_duration.get_metric_with_label_values(&[provider]) {
            h.observe(latency.as_secs_f64());
        }
        if cost_usd > 0.0 {
            if let Ok(c) = self.cost_usd_total.get_metric_with_label_values(&[provider]) {
                c.inc_by(cost_usd);
            }
        }
        if let Some(code) = error {
            if let Ok(c) = self.errors_total.get_metric_with_label_values(&[provider, code]) {
                c.inc();
            }
        }
    }

    /// Encode in the Prometheus text exposition format.
    pub fn encode(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if encoder.encode(&self.registry.gather(), &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

// ── Initialisation ─────────────────────────────────────────────────────────

/// Initialise the global metrics bundle.
///
/// Calling it a second time is a no-op (returns `Ok(())`).
///
/// # Errors
///
/// Returns [`RouterError::Other`] if metric construction or registration
/// fails.
///
/// # Panics
///
/// This function never panics.
pub fn init_metrics() -> Result<(), RouterError> {
    if METRICS.get().is_some() {
        return Ok(());
    }
    let bundle = Metrics::build("router")?;
    // Racing initialisers build identical descriptors; first one wins.
    let _ = METRICS.set(bundle);
    Ok(())
}

fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

// ── Public helper functions ────────────────────────────────────────────────

/// Record one request outcome. No-op before [`init_metrics`].
pub fn observe_request(
    provider: &str,
    model: &str,
    latency: Duration,
    cost_usd: f64,
    error: Option<&str>,
) {
    if let Some(m) = metrics() {
        m.observe(provider, model, latency, cost_usd, error);
    }
}

/// Publish the current canary percentage. No-op before [`init_metrics`].
pub fn set_canary_percentage(percentage: u8) {
    if let Some(m) = metrics() {
        m.canary_percentage.set(i64::from(percentage));
    }
}

/// Count a rollback. No-op before [`init_metrics`].
pub fn inc_rollback(metric: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.rollbacks_total.get_metric_with_label_values(&[metric]) {
            c.inc();
        }
    }
}

/// Publish an endpoint's circuit state. No-op before [`init_metrics`].
pub fn set_circuit_state(endpoint: &str, value: i64) {
    if let Some(m) = metrics() {
        if let Ok(g) = m.circuit_state.get_metric_with_label_values(&[endpoint]) {
            g.set(value);
        }
    }
}

/// Count a fallback to legacy. No-op before [`init_metrics`].
pub fn inc_fallback(reason: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.fallbacks_total.get_metric_with_label_values(&[reason]) {
            c.inc();
        }
    }
}

/// Count a backend retry. No-op before [`init_metrics`].
pub fn inc_retry(endpoint: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = m.retries_total.get_metric_with_label_values(&[endpoint]) {
            c.inc();
        }
    }
}

/// Current fallback count for `reason`, or 0 before [`init_metrics`].
pub fn fallback_count(reason: &str) -> u64 {
    metrics()
        .and_then(|m| m.fallbacks_total.get_metric_with_label_values(&[reason]).ok())
        .map_or(0, |c| c.get())
}

/// Current retry count for `endpoint`, or 0 before [`init_metrics`].
pub fn retry_count(endpoint: &str) -> u64 {
    metrics()
        .and_then(|m| m.retries_total.get_metric_with_label_values(&[endpoint]).ok())
        .map_or(0, |c| c.get())
}

/// Current circuit gauge for `endpoint`, or `None` before [`init_metrics`].
pub fn circuit_state_value(endpoint: &str) -> Option<i64> {
    metrics()
        .and_then(|m| m.circuit_state.get_metric_with_label_values(&[endpoint]).ok())
        .map(|g| g.get())
}

/// Gather and encode all metrics in the Prometheus text format.
///
/// Returns an empty string if metrics have not been initialised or
/// encoding fails.
///
/// # Panics
///
/// This function never panics.
pub fn gather_metrics() -> String {
    metrics().map_or_else(String::new, Metrics::encode)
}
