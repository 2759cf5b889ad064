//! Rollback controller.
//!
//! Runs on its own interval, never on the request path. Each check reads a
//! [`ProviderMetrics`] snapshot for the new provider and either rolls the
//! rollout back to 0%, advances it one phase, or leaves it alone. The legacy
//! provider is watched too: it has nowhere to roll back to, so a breach that
//! persists across several checks only raises a warning alert.
//!
//! Every phase change clears the new provider's metrics so the next
//! evaluation window only reflects traffic served at the new percentage.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::state::{CanaryPhase, RolloutState, SharedCanaryState};
use crate::alerting::{Alert, AlertDispatcher, Severity};
use crate::metrics::prometheus::{inc_rollback, set_canary_percentage};
use crate::metrics::{MetricsCollector, ProviderMetrics};
use crate::provider::{LEGACY_PROVIDER, NEW_PROVIDER};
use crate::RouterError;

/// Metric name recorded for operator-initiated rollbacks.
pub const MANUAL_ROLLBACK: &str = "manual";

// ── Thresholds ─────────────────────────────────────────────────────────────

/// Health limits for a provider.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RolloutThresholds {
    /// Maximum tolerated error rate, 0.0–1.0.
    pub error_rate: f64,
    /// Ceiling for p95 latency in milliseconds.
    pub p95_latency_ms: u64,
    /// Budget for the average cost of a successful request, in USD.
    pub max_cost_per_request_usd: f64,
    /// Requests required in the window before any limit is judged.
    pub min_requests: u64,
}

impl Default for RolloutThresholds {
    fn default() -> Self {
        Self {
            error_rate: 0.05,
            p95_latency_ms: 5_000,
            max_cost_per_request_usd: 0.05,
            min_requests: 20,
        }
    }
}

/// A limit exceeded by a metrics snapshot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Breach {
    /// `"error_rate"`, `"p95_latency"` or `"cost_per_request"`.
    pub metric: &'static str,
    /// Observed value.
    pub value: f64,
    /// Limit it exceeded.
    pub threshold: f64,
}

/// First limit `metrics` exceeds, checked in the order error rate, p95
/// latency, cost per request. Limits are exclusive: a value equal to its
/// threshold is healthy.
///
/// Callers gate on [`RolloutThresholds::min_requests`] before calling.
pub fn evaluate(metrics: &ProviderMetrics, thresholds: &RolloutThresholds) -> Option<Breach> {
    if metrics.error_rate > thresholds.error_rate {
        return Some(Breach {
            metric: "error_rate",
            value: metrics.error_rate,
            threshold: thresholds.error_rate,
        });
    }
    if metrics.latency.samples > 0 && metrics.latency.p95_ms > thresholds.p95_latency_ms {
        return Some(Breach {
            metric: "p95_latency",
            value: metrics.latency.p95_ms as f64,
            threshold: thresholds.p95_latency_ms as f64,
        });
    }
    if metrics.avg_cost_per_request_usd > thresholds.max_cost_per_request_usd {
        return Some(Breach {
            metric: "cost_per_request",
            value: metrics.avg_cost_per_request_usd,
            threshold: thresholds.max_cost_per_request_usd,
        });
    }
    None
}

// ── Settings ───────────────────────────────────────────────────────────────

/// Controller behaviour.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerSettings {
    /// Limits applied to both providers.
    pub thresholds: RolloutThresholds,
    /// Time a phase must run without a breach before auto-advancing.
    pub healthy_duration: Duration,
    /// Minimum time between a rollback and the next promotion.
    pub rollback_cooldown: Duration,
    /// Advance `canary_10` and `canary_50` automatically once healthy.
    pub auto_advance: bool,
    /// Rollback events retained for inspection.
    pub max_events: usize,
    /// Consecutive breaching checks of the legacy provider before warning.
    pub sustained_breach_checks: u32,
    /// Interval of the background health monitor.
    pub check_interval: Duration,
}

impl Default for ControllerSettings {
    fn default() -> Self {
        Self {
            thresholds: RolloutThresholds::default(),
            healthy_duration: Duration::from_secs(24 * 60 * 60),
            rollback_cooldown: Duration::from_secs(60 * 60),
            auto_advance: true,
            max_events: 1_000,
            sustained_breach_checks: 3,
            check_interval: Duration::from_secs(60),
        }
    }
}

// ── Outcomes ───────────────────────────────────────────────────────────────

/// Audit record of one rollback.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackEvent {
    /// When the rollback happened.
    pub timestamp: DateTime<Utc>,
    /// Triggering metric, or `"manual"`.
    pub metric: String,
    /// Observed value of the metric.
    pub value: f64,
    /// Threshold it breached.
    pub threshold: f64,
    /// Phase that was rolled back.
    pub from_phase: CanaryPhase,
    /// New-provider percentage after the rollback.
    pub resulting_percentage: u8,
}

/// Result of one health check.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum HealthDecision {
    /// The new provider receives no traffic; nothing to judge.
    Idle,
    /// Too few requests in the window to judge.
    InsufficientData {
        /// Requests recorded.
        requests: u64,
        /// Requests required.
        required: u64,
    },
    /// Within limits; no change.
    Healthy,
    /// Healthy for long enough; moved one phase forward.
    Advanced {
        /// Previous phase.
        from: CanaryPhase,
        /// New phase.
        to: CanaryPhase,
    },
    /// A limit was breached; traffic moved back to legacy.
    RolledBack(RollbackEvent),
}

// ── Controller ─────────────────────────────────────────────────────────────

/// Evaluates new-provider health and drives the canary phase.
///
/// The controller is the only writer of [`SharedCanaryState`] besides the
/// admin endpoints, which go through [`RollbackController::promote_at`] and
/// [`RollbackController::force_rollback_at`]. Every transition re-checks the
/// phase under the state lock, so a manual action racing a scheduled check
/// cannot be overwritten by a stale decision.
#[derive(Debug)]
pub struct RollbackController {
    state: Arc<SharedCanaryState>,
    metrics: MetricsCollector,
    alerts: Arc<AlertDispatcher>,
    settings: ControllerSettings,
    events: Mutex<VecDeque<RollbackEvent>>,
    legacy_breach_streak: AtomicU32,
}

impl RollbackController {
    /// Controller over `state`, judging snapshots from `metrics`.
    pub fn new(
        state: Arc<SharedCanaryState>,
        metrics: MetricsCollector,
        alerts: Arc<AlertDispatcher>,
        settings: ControllerSettings,
    ) -> Self {
        set_canary_percentage(state.percentage());
        Self {
            state,
            metrics,
            alerts,
            settings,
            events: Mutex::new(VecDeque::new()),
            legacy_breach_streak: AtomicU32::new(0),
        }
    }

    /// Settings in effect.
    pub fn settings(&self) -> &ControllerSettings {
        &self.settings
    }

    /// Shared rollout state.
    pub fn state(&self) -> &Arc<SharedCanaryState> {
        &self.state
    }

    /// Run one health check now.
    pub async fn check_health(&self) -> HealthDecision {
        self.check_health_at(Utc::now()).await
    }

    /// Run one health check as of `now`.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub async fn check_health_at(&self, now: DateTime<Utc>) -> HealthDecision {
        let snapshot = self.state.snapshot();
        self.state.update(|s| s.last_health_check = Some(now));

        self.watch_legacy(now).await;

        if snapshot.percentage == 0 {
            return HealthDecision::Idle;
        }

        let metrics = self.metrics.snapshot(NEW_PROVIDER);
        let required = self.settings.thresholds.min_requests;
        // No judgment below the floor, even at a 100% error rate.
        if metrics.request_count < required {
            debug!(
                requests = metrics.request_count,
                required, "health check skipped, not enough data"
            );
            return HealthDecision::InsufficientData {
                requests: metrics.request_count,
                required,
            };
        }

        if let Some(breach) = evaluate(&metrics, &self.settings.thresholds) {
            return match self
                .roll_back(snapshot.phase, breach.metric, breach.value, breach.threshold, now)
                .await
            {
                Some(event) => HealthDecision::RolledBack(event),
                // Phase changed under us; judge again next interval.
                None => HealthDecision::Healthy,
            };
        }

        let elapsed = now
            .signed_duration_since(snapshot.phase_started_at)
            .to_std()
            .unwrap_or_default();
        if self.settings.auto_advance
            && snapshot.phase.auto_advances()
            && elapsed >= self.settings.healthy_duration
        {
            if let Some(to) = snapshot.phase.next() {
                if self.transition(snapshot.phase, to, now) {
                    info!(
                        from = %snapshot.phase,
                        to = %to,
                        error_rate = metrics.error_rate,
                        p95_ms = metrics.latency.p95_ms,
                        "canary advanced"
                    );
                    return HealthDecision::Advanced {
                        from: snapshot.phase,
                        to,
                    };
                }
            }
        }

        HealthDecision::Healthy
    }

    /// Promote one phase now.
    ///
    /// # Errors
    ///
    /// See [`RollbackController::promote_at`].
    pub fn promote(&self) -> Result<CanaryPhase, RouterError> {
        self.promote_at(Utc::now())
    }

    /// Promote one phase as of `now`.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::Validation`] when already at `full`, or while
    /// the rollback cooldown is still running.
    pub fn promote_at(&self, now: DateTime<Utc>) -> Result<CanaryPhase, RouterError> {
        let snapshot = self.state.snapshot();
        let Some(to) = snapshot.phase.next() else {
            return Err(RouterError::Validation(format!(
                "cannot promote beyond '{}'",
                snapshot.phase
            )));
        };

        if let Some(at) = snapshot.last_rollback_at {
            let since = now.signed_duration_since(at).to_std().unwrap_or_default();
            if since < self.settings.rollback_cooldown {
                let remaining = self.settings.rollback_cooldown - since;
                return Err(RouterError::Validation(format!(
                    "rollback cooldown active, {} s remaining",
                    remaining.as_secs()
                )));
            }
        }

        if !self.transition(snapshot.phase, to, now) {
            return Err(RouterError::Validation(
                "canary phase changed concurrently, retry".into(),
            ));
        }
        info!(from = %snapshot.phase, to = %to, "canary promoted");
        Ok(to)
    }

    /// Roll back now on operator request.
    pub async fn force_rollback(&self) -> RollbackEvent {
        self.force_rollback_at(Utc::now()).await
    }

    /// Roll back as of `now` on operator request. The event is recorded
    /// with metric `"manual"` even when traffic was already at 0%.
    pub async fn force_rollback_at(&self, now: DateTime<Utc>) -> RollbackEvent {
        loop {
            let phase = self.state.phase();
            if let Some(event) = self.roll_back(phase, MANUAL_ROLLBACK, 0.0, 0.0, now).await {
                return event;
            }
        }
    }

    /// Recorded rollbacks, oldest first.
    pub fn events(&self) -> Vec<RollbackEvent> {
        self.events.lock().iter().cloned().collect()
    }

    /// Spawn the periodic health check.
    ///
    /// The loop runs every `check_interval` until the shutdown signal is
    /// sent or the handle is aborted.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn spawn_health_monitor(
        self: Arc<Self>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let interval = self.settings.check_interval;
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let decision = self.check_health().await;
                        debug!(?decision, "canary health check");
                    }
                    _ = shutdown.changed() => {
                        info!("health monitor shutdown signal received");
                        break;
                    }
                }
            }
        })
    }

    // ── internals ──

    /// Move `from` → `to` if the phase is still `from`.
    fn transition(&self, from: CanaryPhase, to: CanaryPhase, now: DateTime<Utc>) -> bool {
        let moved = self.state.update(|s| {
            if s.phase != from {
                return false;
            }
            s.phase = to;
            s.phase_started_at = now;
            if to == CanaryPhase::Rollback {
                s.last_rollback_at = Some(now);
            }
            true
        });
        if moved {
            self.metrics.reset(NEW_PROVIDER);
            set_canary_percentage(to.percentage());
        }
        moved
    }

    async fn roll_back(
        &self,
        from: CanaryPhase,
        metric: &str,
        value: f64,
        threshold: f64,
        now: DateTime<Utc>,
    ) -> Option<RollbackEvent> {
        if !self.transition(from, CanaryPhase::Rollback, now) {
            return None;
        }

        let event = RollbackEvent {
            timestamp: now,
            metric: metric.to_string(),
            value,
            threshold,
            from_phase: from,
            resulting_percentage: CanaryPhase::Rollback.percentage(),
        };
        error!(
            metric = %event.metric,
            value,
            threshold,
            from = %from,
            "canary rolled back"
        );
        inc_rollback(metric);

        {
            let mut events = self.events.lock();
            if events.len() >= self.settings.max_events.max(1) {
                events.pop_front();
            }
            events.push_back(event.clone());
        }

        let message = if metric == MANUAL_ROLLBACK {
            format!("canary manually rolled back from {from}")
        } else {
            format!("canary rolled back from {from}: {metric} {value:.4} exceeded {threshold:.4}")
        };
        self.alerts
            .notify(Alert {
                key: format!("rollback:{metric}"),
                severity: Severity::Critical,
                message,
                metric: metric.to_string(),
                value,
                threshold,
                timestamp: now,
            })
            .await;

        Some(event)
    }

    async fn watch_legacy(&self, now: DateTime<Utc>) {
        let metrics = self.metrics.snapshot(LEGACY_PROVIDER);
        if metrics.request_count < self.settings.thresholds.min_requests {
            return;
        }
        let Some(breach) = evaluate(&metrics, &self.settings.thresholds) else {
            self.legacy_breach_streak.store(0, Ordering::Relaxed);
            return;
        };

        let streak = self.legacy_breach_streak.fetch_add(1, Ordering::Relaxed) + 1;
        warn!(metric = breach.metric, value = breach.value, streak, "legacy provider over threshold");
        if streak >= self.settings.sustained_breach_checks.max(1) {
            self.alerts
                .notify(Alert {
                    key: format!("sustained:{LEGACY_PROVIDER}:{}", breach.metric),
                    severity: Severity::Warning,
                    message: format!(
                        "{LEGACY_PROVIDER} provider {} {:.4} above {:.4} for {streak} checks",
                        breach.metric, breach.value, breach.threshold
                    ),
                    metric: breach.metric.to_string(),
                    value: breach.value,
                    threshold: breach.threshold,
                    timestamp: now,
                })
                .await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alerting::MemoryAlertSink;
    use crate::metrics::Outcome;

    struct Fixture {
        controller: RollbackController,
        state: Arc<SharedCanaryState>,
        metrics: MetricsCollector,
        sink: Arc<MemoryAlertSink>,
    }

    fn fixture(phase: CanaryPhase, t0: DateTime<Utc>) -> Fixture {
        let state = Arc::new(SharedCanaryState::new(phase, t0));
        let metrics = MetricsCollector::new();
        let sink = Arc::new(MemoryAlertSink::new());
        let alerts = Arc::new(AlertDispatcher::new(
            vec![sink.clone()],
            Duration::from_secs(900),
        ));
        let controller = RollbackController::new(
            state.clone(),
            metrics.clone(),
            alerts,
            ControllerSettings::default(),
        );
        Fixture {
            controller,
            state,
            metrics,
            sink,
        }
    }

    fn load(metrics: &MetricsCollector, provider: &str, total: u32, errors: u32, latency_ms: u64) {
        for i in 0..total {
            let outcome = if i < errors {
                Outcome::failure(Duration::from_millis(latency_ms), "service_error")
            } else {
                Outcome::success("Llama-3.3-70B", Duration::from_millis(latency_ms), 0.001)
            };
            metrics.record(provider, &outcome);
        }
    }

    fn hours(h: i64) -> chrono::Duration {
        chrono::Duration::hours(h)
    }

    #[test]
    fn test_evaluate_order_and_exclusive_limits() {
        let t = RolloutThresholds::default();
        let mut m = ProviderMetrics {
            error_rate: 0.05,
            ..ProviderMetrics::default()
        };
        assert_eq!(evaluate(&m, &t), None);

        m.error_rate = 0.06;
        m.latency.samples = 10;
        m.latency.p95_ms = 9_000;
        assert_eq!(evaluate(&m, &t).map(|b| b.metric), Some("error_rate"));

        m.error_rate = 0.0;
        assert_eq!(evaluate(&m, &t).map(|b| b.metric), Some("p95_latency"));

        m.latency.p95_ms = 100;
        m.avg_cost_per_request_usd = 0.2;
        assert_eq!(evaluate(&m, &t).map(|b| b.metric), Some("cost_per_request"));
    }

    #[tokio::test]
    async fn test_idle_when_no_canary_traffic() {
        let t0 = Utc::now();
        let f = fixture(CanaryPhase::Initial, t0);
        load(&f.metrics, NEW_PROVIDER, 100, 100, 10);
        assert_eq!(f.controller.check_health_at(t0).await, HealthDecision::Idle);
        assert!(f.controller.events().is_empty());
    }

    #[tokio::test]
    async fn test_insufficient_data_blocks_rollback() {
        let t0 = Utc::now();
        let f = fixture(CanaryPhase::Canary10, t0);
        load(&f.metrics, NEW_PROVIDER, 5, 5, 10);
        assert_eq!(
            f.controller.check_health_at(t0).await,
            HealthDecision::InsufficientData {
                requests: 5,
                required: 20
            }
        );
        assert_eq!(f.state.percentage(), 10);
    }

    #[tokio::test]
    async fn test_healthy_canary_advances_after_healthy_duration() {
        let t0 = Utc::now();
        let f = fixture(CanaryPhase::Canary10, t0);
        load(&f.metrics, NEW_PROVIDER, 100, 1, 1_200);

        assert_eq!(
            f.controller.check_health_at(t0 + hours(12)).await,
            HealthDecision::Healthy
        );
        assert_eq!(
            f.controller.check_health_at(t0 + hours(24)).await,
            HealthDecision::Advanced {
                from: CanaryPhase::Canary10,
                to: CanaryPhase::Canary50
            }
        );
        assert_eq!(f.state.phase(), CanaryPhase::Canary50);
        assert_eq!(f.state.percentage(), 50);
        // fresh window for the new phase
        assert_eq!(f.metrics.snapshot(NEW_PROVIDER).request_count, 0);
    }

    #[tokio::test]
    async fn test_auto_advance_disabled_holds_phase() {
        let t0 = Utc::now();
        let mut f = fixture(CanaryPhase::Canary10, t0);
        f.controller.settings.auto_advance = false;
        load(&f.metrics, NEW_PROVIDER, 100, 0, 100);
        assert_eq!(
            f.controller.check_health_at(t0 + hours(48)).await,
            HealthDecision::Healthy
        );
        assert_eq!(f.state.phase(), CanaryPhase::Canary10);
    }

    #[tokio::test]
    async fn test_error_spike_rolls_back_and_alerts() {
        let t0 = Utc::now();
        let f = fixture(CanaryPhase::Canary50, t0);
        load(&f.metrics, NEW_PROVIDER, 100, 8, 300);

        let event = match f.controller.check_health_at(t0 + hours(1)).await {
            HealthDecision::RolledBack(event) => event,
            other => panic!("expected rollback, got {:?}", other),
        };
        assert_eq!(event.metric, "error_rate");
        assert_eq!(event.from_phase, CanaryPhase::Canary50);
        assert_eq!(event.resulting_percentage, 0);
        assert!((event.value - 0.08).abs() < 1e-9);

        assert_eq!(f.state.percentage(), 0);
        assert_eq!(f.state.phase(), CanaryPhase::Rollback);
        assert_eq!(f.controller.events(), vec![event]);

        let alerts = f.sink.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, Severity::Critical);
        assert_eq!(alerts[0].key, "rollback:error_rate");
    }

    #[tokio::test]
    async fn test_latency_breach_rolls_back() {
        let t0 = Utc::now();
        let f = fixture(CanaryPhase::Full, t0);
        load(&f.metrics, NEW_PROVIDER, 50, 0, 7_500);
        let decision = f.controller.check_health_at(t0).await;
        assert!(
            matches!(&decision, HealthDecision::RolledBack(e) if e.metric == "p95_latency"),
            "{decision:?}"
        );
    }

    #[tokio::test]
    async fn test_promote_rejected_during_cooldown() {
        let t0 = Utc::now();
        let f = fixture(CanaryPhase::Canary10, t0);
        f.controller.force_rollback_at(t0).await;

        let err = f.controller.promote_at(t0 + chrono::Duration::minutes(10));
        assert!(matches!(err, Err(RouterError::Validation(_))));
        assert_eq!(f.state.phase(), CanaryPhase::Rollback);

        let to = f.controller.promote_at(t0 + hours(2)).unwrap();
        assert_eq!(to, CanaryPhase::Canary10);
        assert_eq!(f.state.percentage(), 10);
    }

    #[tokio::test]
    async fn test_promote_from_full_is_rejected() {
        let f = fixture(CanaryPhase::Full, Utc::now());
        assert!(f.controller.promote().is_err());
    }

    #[tokio::test]
    async fn test_manual_rollback_records_event() {
        let t0 = Utc::now();
        let f = fixture(CanaryPhase::Canary50, t0);
        let event = f.controller.force_rollback_at(t0).await;
        assert_eq!(event.metric, MANUAL_ROLLBACK);
        assert_eq!(event.from_phase, CanaryPhase::Canary50);
        assert_eq!(f.state.percentage(), 0);
        assert_eq!(f.controller.events().len(), 1);
    }

    #[tokio::test]
    async fn test_event_log_is_bounded() {
        let t0 = Utc::now();
        let mut f = fixture(CanaryPhase::Canary10, t0);
        f.controller.settings.max_events = 2;
        for i in 0..5 {
            f.controller.force_rollback_at(t0 + hours(i)).await;
        }
        let events = f.controller.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].timestamp, t0 + hours(4));
    }

    #[tokio::test]
    async fn test_sustained_legacy_breach_warns_after_streak() {
        let t0 = Utc::now();
        let f = fixture(CanaryPhase::Initial, t0);
        load(&f.metrics, LEGACY_PROVIDER, 100, 20, 100);

        f.controller.check_health_at(t0).await;
        f.controller.check_health_at(t0 + chrono::Duration::minutes(1)).await;
        assert!(f.sink.alerts().is_empty());

        f.controller.check_health_at(t0 + chrono::Duration::minutes(2)).await;
        let alerts = f.sink.alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].severity, Severity::Warning);
        assert_eq!(alerts[0].key, "sustained:legacy:error_rate");
    }

    #[tokio::test(start_paused = true)]
    async fn test_health_monitor_stops_on_shutdown() {
        let f = fixture(CanaryPhase::Canary50, Utc::now());
        load(&f.metrics, NEW_PROVIDER, 100, 50, 100);
        let controller = Arc::new(f.controller);

        let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
        let handle = Arc::clone(&controller).spawn_health_monitor(shutdown_rx);

        // first tick fires immediately
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(f.state.percentage(), 0);

        let _ = shutdown_tx.send(true);
        assert!(handle.await.is_ok());
    }
}
