//! Request coordinator.
//!
//! [`Coordinator::route`] is the single entry point callers use:
//!
//! ```text
//! split (sticky) → chosen provider ──ok──────────────────────────┐
//!                       │ err, new provider, fallback on          │
//!                       └──→ legacy provider ──ok── mark fallback ┤
//!                                        └─err── RouteFailure     ↓
//!                                               enrich · record metrics
//! ```
//!
//! Every attempt, including the failed one before a fallback, is recorded
//! against the provider that made it.

use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{info, warn};

use crate::canary::TrafficSplitter;
use crate::metrics::prometheus::inc_fallback;
use crate::metrics::{MetricsCollector, Outcome};
use crate::provider::Provider;
use crate::routing::{RouteRequest, RouteRequestBody, RouteResponse};
use crate::{RouteFailure, RouterError};

/// Short id tying together the log lines and the response of one request.
pub fn new_correlation_id() -> String {
    uuid::Uuid::new_v4().simple().to_string().chars().take(8).collect()
}

/// Composes splitter, providers and metrics.
pub struct Coordinator {
    splitter: TrafficSplitter,
    new_provider: Arc<dyn Provider>,
    legacy_provider: Arc<dyn Provider>,
    metrics: MetricsCollector,
    fallback_enabled: bool,
}

impl std::fmt::Debug for Coordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Coordinator")
            .field("splitter", &self.splitter)
            .field("new_provider", &self.new_provider.name())
            .field("legacy_provider", &self.legacy_provider.name())
            .field("fallback_enabled", &self.fallback_enabled)
            .finish()
    }
}

impl Coordinator {
    /// Coordinator with fallback enabled.
    pub fn new(
        splitter: TrafficSplitter,
        new_provider: Arc<dyn Provider>,
        legacy_provider: Arc<dyn Provider>,
        metrics: MetricsCollector,
    ) -> Self {
        Self {
            splitter,
            new_provider,
            legacy_provider,
            metrics,
            fallback_enabled: true,
        }
    }

    /// Enable or disable falling back to legacy when the new provider fails.
    pub fn with_fallback(mut self, enabled: bool) -> Self {
        self.fallback_enabled = enabled;
        self
    }

    /// Route one validated request.
    ///
    /// # Errors
    ///
    /// Returns a [`RouteFailure`] carrying the structured error body when
    /// the chosen provider fails and no fallback answers.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub async fn route(&self, request: RouteRequest) -> Result<RouteResponse, RouteFailure> {
        let correlation_id = new_correlation_id();
        let started = Instant::now();

        let use_new = self.splitter.should_use_new_provider(request.stickiness_key());
        let primary = if use_new {
            &self.new_provider
        } else {
            &self.legacy_provider
        };

        let first = self.attempt(primary.as_ref(), &request).await;
        let (mut response, fallback_reason) = match first {
            Ok(response) => (response, None),
            Err(err) if use_new && self.fallback_enabled => {
                warn!(
                    correlation_id = %correlation_id,
                    provider = primary.name(),
                    error = %err,
                    "new provider failed, falling back to legacy"
                );
                inc_fallback(err.code());
                match self.attempt(self.legacy_provider.as_ref(), &request).await {
                    Ok(response) => (response, Some(err.to_string())),
                    Err(fallback_err) => {
                        warn!(
                            correlation_id = %correlation_id,
                            primary_error = %err,
                            error = %fallback_err,
                            "fallback provider failed"
                        );
                        return Err(RouteFailure::new(fallback_err, correlation_id));
                    }
                }
            }
            Err(err) => {
                warn!(
                    correlation_id = %correlation_id,
                    provider = primary.name(),
                    error = %err,
                    "request failed"
                );
                return Err(RouteFailure::new(err, correlation_id));
            }
        };

        response.fallback_used = fallback_reason.is_some();
        response.fallback_reason = fallback_reason;
        response.correlation_id = correlation_id;
        response.latency_ms = millis(started.elapsed());

        info!(
            correlation_id = %response.correlation_id,
            provider = %response.provider,
            model = %response.model,
            deployment = %response.deployment,
            region = %response.region,
            latency_ms = response.latency_ms,
            cost_usd = response.cost_usd,
            fallback_used = response.fallback_used,
            "request routed"
        );
        Ok(response)
    }

    /// Validate a raw body and route it.
    ///
    /// # Errors
    ///
    /// Validation failures are returned with a fresh correlation id before
    /// any provider is consulted; otherwise see [`Coordinator::route`].
    pub async fn route_body(&self, body: RouteRequestBody) -> Result<RouteResponse, RouteFailure> {
        let request = RouteRequest::try_from(body)
            .map_err(|e| RouteFailure::new(e, new_correlation_id()))?;
        self.route(request).await
    }

    /// Metrics collector shared with the rollback controller.
    pub fn metrics(&self) -> &MetricsCollector {
        &self.metrics
    }

    /// The traffic splitter.
    pub fn splitter(&self) -> &TrafficSplitter {
        &self.splitter
    }

    /// Whether fallback to legacy is enabled.
    pub fn fallback_enabled(&self) -> bool {
        self.fallback_enabled
    }

    async fn attempt(
        &self,
        provider: &dyn Provider,
        request: &RouteRequest,
    ) -> Result<RouteResponse, RouterError> {
        let started = Instant::now();
        let result = provider.handle(request).await;
        let latency = started.elapsed();

        match result {
            Ok(mut response) => {
                self.metrics.record(
                    provider.name(),
                    &Outcome::success(response.model.clone(), latency, response.cost_usd),
                );
                response.provider = provider.name().to_string();
                Ok(response)
            }
            Err(err) => {
                self.metrics
                    .record(provider.name(), &Outcome::failure(latency, err.code()));
                Err(err)
            }
        }
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
