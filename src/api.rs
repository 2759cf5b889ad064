//! HTTP API
//!
//! ## Endpoints
//!
//! ### Routing (API key required)
//! - `POST /route` — Route one prompt and return the enriched response
//!
//! ### Operator (API key required)
//! - `GET  /admin/status` — Provider metrics, canary state, rollbacks, circuits
//! - `POST /admin/canary/promote` — Advance one canary phase
//! - `POST /admin/canary/rollback` — Force traffic back to legacy
//!
//! ### Public
//! - `GET  /health` — Liveness
//! - `GET  /metrics` — Prometheus scrape
//!
//! The key is read from the `X-API-Key` header and compared in constant
//! time. Authentication runs before the body is parsed, so unauthenticated
//! callers never reach classification.

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, DefaultBodyLimit, State},
    http::{HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use crate::canary::{CanaryState, RollbackController, RollbackEvent, RolloutState};
use crate::config::ServerConfig;
use crate::coordinator::new_correlation_id;
use crate::metrics::prometheus::{gather_metrics, set_circuit_state};
use crate::metrics::ProviderMetrics;
use crate::resilience::{CircuitStats, ResilientClient};
use crate::routing::RouteRequestBody;
use crate::{Coordinator, ErrorBody, RouterError};

/// Header carrying the caller's API key.
pub const API_KEY_HEADER: &str = "x-api-key";
/// Response header echoing the request's correlation id.
pub const CORRELATION_HEADER: &str = "x-correlation-id";

// ============================================================================
// State
// ============================================================================

/// Shared state for all handlers.
pub struct AppState {
    coordinator: Arc<Coordinator>,
    controller: Arc<RollbackController>,
    client: Arc<ResilientClient>,
    region: String,
    api_key: String,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("coordinator", &self.coordinator)
            .field("region", &self.region)
            .finish_non_exhaustive()
    }
}

impl AppState {
    /// Bundle the runtime objects the handlers need.
    pub fn new(
        coordinator: Arc<Coordinator>,
        controller: Arc<RollbackController>,
        client: Arc<ResilientClient>,
        region: impl Into<String>,
        api_key: impl Into<String>,
    ) -> Self {
        Self {
            coordinator,
            controller,
            client,
            region: region.into(),
            api_key: api_key.into(),
        }
    }
}

/// Body of `GET /admin/status`.
#[derive(Debug, Clone, Serialize)]
pub struct AdminStatus {
    /// Per-provider metrics, sorted by provider.
    pub providers: Vec<ProviderMetrics>,
    /// Current canary state.
    pub canary: CanaryState,
    /// Recorded rollbacks, oldest first.
    pub rollbacks: Vec<RollbackEvent>,
    /// Circuit state per endpoint.
    pub circuits: Vec<CircuitStats>,
    /// Whether failed new-provider requests fall back to legacy.
    pub fallback_enabled: bool,
}

// ============================================================================
// Server
// ============================================================================

/// Build the application router.
///
/// # Panics
///
/// This function never panics.
pub fn router(state: Arc<AppState>, max_request_size: usize) -> Router {
    let protected = Router::new()
        .route("/route", post(route_handler))
        .route("/admin/status", get(admin_status_handler))
        .route("/admin/canary/promote", post(promote_handler))
        .route("/admin/canary/rollback", post(rollback_handler))
        .route_layer(middleware::from_fn_with_state(
            Arc::clone(&state),
            api_key_middleware,
        ));

    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .merge(protected)
        .layer(DefaultBodyLimit::max(max_request_size))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API on `config.host:config.port` until `shutdown` fires.
///
/// # Errors
///
/// Returns an error if the address cannot be bound or the server fails.
///
/// # Panics
///
/// This function never panics.
pub async fn start_server(
    config: &ServerConfig,
    state: Arc<AppState>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = format!("{}:{}", config.host, config.port);
    let app = router(state, config.max_request_size);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("router API listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
            info!("API shutdown signal received");
        })
        .await?;
    Ok(())
}

/// Serve the API until `signal` resolves or the server stops on its own.
///
/// Either way `true` is sent on `shutdown`, so every task watching it stops
/// as well. A server that fails to start, e.g. because the address is in
/// use, returns its error at once instead of waiting for `signal`.
///
/// # Errors
///
/// Returns the server's error, or the join error if the server task panicked.
///
/// # Panics
///
/// This function never panics.
pub async fn run_until<S>(
    config: &ServerConfig,
    state: Arc<AppState>,
    shutdown: &tokio::sync::watch::Sender<bool>,
    signal: S,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>>
where
    S: std::future::Future<Output = ()>,
{
    let mut server = tokio::spawn({
        let config = config.clone();
        let receiver = shutdown.subscribe();
        async move { start_server(&config, state, receiver).await }
    });

    let early_exit = tokio::select! {
        () = signal => None,
        joined = &mut server => Some(joined),
    };
    let _ = shutdown.send(true);

    let joined = match early_exit {
        Some(joined) => {
            warn!("API server stopped before shutdown was requested");
            joined
        }
        None => server.await,
    };
    joined?
}

// ============================================================================
// Middleware
// ============================================================================

/// Compare two byte strings in time independent of where they differ.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

/// Rejects requests without a valid `X-API-Key` with 401.
///
/// # Panics
///
/// This function never panics.
async fn api_key_middleware(
    State(state): State<Arc<AppState>>,
    req: Request<Body>,
    next: Next,
) -> Response {
    let presented = req
        .headers()
        .get(API_KEY_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty());

    let rejection = match presented {
        None => Some("Missing API key"),
        Some(key) if !constant_time_eq(key.as_bytes(), state.api_key.as_bytes()) => {
            Some("Invalid API key")
        }
        Some(_) => None,
    };

    if let Some(message) = rejection {
        warn!(path = %req.uri().path(), reason = message, "request rejected");
        return error_response(
            StatusCode::UNAUTHORIZED,
            RouterError::Unauthorized(message.to_string()).to_body(new_correlation_id()),
        );
    }

    next.run(req).await
}

// ============================================================================
// Errors
// ============================================================================

/// HTTP status for a final routing error.
pub fn status_for(error: &RouterError) -> StatusCode {
    match error {
        RouterError::Validation(_) => StatusCode::BAD_REQUEST,
        RouterError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        RouterError::RateLimited(_) => StatusCode::TOO_MANY_REQUESTS,
        RouterError::Service { .. }
        | RouterError::Rejected { .. }
        | RouterError::Connection(_) => StatusCode::BAD_GATEWAY,
        RouterError::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
        RouterError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        RouterError::Config(_) | RouterError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

fn error_response(status: StatusCode, body: ErrorBody) -> Response {
    let correlation = HeaderValue::from_str(&body.correlation_id).ok();
    let mut response = (status, Json(body)).into_response();
    if let Some(value) = correlation {
        response.headers_mut().insert(CORRELATION_HEADER, value);
    }
    response
}

// ============================================================================
// Handlers
// ============================================================================

/// `POST /route` — Route one prompt.
///
/// # Panics
///
/// This function never panics.
async fn route_handler(
    State(state): State<Arc<AppState>>,
    body: Result<Json<RouteRequestBody>, JsonRejection>,
) -> Response {
    let body = match body {
        Ok(Json(body)) => body,
        Err(rejection) => {
            let status = if rejection.status() == StatusCode::PAYLOAD_TOO_LARGE {
                StatusCode::PAYLOAD_TOO_LARGE
            } else {
                StatusCode::BAD_REQUEST
            };
            let error = RouterError::Validation(rejection.body_text());
            return error_response(status, error.to_body(new_correlation_id()));
        }
    };

    match state.coordinator.route_body(body).await {
        Ok(response) => {
            let correlation = HeaderValue::from_str(&response.correlation_id).ok();
            let mut http = Json(response).into_response();
            if let Some(value) = correlation {
                http.headers_mut().insert(CORRELATION_HEADER, value);
            }
            http
        }
        Err(failure) => error_response(status_for(&failure.error), failure.body),
    }
}

/// `GET /health` — Health check endpoint.
///
/// # Panics
///
/// This function never panics.
async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "region": state.region,
        "service": "rollout-router",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// `GET /metrics` — Prometheus metrics endpoint.
///
/// Circuit gauges are refreshed from the breakers on every scrape.
///
/// # Panics
///
/// This function never panics.
async fn metrics_handler(State(state): State<Arc<AppState>>) -> String {
    for circuit in state.client.circuit_snapshot() {
        set_circuit_state(&circuit.endpoint, circuit.status.as_gauge());
    }
    gather_metrics()
}

/// `GET /admin/status` — Operator snapshot.
///
/// # Panics
///
/// This function never panics.
async fn admin_status_handler(State(state): State<Arc<AppState>>) -> Json<AdminStatus> {
    Json(AdminStatus {
        providers: state.coordinator.metrics().snapshot_all(),
        canary: state.controller.state().snapshot(),
        rollbacks: state.controller.events(),
        circuits: state.client.circuit_snapshot(),
        fallback_enabled: state.coordinator.fallback_enabled(),
    })
}

/// `POST /admin/canary/promote` — Advance one phase; 409 when refused.
///
/// # Panics
///
/// This function never panics.
async fn promote_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.controller.promote() {
        Ok(phase) => Json(serde_json::json!({
            "phase": phase,
            "percentage": phase.percentage(),
        }))
        .into_response(),
        Err(e) => error_response(StatusCode::CONFLICT, e.to_body(new_correlation_id())),
    }
}

/// `POST /admin/canary/rollback` — Manual rollback.
///
/// # Panics
///
/// This function never panics.
async fn rollback_handler(State(state): State<Arc<AppState>>) -> Json<RollbackEvent> {
    Json(state.controller.force_rollback().await)
}
