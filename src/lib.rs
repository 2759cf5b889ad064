//! # rollout-router
//!
//! Classification-driven model routing with resilient backend calls and a
//! self-protecting canary rollout between two routing implementations.
//!
//! ## Architecture
//!
//! ```text
//! RouteRequest → Coordinator → TrafficSplitter ─┬─ new:    RoutingEngine ─┐
//!                                              └─ legacy: LegacyProvider ┤
//!                         ResilientClient (timeout · retry · breaker) ←──┘
//!                                  ↓
//!                     MetricsCollector ← RollbackController (interval)
//! ```

// ── Lint policy ───────────────────────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(missing_docs)]

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod alerting;
pub mod backend;
pub mod canary;
pub mod config;
pub mod coordinator;
pub mod metrics;
pub mod provider;
pub mod resilience;
pub mod routing;

#[cfg(feature = "web-api")]
pub mod api;

// Re-exports for convenience
pub use backend::{Completion, EchoBackend, HttpBackend, ModelBackend};
pub use canary::{RollbackController, SharedCanaryState, TrafficSplitter};
pub use coordinator::Coordinator;
pub use metrics::MetricsCollector;
pub use resilience::ResilientClient;
pub use routing::{RouteDecision, RouteRequest, RouteResponse, RoutingEngine};

/// Initialise the global tracing subscriber.
///
/// Reads the `LOG_FORMAT` environment variable to choose output format:
/// - `"json"` — structured JSON output for log aggregators
/// - anything else (including unset) — human-readable pretty output
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=info`).
///
/// # Errors
///
/// Returns [`RouterError::Other`] if the global subscriber has already
/// been set (e.g. by a previous call or a test harness).
///
/// # Panics
///
/// This function never panics.
pub fn init_tracing() -> Result<(), RouterError> {
    let format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "pretty".to_string());

    let result = match format.as_str() {
        "json" => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .try_init(),
        _ => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };

    result.map_err(|e| RouterError::Other(format!("tracing init failed: {e}")))
}

/// Top-level router errors.
///
/// Every failure surface (input validation, backend calls, breaker
/// short-circuits, configuration) maps to a variant here. Only the
/// transient classes are retried by the resilient client.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum RouterError {
    /// Caller input is invalid (empty prompt, unknown hint value, …).
    #[error("validation error: {0}")]
    Validation(String),

    /// The caller did not present a valid API key.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The backend answered with a server-side error.
    #[error("service error (status {status}): {message}")]
    Service {
        /// HTTP status returned by the backend.
        status: u16,
        /// Backend error body or description.
        message: String,
    },

    /// The backend asked us to slow down (HTTP 429).
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// The backend rejected the request as malformed (4xx other than 429).
    #[error("backend rejected request (status {status}): {message}")]
    Rejected {
        /// HTTP status returned by the backend.
        status: u16,
        /// Backend error body or description.
        message: String,
    },

    /// The backend did not answer within the call timeout.
    #[error("timed out after {0} ms")]
    Timeout(u64),

    /// The backend endpoint could not be reached.
    #[error("connection error: {0}")]
    Connection(String),

    /// The endpoint's circuit breaker is open; the call was not attempted.
    #[error("circuit open for endpoint '{endpoint}'")]
    CircuitOpen {
        /// Endpoint whose breaker rejected the call.
        endpoint: String,
    },

    /// A configuration value is missing or invalid.
    #[error("configuration error: {0}")]
    Config(String),

    /// Catch-all for errors that do not fit a specific variant.
    #[error("{0}")]
    Other(String),
}

impl RouterError {
    /// Return `true` for failure classes worth retrying: network errors,
    /// 5xx responses, rate-limit signals and timeouts.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Service { .. } | Self::RateLimited(_) | Self::Timeout(_) | Self::Connection(_)
        )
    }

    /// Stable machine-readable error code.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::Unauthorized(_) => "unauthorized",
            Self::Service { .. } => "service_error",
            Self::RateLimited(_) => "rate_limited",
            Self::Rejected { .. } => "backend_rejected",
            Self::Timeout(_) => "timeout_error",
            Self::Connection(_) => "connection_error",
            Self::CircuitOpen { .. } => "circuit_open",
            Self::Config(_) => "config_error",
            Self::Other(_) => "internal_error",
        }
    }

    /// Convert into the structured body returned to callers.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn to_body(&self, correlation_id: impl Into<String>) -> ErrorBody {
        ErrorBody {
            code: self.code().to_string(),
            message: self.to_string(),
            retryable: self.is_transient() || matches!(self, Self::CircuitOpen { .. }),
            correlation_id: correlation_id.into(),
        }
    }
}

/// Structured error handed back to callers in place of a bare failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Machine-readable code, see [`RouterError::code`].
    pub code: String,
    /// Human-readable description.
    pub message: String,
    /// Whether retrying the same request later is sensible.
    pub retryable: bool,
    /// Correlation id of the failed request.
    pub correlation_id: String,
}

/// Final failure of [`Coordinator::route`]: the error plus its structured body.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{error} (correlation_id={})", body.correlation_id)]
pub struct RouteFailure {
    /// The error that ended the request.
    pub error: RouterError,
    /// Caller-facing structured representation.
    pub body: ErrorBody,
}

impl RouteFailure {
    /// Build a failure for `error` tagged with `correlation_id`.
    pub fn new(error: RouterError, correlation_id: impl Into<String>) -> Self {
        let body = error.to_body(correlation_id);
        Self { error, body }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classes_are_retryable() {
        assert!(RouterError::Timeout(100).is_transient());
        assert!(RouterError::Connection("refused".into()).is_transient());
        assert!(RouterError::RateLimited("slow down".into()).is_transient());
        assert!(RouterError::Service {
            status: 503,
            message: "unavailable".into()
        }
        .is_transient());
    }

    #[test]
    fn test_non_transient_classes_are_not_retryable() {
        assert!(!RouterError::Validation("empty".into()).is_transient());
        assert!(!RouterError::Rejected {
            status: 400,
            message: "bad".into()
        }
        .is_transient());
        assert!(!RouterError::CircuitOpen {
            endpoint: "x".into()
        }
        .is_transient());
    }

    #[test]
    fn test_error_body_carries_code_and_correlation_id() {
        let body = RouterError::Timeout(30_000).to_body("abc123");
        assert_eq!(body.code, "timeout_error");
        assert_eq!(body.correlation_id, "abc123");
        assert!(body.retryable);
        assert!(body.message.contains("30000"));
    }

    #[test]
    fn test_validation_error_body_is_not_retryable() {
        let body = RouterError::Validation("prompt cannot be empty".into()).to_body("c1");
        assert_eq!(body.code, "validation_error");
        assert!(!body.retryable);
    }

    #[test]
    fn test_route_failure_display_includes_correlation_id() {
        let failure = RouteFailure::new(RouterError::Connection("refused".into()), "corr-9");
        assert!(failure.to_string().contains("corr-9"));
        assert_eq!(failure.body.code, "connection_error");
    }

    #[test]
    fn test_init_tracing_second_call_returns_err() {
        let _ = init_tracing();
        let result = init_tracing();
        assert!(result.is_err(), "double init must return Err, not panic");
    }
}
