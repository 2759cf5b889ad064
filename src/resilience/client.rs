//! Resilient backend client.
//!
//! Wraps any backend call as `retry(breaker(timeout(call)))`:
//!
//! - each attempt is bounded by `call_timeout`; an elapsed timeout becomes
//!   [`RouterError::Timeout`] and the in-flight future is dropped
//! - each attempt passes through the endpoint's circuit breaker; only
//!   transient errors (timeouts included) count against it, so caller-caused
//!   rejections never open a circuit, and an open circuit fails fast with
//!   [`RouterError::CircuitOpen`]
//! - transient failures are retried with backoff; `CircuitOpen` and
//!   non-transient errors are returned immediately

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use super::circuit_breaker::{CircuitBreakerError, CircuitBreakerRegistry, CircuitStats};
use super::retry::RetryPolicy;
use crate::backend::{Completion, CompletionRequest, ModelBackend};
use crate::metrics::prometheus::inc_retry;
use crate::RouterError;

/// Resilience settings.
#[derive(Debug, Clone, PartialEq)]
pub struct ResilienceSettings {
    /// Retry schedule.
    pub retry: RetryPolicy,
    /// Consecutive failures that open an endpoint's circuit.
    pub failure_threshold: usize,
    /// How long an open circuit rejects calls.
    pub cooldown: Duration,
    /// Bound on a single attempt.
    pub call_timeout: Duration,
}

impl Default for ResilienceSettings {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            failure_threshold: 3,
            cooldown: Duration::from_secs(30),
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// Timeout, retry and per-endpoint circuit breaking around a backend.
///
/// # Panics
///
/// This type and its methods never panic.
pub struct ResilientClient {
    backend: Arc<dyn ModelBackend>,
    retry: RetryPolicy,
    breakers: CircuitBreakerRegistry,
    call_timeout: Duration,
}

impl std::fmt::Debug for ResilientClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResilientClient")
            .field("retry", &self.retry)
            .field("breakers", &self.breakers)
            .field("call_timeout", &self.call_timeout)
            .finish()
    }
}

impl ResilientClient {
    /// Wrap `backend` with `settings`.
    pub fn new(backend: Arc<dyn ModelBackend>, settings: ResilienceSettings) -> Self {
        Self {
            backend,
            retry: settings.retry,
            breakers: CircuitBreakerRegistry::new(settings.failure_threshold, settings.cooldown),
            call_timeout: settings.call_timeout,
        }
    }

    /// Call the backend for `request.deployment`.
    ///
    /// # Errors
    ///
    /// The final [`RouterError`] after retries, or
    /// [`RouterError::CircuitOpen`] if the endpoint's breaker is open.
    pub async fn invoke(&self, request: &CompletionRequest) -> Result<Completion, RouterError> {
        let backend = Arc::clone(&self.backend);
        self.call(&request.deployment, || {
            let backend = Arc::clone(&backend);
            async move { backend.complete(request).await }
        })
        .await
    }

    /// Apply timeout, breaker and retry to an arbitrary operation against
    /// `endpoint`.
    ///
    /// # Errors
    ///
    /// See [`ResilientClient::invoke`].
    pub async fn call<T, F, Fut>(&self, endpoint: &str, mut op: F) -> Result<T, RouterError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, RouterError>>,
    {
        let breaker = self.breakers.get(endpoint);
        let timeout = self.call_timeout;
        let timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        let mut attempts = 0usize;

        self.retry
            .retry_if(
                || {
                    attempts += 1;
                    if attempts > 1 {
                        inc_retry(endpoint);
                    }
                    let attempt = op();
                    let breaker = breaker.clone();
                    async move {
                        let outcome = breaker
                            .call_if(
                                || async move {
                                    match tokio::time::timeout(timeout, attempt).await {
                                        Ok(result) => result,
                                        Err(_) => {
                                            warn!(endpoint, timeout_ms, "backend call timed out");
                                            Err(RouterError::Timeout(timeout_ms))
                                        }
                                    }
                                },
                                RouterError::is_transient,
                            )
                            .await;
                        match outcome {
                            Ok(value) => Ok(value),
                            Err(CircuitBreakerError::Failed(e)) => Err(e),
                            Err(CircuitBreakerError::Open) => {
                                debug!(endpoint, "short-circuited by open breaker");
                                Err(RouterError::CircuitOpen {
                                    endpoint: endpoint.to_string(),
                                })
                            }
                        }
                    }
                },
                RouterError::is_transient,
            )
            .await
    }

    /// Breaker stats for every endpoint seen so far.
    pub fn circuit_snapshot(&self) -> Vec<CircuitStats> {
        self.breakers.snapshot()
    }

    /// Breaker registry (operator tooling and tests).
    pub fn breakers(&self) -> &CircuitBreakerRegistry {
        &self.breakers
    }
}
