//! Circuit Breaker
//!
//! Prevents cascading failures by stopping requests to failing endpoints.
//!
//! ## States
//! - **Closed**: normal operation, requests flow through
//! - **Open**: endpoint failing, requests rejected immediately
//! - **Half-Open**: cooldown elapsed, exactly one trial is allowed through
//!
//! The breaker opens once `failure_threshold` consecutive failures have been
//! observed. A successful trial closes it and resets the counter; a failed
//! trial reopens it and restarts the cooldown. With [`CircuitBreaker::call_if`]
//! only errors matching a predicate count as failures; any other error means
//! the endpoint answered and is recorded like a success.
//!
//! Every transition is published to the `router_circuit_state` gauge.
//!
//! State is guarded by a short synchronous mutex that is never held across
//! an `.await`; the protected operation runs outside the lock.
//!
//! ## Usage
//!
//! ```no_run
//! use std::time::Duration;
//! use rollout_router::resilience::{CircuitBreaker, CircuitBreakerError};
//! # #[tokio::main]
//! # async fn main() {
//! let breaker = CircuitBreaker::new("deepseek-r1-us", 3, Duration::from_secs(30));
//!
//! match breaker.call(|| async { Ok::<&str, &str>("completion") }).await {
//!     Ok(result) => println!("{result}"),
//!     Err(CircuitBreakerError::Open) => { /* fail fast */ }
//!     Err(CircuitBreakerError::Failed(e)) => eprintln!("call failed: {e}"),
//! }
//! # }
//! ```

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::metrics::prometheus::set_circuit_state;

/// Current state of a circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitStatus {
    /// Requests flow through normally.
    Closed,
    /// Requests are rejected without calling the operation.
    Open,
    /// One trial request is allowed through to test recovery.
    HalfOpen,
}

impl CircuitStatus {
    /// Numeric encoding for gauges: 0 closed, 1 half-open, 2 open.
    pub fn as_gauge(&self) -> i64 {
        match self {
            Self::Closed => 0,
            Self::HalfOpen => 1,
            Self::Open => 2,
        }
    }
}

/// Circuit breaker errors.
#[derive(Debug, PartialEq)]
pub enum CircuitBreakerError<E> {
    /// Circuit is open (or a trial is already in flight); request rejected.
    Open,
    /// Operation ran and failed.
    Failed(E),
}

#[derive(Debug)]
struct CircuitState {
    status: CircuitStatus,
    consecutive_failures: usize,
    opened_at: Option<Instant>,
    last_transition: Instant,
    trial_in_flight: bool,
}

/// Per-endpoint circuit breaker.
///
/// Cloning is cheap and clones share state.
///
/// # Panics
///
/// This type and its methods never panic.
#[derive(Clone)]
pub struct CircuitBreaker {
    endpoint: Arc<str>,
    state: Arc<Mutex<CircuitState>>,
    failure_threshold: usize,
    cooldown: Duration,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("endpoint", &self.endpoint)
            .field("status", &self.status())
            .field("failure_threshold", &self.failure_threshold)
            .field("cooldown", &self.cooldown)
            .finish()
    }
}

/// Outcome of admission control.
enum Admission {
    Normal,
    Trial,
}

/// Releases the half-open trial slot if the trial future is dropped before
/// reporting an outcome (caller cancellation).
struct TrialGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl Drop for TrialGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.state.lock().trial_in_flight = false;
        }
    }
}

impl CircuitBreaker {
    /// Create a closed breaker.
    ///
    /// # Arguments
    /// * `endpoint` - Name used in logs and errors
    /// * `failure_threshold` - Consecutive failures that open the circuit (min 1)
    /// * `cooldown` - How long to stay open before allowing a trial
    pub fn new(endpoint: impl Into<String>, failure_threshold: usize, cooldown: Duration) -> Self {
        let endpoint: String = endpoint.into();
        set_circuit_state(&endpoint, CircuitStatus::Closed.as_gauge());
        Self {
            endpoint: Arc::from(endpoint),
            state: Arc::new(Mutex::new(CircuitState {
                status: CircuitStatus::Closed,
                consecutive_failures: 0,
                opened_at: None,
                last_transition: Instant::now(),
                trial_in_flight: false,
            })),
            failure_threshold: failure_threshold.max(1),
            cooldown,
        }
    }

    /// Endpoint this breaker protects.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Execute `f` through the breaker.
    ///
    /// # Errors
    ///
    /// [`CircuitBreakerError::Open`] without calling `f` when the circuit is
    /// open or a half-open trial is already running;
    /// [`CircuitBreakerError::Failed`] when `f` fails.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.call_if(f, |_| true).await
    }

    /// Execute `f` through the breaker, counting only errors for which
    /// `is_failure` holds against the endpoint.
    ///
    /// # Errors
    ///
    /// Same as [`CircuitBreaker::call`].
    pub async fn call_if<F, Fut, T, E, P>(
        &self,
        f: F,
        is_failure: P,
    ) -> Result<T, CircuitBreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
    {
        let admission = self.admit().ok_or(CircuitBreakerError::Open)?;

        let mut guard = TrialGuard {
            breaker: self,
            armed: matches!(admission, Admission::Trial),
        };

        let result = f().await;

        guard.armed = false;
        match &result {
            Err(e) if is_failure(e) => self.record_failure(),
            // Success, or an error the endpoint answered with.
            _ => self.record_success(),
        }

        result.map_err(CircuitBreakerError::Failed)
    }

    fn admit(&self) -> Option<Admission> {
        let mut state = self.state.lock();
        match state.status {
            CircuitStatus::Closed => Some(Admission::Normal),
            CircuitStatus::Open => {
                let elapsed = state
                    .opened_at
                    .map(|t| t.elapsed() >= self.cooldown)
                    .unwrap_or(true);
                if elapsed {
                    state.status = CircuitStatus::HalfOpen;
                    state.last_transition = Instant::now();
                    state.trial_in_flight = true;
                    self.publish(CircuitStatus::HalfOpen);
                    info!(endpoint = %self.endpoint, "circuit breaker: half-open, allowing trial");
                    Some(Admission::Trial)
                } else {
                    debug!(endpoint = %self.endpoint, "circuit breaker: request rejected (open)");
                    None
                }
            }
            CircuitStatus::HalfOpen => {
                if state.trial_in_flight {
                    debug!(endpoint = %self.endpoint, "circuit breaker: trial in flight, rejecting");
                    None
                } else {
                    state.trial_in_flight = true;
                    Some(Admission::Trial)
                }
            }
        }
    }

    fn record_success(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures = 0;
        if state.status == CircuitStatus::HalfOpen {
            state.status = CircuitStatus::Closed;
            state.trial_in_flight = false;
            state.opened_at = None;
            state.last_transition = Instant::now();
            self.publish(CircuitStatus::Closed);
            info!(endpoint = %self.endpoint, "circuit breaker: closing (trial succeeded)");
        }
    }

    fn record_failure(&self) {
        let mut state = self.state.lock();
        state.consecutive_failures += 1;

        match state.status {
            CircuitStatus::Closed => {
                if state.consecutive_failures >= self.failure_threshold {
                    let now = Instant::now();
                    state.status = CircuitStatus::Open;
                    state.opened_at = Some(now);
                    state.last_transition = now;
                    self.publish(CircuitStatus::Open);
                    warn!(
                        endpoint = %self.endpoint,
                        failures = state.consecutive_failures,
                        threshold = self.failure_threshold,
                        "circuit breaker: opening (threshold reached)"
                    );
                } else {
                    debug!(
                        endpoint = %self.endpoint,
                        failures = state.consecutive_failures,
                        "circuit breaker: failure recorded"
                    );
                }
            }
            CircuitStatus::HalfOpen => {
                let now = Instant::now();
                state.status = CircuitStatus::Open;
                state.opened_at = Some(now);
                state.last_transition = now;
                state.trial_in_flight = false;
                self.publish(CircuitStatus::Open);
                warn!(endpoint = %self.endpoint, "circuit breaker: reopening (trial failed)");
            }
            // A call admitted before the circuit opened finished late.
            CircuitStatus::Open => {}
        }
    }

    /// Current status. An open circuit whose cooldown has elapsed still
    /// reports `Open` until the next call turns it half-open.
    pub fn status(&self) -> CircuitStatus {
        self.state.lock().status
    }

    /// Snapshot for operator tooling.
    pub fn stats(&self) -> CircuitStats {
        let state = self.state.lock();
        CircuitStats {
            endpoint: self.endpoint.to_string(),
            status: state.status,
            consecutive_failures: state.consecutive_failures,
            since_transition_ms: u64::try_from(state.last_transition.elapsed().as_millis())
                .unwrap_or(u64::MAX),
        }
    }

    /// Manually reset to closed.
    pub fn reset(&self) {
        let mut state = self.state.lock();
        state.status = CircuitStatus::Closed;
        state.consecutive_failures = 0;
        state.opened_at = None;
        state.trial_in_flight = false;
        state.last_transition = Instant::now();
        self.publish(CircuitStatus::Closed);
        info!(endpoint = %self.endpoint, "circuit breaker: manually reset to closed");
    }

    /// Force the circuit open (maintenance).
    pub fn trip(&self) {
        let mut state = self.state.lock();
        let now = Instant::now();
        state.status = CircuitStatus::Open;
        state.opened_at = Some(now);
        state.last_transition = now;
        self.publish(CircuitStatus::Open);
        warn!(endpoint = %self.endpoint, "circuit breaker: manually tripped to open");
    }

    fn publish(&self, status: CircuitStatus) {
        set_circuit_state(&self.endpoint, status.as_gauge());
    }
}

/// Circuit breaker statistics.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CircuitStats {
    /// Protected endpoint.
    pub endpoint: String,
    /// Current state.
    pub status: CircuitStatus,
    /// Consecutive failures observed.
    pub consecutive_failures: usize,
    /// Milliseconds since the last state transition.
    pub since_transition_ms: u64,
}

/// Lazily-populated map of endpoint → breaker.
///
/// Breakers are created on first use with the registry's settings. Each
/// endpoint has its own lock; there is no registry-wide lock on the hot path.
#[derive(Debug)]
pub struct CircuitBreakerRegistry {
    breakers: DashMap<String, CircuitBreaker>,
    failure_threshold: usize,
    cooldown: Duration,
}

impl CircuitBreakerRegistry {
    /// Registry creating breakers with the given settings.
    pub fn new(failure_threshold: usize, cooldown: Duration) -> Self {
        Self {
            breakers: DashMap::new(),
            failure_threshold,
            cooldown,
        }
    }

    /// Breaker for `endpoint`, created if absent.
    pub fn get(&self, endpoint: &str) -> CircuitBreaker {
        if let Some(existing) = self.breakers.get(endpoint) {
            return existing.clone();
        }
        self.breakers
            .entry(endpoint.to_string())
            .or_insert_with(|| {
                CircuitBreaker::new(endpoint, self.failure_threshold, self.cooldown)
            })
            .clone()
    }

    /// Stats for every known endpoint, sorted by name.
    pub fn snapshot(&self) -> Vec<CircuitStats> {
        let mut stats: Vec<CircuitStats> =
            self.breakers.iter().map(|entry| entry.value().stats()).collect();
        stats.sort_by(|a, b| a.endpoint.cmp(&b.endpoint));
        stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    async fn fail(breaker: &CircuitBreaker) -> Result<(), CircuitBreakerError<()>> {
        breaker.call(|| async { Err(()) }).await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<(), CircuitBreakerError<()>> {
        breaker.call(|| async { Ok(()) }).await
    }

    #[tokio::test]
    async fn test_circuit_opens_at_threshold() {
        let breaker = CircuitBreaker::new("ep", 3, Duration::from_secs(5));

        for _ in 0..2 {
            assert!(matches!(fail(&breaker).await, Err(CircuitBreakerError::Failed(()))));
        }
        assert_eq!(breaker.status(), CircuitStatus::Closed);

        let _ = fail(&breaker).await;
        assert_eq!(breaker.status(), CircuitStatus::Open);

        let calls = AtomicUsize::new(0);
        let result: Result<(), CircuitBreakerError<()>> = breaker
            .call(|| async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .await;
        assert_eq!(result, Err(CircuitBreakerError::Open));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_success_resets_consecutive_count() {
        let breaker = CircuitBreaker::new("ep", 3, Duration::from_secs(5));
        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        let _ = succeed(&breaker).await;
        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        assert_eq!(breaker.status(), CircuitStatus::Closed);
        assert_eq!(breaker.stats().consecutive_failures, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trial_success_closes_circuit() {
        let breaker = CircuitBreaker::new("ep", 2, Duration::from_secs(30));
        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        assert_eq!(breaker.status(), CircuitStatus::Open);

        tokio::time::advance(Duration::from_secs(10)).await;
        assert_eq!(succeed(&breaker).await, Err(CircuitBreakerError::Open));

        tokio::time::advance(Duration::from_secs(21)).await;
        assert!(succeed(&breaker).await.is_ok());
        assert_eq!(breaker.status(), CircuitStatus::Closed);
        assert_eq!(breaker.stats().consecutive_failures, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_trial_failure_reopens_and_restarts_cooldown() {
        let breaker = CircuitBreaker::new("ep", 1, Duration::from_secs(30));
        let _ = fail(&breaker).await;

        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(matches!(fail(&breaker).await, Err(CircuitBreakerError::Failed(()))));
        assert_eq!(breaker.status(), CircuitStatus::Open);

        tokio::time::advance(Duration::from_secs(29)).await;
        assert_eq!(succeed(&breaker).await, Err(CircuitBreakerError::Open));
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_allows_exactly_one_trial() {
        let breaker = CircuitBreaker::new("ep", 1, Duration::from_secs(1));
        let _ = fail(&breaker).await;
        tokio::time::advance(Duration::from_secs(2)).await;

        let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();
        let trial_breaker = breaker.clone();
        let trial = tokio::spawn(async move {
            trial_breaker
                .call(|| async move {
                    let _ = release_rx.await;
                    Ok::<(), ()>(())
                })
                .await
        });
        tokio::task::yield_now().await;
        assert_eq!(breaker.status(), CircuitStatus::HalfOpen);

        assert_eq!(succeed(&breaker).await, Err(CircuitBreakerError::Open));

        let _ = release_tx.send(());
        assert!(trial.await.unwrap().is_ok());
        assert_eq!(breaker.status(), CircuitStatus::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_trial_releases_slot() {
        let breaker = CircuitBreaker::new("ep", 1, Duration::from_secs(1));
        let _ = fail(&breaker).await;
        tokio::time::advance(Duration::from_secs(2)).await;

        let trial = breaker.call(|| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok::<(), ()>(())
        });
        let _ = tokio::time::timeout(Duration::from_millis(10), trial).await;

        assert_eq!(breaker.status(), CircuitStatus::HalfOpen);
        assert!(succeed(&breaker).await.is_ok());
        assert_eq!(breaker.status(), CircuitStatus::Closed);
    }

    #[tokio::test]
    async fn test_manual_reset_and_trip() {
        let breaker = CircuitBreaker::new("ep", 2, Duration::from_secs(60));
        breaker.trip();
        assert_eq!(breaker.status(), CircuitStatus::Open);
        breaker.reset();
        assert_eq!(breaker.status(), CircuitStatus::Closed);
    }

    #[test]
    fn test_registry_creates_lazily_and_shares_state() {
        let registry = CircuitBreakerRegistry::new(3, Duration::from_secs(30));
        assert!(registry.snapshot().is_empty());

        let a = registry.get("a");
        a.trip();
        assert_eq!(registry.get("a").status(), CircuitStatus::Open);
        assert_eq!(registry.get("b").status(), CircuitStatus::Closed);

        let names: Vec<String> = registry.snapshot().into_iter().map(|s| s.endpoint).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_call_if_ignores_errors_the_endpoint_answered_with() {
        let breaker = CircuitBreaker::new("ep", 2, Duration::from_secs(30));
        for _ in 0..5 {
            let result = breaker
                .call_if(|| async { Err::<(), _>("rejected") }, |e| *e == "unavailable")
                .await;
            assert_eq!(result, Err(CircuitBreakerError::Failed("rejected")));
        }
        assert_eq!(breaker.status(), CircuitStatus::Closed);
        assert_eq!(breaker.stats().consecutive_failures, 0);

        for _ in 0..2 {
            let _ = breaker
                .call_if(|| async { Err::<(), _>("unavailable") }, |e| *e == "unavailable")
                .await;
        }
        assert_eq!(breaker.status(), CircuitStatus::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transitions_update_circuit_gauge() {
        use crate::metrics::prometheus::{circuit_state_value, init_metrics};
        init_metrics().unwrap();

        let breaker = CircuitBreaker::new("t-gauge-ep", 1, Duration::from_secs(5));
        assert_eq!(circuit_state_value("t-gauge-ep"), Some(0));

        let _ = fail(&breaker).await;
        assert_eq!(circuit_state_value("t-gauge-ep"), Some(2));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert!(succeed(&breaker).await.is_ok());
        assert_eq!(circuit_state_value("t-gauge-ep"), Some(0));

        breaker.trip();
        assert_eq!(circuit_state_value("t-gauge-ep"), Some(2));
    }

    #[test]
    fn test_gauge_encoding() {
        assert_eq!(CircuitStatus::Closed.as_gauge(), 0);
        assert_eq!(CircuitStatus::HalfOpen.as_gauge(), 1);
        assert_eq!(CircuitStatus::Open.as_gauge(), 2);
    }
}
