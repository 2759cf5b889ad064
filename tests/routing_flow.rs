//! # End-to-end routing through the coordinator
//!
//! Wires the real routing engine, legacy provider and resilient client over
//! in-process backends and checks what callers see: the chosen deployment,
//! the reported routing, enrichment fields and fallback behaviour.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rollout_router::backend::{Completion, CompletionRequest, CompletionSettings};
use rollout_router::canary::FixedRollout;
use rollout_router::provider::{Executor, LegacyProvider, Provider, LEGACY_PROVIDER, NEW_PROVIDER};
use rollout_router::resilience::{ResilienceSettings, RetryPolicy};
use rollout_router::routing::registry::{default_rules, DeploymentNames, MODEL_DEEPSEEK, MODEL_LLAMA};
use rollout_router::routing::{
    ClientTier, Complexity, Deployment, DeploymentRegistry, HeuristicClassifier, Language,
    PricingTable, RouteRequestBody, TaskType,
};
use rollout_router::{
    Coordinator, EchoBackend, MetricsCollector, ModelBackend, ResilientClient, RouteRequest,
    RouterError, RoutingEngine, TrafficSplitter,
};

// ============================================================================
// Test Infrastructure
// ============================================================================

/// Echoes like [`EchoBackend`] but rejects every call to the listed
/// deployments.
struct SelectiveBackend {
    failing: HashSet<String>,
    calls: AtomicUsize,
}

impl SelectiveBackend {
    fn failing(deployments: &[&str]) -> Self {
        Self {
            failing: deployments.iter().map(|d| d.to_string()).collect(),
            calls: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl ModelBackend for SelectiveBackend {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, RouterError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.contains(&request.deployment) {
            return Err(RouterError::Rejected {
                status: 400,
                message: format!("deployment {} refused the prompt", request.deployment),
            });
        }
        EchoBackend::with_delay(0).complete(request).await
    }
}

fn fast_settings() -> ResilienceSettings {
    ResilienceSettings {
        retry: RetryPolicy::fixed(0, Duration::ZERO),
        failure_threshold: 3,
        cooldown: Duration::from_secs(30),
        call_timeout: Duration::from_secs(5),
    }
}

fn build(backend: Arc<dyn ModelBackend>, percentage: u8) -> Coordinator {
    let client = Arc::new(ResilientClient::new(backend, fast_settings()));
    let executor = Executor::new(
        client,
        Arc::new(PricingTable::default()),
        CompletionSettings::default(),
    );
    let names = DeploymentNames::default();
    let registry = Arc::new(
        DeploymentRegistry::new("eastus2", &default_rules(&names)).expect("test: default rules"),
    );

    let engine: Arc<dyn Provider> = Arc::new(RoutingEngine::new(
        Arc::new(HeuristicClassifier::new()),
        registry,
        executor.clone(),
    ));
    let legacy: Arc<dyn Provider> = Arc::new(LegacyProvider::new(
        Deployment::new(MODEL_LLAMA, &names.llama),
        "eastus2",
        executor,
    ));

    Coordinator::new(
        TrafficSplitter::new(Arc::new(FixedRollout(percentage))),
        engine,
        legacy,
        MetricsCollector::new(),
    )
}

fn echo(percentage: u8) -> Coordinator {
    build(Arc::new(EchoBackend::with_delay(0)), percentage)
}

// ============================================================================
// Deployment selection
// ============================================================================

#[tokio::test]
async fn test_math_hint_routes_to_reasoning_deployment() {
    let c = echo(100);
    let request = RouteRequest::new("What is the capital of France?", ClientTier::Standard)
        .expect("test: valid request")
        .with_type_hint(TaskType::Math);

    let response = c.route(request).await.expect("test: route succeeds");
    assert_eq!(response.model, MODEL_DEEPSEEK);
    assert_eq!(response.deployment, "deepseek-r1-us");
    assert_eq!(response.region, "eastus2");
    assert_eq!(response.routing.task_type, TaskType::Math);
    assert!(response.routing.type_hint_applied);
    assert!(!response.routing.language_hint_applied);
    assert_eq!(response.provider, NEW_PROVIDER);
}

#[tokio::test]
async fn test_french_standard_chat_routes_to_mistral() {
    let c = echo(100);
    let request = RouteRequest::new("Bonjour, comment ça va aujourd'hui ?", ClientTier::Standard)
        .expect("test: valid request");

    let response = c.route(request).await.expect("test: route succeeds");
    assert_eq!(response.routing.language, Language::Fr);
    assert_eq!(response.routing.task_type, TaskType::Chat);
    assert_eq!(response.deployment, "mistral-large-2411-us");
}

#[tokio::test]
async fn test_french_vip_chat_routes_to_general_deployment() {
    let c = echo(100);
    let request = RouteRequest::new("Bonjour, comment ça va aujourd'hui ?", ClientTier::Vip)
        .expect("test: valid request");

    let response = c.route(request).await.expect("test: route succeeds");
    assert_eq!(response.routing.client_tier, ClientTier::Vip);
    assert_eq!(response.deployment, "llama33-70b-us");
}

#[tokio::test]
async fn test_language_hint_overrides_detection() {
    let c = echo(100);
    let request = RouteRequest::new("hello, how are you today?", ClientTier::Standard)
        .expect("test: valid request")
        .with_language_hint(Language::Fr);

    let response = c.route(request).await.expect("test: route succeeds");
    assert_eq!(response.routing.language, Language::Fr);
    assert!(response.routing.language_hint_applied);
    assert_eq!(response.deployment, "mistral-large-2411-us");
}

// ============================================================================
// Enrichment
// ============================================================================

#[tokio::test]
async fn test_response_is_fully_enriched() {
    let c = echo(100);
    let request = RouteRequest::new("Write a haiku about autumn", ClientTier::Standard)
        .expect("test: valid request");

    let response = c.route(request).await.expect("test: route succeeds");
    assert_eq!(response.correlation_id.len(), 8);
    assert!(response.output.contains("Write a haiku about autumn"));
    let usage = response.usage.expect("test: echo reports usage");
    assert_eq!(usage.total_tokens, usage.prompt_tokens + usage.completion_tokens);
    assert!(response.cost_usd > 0.0);
    assert!(!response.fallback_used);
    assert!(response.fallback_reason.is_none());

    let json = serde_json::to_value(&response).expect("test: serialise");
    assert_eq!(json["routing"]["type"], "creative");
    assert_eq!(json["provider"], "new");
}

#[tokio::test]
async fn test_legacy_reports_conservative_routing() {
    let c = echo(0);
    let request = RouteRequest::new("Solve 3x + 4 = 19 step by step", ClientTier::Standard)
        .expect("test: valid request");

    let response = c.route(request).await.expect("test: route succeeds");
    assert_eq!(response.provider, LEGACY_PROVIDER);
    assert_eq!(response.deployment, "llama33-70b-us");
    assert_eq!(response.routing.task_type, TaskType::Chat);
    assert_eq!(response.routing.complexity, Complexity::Low);
    assert_eq!(response.routing.language, Language::En);
}

#[tokio::test]
async fn test_route_body_rejects_blank_prompt() {
    let c = echo(100);
    let body = RouteRequestBody {
        prompt: Some("   ".into()),
        ..RouteRequestBody::default()
    };
    let failure = c.route_body(body).await.unwrap_err();
    assert_eq!(failure.body.code, "validation_error");
    assert!(!failure.body.retryable);
}

#[tokio::test]
async fn test_route_body_rejects_unknown_tier() {
    let c = echo(100);
    let body = RouteRequestBody {
        prompt: Some("hello".into()),
        client_tier: Some("platinum".into()),
        ..RouteRequestBody::default()
    };
    let failure = c.route_body(body).await.unwrap_err();
    assert_eq!(failure.body.code, "validation_error");
}

// ============================================================================
// Fallback
// ============================================================================

#[tokio::test]
async fn test_failed_new_deployment_falls_back_to_legacy() {
    let backend = Arc::new(SelectiveBackend::failing(&["deepseek-r1-us"]));
    let c = build(backend.clone(), 100);
    let request = RouteRequest::new("Compute the integral of x^2", ClientTier::Standard)
        .expect("test: valid request")
        .with_type_hint(TaskType::Math);

    let response = c.route(request).await.expect("test: fallback answers");
    assert!(response.fallback_used);
    assert_eq!(response.provider, LEGACY_PROVIDER);
    assert_eq!(response.deployment, "llama33-70b-us");
    assert!(response
        .fallback_reason
        .as_deref()
        .unwrap_or_default()
        .contains("backend rejected"));
    // Rejections are not retried: one call each.
    assert_eq!(backend.calls.load(Ordering::SeqCst), 2);

    let new = c.metrics().snapshot(NEW_PROVIDER);
    assert_eq!(new.error_count, 1);
    assert_eq!(c.metrics().snapshot(LEGACY_PROVIDER).error_count, 0);
}

#[tokio::test]
async fn test_fallback_disabled_returns_structured_error() {
    let backend = Arc::new(SelectiveBackend::failing(&["deepseek-r1-us"]));
    let c = build(backend, 100).with_fallback(false);
    let request = RouteRequest::new("integral", ClientTier::Standard)
        .expect("test: valid request")
        .with_type_hint(TaskType::Math);

    let failure = c.route(request).await.unwrap_err();
    assert_eq!(failure.body.code, "backend_rejected");
    assert!(!failure.body.retryable);
    assert!(matches!(failure.error, RouterError::Rejected { status: 400, .. }));
}

#[tokio::test]
async fn test_legacy_failure_is_not_retried_on_new_provider() {
    let backend = Arc::new(SelectiveBackend::failing(&["llama33-70b-us"]));
    let c = build(backend.clone(), 0);
    let request =
        RouteRequest::new("hello there", ClientTier::Standard).expect("test: valid request");

    let failure = c.route(request).await.unwrap_err();
    assert_eq!(failure.body.code, "backend_rejected");
    assert_eq!(backend.calls.load(Ordering::SeqCst), 1);
    assert_eq!(c.metrics().snapshot(NEW_PROVIDER).request_count, 0);
}

#[tokio::test]
async fn test_repeated_rejections_keep_the_deployment_reachable() {
    let backend = Arc::new(SelectiveBackend::failing(&["deepseek-r1-us"]));
    let c = build(backend.clone(), 100).with_fallback(false);

    for _ in 0..6 {
        let request = RouteRequest::new("integral", ClientTier::Standard)
            .expect("test: valid request")
            .with_type_hint(TaskType::Math);
        let failure = c.route(request).await.unwrap_err();
        assert_eq!(failure.body.code, "backend_rejected");
    }
    // Every request reached the backend; none was short-circuited.
    assert_eq!(backend.calls.load(Ordering::SeqCst), 6);
}
