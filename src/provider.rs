//! Routing providers.
//!
//! A [`Provider`] is one complete routing implementation the coordinator
//! can send traffic to. The canary moves traffic between two of them:
//! the classification-driven [`RoutingEngine`](crate::RoutingEngine)
//! (`"new"`) and the established [`LegacyProvider`] (`"legacy"`), which
//! always answers from one fixed deployment.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Instant;
use tracing::info;

use crate::backend::{estimate_usage, CompletionSettings};
use crate::resilience::ResilientClient;
use crate::routing::engine::apply_hints;
use crate::routing::pricing::PricingTable;
use crate::routing::registry::Deployment;
use crate::routing::{Classification, RouteDecision, RouteRequest, RouteResponse};
use crate::RouterError;

/// Name of the provider under canary.
pub const NEW_PROVIDER: &str = "new";
/// Name of the established provider.
pub const LEGACY_PROVIDER: &str = "legacy";

/// One routing implementation.
#[async_trait]
pub trait Provider: Send + Sync {
    /// Stable provider name used in metrics and responses.
    fn name(&self) -> &str;

    /// Handle one request end to end.
    ///
    /// # Errors
    ///
    /// Any [`RouterError`] from classification, selection or the backend.
    async fn handle(&self, request: &RouteRequest) -> Result<RouteResponse, RouterError>;
}

/// Shared plumbing for providers: call the decided deployment through the
/// resilient client and price the result.
#[derive(Debug, Clone)]
pub struct Executor {
    client: Arc<ResilientClient>,
    pricing: Arc<PricingTable>,
    settings: CompletionSettings,
}

impl Executor {
    /// Build an executor.
    pub fn new(
        client: Arc<ResilientClient>,
        pricing: Arc<PricingTable>,
        settings: CompletionSettings,
    ) -> Self {
        Self {
            client,
            pricing,
            settings,
        }
    }

    /// Run `prompt` on `decision.deployment`.
    ///
    /// Usage is estimated when the backend does not report it, so every
    /// successful response carries usage and a cost.
    ///
    /// # Errors
    ///
    /// The resilient client's final error.
    pub async fn execute(
        &self,
        decision: RouteDecision,
        prompt: &str,
    ) -> Result<RouteResponse, RouterError> {
        let started = Instant::now();
        let request = self.settings.request(&decision.deployment, prompt);
        let completion = self.client.invoke(&request).await?;

        let usage = completion
            .usage
            .unwrap_or_else(|| estimate_usage(prompt, &completion.text));
        let cost = self.pricing.cost_usd(&decision.model, &usage);

        info!(
            model = %decision.model,
            deployment = %decision.deployment,
            tier = %decision.routing.client_tier,
            latency_ms = started.elapsed().as_millis() as u64,
            prompt_tokens = usage.prompt_tokens,
            completion_tokens = usage.completion_tokens,
            cost_usd = cost,
            "route completed"
        );

        Ok(RouteResponse::from_decision(
            decision,
            completion.text,
            Some(usage),
            cost,
        ))
    }

    /// The resilient client used for calls.
    pub fn client(&self) -> &Arc<ResilientClient> {
        &self.client
    }
}

/// The established implementation: every request goes to one deployment.
///
/// It does not classify; the reported routing is the conservative default
/// with caller hints applied.
#[derive(Debug, Clone)]
pub struct LegacyProvider {
    deployment: Deployment,
    region: String,
    executor: Executor,
}

impl LegacyProvider {
    /// Legacy provider answering from `deployment`.
    pub fn new(deployment: Deployment, region: impl Into<String>, executor: Executor) -> Self {
        Self {
            deployment,
            region: region.into(),
            executor,
        }
    }

    /// The fixed deployment.
    pub fn deployment(&self) -> &Deployment {
        &self.deployment
    }
}

#[async_trait]
impl Provider for LegacyProvider {
    fn name(&self) -> &str {
        LEGACY_PROVIDER
    }

    async fn handle(&self, request: &RouteRequest) -> Result<RouteResponse, RouterError> {
        let decision = RouteDecision {
            model: self.deployment.model.clone(),
            deployment: self.deployment.deployment.clone(),
            region: self.region.clone(),
            routing: apply_hints(
                Classification::conservative(),
                &request.hints,
                request.client_tier,
            ),
        };
        self.executor.execute(decision, request.prompt()).await
    }
}
