//! Routing engine.
//!
//! The [`RoutingEngine`] classifies the prompt, applies caller hints with
//! [`apply_hints`], looks the result up in the
//! [`DeploymentRegistry`](super::DeploymentRegistry) and calls the chosen
//! deployment through the resilient client. It is the provider under canary.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info};

use super::classifier::Classifier;
use super::registry::DeploymentRegistry;
use super::types::{
    Classification, ClientTier, Hints, ResolvedClassification, RouteDecision, RouteRequest,
    RouteResponse,
};
use crate::provider::{Executor, Provider, NEW_PROVIDER};
use crate::RouterError;

/// Hint precedence: a present hint replaces the classifier's value for
/// that field unconditionally; an absent hint leaves it untouched.
/// Complexity is never hinted.
pub fn apply_hints(
    classification: Classification,
    hints: &Hints,
    client_tier: ClientTier,
) -> ResolvedClassification {
    ResolvedClassification {
        task_type: hints.task_type.unwrap_or(classification.task_type),
        complexity: classification.complexity,
        language: hints.language.unwrap_or(classification.language),
        client_tier,
        type_hint_applied: hints.task_type.is_some(),
        language_hint_applied: hints.language.is_some(),
    }
}

/// Classification-driven deployment selection.
///
/// # Panics
///
/// This type and its methods never panic.
pub struct RoutingEngine {
    classifier: Arc<dyn Classifier>,
    registry: Arc<DeploymentRegistry>,
    executor: Executor,
}

impl std::fmt::Debug for RoutingEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RoutingEngine")
            .field("classifier", &self.classifier.name())
            .field("registry", &self.registry)
            .finish()
    }
}

impl RoutingEngine {
    /// Build an engine.
    pub fn new(
        classifier: Arc<dyn Classifier>,
        registry: Arc<DeploymentRegistry>,
        executor: Executor,
    ) -> Self {
        Self {
            classifier,
            registry,
            executor,
        }
    }

    /// Pick a deployment for an already-computed classification.
    ///
    /// # Errors
    ///
    /// [`RouterError::Config`] if the registry has no match, which cannot
    /// happen for a registry built by [`DeploymentRegistry::new`].
    pub fn select_deployment(
        &self,
        classification: Classification,
        hints: &Hints,
        client_tier: ClientTier,
    ) -> Result<RouteDecision, RouterError> {
        let routing = apply_hints(classification, hints, client_tier);
        let deployment = self.registry.lookup(&routing).ok_or_else(|| {
            RouterError::Config(format!(
                "no deployment for type '{}' and no default rule",
                routing.task_type
            ))
        })?;

        debug!(
            task_type = %routing.task_type,
            complexity = %routing.complexity,
            language = %routing.language,
            tier = %client_tier,
            deployment = %deployment.deployment,
            "deployment selected"
        );

        Ok(RouteDecision {
            model: deployment.model,
            deployment: deployment.deployment,
            region: self.registry.region().to_string(),
            routing,
        })
    }

    /// Classify `request` and pick its deployment without calling it.
    ///
    /// # Errors
    ///
    /// See [`RoutingEngine::select_deployment`].
    pub async fn decide(&self, request: &RouteRequest) -> Result<RouteDecision, RouterError> {
        let classification = self.classifier.classify(request.prompt()).await;
        info!(
            classifier = self.classifier.name(),
            task_type = %classification.task_type,
            complexity = %classification.complexity,
            language = %classification.language,
            "prompt classified"
        );
        self.select_deployment(classification, &request.hints, request.client_tier)
    }

    /// The registry in use.
    pub fn registry(&self) -> &DeploymentRegistry {
        &self.registry
    }
}

#[async_trait]
impl Provider for RoutingEngine {
    fn name(&self) -> &str {
        NEW_PROVIDER
    }

    async fn handle(&self, request: &RouteRequest) -> Result<RouteResponse, RouterError> {
        let decision = self.decide(request).await?;
        self.executor.execute(decision, request.prompt()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{CompletionSettings, EchoBackend};
    use crate::resilience::{ResilienceSettings, ResilientClient};
    use crate::routing::classifier::HeuristicClassifier;
    use crate::routing::pricing::PricingTable;
    use crate::routing::registry::{MODEL_DEEPSEEK, MODEL_MISTRAL};
    use crate::routing::types::{Complexity, Language, TaskType};

    fn engine() -> RoutingEngine {
        let client = ResilientClient::new(
            Arc::new(EchoBackend::with_delay(0)),
            ResilienceSettings::default(),
        );
        RoutingEngine::new(
            Arc::new(HeuristicClassifier::new()),
            Arc::new(DeploymentRegistry::with_defaults("eastus2").unwrap()),
            Executor::new(
                Arc::new(client),
                Arc::new(PricingTable::default()),
                CompletionSettings::default(),
            ),
        )
    }

    fn chat() -> Classification {
        Classification {
            task_type: TaskType::Chat,
            complexity: Complexity::Low,
            language: Language::En,
        }
    }

    #[test]
    fn test_no_hints_keeps_classifier_output() {
        let c = Classification {
            task_type: TaskType::Coding,
            complexity: Complexity::High,
            language: Language::Fr,
        };
        let r = apply_hints(c, &Hints::default(), ClientTier::Standard);
        assert_eq!(r.classification(), c);
        assert!(!r.type_hint_applied);
        assert!(!r.language_hint_applied);
    }

    #[test]
    fn test_hints_override_unconditionally() {
        let hints = Hints {
            task_type: Some(TaskType::Creative),
            language: Some(Language::Other),
        };
        let r = apply_hints(chat(), &hints, ClientTier::Vip);
        assert_eq!(r.task_type, TaskType::Creative);
        assert_eq!(r.language, Language::Other);
        assert_eq!(r.complexity, Complexity::Low);
        assert_eq!(r.client_tier, ClientTier::Vip);
        assert!(r.type_hint_applied && r.language_hint_applied);
    }

    #[test]
    fn test_math_hint_on_chat_routes_to_math_deployment() {
        let hints = Hints {
            task_type: Some(TaskType::Math),
            language: None,
        };
        let decision = engine()
            .select_deployment(chat(), &hints, ClientTier::Standard)
            .unwrap();
        assert_eq!(decision.model, MODEL_DEEPSEEK);
        assert_eq!(decision.region, "eastus2");
    }

    #[tokio::test]
    async fn test_french_prompt_routes_to_french_deployment() {
        let request = RouteRequest::new("Bonjour, comment ça va ?", ClientTier::Standard).unwrap();
        let decision = engine().decide(&request).await.unwrap();
        assert_eq!(decision.routing.language, Language::Fr);
        assert_eq!(decision.model, MODEL_MISTRAL);
    }

    #[tokio::test]
    async fn test_handle_returns_priced_response() {
        let request = RouteRequest::new("What is 2 + 2?", ClientTier::Standard).unwrap();
        let response = engine().handle(&request).await.unwrap();
        assert_eq!(response.model, MODEL_DEEPSEEK);
        assert!(response.output.contains("What is 2 + 2?"));
        assert!(response.usage.is_some());
        assert!(response.cost_usd >= 0.0);
    }
}
