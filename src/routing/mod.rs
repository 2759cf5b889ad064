//! # Stage: Classification-Driven Routing
//!
//! ## Responsibility
//! Classify each prompt (task type, complexity, language), apply caller
//! hints with a single precedence function, and pick a concrete deployment
//! from a static registry keyed by (type, complexity, language, tier).
//!
//! ## Guarantees
//! - Deterministic: the same request and registry always produce the same
//!   decision, except for explicit round-robin within one registry key.
//! - Hints win: a present hint replaces the classifier's value for its field.
//! - Total: every classification resolves, via the default `chat` rule.
//! - Classification never fails; errors degrade to `chat/low/en`.
//!
//! ## NOT Responsible For
//! - Retries, timeouts and circuit breaking (that belongs to `resilience`)
//! - Choosing between new and legacy implementations (that belongs to `canary`)

pub mod classifier;
pub mod engine;
pub mod pricing;
pub mod registry;
pub mod types;

// Re-exports for convenience
pub use classifier::{Classifier, HeuristicClassifier, ModelClassifier};
pub use engine::{apply_hints, RoutingEngine};
pub use pricing::{ModelPrice, PricingTable};
pub use registry::{Deployment, DeploymentNames, DeploymentRegistry, DeploymentRule};
pub use types::{
    Classification, ClientTier, Complexity, Hints, Language, ResolvedClassification,
    RouteDecision, RouteRequest, RouteRequestBody, RouteResponse, TaskType, Usage,
};
