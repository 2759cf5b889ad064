//! Routing data contracts.
//!
//! Classification enums, the validated inbound [`RouteRequest`], the
//! [`RouteDecision`] produced by the engine and the enriched
//! [`RouteResponse`] returned to callers.
//!
//! Enum values are parsed strictly: an unknown hint value is a
//! [`RouterError::Validation`], never silently ignored.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::RouterError;

/// Task category inferred from the prompt (or forced by a hint).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    /// Equations, calculations, proofs.
    Math,
    /// Programming, algorithms, debugging.
    Coding,
    /// Stories, poetry, brainstorming.
    Creative,
    /// General conversation and explanations.
    Chat,
}

impl TaskType {
    /// All variants, in declaration order.
    pub const ALL: [TaskType; 4] = [Self::Math, Self::Coding, Self::Creative, Self::Chat];

    /// Wire name of this type.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Math => "math",
            Self::Coding => "coding",
            Self::Creative => "creative",
            Self::Chat => "chat",
        }
    }
}

/// Estimated reasoning depth of the prompt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Complexity {
    /// Single-step or conversational (also accepted as `"simple"`).
    #[serde(alias = "simple")]
    Low,
    /// Requires deep or multi-step reasoning.
    High,
}

impl Complexity {
    /// Wire name of this level.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::High => "high",
        }
    }
}

/// Prompt language as far as routing cares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    /// French.
    Fr,
    /// English.
    En,
    /// Anything else.
    Other,
}

impl Language {
    /// Wire name of this language.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fr => "fr",
            Self::En => "en",
            Self::Other => "other",
        }
    }
}

/// Caller subscription tier.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize, schemars::JsonSchema,
)]
#[serde(rename_all = "lowercase")]
pub enum ClientTier {
    /// Regular tier.
    #[default]
    Standard,
    /// Premium tier.
    Vip,
}

impl ClientTier {
    /// Wire name of this tier.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Standard => "standard",
            Self::Vip => "vip",
        }
    }
}

macro_rules! impl_wire_enum {
    ($ty:ty, $field:literal, [$($variant:expr),+ $(,)?]) => {
        impl FromStr for $ty {
            type Err = RouterError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                let needle = s.trim().to_ascii_lowercase();
                [$($variant),+]
                    .into_iter()
                    .find(|v| v.as_str() == needle)
                    .ok_or_else(|| {
                        RouterError::Validation(format!("invalid {} '{}'", $field, s))
                    })
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

impl_wire_enum!(
    TaskType,
    "type",
    [TaskType::Math, TaskType::Coding, TaskType::Creative, TaskType::Chat]
);
impl_wire_enum!(Complexity, "complexity", [Complexity::Low, Complexity::High]);
impl_wire_enum!(Language, "language", [Language::Fr, Language::En, Language::Other]);
impl_wire_enum!(ClientTier, "client_tier", [ClientTier::Standard, ClientTier::Vip]);

/// Output of a classifier: what kind of prompt this is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Classification {
    /// Task category.
    #[serde(rename = "type")]
    pub task_type: TaskType,
    /// Reasoning depth.
    pub complexity: Complexity,
    /// Prompt language.
    pub language: Language,
}

impl Classification {
    /// Conservative fallback used whenever classification fails.
    pub const fn conservative() -> Self {
        Self {
            task_type: TaskType::Chat,
            complexity: Complexity::Low,
            language: Language::En,
        }
    }
}

impl Default for Classification {
    fn default() -> Self {
        Self::conservative()
    }
}

/// Caller-supplied overrides for classifier fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Hints {
    /// Forces the task type when present.
    pub task_type: Option<TaskType>,
    /// Forces the language when present.
    pub language: Option<Language>,
}

/// Unvalidated inbound body, exactly as received on the wire.
///
/// Enum fields are plain strings here so that bad values produce a
/// validation error rather than a generic deserialisation failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RouteRequestBody {
    /// Prompt text; required.
    #[serde(default)]
    pub prompt: Option<String>,
    /// `"standard"` (default) or `"vip"`.
    #[serde(default)]
    pub client_tier: Option<String>,
    /// Optional task type override.
    #[serde(default)]
    pub type_hint: Option<String>,
    /// Optional language override.
    #[serde(default)]
    pub language_hint: Option<String>,
    /// Stable end-user identifier used for canary stickiness.
    #[serde(default)]
    pub user_id: Option<String>,
}

/// A validated routing request.
#[derive(Debug, Clone, PartialEq)]
pub struct RouteRequest {
    prompt: String,
    /// Caller tier.
    pub client_tier: ClientTier,
    /// Classification overrides.
    pub hints: Hints,
    /// End-user identity for sticky canary assignment, if known.
    pub user_id: Option<String>,
    /// Per-request identifier; generated when the caller supplies none.
    pub request_id: String,
}

impl RouteRequest {
    /// Build a request, rejecting empty or whitespace-only prompts.
    ///
    /// # Errors
    ///
    /// Returns [`RouterError::Validation`] if the prompt is blank.
    pub fn new(prompt: impl Into<String>, client_tier: ClientTier) -> Result<Self, RouterError> {
        let prompt = prompt.into();
        if prompt.trim().is_empty() {
            return Err(RouterError::Validation("prompt cannot be empty".to_string()));
        }
        Ok(Self {
            prompt,
            client_tier,
            hints: Hints::default(),
            user_id: None,
            request_id: uuid::Uuid::new_v4().to_string(),
        })
    }

    /// Set the task type hint.
    pub fn with_type_hint(mut self, hint: TaskType) -> Self {
        self.hints.task_type = Some(hint);
        self
    }

    /// Set the language hint.
    pub fn with_language_hint(mut self, hint: Language) -> Self {
        self.hints.language = Some(hint);
        self
    }

    /// Set the sticky end-user identifier.
    pub fn with_user_id(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Override the generated request identifier.
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    /// The prompt text (never empty).
    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    /// Key used by the traffic splitter: end-user id when available,
    /// otherwise the per-request id.
    pub fn stickiness_key(&self) -> &str {
        self.user_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
            .unwrap_or(&self.request_id)
    }
}

impl TryFrom<RouteRequestBody> for RouteRequest {
    type Error = RouterError;

    fn try_from(body: RouteRequestBody) -> Result<Self, Self::Error> {
        let prompt = body
            .prompt
            .ok_or_else(|| RouterError::Validation("prompt is required".to_string()))?;
        let tier = match body.client_tier.as_deref() {
            None => ClientTier::Standard,
            Some(raw) => raw.parse()?,
        };
        let mut request = RouteRequest::new(prompt, tier)?;
        if let Some(raw) = body.type_hint.as_deref() {
            request.hints.task_type = Some(raw.parse()?);
        }
        if let Some(raw) = body.language_hint.as_deref() {
            request.hints.language = Some(raw.parse()?);
        }
        request.user_id = body.user_id;
        Ok(request)
    }
}

/// Classification actually used for routing, with hint provenance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedClassification {
    /// Task type after hint precedence.
    #[serde(rename = "type")]
    pub task_type: TaskType,
    /// Complexity (never hinted).
    pub complexity: Complexity,
    /// Language after hint precedence.
    pub language: Language,
    /// Caller tier.
    pub client_tier: ClientTier,
    /// Whether the type came from a hint.
    pub type_hint_applied: bool,
    /// Whether the language came from a hint.
    pub language_hint_applied: bool,
}

impl ResolvedClassification {
    /// The classification fields without tier or provenance.
    pub fn classification(&self) -> Classification {
        Classification {
            task_type: self.task_type,
            complexity: self.complexity,
            language: self.language,
        }
    }
}

/// The engine's choice of deployment for one request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteDecision {
    /// Model identifier, e.g. `"DeepSeek-R1"`.
    pub model: String,
    /// Deployment identifier sent to the backend.
    pub deployment: String,
    /// Hosting region.
    pub region: String,
    /// Classification used to reach this decision.
    pub routing: ResolvedClassification,
}

/// Token-equivalent usage reported by a backend.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    /// Prompt tokens.
    pub prompt_tokens: u64,
    /// Generated tokens.
    pub completion_tokens: u64,
    /// Sum of both, as reported.
    pub total_tokens: u64,
}

/// Enriched response returned by the coordinator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteResponse {
    /// Model that produced the output.
    pub model: String,
    /// Deployment that produced the output.
    pub deployment: String,
    /// Hosting region.
    pub region: String,
    /// Classification used.
    pub routing: ResolvedClassification,
    /// Generated text.
    pub output: String,
    /// Usage, present whenever the backend reported it.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    /// Derived cost in USD (never negative).
    pub cost_usd: f64,
    /// Correlation id for log tracing.
    pub correlation_id: String,
    /// Provider that ultimately answered (`"new"` or `"legacy"`).
    pub provider: String,
    /// End-to-end latency in milliseconds.
    pub latency_ms: u64,
    /// Whether the legacy provider answered after the new one failed.
    pub fallback_used: bool,
    /// Failure of the new provider that triggered the fallback.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_reason: Option<String>,
}

impl RouteResponse {
    /// Build an un-enriched response from a decision and backend output.
    ///
    /// Coordinator-level fields (`correlation_id`, `provider`, `latency_ms`,
    /// fallback markers) are filled in by the coordinator.
    pub fn from_decision(
        decision: RouteDecision,
        output: String,
        usage: Option<Usage>,
        cost_usd: f64,
    ) -> Self {
        Self {
            model: decision.model,
            deployment: decision.deployment,
            region: decision.region,
            routing: decision.routing,
            output,
            usage,
            cost_usd: cost_usd.max(0.0),
            correlation_id: String::new(),
            provider: String::new(),
            latency_ms: 0,
            fallback_used: false,
            fallback_reason: None,
        }
    }
}
