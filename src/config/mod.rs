//! # Stage: Router Configuration
//!
//! ## Responsibility
//! Parse and validate the TOML file that describes one router instance:
//! server, backend, routing rules, pricing, resilience, rollout and
//! alerting. Secrets and deployment names can be overridden from the
//! environment.
//!
//! ## Guarantees
//! - Deterministic: same TOML input and environment produce the same `RouterConfig`
//! - Defaulted: every field has a documented default, an empty file parses
//! - Validated: all semantic constraints are checked before a config is accepted
//! - Schema-exportable: JSON Schema output enables IDE autocomplete
//!
//! ## NOT Responsible For
//! - Building the runtime objects (that belongs to `main`)
//! - Hot reload: the rollout state is mutated through the admin API instead

pub mod loader;
pub mod validation;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;

use crate::backend::CompletionSettings;
use crate::canary::{CanaryPhase, ControllerSettings, RolloutThresholds};
use crate::resilience::{ResilienceSettings, RetryPolicy};
use crate::routing::pricing::default_prices;
use crate::routing::registry::{default_rules, MODEL_LLAMA};
use crate::routing::{Deployment, DeploymentNames, DeploymentRule, ModelPrice};

// ── Default value functions ──────────────────────────────────────────────

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

/// Default request body limit: 1 MiB.
fn default_max_request_size() -> usize {
    1024 * 1024
}

fn default_backend_timeout_secs() -> u64 {
    60
}

fn default_max_tokens() -> u32 {
    2048
}

fn default_temperature() -> f32 {
    0.7
}

fn default_system_prompt() -> String {
    "You are a helpful assistant.".to_string()
}

fn default_region() -> String {
    "eastus2".to_string()
}

fn default_classifier_deployment() -> String {
    "phi-4-mini-us".to_string()
}

fn default_deepseek() -> String {
    DeploymentNames::default().deepseek
}

fn default_llama() -> String {
    DeploymentNames::default().llama
}

fn default_mistral() -> String {
    DeploymentNames::default().mistral
}

fn default_max_retries() -> usize {
    3
}

fn default_base_delay_ms() -> u64 {
    200
}

fn default_max_delay_ms() -> u64 {
    5000
}

fn default_failure_threshold() -> usize {
    3
}

fn default_breaker_cooldown_secs() -> u64 {
    30
}

fn default_call_timeout_secs() -> u64 {
    30
}

fn default_error_rate_threshold() -> f64 {
    0.05
}

fn default_p95_latency_ceiling_ms() -> u64 {
    5000
}

fn default_max_cost_per_request_usd() -> f64 {
    0.05
}

fn default_min_requests() -> u64 {
    20
}

/// Default healthy duration before auto-advance: 24 hours.
fn default_healthy_duration_secs() -> u64 {
    86_400
}

fn default_rollback_cooldown_secs() -> u64 {
    3600
}

fn default_check_interval_secs() -> u64 {
    60
}

fn default_max_events() -> usize {
    1000
}

fn default_metrics_window() -> usize {
    1000
}

/// Default alert cooldown: 15 minutes.
fn default_alert_cooldown_secs() -> u64 {
    900
}

fn default_sustained_breach_checks() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

// ── Top-level config ─────────────────────────────────────────────────────

/// Root configuration for a router instance.
///
/// Every section is optional; omitted sections take their defaults.
///
/// # Example
///
/// ```toml
/// [server]
/// port = 8080
///
/// [backend]
/// endpoint = "https://models.example.com/v1"
///
/// [rollout]
/// initial_phase = "canary_10"
/// ```
///
/// # Panics
///
/// This type never panics during construction or access.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct RouterConfig {
    /// HTTP listener and authentication.
    #[serde(default)]
    pub server: ServerConfig,
    /// Model backend connection and generation parameters.
    #[serde(default)]
    pub backend: BackendConfig,
    /// Classifier, region and deployment rules.
    #[serde(default)]
    pub routing: RoutingConfig,
    /// Per-model prices.
    #[serde(default)]
    pub pricing: PricingConfig,
    /// Retries, circuit breaking, timeouts.
    #[serde(default)]
    pub resilience: ResilienceConfig,
    /// Canary thresholds and schedule.
    #[serde(default)]
    pub rollout: RolloutConfig,
    /// Alert delivery.
    #[serde(default)]
    pub alerting: AlertingConfig,
}

// ── Server ───────────────────────────────────────────────────────────────

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ServerConfig {
    /// Bind address.
    #[serde(default = "default_host")]
    pub host: String,
    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,
    /// Shared secret callers present in `X-API-Key`. Must be set.
    #[serde(default)]
    pub api_key: String,
    /// Maximum accepted request body in bytes.
    #[serde(default = "default_max_request_size")]
    pub max_request_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            api_key: String::new(),
            max_request_size: default_max_request_size(),
        }
    }
}

// ── Backend ──────────────────────────────────────────────────────────────

/// Which backend implementation serves completions.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Chat-completions HTTP endpoint.
    #[default]
    Http,
    /// In-process echo, for local runs and tests.
    Echo,
}

/// Backend settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct BackendConfig {
    /// Backend implementation.
    #[serde(default)]
    pub kind: BackendKind,
    /// Base URL; requests go to `{endpoint}/chat/completions`.
    #[serde(default)]
    pub endpoint: String,
    /// Bearer token for the backend.
    #[serde(default)]
    pub api_key: String,
    /// HTTP client timeout in seconds.
    #[serde(default = "default_backend_timeout_secs")]
    pub timeout_secs: u64,
    /// Generation cap per request.
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    /// Sampling temperature, 0.0–2.0.
    #[serde(default = "default_temperature")]
    pub temperature: f32,
    /// System message sent with every prompt.
    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            endpoint: String::new(),
            api_key: String::new(),
            timeout_secs: default_backend_timeout_secs(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            system_prompt: default_system_prompt(),
        }
    }
}

impl BackendConfig {
    /// Generation settings for providers.
    pub fn completion_settings(&self) -> CompletionSettings {
        CompletionSettings {
            system_prompt: self.system_prompt.clone(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        }
    }
}

// ── Routing ──────────────────────────────────────────────────────────────

/// Classifier implementation.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ClassifierKind {
    /// Offline keyword heuristics.
    #[default]
    Heuristic,
    /// Small model asked for a JSON classification.
    Model,
}

/// Deployment names used by the stock rule set.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
pub struct DeploymentNamesConfig {
    /// DeepSeek-R1 deployment.
    #[serde(default = "default_deepseek")]
    pub deepseek: String,
    /// Llama-3.3-70B deployment.
    #[serde(default = "default_llama")]
    pub llama: String,
    /// Mistral-Large-2411 deployment.
    #[serde(default = "default_mistral")]
    pub mistral: String,
}

impl Default for DeploymentNamesConfig {
    fn default() -> Self {
        Self {
            deepseek: default_deepseek(),
            llama: default_llama(),
            mistral: default_mistral(),
        }
    }
}

/// Routing settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct RoutingConfig {
    /// Region reported in every decision.
    #[serde(default = "default_region")]
    pub region: String,
    /// Classifier implementation.
    #[serde(default)]
    pub classifier: ClassifierKind,
    /// Deployment queried by the model classifier.
    #[serde(default = "default_classifier_deployment")]
    pub classifier_deployment: String,
    /// Names plugged into the stock rules when `rules` is empty.
    #[serde(default)]
    pub deployments: DeploymentNamesConfig,
    /// Explicit rules; empty means the stock rule set.
    #[serde(default)]
    pub rules: Vec<DeploymentRule>,
    /// Deployment of the legacy provider; defaults to the Llama deployment.
    #[serde(default)]
    pub legacy: Option<Deployment>,
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            region: default_region(),
            classifier: ClassifierKind::default(),
            classifier_deployment: default_classifier_deployment(),
            deployments: DeploymentNamesConfig::default(),
            rules: Vec::new(),
            legacy: None,
        }
    }
}

impl RoutingConfig {
    /// Names for the stock rule set.
    pub fn deployment_names(&self) -> DeploymentNames {
        DeploymentNames {
            deepseek: self.deployments.deepseek.clone(),
            llama: self.deployments.llama.clone(),
            mistral: self.deployments.mistral.clone(),
        }
    }

    /// Rules in effect: the configured ones, or the stock set.
    pub fn effective_rules(&self) -> Vec<DeploymentRule> {
        if self.rules.is_empty() {
            default_rules(&self.deployment_names())
        } else {
            self.rules.clone()
        }
    }

    /// Deployment served by the legacy provider.
    pub fn legacy_deployment(&self) -> Deployment {
        self.legacy
            .clone()
            .unwrap_or_else(|| Deployment::new(MODEL_LLAMA, &self.deployments.llama))
    }
}

// ── Pricing ──────────────────────────────────────────────────────────────

/// Model prices, USD per 1K tokens.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(transparent)]
pub struct PricingConfig {
    /// Model identifier → price.
    pub models: HashMap<String, ModelPrice>,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            models: default_prices(),
        }
    }
}

// ── Resilience ───────────────────────────────────────────────────────────

/// Retry, circuit breaker and timeout settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct ResilienceConfig {
    /// Retries after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    /// Delay before the first retry; doubles per retry.
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    /// Backoff cap. Must be ≥ `base_delay_ms`.
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    /// Add random jitter to retry delays.
    #[serde(default = "default_true")]
    pub jitter: bool,
    /// Consecutive failures that open an endpoint's circuit.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: usize,
    /// Seconds an open circuit rejects calls before a trial.
    #[serde(default = "default_breaker_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Bound on a single backend attempt, in seconds.
    #[serde(default = "default_call_timeout_secs")]
    pub call_timeout_secs: u64,
}

impl Default for ResilienceConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            jitter: true,
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_breaker_cooldown_secs(),
            call_timeout_secs: default_call_timeout_secs(),
        }
    }
}

impl ResilienceConfig {
    /// Runtime settings for the resilient client.
    pub fn settings(&self) -> ResilienceSettings {
        ResilienceSettings {
            retry: RetryPolicy::exponential(
                self.max_retries,
                Duration::from_millis(self.base_delay_ms),
            )
            .with_max_delay(Duration::from_millis(self.max_delay_ms))
            .with_jitter(self.jitter),
            failure_threshold: self.failure_threshold,
            cooldown: Duration::from_secs(self.cooldown_secs),
            call_timeout: Duration::from_secs(self.call_timeout_secs),
        }
    }
}

// ── Rollout ──────────────────────────────────────────────────────────────

/// Canary settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct RolloutConfig {
    /// Phase at startup.
    #[serde(default = "default_initial_phase")]
    pub initial_phase: CanaryPhase,
    /// Retry failed new-provider requests on legacy.
    #[serde(default = "default_true")]
    pub fallback_enabled: bool,
    /// Rollback when the new provider's error rate exceeds this (0.0–1.0).
    #[serde(default = "default_error_rate_threshold")]
    pub error_rate_threshold: f64,
    /// Rollback when p95 latency exceeds this many milliseconds.
    #[serde(default = "default_p95_latency_ceiling_ms")]
    pub p95_latency_ceiling_ms: u64,
    /// Rollback when average cost per request exceeds this (USD).
    #[serde(default = "default_max_cost_per_request_usd")]
    pub max_cost_per_request_usd: f64,
    /// Requests needed before thresholds are judged.
    #[serde(default = "default_min_requests")]
    pub min_requests: u64,
    /// Breach-free time before a phase auto-advances.
    #[serde(default = "default_healthy_duration_secs")]
    pub healthy_duration_secs: u64,
    /// Time after a rollback during which promotion is refused.
    #[serde(default = "default_rollback_cooldown_secs")]
    pub rollback_cooldown_secs: u64,
    /// Health check interval.
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
    /// Advance `canary_10` and `canary_50` automatically.
    #[serde(default = "default_true")]
    pub auto_advance: bool,
    /// Rollback events retained.
    #[serde(default = "default_max_events")]
    pub max_events: usize,
    /// Latency samples retained per provider.
    #[serde(default = "default_metrics_window")]
    pub metrics_window: usize,
}

fn default_initial_phase() -> CanaryPhase {
    CanaryPhase::Initial
}

impl Default for RolloutConfig {
    fn default() -> Self {
        Self {
            initial_phase: default_initial_phase(),
            fallback_enabled: true,
            error_rate_threshold: default_error_rate_threshold(),
            p95_latency_ceiling_ms: default_p95_latency_ceiling_ms(),
            max_cost_per_request_usd: default_max_cost_per_request_usd(),
            min_requests: default_min_requests(),
            healthy_duration_secs: default_healthy_duration_secs(),
            rollback_cooldown_secs: default_rollback_cooldown_secs(),
            check_interval_secs: default_check_interval_secs(),
            auto_advance: true,
            max_events: default_max_events(),
            metrics_window: default_metrics_window(),
        }
    }
}

// ── Alerting ─────────────────────────────────────────────────────────────

/// Alert delivery settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
pub struct AlertingConfig {
    /// Minimum seconds between two alerts with the same key.
    #[serde(default = "default_alert_cooldown_secs")]
    pub cooldown_secs: u64,
    /// Webhook receiving alerts as JSON. Alerts are always logged.
    #[serde(default)]
    pub webhook_url: Option<String>,
    /// Consecutive breaching checks of the legacy provider before warning.
    #[serde(default = "default_sustained_breach_checks")]
    pub sustained_breach_checks: u32,
}

impl Default for AlertingConfig {
    fn default() -> Self {
        Self {
            cooldown_secs: default_alert_cooldown_secs(),
            webhook_url: None,
            sustained_breach_checks: default_sustained_breach_checks(),
        }
    }
}

impl AlertingConfig {
    /// Alert cooldown.
    pub fn cooldown(&self) -> Duration {
        Duration::from_secs(self.cooldown_secs)
    }
}

// ── Derived runtime settings ─────────────────────────────────────────────

impl RouterConfig {
    /// Rollback controller settings from the `rollout` and `alerting`
    /// sections.
    pub fn controller_settings(&self) -> ControllerSettings {
        let r = &self.rollout;
        ControllerSettings {
            thresholds: RolloutThresholds {
                error_rate: r.error_rate_threshold,
                p95_latency_ms: r.p95_latency_ceiling_ms,
                max_cost_per_request_usd: r.max_cost_per_request_usd,
                min_requests: r.min_requests,
            },
            healthy_duration: Duration::from_secs(r.healthy_duration_secs),
            rollback_cooldown: Duration::from_secs(r.rollback_cooldown_secs),
            auto_advance: r.auto_advance,
            max_events: r.max_events,
            sustained_breach_checks: self.alerting.sustained_breach_checks,
            check_interval: Duration::from_secs(r.check_interval_secs),
        }
    }

    /// Apply environment overrides, reading variables through `lookup`.
    ///
    /// | Variable | Field |
    /// |----------|-------|
    /// | `ROUTER_API_KEY` | `server.api_key` |
    /// | `ROUTER_REGION` | `routing.region` |
    /// | `BACKEND_ENDPOINT` | `backend.endpoint` |
    /// | `BACKEND_API_KEY` | `backend.api_key` |
    /// | `DEPLOY_DEEPSEEK` | `routing.deployments.deepseek` |
    /// | `DEPLOY_LLAMA` | `routing.deployments.llama` |
    /// | `DEPLOY_MISTRAL` | `routing.deployments.mistral` |
    /// | `DEPLOY_CLASSIFIER` | `routing.classifier_deployment` |
    ///
    /// Empty values are ignored.
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        let targets: [(&str, &mut String); 8] = [
            ("ROUTER_API_KEY", &mut self.server.api_key),
            ("ROUTER_REGION", &mut self.routing.region),
            ("BACKEND_ENDPOINT", &mut self.backend.endpoint),
            ("BACKEND_API_KEY", &mut self.backend.api_key),
            ("DEPLOY_DEEPSEEK", &mut self.routing.deployments.deepseek),
            ("DEPLOY_LLAMA", &mut self.routing.deployments.llama),
            ("DEPLOY_MISTRAL", &mut self.routing.deployments.mistral),
            ("DEPLOY_CLASSIFIER", &mut self.routing.classifier_deployment),
        ];
        for (var, field) in targets {
            if let Some(value) = lookup(var).filter(|v| !v.trim().is_empty()) {
                *field = value;
            }
        }
    }

    /// Apply overrides from the process environment.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|var| std::env::var(var).ok());
    }
}

/// Export the JSON Schema for `RouterConfig`.
///
/// # Errors
///
/// Returns `serde_json::Error` if schema serialization fails (should not
/// happen with well-formed derive macros).
///
/// # Panics
///
/// This function never panics.
pub fn schema() -> Result<String, serde_json::Error> {
    let schema = schemars::schema_for!(RouterConfig);
    serde_json::to_string_pretty(&schema)
}
