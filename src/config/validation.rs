//! Configuration validation engine.
//!
//! ## Responsibility
//! Validate semantic constraints on a parsed [`RouterConfig`] that cannot
//! be expressed through the type system alone (e.g., range checks, cross-field
//! invariants).
//!
//! ## Guarantees
//! - Every validation rule has at least one test that triggers it
//! - Validation collects *all* errors before returning (no short-circuit)
//! - Error messages include the field path and the invalid value
//!
//! ## NOT Responsible For
//! - Parsing TOML (that belongs to `loader`)
//! - File I/O (that belongs to `loader`)

use super::{BackendKind, ClassifierKind, RouterConfig};
use crate::routing::TaskType;

/// Errors arising from configuration parsing, validation, or I/O.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parsing failed.
    #[error("Parse error in {file}: {source}")]
    Parse {
        /// Path of the file that failed to parse.
        file: String,
        /// Underlying TOML deserialization error.
        #[source]
        source: toml::de::Error,
    },

    /// One or more semantic validation rules failed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A specific field has an out-of-range or contradictory value.
    #[error("Field '{field}' has invalid value {value}: {reason}")]
    InvalidField {
        /// Dot-separated field path (e.g., "resilience.base_delay_ms").
        field: String,
        /// String representation of the invalid value.
        value: String,
        /// Human-readable explanation of the constraint.
        reason: String,
    },

    /// File I/O error.
    #[error("IO error reading {file}: {source}")]
    Io {
        /// Path of the file that could not be read.
        file: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidField {
        field: field.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}

/// Validate all semantic constraints on a [`RouterConfig`].
///
/// Collects every violation before returning so the caller sees the full
/// scope of issues at once.
///
/// # Returns
///
/// - `Ok(())` if all constraints pass.
/// - `Err(Vec<ConfigError>)` with every violation found.
///
/// # Panics
///
/// This function never panics.
pub fn validate(config: &RouterConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    // ── Server ───────────────────────────────────────────────────────
    if config.server.api_key.trim().is_empty() {
        errors.push(invalid(
            "server.api_key",
            "\"\"",
            "an API key is required (set it or ROUTER_API_KEY)",
        ));
    }
    if config.server.max_request_size == 0 {
        errors.push(invalid("server.max_request_size", 0, "must be at least 1 byte"));
    }

    // ── Backend ──────────────────────────────────────────────────────
    if config.backend.kind == BackendKind::Http {
        if config.backend.endpoint.trim().is_empty() {
            errors.push(invalid(
                "backend.endpoint",
                "\"\"",
                "required for the http backend (set it or BACKEND_ENDPOINT)",
            ));
        } else if !is_http_url(&config.backend.endpoint) {
            errors.push(invalid(
                "backend.endpoint",
                &config.backend.endpoint,
                "must start with http:// or https://",
            ));
        }
    }
    if config.backend.timeout_secs == 0 {
        errors.push(invalid("backend.timeout_secs", 0, "must be at least 1 second"));
    }
    if config.backend.max_tokens == 0 {
        errors.push(invalid("backend.max_tokens", 0, "must be at least 1"));
    }
    if !(0.0..=2.0).contains(&config.backend.temperature) {
        errors.push(invalid(
            "backend.temperature",
            config.backend.temperature,
            "must be between 0.0 and 2.0",
        ));
    }

    // ── Routing ──────────────────────────────────────────────────────
    if config.routing.region.trim().is_empty() {
        errors.push(invalid("routing.region", "\"\"", "region must not be empty"));
    }
    if config.routing.classifier == ClassifierKind::Model
        && config.routing.classifier_deployment.trim().is_empty()
    {
        errors.push(invalid(
            "routing.classifier_deployment",
            "\"\"",
            "required when classifier = \"model\"",
        ));
    }
    if !config.routing.rules.is_empty() {
        let has_default = config.routing.rules.iter().any(|r| {
            r.task_type == TaskType::Chat
                && r.complexity.is_none()
                && r.language.is_none()
                && r.client_tier.is_none()
        });
        if !has_default {
            errors.push(invalid(
                "routing.rules",
                format!("{} rules", config.routing.rules.len()),
                "needs an unconditional rule with type = \"chat\" as the default",
            ));
        }
    }
    for (i, rule) in config.routing.rules.iter().enumerate() {
        if rule.deployments.is_empty() {
            errors.push(invalid(
                &format!("routing.rules[{i}].deployments"),
                "[]",
                "every rule needs at least one deployment",
            ));
        }
        for d in &rule.deployments {
            if d.deployment.trim().is_empty() || d.model.trim().is_empty() {
                errors.push(invalid(
                    &format!("routing.rules[{i}].deployments"),
                    format!("{}/{}", d.model, d.deployment),
                    "model and deployment must not be empty",
                ));
            }
        }
    }

    // ── Pricing ──────────────────────────────────────────────────────
    let mut models: Vec<_> = config.pricing.models.iter().collect();
    models.sort_by(|a, b| a.0.cmp(b.0));
    for (model, price) in models {
        for (name, value) in [
            ("input_per_1k", price.input_per_1k),
            ("output_per_1k", price.output_per_1k),
        ] {
            if !value.is_finite() || value < 0.0 {
                errors.push(invalid(
                    &format!("pricing.{model}.{name}"),
                    value,
                    "price must be a non-negative number",
                ));
            }
        }
    }

    // ── Resilience ───────────────────────────────────────────────────
    let res = &config.resilience;
    if res.base_delay_ms > res.max_delay_ms {
        errors.push(invalid(
            "resilience.base_delay_ms",
            res.base_delay_ms,
            "must be \u{2264} max_delay_ms",
        ));
    }
    if res.failure_threshold == 0 {
        errors.push(invalid("resilience.failure_threshold", 0, "must be at least 1"));
    }
    if res.cooldown_secs == 0 {
        errors.push(invalid("resilience.cooldown_secs", 0, "must be at least 1 second"));
    }
    if res.call_timeout_secs == 0 {
        errors.push(invalid(
            "resilience.call_timeout_secs",
            0,
            "must be at least 1 second",
        ));
    }

    // ── Rollout ──────────────────────────────────────────────────────
    let ro = &config.rollout;
    if !(ro.error_rate_threshold > 0.0 && ro.error_rate_threshold <= 1.0) {
        errors.push(invalid(
            "rollout.error_rate_threshold",
            ro.error_rate_threshold,
            "must be in (0.0, 1.0]",
        ));
    }
    if ro.p95_latency_ceiling_ms == 0 {
        errors.push(invalid("rollout.p95_latency_ceiling_ms", 0, "must be at least 1"));
    }
    if !(ro.max_cost_per_request_usd.is_finite() && ro.max_cost_per_request_usd > 0.0) {
        errors.push(invalid(
            "rollout.max_cost_per_request_usd",
            ro.max_cost_per_request_usd,
            "must be a positive number",
        ));
    }
    if ro.healthy_duration_secs == 0 {
        errors.push(invalid(
            "rollout.healthy_duration_secs",
            0,
            "must be at least 1 second",
        ));
    }
    if ro.check_interval_secs == 0 {
        errors.push(invalid(
            "rollout.check_interval_secs",
            0,
            "must be at least 1 second",
        ));
    }
    if ro.max_events == 0 {
        errors.push(invalid("rollout.max_events", 0, "must be at least 1"));
    }
    if ro.metrics_window == 0 {
        errors.push(invalid("rollout.metrics_window", 0, "must be at least 1"));
    }

    // ── Alerting ─────────────────────────────────────────────────────
    if let Some(url) = &config.alerting.webhook_url {
        if !is_http_url(url) {
            errors.push(invalid(
                "alerting.webhook_url",
                url,
                "must start with http:// or https://",
            ));
        }
    }
    if config.alerting.sustained_breach_checks == 0 {
        errors.push(invalid(
            "alerting.sustained_breach_checks",
            0,
            "must be at least 1",
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
