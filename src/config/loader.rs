//! Configuration file loading.
//!
//! ## Responsibility
//! Read a TOML file from disk, parse it into a [`RouterConfig`], apply
//! environment overrides, and run validation before returning. This is the
//! primary entry point for loading router configuration at startup.
//!
//! ## Guarantees
//! - A successfully loaded config is always validated
//! - I/O errors and parse errors are distinguished in the error type
//! - File path is included in every error message
//!
//! ## NOT Responsible For
//! - Defining the config schema (that belongs to `mod.rs`)

use std::path::Path;

use super::validation::{self, ConfigError};
use super::RouterConfig;

/// Load a [`RouterConfig`] from a TOML file, applying environment
/// overrides (see [`RouterConfig::apply_overrides`]).
///
/// # Returns
///
/// - `Ok(RouterConfig)` if the file is readable, well-formed, and valid.
/// - `Err(ConfigError::Io)` if the file cannot be read.
/// - `Err(ConfigError::Parse)` if the TOML is malformed.
/// - `Err(ConfigError::Validation)` if semantic constraints are violated.
///
/// # Panics
///
/// This function never panics.
///
/// # Example
///
/// ```rust,ignore
/// use rollout_router::config::loader::load_from_file;
/// use std::path::Path;
///
/// let config = load_from_file(Path::new("router.toml"))?;
/// println!("Listening on port {}", config.server.port);
/// ```
pub fn load_from_file(path: &Path) -> Result<RouterConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        file: path.display().to_string(),
        source: e,
    })?;

    load_with_overrides(&content, &path.display().to_string(), |var| {
        std::env::var(var).ok()
    })
}

/// Build a config from defaults and the environment alone, for running
/// without a file.
///
/// # Errors
///
/// `ConfigError::Validation` if the resulting config is invalid (for
/// instance no `ROUTER_API_KEY` is set).
pub fn load_from_env() -> Result<RouterConfig, ConfigError> {
    load_with_overrides("", "<environment>", |var| std::env::var(var).ok())
}

/// Load a [`RouterConfig`] from a TOML string. No environment overrides
/// are applied.
///
/// # Returns
///
/// - `Ok(RouterConfig)` if the TOML is well-formed and valid.
/// - `Err(ConfigError::Parse)` if the TOML is malformed.
/// - `Err(ConfigError::Validation)` if semantic constraints are violated.
///
/// # Panics
///
/// This function never panics.
pub fn load_from_str(content: &str, source_name: &str) -> Result<RouterConfig, ConfigError> {
    load_with_overrides(content, source_name, |_| None)
}

/// Parse `content`, apply overrides from `lookup`, then validate.
///
/// # Errors
///
/// `ConfigError::Parse` or `ConfigError::Validation`.
pub fn load_with_overrides(
    content: &str,
    source_name: &str,
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<RouterConfig, ConfigError> {
    let mut config: RouterConfig = toml::from_str(content).map_err(|e| ConfigError::Parse {
        file: source_name.to_string(),
        source: e,
    })?;

    config.apply_overrides(lookup);

    validation::validate(&config).map_err(|errors| {
        ConfigError::Validation(
            errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("\n"),
        )
    })?;

    Ok(config)
}
