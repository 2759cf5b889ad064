//! Backend model collaborators.
//!
//! A [`ModelBackend`] turns a [`CompletionRequest`] into a [`Completion`]
//! or a classified [`RouterError`]. The resilient client treats it as a
//! black box; everything about retries and breakers lives above this layer.
//!
//! - [`HttpBackend`]: chat-completions endpoint, deployment selected by header.
//! - [`EchoBackend`]: testing/demo backend with no network.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::routing::Usage;
use crate::RouterError;

/// Header naming the target deployment on a shared inference endpoint.
pub const DEPLOYMENT_HEADER: &str = "azureml-model-deployment";

/// One completion call against a deployment.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionRequest {
    /// Target deployment name.
    pub deployment: String,
    /// System message.
    pub system_prompt: String,
    /// User message.
    pub prompt: String,
    /// Generation cap.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
}

/// Backend answer.
#[derive(Debug, Clone, PartialEq)]
pub struct Completion {
    /// Generated text.
    pub text: String,
    /// Usage, when the backend reports it.
    pub usage: Option<Usage>,
}

/// Generation settings shared by every provider.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionSettings {
    /// System message sent with every prompt.
    pub system_prompt: String,
    /// Generation cap.
    pub max_tokens: u32,
    /// Sampling temperature.
    pub temperature: f32,
}

impl CompletionSettings {
    /// Build a request for `deployment` carrying `prompt`.
    pub fn request(&self, deployment: &str, prompt: &str) -> CompletionRequest {
        CompletionRequest {
            deployment: deployment.to_string(),
            system_prompt: self.system_prompt.clone(),
            prompt: prompt.to_string(),
            max_tokens: self.max_tokens,
            temperature: self.temperature,
        }
    }
}

impl Default for CompletionSettings {
    fn default() -> Self {
        Self {
            system_prompt: "You are a helpful assistant.".to_string(),
            max_tokens: 2048,
            temperature: 0.7,
        }
    }
}

/// Trait for model backends.
///
/// Implementations must be thread-safe (Send + Sync) for use across tasks
/// and object-safe for dynamic dispatch via `Arc<dyn ModelBackend>`.
#[async_trait]
pub trait ModelBackend: Send + Sync {
    /// Run one completion.
    ///
    /// # Errors
    ///
    /// Returns a [`RouterError`] classified so that callers can decide on
    /// retries: [`RouterError::Timeout`], [`RouterError::Connection`],
    /// [`RouterError::Service`] and [`RouterError::RateLimited`] are
    /// transient, [`RouterError::Rejected`] is not.
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, RouterError>;
}

/// Rough usage estimate (4 characters per token) for backends that do not
/// report usage.
pub fn estimate_usage(prompt: &str, output: &str) -> Usage {
    let tokens = |s: &str| (s.chars().count() as u64).div_ceil(4);
    let prompt_tokens = tokens(prompt);
    let completion_tokens = tokens(output);
    Usage {
        prompt_tokens,
        completion_tokens,
        total_tokens: prompt_tokens + completion_tokens,
    }
}

// ============================================================================
// Echo Backend (Testing)
// ============================================================================

/// Dummy echo backend for testing.
///
/// Returns the prompt prefixed with the deployment name and reports a
/// whitespace-token usage. Useful for smoke tests without real model dependencies.
#[derive(Debug, Clone)]
pub struct EchoBackend {
    /// Simulated inference delay.
    pub delay_ms: u64,
}

impl EchoBackend {
    /// Echo backend with a 10 ms delay.
    pub fn new() -> Self {
        Self { delay_ms: 10 }
    }

    /// Echo backend with a custom delay.
    pub fn with_delay(delay_ms: u64) -> Self {
        Self { delay_ms }
    }
}

impl Default for EchoBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ModelBackend for EchoBackend {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, RouterError> {
        tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;

        let prompt_tokens = request.prompt.split_whitespace().count() as u64;
        Ok(Completion {
            text: format!("[{}] {}", request.deployment, request.prompt),
            usage: Some(Usage {
                prompt_tokens,
                completion_tokens: prompt_tokens,
                total_tokens: prompt_tokens * 2,
            }),
        })
    }
}

// ============================================================================
// HTTP Backend
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    messages: [ChatMessage<'a>; 2],
    max_tokens: u32,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    #[serde(default)]
    message: Option<ChatChoiceMessage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
    #[serde(default)]
    total_tokens: u64,
}

/// Chat-completions backend on a shared inference endpoint.
///
/// Posts to `{endpoint}/chat/completions` with a bearer key and the
/// [`DEPLOYMENT_HEADER`] naming the target deployment.
///
/// ## Example
///
/// ```no_run
/// use rollout_router::HttpBackend;
/// use std::time::Duration;
///
/// let backend = HttpBackend::new("https://example.inference.ai.azure.com", "key")
///     .with_timeout(Duration::from_secs(30));
/// ```
#[derive(Debug, Clone)]
pub struct HttpBackend {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
    timeout: Duration,
}

impl HttpBackend {
    /// Create a backend for `endpoint` authenticated with `api_key`.
    pub fn new(endpoint: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            timeout: Duration::from_secs(60),
        }
    }

    /// Set the per-request HTTP timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn url(&self) -> String {
        format!("{}/chat/completions", self.endpoint)
    }

    fn classify_transport_error(&self, e: &reqwest::Error) -> RouterError {
        if e.is_timeout() {
            RouterError::Timeout(u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX))
        } else if e.is_connect() {
            RouterError::Connection(format!("{}: {e}", self.endpoint))
        } else {
            RouterError::Connection(format!("request to {} failed: {e}", self.endpoint))
        }
    }
}

/// Map a non-success HTTP status to an error class.
pub fn error_for_status(status: u16, body: String) -> RouterError {
    match status {
        429 => RouterError::RateLimited(body),
        500..=599 => RouterError::Service {
            status,
            message: body,
        },
        _ => RouterError::Rejected {
            status,
            message: body,
        },
    }
}

#[async_trait]
impl ModelBackend for HttpBackend {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, RouterError> {
        let body = ChatRequest {
            messages: [
                ChatMessage {
                    role: "system",
                    content: &request.system_prompt,
                },
                ChatMessage {
                    role: "user",
                    content: &request.prompt,
                },
            ],
            max_tokens: request.max_tokens,
            temperature: request.temperature,
        };

        let response = self
            .client
            .post(self.url())
            .bearer_auth(&self.api_key)
            .header(DEPLOYMENT_HEADER, &request.deployment)
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| self.classify_transport_error(&e))?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(error_for_status(status.as_u16(), text));
        }

        let parsed: ChatResponse = response.json().await.map_err(|e| {
            if e.is_timeout() {
                self.classify_transport_error(&e)
            } else {
                RouterError::Service {
                    status: status.as_u16(),
                    message: format!("malformed completion body: {e}"),
                }
            }
        })?;

        let text = parsed
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message)
            .and_then(|m| m.content)
            .unwrap_or_default();

        let usage = parsed.usage.map(|u| Usage {
            prompt_tokens: u.prompt_tokens,
            completion_tokens: u.completion_tokens,
            total_tokens: u.total_tokens,
        });

        debug!(
            deployment = %request.deployment,
            chars = text.len(),
            has_usage = usage.is_some(),
            "backend call completed"
        );

        Ok(Completion { text, usage })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> CompletionRequest {
        CompletionSettings::default().request("dep-a", "hello there world")
    }

    #[tokio::test]
    async fn test_echo_backend_reports_usage() {
        let completion = EchoBackend::with_delay(0).complete(&request()).await.unwrap();
        assert_eq!(completion.text, "[dep-a] hello there world");
        let usage = completion.usage.unwrap();
        assert_eq!(usage.prompt_tokens, 3);
        assert_eq!(usage.total_tokens, 6);
    }

    #[test]
    fn test_status_mapping() {
        assert!(matches!(error_for_status(429, String::new()), RouterError::RateLimited(_)));
        assert!(matches!(
            error_for_status(503, String::new()),
            RouterError::Service { status: 503, .. }
        ));
        assert!(matches!(
            error_for_status(400, String::new()),
            RouterError::Rejected { status: 400, .. }
        ));
        assert!(!error_for_status(404, String::new()).is_transient());
    }

    #[test]
    fn test_estimate_usage_rounds_up() {
        let usage = estimate_usage("abcde", "");
        assert_eq!(usage.prompt_tokens, 2);
        assert_eq!(usage.completion_tokens, 0);
        assert_eq!(usage.total_tokens, 2);
    }

    #[test]
    fn test_http_backend_trims_trailing_slash() {
        let backend = HttpBackend::new("http://localhost:9/", "k");
        assert_eq!(backend.url(), "http://localhost:9/chat/completions");
    }
}
