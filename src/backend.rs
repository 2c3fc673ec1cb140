//! Execution backends
//!
//! The dispatcher hands an admitted request to an [`ExecutionBackend`]
//! exactly once. Two implementations ship:
//! - [`EchoBackend`]: demo/testing backend that echoes the prompt
//! - [`HttpBackend`]: per-model inference servers speaking the
//!   OpenAI-compatible chat-completions API
//!
//! Backend failures happen after the admission decision, so they are
//! recorded on the request but never change its lifecycle state.

use crate::{AdmissionError, PromptRequest};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Trait for prompt execution targets
///
/// Implementations must be thread-safe (Send + Sync) for use across tasks.
/// The trait is object-safe to allow dynamic dispatch via `Arc<dyn ExecutionBackend>`.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Execute `request` and return the model's response text.
    async fn execute(&self, request: &PromptRequest) -> Result<String, AdmissionError>;
}

// ============================================================================
// Echo Backend (Testing)
// ============================================================================

/// Dummy echo backend for testing
///
/// Waits `delay` and returns the prompt unchanged. Useful for admission
/// smoke tests without real model servers.
#[derive(Debug, Clone)]
pub struct EchoBackend {
    /// Simulated execution delay
    pub delay: Duration,
}

impl EchoBackend {
    /// Echo backend with a 10ms delay.
    pub fn new() -> Self {
        Self::with_delay(Duration::from_millis(10))
    }

    /// Echo backend with a custom delay.
    pub fn with_delay(delay: Duration) -> Self {
        Self { delay }
    }
}

impl Default for EchoBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionBackend for EchoBackend {
    async fn execute(&self, request: &PromptRequest) -> Result<String, AdmissionError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        Ok(request.prompt().to_string())
    }
}

// ============================================================================
// HTTP Backend
// ============================================================================

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: [ChatMessage<'a>; 1],
}

#[derive(Debug, Serialize)]
struct ChatMessage<'a> {
    role: &'static str,
    content: &'a str,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatResponseMessage,
}

#[derive(Debug, Deserialize)]
struct ChatResponseMessage {
    content: String,
}

/// Inference server backend, one base URL per model
///
/// POSTs `{endpoint}/v1/chat/completions` with the prompt as a single user
/// message and returns `choices[0].message.content`.
///
/// ## Example
///
/// ```no_run
/// use tokio_prompt_admission::HttpBackend;
/// use std::time::Duration;
///
/// let backend = HttpBackend::new([("gpt4", "http://127.0.0.1:8001")])
///     .with_timeout(Duration::from_secs(10));
/// ```
pub struct HttpBackend {
    client: reqwest::Client,
    endpoints: BTreeMap<String, String>,
    timeout: Duration,
}

impl HttpBackend {
    /// Create a backend from `(model, base_url)` pairs. Trailing slashes on
    /// base URLs are ignored.
    pub fn new<I, M, U>(endpoints: I) -> Self
    where
        I: IntoIterator<Item = (M, U)>,
        M: Into<String>,
        U: Into<String>,
    {
        let endpoints = endpoints
            .into_iter()
            .map(|(m, u)| {
                let url: String = u.into();
                (m.into(), url.trim_end_matches('/').to_string())
            })
            .collect();
        Self {
            client: reqwest::Client::new(),
            endpoints,
            timeout: Duration::from_secs(30),
        }
    }

    /// Set request timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Base URL serving `model`, if configured.
    pub fn endpoint(&self, model: &str) -> Option<&str> {
        self.endpoints.get(model).map(String::as_str)
    }
}

#[async_trait]
impl ExecutionBackend for HttpBackend {
    async fn execute(&self, request: &PromptRequest) -> Result<String, AdmissionError> {
        let base = self.endpoint(request.model()).ok_or_else(|| {
            AdmissionError::Execution(format!("no endpoint for model {}", request.model()))
        })?;

        let body = ChatRequest {
            model: request.model(),
            messages: [ChatMessage {
                role: "user",
                content: request.prompt(),
            }],
        };

        let response = self
            .client
            .post(format!("{base}/v1/chat/completions"))
            .timeout(self.timeout)
            .json(&body)
            .send()
            .await
            .map_err(|e| AdmissionError::Execution(format!("backend request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_text = response.text().await.unwrap_or_default();
            return Err(AdmissionError::Execution(format!(
                "backend error {status}: {error_text}"
            )));
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| AdmissionError::Execution(format!("failed to parse response: {e}")))?;

        parsed
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| AdmissionError::Execution("response contained no choices".into()))
    }
}
