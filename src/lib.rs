//! # tokio-prompt-admission
//!
//! Telemetry-gated admission of prompt-execution jobs over Tokio.
//!
//! ## Architecture
//!
//! Two independent entry points meet only at the [`WorkerIdentity`] key:
//! ```text
//! submission ─► validator ─► CorrelationStore ─► Dispatcher pool ─► ExecutionBackend
//!                                   ▲                  │ verdict?
//! telemetry  ─► ingestion ─► AdmissionPolicy ◄─────────┘
//! ```
//!
//! A request is handed to the backend only while the policy holds a fresh
//! accept verdict for its identity. Missing or stale telemetry rejects.

// ── Lint policy (aerospace-grade) ─────────────────────────────────────────
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(missing_docs)]

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;
use tracing_subscriber::EnvFilter;

pub mod backend;
pub mod config;
pub mod dispatch;
pub mod metrics;
pub mod policy;
pub mod registry;
pub mod retry;
pub mod service;
pub mod store;
pub mod telemetry;
pub mod validator;

#[cfg(feature = "web-api")]
pub mod web_api;

// Re-exports for convenience
pub use backend::{EchoBackend, ExecutionBackend, HttpBackend};
pub use config::{GatewayConfig, LogFormat};
pub use dispatch::{DispatchEvent, Dispatcher, DispatcherSettings, Enqueued, ShutdownReport};
pub use policy::{AdmissionPolicy, Thresholds, Verdict};
pub use registry::ModelRegistry;
pub use service::{AdmissionService, ServiceStats, SubmitAck};
pub use store::{
    CorrelationEntry, CorrelationStore, ExecutionOutcome, FailureReason, RequestState, RequestStatus,
};
pub use telemetry::{RejectedSample, SampleReading, TelemetryAck, TelemetryIngestor};
pub use validator::{validate, RawSubmission, ValidationError};

/// Initialise the global tracing subscriber.
///
/// `format` selects the output style; the `LOG_FORMAT` environment variable,
/// when set to `"json"` or `"pretty"`, overrides it:
/// - [`LogFormat::Json`]: structured JSON output for log aggregators
/// - [`LogFormat::Pretty`]: human-readable output for local development
///
/// Filter level is controlled by `RUST_LOG` (e.g. `RUST_LOG=info`).
///
/// # Errors
///
/// Returns [`AdmissionError::Other`] if the global subscriber has already
/// been set (e.g. by a previous call or a test harness).
///
/// # Panics
///
/// This function never panics.
pub fn init_tracing(format: LogFormat) -> Result<(), AdmissionError> {
    let format = match std::env::var("LOG_FORMAT").as_deref() {
        Ok("json") => LogFormat::Json,
        Ok("pretty") => LogFormat::Pretty,
        _ => format,
    };

    let result = match format {
        LogFormat::Json => tracing_subscriber::fmt()
            .json()
            .with_env_filter(EnvFilter::from_default_env())
            .with_current_span(true)
            .with_span_list(true)
            .try_init(),
        LogFormat::Pretty => tracing_subscriber::fmt()
            .pretty()
            .with_env_filter(EnvFilter::from_default_env())
            .try_init(),
    };

    result.map_err(|e| AdmissionError::Other(format!("tracing init failed: {e}")))
}

/// Top-level errors for the admission core and its collaborators.
///
/// Request-level rejections have their own types
/// ([`ValidationError`], [`RejectedSample`]); this enum covers the plumbing.
#[derive(Error, Debug)]
pub enum AdmissionError {
    /// An internal channel closed unexpectedly, indicating shutdown.
    #[error("channel closed unexpectedly")]
    ChannelClosed,

    /// The execution backend failed after handoff (network, API, or parsing error).
    #[error("execution failed: {0}")]
    Execution(String),

    /// A configuration value is missing or invalid.
    ///
    /// Returned at construction time so misconfiguration surfaces at startup
    /// rather than at the first dispatch.
    #[error("configuration error: {0}")]
    ConfigError(String),

    /// Catch-all for errors that do not fit a specific variant.
    #[error("{0}")]
    Other(String),
}

/// Correlation key shared by the submission and telemetry streams.
///
/// For a prompt, `client_key` is the decimal UUID and `model` its model
/// name. Matching is exact: no trimming or case folding.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkerIdentity {
    /// Client key (`userID` on the telemetry wire).
    #[serde(alias = "userID", alias = "user_id")]
    pub client_key: String,
    /// Model identifier.
    pub model: String,
}

impl WorkerIdentity {
    /// Create an identity from any string-like parts.
    pub fn new(client_key: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            client_key: client_key.into(),
            model: model.into(),
        }
    }

    /// Derive the identity that governs admission of `request`.
    pub fn for_request(request: &PromptRequest) -> Self {
        Self::new(request.uuid().to_string(), request.model())
    }
}

impl fmt::Display for WorkerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.client_key, self.model)
    }
}

/// A validated prompt-execution request.
///
/// Only [`validate`] creates one, so holding a `PromptRequest` proves the
/// UUID parsed, the model is registered and the prompt is non-empty.
/// Fields are read-only after construction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PromptRequest {
    uuid: u64,
    prompt: String,
    model: String,
}

impl PromptRequest {
    pub(crate) fn new(uuid: u64, prompt: String, model: String) -> Self {
        Self {
            uuid,
            prompt,
            model,
        }
    }

    /// Globally unique request id; the idempotency key for dispatch.
    pub fn uuid(&self) -> u64 {
        self.uuid
    }

    /// Prompt text. Never logged.
    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    /// Registered model name.
    pub fn model(&self) -> &str {
        &self.model
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_for_request_uses_decimal_uuid_and_model() {
        let req = PromptRequest::new(42, "hello".into(), "gpt4".into());
        let id = WorkerIdentity::for_request(&req);
        assert_eq!(id, WorkerIdentity::new("42", "gpt4"));
    }

    #[test]
    fn test_identity_match_is_exact() {
        assert_ne!(
            WorkerIdentity::new("42", "gpt4"),
            WorkerIdentity::new("42", "GPT4")
        );
        assert_ne!(
            WorkerIdentity::new("042", "gpt4"),
            WorkerIdentity::new("42", "gpt4")
        );
    }

    #[test]
    fn test_identity_display() {
        assert_eq!(WorkerIdentity::new("7", "gpt3").to_string(), "7/gpt3");
    }

    #[test]
    fn test_identity_deserializes_from_telemetry_wire_names() {
        let id: WorkerIdentity =
            serde_json::from_str(r#"{"userID": "42", "model": "gpt4"}"#).expect("test: parse");
        assert_eq!(id, WorkerIdentity::new("42", "gpt4"));
    }

    #[test]
    fn test_config_error_display_includes_message() {
        let err = AdmissionError::ConfigError("no models".to_string());
        assert!(err.to_string().contains("no models"));
    }

    #[test]
    fn test_init_tracing_second_call_returns_err() {
        // First call may succeed or fail depending on test execution order.
        let _ = init_tracing(LogFormat::Pretty);
        let result = init_tracing(LogFormat::Pretty);
        assert!(result.is_err(), "double init must return Err, not panic");
    }
}
