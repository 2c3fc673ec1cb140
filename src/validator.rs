//! Request validation.
//!
//! Turns a raw `(uuid, prompt, model)` triple into a [`PromptRequest`] or a
//! [`ValidationError`]. Pure and synchronous so the caller always gets a
//! definitive answer before any dispatch work starts.

use crate::registry::ModelRegistry;
use crate::PromptRequest;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Why a submission was refused at intake.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum ValidationError {
    /// UUID is not a non-negative integer that fits in 64 bits.
    #[error("malformed uuid: {0:?}")]
    MalformedUuid(String),
    /// Model is not in the registry.
    #[error("unknown model: {0:?}")]
    UnknownModel(String),
    /// Prompt is empty or whitespace only.
    #[error("prompt is empty")]
    EmptyPrompt,
}

impl ValidationError {
    /// Stable snake_case tag for wire responses and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::MalformedUuid(_) => "malformed_uuid",
            Self::UnknownModel(_) => "unknown_model",
            Self::EmptyPrompt => "empty_prompt",
        }
    }
}

/// A submission as decoded off the wire, before validation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawSubmission {
    /// Decimal request id.
    pub uuid: String,
    /// Prompt text.
    pub prompt: String,
    /// Requested model.
    pub model: String,
}

impl RawSubmission {
    /// Validate this submission against `registry`.
    ///
    /// # Errors
    ///
    /// See [`validate`].
    pub fn validate(&self, registry: &ModelRegistry) -> Result<PromptRequest, ValidationError> {
        validate(registry, &self.uuid, &self.prompt, &self.model)
    }
}

/// Validate a raw submission.
///
/// Checks run in order: UUID, model, prompt; the first failure is returned.
///
/// # Errors
///
/// - [`ValidationError::MalformedUuid`] unless `uuid` is ASCII digits only and fits `u64`
/// - [`ValidationError::UnknownModel`] unless `registry` contains `model` exactly
/// - [`ValidationError::EmptyPrompt`] if `prompt` has no non-whitespace character
///
/// # Panics
///
/// This function never panics.
///
/// # Example
///
/// ```rust
/// use tokio_prompt_admission::{validate, ModelRegistry, ValidationError};
/// let registry = ModelRegistry::new(["gpt4"]);
/// let req = validate(&registry, "42", "hello", "gpt4").unwrap();
/// assert_eq!(req.uuid(), 42);
/// assert_eq!(
///     validate(&registry, "42", "hello", "gpt9"),
///     Err(ValidationError::UnknownModel("gpt9".into()))
/// );
/// ```
pub fn validate(
    registry: &ModelRegistry,
    uuid: &str,
    prompt: &str,
    model: &str,
) -> Result<PromptRequest, ValidationError> {
    let uuid = parse_uuid(uuid)?;

    if !registry.contains(model) {
        return Err(ValidationError::UnknownModel(model.to_string()));
    }

    if prompt.trim().is_empty() {
        return Err(ValidationError::EmptyPrompt);
    }

    Ok(PromptRequest::new(uuid, prompt.to_string(), model.to_string()))
}

fn parse_uuid(raw: &str) -> Result<u64, ValidationError> {
    // `u64::from_str` accepts a leading '+', the wire format does not.
    if raw.is_empty() || !raw.bytes().all(|b| b.is_ascii_digit()) {
        return Err(ValidationError::MalformedUuid(raw.to_string()));
    }
    raw.parse::<u64>()
        .map_err(|_| ValidationError::MalformedUuid(raw.to_string()))
}
