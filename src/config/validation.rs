//! Configuration validation engine.
//!
//! ## Responsibility
//! Validate semantic constraints on a parsed [`GatewayConfig`] that cannot
//! be expressed through the type system alone (range checks, cross-field
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

use super::{BackendKind, GatewayConfig};
use std::collections::HashSet;

/// Errors produced while loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML syntax or type mismatch.
    #[error("Parse error in {file}: {source}")]
    Parse {
        /// Source name (file path or label).
        file: String,
        /// Underlying TOML error.
        #[source]
        source: toml::de::Error,
    },

    /// One or more semantic rules failed; messages joined by newlines.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A single field violates a rule.
    #[error("Field '{field}' has invalid value {value}: {reason}")]
    InvalidField {
        /// Dotted field path, e.g. `admission.max_vram_usage`.
        field: String,
        /// Offending value, rendered.
        value: String,
        /// Rule that failed.
        reason: String,
    },

    /// The file could not be read.
    #[error("IO error reading {file}: {source}")]
    Io {
        /// Path that failed.
        file: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidField {
        field: field.into(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

fn is_fraction(v: f64) -> bool {
    (0.0..=1.0).contains(&v)
}

/// Check every semantic rule on `config`.
///
/// # Errors
///
/// Returns every violated rule as a [`ConfigError::InvalidField`].
///
/// # Panics
///
/// This function never panics.
pub fn validate(config: &GatewayConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    // ── Registry ─────────────────────────────────────────────────────
    if config.registry.models.is_empty() {
        errors.push(invalid(
            "registry.models",
            "[]",
            "at least one model must be registered",
        ));
    }
    let mut seen = HashSet::new();
    for model in &config.registry.models {
        if model.trim().is_empty() {
            errors.push(invalid(
                "registry.models",
                format!("{model:?}"),
                "model name must not be empty",
            ));
        } else if !seen.insert(model.as_str()) {
            errors.push(invalid(
                "registry.models",
                format!("{model:?}"),
                "model listed more than once",
            ));
        }
    }

    // ── Admission thresholds ─────────────────────────────────────────
    let a = &config.admission;
    if !is_fraction(a.max_gpu_utilization) {
        errors.push(invalid(
            "admission.max_gpu_utilization",
            a.max_gpu_utilization,
            "must be between 0.0 and 1.0",
        ));
    }
    if !is_fraction(a.max_vram_usage) {
        errors.push(invalid(
            "admission.max_vram_usage",
            a.max_vram_usage,
            "must be between 0.0 and 1.0",
        ));
    }
    if !(a.max_power_draw_w.is_finite() && a.max_power_draw_w >= 0.0) {
        errors.push(invalid(
            "admission.max_power_draw_w",
            a.max_power_draw_w,
            "must be a finite value \u{2265} 0",
        ));
    }
    if a.freshness_window_ms == 0 {
        errors.push(invalid(
            "admission.freshness_window_ms",
            0,
            "must be at least 1ms",
        ));
    }

    // ── Dispatch ─────────────────────────────────────────────────────
    let d = &config.dispatch;
    if d.workers == 0 {
        errors.push(invalid("dispatch.workers", 0, "must be at least 1"));
    }
    if d.queue_capacity == 0 {
        errors.push(invalid("dispatch.queue_capacity", 0, "must be at least 1"));
    }
    if d.retry_attempts == 0 {
        errors.push(invalid("dispatch.retry_attempts", 0, "must be at least 1"));
    }
    if d.retry_base_ms > d.retry_max_ms {
        errors.push(invalid(
            "dispatch.retry_base_ms",
            d.retry_base_ms,
            "must be \u{2264} retry_max_ms",
        ));
    }
    if d.sweep_interval_s == 0 {
        errors.push(invalid(
            "dispatch.sweep_interval_s",
            0,
            "must be at least 1 second",
        ));
    }
    // Sweeping evicts telemetry older than the retention window.
    if d.retention_s.saturating_mul(1000) < a.freshness_window_ms {
        errors.push(invalid(
            "dispatch.retention_s",
            d.retention_s,
            "must cover admission.freshness_window_ms",
        ));
    }

    // ── Backend ──────────────────────────────────────────────────────
    let b = &config.backend;
    if b.kind == BackendKind::Http {
        if b.timeout_ms == 0 {
            errors.push(invalid("backend.timeout_ms", 0, "must be at least 1ms"));
        }
        for model in &config.registry.models {
            match b.endpoints.get(model) {
                None => errors.push(invalid(
                    "backend.endpoints",
                    model,
                    "every registered model needs an endpoint when kind = \"http\"",
                )),
                Some(url) if !(url.starts_with("http://") || url.starts_with("https://")) => {
                    errors.push(invalid(
                        &format!("backend.endpoints.{model}"),
                        url,
                        "must be an http:// or https:// URL",
                    ))
                }
                Some(_) => {}
            }
        }
    }

    // ── Server ───────────────────────────────────────────────────────
    if config.server.host.trim().is_empty() {
        errors.push(invalid("server.host", "", "host must not be empty"));
    }
    if config.server.max_request_size == 0 {
        errors.push(invalid(
            "server.max_request_size",
            0,
            "must be at least 1 byte",
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
