//! # Declarative Gateway Configuration
//!
//! ## Responsibility
//! Parse and validate the TOML file that fixes the model registry, the
//! admission thresholds, the dispatcher pool, the execution backend and the
//! HTTP surface. Run with:
//! ```text
//! prompt-admission --config admission.toml
//! ```
//!
//! ## Guarantees
//! - Deterministic: same TOML input always produces the same `GatewayConfig`
//! - Validated: all semantic constraints are checked before a config is accepted
//! - Complete defaults: an empty file is a valid configuration
//! - Immutable: loaded once at startup, never reloaded while running
//! - Schema-exportable: JSON Schema output enables IDE autocomplete
//!
//! ## NOT Responsible For
//! - Starting the service from config (that belongs to `service`)
//! - Metrics collection (that belongs to `metrics`)

pub mod loader;
pub mod validation;

use crate::policy::Thresholds;
use crate::registry::ModelRegistry;
use crate::retry::RetryPolicy;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

// ── Default value functions ──────────────────────────────────────────────

fn default_models() -> Vec<String> {
    vec!["gpt5".into(), "gpt4".into(), "gpt3".into()]
}

fn default_max_gpu_utilization() -> f64 {
    0.9
}

fn default_max_power_draw_w() -> f64 {
    300.0
}

fn default_max_vram_usage() -> f64 {
    0.95
}

/// Default freshness window: 30 seconds.
fn default_freshness_window_ms() -> u64 {
    30_000
}

fn default_workers() -> usize {
    8
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_retry_attempts() -> u32 {
    3
}

/// Default retry base delay: 100ms.
fn default_retry_base_ms() -> u64 {
    100
}

/// Default retry maximum delay: 5000ms.
fn default_retry_max_ms() -> u64 {
    5000
}

fn default_shutdown_grace_ms() -> u64 {
    5000
}

/// Default retention of terminal records: 5 minutes.
fn default_retention_s() -> u64 {
    300
}

fn default_sweep_interval_s() -> u64 {
    30
}

fn default_echo_delay_ms() -> u64 {
    10
}

fn default_backend_timeout_ms() -> u64 {
    30_000
}

fn default_host() -> String {
    "0.0.0.0".into()
}

fn default_port() -> u16 {
    8080
}

/// Default request body limit: 1 MiB.
fn default_max_request_size() -> usize {
    1024 * 1024
}

// ── Top-level config ─────────────────────────────────────────────────────

/// Root configuration for a gateway instance.
///
/// Deserialized from a TOML file and validated before use. Every section
/// and field has a documented default.
///
/// # Example
///
/// ```toml
/// [registry]
/// models = ["gpt4", "gpt3"]
///
/// [admission]
/// max_gpu_utilization = 0.8
/// freshness_window_ms = 10000
/// ```
///
/// # Panics
///
/// This type never panics during construction or access.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct GatewayConfig {
    /// Models the gateway accepts.
    pub registry: RegistryConfig,
    /// Thresholds and freshness window.
    pub admission: AdmissionConfig,
    /// Worker pool, queue and retry schedule.
    pub dispatch: DispatchConfig,
    /// Where admitted prompts are executed.
    pub backend: BackendConfig,
    /// HTTP listener.
    pub server: ServerConfig,
    /// Logging.
    pub observability: ObservabilityConfig,
}

impl GatewayConfig {
    /// Immutable registry built from `[registry] models`.
    pub fn model_registry(&self) -> ModelRegistry {
        ModelRegistry::new(self.registry.models.iter().cloned())
    }

    /// Thresholds from `[admission]`.
    pub fn thresholds(&self) -> Thresholds {
        Thresholds {
            max_gpu_utilization: self.admission.max_gpu_utilization,
            max_power_draw_w: self.admission.max_power_draw_w,
            max_vram_usage: self.admission.max_vram_usage,
        }
    }

    /// Freshness window `F`.
    pub fn freshness_window(&self) -> Duration {
        Duration::from_millis(self.admission.freshness_window_ms)
    }

    /// Retry schedule for admission attempts.
    pub fn retry_policy(&self) -> RetryPolicy {
        let d = &self.dispatch;
        let base = Duration::from_millis(d.retry_base_ms);
        let cap = Duration::from_millis(d.retry_max_ms);
        let mut policy = match d.backoff {
            BackoffKind::Fixed => RetryPolicy::fixed(d.retry_attempts, base),
            BackoffKind::Linear => RetryPolicy::linear(d.retry_attempts, base, base),
            BackoffKind::Exponential => RetryPolicy::exponential(d.retry_attempts, base),
        };
        match &mut policy.strategy {
            crate::retry::RetryStrategy::Exponential { max_delay, .. }
            | crate::retry::RetryStrategy::Linear { max_delay, .. } => *max_delay = cap,
            crate::retry::RetryStrategy::Fixed(_) => {}
        }
        policy.with_jitter(d.jitter)
    }
}

// ── Registry ─────────────────────────────────────────────────────────────

/// Accepted model names. Matching is exact.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct RegistryConfig {
    /// Model identifiers, e.g. `["gpt5", "gpt4", "gpt3"]`.
    pub models: Vec<String>,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            models: default_models(),
        }
    }
}

// ── Admission ────────────────────────────────────────────────────────────

/// Thresholds `U_max`, `P_max`, `V_max` and freshness window `F`.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct AdmissionConfig {
    /// `U_max`, in `[0, 1]`. Default 0.9.
    pub max_gpu_utilization: f64,
    /// `P_max` in watts, `>= 0`. Default 300.
    pub max_power_draw_w: f64,
    /// `V_max`, in `[0, 1]`. Default 0.95.
    pub max_vram_usage: f64,
    /// `F` in milliseconds, `> 0`. Default 30 000.
    pub freshness_window_ms: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_gpu_utilization: default_max_gpu_utilization(),
            max_power_draw_w: default_max_power_draw_w(),
            max_vram_usage: default_max_vram_usage(),
            freshness_window_ms: default_freshness_window_ms(),
        }
    }
}

// ── Dispatch ─────────────────────────────────────────────────────────────

/// Backoff schedule between admission attempts.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffKind {
    /// Constant `retry_base_ms`.
    Fixed,
    /// `retry_base_ms * n`, capped at `retry_max_ms`.
    Linear,
    /// `retry_base_ms * 2^(n-1)`, capped at `retry_max_ms`.
    #[default]
    Exponential,
}

/// Dispatcher pool settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct DispatchConfig {
    /// Worker tasks. `>= 1`.
    pub workers: usize,
    /// Bounded queue capacity. `>= 1`.
    pub queue_capacity: usize,
    /// Admission attempts per request, including the first. `>= 1`.
    pub retry_attempts: u32,
    /// Backoff schedule.
    pub backoff: BackoffKind,
    /// First backoff delay in milliseconds.
    pub retry_base_ms: u64,
    /// Backoff cap in milliseconds. Must be `>= retry_base_ms`.
    pub retry_max_ms: u64,
    /// Add up to 25% random jitter to every delay.
    pub jitter: bool,
    /// Drain period on shutdown before retries are cancelled.
    pub shutdown_grace_ms: u64,
    /// How long terminal records stay queryable.
    pub retention_s: u64,
    /// Sweeper period.
    pub sweep_interval_s: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            queue_capacity: default_queue_capacity(),
            retry_attempts: default_retry_attempts(),
            backoff: BackoffKind::default(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
            jitter: false,
            shutdown_grace_ms: default_shutdown_grace_ms(),
            retention_s: default_retention_s(),
            sweep_interval_s: default_sweep_interval_s(),
        }
    }
}

// ── Backend ──────────────────────────────────────────────────────────────

/// Which execution backend to build.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Echo the prompt after `echo_delay_ms` (demos, tests).
    #[default]
    Echo,
    /// OpenAI-compatible chat-completions servers, one per model.
    Http,
}

/// Execution backend settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct BackendConfig {
    /// Backend implementation.
    pub kind: BackendKind,
    /// Echo delay in milliseconds.
    pub echo_delay_ms: u64,
    /// HTTP request timeout in milliseconds.
    pub timeout_ms: u64,
    /// Model name to base URL. Required for every registry model when
    /// `kind = "http"`.
    pub endpoints: BTreeMap<String, String>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            echo_delay_ms: default_echo_delay_ms(),
            timeout_ms: default_backend_timeout_ms(),
            endpoints: BTreeMap::new(),
        }
    }
}

// ── Server ───────────────────────────────────────────────────────────────

/// HTTP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Request body limit in bytes.
    pub max_request_size: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            max_request_size: default_max_request_size(),
        }
    }
}

// ── Observability ────────────────────────────────────────────────────────

/// Observability settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct ObservabilityConfig {
    /// Log output format.
    pub log_format: LogFormat,
}

/// Log output format.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable, for local development.
    #[default]
    Pretty,
    /// Structured JSON, for log aggregators.
    Json,
}

/// Export the JSON Schema for [`GatewayConfig`].
///
/// # Errors
///
/// Returns a serialization error if the schema cannot be rendered.
pub fn export_schema() -> Result<String, serde_json::Error> {
    let schema = schemars::schema_for!(GatewayConfig);
    serde_json::to_string_pretty(&schema)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::retry::RetryStrategy;

    #[test]
    fn test_empty_toml_yields_defaults() {
        let config: GatewayConfig = toml::from_str("").expect("test: empty TOML parses");
        assert_eq!(config, GatewayConfig::default());
        assert_eq!(config.registry.models, vec!["gpt5", "gpt4", "gpt3"]);
        assert_eq!(config.admission.freshness_window_ms, 30_000);
        assert_eq!(config.dispatch.backoff, BackoffKind::Exponential);
        assert_eq!(config.backend.kind, BackendKind::Echo);
        assert_eq!(config.observability.log_format, LogFormat::Pretty);
    }

    #[test]
    fn test_partial_section_keeps_other_defaults() {
        let config: GatewayConfig = toml::from_str(
            r#"
[admission]
max_gpu_utilization = 0.8
"#,
        )
        .expect("test: parses");
        assert_eq!(config.admission.max_gpu_utilization, 0.8);
        assert_eq!(config.admission.max_power_draw_w, 300.0);
    }

    #[test]
    fn test_full_toml_parses() {
        let config: GatewayConfig = toml::from_str(
            r#"
[registry]
models = ["gpt4"]

[admission]
max_gpu_utilization = 0.7
max_power_draw_w = 250.0
max_vram_usage = 0.8
freshness_window_ms = 5000

[dispatch]
workers = 2
queue_capacity = 16
retry_attempts = 5
backoff = "linear"
retry_base_ms = 50
retry_max_ms = 120
jitter = true

[backend]
kind = "http"
timeout_ms = 1000
[backend.endpoints]
gpt4 = "http://127.0.0.1:8001"

[server]
port = 9000

[observability]
log_format = "json"
"#,
        )
        .expect("test: full TOML parses");
        assert_eq!(config.backend.kind, BackendKind::Http);
        assert_eq!(
            config.backend.endpoints.get("gpt4").map(String::as_str),
            Some("http://127.0.0.1:8001")
        );
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.host, "0.0.0.0");
        assert_eq!(config.freshness_window(), Duration::from_secs(5));
        assert!(config.model_registry().contains("gpt4"));
        assert!(!config.model_registry().contains("gpt3"));
    }

    #[test]
    fn test_retry_policy_applies_cap_and_jitter() {
        let mut config = GatewayConfig::default();
        config.dispatch.backoff = BackoffKind::Linear;
        config.dispatch.retry_base_ms = 50;
        config.dispatch.retry_max_ms = 120;
        config.dispatch.jitter = true;
        let policy = config.retry_policy();
        assert!(policy.jitter);
        assert_eq!(
            policy.strategy,
            RetryStrategy::Linear {
                initial_delay: Duration::from_millis(50),
                increment: Duration::from_millis(50),
                max_delay: Duration::from_millis(120),
            }
        );
    }

    #[test]
    fn test_thresholds_mirror_admission_section() {
        let config = GatewayConfig::default();
        assert_eq!(config.thresholds(), Thresholds::default());
    }

    #[test]
    fn test_unknown_backoff_is_a_parse_error() {
        assert!(toml::from_str::<GatewayConfig>("[dispatch]\nbackoff = \"random\"").is_err());
    }

    #[test]
    fn test_export_schema_produces_valid_json() {
        let schema = export_schema().expect("test: schema export");
        let parsed: serde_json::Value =
            serde_json::from_str(&schema).expect("test: schema is valid JSON");
        assert!(parsed.get("properties").is_some() || parsed.get("$ref").is_some());
    }
}
