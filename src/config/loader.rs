//! Configuration file loading.
//!
//! ## Responsibility
//! Read a TOML file from disk, parse it into a [`GatewayConfig`], and run
//! validation before returning. This is the only way the binary obtains
//! configuration.
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
use super::GatewayConfig;

/// Load and validate a configuration file.
///
/// # Errors
///
/// [`ConfigError::Io`] if the file cannot be read, otherwise as for
/// [`load_from_str`].
///
/// # Panics
///
/// This function never panics.
pub fn load_from_file(path: &Path) -> Result<GatewayConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        file: path.display().to_string(),
        source: e,
    })?;

    load_from_str(&content, &path.display().to_string())
}

/// Parse and validate configuration text. `source_name` labels errors.
///
/// # Errors
///
/// [`ConfigError::Parse`] for malformed TOML, [`ConfigError::Validation`]
/// listing every violated rule otherwise.
///
/// # Panics
///
/// This function never panics.
pub fn load_from_str(content: &str, source_name: &str) -> Result<GatewayConfig, ConfigError> {
    let config: GatewayConfig = toml::from_str(content).map_err(|e| ConfigError::Parse {
        file: source_name.to_string(),
        source: e,
    })?;

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

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const VALID_TOML: &str = r#"
[registry]
models = ["gpt5", "gpt4", "gpt3"]

[admission]
max_gpu_utilization = 0.9
max_power_draw_w = 300.0
max_vram_usage = 0.95
freshness_window_ms = 30000

[dispatch]
workers = 4
retry_attempts = 3
backoff = "exponential"

[observability]
log_format = "pretty"
"#;

    #[test]
    fn test_load_from_str_valid_toml_succeeds() {
        let config = load_from_str(VALID_TOML, "test").expect("test: valid config");
        assert_eq!(config.dispatch.workers, 4);
        assert_eq!(config.registry.models.len(), 3);
    }

    #[test]
    fn test_load_from_str_empty_is_valid() {
        let config = load_from_str("", "empty.toml").expect("test: empty config");
        assert_eq!(config, GatewayConfig::default());
    }

    #[test]
    fn test_load_from_str_invalid_toml_returns_parse_error() {
        let err = load_from_str("not valid toml [[[", "bad.toml").expect_err("test: parse");
        assert!(matches!(err, ConfigError::Parse { .. }));
    }

    #[test]
    fn test_load_from_str_validation_failure_lists_every_rule() {
        let toml_str = r#"
[admission]
max_gpu_utilization = 2.0

[dispatch]
workers = 0
"#;
        let err = load_from_str(toml_str, "bad-values.toml").expect_err("test: validation");
        match err {
            ConfigError::Validation(msg) => {
                assert!(msg.contains("admission.max_gpu_utilization"));
                assert!(msg.contains("dispatch.workers"));
            }
            other => panic!("expected Validation, got {other:?}"),
        }
    }

    #[test]
    fn test_load_from_file_valid_toml_succeeds() {
        let dir = tempfile::tempdir().expect("test: create tempdir");
        let path = dir.path().join("admission.toml");
        let mut f = std::fs::File::create(&path).expect("test: create file");
        f.write_all(VALID_TOML.as_bytes()).expect("test: write");
        drop(f);

        let config = load_from_file(&path).expect("test: load from file");
        assert_eq!(config.dispatch.workers, 4);
    }

    #[test]
    fn test_load_from_file_missing_file_returns_io_error() {
        let err = load_from_file(Path::new("/nonexistent/path/admission.toml"))
            .expect_err("test: missing file");
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_load_from_file_invalid_values_returns_validation_error() {
        let dir = tempfile::tempdir().expect("test: create tempdir");
        let path = dir.path().join("invalid.toml");
        std::fs::write(&path, "[backend]\nkind = \"http\"\n").expect("test: write");

        let err = load_from_file(&path).expect_err("test: validation");
        assert!(matches!(err, ConfigError::Validation(_)));
    }

    #[test]
    fn test_load_from_str_source_name_appears_in_error() {
        let err = load_from_str("invalid [[[", "my-source.toml").expect_err("test: parse");
        assert!(err.to_string().contains("my-source.toml"));
    }
}
