//! # prompt-admission gateway binary
//!
//! Loads the gateway configuration, starts the admission service and its
//! HTTP API, and shuts down gracefully on Ctrl-C.
//!
//! ## Usage
//!
//! ```bash
//! # Run with defaults (echo backend, port 8080)
//! cargo run --bin prompt-admission
//!
//! # Run with a config file
//! cargo run --bin prompt-admission -- --config admission.toml
//!
//! # Print the config JSON Schema
//! cargo run --bin prompt-admission -- --schema
//! ```
//!
//! ## Environment Variables
//!
//! - `LOG_FORMAT=json`: structured JSON output (overrides the config file)
//! - `RUST_LOG=info`: log level filter

use std::path::PathBuf;
use std::sync::Arc;
use tokio_prompt_admission::config::{export_schema, loader, GatewayConfig};
use tokio_prompt_admission::{init_tracing, metrics, AdmissionService};
use tracing::{error, info};

/// Parsed CLI arguments.
#[derive(Debug, Default, PartialEq)]
struct Args {
    /// Path to the TOML configuration; defaults apply when absent.
    config: Option<PathBuf>,
    /// Print the JSON Schema and exit.
    schema: bool,
}

/// Parse command-line arguments manually (no external arg parser dependency).
///
/// `args` excludes the program name. `Err` carries a message to print; a
/// help request is reported as `Err(usage())`.
fn parse_args<I: IntoIterator<Item = String>>(args: I) -> Result<Args, String> {
    let mut parsed = Args::default();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" | "-c" => {
                let path = args
                    .next()
                    .ok_or_else(|| "--config requires a value".to_string())?;
                parsed.config = Some(PathBuf::from(path));
            }
            "--schema" => parsed.schema = true,
            "--help" | "-h" => return Err(usage()),
            other => return Err(format!("unknown argument: {other}\n{}", usage())),
        }
    }
    Ok(parsed)
}

/// Print usage information.
fn usage() -> String {
    [
        "Usage: prompt-admission [OPTIONS]",
        "",
        "Options:",
        "  --config, -c <FILE>   Path to the gateway TOML configuration",
        "  --schema              Print the configuration JSON Schema and exit",
        "  --help, -h            Show this help message",
    ]
    .join("\n")
}

#[tokio::main]
async fn main() {
    let args = match parse_args(std::env::args().skip(1)) {
        Ok(args) => args,
        Err(msg) => {
            eprintln!("{msg}");
            std::process::exit(2);
        }
    };

    if args.schema {
        match export_schema() {
            Ok(schema) => println!("{schema}"),
            Err(e) => {
                eprintln!("Failed to export schema: {e}");
                std::process::exit(1);
            }
        }
        return;
    }

    let config = match &args.config {
        Some(path) => match loader::load_from_file(path) {
            Ok(config) => config,
            Err(e) => {
                eprintln!("Configuration error: {e}");
                std::process::exit(1);
            }
        },
        None => GatewayConfig::default(),
    };

    let _ = init_tracing(config.observability.log_format);

    if let Err(e) = metrics::init_metrics() {
        error!(error = %e, "metrics initialisation failed");
        std::process::exit(1);
    }

    if let Err(e) = run(config).await {
        error!(error = %e, "gateway stopped with an error");
        std::process::exit(1);
    }
}

async fn run(config: GatewayConfig) -> Result<(), tokio_prompt_admission::AdmissionError> {
    let service = Arc::new(AdmissionService::from_config(&config));
    info!(
        models = ?service.registry().iter().collect::<Vec<_>>(),
        backend = ?config.backend.kind,
        "prompt-admission starting"
    );

    let (stop_tx, stop_rx) = tokio::sync::watch::channel(false);
    let ctrl_c = tokio::spawn(async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to listen for Ctrl-C");
        }
        info!("shutdown signal received");
        let _ = stop_tx.send(true);
    });

    #[cfg(feature = "web-api")]
    let served = {
        let mut server_stop = stop_rx;
        tokio_prompt_admission::web_api::start_server(
            &config.server,
            Arc::clone(&service),
            async move {
                let _ = server_stop.wait_for(|stop| *stop).await;
            },
        )
        .await
    };
    #[cfg(not(feature = "web-api"))]
    let served: Result<(), tokio_prompt_admission::AdmissionError> = {
        let mut stop_rx = stop_rx;
        let _ = stop_rx.wait_for(|stop| *stop).await;
        Ok(())
    };

    // A server error (e.g. bind failure) also ends the run.
    ctrl_c.abort();

    let report = service.shutdown().await;
    info!(
        timed_out = report.timed_out,
        dropped_on_timeout = report.dropped_on_timeout,
        remaining_in_flight = report.remaining_in_flight,
        "prompt-admission stopped"
    );
    served
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_no_args_uses_defaults() {
        assert_eq!(parse_args(args(&[])), Ok(Args::default()));
    }

    #[test]
    fn test_config_and_schema_flags() {
        let parsed = parse_args(args(&["--config", "gw.toml", "--schema"])).expect("test: args");
        assert_eq!(parsed.config, Some(PathBuf::from("gw.toml")));
        assert!(parsed.schema);
    }

    #[test]
    fn test_config_requires_value() {
        assert!(parse_args(args(&["-c"])).is_err());
    }

    #[test]
    fn test_help_and_unknown_return_usage() {
        let help = parse_args(args(&["--help"])).expect_err("test: help");
        assert!(help.starts_with("Usage:"));
        let unknown = parse_args(args(&["--port"])).expect_err("test: unknown");
        assert!(unknown.contains("unknown argument: --port"));
    }
}
