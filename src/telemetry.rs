//! Telemetry ingestion.
//!
//! Range-checks incoming resource samples and hands valid ones to the
//! [`AdmissionPolicy`]. A rejected sample never touches stored state.

use crate::metrics;
use crate::policy::{AdmissionPolicy, Verdict};
use crate::WorkerIdentity;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, warn};

/// One resource sample as produced by a worker node.
///
/// Accepts both snake_case and the camelCase field names used by GPU
/// collectors (`gpuUtilization`, `powerDraw`, `vramUsage`).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SampleReading {
    /// GPU utilization as a fraction, `[0, 1]`.
    #[serde(alias = "gpuUtilization")]
    pub gpu_utilization: f64,
    /// Power draw in watts, `>= 0`.
    #[serde(alias = "powerDraw")]
    pub power_draw: f64,
    /// VRAM usage as a fraction, `[0, 1]`.
    #[serde(alias = "vramUsage")]
    pub vram_usage: f64,
}

/// A range-checked reading stamped with its arrival instant.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TelemetrySample {
    /// The reading itself.
    pub reading: SampleReading,
    /// When ingestion accepted it.
    pub arrived_at: Instant,
}

impl TelemetrySample {
    /// Stamp `reading` with the current instant.
    pub fn now(reading: SampleReading) -> Self {
        Self {
            reading,
            arrived_at: Instant::now(),
        }
    }
}

/// Why a sample was refused.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RejectedSample {
    /// A field is outside its valid range (NaN included).
    #[error("invalid telemetry: {field} = {value} ({expected})")]
    InvalidTelemetry {
        /// Offending field.
        field: &'static str,
        /// Value received.
        value: f64,
        /// Valid range.
        expected: &'static str,
    },
}

/// Acknowledgement of a stored sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct TelemetryAck {
    /// Verdict for the identity right after the update.
    pub verdict: Verdict,
}

/// Check every field of `reading` against its valid range.
///
/// # Errors
///
/// Returns the first out-of-range field as [`RejectedSample::InvalidTelemetry`].
pub fn check_ranges(reading: &SampleReading) -> Result<(), RejectedSample> {
    let unit = |field: &'static str, value: f64| {
        if (0.0..=1.0).contains(&value) {
            Ok(())
        } else {
            Err(RejectedSample::InvalidTelemetry {
                field,
                value,
                expected: "[0, 1]",
            })
        }
    };

    unit("gpu_utilization", reading.gpu_utilization)?;
    unit("vram_usage", reading.vram_usage)?;

    if !(reading.power_draw.is_finite() && reading.power_draw >= 0.0) {
        return Err(RejectedSample::InvalidTelemetry {
            field: "power_draw",
            value: reading.power_draw,
            expected: ">= 0",
        });
    }
    Ok(())
}

/// Entry point for the telemetry stream.
#[derive(Clone)]
pub struct TelemetryIngestor {
    policy: Arc<AdmissionPolicy>,
}

impl TelemetryIngestor {
    /// Create an ingestor feeding `policy`.
    pub fn new(policy: Arc<AdmissionPolicy>) -> Self {
        Self { policy }
    }

    /// Validate and store a sample for `identity`, then recompute that
    /// identity's verdict.
    ///
    /// # Errors
    ///
    /// Returns [`RejectedSample`] if any field is out of range; stored state
    /// is left untouched in that case.
    pub fn ingest(
        &self,
        identity: &WorkerIdentity,
        reading: SampleReading,
    ) -> Result<TelemetryAck, RejectedSample> {
        if let Err(e) = check_ranges(&reading) {
            warn!(
                client_key = %identity.client_key,
                model = %identity.model,
                error = %e,
                "telemetry sample rejected"
            );
            metrics::inc_telemetry("rejected");
            return Err(e);
        }

        let verdict = self.policy.record(identity, TelemetrySample::now(reading));
        metrics::inc_telemetry("accepted");
        debug!(
            client_key = %identity.client_key,
            model = %identity.model,
            verdict = %verdict,
            "telemetry sample stored"
        );
        Ok(TelemetryAck { verdict })
    }
}
