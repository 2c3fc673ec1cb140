//! Prometheus metrics for the admission gateway.
//!
//! ## Usage
//!
//! Call [`init_metrics`] once at process startup **before** starting the
//! service. The helper functions (`inc_submission`, `inc_verdict`, …) are
//! no-ops if `init_metrics` was never called, so admission is always safe to
//! run and observability simply degrades gracefully.
//!
//! ## Metrics Exposed
//!
//! | Name | Type | Labels |
//! |------|------|--------|
//! | `admission_submissions_total` | Counter | `outcome` |
//! | `admission_telemetry_total` | Counter | `outcome` |
//! | `admission_verdicts_total` | Counter | `verdict` |
//! | `admission_dispatch_total` | Counter | `outcome` |
//! | `admission_attempts` | Histogram | |
//! | `admission_dispatch_seconds` | Histogram | |
//! | `admission_queue_depth` | Gauge | |

use crate::AdmissionError;
use prometheus::{
    core::Collector, CounterVec, Encoder, Histogram, HistogramOpts, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::OnceLock;
use std::time::Duration;

// ── Internal metrics bundle ────────────────────────────────────────────────

/// All Prometheus metrics for the gateway, bundled together so they can be
/// stored in a single [`OnceLock`] and initialised atomically.
pub struct Metrics {
    /// Prometheus registry that owns all metric descriptors.
    pub registry: Registry,
    /// Submissions by outcome (`accepted`, `duplicate`, `rejected`, `invalid`).
    pub submissions_total: CounterVec,
    /// Telemetry samples by outcome (`accepted`, `rejected`).
    pub telemetry_total: CounterVec,
    /// Verdicts read during admission attempts.
    pub verdicts_total: CounterVec,
    /// Terminal dispatch outcomes (`dispatched`, `dropped`, `rejected`, `failed`).
    pub dispatch_total: CounterVec,
    /// Admission attempts per request that reached a decision.
    pub attempts: Histogram,
    /// Time from queueing to terminal state.
    pub dispatch_duration: Histogram,
    /// Requests waiting in the dispatch queue.
    pub queue_depth: IntGauge,
}

static METRICS: OnceLock<Metrics> = OnceLock::new();

fn register<C>(registry: &Registry, collector: C) -> Result<C, AdmissionError>
where
    C: Collector + Clone + 'static,
{
    registry
        .register(Box::new(collector.clone()))
        .map_err(|e| AdmissionError::Other(format!("metrics registration failed: {e}")))?;
    Ok(collector)
}

fn init_err(e: prometheus::Error) -> AdmissionError {
    AdmissionError::Other(format!("metrics init failed: {e}"))
}

fn build(registry: Registry, prefix: &str) -> Result<Metrics, AdmissionError> {
    let name = |n: &str| format!("{prefix}_{n}");

    let submissions_total = register(
        &registry,
        CounterVec::new(
            Opts::new(name("submissions_total"), "Prompt submissions by outcome"),
            &["outcome"],
        )
        .map_err(init_err)?,
    )?;
    let telemetry_total = register(
        &registry,
        CounterVec::new(
            Opts::new(name("telemetry_total"), "Telemetry samples by outcome"),
            &["outcome"],
        )
        .map_err(init_err)?,
    )?;
    let verdicts_total = register(
        &registry,
        CounterVec::new(
            Opts::new(name("verdicts_total"), "Verdicts seen by admission attempts"),
            &["verdict"],
        )
        .map_err(init_err)?,
    )?;
    let dispatch_total = register(
        &registry,
        CounterVec::new(
            Opts::new(name("dispatch_total"), "Terminal dispatch outcomes"),
            &["outcome"],
        )
        .map_err(init_err)?,
    )?;
    let attempts = register(
        &registry,
        Histogram::with_opts(
            HistogramOpts::new(name("attempts"), "Admission attempts per request")
                .buckets(vec![1.0, 2.0, 3.0, 5.0, 8.0, 13.0]),
        )
        .map_err(init_err)?,
    )?;
    let dispatch_duration = register(
        &registry,
        Histogram::with_opts(HistogramOpts::new(
            name("dispatch_seconds"),
            "Time from queueing to terminal state",
        ))
        .map_err(init_err)?,
    )?;
    let queue_depth = register(
        &registry,
        IntGauge::new(name("queue_depth"), "Requests waiting for a dispatch worker")
            .map_err(init_err)?,
    )?;

    Ok(Metrics {
        registry,
        submissions_total,
        telemetry_total,
        verdicts_total,
        dispatch_total,
        attempts,
        dispatch_duration,
        queue_depth,
    })
}

// ── Initialisation ─────────────────────────────────────────────────────────

/// Initialise all Prometheus metrics and register them with a private registry.
///
/// Calling it a second time is a no-op (returns `Ok(())`).
///
/// # Errors
///
/// Returns [`AdmissionError::Other`] if metric construction or registry
/// registration fails (e.g., duplicate descriptor names).
///
/// # Panics
///
/// This function never panics.
pub fn init_metrics() -> Result<(), AdmissionError> {
    if METRICS.get().is_some() {
        return Ok(());
    }
    let bundle = build(Registry::new(), "admission")?;
    // If another thread raced us, the first one wins; both bundles are identical.
    let _ = METRICS.set(bundle);
    Ok(())
}

fn metrics() -> Option<&'static Metrics> {
    METRICS.get()
}

fn inc_labelled(vec: impl Fn(&Metrics) -> &CounterVec, label: &str) {
    if let Some(m) = metrics() {
        if let Ok(c) = vec(m).get_metric_with_label_values(&[label]) {
            c.inc();
        }
    }
}

// ── Public helper functions ────────────────────────────────────────────────

/// Count a submission outcome. No-op if metrics have not been initialised.
pub fn inc_submission(outcome: &str) {
    inc_labelled(|m| &m.submissions_total, outcome);
}

/// Count a telemetry outcome. No-op if metrics have not been initialised.
pub fn inc_telemetry(outcome: &str) {
    inc_labelled(|m| &m.telemetry_total, outcome);
}

/// Count a verdict read by an admission attempt.
pub fn inc_verdict(verdict: &str) {
    inc_labelled(|m| &m.verdicts_total, verdict);
}

/// Count a terminal dispatch outcome.
pub fn inc_dispatch(outcome: &str) {
    inc_labelled(|m| &m.dispatch_total, outcome);
}

/// Record how many admission attempts a request used.
pub fn observe_attempts(attempts: u32) {
    if let Some(m) = metrics() {
        m.attempts.observe(f64::from(attempts));
    }
}

/// Record time from queueing to a terminal state.
pub fn observe_dispatch_latency(d: Duration) {
    if let Some(m) = metrics() {
        m.dispatch_duration.observe(d.as_secs_f64());
    }
}

/// Set the dispatch queue depth gauge.
pub fn set_queue_depth(depth: usize) {
    if let Some(m) = metrics() {
        m.queue_depth.set(i64::try_from(depth).unwrap_or(i64::MAX));
    }
}

/// Gather and encode all metrics in the Prometheus text exposition format.
///
/// Returns an empty string if metrics have not been initialised or if
/// encoding fails.
///
/// # Panics
///
/// This function never panics.
pub fn gather_metrics() -> String {
    let families = metrics().map_or_else(Vec::new, |m| m.registry.gather());
    if families.is_empty() {
        return String::new();
    }
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&families, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}
