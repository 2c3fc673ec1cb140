//! # Admission service
//!
//! ## Responsibility
//! Wire the registry, policy engine, correlation store, telemetry ingestor
//! and dispatcher together from a [`GatewayConfig`], and expose the two
//! entry points plus the query surface as one handle.
//!
//! ## Guarantees
//! - Submission answers synchronously: validation result plus enqueue
//!   disposition, never waiting for admission
//! - Bounded memory: a background sweeper removes settled records and
//!   stale telemetry on a fixed period
//!
//! ## NOT Responsible For
//! - Wire formats (that belongs to `web_api`)
//! - Process lifecycle (that belongs to the binary)

use crate::backend::{EchoBackend, ExecutionBackend, HttpBackend};
use crate::config::{BackendKind, GatewayConfig};
use crate::dispatch::{
    DispatchEvent, Dispatcher, DispatcherSettings, Enqueued, ShutdownReport, WorkerStats,
};
use crate::metrics;
use crate::policy::{AdmissionPolicy, Verdict};
use crate::registry::ModelRegistry;
use crate::store::{CorrelationEntry, CorrelationStore, RequestStatus, StoreStats};
use crate::telemetry::{RejectedSample, SampleReading, TelemetryAck, TelemetryIngestor};
use crate::validator::{validate, ValidationError};
use crate::WorkerIdentity;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

/// Answer to a valid submission.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SubmitAck {
    /// Parsed request id.
    pub uuid: u64,
    /// What the dispatcher did with it.
    #[serde(flatten)]
    pub disposition: Enqueued,
}

/// Point-in-time counters across the service.
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    /// Request records by state.
    pub requests: StoreStats,
    /// Dispatcher counters.
    pub dispatch: WorkerStats,
    /// Identities with stored telemetry.
    pub identities: usize,
}

/// Build the execution backend selected by `[backend]`.
pub fn backend_from_config(config: &GatewayConfig) -> Arc<dyn ExecutionBackend> {
    let b = &config.backend;
    match b.kind {
        BackendKind::Echo => Arc::new(EchoBackend::with_delay(Duration::from_millis(
            b.echo_delay_ms,
        ))),
        BackendKind::Http => Arc::new(
            HttpBackend::new(b.endpoints.clone())
                .with_timeout(Duration::from_millis(b.timeout_ms)),
        ),
    }
}

/// The running gateway core.
pub struct AdmissionService {
    registry: ModelRegistry,
    policy: Arc<AdmissionPolicy>,
    store: Arc<CorrelationStore>,
    ingestor: TelemetryIngestor,
    dispatcher: Dispatcher,
    sweeper_stop: watch::Sender<bool>,
    sweeper: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl AdmissionService {
    /// Start the service on the current runtime, executing admitted
    /// prompts on `backend`.
    ///
    /// `config` is assumed validated (see [`crate::config::loader`]).
    ///
    /// # Panics
    ///
    /// This function never panics; it must be called from within a runtime.
    pub fn start(config: &GatewayConfig, backend: Arc<dyn ExecutionBackend>) -> Self {
        let registry = config.model_registry();
        let policy = Arc::new(AdmissionPolicy::new(
            config.thresholds(),
            config.freshness_window(),
        ));
        let retention = Duration::from_secs(config.dispatch.retention_s);
        let store = Arc::new(CorrelationStore::new(Arc::clone(&policy), retention));
        let ingestor = TelemetryIngestor::new(Arc::clone(&policy));

        let dispatcher = Dispatcher::start(
            Arc::clone(&store),
            backend,
            DispatcherSettings {
                workers: config.dispatch.workers,
                queue_capacity: config.dispatch.queue_capacity,
                retry: config.retry_policy(),
                shutdown_grace: Duration::from_millis(config.dispatch.shutdown_grace_ms),
            },
        );

        let (sweeper_stop, stop_rx) = watch::channel(false);
        let sweeper = tokio::spawn(sweep_loop(
            Arc::clone(&store),
            Duration::from_secs(config.dispatch.sweep_interval_s.max(1)),
            stop_rx,
        ));

        info!(
            models = registry.len(),
            freshness_ms = config.admission.freshness_window_ms,
            "admission service started"
        );

        Self {
            registry,
            policy,
            store,
            ingestor,
            dispatcher,
            sweeper_stop,
            sweeper: parking_lot::Mutex::new(Some(sweeper)),
        }
    }

    /// Start with the backend selected by `config`.
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self::start(config, backend_from_config(config))
    }

    /// Submission entry point: validate, then enqueue.
    ///
    /// # Errors
    ///
    /// Returns the first [`ValidationError`]; nothing is recorded in that case.
    pub fn submit(
        &self,
        uuid: &str,
        prompt: &str,
        model: &str,
    ) -> Result<SubmitAck, ValidationError> {
        let request = validate(&self.registry, uuid, prompt, model).map_err(|e| {
            metrics::inc_submission("invalid");
            debug!(kind = e.kind(), "submission failed validation");
            e
        })?;
        let uuid = request.uuid();
        let disposition = self.dispatcher.submit(request);
        Ok(SubmitAck { uuid, disposition })
    }

    /// Telemetry entry point.
    ///
    /// # Errors
    ///
    /// Returns [`RejectedSample`] for out-of-range readings.
    pub fn ingest(
        &self,
        identity: &WorkerIdentity,
        reading: SampleReading,
    ) -> Result<TelemetryAck, RejectedSample> {
        self.ingestor.ingest(identity, reading)
    }

    /// Current verdict for `identity`.
    pub fn verdict(&self, identity: &WorkerIdentity) -> Verdict {
        self.policy.verdict(identity)
    }

    /// Lifecycle snapshot of a request.
    pub fn status(&self, uuid: u64) -> Option<RequestStatus> {
        self.store.status(uuid)
    }

    /// Telemetry and requests correlated under `identity`.
    pub fn entry(&self, identity: &WorkerIdentity) -> CorrelationEntry {
        self.store.entry(identity)
    }

    /// Subscribe to dispatch outcomes.
    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.dispatcher.subscribe()
    }

    /// The immutable model registry.
    pub fn registry(&self) -> &ModelRegistry {
        &self.registry
    }

    /// Counters across store, dispatcher and policy.
    pub fn stats(&self) -> ServiceStats {
        ServiceStats {
            requests: self.store.stats(),
            dispatch: self.dispatcher.stats(),
            identities: self.policy.len(),
        }
    }

    /// Run one sweep now. Returns records removed.
    pub fn sweep(&self) -> usize {
        self.store.sweep()
    }

    /// Returns `true` once shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.dispatcher.is_shutting_down()
    }

    /// Stop intake, drain the dispatcher and stop the sweeper.
    pub async fn shutdown(&self) -> ShutdownReport {
        let report = self.dispatcher.shutdown().await;
        let _ = self.sweeper_stop.send(true);
        let handle = self.sweeper.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        report
    }
}

async fn sweep_loop(
    store: Arc<CorrelationStore>,
    period: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick completes immediately.
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                store.sweep();
            }
            changed = stop.changed() => {
                if changed.is_err() || *stop.borrow() {
                    break;
                }
            }
        }
    }
    debug!("sweeper stopped");
}
