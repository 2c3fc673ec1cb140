//! # Prompt dispatcher
//!
//! ## Responsibility
//! Own the bounded worker pool that drives validated requests through
//! admission: wait for a fresh accept verdict, hand the request to the
//! [`ExecutionBackend`] exactly once, and record every outcome.
//!
//! ## Guarantees
//! - Non-blocking intake: [`Dispatcher::submit`] never waits for capacity;
//!   a full queue rejects with [`FailureReason::QueueFull`]
//! - Bounded: `workers` tasks, `queue_capacity` queued jobs
//! - At most one handoff per UUID: the verdict check and the Dispatched
//!   transition are a single store operation
//! - Observable: every terminal outcome is in the store and on the event
//!   broadcast
//! - Graceful: shutdown closes intake, drains within the grace period, then
//!   cancels retries; an in-progress handoff is awaited, never aborted
//!
//! ## NOT Responsible For
//! - Validation (callers pass only `PromptRequest`s)
//! - Computing verdicts (that belongs to `policy`)

use crate::backend::ExecutionBackend;
use crate::metrics;
use crate::policy::Verdict;
use crate::retry::{RetryPolicy, RetryResult};
use crate::store::{
    CorrelationStore, ExecutionOutcome, FailureReason, Registration, RequestState, StoreError,
};
use crate::PromptRequest;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

const EVENT_CAPACITY: usize = 1024;

/// Pool sizing and retry schedule.
#[derive(Debug, Clone)]
pub struct DispatcherSettings {
    /// Worker tasks draining the queue. At least 1.
    pub workers: usize,
    /// Bounded queue capacity. At least 1.
    pub queue_capacity: usize,
    /// Admission attempts and the backoff between them.
    pub retry: RetryPolicy,
    /// How long shutdown waits for queued work before cancelling.
    pub shutdown_grace: Duration,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            workers: 8,
            queue_capacity: 1024,
            retry: RetryPolicy::exponential(3, Duration::from_millis(100)),
            shutdown_grace: Duration::from_secs(5),
        }
    }
}

/// Immediate answer to [`Dispatcher::submit`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "disposition", rename_all = "snake_case")]
pub enum Enqueued {
    /// Queued; the outcome is recorded later.
    Accepted,
    /// The UUID is already known in this state; nothing was queued.
    Duplicate {
        /// State of the existing record.
        state: RequestState,
    },
    /// Refused before admission; the record is terminal Rejected.
    Rejected {
        /// Why.
        #[serde(flatten)]
        reason: FailureReason,
    },
}

/// Outcome notifications, broadcast to every subscriber.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum DispatchEvent {
    /// Admitted and handed to the backend.
    Dispatched {
        /// Request id.
        uuid: u64,
        /// Model.
        model: String,
        /// Attempts used, including the successful one.
        attempts: u32,
    },
    /// Gave up without dispatching.
    Dropped {
        /// Request id.
        uuid: u64,
        /// Why.
        reason: FailureReason,
    },
    /// Refused before admission.
    Rejected {
        /// Request id.
        uuid: u64,
        /// Why.
        reason: FailureReason,
    },
    /// The backend finished a dispatched request.
    Executed {
        /// Request id.
        uuid: u64,
        /// Backend result.
        outcome: ExecutionOutcome,
    },
}

/// Counter snapshot for the pool.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WorkerStats {
    /// Requests queued.
    pub accepted: u64,
    /// Submissions answered with `Duplicate`.
    pub duplicates: u64,
    /// Requests refused before admission.
    pub rejected: u64,
    /// Requests handed to the backend.
    pub dispatched: u64,
    /// Requests given up on.
    pub dropped: u64,
    /// Backend executions that completed.
    pub executed: u64,
    /// Backend executions that failed.
    pub execution_failures: u64,
    /// Jobs waiting in the queue right now.
    pub queue_depth: usize,
}

/// What [`Dispatcher::shutdown`] observed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// The grace period elapsed before the pool drained.
    pub timed_out: bool,
    /// Requests dropped with `ShutdownTimeout`.
    pub dropped_on_timeout: u64,
    /// Records still non-terminal after shutdown (normally 0).
    pub remaining_in_flight: usize,
}

#[derive(Debug, Default)]
struct Counters {
    accepted: AtomicU64,
    duplicates: AtomicU64,
    rejected: AtomicU64,
    dispatched: AtomicU64,
    dropped: AtomicU64,
    executed: AtomicU64,
    execution_failures: AtomicU64,
    dropped_on_timeout: AtomicU64,
    queued: AtomicUsize,
}

#[derive(Debug, Clone, Copy)]
struct Job {
    uuid: u64,
    enqueued_at: Instant,
}

/// Everything a worker task needs, shared by all of them.
struct WorkerContext {
    store: Arc<CorrelationStore>,
    backend: Arc<dyn ExecutionBackend>,
    retry: RetryPolicy,
    events: broadcast::Sender<DispatchEvent>,
    counters: Arc<Counters>,
}

/// Bounded pool that admits and dispatches validated requests.
pub struct Dispatcher {
    store: Arc<CorrelationStore>,
    intake: parking_lot::Mutex<Option<mpsc::Sender<Job>>>,
    events: broadcast::Sender<DispatchEvent>,
    cancel: watch::Sender<bool>,
    workers: Mutex<JoinSet<()>>,
    shutting_down: AtomicBool,
    grace: Duration,
    counters: Arc<Counters>,
}

impl Dispatcher {
    /// Spawn the worker pool on the current Tokio runtime.
    ///
    /// # Panics
    ///
    /// This function never panics; it must be called from within a runtime.
    pub fn start(
        store: Arc<CorrelationStore>,
        backend: Arc<dyn ExecutionBackend>,
        settings: DispatcherSettings,
    ) -> Self {
        let (tx, rx) = mpsc::channel(settings.queue_capacity.max(1));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let (cancel, cancel_rx) = watch::channel(false);
        let counters = Arc::new(Counters::default());

        let ctx = Arc::new(WorkerContext {
            store: Arc::clone(&store),
            backend,
            retry: settings.retry,
            events: events.clone(),
            counters: Arc::clone(&counters),
        });
        let rx = Arc::new(Mutex::new(rx));

        let mut workers = JoinSet::new();
        let pool = settings.workers.max(1);
        for worker_id in 0..pool {
            workers.spawn(worker_loop(
                worker_id,
                Arc::clone(&ctx),
                Arc::clone(&rx),
                cancel_rx.clone(),
            ));
        }
        info!(
            target: "admission::dispatch",
            workers = pool,
            queue_capacity = settings.queue_capacity.max(1),
            "dispatcher started"
        );

        Self {
            store,
            intake: parking_lot::Mutex::new(Some(tx)),
            events,
            cancel,
            workers: Mutex::new(workers),
            shutting_down: AtomicBool::new(false),
            grace: settings.shutdown_grace,
            counters,
        }
    }

    /// Register `request` and queue it for admission. Never blocks.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub fn submit(&self, request: PromptRequest) -> Enqueued {
        let uuid = request.uuid();
        let model = request.model().to_string();

        if let Registration::Duplicate(state) = self.store.register(request) {
            self.counters.duplicates.fetch_add(1, Ordering::Relaxed);
            metrics::inc_submission("duplicate");
            debug!(target: "admission::dispatch", uuid, model = %model, state = %state, "duplicate submission");
            return Enqueued::Duplicate { state };
        }

        let sender = self.intake.lock().clone();
        let Some(sender) = sender.filter(|_| !self.shutting_down.load(Ordering::Acquire)) else {
            return self.reject(uuid, FailureReason::ShuttingDown);
        };

        // Validated before it is visible to a worker.
        if let Err(e) = self.store.transition(uuid, RequestState::Validated) {
            warn!(target: "admission::dispatch", uuid, error = %e, "could not mark request validated");
            return self.reject(uuid, FailureReason::ShuttingDown);
        }

        let job = Job {
            uuid,
            enqueued_at: Instant::now(),
        };
        // Counted before the send so a fast worker never decrements first.
        let depth = self.counters.queued.fetch_add(1, Ordering::AcqRel) + 1;
        let sent = sender.try_send(job);
        if sent.is_err() {
            self.counters.queued.fetch_sub(1, Ordering::AcqRel);
        }
        match sent {
            Ok(()) => {
                metrics::set_queue_depth(depth);
                self.counters.accepted.fetch_add(1, Ordering::Relaxed);
                metrics::inc_submission("accepted");
                debug!(target: "admission::dispatch", uuid, model = %model, "request queued");
                Enqueued::Accepted
            }
            Err(mpsc::error::TrySendError::Full(_)) => self.reject(uuid, FailureReason::QueueFull),
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.reject(uuid, FailureReason::ShuttingDown)
            }
        }
    }

    fn reject(&self, uuid: u64, reason: FailureReason) -> Enqueued {
        if let Err(e) = self
            .store
            .fail(uuid, RequestState::Rejected, reason.clone())
        {
            warn!(target: "admission::dispatch", uuid, error = %e, "could not record rejection");
        }
        self.counters.rejected.fetch_add(1, Ordering::Relaxed);
        metrics::inc_submission("rejected");
        metrics::inc_dispatch("rejected");
        warn!(target: "admission::dispatch", uuid, reason = %reason, "request rejected");
        let _ = self.events.send(DispatchEvent::Rejected {
            uuid,
            reason: reason.clone(),
        });
        Enqueued::Rejected { reason }
    }

    /// Receive every subsequent [`DispatchEvent`].
    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.events.subscribe()
    }

    /// Returns `true` once shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Acquire)
    }

    /// Counter snapshot.
    pub fn stats(&self) -> WorkerStats {
        let c = &self.counters;
        WorkerStats {
            accepted: c.accepted.load(Ordering::Relaxed),
            duplicates: c.duplicates.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            dispatched: c.dispatched.load(Ordering::Relaxed),
            dropped: c.dropped.load(Ordering::Relaxed),
            executed: c.executed.load(Ordering::Relaxed),
            execution_failures: c.execution_failures.load(Ordering::Relaxed),
            queue_depth: c.queued.load(Ordering::Relaxed),
        }
    }

    /// Close intake and drain.
    ///
    /// New submissions are rejected with `ShuttingDown` from here on. Queued
    /// and in-flight work continues for up to the grace period; after that,
    /// admission retries are cancelled and what is left is dropped with
    /// `ShutdownTimeout`. Handoffs already started run to completion.
    /// Calling it again returns once the pool has stopped.
    ///
    /// # Panics
    ///
    /// This function never panics.
    pub async fn shutdown(&self) -> ShutdownReport {
        self.shutting_down.store(true, Ordering::Release);
        // Dropping the last sender lets workers see the end of the queue.
        drop(self.intake.lock().take());
        info!(target: "admission::dispatch", grace_ms = u64::try_from(self.grace.as_millis()).unwrap_or(u64::MAX), "dispatcher shutting down");

        let mut workers = self.workers.lock().await;
        let drained = tokio::time::timeout(self.grace, async {
            while workers.join_next().await.is_some() {}
        })
        .await
        .is_ok();

        if !drained {
            warn!(target: "admission::dispatch", "shutdown grace period elapsed; cancelling admission retries");
            let _ = self.cancel.send(true);
            while let Some(joined) = workers.join_next().await {
                if let Err(e) = joined {
                    warn!(target: "admission::dispatch", error = %e, "dispatch worker ended abnormally");
                }
            }
        }

        let report = ShutdownReport {
            timed_out: !drained,
            dropped_on_timeout: self.counters.dropped_on_timeout.load(Ordering::Relaxed),
            remaining_in_flight: self.store.in_flight().len(),
        };
        info!(
            target: "admission::dispatch",
            timed_out = report.timed_out,
            dropped_on_timeout = report.dropped_on_timeout,
            remaining = report.remaining_in_flight,
            "dispatcher stopped"
        );
        report
    }
}

async fn worker_loop(
    worker_id: usize,
    ctx: Arc<WorkerContext>,
    rx: Arc<Mutex<mpsc::Receiver<Job>>>,
    mut cancel: watch::Receiver<bool>,
) {
    debug!(target: "admission::dispatch", worker_id, "dispatch worker started");
    loop {
        let job = rx.lock().await.recv().await;
        let Some(job) = job else { break };

        let depth = ctx
            .counters
            .queued
            .fetch_sub(1, Ordering::AcqRel)
            .saturating_sub(1);
        metrics::set_queue_depth(depth);

        let span = tracing::info_span!(
            "admission.dispatch",
            worker_id,
            uuid = job.uuid,
            attempts = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );
        process(&ctx, job, &mut cancel).instrument(span).await;
    }
    debug!(target: "admission::dispatch", worker_id, "dispatch worker stopped");
}

/// Result of one admission attempt as seen by the retry loop.
type Attempt = Result<Result<PromptRequest, StoreError>, Verdict>;

async fn process(ctx: &WorkerContext, job: Job, cancel: &mut watch::Receiver<bool>) {
    let uuid = job.uuid;

    if *cancel.borrow() {
        drop_request(ctx, &job, FailureReason::ShutdownTimeout, 0);
        return;
    }

    if let Err(e) = ctx.store.transition(uuid, RequestState::PendingVerdict) {
        warn!(target: "admission::dispatch", uuid, error = %e, "request left the queue in an unexpected state");
        return;
    }

    let store = &ctx.store;
    let result = ctx
        .retry
        .retry_until(cancel, |attempt| -> Attempt {
            match store.try_dispatch(uuid) {
                Ok(Ok(request)) => {
                    metrics::inc_verdict(Verdict::Accept.as_str());
                    Ok(Ok(request))
                }
                Ok(Err(verdict)) => {
                    metrics::inc_verdict(verdict.as_str());
                    debug!(target: "admission::dispatch", uuid, attempt, verdict = %verdict, "admission denied");
                    Err(verdict)
                }
                // Not retryable; surfaces as a store error below.
                Err(e) => Ok(Err(e)),
            }
        })
        .await;

    match result {
        RetryResult::Success {
            value: Ok(request),
            attempts,
        } => hand_off(ctx, &job, request, attempts).await,
        RetryResult::Success {
            value: Err(e),
            attempts,
        } => {
            warn!(target: "admission::dispatch", uuid, attempts, error = %e, "admission attempt failed");
        }
        RetryResult::Exhausted {
            last_error,
            attempts,
        } => drop_request(
            ctx,
            &job,
            FailureReason::AdmissionDenied {
                last_verdict: last_error,
                attempts,
            },
            attempts,
        ),
        RetryResult::Cancelled { attempts, .. } => {
            drop_request(ctx, &job, FailureReason::ShutdownTimeout, attempts)
        }
    }
}

async fn hand_off(ctx: &WorkerContext, job: &Job, request: PromptRequest, attempts: u32) {
    let uuid = job.uuid;
    tracing::Span::current().record("attempts", attempts);
    tracing::Span::current().record("outcome", "dispatched");

    ctx.counters.dispatched.fetch_add(1, Ordering::Relaxed);
    metrics::inc_dispatch("dispatched");
    metrics::observe_attempts(attempts);
    metrics::observe_dispatch_latency(job.enqueued_at.elapsed());
    info!(target: "admission::dispatch", uuid, model = %request.model(), attempts, "request dispatched");
    let _ = ctx.events.send(DispatchEvent::Dispatched {
        uuid,
        model: request.model().to_string(),
        attempts,
    });

    let outcome = match ctx.backend.execute(&request).await {
        Ok(response) => {
            ctx.counters.executed.fetch_add(1, Ordering::Relaxed);
            ExecutionOutcome::Completed { response }
        }
        Err(e) => {
            ctx.counters.execution_failures.fetch_add(1, Ordering::Relaxed);
            metrics::inc_dispatch("failed");
            warn!(target: "admission::dispatch", uuid, error = %e, "execution failed after dispatch");
            ExecutionOutcome::Failed {
                error: e.to_string(),
            }
        }
    };

    if let Err(e) = ctx.store.record_execution(uuid, outcome.clone()) {
        warn!(target: "admission::dispatch", uuid, error = %e, "could not record execution outcome");
    }
    let _ = ctx.events.send(DispatchEvent::Executed { uuid, outcome });
}

fn drop_request(ctx: &WorkerContext, job: &Job, reason: FailureReason, attempts: u32) {
    let uuid = job.uuid;
    tracing::Span::current().record("attempts", attempts);
    tracing::Span::current().record("outcome", "dropped");

    if let Err(e) = ctx.store.fail(uuid, RequestState::Dropped, reason.clone()) {
        warn!(target: "admission::dispatch", uuid, error = %e, "could not record drop");
        return;
    }
    ctx.counters.dropped.fetch_add(1, Ordering::Relaxed);
    if reason == FailureReason::ShutdownTimeout {
        ctx.counters
            .dropped_on_timeout
            .fetch_add(1, Ordering::Relaxed);
    }
    metrics::inc_dispatch("dropped");
    if attempts > 0 {
        metrics::observe_attempts(attempts);
    }
    metrics::observe_dispatch_latency(job.enqueued_at.elapsed());
    warn!(target: "admission::dispatch", uuid, attempts, reason = %reason, "request dropped");
    let _ = ctx.events.send(DispatchEvent::Dropped { uuid, reason });
}
