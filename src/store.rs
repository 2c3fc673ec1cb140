//! # Correlation store
//!
//! ## Responsibility
//! The synchronization point between the submission and telemetry streams:
//! request lifecycle records keyed by UUID, joined with the policy engine's
//! per-identity sample and verdict.
//!
//! ## Guarantees
//! - Idempotent: a UUID that is in flight or Dispatched is never registered twice
//! - Atomic dispatch: the fresh-accept check and the Dispatched transition
//!   happen under the request's entry lock
//! - Legal transitions only: every state change is checked against the
//!   lifecycle graph
//! - Bounded: terminal records are swept after the retention window
//!
//! ## NOT Responsible For
//! - Computing verdicts (that belongs to `policy`)
//! - Scheduling admission attempts (that belongs to `dispatch`)

use crate::policy::{AdmissionPolicy, Verdict};
use crate::telemetry::SampleReading;
use crate::{PromptRequest, WorkerIdentity};
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::time::Instant;
use tracing::debug;

/// Lifecycle of a prompt request.
///
/// `Received` → `Validated` → `PendingVerdict` → `Dispatched` | `Rejected` | `Dropped`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestState {
    /// Recorded in the store, not yet in the dispatch queue.
    Received,
    /// Accepted into the dispatch queue, waiting for a worker.
    Validated,
    /// A worker is polling the admission policy.
    PendingVerdict,
    /// Handed to the execution backend. Terminal.
    Dispatched,
    /// Refused before any admission attempt. Terminal.
    Rejected,
    /// Gave up without dispatching. Terminal.
    Dropped,
}

impl fmt::Display for RequestState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl RequestState {
    /// Label for logs and metrics.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Received => "received",
            Self::Validated => "validated",
            Self::PendingVerdict => "pending_verdict",
            Self::Dispatched => "dispatched",
            Self::Rejected => "rejected",
            Self::Dropped => "dropped",
        }
    }

    /// Returns `true` if the request has reached a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Dispatched | Self::Rejected | Self::Dropped)
    }

    /// Returns `true` if a new submission may reuse this UUID.
    pub fn allows_resubmission(&self) -> bool {
        matches!(self, Self::Rejected | Self::Dropped)
    }

    /// Returns `true` if `self → next` is an edge of the lifecycle graph.
    pub fn can_transition_to(&self, next: RequestState) -> bool {
        use RequestState::*;
        matches!(
            (self, next),
            (Received, Validated)
                | (Received, Rejected)
                | (Validated, PendingVerdict)
                | (Validated, Rejected)
                | (Validated, Dropped)
                | (PendingVerdict, Dispatched)
                | (PendingVerdict, Dropped)
        )
    }
}

/// Recorded reason for a Rejected or Dropped request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum FailureReason {
    /// Admission never saw a fresh accept within the retry budget.
    AdmissionDenied {
        /// Verdict seen on the final attempt.
        last_verdict: Verdict,
        /// Attempts made.
        attempts: u32,
    },
    /// The dispatch queue was full at submission.
    QueueFull,
    /// Submission arrived after shutdown began.
    ShuttingDown,
    /// The shutdown grace period ended before admission.
    ShutdownTimeout,
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AdmissionDenied {
                last_verdict,
                attempts,
            } => write!(
                f,
                "admission denied after {attempts} attempt(s), last verdict {last_verdict}"
            ),
            Self::QueueFull => f.write_str("dispatch queue full"),
            Self::ShuttingDown => f.write_str("dispatcher shutting down"),
            Self::ShutdownTimeout => f.write_str("shutdown grace period elapsed"),
        }
    }
}

impl FailureReason {
    /// Metric label.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AdmissionDenied { .. } => "admission_denied",
            Self::QueueFull => "queue_full",
            Self::ShuttingDown => "shutting_down",
            Self::ShutdownTimeout => "shutdown_timeout",
        }
    }
}

/// Result of the execution backend for a Dispatched request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ExecutionOutcome {
    /// The backend returned a response.
    Completed {
        /// Response text.
        response: String,
    },
    /// The backend failed after handoff.
    Failed {
        /// Error description.
        error: String,
    },
}

/// Errors from store operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StoreError {
    /// No record exists for the UUID.
    #[error("unknown request: {0}")]
    UnknownRequest(u64),
    /// The requested state change is not in the lifecycle graph.
    #[error("illegal transition for request {uuid}: {from} -> {to}")]
    IllegalTransition {
        /// Request id.
        uuid: u64,
        /// Current state.
        from: RequestState,
        /// Requested state.
        to: RequestState,
    },
}

/// Outcome of [`CorrelationStore::register`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Registration {
    /// A fresh record was created in `Received`.
    New,
    /// The UUID is already known; nothing changed.
    Duplicate(RequestState),
}

#[derive(Debug, Clone)]
struct RequestRecord {
    request: PromptRequest,
    state: RequestState,
    attempts: u32,
    failure: Option<FailureReason>,
    execution: Option<ExecutionOutcome>,
    submitted_at: DateTime<Utc>,
    received: Instant,
    updated: Instant,
}

impl RequestRecord {
    fn new(request: PromptRequest) -> Self {
        let now = Instant::now();
        Self {
            request,
            state: RequestState::Received,
            attempts: 0,
            failure: None,
            execution: None,
            submitted_at: Utc::now(),
            received: now,
            updated: now,
        }
    }

    fn set_state(&mut self, to: RequestState) -> Result<RequestState, StoreError> {
        let from = self.state;
        if !from.can_transition_to(to) {
            return Err(StoreError::IllegalTransition {
                uuid: self.request.uuid(),
                from,
                to,
            });
        }
        self.state = to;
        self.updated = Instant::now();
        Ok(from)
    }

    fn status(&self) -> RequestStatus {
        RequestStatus {
            uuid: self.request.uuid(),
            model: self.request.model().to_string(),
            state: self.state,
            attempts: self.attempts,
            failure: self.failure.clone(),
            execution: self.execution.clone(),
            submitted_at: self.submitted_at,
        }
    }

    /// Terminal and, for Dispatched, with the backend outcome in.
    fn is_settled(&self) -> bool {
        match self.state {
            RequestState::Dispatched => self.execution.is_some(),
            s => s.is_terminal(),
        }
    }
}

/// Observable snapshot of one request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RequestStatus {
    /// Request id.
    pub uuid: u64,
    /// Requested model.
    pub model: String,
    /// Lifecycle state.
    pub state: RequestState,
    /// Admission attempts made so far.
    pub attempts: u32,
    /// Why the request was Rejected or Dropped.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    /// Backend result once a Dispatched request finishes.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub execution: Option<ExecutionOutcome>,
    /// Wall-clock submission time.
    pub submitted_at: DateTime<Utc>,
}

/// Per-identity view joining telemetry and request state.
#[derive(Debug, Clone, Serialize)]
pub struct CorrelationEntry {
    /// The identity.
    pub identity: WorkerIdentity,
    /// Latest stored reading, if any.
    pub sample: Option<SampleReading>,
    /// Age of that reading in milliseconds.
    pub sample_age_ms: Option<u64>,
    /// Verdict right now, freshness applied.
    pub verdict: Verdict,
    /// Requests correlated with the identity.
    pub requests: Vec<RequestStatus>,
}

/// Counts of records by state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    /// All records held.
    pub total: usize,
    /// Received, Validated or PendingVerdict.
    pub in_flight: usize,
    /// Dispatched.
    pub dispatched: usize,
    /// Rejected.
    pub rejected: usize,
    /// Dropped.
    pub dropped: usize,
}

/// UUID-keyed request records plus the shared policy engine.
pub struct CorrelationStore {
    policy: Arc<AdmissionPolicy>,
    requests: DashMap<u64, RequestRecord>,
    retention: Duration,
}

impl CorrelationStore {
    /// Create a store over `policy`. Terminal records older than `retention`
    /// are removed by [`sweep`](Self::sweep).
    pub fn new(policy: Arc<AdmissionPolicy>, retention: Duration) -> Self {
        Self {
            policy,
            requests: DashMap::new(),
            retention,
        }
    }

    /// The policy engine this store correlates against.
    pub fn policy(&self) -> &Arc<AdmissionPolicy> {
        &self.policy
    }

    /// Record a validated request in state `Received`.
    ///
    /// A UUID whose record is Rejected or Dropped starts over; any other
    /// existing record makes this a [`Registration::Duplicate`].
    pub fn register(&self, request: PromptRequest) -> Registration {
        let uuid = request.uuid();
        match self.requests.entry(uuid) {
            Entry::Occupied(mut occupied) => {
                let state = occupied.get().state;
                if state.allows_resubmission() {
                    occupied.insert(RequestRecord::new(request));
                    debug!(uuid, previous = %state, "request re-registered");
                    Registration::New
                } else {
                    debug!(uuid, state = %state, "duplicate request detected");
                    Registration::Duplicate(state)
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(RequestRecord::new(request));
                Registration::New
            }
        }
    }

    /// Move `uuid` to `to`. Returns the previous state.
    ///
    /// # Errors
    ///
    /// [`StoreError::UnknownRequest`] or [`StoreError::IllegalTransition`].
    pub fn transition(&self, uuid: u64, to: RequestState) -> Result<RequestState, StoreError> {
        let mut record = self
            .requests
            .get_mut(&uuid)
            .ok_or(StoreError::UnknownRequest(uuid))?;
        record.set_state(to)
    }

    /// Move `uuid` to a failure state (`Rejected` or `Dropped`) with `reason`.
    ///
    /// # Errors
    ///
    /// As for [`transition`](Self::transition).
    pub fn fail(
        &self,
        uuid: u64,
        to: RequestState,
        reason: FailureReason,
    ) -> Result<RequestState, StoreError> {
        let mut record = self
            .requests
            .get_mut(&uuid)
            .ok_or(StoreError::UnknownRequest(uuid))?;
        let from = record.set_state(to)?;
        record.failure = Some(reason);
        Ok(from)
    }

    /// One admission attempt for a `PendingVerdict` request.
    ///
    /// Holding the request's entry lock, counts the attempt, reads the
    /// verdict for the request's identity, and on a fresh accept moves the
    /// request to `Dispatched`. Returns the request to hand off, or the
    /// verdict that blocked it.
    ///
    /// # Errors
    ///
    /// [`StoreError`] if the record is missing or not `PendingVerdict`.
    pub fn try_dispatch(&self, uuid: u64) -> Result<Result<PromptRequest, Verdict>, StoreError> {
        let mut record = self
            .requests
            .get_mut(&uuid)
            .ok_or(StoreError::UnknownRequest(uuid))?;
        if record.state != RequestState::PendingVerdict {
            return Err(StoreError::IllegalTransition {
                uuid,
                from: record.state,
                to: RequestState::Dispatched,
            });
        }

        record.attempts += 1;
        let identity = WorkerIdentity::for_request(&record.request);
        let verdict = self.policy.verdict(&identity);
        if !verdict.is_accept() {
            return Ok(Err(verdict));
        }
        record.set_state(RequestState::Dispatched)?;
        Ok(Ok(record.request.clone()))
    }

    /// Attach the backend result to a Dispatched request.
    ///
    /// # Errors
    ///
    /// [`StoreError`] if the record is missing or not Dispatched.
    pub fn record_execution(&self, uuid: u64, outcome: ExecutionOutcome) -> Result<(), StoreError> {
        let mut record = self
            .requests
            .get_mut(&uuid)
            .ok_or(StoreError::UnknownRequest(uuid))?;
        if record.state != RequestState::Dispatched {
            return Err(StoreError::IllegalTransition {
                uuid,
                from: record.state,
                to: RequestState::Dispatched,
            });
        }
        record.execution = Some(outcome);
        record.updated = Instant::now();
        Ok(())
    }

    /// Current state of `uuid`.
    pub fn state(&self, uuid: u64) -> Option<RequestState> {
        self.requests.get(&uuid).map(|r| r.state)
    }

    /// Snapshot of `uuid`.
    pub fn status(&self, uuid: u64) -> Option<RequestStatus> {
        self.requests.get(&uuid).map(|r| r.status())
    }

    /// Time since `uuid` was registered.
    pub fn age(&self, uuid: u64) -> Option<Duration> {
        self.requests.get(&uuid).map(|r| r.received.elapsed())
    }

    /// Join the identity's telemetry with its correlated requests.
    pub fn entry(&self, identity: &WorkerIdentity) -> CorrelationEntry {
        let snapshot = self.policy.snapshot(identity);
        let mut requests: Vec<RequestStatus> = self
            .requests
            .iter()
            .filter(|r| {
                r.request.model() == identity.model
                    && r.request.uuid().to_string() == identity.client_key
            })
            .map(|r| r.status())
            .collect();
        requests.sort_by_key(|r| r.submitted_at);

        CorrelationEntry {
            identity: identity.clone(),
            sample: snapshot.map(|s| s.sample.reading),
            sample_age_ms: snapshot.map(|s| {
                u64::try_from(s.sample.arrived_at.elapsed().as_millis()).unwrap_or(u64::MAX)
            }),
            verdict: snapshot.map_or(Verdict::Unknown, |s| s.verdict),
            requests,
        }
    }

    /// Remove settled records older than the retention window, and policy
    /// slots whose sample is older than it. Returns records removed.
    pub fn sweep(&self) -> usize {
        let retention = self.retention;
        let before = self.requests.len();
        self.requests
            .retain(|_, r| !(r.is_settled() && r.updated.elapsed() > retention));
        let removed = before.saturating_sub(self.requests.len());
        let evicted = self.policy.evict_older_than(retention);
        if removed > 0 || evicted > 0 {
            debug!(removed, evicted, "swept expired correlation entries");
        }
        removed
    }

    /// Record counts by state.
    pub fn stats(&self) -> StoreStats {
        let mut stats = StoreStats {
            total: self.requests.len(),
            ..StoreStats::default()
        };
        for r in self.requests.iter() {
            match r.state {
                RequestState::Dispatched => stats.dispatched += 1,
                RequestState::Rejected => stats.rejected += 1,
                RequestState::Dropped => stats.dropped += 1,
                _ => stats.in_flight += 1,
            }
        }
        stats
    }

    /// UUIDs of records not yet in a terminal state.
    pub fn in_flight(&self) -> Vec<u64> {
        self.requests
            .iter()
            .filter(|r| !r.state.is_terminal())
            .map(|r| *r.key())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::Thresholds;
    use crate::registry::ModelRegistry;
    use crate::telemetry::TelemetrySample;
    use crate::validator::validate;

    fn store() -> CorrelationStore {
        let policy = Arc::new(AdmissionPolicy::new(
            Thresholds::default(),
            Duration::from_secs(30),
        ));
        CorrelationStore::new(policy, Duration::from_secs(60))
    }

    fn request(uuid: u64) -> PromptRequest {
        let registry = ModelRegistry::new(["gpt4"]);
        validate(&registry, &uuid.to_string(), "hello", "gpt4").expect("test: valid request")
    }

    fn feed(store: &CorrelationStore, uuid: u64, gpu: f64) {
        store.policy().record(
            &WorkerIdentity::new(uuid.to_string(), "gpt4"),
            TelemetrySample::now(SampleReading {
                gpu_utilization: gpu,
                power_draw: 100.0,
                vram_usage: 0.5,
            }),
        );
    }

    fn to_pending(store: &CorrelationStore, uuid: u64) {
        assert_eq!(store.register(request(uuid)), Registration::New);
        store
            .transition(uuid, RequestState::Validated)
            .expect("test: validated");
        store
            .transition(uuid, RequestState::PendingVerdict)
            .expect("test: pending");
    }

    #[test]
    fn test_transition_graph() {
        use RequestState::*;
        assert!(Received.can_transition_to(Validated));
        assert!(PendingVerdict.can_transition_to(Dispatched));
        assert!(!Received.can_transition_to(Dispatched));
        assert!(!Validated.can_transition_to(Dispatched));
        for terminal in [Dispatched, Rejected, Dropped] {
            assert!(terminal.is_terminal());
            for next in [Received, Validated, PendingVerdict, Dispatched, Rejected, Dropped] {
                assert!(!terminal.can_transition_to(next));
            }
        }
    }

    #[tokio::test]
    async fn test_register_duplicate_while_in_flight() {
        let store = store();
        assert_eq!(store.register(request(1)), Registration::New);
        assert_eq!(
            store.register(request(1)),
            Registration::Duplicate(RequestState::Received)
        );
    }

    #[tokio::test]
    async fn test_dropped_uuid_may_be_resubmitted() {
        let store = store();
        to_pending(&store, 1);
        store
            .fail(1, RequestState::Dropped, FailureReason::ShutdownTimeout)
            .expect("test: drop");
        assert_eq!(store.register(request(1)), Registration::New);
        let status = store.status(1).expect("test: status");
        assert_eq!(status.state, RequestState::Received);
        assert!(status.failure.is_none());
    }

    #[tokio::test]
    async fn test_illegal_transition_is_reported() {
        let store = store();
        store.register(request(1));
        let err = store
            .transition(1, RequestState::Dispatched)
            .expect_err("test: illegal");
        assert_eq!(
            err,
            StoreError::IllegalTransition {
                uuid: 1,
                from: RequestState::Received,
                to: RequestState::Dispatched,
            }
        );
        assert_eq!(
            store.transition(99, RequestState::Validated),
            Err(StoreError::UnknownRequest(99))
        );
    }

    #[tokio::test]
    async fn test_try_dispatch_without_sample_reports_unknown() {
        let store = store();
        to_pending(&store, 5);
        assert_eq!(store.try_dispatch(5), Ok(Err(Verdict::Unknown)));
        assert_eq!(store.state(5), Some(RequestState::PendingVerdict));
        assert_eq!(store.status(5).map(|s| s.attempts), Some(1));
    }

    #[tokio::test]
    async fn test_try_dispatch_on_accept_marks_dispatched_once() {
        let store = store();
        to_pending(&store, 5);
        feed(&store, 5, 0.2);

        let handed = store.try_dispatch(5).expect("test: dispatch");
        assert_eq!(handed.map(|r| r.uuid()), Ok(5));
        assert_eq!(store.state(5), Some(RequestState::Dispatched));

        // A second attempt must not hand off again.
        assert!(store.try_dispatch(5).is_err());
        assert_eq!(
            store.register(request(5)),
            Registration::Duplicate(RequestState::Dispatched)
        );
    }

    #[tokio::test]
    async fn test_try_dispatch_on_reject_keeps_pending() {
        let store = store();
        to_pending(&store, 5);
        feed(&store, 5, 0.99);
        assert_eq!(store.try_dispatch(5), Ok(Err(Verdict::Reject)));
    }

    #[tokio::test]
    async fn test_sample_for_other_identity_does_not_govern() {
        let store = store();
        to_pending(&store, 5);
        feed(&store, 6, 0.1);
        assert_eq!(store.try_dispatch(5), Ok(Err(Verdict::Unknown)));
    }

    #[tokio::test]
    async fn test_record_execution_requires_dispatched() {
        let store = store();
        to_pending(&store, 5);
        let outcome = ExecutionOutcome::Completed {
            response: "ok".into(),
        };
        assert!(store.record_execution(5, outcome.clone()).is_err());
        feed(&store, 5, 0.1);
        let _ = store.try_dispatch(5);
        assert!(store.record_execution(5, outcome.clone()).is_ok());
        assert_eq!(store.status(5).and_then(|s| s.execution), Some(outcome));
    }

    #[tokio::test]
    async fn test_entry_joins_sample_verdict_and_requests() {
        let store = store();
        to_pending(&store, 5);
        feed(&store, 5, 0.2);
        let entry = store.entry(&WorkerIdentity::new("5", "gpt4"));
        assert_eq!(entry.verdict, Verdict::Accept);
        assert_eq!(entry.sample.map(|s| s.gpu_utilization), Some(0.2));
        assert_eq!(entry.requests.len(), 1);
        assert_eq!(entry.requests[0].uuid, 5);

        let other = store.entry(&WorkerIdentity::new("5", "gpt3"));
        assert!(other.requests.is_empty());
        assert_eq!(other.verdict, Verdict::Unknown);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entry_reports_sample_age_in_millis() {
        let store = store();
        feed(&store, 6, 0.2);
        tokio::time::advance(Duration::from_millis(1500)).await;
        let entry = store.entry(&WorkerIdentity::new("6", "gpt4"));
        assert_eq!(entry.sample_age_ms, Some(1500));
        assert_eq!(
            store.entry(&WorkerIdentity::new("7", "gpt4")).sample_age_ms,
            None
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_only_settled_expired_records() {
        let store = store();
        to_pending(&store, 1);
        store
            .fail(
                1,
                RequestState::Dropped,
                FailureReason::AdmissionDenied {
                    last_verdict: Verdict::Unknown,
                    attempts: 3,
                },
            )
            .expect("test: drop");
        to_pending(&store, 2);
        feed(&store, 2, 0.1);
        let _ = store.try_dispatch(2);
        to_pending(&store, 3);

        tokio::time::advance(Duration::from_secs(61)).await;
        // 1 is settled; 2 is Dispatched without an execution outcome; 3 is in flight.
        assert_eq!(store.sweep(), 1);
        assert!(store.status(1).is_none());
        assert!(store.status(2).is_some());
        assert_eq!(store.in_flight(), vec![3]);
    }

    #[tokio::test]
    async fn test_stats_counts_by_state() {
        let store = store();
        to_pending(&store, 1);
        store.register(request(2));
        store
            .fail(2, RequestState::Rejected, FailureReason::QueueFull)
            .expect("test: reject");
        let stats = store.stats();
        assert_eq!(stats.total, 2);
        assert_eq!(stats.in_flight, 1);
        assert_eq!(stats.rejected, 1);
    }

    #[test]
    fn test_failure_reason_serializes_with_tag() {
        let json = serde_json::to_value(FailureReason::AdmissionDenied {
            last_verdict: Verdict::Reject,
            attempts: 3,
        })
        .expect("test: serialize");
        assert_eq!(json["reason"], "admission_denied");
        assert_eq!(json["last_verdict"], "reject");
    }
}
