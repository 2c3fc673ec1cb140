//! End-to-end admission flow through [`AdmissionService`].
//!
//! Every test runs on a paused clock so freshness windows and retry
//! backoff advance deterministically.

use std::time::Duration;

use tokio::sync::broadcast;
use tokio_prompt_admission::{
    AdmissionService, DispatchEvent, EchoBackend, Enqueued, FailureReason, GatewayConfig,
    RequestState, SampleReading, ValidationError, Verdict, WorkerIdentity,
};

// ============================================================================
// Helpers
// ============================================================================

/// Thresholds 0.9 / 300 W / 0.95, 30 s freshness, three attempts.
fn config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.admission.max_gpu_utilization = 0.9;
    config.admission.max_power_draw_w = 300.0;
    config.admission.max_vram_usage = 0.95;
    config.admission.freshness_window_ms = 30_000;
    config.dispatch.workers = 4;
    config.dispatch.retry_attempts = 3;
    config.dispatch.retry_base_ms = 100;
    config.dispatch.jitter = false;
    config
}

fn service(config: &GatewayConfig) -> AdmissionService {
    AdmissionService::start(
        config,
        std::sync::Arc::new(EchoBackend::with_delay(Duration::ZERO)),
    )
}

fn sample(gpu: f64, power: f64, vram: f64) -> SampleReading {
    SampleReading {
        gpu_utilization: gpu,
        power_draw: power,
        vram_usage: vram,
    }
}

fn ok_sample() -> SampleReading {
    sample(0.5, 250.0, 0.6)
}

fn hot_sample() -> SampleReading {
    sample(0.95, 250.0, 0.6)
}

/// Wait for the event that settles `uuid`'s admission (dispatched or failed).
async fn settled(events: &mut broadcast::Receiver<DispatchEvent>, uuid: u64) -> DispatchEvent {
    loop {
        let event = events.recv().await.expect("test: event stream open");
        let matches = match &event {
            DispatchEvent::Dispatched { uuid: u, .. }
            | DispatchEvent::Dropped { uuid: u, .. }
            | DispatchEvent::Rejected { uuid: u, .. } => *u == uuid,
            DispatchEvent::Executed { .. } => false,
        };
        if matches {
            return event;
        }
    }
}

async fn advance_to(start: tokio::time::Instant, secs: u64) {
    tokio::time::sleep_until(start + Duration::from_secs(secs)).await;
}

// ============================================================================
// Worked example
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_worked_example_timeline() {
    let service = service(&config());
    let mut events = service.subscribe();
    let t0 = tokio::time::Instant::now();

    // 42 is dispatched before the hot sample; 43 and 44 share the same
    // telemetry stream and carry the later prompts.
    let ids: Vec<WorkerIdentity> = ["42", "43", "44"]
        .iter()
        .map(|k| WorkerIdentity::new(*k, "gpt4"))
        .collect();

    // t=0: healthy sample.
    for id in &ids {
        let ack = service.ingest(id, ok_sample()).expect("test: ingest");
        assert_eq!(ack.verdict, Verdict::Accept);
    }

    // t=5: prompt 42 ends Dispatched.
    advance_to(t0, 5).await;
    let ack = service.submit("42", "hello", "gpt4").expect("test: submit");
    assert_eq!(ack.disposition, Enqueued::Accepted);
    assert!(matches!(
        settled(&mut events, 42).await,
        DispatchEvent::Dispatched { uuid: 42, attempts: 1, .. }
    ));
    assert_eq!(
        service.status(42).map(|s| s.state),
        Some(RequestState::Dispatched)
    );

    // t=10: utilization over the limit.
    advance_to(t0, 10).await;
    for id in &ids {
        service.ingest(id, hot_sample()).expect("test: ingest");
    }
    assert_eq!(service.verdict(&ids[0]), Verdict::Reject);

    // t=11: dropped once retries run out.
    advance_to(t0, 11).await;
    service.submit("43", "hello", "gpt4").expect("test: submit");
    match settled(&mut events, 43).await {
        DispatchEvent::Dropped { reason, .. } => assert_eq!(
            reason,
            FailureReason::AdmissionDenied {
                last_verdict: Verdict::Reject,
                attempts: 3,
            }
        ),
        other => panic!("expected Dropped, got {other:?}"),
    }

    // t=50: the t=10 sample is past the window.
    advance_to(t0, 50).await;
    assert_eq!(service.verdict(&ids[2]), Verdict::Unknown);
    service.submit("44", "hello", "gpt4").expect("test: submit");
    match settled(&mut events, 44).await {
        DispatchEvent::Dropped { reason, .. } => assert_eq!(
            reason,
            FailureReason::AdmissionDenied {
                last_verdict: Verdict::Unknown,
                attempts: 3,
            }
        ),
        other => panic!("expected Dropped, got {other:?}"),
    }
    assert_eq!(
        service.status(44).map(|s| s.state),
        Some(RequestState::Dropped)
    );

    service.shutdown().await;
}

// ============================================================================
// Lifecycle properties
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_identity_without_telemetry_never_dispatches() {
    let service = service(&config());
    let mut events = service.subscribe();

    service.submit("9", "hello", "gpt3").expect("test: submit");
    assert!(matches!(
        settled(&mut events, 9).await,
        DispatchEvent::Dropped { uuid: 9, .. }
    ));
    let status = service.status(9).expect("test: status");
    assert_eq!(status.state, RequestState::Dropped);
    assert_eq!(status.attempts, 3);
    assert_eq!(service.stats().dispatch.dispatched, 0);

    service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_resubmitting_dispatched_uuid_does_not_hand_off_twice() {
    let service = service(&config());
    let mut events = service.subscribe();
    service
        .ingest(&WorkerIdentity::new("42", "gpt4"), ok_sample())
        .expect("test: ingest");

    service.submit("42", "hello", "gpt4").expect("test: submit");
    settled(&mut events, 42).await;

    let again = service.submit("42", "hello", "gpt4").expect("test: submit");
    assert_eq!(
        again.disposition,
        Enqueued::Duplicate {
            state: RequestState::Dispatched
        }
    );
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(service.stats().dispatch.dispatched, 1);

    service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_invalid_submissions_leave_no_record() {
    let service = service(&config());

    assert_eq!(
        service.submit("12a", "hello", "gpt4"),
        Err(ValidationError::MalformedUuid("12a".into()))
    );
    assert_eq!(
        service.submit("7", "hello", "gpt2"),
        Err(ValidationError::UnknownModel("gpt2".into()))
    );
    assert_eq!(
        service.submit("7", "", "gpt4"),
        Err(ValidationError::EmptyPrompt)
    );
    assert!(service.status(7).is_none());
    assert_eq!(service.stats().requests.total, 0);

    service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_accept_during_backoff_is_dispatched() {
    let service = service(&config());
    let mut events = service.subscribe();
    let id = WorkerIdentity::new("5", "gpt5");

    service.ingest(&id, hot_sample()).expect("test: ingest");
    service.submit("5", "hello", "gpt5").expect("test: submit");

    // First attempt fails; recover before the second.
    tokio::time::sleep(Duration::from_millis(50)).await;
    service.ingest(&id, ok_sample()).expect("test: ingest");

    match settled(&mut events, 5).await {
        DispatchEvent::Dispatched { attempts, .. } => assert_eq!(attempts, 2),
        other => panic!("expected Dispatched, got {other:?}"),
    }

    service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_execution_result_is_recorded() {
    let service = service(&config());
    let mut events = service.subscribe();
    service
        .ingest(&WorkerIdentity::new("8", "gpt4"), ok_sample())
        .expect("test: ingest");

    service.submit("8", "echo me", "gpt4").expect("test: submit");
    loop {
        if let DispatchEvent::Executed { uuid: 8, .. } =
            events.recv().await.expect("test: event")
        {
            break;
        }
    }
    let status = service.status(8).expect("test: status");
    let json = serde_json::to_value(&status).expect("test: serialize");
    assert_eq!(json["state"], "dispatched");
    assert_eq!(json["execution"]["outcome"], "completed");
    assert_eq!(json["execution"]["response"], "echo me");

    service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_entry_joins_telemetry_and_requests() {
    let service = service(&config());
    let mut events = service.subscribe();
    let id = WorkerIdentity::new("11", "gpt4");
    service.ingest(&id, ok_sample()).expect("test: ingest");
    service.submit("11", "hello", "gpt4").expect("test: submit");
    settled(&mut events, 11).await;

    let entry = service.entry(&id);
    assert_eq!(entry.verdict, Verdict::Accept);
    assert_eq!(entry.sample, Some(ok_sample()));
    assert_eq!(entry.requests.len(), 1);
    assert_eq!(entry.requests[0].state, RequestState::Dispatched);

    service.shutdown().await;
}

// ============================================================================
// Back-pressure and shutdown
// ============================================================================

#[tokio::test(start_paused = true)]
async fn test_full_queue_rejects_with_queue_full() {
    let mut cfg = config();
    cfg.dispatch.workers = 1;
    cfg.dispatch.queue_capacity = 1;
    let service = service(&cfg);

    // No telemetry: the single worker sits in backoff on uuid 1.
    service.submit("1", "a", "gpt4").expect("test: submit");
    while service.status(1).map(|s| s.state) != Some(RequestState::PendingVerdict) {
        tokio::task::yield_now().await;
    }
    let queued = service.submit("2", "b", "gpt4").expect("test: submit");
    assert_eq!(queued.disposition, Enqueued::Accepted);

    let overflow = service.submit("3", "c", "gpt4").expect("test: submit");
    assert_eq!(
        overflow.disposition,
        Enqueued::Rejected {
            reason: FailureReason::QueueFull
        }
    );
    assert_eq!(
        service.status(3).map(|s| s.state),
        Some(RequestState::Rejected)
    );

    service.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_submissions_after_shutdown_are_rejected() {
    let service = service(&config());
    let report = service.shutdown().await;
    assert!(!report.timed_out);

    let ack = service.submit("77", "late", "gpt4").expect("test: submit");
    assert_eq!(
        ack.disposition,
        Enqueued::Rejected {
            reason: FailureReason::ShuttingDown
        }
    );
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_grace_expiry_drops_pending_work() {
    let mut cfg = config();
    cfg.dispatch.retry_attempts = 50;
    cfg.dispatch.retry_base_ms = 1_000;
    cfg.dispatch.retry_max_ms = 1_000;
    cfg.dispatch.shutdown_grace_ms = 500;
    let service = service(&cfg);
    let mut events = service.subscribe();

    service.submit("31", "x", "gpt4").expect("test: submit");
    while service.status(31).map(|s| s.state) != Some(RequestState::PendingVerdict) {
        tokio::task::yield_now().await;
    }

    let report = service.shutdown().await;
    assert!(report.timed_out);
    assert_eq!(report.remaining_in_flight, 0);
    match settled(&mut events, 31).await {
        DispatchEvent::Dropped { reason, .. } => {
            assert_eq!(reason, FailureReason::ShutdownTimeout)
        }
        other => panic!("expected Dropped, got {other:?}"),
    }
}
