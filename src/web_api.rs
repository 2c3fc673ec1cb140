//! Web API Server
//!
//! HTTP surface over an [`AdmissionService`].
//!
//! ## Endpoints
//!
//! - `POST /api/v1/submit`: Submit a prompt `{uuid, prompt, model}`
//! - `POST /api/v1/telemetry`: Report a resource sample for an identity
//! - `GET  /api/v1/verdict/:client_key/:model`: Current admission verdict
//! - `GET  /api/v1/status/:uuid`: Request lifecycle snapshot
//! - `GET  /api/v1/entry/:client_key/:model`: Telemetry joined with requests
//! - `GET  /health`: Health check with service counters
//! - `GET  /metrics`: Prometheus metrics

use axum::{
    body::Body,
    extract::{rejection::JsonRejection, Path, State},
    http::{header, HeaderValue, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::dispatch::Enqueued;
use crate::service::{AdmissionService, SubmitAck};
use crate::store::FailureReason;
use crate::telemetry::{RejectedSample, SampleReading};
use crate::validator::ValidationError;
use crate::{AdmissionError, Verdict, WorkerIdentity};

// ============================================================================
// Wire types
// ============================================================================

/// JSON body for `POST /api/v1/submit`.
///
/// `uuid` may be a JSON number or a decimal string; anything else is
/// reported as a malformed UUID rather than a body error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitBody {
    /// Request id.
    pub uuid: serde_json::Value,
    /// Prompt text.
    pub prompt: String,
    /// Requested model.
    pub model: String,
}

impl SubmitBody {
    fn uuid_text(&self) -> String {
        match &self.uuid {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }
}

/// JSON body for `POST /api/v1/telemetry`.
///
/// Matches the collector format:
/// `{"gpuUtilization": .., "vramUsage": .., "powerDraw": .., "uuid": {"userID": .., "model": ..}}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryBody {
    /// The reading.
    #[serde(flatten)]
    pub reading: SampleReading,
    /// Identity the reading belongs to.
    #[serde(rename = "uuid", alias = "identity")]
    pub identity: WorkerIdentity,
}

/// `POST /api/v1/telemetry` success body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryResponse {
    /// Always `"ack"`.
    pub status: String,
    /// Verdict right after the update.
    pub verdict: Verdict,
}

/// `GET /api/v1/verdict` body.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerdictResponse {
    /// Client key queried.
    pub client_key: String,
    /// Model queried.
    pub model: String,
    /// Verdict now, freshness applied.
    pub verdict: Verdict,
}

// ============================================================================
// Server
// ============================================================================

/// Build the router over `service`.
pub fn router(service: Arc<AdmissionService>, max_request_size: usize) -> Router {
    Router::new()
        .route("/api/v1/submit", post(submit_handler))
        .route("/api/v1/telemetry", post(telemetry_handler))
        .route("/api/v1/verdict/:client_key/:model", get(verdict_handler))
        .route("/api/v1/status/:uuid", get(status_handler))
        .route("/api/v1/entry/:client_key/:model", get(entry_handler))
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .layer(middleware::from_fn(request_id_middleware))
        .layer(middleware::from_fn_with_state(
            max_request_size,
            body_size_middleware,
        ))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(service)
}

/// Serve on an already-bound listener until `shutdown` resolves.
///
/// # Errors
///
/// Returns [`AdmissionError::Other`] if the server fails.
pub async fn serve<F>(
    listener: TcpListener,
    service: Arc<AdmissionService>,
    max_request_size: usize,
    shutdown: F,
) -> Result<(), AdmissionError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let app = router(service, max_request_size);
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| AdmissionError::Other(format!("web API server failed: {e}")))
}

/// Bind `config.host:config.port` and serve until `shutdown` resolves.
///
/// # Errors
///
/// Returns [`AdmissionError::Other`] if the address cannot be bound or the
/// server fails.
///
/// # Panics
///
/// This function never panics.
pub async fn start_server<F>(
    config: &ServerConfig,
    service: Arc<AdmissionService>,
    shutdown: F,
) -> Result<(), AdmissionError>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = format!("{}:{}", config.host, config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| AdmissionError::Other(format!("failed to bind {addr}: {e}")))?;
    info!("Web API ready on http://{}", addr);
    serve(listener, service, config.max_request_size, shutdown).await
}

// ============================================================================
// Middleware
// ============================================================================

/// Adds an `X-Request-ID` header to every response, preserving the client's
/// if it sent one.
async fn request_id_middleware(req: Request<Body>, next: Next) -> Response {
    let request_id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .map(|s| s.to_string())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let mut response = next.run(req).await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }

    response
}

/// Rejects requests whose `Content-Length` exceeds `max_size` with 413.
async fn body_size_middleware(
    State(max_size): State<usize>,
    req: Request<Body>,
    next: Next,
) -> Response {
    if let Some(content_length) = req
        .headers()
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<usize>().ok())
    {
        if content_length > max_size {
            return (
                StatusCode::PAYLOAD_TOO_LARGE,
                Json(serde_json::json!({"status": "error", "error": "Request body too large"})),
            )
                .into_response();
        }
    }

    next.run(req).await
}

// ============================================================================
// Handlers
// ============================================================================

/// HTTP status for a submission that passed validation.
///
/// Queued and duplicate submissions are 202; a full queue is 429 and a
/// gateway that is shutting down is 503.
fn submit_status(disposition: &Enqueued) -> StatusCode {
    match disposition {
        Enqueued::Accepted | Enqueued::Duplicate { .. } => StatusCode::ACCEPTED,
        Enqueued::Rejected {
            reason: FailureReason::QueueFull,
        } => StatusCode::TOO_MANY_REQUESTS,
        Enqueued::Rejected { .. } => StatusCode::SERVICE_UNAVAILABLE,
    }
}

/// `POST /api/v1/submit`: 202 with the disposition, 400 when invalid,
/// 429 or 503 when refused.
async fn submit_handler(
    State(service): State<Arc<AdmissionService>>,
    body: Result<Json<SubmitBody>, JsonRejection>,
) -> Result<(StatusCode, Json<serde_json::Value>), AppError> {
    let Json(body) = body?;
    let ack: SubmitAck = service.submit(&body.uuid_text(), &body.prompt, &body.model)?;
    let status = submit_status(&ack.disposition);
    let mut json = serde_json::to_value(&ack).map_err(|e| AppError::Internal(e.to_string()))?;
    if let Some(map) = json.as_object_mut() {
        let label = if status == StatusCode::ACCEPTED {
            "received"
        } else {
            "rejected"
        };
        map.insert("status".into(), label.into());
    }
    Ok((status, Json(json)))
}

/// `POST /api/v1/telemetry`: 200 with the new verdict, or 422.
async fn telemetry_handler(
    State(service): State<Arc<AdmissionService>>,
    body: Result<Json<TelemetryBody>, JsonRejection>,
) -> Result<Json<TelemetryResponse>, AppError> {
    let Json(body) = body?;
    let ack = service.ingest(&body.identity, body.reading)?;
    Ok(Json(TelemetryResponse {
        status: "ack".into(),
        verdict: ack.verdict,
    }))
}

/// `GET /api/v1/verdict/:client_key/:model`
async fn verdict_handler(
    State(service): State<Arc<AdmissionService>>,
    Path((client_key, model)): Path<(String, String)>,
) -> Json<VerdictResponse> {
    let verdict = service.verdict(&WorkerIdentity::new(client_key.as_str(), model.as_str()));
    Json(VerdictResponse {
        client_key,
        model,
        verdict,
    })
}

/// `GET /api/v1/status/:uuid`: 404 for unknown or swept requests.
async fn status_handler(
    State(service): State<Arc<AdmissionService>>,
    Path(uuid): Path<String>,
) -> Result<Response, AppError> {
    let uuid: u64 = uuid.parse().map_err(|_| AppError::NotFound)?;
    let status = service.status(uuid).ok_or(AppError::NotFound)?;
    Ok(Json(status).into_response())
}

/// `GET /api/v1/entry/:client_key/:model`
async fn entry_handler(
    State(service): State<Arc<AdmissionService>>,
    Path((client_key, model)): Path<(String, String)>,
) -> Response {
    Json(service.entry(&WorkerIdentity::new(client_key, model))).into_response()
}

/// `GET /health`
async fn health_handler(State(service): State<Arc<AdmissionService>>) -> Json<serde_json::Value> {
    let status = if service.is_shutting_down() {
        "shutting_down"
    } else {
        "healthy"
    };
    Json(serde_json::json!({
        "status": status,
        "version": env!("CARGO_PKG_VERSION"),
        "stats": service.stats(),
    }))
}

/// `GET /metrics`: Prometheus text exposition.
async fn metrics_handler() -> String {
    crate::metrics::gather_metrics()
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug)]
enum AppError {
    Invalid(ValidationError),
    Rejected(RejectedSample),
    Body(JsonRejection),
    NotFound,
    Internal(String),
}

impl From<ValidationError> for AppError {
    fn from(e: ValidationError) -> Self {
        Self::Invalid(e)
    }
}

impl From<RejectedSample> for AppError {
    fn from(e: RejectedSample) -> Self {
        Self::Rejected(e)
    }
}

impl From<JsonRejection> for AppError {
    fn from(e: JsonRejection) -> Self {
        Self::Body(e)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, body) = match self {
            AppError::Invalid(e) => (
                StatusCode::BAD_REQUEST,
                serde_json::json!({"status": "error", "kind": e.kind(), "error": e.to_string()}),
            ),
            AppError::Rejected(e) => (
                StatusCode::UNPROCESSABLE_ENTITY,
                serde_json::json!({"status": "rejected", "error": e.to_string()}),
            ),
            AppError::Body(e) => (
                StatusCode::BAD_REQUEST,
                serde_json::json!({"status": "error", "kind": "malformed_body", "error": e.body_text()}),
            ),
            AppError::NotFound => (
                StatusCode::NOT_FOUND,
                serde_json::json!({"status": "error", "error": "Request not found"}),
            ),
            AppError::Internal(e) => {
                warn!(error = %e, "internal error in web API");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    serde_json::json!({"status": "error", "error": "Internal error"}),
                )
            }
        };

        (status, Json(body)).into_response()
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::RequestState;

    #[test]
    fn test_submit_body_accepts_number_or_string_uuid() {
        let n: SubmitBody =
            serde_json::from_str(r#"{"uuid": 42, "prompt": "p", "model": "gpt4"}"#)
                .expect("test: deser");
        assert_eq!(n.uuid_text(), "42");
        let s: SubmitBody =
            serde_json::from_str(r#"{"uuid": "42", "prompt": "p", "model": "gpt4"}"#)
                .expect("test: deser");
        assert_eq!(s.uuid_text(), "42");
        let neg: SubmitBody =
            serde_json::from_str(r#"{"uuid": -1, "prompt": "p", "model": "gpt4"}"#)
                .expect("test: deser");
        assert_eq!(neg.uuid_text(), "-1");
    }

    #[test]
    fn test_telemetry_body_parses_collector_format() {
        let body: TelemetryBody = serde_json::from_str(
            r#"{"gpuUtilization": 0.5, "vramUsage": 0.6, "powerDraw": 250.0,
                "uuid": {"userID": "42", "model": "gpt4"}}"#,
        )
        .expect("test: deser");
        assert_eq!(body.identity, WorkerIdentity::new("42", "gpt4"));
        assert_eq!(body.reading.power_draw, 250.0);
    }

    #[test]
    fn test_telemetry_body_parses_snake_case() {
        let body: TelemetryBody = serde_json::from_str(
            r#"{"gpu_utilization": 0.1, "vram_usage": 0.2, "power_draw": 3.0,
                "identity": {"client_key": "7", "model": "gpt3"}}"#,
        )
        .expect("test: deser");
        assert_eq!(body.identity.client_key, "7");
        assert_eq!(body.reading.gpu_utilization, 0.1);
    }

    #[test]
    fn test_submit_status_by_disposition() {
        assert_eq!(submit_status(&Enqueued::Accepted), StatusCode::ACCEPTED);
        assert_eq!(
            submit_status(&Enqueued::Duplicate {
                state: RequestState::Dispatched
            }),
            StatusCode::ACCEPTED
        );
        assert_eq!(
            submit_status(&Enqueued::Rejected {
                reason: FailureReason::QueueFull
            }),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            submit_status(&Enqueued::Rejected {
                reason: FailureReason::ShuttingDown
            }),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_app_error_status_codes() {
        assert_eq!(
            AppError::Invalid(ValidationError::EmptyPrompt)
                .into_response()
                .status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::Rejected(RejectedSample::InvalidTelemetry {
                field: "power_draw",
                value: -1.0,
                expected: ">= 0",
            })
            .into_response()
            .status(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            AppError::NotFound.into_response().status(),
            StatusCode::NOT_FOUND
        );
    }
}
