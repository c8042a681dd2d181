//! Route handlers
//!
//! Decode, validate, run the advisory detector, dispatch to the backend,
//! shape the response. The streaming variant frames output as SSE while
//! the execution runs; everything else is request/response JSON.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, Path, Query, Request, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::StreamExt;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tracing::{error, info};

use crate::audit::{now_ms, AuditLogger, AuditRecord, AuditStore, RecordFilter};
use crate::detector::EscapeDetector;
use crate::metrics::Metrics;
use crate::middleware::{error_response, RequestId};
use crate::stream::{done_frame, error_frame, SseFramer};
use crate::types::{format_duration, ExecuteBody, ExecuteResponse, HealthResponse};
use cinder_engine::{
    Backend, ExecutionRequest, ExecutionResult, SecurityEvent, StreamSinks, MAX_STDERR_BYTES,
    MAX_STDOUT_BYTES,
};
use cinder_core::EngineError;

/// Shared state behind every handler.
#[derive(Clone)]
pub struct ApiState {
    pub backend: Option<Arc<dyn Backend>>,
    pub metrics: Arc<Metrics>,
    pub detector: Arc<EscapeDetector>,
    pub audit: Option<AuditLogger>,
    pub store: Option<Arc<dyn AuditStore>>,
    pub started_at: Instant,
}

struct GaugeGuard(prometheus::Gauge);

impl GaugeGuard {
    fn new(gauge: prometheus::Gauge) -> Self {
        gauge.inc();
        Self(gauge)
    }
}

impl Drop for GaugeGuard {
    fn drop(&mut self) {
        self.0.dec();
    }
}

fn to_engine_request(body: &ExecuteBody) -> ExecutionRequest {
    let mut req = ExecutionRequest::new(body.code.clone(), body.language.clone());
    req.timeout = body.timeout.map(|d| d.0);
    req.limits = body.limits.and_then(|l| l.into_limits());
    req.network_enabled = body.network_enabled();
    req.work_dir = body.work_dir.as_ref().map(std::path::PathBuf::from);
    req.env_vars = body.env_vars.clone().unwrap_or_default();
    req
}

/// Decode the body and run the pre-execution checks shared by both execute
/// endpoints. Returns the parsed body or a ready error response.
fn decode_and_screen(
    state: &ApiState,
    bytes: &Bytes,
    rid: &str,
) -> Result<ExecuteBody, Box<Response>> {
    let body: ExecuteBody = match serde_json::from_slice(bytes) {
        Ok(body) => body,
        Err(e) => {
            return Err(Box::new(error_response(
                StatusCode::BAD_REQUEST,
                "INVALID_REQUEST",
                &format!("invalid JSON: {e}"),
                rid,
            )));
        }
    };

    if body.language.is_empty() {
        return Err(Box::new(error_response(
            StatusCode::BAD_REQUEST,
            "INVALID_REQUEST",
            "language is required",
            rid,
        )));
    }
    if body.code.is_empty() {
        return Err(Box::new(error_response(
            StatusCode::BAD_REQUEST,
            "INVALID_REQUEST",
            "code is required",
            rid,
        )));
    }

    state.metrics.code_size_bytes.observe(body.code.len() as f64);

    let detections = state.detector.analyze_code(&body.code);
    for d in &detections {
        state.metrics.record_security_event(&d.pattern);
    }
    if EscapeDetector::has_critical(&detections) {
        return Err(Box::new(error_response(
            StatusCode::FORBIDDEN,
            "SECURITY_BLOCKED",
            "code blocked by security policy",
            rid,
        )));
    }

    Ok(body)
}

fn log_audit(
    state: &ApiState,
    result: &ExecutionResult,
    language: &str,
    status: &str,
    request_ip: &str,
    started_at_ms: u64,
) {
    if let Some(logger) = &state.audit {
        logger.log(AuditRecord {
            id: result.id.clone(),
            language: language.to_string(),
            code_hash: result.code_hash.clone(),
            exit_code: result.exit_code,
            output: result.output.clone(),
            stderr: result.stderr.clone(),
            duration_ms: result.duration.as_millis() as i64,
            security_events: result.security_events.len(),
            status: status.to_string(),
            request_ip: request_ip.to_string(),
            created_at_ms: started_at_ms,
            completed_at_ms: now_ms(),
        });
    }
}

fn execution_error_response(state: &ApiState, source: &EngineError, rid: &str) -> Response {
    match source {
        EngineError::InvalidRequest(_) | EngineError::UnsupportedLanguage(_) => error_response(
            StatusCode::BAD_REQUEST,
            "INVALID_REQUEST",
            &source.to_string(),
            rid,
        ),
        EngineError::BackendUnavailable(_) => error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "RUNNER_UNAVAILABLE",
            "sandbox backend unavailable",
            rid,
        ),
        EngineError::SecurityViolation(_) => error_response(
            StatusCode::FORBIDDEN,
            "SECURITY_BLOCKED",
            &source.to_string(),
            rid,
        ),
        _ => {
            state.metrics.record_error("internal");
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "INTERNAL",
                "execution failed",
                rid,
            )
        }
    }
}

/// Request id and client IP, both planted by outer layers; empty when a
/// layer did not run (direct handler tests).
fn request_context(req: &Request) -> (String, String) {
    let rid = req
        .extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_default();
    let ip = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip().to_string())
        .unwrap_or_default();
    (rid, ip)
}

async fn read_body(req: Request, rid: &str) -> Result<Bytes, Box<Response>> {
    // The agent-cap middleware has already buffered and size-capped the
    // body for the execute paths.
    axum::body::to_bytes(req.into_body(), usize::MAX)
        .await
        .map_err(|_| {
            Box::new(error_response(
                StatusCode::BAD_REQUEST,
                "INVALID_REQUEST",
                "failed to read body",
                rid,
            ))
        })
}

/// POST /execute
pub async fn execute(State(state): State<ApiState>, req: Request) -> Response {
    let (rid, request_ip) = request_context(&req);
    let bytes = match read_body(req, &rid).await {
        Ok(bytes) => bytes,
        Err(response) => return *response,
    };
    let body = match decode_and_screen(&state, &bytes, &rid) {
        Ok(body) => body,
        Err(response) => return *response,
    };

    let Some(backend) = state.backend.clone() else {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "RUNNER_UNAVAILABLE",
            "sandbox backend unavailable",
            &rid,
        );
    };
    let started_at_ms = now_ms();
    let _gauge = GaugeGuard::new(state.metrics.active_executions.clone());

    match backend.execute(to_engine_request(&body)).await {
        Ok(mut result) => {
            for d in state.detector.analyze_output(&result.output) {
                state.metrics.record_security_event(&d.pattern);
                result.security_events.push(SecurityEvent::new(d.pattern, d.detail));
            }

            let status = result.status.as_str();
            state
                .metrics
                .record_execution(&body.language, status, result.duration.as_secs_f64());
            state
                .metrics
                .output_size_bytes
                .observe((result.output.len() + result.stderr.len()) as f64);
            log_audit(&state, &result, &body.language, status, &request_ip, started_at_ms);

            (StatusCode::OK, axum::Json(ExecuteResponse::from_result(&result))).into_response()
        }
        Err(e) => {
            let is_validation = matches!(
                e.source,
                EngineError::InvalidRequest(_) | EngineError::UnsupportedLanguage(_)
            );
            if is_validation {
                state
                    .metrics
                    .record_execution(&body.language, "validation", 0.0);
            } else {
                error!(error = %e, request_id = %rid, "execution failed");
            }
            execution_error_response(&state, &e.source, &rid)
        }
    }
}

/// POST /execute/stream
pub async fn execute_stream(State(state): State<ApiState>, req: Request) -> Response {
    let (rid, request_ip) = request_context(&req);
    let bytes = match read_body(req, &rid).await {
        Ok(bytes) => bytes,
        Err(response) => return *response,
    };
    let body = match decode_and_screen(&state, &bytes, &rid) {
        Ok(body) => body,
        Err(response) => return *response,
    };

    let Some(backend) = state.backend.clone() else {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "RUNNER_UNAVAILABLE",
            "sandbox backend unavailable",
            &rid,
        );
    };

    let (stdout_tx, mut stdout_rx) = mpsc::channel::<Bytes>(64);
    let (stderr_tx, mut stderr_rx) = mpsc::channel::<Bytes>(64);
    let (frame_tx, frame_rx) = mpsc::channel::<Bytes>(64);

    let exec_state = state.clone();
    let language = body.language.clone();
    let engine_req = to_engine_request(&body);
    tokio::spawn(async move {
        let _gauge = GaugeGuard::new(exec_state.metrics.active_executions.clone());
        let started_at_ms = now_ms();
        let exec = tokio::spawn(async move {
            backend
                .execute_streaming(
                    engine_req,
                    StreamSinks {
                        stdout: stdout_tx,
                        stderr: stderr_tx,
                    },
                )
                .await
        });

        let mut stdout_framer = SseFramer::new("stdout", MAX_STDOUT_BYTES);
        let mut stderr_framer = SseFramer::new("stderr", MAX_STDERR_BYTES);
        let mut stdout_open = true;
        let mut stderr_open = true;
        while stdout_open || stderr_open {
            tokio::select! {
                chunk = stdout_rx.recv(), if stdout_open => match chunk {
                    Some(chunk) => {
                        if let Some(frame) = stdout_framer.frame(&chunk) {
                            if frame_tx.send(frame).await.is_err() {
                                // Client went away; tear the execution down.
                                exec.abort();
                                break;
                            }
                        }
                    }
                    None => stdout_open = false,
                },
                chunk = stderr_rx.recv(), if stderr_open => match chunk {
                    Some(chunk) => {
                        if let Some(frame) = stderr_framer.frame(&chunk) {
                            if frame_tx.send(frame).await.is_err() {
                                exec.abort();
                                break;
                            }
                        }
                    }
                    None => stderr_open = false,
                },
            }
        }

        match exec.await {
            Ok(Ok(result)) => {
                let status = result.status.as_str();
                exec_state.metrics.record_execution(
                    &language,
                    status,
                    result.duration.as_secs_f64(),
                );
                log_audit(&exec_state, &result, &language, status, &request_ip, started_at_ms);

                let payload = serde_json::json!({
                    "id": result.id,
                    "exit_code": result.exit_code,
                    "duration": format_duration(result.duration),
                })
                .to_string();
                let _ = frame_tx.send(done_frame(&payload)).await;
            }
            Ok(Err(e)) => {
                error!(error = %e, "streaming execution failed");
                exec_state.metrics.record_error("internal");
                let _ = frame_tx.send(error_frame("execution failed")).await;
            }
            Err(_) => {
                let _ = frame_tx.send(error_frame("execution failed")).await;
            }
        }
    });

    let stream = ReceiverStream::new(frame_rx).map(Ok::<Bytes, std::convert::Infallible>);
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// GET /executions
pub async fn list_executions(
    State(state): State<ApiState>,
    Query(params): Query<HashMap<String, String>>,
    req: Request,
) -> Response {
    let (rid, _) = request_context(&req);
    let Some(store) = &state.store else {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "AUDIT_UNAVAILABLE",
            "audit store not configured",
            &rid,
        );
    };

    let filter = RecordFilter {
        language: params.get("language").cloned(),
        status: params.get("status").cloned(),
        limit: 100,
    };
    match store.list(filter).await {
        Ok(records) => (StatusCode::OK, axum::Json(records)).into_response(),
        Err(e) => {
            error!(error = %e, "listing executions failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", "query failed", &rid)
        }
    }
}

/// GET /executions/{id}
pub async fn get_execution(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    req: Request,
) -> Response {
    let (rid, _) = request_context(&req);
    let Some(store) = &state.store else {
        return error_response(
            StatusCode::SERVICE_UNAVAILABLE,
            "AUDIT_UNAVAILABLE",
            "audit store not configured",
            &rid,
        );
    };

    match store.get(&id).await {
        Ok(Some(record)) => (StatusCode::OK, axum::Json(record)).into_response(),
        Ok(None) => error_response(StatusCode::NOT_FOUND, "NOT_FOUND", "execution not found", &rid),
        Err(e) => {
            error!(error = %e, "fetching execution failed");
            error_response(StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL", "query failed", &rid)
        }
    }
}

/// DELETE /executions/{id}. Advisory: records the intent.
pub async fn kill_execution(Path(id): Path<String>) -> Response {
    info!(exec_id = %id, "kill requested for execution");
    (
        StatusCode::ACCEPTED,
        axum::Json(serde_json::json!({"status": "kill_requested", "id": id})),
    )
        .into_response()
}

/// GET /health
pub async fn health(State(state): State<ApiState>) -> Response {
    let backend_ok = match &state.backend {
        Some(backend) => backend.healthy().await,
        None => false,
    };
    let audit_ok = match &state.store {
        Some(store) => store.healthy().await,
        None => true,
    };

    let status = if backend_ok && audit_ok { "ok" } else { "degraded" };
    let response = HealthResponse {
        status: status.to_string(),
        backend: backend_ok,
        audit: audit_ok,
        uptime: format!("{}s", state.started_at.elapsed().as_secs()),
    };

    let code = if status == "ok" {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (code, axum::Json(response)).into_response()
}

/// GET /metrics
pub async fn metrics_handler(State(state): State<ApiState>) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
        .into_response()
}
