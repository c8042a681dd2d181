//! Security-critical middleware
//!
//! Ordered outermost-in: recovery, request-id, logging, security headers,
//! body cap, rate limit, metrics, agent-class concurrency cap, auth.
//! Everything here runs before any handler sees a request.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::{ConnectInfo, Request, State};
use axum::http::header::{HeaderValue, AUTHORIZATION, RETRY_AFTER};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use serde::Deserialize;
use uuid::Uuid;

use crate::metrics::Metrics;
use crate::ratelimit::IpRateLimiter;
use crate::types::ErrorBody;
use cinder_engine::AGENT_LANGUAGE;

/// Request id, validated or freshly minted; lives in request extensions.
#[derive(Debug, Clone)]
pub struct RequestId(pub String);

/// Build the standard error body response.
pub fn error_response(status: StatusCode, code: &str, error: &str, request_id: &str) -> Response {
    (
        status,
        axum::Json(ErrorBody {
            error: error.to_string(),
            code: code.to_string(),
            request_id: request_id.to_string(),
        }),
    )
        .into_response()
}

/// Request id from extensions; empty when the middleware has not run.
pub fn request_id(req: &Request) -> String {
    req.extensions()
        .get::<RequestId>()
        .map(|id| id.0.clone())
        .unwrap_or_default()
}

fn valid_request_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-')
}

/// Accept a well-formed caller id or replace it; echo in the response.
pub async fn request_id_middleware(mut req: Request, next: Next) -> Response {
    let id = req
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .filter(|v| valid_request_id(v))
        .map(str::to_string)
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    req.extensions_mut().insert(RequestId(id.clone()));
    let mut response = next.run(req).await;
    if let Ok(value) = HeaderValue::from_str(&id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

/// Hardening headers on every response.
pub async fn security_headers_middleware(req: Request, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert("x-content-type-options", HeaderValue::from_static("nosniff"));
    headers.insert("x-frame-options", HeaderValue::from_static("DENY"));
    headers.insert(
        "content-security-policy",
        HeaderValue::from_static("default-src 'none'"),
    );
    headers.insert("cache-control", HeaderValue::from_static("no-store"));
    response
}

/// Auth middleware configuration.
#[derive(Clone)]
pub struct AuthState {
    pub keys: Arc<HashSet<String>>,
    pub allow_unauthenticated: bool,
    pub metrics_path: String,
}

/// API-key check. `/health` and the metrics path bypass; with no keys
/// configured, requests pass only when unauthenticated mode is explicit.
pub async fn auth_middleware(
    State(state): State<AuthState>,
    req: Request,
    next: Next,
) -> Response {
    let path = req.uri().path();
    if path == "/health" || path == state.metrics_path {
        return next.run(req).await;
    }

    let rid = request_id(&req);
    if state.keys.is_empty() {
        if state.allow_unauthenticated {
            return next.run(req).await;
        }
        return error_response(
            StatusCode::UNAUTHORIZED,
            "AUTH_REQUIRED",
            "unauthorized",
            &rid,
        );
    }

    let presented = req
        .headers()
        .get("x-api-key")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .or_else(|| {
            req.headers()
                .get(AUTHORIZATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.strip_prefix("Bearer "))
                .map(str::to_string)
        });

    match presented {
        Some(key) if state.keys.contains(&key) => next.run(req).await,
        _ => error_response(
            StatusCode::UNAUTHORIZED,
            "AUTH_REQUIRED",
            "unauthorized",
            &rid,
        ),
    }
}

/// Per-IP token bucket; source is the socket peer, never a forwarded
/// header.
pub async fn rate_limit_middleware(
    State((limiter, metrics)): State<(Arc<IpRateLimiter>, Arc<Metrics>)>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    req: Request,
    next: Next,
) -> Response {
    if limiter.check(addr.ip()) {
        return next.run(req).await;
    }

    metrics.rate_limited_total.inc();
    let mut response = error_response(
        StatusCode::TOO_MANY_REQUESTS,
        "RATE_LIMITED",
        "rate limit exceeded",
        &request_id(&req),
    );
    response
        .headers_mut()
        .insert(RETRY_AFTER, HeaderValue::from_static("1"));
    response
}

/// Gauge of requests currently inside the router.
pub async fn metrics_middleware(
    State(metrics): State<Arc<Metrics>>,
    req: Request,
    next: Next,
) -> Response {
    metrics.requests_in_flight.inc();
    let response = next.run(req).await;
    metrics.requests_in_flight.dec();
    response
}

/// Agent-class admission state.
#[derive(Clone)]
pub struct AgentLimiter {
    pub active: Arc<AtomicI64>,
    pub max: i64,
    pub max_body: usize,
}

struct AgentSlot {
    active: Arc<AtomicI64>,
}

impl Drop for AgentSlot {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Deserialize)]
struct LanguagePeek {
    #[serde(default)]
    language: String,
}

/// Strict cap on in-flight agent-class executions. Peeks the JSON body for
/// the language field (restoring it for downstream), then admits through a
/// compare-and-swap loop; over-limit requests are rejected immediately.
pub async fn agent_limit_middleware(
    State(state): State<AgentLimiter>,
    req: Request,
    next: Next,
) -> Response {
    let path = req.uri().path();
    if path != "/execute" && path != "/execute/stream" {
        return next.run(req).await;
    }

    let rid = request_id(&req);
    let (parts, body) = req.into_parts();
    let bytes: Bytes = match axum::body::to_bytes(body, state.max_body).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "INVALID_REQUEST",
                "failed to read body",
                &rid,
            );
        }
    };
    let req = Request::from_parts(parts, Body::from(bytes.clone()));

    let is_agent = serde_json::from_slice::<LanguagePeek>(&bytes)
        .map(|p| p.language == AGENT_LANGUAGE)
        .unwrap_or(false);
    if !is_agent {
        return next.run(req).await;
    }

    // CAS admission: no window between the load and the increment.
    loop {
        let current = state.active.load(Ordering::SeqCst);
        if current >= state.max {
            return error_response(
                StatusCode::TOO_MANY_REQUESTS,
                "AGENT_LIMIT_REACHED",
                "too many concurrent agent sessions",
                &rid,
            );
        }
        if state
            .active
            .compare_exchange(current, current + 1, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
        {
            break;
        }
    }

    let slot = AgentSlot {
        active: state.active.clone(),
    };
    let response = next.run(req).await;
    drop(slot);
    response
}

/// Panic payload -> opaque 500 with the standard error body.
pub fn panic_response(_panic: Box<dyn std::any::Any + Send + 'static>) -> Response {
    tracing::error!("panic recovered in handler");
    error_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        "INTERNAL",
        "internal server error",
        "",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_id_validation() {
        assert!(valid_request_id("abc-123"));
        assert!(valid_request_id(&"a".repeat(64)));
        assert!(!valid_request_id(""));
        assert!(!valid_request_id(&"a".repeat(65)));
        assert!(!valid_request_id("has space"));
        assert!(!valid_request_id("bad\nheader"));
        assert!(!valid_request_id("under_score"));
    }

    #[tokio::test]
    async fn test_agent_slot_decrements_on_drop() {
        let active = Arc::new(AtomicI64::new(1));
        {
            let _slot = AgentSlot {
                active: active.clone(),
            };
        }
        assert_eq!(active.load(Ordering::SeqCst), 0);
    }
}
