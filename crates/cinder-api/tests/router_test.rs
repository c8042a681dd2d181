//! End-to-end router tests over a mock backend: middleware chain order,
//! auth, rate limiting, the agent concurrency cap, and SSE framing.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::body::Body;
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use tower::ServiceExt;

use cinder_api::handlers::ApiState;
use cinder_api::{build_router, EscapeDetector, InMemoryAuditStore, Metrics};
use cinder_core::{Config, ExecutionError};
use cinder_engine::{
    Backend, ExecutionRequest, ExecutionResult, ExecutionStatus, StreamSinks,
};

/// Canned backend: echoes a fixed result, optionally after a delay, and
/// streams a fixed stdout payload.
struct MockBackend {
    delay: Duration,
    stdout: String,
}

impl MockBackend {
    fn instant(stdout: &str) -> Arc<Self> {
        Arc::new(Self {
            delay: Duration::ZERO,
            stdout: stdout.to_string(),
        })
    }

    fn slow(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            stdout: "ok".to_string(),
        })
    }

    fn result(&self, req: &ExecutionRequest) -> ExecutionResult {
        ExecutionResult {
            id: "00000000-0000-0000-0000-000000000001".to_string(),
            output: self.stdout.clone(),
            stderr: String::new(),
            exit_code: 0,
            duration: Duration::from_millis(5),
            resource_usage: Default::default(),
            security_events: Vec::new(),
            code_hash: format!("{:x}", req.code.len()),
            status: ExecutionStatus::Success,
        }
    }
}

#[async_trait]
impl Backend for MockBackend {
    async fn execute(&self, req: ExecutionRequest) -> Result<ExecutionResult, ExecutionError> {
        tokio::time::sleep(self.delay).await;
        Ok(self.result(&req))
    }

    async fn execute_streaming(
        &self,
        req: ExecutionRequest,
        sinks: StreamSinks,
    ) -> Result<ExecutionResult, ExecutionError> {
        tokio::time::sleep(self.delay).await;
        let _ = sinks
            .stdout
            .send(bytes::Bytes::from(self.stdout.clone()))
            .await;
        Ok(self.result(&req))
    }

    fn active_count(&self) -> i64 {
        0
    }

    async fn healthy(&self) -> bool {
        true
    }

    async fn close(&self) {}
}

fn state_with(backend: Option<Arc<dyn Backend>>) -> ApiState {
    ApiState {
        backend,
        metrics: Arc::new(Metrics::new().unwrap()),
        detector: Arc::new(EscapeDetector::new()),
        audit: None,
        store: Some(Arc::new(InMemoryAuditStore::new(16))),
        started_at: Instant::now(),
    }
}

fn open_config() -> Config {
    let mut cfg = Config::default();
    cfg.security.allow_unauthenticated = true;
    cfg
}

fn post(path: &str, body: &str) -> Request<Body> {
    let mut req = Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap();
    req.extensions_mut()
        .insert(ConnectInfo::<SocketAddr>("127.0.0.1:9999".parse().unwrap()));
    req
}

fn get(path: &str) -> Request<Body> {
    let mut req = Request::builder()
        .method("GET")
        .uri(path)
        .body(Body::empty())
        .unwrap();
    req.extensions_mut()
        .insert(ConnectInfo::<SocketAddr>("127.0.0.1:9999".parse().unwrap()));
    req
}

async fn body_json(response: axum::response::Response) -> serde_json::Value {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    serde_json::from_slice(&bytes).unwrap()
}

#[tokio::test]
async fn test_execute_happy_path() {
    let (router, limiter) = build_router(
        state_with(Some(MockBackend::instant("5050\n"))),
        &open_config(),
    );

    let response = router
        .oneshot(post("/execute", r#"{"code":"print(sum(range(101)))","language":"python"}"#))
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("x-content-type-options").unwrap(),
        "nosniff"
    );
    assert_eq!(response.headers().get("x-frame-options").unwrap(), "DENY");
    assert!(response.headers().contains_key("x-request-id"));

    let json = body_json(response).await;
    assert_eq!(json["output"], "5050\n");
    assert_eq!(json["exit_code"], 0);
    assert!(json["id"].as_str().is_some());
    limiter.shutdown();
}

#[tokio::test]
async fn test_missing_fields_rejected() {
    let (router, limiter) = build_router(
        state_with(Some(MockBackend::instant("x"))),
        &open_config(),
    );

    let response = router
        .clone()
        .oneshot(post("/execute", r#"{"language":"python"}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let json = body_json(response).await;
    assert_eq!(json["code"], "INVALID_REQUEST");

    let response = router
        .oneshot(post("/execute", "{not json"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    limiter.shutdown();
}

#[tokio::test]
async fn test_no_backend_is_503() {
    let (router, limiter) = build_router(state_with(None), &open_config());

    let response = router
        .oneshot(post("/execute", r#"{"code":"print(1)","language":"python"}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let json = body_json(response).await;
    assert_eq!(json["code"], "RUNNER_UNAVAILABLE");
    limiter.shutdown();
}

#[tokio::test]
async fn test_critical_detection_blocks() {
    let (router, limiter) = build_router(
        state_with(Some(MockBackend::instant("x"))),
        &open_config(),
    );

    let body = serde_json::json!({
        "code": "echo pwn > /sys/fs/cgroup/release_agent",
        "language": "bash",
    })
    .to_string();
    let response = router.oneshot(post("/execute", &body)).await.unwrap();

    assert_eq!(response.status(), StatusCode::FORBIDDEN);
    let json = body_json(response).await;
    assert_eq!(json["code"], "SECURITY_BLOCKED");
    limiter.shutdown();
}

#[tokio::test]
async fn test_auth_matrix() {
    let mut cfg = Config::default();
    cfg.security.allowed_keys = vec!["k1".to_string()];
    let (router, limiter) = build_router(state_with(Some(MockBackend::instant("x"))), &cfg);

    // No key.
    let response = router
        .clone()
        .oneshot(post("/execute", r#"{"code":"1","language":"python"}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Wrong key.
    let mut req = post("/execute", r#"{"code":"1","language":"python"}"#);
    req.headers_mut().insert("x-api-key", "nope".parse().unwrap());
    let response = router.clone().oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    // Header key.
    let mut req = post("/execute", r#"{"code":"1","language":"python"}"#);
    req.headers_mut().insert("x-api-key", "k1".parse().unwrap());
    let response = router.clone().oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Bearer key.
    let mut req = post("/execute", r#"{"code":"1","language":"python"}"#);
    req.headers_mut()
        .insert("authorization", "Bearer k1".parse().unwrap());
    let response = router.clone().oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Health bypasses auth.
    let response = router.oneshot(get("/health")).await.unwrap();
    assert_ne!(response.status(), StatusCode::UNAUTHORIZED);
    limiter.shutdown();
}

#[tokio::test]
async fn test_locked_down_without_keys() {
    // No keys configured and unauthenticated mode off: everything but
    // health/metrics is rejected.
    let cfg = Config::default();
    let (router, limiter) = build_router(state_with(Some(MockBackend::instant("x"))), &cfg);

    let response = router
        .oneshot(post("/execute", r#"{"code":"1","language":"python"}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    limiter.shutdown();
}

#[tokio::test]
async fn test_rate_limit_denies_with_retry_after() {
    let mut cfg = open_config();
    cfg.security.rate_limit_rps = 0.001;
    cfg.security.rate_limit_burst = 1;
    let (router, limiter) = build_router(state_with(Some(MockBackend::instant("x"))), &cfg);

    let first = router.clone().oneshot(get("/health")).await.unwrap();
    assert_ne!(first.status(), StatusCode::TOO_MANY_REQUESTS);

    let second = router.oneshot(get("/health")).await.unwrap();
    assert_eq!(second.status(), StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(second.headers().get("retry-after").unwrap(), "1");
    let json = body_json(second).await;
    assert_eq!(json["code"], "RATE_LIMITED");
    limiter.shutdown();
}

#[tokio::test]
async fn test_request_id_echo_and_replacement() {
    let (router, limiter) = build_router(
        state_with(Some(MockBackend::instant("x"))),
        &open_config(),
    );

    let mut req = get("/health");
    req.headers_mut()
        .insert("x-request-id", "my-id-123".parse().unwrap());
    let response = router.clone().oneshot(req).await.unwrap();
    assert_eq!(response.headers().get("x-request-id").unwrap(), "my-id-123");

    let mut req = get("/health");
    req.headers_mut()
        .insert("x-request-id", "bad id with spaces".parse().unwrap());
    let response = router.oneshot(req).await.unwrap();
    let replaced = response
        .headers()
        .get("x-request-id")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert_ne!(replaced, "bad id with spaces");
    assert_eq!(replaced.len(), 36, "replacement should be a UUID");
    limiter.shutdown();
}

#[tokio::test]
async fn test_agent_concurrency_cap() {
    let mut cfg = open_config();
    cfg.sandbox.max_concurrent_agents = 1;
    let (router, limiter) = build_router(
        state_with(Some(MockBackend::slow(Duration::from_millis(250)))),
        &cfg,
    );

    let body = r#"{"code":"do things","language":"agent"}"#;
    let first = router.clone().oneshot(post("/execute", body));
    let second = async {
        // Let the first request take the slot.
        tokio::time::sleep(Duration::from_millis(50)).await;
        router.clone().oneshot(post("/execute", body)).await
    };

    let (first, second) = tokio::join!(first, second);
    let statuses = [first.unwrap().status(), second.unwrap().status()];
    assert!(statuses.contains(&StatusCode::OK), "{statuses:?}");
    assert!(
        statuses.contains(&StatusCode::TOO_MANY_REQUESTS),
        "{statuses:?}"
    );

    // The slot is released afterwards.
    let third = router.oneshot(post("/execute", body)).await.unwrap();
    assert_eq!(third.status(), StatusCode::OK);
    limiter.shutdown();
}

#[tokio::test]
async fn test_agent_cap_ignores_standard_languages() {
    let mut cfg = open_config();
    cfg.sandbox.max_concurrent_agents = 1;
    let (router, limiter) = build_router(
        state_with(Some(MockBackend::slow(Duration::from_millis(200)))),
        &cfg,
    );

    let body = r#"{"code":"print(1)","language":"python"}"#;
    let (a, b) = tokio::join!(
        router.clone().oneshot(post("/execute", body)),
        router.clone().oneshot(post("/execute", body)),
    );
    assert_eq!(a.unwrap().status(), StatusCode::OK);
    assert_eq!(b.unwrap().status(), StatusCode::OK);
    limiter.shutdown();
}

#[tokio::test]
async fn test_body_cap_enforced() {
    let mut cfg = open_config();
    cfg.server.max_request_body = 256;
    let (router, limiter) = build_router(
        state_with(Some(MockBackend::instant("x"))),
        &cfg,
    );

    let huge = serde_json::json!({
        "code": "a".repeat(1024),
        "language": "python",
    })
    .to_string();
    let response = router.oneshot(post("/execute", &huge)).await.unwrap();
    assert!(
        response.status() == StatusCode::BAD_REQUEST
            || response.status() == StatusCode::PAYLOAD_TOO_LARGE,
        "got {}",
        response.status()
    );
    limiter.shutdown();
}

#[tokio::test]
async fn test_sse_stream_cannot_be_forged() {
    let hostile = "x\nevent: fake\ndata: y";
    let (router, limiter) = build_router(
        state_with(Some(MockBackend::instant(hostile))),
        &open_config(),
    );

    let response = router
        .oneshot(post(
            "/execute/stream",
            r#"{"code":"print('x')","language":"python"}"#,
        ))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers().get("content-type").unwrap(),
        "text/event-stream"
    );

    let raw = response.into_body().collect().await.unwrap().to_bytes();
    let raw = std::str::from_utf8(&raw).unwrap();

    // Parse the SSE stream: collect (event, data) pairs.
    let mut stdout_data = Vec::new();
    let mut events = Vec::new();
    for block in raw.split("\n\n").filter(|b| !b.is_empty()) {
        let mut event = "";
        let mut data = Vec::new();
        for line in block.split('\n') {
            if let Some(rest) = line.strip_prefix("event: ") {
                event = rest;
            } else if let Some(rest) = line.strip_prefix("data: ") {
                data.push(rest);
            }
        }
        events.push(event.to_string());
        if event == "stdout" {
            stdout_data.push(data.join("\n"));
        }
    }

    // No forged event; the hostile payload round-trips as data.
    assert!(!events.contains(&"fake".to_string()));
    assert_eq!(stdout_data.concat(), hostile);
    assert!(events.contains(&"done".to_string()));
    limiter.shutdown();
}

#[tokio::test]
async fn test_health_reports_degraded_without_backend() {
    let (router, limiter) = build_router(state_with(None), &open_config());
    let response = router.oneshot(get("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let json = body_json(response).await;
    assert_eq!(json["status"], "degraded");
    assert_eq!(json["backend"], false);
    limiter.shutdown();
}

#[tokio::test]
async fn test_executions_endpoints_use_store() {
    let (router, limiter) = build_router(
        state_with(Some(MockBackend::instant("captured"))),
        &open_config(),
    );

    // Run one execution so the store has a record.
    let state_router = router.clone();
    let response = state_router
        .oneshot(post("/execute", r#"{"code":"print(1)","language":"python"}"#))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    // Listing works even when nothing was audited (audit logger is None
    // here), so just verify the endpoint shape.
    let response = router.clone().oneshot(get("/executions")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = router
        .clone()
        .oneshot(get("/executions/does-not-exist"))
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    // Advisory kill.
    let mut req = Request::builder()
        .method("DELETE")
        .uri("/executions/abc")
        .body(Body::empty())
        .unwrap();
    req.extensions_mut()
        .insert(ConnectInfo::<SocketAddr>("127.0.0.1:9999".parse().unwrap()));
    let response = router.oneshot(req).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    limiter.shutdown();
}
