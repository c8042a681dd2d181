//! Router construction
//!
//! Assembles the route table and the middleware chain. Layer order is
//! load-bearing: recovery wraps everything, the body cap runs before the
//! rate limiter sees a byte of payload, and auth is the innermost gate.

use std::collections::HashSet;
use std::sync::atomic::AtomicI64;
use std::sync::Arc;

use axum::extract::DefaultBodyLimit;
use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::{get, post};
use axum::Router;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;

use crate::handlers::{self, ApiState};
use crate::middleware::{
    agent_limit_middleware, auth_middleware, metrics_middleware, panic_response,
    rate_limit_middleware, request_id_middleware, security_headers_middleware, AgentLimiter,
    AuthState,
};
use crate::ratelimit::IpRateLimiter;
use cinder_core::Config;

/// Build the full router. The returned limiter handle is for stopping its
/// janitor at shutdown.
pub fn build_router(state: ApiState, cfg: &Config) -> (Router, Arc<IpRateLimiter>) {
    let metrics = state.metrics.clone();

    let auth_state = AuthState {
        keys: Arc::new(
            cfg.security
                .allowed_keys
                .iter()
                .filter(|k| !k.is_empty())
                .cloned()
                .collect::<HashSet<_>>(),
        ),
        allow_unauthenticated: cfg.security.allow_unauthenticated,
        metrics_path: cfg.metrics.path.clone(),
    };

    let limiter = IpRateLimiter::new(
        cfg.security.rate_limit_rps,
        cfg.security.rate_limit_burst,
    );

    let agent_limiter = AgentLimiter {
        active: Arc::new(AtomicI64::new(0)),
        max: cfg.sandbox.max_concurrent_agents.max(1),
        max_body: cfg.server.max_request_body,
    };

    let mut router = Router::new()
        .route("/execute", post(handlers::execute))
        .route("/execute/stream", post(handlers::execute_stream))
        .route("/executions", get(handlers::list_executions))
        .route(
            "/executions/{id}",
            get(handlers::get_execution).delete(handlers::kill_execution),
        )
        .route("/health", get(handlers::health));

    if cfg.metrics.enabled {
        router = router.route(&cfg.metrics.path, get(handlers::metrics_handler));
    }

    let router = router
        .with_state(state)
        // Innermost to outermost from here down.
        .layer(from_fn_with_state(auth_state, auth_middleware))
        .layer(from_fn_with_state(agent_limiter, agent_limit_middleware))
        .layer(from_fn_with_state(metrics.clone(), metrics_middleware))
        .layer(from_fn_with_state(
            (limiter.clone(), metrics),
            rate_limit_middleware,
        ))
        .layer(DefaultBodyLimit::max(cfg.server.max_request_body))
        .layer(from_fn(security_headers_middleware))
        .layer(TraceLayer::new_for_http())
        .layer(from_fn(request_id_middleware))
        .layer(CatchPanicLayer::custom(
            panic_response as fn(Box<dyn std::any::Any + Send + 'static>) -> axum::response::Response,
        ));

    (router, limiter)
}
