//! Auth-injection reverse proxy
//!
//! Listens in plaintext on loopback and forwards to the upstream API over
//! HTTPS. Containers never hold the real token: they present a per-startup
//! shared secret, which the proxy validates in constant time before
//! swapping in the configured upstream token. The secret is regenerated on
//! every process start, so a copy leaked from a container is useless both
//! off-host and across restarts.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::{HeaderValue, AUTHORIZATION, HOST};
use axum::http::{StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use rand::RngCore;
use subtle::ConstantTimeEq;
use tokio::net::TcpListener;
use tracing::{info, warn};

type HttpsClient = Client<hyper_rustls::HttpsConnector<HttpConnector>, Body>;

const API_KEY_HEADER: &str = "x-api-key";

/// Generate the per-startup proxy secret: 32 random bytes, hex-encoded.
pub fn generate_secret() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

struct ProxyState {
    client: HttpsClient,
    upstream_host: String,
    token: String,
    secret: String,
    max_rpm: i64,
    window_count: AtomicI64,
    window_start: AtomicI64,
}

/// Reverse proxy that injects the upstream token.
pub struct AuthProxy {
    addr: SocketAddr,
    state: Arc<ProxyState>,
}

impl AuthProxy {
    /// Build a proxy bound to `127.0.0.1:port`, forwarding to
    /// `upstream_host` over HTTPS with `token` injected. A non-empty
    /// `secret` gates every request; `max_rpm` of 0 means unlimited.
    pub fn new(port: u16, upstream_host: &str, token: &str, secret: &str, max_rpm: u32) -> Self {
        let https = hyper_rustls::HttpsConnectorBuilder::new()
            .with_webpki_roots()
            .https_only()
            .enable_http1()
            .build();
        let client: HttpsClient = Client::builder(TokioExecutor::new()).build(https);

        Self {
            addr: SocketAddr::from(([127, 0, 0, 1], port)),
            state: Arc::new(ProxyState {
                client,
                upstream_host: upstream_host.to_string(),
                token: token.to_string(),
                secret: secret.to_string(),
                max_rpm: i64::from(max_rpm),
                window_count: AtomicI64::new(0),
                window_start: AtomicI64::new(unix_now()),
            }),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .fallback(forward)
            .with_state(self.state.clone())
    }

    /// Serve until the shutdown future completes.
    pub async fn run_with_shutdown(
        self,
        shutdown: impl std::future::Future<Output = ()> + Send + 'static,
    ) -> std::io::Result<()> {
        let listener = TcpListener::bind(self.addr).await?;
        info!(bind = %self.addr, upstream = %self.state.upstream_host, "auth proxy listening");

        axum::serve(listener, self.router())
            .with_graceful_shutdown(shutdown)
            .await?;

        info!("auth proxy shut down");
        Ok(())
    }
}

async fn forward(State(state): State<Arc<ProxyState>>, req: Request) -> Response {
    if !state.secret.is_empty() {
        let presented = req
            .headers()
            .get(API_KEY_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default();
        if !secret_matches(presented, &state.secret) {
            return (StatusCode::FORBIDDEN, "forbidden").into_response();
        }
    }

    if state.max_rpm > 0 && !allow_request(&state) {
        return (
            StatusCode::TOO_MANY_REQUESTS,
            r#"{"error":"proxy rate limit exceeded","code":"PROXY_RATE_LIMITED"}"#,
        )
            .into_response();
    }

    let req = match prepare_upstream_request(req, &state.upstream_host, &state.token) {
        Ok(req) => req,
        Err(e) => {
            warn!(error = %e, "failed to rewrite proxied request");
            return (StatusCode::BAD_GATEWAY, "bad gateway").into_response();
        }
    };

    match state.client.request(req).await {
        Ok(response) => response.map(Body::new),
        Err(e) => {
            warn!(error = %e, "upstream request failed");
            (StatusCode::BAD_GATEWAY, "bad gateway").into_response()
        }
    }
}

/// Constant-time secret comparison.
fn secret_matches(presented: &str, secret: &str) -> bool {
    presented.as_bytes().ct_eq(secret.as_bytes()).into()
}

/// Per-minute window on two atomics. The reset race across a window
/// boundary can admit a few extra requests; that overshoot is accepted.
fn allow_request(state: &ProxyState) -> bool {
    let now = unix_now();
    let window_start = state.window_start.load(Ordering::SeqCst);
    if now - window_start >= 60 {
        state.window_start.store(now, Ordering::SeqCst);
        state.window_count.store(1, Ordering::SeqCst);
        return true;
    }
    state.window_count.fetch_add(1, Ordering::SeqCst) + 1 <= state.max_rpm
}

/// Rewrite a caller request for the upstream leg: HTTPS URI on the
/// upstream host, caller auth headers stripped, the real token injected.
fn prepare_upstream_request(
    mut req: Request,
    upstream_host: &str,
    token: &str,
) -> Result<Request, axum::http::Error> {
    let path_and_query = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let uri: Uri = format!("https://{upstream_host}{path_and_query}").parse()?;
    *req.uri_mut() = uri;

    let headers = req.headers_mut();
    headers.remove(API_KEY_HEADER);
    headers.remove(AUTHORIZATION);
    headers.insert(API_KEY_HEADER, HeaderValue::from_str(token)?);
    headers.insert(HOST, HeaderValue::from_str(upstream_host)?);

    Ok(req)
}

fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
