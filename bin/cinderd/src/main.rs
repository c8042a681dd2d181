//! cinderd - sandbox execution server
//!
//! Wires together the engine backend, the auth proxy, the audit sink, and
//! the HTTP surface, then serves until SIGINT/SIGTERM. Shutdown drains
//! in-flight executions (bounded) and flushes the audit sink last.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use cinder_api::handlers::ApiState;
use cinder_api::{audit, build_router, ApiServer, EscapeDetector, InMemoryAuditStore, Metrics};
use cinder_core::Config;
use cinder_engine::backend::AgentProxyInfo;
use cinder_engine::select_backend;
use cinder_proxy::{generate_secret, AuthProxy};

/// Host env vars holding the upstream API token, in priority order.
const TOKEN_ENV_VARS: &[&str] = &["UPSTREAM_API_TOKEN", "AGENT_API_TOKEN"];

#[derive(Parser)]
#[command(name = "cinderd", about = "Sandboxed code execution server")]
struct Cli {
    /// Path to the YAML config file (falls back to $CONFIG_PATH, then
    /// built-in defaults)
    #[arg(long)]
    config: Option<PathBuf>,
}

fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let path = cli
        .config
        .clone()
        .or_else(|| std::env::var("CONFIG_PATH").ok().map(PathBuf::from));

    match path {
        Some(path) if path.exists() => {
            Config::load(&path).with_context(|| format!("loading config {}", path.display()))
        }
        Some(path) => {
            anyhow::bail!("config file {} does not exist", path.display());
        }
        None => {
            info!("no config file given, using defaults");
            let cfg = Config::default();
            cfg.validate().context("default config")?;
            Ok(cfg)
        }
    }
}

fn init_logging(cfg: &Config) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(cfg.logging.level.clone()));

    if cfg.logging.format == "pretty" {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let cfg = load_config(&cli)?;
    init_logging(&cfg);

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let metrics = Arc::new(Metrics::new().context("building metrics")?);

    // Auth proxy, when enabled: the upstream token stays on the host and
    // containers get only the per-startup secret.
    let mut proxy_info = None;
    if cfg.proxy.enabled {
        let token = TOKEN_ENV_VARS
            .iter()
            .find_map(|k| std::env::var(k).ok())
            .unwrap_or_default();
        if token.is_empty() {
            warn!("auth proxy enabled but no upstream token in environment; proxy will forward without auth");
        }

        let secret = generate_secret();
        let proxy = AuthProxy::new(
            cfg.proxy.port,
            &cfg.proxy.upstream_host,
            &token,
            &secret,
            cfg.proxy.max_rpm,
        );
        proxy_info = Some(AgentProxyInfo {
            port: cfg.proxy.port,
            secret,
        });

        let proxy_shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = proxy
                .run_with_shutdown(async move { proxy_shutdown.cancelled().await })
                .await
            {
                error!(error = %e, "auth proxy failed");
            }
        });
    }

    // Backend selection; a missing runtime degrades the server instead of
    // killing it so health and metrics stay reachable for debugging.
    let backend = match select_backend(&cfg, proxy_info).await {
        Ok(backend) => Some(backend),
        Err(e) => {
            warn!(error = %e, "no sandbox backend available (executions will fail)");
            None
        }
    };

    // Audit sink over the in-memory store; a durable store slots in here.
    let store: Arc<dyn cinder_api::AuditStore> =
        Arc::new(InMemoryAuditStore::new(cfg.audit.buffer_size));
    let (audit_logger, audit_worker) = if cfg.audit.enabled {
        let (logger, worker) = audit::start_audit_sink(store.clone(), cfg.audit.buffer_size);
        (Some(logger), Some(worker))
    } else {
        (None, None)
    };

    let state = ApiState {
        backend: backend.clone(),
        metrics,
        detector: Arc::new(EscapeDetector::new()),
        audit: audit_logger.clone(),
        store: Some(store),
        started_at: Instant::now(),
    };

    let (router, rate_limiter) = build_router(state, &cfg);
    let addr = cfg
        .address()
        .parse()
        .with_context(|| format!("invalid listen address {}", cfg.address()))?;
    let server = ApiServer::new(addr, router);

    info!(
        addr = %cfg.address(),
        backend_available = backend.is_some(),
        proxy_enabled = cfg.proxy.enabled,
        "server starting"
    );

    let server_shutdown = shutdown.clone();
    server
        .run_with_shutdown(async move { server_shutdown.cancelled().await })
        .await
        .context("server failed")?;

    // Listener is closed; stop background tasks, drain executions, flush
    // the audit trail last.
    rate_limiter.shutdown();
    if let Some(backend) = backend {
        backend.close().await;
    }
    if let (Some(worker), Some(logger)) = (audit_worker, audit_logger) {
        worker
            .flush(logger, Duration::from_secs(10))
            .await;
    }

    info!("server stopped");
    Ok(())
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        {
            let mut sigterm =
                tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                    .expect("installing SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => info!("received SIGINT, shutting down"),
                _ = sigterm.recv() => info!("received SIGTERM, shutting down"),
            }
        }

        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
            info!("received ctrl-c, shutting down");
        }

        shutdown.cancel();
    });
}
