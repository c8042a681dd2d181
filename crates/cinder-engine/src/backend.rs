//! Backend contract and startup selection
//!
//! Both backends implement the same two-operation contract plus a bounded
//! drain on close. Selection happens once at startup: containerd on Linux,
//! docker CLI as the fallback, or an explicit choice from config.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::types::{ExecutionRequest, ExecutionResult};
use cinder_core::{Config, EngineError, ExecutionError};

/// How long `close()` waits for in-flight executions before giving up.
pub const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Streaming destinations for one execution. Chunks are raw bytes in
/// arrival order; the receiver does its own framing.
pub struct StreamSinks {
    pub stdout: mpsc::Sender<Bytes>,
    pub stderr: mpsc::Sender<Bytes>,
}

/// Connection details the agent class needs to reach the auth proxy.
#[derive(Debug, Clone)]
pub struct AgentProxyInfo {
    pub port: u16,
    /// Per-startup shared secret containers present as their API key
    pub secret: String,
}

/// A sandbox execution backend.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Run code to completion and return the captured result.
    async fn execute(&self, req: ExecutionRequest) -> Result<ExecutionResult, ExecutionError>;

    /// Run code, streaming output chunks into `sinks` as they arrive. The
    /// returned result still carries the capped in-memory capture.
    async fn execute_streaming(
        &self,
        req: ExecutionRequest,
        sinks: StreamSinks,
    ) -> Result<ExecutionResult, ExecutionError>;

    /// Number of currently running executions.
    fn active_count(&self) -> i64;

    /// Liveness of the underlying container runtime.
    async fn healthy(&self) -> bool;

    /// Stop background tasks and wait up to [`DRAIN_TIMEOUT`] for in-flight
    /// executions to finish.
    async fn close(&self);
}

/// Pick the best available backend per the configured preference.
pub async fn select_backend(
    cfg: &Config,
    proxy: Option<AgentProxyInfo>,
) -> Result<Arc<dyn Backend>, EngineError> {
    match cfg.sandbox.backend.as_str() {
        "containerd" => {
            let backend = crate::containerd::ContainerdBackend::new(&cfg.sandbox).await?;
            Ok(Arc::new(backend))
        }
        "docker" => {
            let backend = crate::cli_backend::DockerBackend::new(&cfg.sandbox, proxy).await?;
            Ok(Arc::new(backend))
        }
        "auto" => {
            if cfg!(target_os = "linux") {
                match crate::containerd::ContainerdBackend::new(&cfg.sandbox).await {
                    Ok(backend) => {
                        info!("using containerd backend");
                        return Ok(Arc::new(backend));
                    }
                    Err(e) => {
                        warn!(error = %e, "containerd unavailable, trying docker");
                    }
                }
            }
            let backend = crate::cli_backend::DockerBackend::new(&cfg.sandbox, proxy).await?;
            info!("using docker backend");
            Ok(Arc::new(backend))
        }
        other => Err(EngineError::BackendUnavailable(format!(
            "unknown backend {other:?}: must be auto, containerd, or docker"
        ))),
    }
}

/// Request timeout, falling back to the per-class default.
pub(crate) fn effective_timeout(
    req: &ExecutionRequest,
    default_standard: Duration,
    default_agent: Duration,
) -> Duration {
    req.timeout.unwrap_or(if req.language == crate::runtime::AGENT_LANGUAGE {
        default_agent
    } else {
        default_standard
    })
}

/// Increments a gauge for its lifetime; decrements on drop so unwinding
/// still balances the count.
pub(crate) struct ActiveGuard {
    counter: Arc<AtomicI64>,
}

impl ActiveGuard {
    pub(crate) fn new(counter: Arc<AtomicI64>) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self { counter }
    }
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Poll `active` down to zero, bounded by [`DRAIN_TIMEOUT`].
pub(crate) async fn drain_executions(active: &AtomicI64, backend_name: &str) {
    let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
    loop {
        let count = active.load(Ordering::SeqCst);
        if count == 0 {
            info!(backend = backend_name, "all executions drained");
            return;
        }
        if tokio::time::Instant::now() >= deadline {
            warn!(
                backend = backend_name,
                active = count,
                "timed out waiting for executions to drain"
            );
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_timeout_defaults_per_class() {
        let std_default = Duration::from_secs(10);
        let agent_default = Duration::from_secs(300);

        let req = ExecutionRequest::new("print(1)", "python");
        assert_eq!(
            effective_timeout(&req, std_default, agent_default),
            std_default
        );

        let agent = ExecutionRequest::new("task", "agent");
        assert_eq!(
            effective_timeout(&agent, std_default, agent_default),
            agent_default
        );

        let mut explicit = ExecutionRequest::new("print(1)", "python");
        explicit.timeout = Some(Duration::from_secs(3));
        assert_eq!(
            effective_timeout(&explicit, std_default, agent_default),
            Duration::from_secs(3)
        );
    }

    #[test]
    fn test_active_guard_balances_on_drop() {
        let counter = Arc::new(AtomicI64::new(0));
        {
            let _g1 = ActiveGuard::new(counter.clone());
            let _g2 = ActiveGuard::new(counter.clone());
            assert_eq!(counter.load(Ordering::SeqCst), 2);
        }
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_unknown_backend_preference_rejected() {
        let mut cfg = Config::default();
        cfg.sandbox.backend = "podman".to_string();
        let err = select_backend(&cfg, None).await.err().unwrap();
        assert!(matches!(err, EngineError::BackendUnavailable(_)));
    }
}
