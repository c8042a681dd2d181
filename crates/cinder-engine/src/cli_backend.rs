//! Docker-CLI sandbox backend
//!
//! Drives the `docker` binary directly: compose argv, spawn, tee the pipes,
//! enforce the deadline, tear down. Used on macOS and on Linux hosts
//! without containerd. A reaper task force-removes any container carrying
//! the reserved name prefix whose execution is no longer tracked.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::AtomicI64;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{
    drain_executions, effective_timeout, ActiveGuard, AgentProxyInfo, Backend, StreamSinks,
};
use crate::limits::{LimitTier, ResourceLimits};
use crate::output::{pump_stream, CappedBuffer, MAX_STDERR_BYTES, MAX_STDOUT_BYTES};
use crate::runtime::{LanguageRuntime, Registry, AGENT_LANGUAGE};
use crate::security::{AGENT_UID, SANDBOX_UID};
use crate::types::{ExecutionRequest, ExecutionResult, ExecutionStatus, SecurityEvent};
use crate::validate::RequestValidator;
use crate::CONTAINER_PREFIX;
use cinder_core::{EngineError, ExecutionError, SandboxConfig};

/// Interval between orphan sweeps.
const REAPER_INTERVAL: Duration = Duration::from_secs(300);

/// Host env vars holding the upstream API token, in priority order.
const TOKEN_ENV_VARS: &[&str] = &["UPSTREAM_API_TOKEN", "AGENT_API_TOKEN"];

/// Docker-based sandbox backend.
pub struct DockerBackend {
    registry: Arc<Registry>,
    validator: RequestValidator,
    sem: Arc<tokio::sync::Semaphore>,
    active: Arc<AtomicI64>,
    docker_host: Option<String>,
    proxy: Option<AgentProxyInfo>,
    default_timeout: Duration,
    agent_timeout: Duration,
    default_limits: ResourceLimits,
    reaper_cancel: CancellationToken,
}

impl DockerBackend {
    /// Probe the docker daemon, resolve the socket, and start the orphan
    /// reaper. Fails when no daemon is reachable.
    pub async fn new(
        cfg: &SandboxConfig,
        proxy: Option<AgentProxyInfo>,
    ) -> Result<Self, EngineError> {
        let docker_host = resolve_docker_host().await;

        let mut probe = Command::new("docker");
        probe.arg("info").stdout(Stdio::null()).stderr(Stdio::null());
        if let Some(host) = &docker_host {
            probe.env("DOCKER_HOST", host);
        }
        let status = probe.status().await.map_err(|e| {
            EngineError::BackendUnavailable(format!("docker not found in PATH: {e}"))
        })?;
        if !status.success() {
            return Err(EngineError::BackendUnavailable(
                "docker daemon not reachable".into(),
            ));
        }

        let registry = Arc::new(Registry::new());
        let tier = if cfg.dev_tier {
            LimitTier::Dev
        } else {
            LimitTier::Standard
        };
        let validator = RequestValidator::new(
            registry.clone(),
            cfg.allowed_workdir_roots.iter().map(PathBuf::from).collect(),
            tier,
            Duration::from_secs(cfg.max_timeout_secs),
            Duration::from_secs(cfg.agent_max_timeout_secs),
        );

        let backend = Self {
            registry,
            validator,
            sem: Arc::new(tokio::sync::Semaphore::new(cfg.max_concurrent.max(1))),
            active: Arc::new(AtomicI64::new(0)),
            docker_host,
            proxy,
            default_timeout: Duration::from_secs(cfg.default_timeout_secs),
            agent_timeout: Duration::from_secs(cfg.agent_max_timeout_secs),
            default_limits: ResourceLimits {
                cpu_shares: cfg.default_limits.cpu_shares,
                memory_mb: cfg.default_limits.memory_mb,
                pids_limit: cfg.default_limits.pids_limit,
                disk_mb: cfg.default_limits.disk_mb,
            },
            reaper_cancel: CancellationToken::new(),
        };

        backend.spawn_reaper();
        Ok(backend)
    }

    fn spawn_reaper(&self) {
        let cancel = self.reaper_cancel.clone();
        let docker_host = self.docker_host.clone();
        tokio::spawn(async move {
            // One sweep at startup catches leftovers from a crashed server.
            cleanup_orphans(docker_host.as_deref()).await;
            loop {
                tokio::select! {
                    _ = tokio::time::sleep(REAPER_INTERVAL) => {
                        cleanup_orphans(docker_host.as_deref()).await;
                    }
                    _ = cancel.cancelled() => return,
                }
            }
        });
    }

    fn docker_command(&self) -> Command {
        let mut cmd = Command::new("docker");
        if let Some(host) = &self.docker_host {
            cmd.env("DOCKER_HOST", host);
        }
        cmd
    }

    async fn execute_internal(
        &self,
        mut req: ExecutionRequest,
        sinks: Option<StreamSinks>,
    ) -> Result<ExecutionResult, ExecutionError> {
        let exec_id = Uuid::new_v4().to_string();
        let code_hash = hex::encode(Sha256::digest(req.code.as_bytes()));
        let err = |op, source| ExecutionError::new(&exec_id, op, source);

        info!(
            exec_id = %exec_id,
            language = %req.language,
            code_hash = %&code_hash[..16],
            "docker execution requested"
        );

        self.validator
            .validate(&mut req)
            .map_err(|e| ExecutionError::new(&exec_id, "validate", e))?;

        let _permit = self
            .sem
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| err("acquire_slot", EngineError::Internal("engine closed".into())))?;
        let _active = ActiveGuard::new(self.active.clone());

        let timeout = effective_timeout(&req, self.default_timeout, self.agent_timeout);
        let rt = self
            .registry
            .get(&req.language)
            .map_err(|e| ExecutionError::new(&exec_id, "get_runtime", e))?;
        let is_agent = req.language == AGENT_LANGUAGE;

        // Private host dir for this execution; removed on every exit path
        // when the guard drops.
        let host_dir = tempfile::Builder::new()
            .prefix(&format!("{CONTAINER_PREFIX}{exec_id}-"))
            .tempdir()
            .map_err(|e| err("create_temp_dir", e.into()))?;

        let code_file = host_dir
            .path()
            .join(format!("code{}", rt.file_extension()));
        tokio::fs::write(&code_file, req.code.as_bytes())
            .await
            .map_err(|e| err("write_code", e.into()))?;
        // World-readable: the container user is unprivileged.
        set_mode(&code_file, 0o444)
            .await
            .map_err(|e| err("chmod_code", e.into()))?;

        // Without the proxy the upstream token enters the container as a
        // mounted secret file, never as an env var visible in `docker
        // inspect` or /proc/*/environ.
        if is_agent && self.proxy.is_none() {
            if let Some(token) = TOKEN_ENV_VARS.iter().find_map(|k| std::env::var(k).ok()) {
                let token_path = host_dir.path().join("auth_token");
                tokio::fs::write(&token_path, token.as_bytes())
                    .await
                    .map_err(|e| err("write_token", e.into()))?;
                set_mode(&token_path, 0o400)
                    .await
                    .map_err(|e| err("chmod_token", e.into()))?;
            }
        }

        let profile = if is_agent || req.network_enabled {
            crate::seccomp::network_profile()
        } else {
            crate::seccomp::default_profile()
        };
        let seccomp_path = host_dir.path().join("seccomp.json");
        tokio::fs::write(
            &seccomp_path,
            profile
                .to_cli_json()
                .map_err(|e| err("seccomp_profile", e))?,
        )
        .await
        .map_err(|e| err("write_seccomp", e.into()))?;

        let limits = req.limits.unwrap_or(if is_agent {
            ResourceLimits::agent_defaults()
        } else {
            self.default_limits
        });
        let container_code_path = rt.container_code_path();
        let args = build_docker_args(
            &exec_id,
            rt.as_ref(),
            &code_file,
            &container_code_path,
            host_dir.path(),
            &seccomp_path,
            &req,
            limits,
            self.proxy.as_ref(),
        );

        debug!(exec_id = %exec_id, container = %format!("{CONTAINER_PREFIX}{exec_id}"), "starting docker container");
        let start = Instant::now();

        let mut cmd = self.docker_command();
        cmd.args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd.spawn().map_err(|e| err("docker_run", e.into()))?;

        let (stdout_sink, stderr_sink) = match sinks {
            Some(s) => (Some(s.stdout), Some(s.stderr)),
            None => (None, None),
        };
        let stdout_pipe = child.stdout.take().expect("stdout piped");
        let stderr_pipe = child.stderr.take().expect("stderr piped");
        let stdout_task =
            tokio::spawn(pump_stream(stdout_pipe, MAX_STDOUT_BYTES, stdout_sink));
        let stderr_task =
            tokio::spawn(pump_stream(stderr_pipe, MAX_STDERR_BYTES, stderr_sink));

        let mut security_events = Vec::new();
        let (exit_code, status) = match tokio::time::timeout(timeout, child.wait()).await {
            Ok(wait) => {
                let wait = wait.map_err(|e| err("docker_wait", e.into()))?;
                let code = wait.code().unwrap_or(-1);
                if code == 137 {
                    security_events.push(SecurityEvent::new(
                        "oom_kill",
                        "process killed (OOM or resource limit)",
                    ));
                }
                (code, ExecutionStatus::Success)
            }
            Err(_) => {
                warn!(exec_id = %exec_id, "execution timed out, killing container");
                let _ = child.start_kill();
                self.force_remove(&exec_id).await;
                let _ = child.wait().await;
                security_events.push(SecurityEvent::new(
                    "timeout",
                    format!("execution exceeded {}s timeout", timeout.as_secs()),
                ));
                (-1, ExecutionStatus::Timeout)
            }
        };

        let stdout_buf = stdout_task.await.unwrap_or_else(|_| CappedBuffer::new(0));
        let stderr_buf = stderr_task.await.unwrap_or_else(|_| CappedBuffer::new(0));
        let duration = start.elapsed();

        info!(
            exec_id = %exec_id,
            exit_code,
            duration_ms = duration.as_millis() as u64,
            status = status.as_str(),
            "docker execution completed"
        );

        Ok(ExecutionResult {
            id: exec_id,
            output: stdout_buf.into_string(),
            stderr: stderr_buf.into_string(),
            exit_code,
            duration,
            resource_usage: Default::default(),
            security_events,
            code_hash,
            status,
        })
    }

    async fn force_remove(&self, exec_id: &str) {
        let mut cmd = self.docker_command();
        cmd.args(["rm", "-f", &format!("{CONTAINER_PREFIX}{exec_id}")])
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        let _ = cmd.status().await;
    }
}

#[async_trait]
impl Backend for DockerBackend {
    async fn execute(&self, req: ExecutionRequest) -> Result<ExecutionResult, ExecutionError> {
        self.execute_internal(req, None).await
    }

    async fn execute_streaming(
        &self,
        req: ExecutionRequest,
        sinks: StreamSinks,
    ) -> Result<ExecutionResult, ExecutionError> {
        self.execute_internal(req, Some(sinks)).await
    }

    fn active_count(&self) -> i64 {
        self.active.load(std::sync::atomic::Ordering::SeqCst)
    }

    async fn healthy(&self) -> bool {
        let mut cmd = self.docker_command();
        cmd.arg("info").stdout(Stdio::null()).stderr(Stdio::null());
        matches!(
            tokio::time::timeout(Duration::from_secs(5), cmd.status()).await,
            Ok(Ok(status)) if status.success()
        )
    }

    async fn close(&self) {
        self.reaper_cancel.cancel();
        drain_executions(&self.active, "docker").await;
    }
}

/// Figure out the docker socket. Docker Desktop on macOS uses a
/// context-specific socket that child processes don't inherit.
async fn resolve_docker_host() -> Option<String> {
    if let Ok(host) = std::env::var("DOCKER_HOST") {
        if !host.is_empty() {
            return Some(host);
        }
    }

    let out = Command::new("docker")
        .args(["context", "inspect", "--format", "{{.Endpoints.docker.Host}}"])
        .output()
        .await
        .ok()?;
    if !out.status.success() {
        return None;
    }
    let host = String::from_utf8_lossy(&out.stdout).trim().to_string();
    if host.is_empty() {
        None
    } else {
        debug!(docker_host = %host, "resolved docker host from context");
        Some(host)
    }
}

/// Force-remove every container carrying the reserved prefix. Runs at
/// startup and on a timer; survivors of a crashed server die here.
async fn cleanup_orphans(docker_host: Option<&str>) {
    let mut list = Command::new("docker");
    list.args(["ps", "--filter", &format!("name={CONTAINER_PREFIX}"), "-q"]);
    if let Some(host) = docker_host {
        list.env("DOCKER_HOST", host);
    }
    let Ok(out) = list.output().await else { return };
    if !out.status.success() {
        return;
    }

    for id in String::from_utf8_lossy(&out.stdout).split_whitespace() {
        warn!(container_id = %id, "removing orphaned sandbox container");
        let mut rm = Command::new("docker");
        rm.args(["rm", "-f", id])
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        if let Some(host) = docker_host {
            rm.env("DOCKER_HOST", host);
        }
        let _ = rm.status().await;
    }
}

async fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await
}

/// Compose the full `docker run` argv for one execution.
#[allow(clippy::too_many_arguments)]
fn build_docker_args(
    exec_id: &str,
    rt: &dyn LanguageRuntime,
    host_code_file: &Path,
    container_code_path: &str,
    host_dir: &Path,
    seccomp_path: &Path,
    req: &ExecutionRequest,
    limits: ResourceLimits,
    proxy: Option<&AgentProxyInfo>,
) -> Vec<String> {
    let is_agent = rt.name() == AGENT_LANGUAGE;

    let network = if req.network_enabled || is_agent {
        "bridge"
    } else {
        "none"
    };
    let (user, home) = if is_agent {
        (format!("{AGENT_UID}:{AGENT_UID}"), "/home/agent")
    } else {
        (format!("{SANDBOX_UID}:{SANDBOX_UID}"), "/tmp")
    };

    let mut args: Vec<String> = vec![
        "run".into(),
        "--rm".into(),
        "--name".into(),
        format!("{CONTAINER_PREFIX}{exec_id}"),
        "--network".into(),
        network.into(),
        "--cap-drop".into(),
        "ALL".into(),
        "--security-opt".into(),
        "no-new-privileges".into(),
        "--security-opt".into(),
        format!("seccomp={}", seccomp_path.display()),
        "--memory".into(),
        format!("{}m", limits.memory_mb),
        "--memory-swap".into(),
        format!("{}m", limits.memory_mb),
        "--pids-limit".into(),
        limits.pids_limit.to_string(),
        "--cpus".into(),
        format!("{:.1}", limits.cpu_shares as f64 / 1024.0),
        "--tmpfs".into(),
        format!("/tmp:rw,nosuid,nodev,size={}m", limits.disk_mb),
        "-v".into(),
        format!("{}:{container_code_path}:ro", host_code_file.display()),
        "--user".into(),
        user,
        "-e".into(),
        format!("HOME={home}"),
        "-e".into(),
        "LANG=C.UTF-8".into(),
        "-e".into(),
        "SANDBOX=true".into(),
    ];

    // The agent interpreter writes to home caches at startup; every other
    // runtime gets a read-only rootfs.
    if !is_agent {
        args.push("--read-only".into());
    }

    if is_agent {
        if let Some(work_dir) = &req.work_dir {
            args.push("-v".into());
            args.push(format!("{}:/workspace:rw", work_dir.display()));
        }

        match proxy {
            Some(proxy) => {
                // Proxy mode: the container only ever sees the per-startup
                // shared secret, which is worthless against the upstream
                // API directly.
                args.push("--add-host".into());
                args.push("host.docker.internal:host-gateway".into());
                args.push("-e".into());
                args.push(format!(
                    "AGENT_BASE_URL=http://host.docker.internal:{}",
                    proxy.port
                ));
                args.push("-e".into());
                args.push(format!("AGENT_API_KEY={}", proxy.secret));
            }
            None => {
                let token_path = host_dir.join("auth_token");
                if token_path.exists() {
                    args.push("-v".into());
                    args.push(format!(
                        "{}:/run/secrets/auth_token:ro",
                        token_path.display()
                    ));
                }
            }
        }
    }

    for env in &req.env_vars {
        args.push("-e".into());
        args.push(env.clone());
    }

    args.push(rt.image().into());
    args.extend(rt.command(container_code_path));

    args
}
