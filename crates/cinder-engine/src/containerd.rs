//! Containerd sandbox backend
//!
//! Drives containerd over gRPC: ensure the image, prepare a snapshot,
//! create the container from a locally-built OCI spec, run the task with
//! FIFO stdio, wait or kill at the deadline, then delete task, container,
//! and snapshot on every path. Linux only; the agent class is routed to
//! the docker backend because its workspace and proxy plumbing live there.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::AtomicI64;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use containerd_client::services::v1::container::Runtime as ContainerRuntime;
use containerd_client::services::v1::containers_client::ContainersClient;
use containerd_client::services::v1::content_client::ContentClient;
use containerd_client::services::v1::images_client::ImagesClient;
use containerd_client::services::v1::snapshots::snapshots_client::SnapshotsClient;
use containerd_client::services::v1::snapshots::{PrepareSnapshotRequest, RemoveSnapshotRequest};
use containerd_client::services::v1::tasks_client::TasksClient;
use containerd_client::services::v1::version_client::VersionClient;
use containerd_client::services::v1::{
    Container, CreateContainerRequest, CreateTaskRequest, DeleteContainerRequest,
    DeleteTaskRequest, GetImageRequest, KillRequest, ListContainersRequest, ReadContentRequest,
    StartRequest, TransferRequest, WaitRequest,
};
use containerd_client::types::transfer::{ImageStore, OciRegistry, UnpackConfiguration};
use containerd_client::types::Platform;
use containerd_client::{connect, to_any, with_namespace};
use oci_spec::runtime::{
    LinuxBuilder, Mount, MountBuilder, RootBuilder, Spec, SpecBuilder,
};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tonic::transport::Channel;
use tonic::Request;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{
    drain_executions, effective_timeout, ActiveGuard, Backend, StreamSinks,
};
use crate::limits::{append_mount_if_absent, LimitTier, ResourceLimits};
use crate::output::{pump_stream, CappedBuffer, MAX_STDERR_BYTES, MAX_STDOUT_BYTES};
use crate::runtime::{LanguageRuntime, Registry, AGENT_LANGUAGE};
use crate::security::SecurityProfile;
use crate::types::{ExecutionRequest, ExecutionResult, ExecutionStatus, SecurityEvent};
use crate::validate::RequestValidator;
use crate::CONTAINER_PREFIX;
use cinder_core::{EngineError, ExecutionError, SandboxConfig};

const SNAPSHOTTER: &str = "overlayfs";
const RUNC_RUNTIME: &str = "io.containerd.runc.v2";
const OCI_SPEC_TYPE_URL: &str = "types.containerd.io/opencontainers/runtime-spec/1/Spec";

/// Containerd-based sandbox backend.
pub struct ContainerdBackend {
    channel: Channel,
    namespace: String,
    registry: Arc<Registry>,
    validator: RequestValidator,
    sem: Arc<tokio::sync::Semaphore>,
    active: Arc<AtomicI64>,
    default_timeout: Duration,
    agent_timeout: Duration,
    default_limits: ResourceLimits,
}

impl ContainerdBackend {
    /// Connect to the containerd socket, verify it responds, and reap any
    /// orphans a previous run left behind.
    pub async fn new(cfg: &SandboxConfig) -> Result<Self, EngineError> {
        let channel = connect(&cfg.containerd_socket).await.map_err(|e| {
            EngineError::BackendUnavailable(format!(
                "connecting to containerd at {}: {e}",
                cfg.containerd_socket
            ))
        })?;

        VersionClient::new(channel.clone())
            .version(())
            .await
            .map_err(|e| {
                EngineError::BackendUnavailable(format!("containerd health check failed: {e}"))
            })?;

        info!(
            socket = %cfg.containerd_socket,
            namespace = %cfg.containerd_namespace,
            "connected to containerd"
        );

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
            channel,
            namespace: cfg.containerd_namespace.clone(),
            registry,
            validator,
            sem: Arc::new(tokio::sync::Semaphore::new(cfg.max_concurrent.max(1))),
            active: Arc::new(AtomicI64::new(0)),
            default_timeout: Duration::from_secs(cfg.default_timeout_secs),
            agent_timeout: Duration::from_secs(cfg.agent_max_timeout_secs),
            default_limits: ResourceLimits {
                cpu_shares: cfg.default_limits.cpu_shares,
                memory_mb: cfg.default_limits.memory_mb,
                pids_limit: cfg.default_limits.pids_limit,
                disk_mb: cfg.default_limits.disk_mb,
            },
        };

        match backend.cleanup_orphaned().await {
            Ok(0) => {}
            Ok(n) => info!(count = n, "cleaned orphaned containers on startup"),
            Err(e) => warn!(error = %e, "orphan cleanup failed on startup"),
        }

        Ok(backend)
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
            "execution requested"
        );

        if req.language == AGENT_LANGUAGE {
            return Err(err(
                "validate",
                EngineError::UnsupportedLanguage(
                    "agent runtime requires the docker backend".into(),
                ),
            ));
        }
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
        set_mode(&code_file, 0o444)
            .await
            .map_err(|e| err("chmod_code", e.into()))?;

        self.ensure_image(rt.image())
            .await
            .map_err(|e| err("pull_image", e))?;

        let profile = if req.network_enabled {
            SecurityProfile::network_allowed()
        } else {
            SecurityProfile::standard()
        };
        let limits = req.limits.unwrap_or(self.default_limits);
        let container_id = format!("{CONTAINER_PREFIX}{exec_id}");
        let snapshot_key = format!("{container_id}-snapshot");
        let code_path = rt.container_code_path();

        let spec = build_oci_spec(rt.as_ref(), &req, &profile, limits, host_dir.path(), &code_path)
            .map_err(|e| err("build_spec", e))?;

        let chain_id = self
            .image_chain_id(rt.image())
            .await
            .map_err(|e| err("image_chain_id", e))?;

        let mut snapshots = SnapshotsClient::new(self.channel.clone());
        let prepare = PrepareSnapshotRequest {
            snapshotter: SNAPSHOTTER.to_string(),
            key: snapshot_key.clone(),
            parent: chain_id,
            labels: HashMap::new(),
        };
        let prepare = with_namespace!(prepare, self.namespace.as_str());
        let mounts = snapshots
            .prepare(prepare)
            .await
            .map_err(|e| err("prepare_snapshot", container_op(&container_id, "prepare", e)))?
            .into_inner()
            .mounts;

        // From here on the container (and its snapshot) must be destroyed on
        // every exit path, including cancellation mid-await.
        let mut guard = CleanupGuard::new(
            self.channel.clone(),
            self.namespace.clone(),
            container_id.clone(),
            snapshot_key.clone(),
        );

        let start = Instant::now();
        let run = self
            .run_task(&container_id, &snapshot_key, rt.as_ref(), spec, mounts, host_dir.path(), timeout, sinks)
            .await;

        guard.disarm();
        self.cleanup_container(&container_id, &snapshot_key).await;

        let (exit_code, status, mut security_events, stdout_buf, stderr_buf) =
            run.map_err(|(op, e)| err(op, e))?;

        if status == ExecutionStatus::Timeout {
            security_events.push(SecurityEvent::new(
                "timeout",
                format!("execution exceeded {}s timeout", timeout.as_secs()),
            ));
        }

        let duration = start.elapsed();
        info!(
            exec_id = %exec_id,
            exit_code,
            duration_ms = duration.as_millis() as u64,
            status = status.as_str(),
            "execution completed"
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

    /// Create the container and its task, start it, and wait for exit or
    /// deadline. Returns the captured output buffers alongside the exit
    /// interpretation.
    #[allow(clippy::too_many_arguments)]
    async fn run_task(
        &self,
        container_id: &str,
        snapshot_key: &str,
        rt: &dyn LanguageRuntime,
        spec: Spec,
        rootfs: Vec<containerd_client::types::Mount>,
        host_dir: &Path,
        timeout: Duration,
        sinks: Option<StreamSinks>,
    ) -> Result<
        (i32, ExecutionStatus, Vec<SecurityEvent>, CappedBuffer, CappedBuffer),
        (&'static str, EngineError),
    > {
        let spec_json = serde_json::to_vec(&spec)
            .map_err(|e| ("serialize_spec", EngineError::Internal(e.to_string())))?;
        let spec_any = prost_types::Any {
            type_url: OCI_SPEC_TYPE_URL.to_string(),
            value: spec_json,
        };

        let container = Container {
            id: container_id.to_string(),
            image: rt.image().to_string(),
            runtime: Some(ContainerRuntime {
                name: RUNC_RUNTIME.to_string(),
                options: None,
            }),
            spec: Some(spec_any),
            snapshotter: SNAPSHOTTER.to_string(),
            snapshot_key: snapshot_key.to_string(),
            ..Default::default()
        };

        let mut containers = ContainersClient::new(self.channel.clone());
        let create = CreateContainerRequest {
            container: Some(container),
        };
        let create = with_namespace!(create, self.namespace.as_str());
        containers
            .create(create)
            .await
            .map_err(|e| ("create_container", container_op(container_id, "create", e)))?;

        let (stdout_path, stderr_path) = create_fifos(host_dir)
            .map_err(|e| ("create_fifos", e))?;

        // Open the read ends before the task is created: the shim blocks
        // opening the write ends until a reader shows up.
        let (stdout_sink, stderr_sink) = match sinks {
            Some(s) => (Some(s.stdout), Some(s.stderr)),
            None => (None, None),
        };
        let stdout_task = tokio::spawn(pump_fifo(
            stdout_path.clone(),
            MAX_STDOUT_BYTES,
            stdout_sink,
        ));
        let stderr_task = tokio::spawn(pump_fifo(
            stderr_path.clone(),
            MAX_STDERR_BYTES,
            stderr_sink,
        ));

        let mut tasks = TasksClient::new(self.channel.clone());
        let create_task = CreateTaskRequest {
            container_id: container_id.to_string(),
            rootfs,
            stdin: String::new(),
            stdout: stdout_path.to_string_lossy().to_string(),
            stderr: stderr_path.to_string_lossy().to_string(),
            terminal: false,
            ..Default::default()
        };
        let create_task = with_namespace!(create_task, self.namespace.as_str());
        if let Err(e) = tasks.create(create_task).await {
            release_fifo_readers(&stdout_path, &stderr_path).await;
            return Err(("create_task", container_op(container_id, "create_task", e)));
        }

        let start_task = StartRequest {
            container_id: container_id.to_string(),
            exec_id: String::new(),
        };
        let start_task = with_namespace!(start_task, self.namespace.as_str());
        if let Err(e) = tasks.start(start_task).await {
            release_fifo_readers(&stdout_path, &stderr_path).await;
            return Err(("start_task", container_op(container_id, "start", e)));
        }

        debug!(container = %container_id, "task started");

        let wait = WaitRequest {
            container_id: container_id.to_string(),
            exec_id: String::new(),
        };
        let wait = with_namespace!(wait, self.namespace.as_str());

        let mut security_events = Vec::new();
        let (exit_code, status) =
            match tokio::time::timeout(timeout, tasks.wait(wait)).await {
                Ok(Ok(response)) => {
                    let exit_status = response.into_inner().exit_status as i32;
                    if exit_status == 137 {
                        security_events.push(SecurityEvent::new(
                            "oom_kill",
                            "process killed (OOM or resource limit)",
                        ));
                        if task_oom_killed() {
                            (137, ExecutionStatus::Oom)
                        } else {
                            (exit_status, ExecutionStatus::Success)
                        }
                    } else {
                        (exit_status, ExecutionStatus::Success)
                    }
                }
                Ok(Err(e)) => {
                    return Err(("task_wait", container_op(container_id, "wait", e)));
                }
                Err(_) => {
                    warn!(container = %container_id, "execution timed out, killing task");
                    self.kill_task(container_id).await;
                    (-1, ExecutionStatus::Timeout)
                }
            };

        let stdout_buf = stdout_task
            .await
            .unwrap_or_else(|_| CappedBuffer::new(0));
        let stderr_buf = stderr_task
            .await
            .unwrap_or_else(|_| CappedBuffer::new(0));

        Ok((exit_code, status, security_events, stdout_buf, stderr_buf))
    }

    async fn kill_task(&self, container_id: &str) {
        let mut tasks = TasksClient::new(self.channel.clone());
        let kill = KillRequest {
            container_id: container_id.to_string(),
            exec_id: String::new(),
            signal: 9,
            all: true,
        };
        let kill = with_namespace!(kill, self.namespace.as_str());
        if let Err(e) = tasks.kill(kill).await {
            debug!(container = %container_id, error = %e, "kill failed (task may have exited)");
        }

        // Give the shim a moment to report the exit before cleanup.
        let wait = WaitRequest {
            container_id: container_id.to_string(),
            exec_id: String::new(),
        };
        let wait = with_namespace!(wait, self.namespace.as_str());
        let _ = tokio::time::timeout(Duration::from_secs(5), tasks.wait(wait)).await;
    }

    /// Make the image available locally, pulling and unpacking through the
    /// transfer service when it is missing.
    async fn ensure_image(&self, image: &str) -> Result<(), EngineError> {
        let mut images = ImagesClient::new(self.channel.clone());
        let get = GetImageRequest {
            name: image.to_string(),
        };
        let get = with_namespace!(get, self.namespace.as_str());
        if images.get(get).await.is_ok() {
            return Ok(());
        }

        info!(image = %image, "pulling image");

        let arch = match std::env::consts::ARCH {
            "x86_64" => "amd64",
            "aarch64" => "arm64",
            other => other,
        }
        .to_string();
        let platform = Platform {
            os: "linux".to_string(),
            architecture: arch,
            variant: String::new(),
            os_version: String::new(),
        };

        let source = OciRegistry {
            reference: image.to_string(),
            resolver: None,
        };
        let destination = ImageStore {
            name: image.to_string(),
            labels: HashMap::new(),
            platforms: vec![platform.clone()],
            all_metadata: false,
            manifest_limit: 0,
            extra_references: vec![],
            unpacks: vec![UnpackConfiguration {
                platform: Some(platform),
                snapshotter: SNAPSHOTTER.to_string(),
            }],
        };

        let request = TransferRequest {
            source: Some(to_any(&source)),
            destination: Some(to_any(&destination)),
            options: None,
        };
        let request = with_namespace!(request, self.namespace.as_str());

        let mut transfer =
            containerd_client::services::v1::transfer_client::TransferClient::new(
                self.channel.clone(),
            );
        transfer.transfer(request).await.map_err(|e| {
            EngineError::Container {
                id: image.to_string(),
                op: "pull".into(),
                reason: e.to_string(),
            }
        })?;

        info!(image = %image, "image pulled");
        Ok(())
    }

    /// Resolve the snapshot parent (chain id) for an image by walking
    /// manifest -> config -> diff_ids through the content store.
    async fn image_chain_id(&self, image: &str) -> Result<String, EngineError> {
        let failed = |reason: String| EngineError::Container {
            id: image.to_string(),
            op: "chain_id".into(),
            reason,
        };

        let mut images = ImagesClient::new(self.channel.clone());
        let get = GetImageRequest {
            name: image.to_string(),
        };
        let get = with_namespace!(get, self.namespace.as_str());
        let img = images
            .get(get)
            .await
            .map_err(|e| failed(e.to_string()))?
            .into_inner()
            .image
            .ok_or_else(|| failed("image not found".into()))?;

        let manifest_digest = img
            .target
            .ok_or_else(|| failed("image has no target".into()))?
            .digest;

        let manifest: serde_json::Value =
            serde_json::from_slice(&self.read_content(&manifest_digest).await?)
                .map_err(|e| failed(format!("parse manifest: {e}")))?;
        let config_digest = manifest["config"]["digest"]
            .as_str()
            .ok_or_else(|| failed("manifest has no config digest".into()))?
            .to_string();

        let config: serde_json::Value =
            serde_json::from_slice(&self.read_content(&config_digest).await?)
                .map_err(|e| failed(format!("parse config: {e}")))?;
        let diff_ids: Vec<String> = config["rootfs"]["diff_ids"]
            .as_array()
            .ok_or_else(|| failed("config has no diff_ids".into()))?
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect();

        Ok(compute_chain_id(&diff_ids))
    }

    async fn read_content(&self, digest: &str) -> Result<Vec<u8>, EngineError> {
        let mut content = ContentClient::new(self.channel.clone());
        let read = ReadContentRequest {
            digest: digest.to_string(),
            offset: 0,
            size: 0,
        };
        let read = with_namespace!(read, self.namespace.as_str());
        let mut stream = content
            .read(read)
            .await
            .map_err(|e| EngineError::Internal(format!("read content {digest}: {e}")))?
            .into_inner();

        let mut bytes = Vec::new();
        while let Some(chunk) = stream
            .message()
            .await
            .map_err(|e| EngineError::Internal(format!("read content chunk: {e}")))?
        {
            bytes.extend_from_slice(&chunk.data);
        }
        Ok(bytes)
    }

    /// Best-effort teardown of task, container, and snapshot.
    async fn cleanup_container(&self, container_id: &str, snapshot_key: &str) {
        cleanup_container_inner(
            self.channel.clone(),
            self.namespace.clone(),
            container_id.to_string(),
            snapshot_key.to_string(),
        )
        .await;
    }

    /// Remove sandbox containers left over from previous runs.
    async fn cleanup_orphaned(&self) -> Result<usize, EngineError> {
        let mut containers = ContainersClient::new(self.channel.clone());
        let list = ListContainersRequest { filters: vec![] };
        let list = with_namespace!(list, self.namespace.as_str());
        let found = containers
            .list(list)
            .await
            .map_err(|e| EngineError::Internal(format!("listing containers: {e}")))?
            .into_inner()
            .containers;

        let mut cleaned = 0;
        for c in found {
            if !c.id.starts_with(CONTAINER_PREFIX) {
                continue;
            }
            info!(container_id = %c.id, "cleaning up orphaned sandbox container");
            self.kill_task(&c.id).await;
            self.cleanup_container(&c.id, &format!("{}-snapshot", c.id))
                .await;
            cleaned += 1;
        }
        Ok(cleaned)
    }
}

#[async_trait]
impl Backend for ContainerdBackend {
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
        VersionClient::new(self.channel.clone())
            .version(())
            .await
            .is_ok()
    }

    async fn close(&self) {
        drain_executions(&self.active, "containerd").await;
    }
}

/// Spawns a detached teardown if the owning execution is dropped before it
/// cleans up explicitly (client disconnect, panic unwind).
struct CleanupGuard {
    channel: Channel,
    namespace: String,
    container_id: String,
    snapshot_key: String,
    armed: bool,
}

impl CleanupGuard {
    fn new(channel: Channel, namespace: String, container_id: String, snapshot_key: String) -> Self {
        Self {
            channel,
            namespace,
            container_id,
            snapshot_key,
            armed: true,
        }
    }

    fn disarm(&mut self) {
        self.armed = false;
    }
}

impl Drop for CleanupGuard {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let channel = self.channel.clone();
            let namespace = self.namespace.clone();
            let container_id = self.container_id.clone();
            let snapshot_key = self.snapshot_key.clone();
            handle.spawn(async move {
                let mut tasks = TasksClient::new(channel.clone());
                let kill = KillRequest {
                    container_id: container_id.clone(),
                    exec_id: String::new(),
                    signal: 9,
                    all: true,
                };
                let kill = with_namespace!(kill, namespace.as_str());
                let _ = tasks.kill(kill).await;
                cleanup_container_inner(channel, namespace, container_id, snapshot_key).await;
            });
        }
    }
}

async fn cleanup_container_inner(
    channel: Channel,
    namespace: String,
    container_id: String,
    snapshot_key: String,
) {
    let mut tasks = TasksClient::new(channel.clone());
    let delete_task = DeleteTaskRequest {
        container_id: container_id.clone(),
    };
    let delete_task = with_namespace!(delete_task, namespace.as_str());
    if let Err(e) = tasks.delete(delete_task).await {
        debug!(container = %container_id, error = %e, "task delete failed (may not exist)");
    }

    let mut containers = ContainersClient::new(channel.clone());
    let delete = DeleteContainerRequest {
        id: container_id.clone(),
    };
    let delete = with_namespace!(delete, namespace.as_str());
    if let Err(e) = containers.delete(delete).await {
        debug!(container = %container_id, error = %e, "container delete failed (may not exist)");
    }

    let mut snapshots = SnapshotsClient::new(channel);
    let remove = RemoveSnapshotRequest {
        snapshotter: SNAPSHOTTER.to_string(),
        key: snapshot_key,
    };
    let remove = with_namespace!(remove, namespace.as_str());
    if let Err(e) = snapshots.remove(remove).await {
        debug!(container = %container_id, error = %e, "snapshot remove failed (may not exist)");
    }

    debug!(container = %container_id, "container cleaned up");
}

/// OOM detection for the native backend. Exit 137 alone cannot distinguish
/// the kernel OOM killer from a cgroup kill; answering accurately needs
/// the cgroup memory.events stream.
fn task_oom_killed() -> bool {
    false
}

fn container_op(id: &str, op: &str, e: tonic::Status) -> EngineError {
    EngineError::Container {
        id: id.to_string(),
        op: op.to_string(),
        reason: e.to_string(),
    }
}

fn create_fifos(host_dir: &Path) -> Result<(PathBuf, PathBuf), EngineError> {
    let stdout_path = host_dir.join("stdout");
    let stderr_path = host_dir.join("stderr");
    for path in [&stdout_path, &stderr_path] {
        nix::unistd::mkfifo(path, nix::sys::stat::Mode::from_bits_truncate(0o600))
            .map_err(|e| EngineError::Internal(format!("mkfifo {}: {e}", path.display())))?;
    }
    Ok((stdout_path, stderr_path))
}

async fn pump_fifo(
    path: PathBuf,
    cap: usize,
    sink: Option<mpsc::Sender<Bytes>>,
) -> CappedBuffer {
    match tokio::fs::File::open(&path).await {
        Ok(file) => pump_stream(file, cap, sink).await,
        Err(_) => CappedBuffer::new(cap),
    }
}

/// Open and immediately close the write ends so pumps blocked in `open()`
/// observe EOF when the task never came up.
async fn release_fifo_readers(stdout: &Path, stderr: &Path) {
    for path in [stdout, stderr] {
        let path = path.to_path_buf();
        let _ = tokio::task::spawn_blocking(move || {
            std::fs::OpenOptions::new().write(true).open(path)
        })
        .await;
    }
}

/// Chain id from diff ids (OCI image spec algorithm).
fn compute_chain_id(diff_ids: &[String]) -> String {
    let mut chain_id = String::new();
    for diff_id in diff_ids {
        if chain_id.is_empty() {
            chain_id = diff_id.clone();
        } else {
            let input = format!("{chain_id} {diff_id}");
            let digest = Sha256::digest(input.as_bytes());
            chain_id = format!("sha256:{}", hex::encode(digest));
        }
    }
    chain_id
}

/// The default mount set every sandbox gets, before the bounded tmpfs and
/// the read-only code bind are added.
fn base_mounts() -> Result<Vec<Mount>, EngineError> {
    let build = |dest: &str, typ: &str, src: &str, opts: &[&str]| {
        MountBuilder::default()
            .destination(dest)
            .typ(typ)
            .source(src)
            .options(opts.iter().map(|o| o.to_string()).collect::<Vec<_>>())
            .build()
            .map_err(|e| EngineError::Internal(format!("mount {dest}: {e}")))
    };

    Ok(vec![
        build("/proc", "proc", "proc", &[])?,
        build(
            "/dev",
            "tmpfs",
            "tmpfs",
            &["nosuid", "strictatime", "mode=755", "size=65536k"],
        )?,
        build(
            "/dev/pts",
            "devpts",
            "devpts",
            &[
                "nosuid",
                "noexec",
                "newinstance",
                "ptmxmode=0666",
                "mode=0620",
                "gid=5",
            ],
        )?,
        build(
            "/dev/shm",
            "tmpfs",
            "shm",
            &["nosuid", "noexec", "nodev", "mode=1777", "size=65536k"],
        )?,
        build("/dev/mqueue", "mqueue", "mqueue", &["nosuid", "noexec", "nodev"])?,
        build("/sys", "sysfs", "sysfs", &["nosuid", "noexec", "nodev", "ro"])?,
        build(
            "/sys/fs/cgroup",
            "cgroup",
            "cgroup",
            &["nosuid", "noexec", "nodev", "relatime", "ro"],
        )?,
    ])
}

/// Assemble the complete OCI runtime spec for one execution.
fn build_oci_spec(
    rt: &dyn LanguageRuntime,
    req: &ExecutionRequest,
    profile: &SecurityProfile,
    limits: ResourceLimits,
    host_code_dir: &Path,
    code_path: &str,
) -> Result<Spec, EngineError> {
    let mut env = vec![
        "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin".to_string(),
        "HOME=/tmp".to_string(),
        "LANG=C.UTF-8".to_string(),
        "SANDBOX=true".to_string(),
    ];
    env.extend(req.env_vars.iter().cloned());

    let process = profile
        .process_builder()?
        .args(rt.command(code_path))
        .env(env)
        .cwd("/")
        .rlimits(limits.rlimits()?)
        .build()
        .map_err(|e| EngineError::Internal(format!("process: {e}")))?;

    let root = RootBuilder::default()
        .path("rootfs")
        .readonly(profile.readonly_root)
        .build()
        .map_err(|e| EngineError::Internal(format!("root: {e}")))?;

    let mut mounts = base_mounts()?;
    append_mount_if_absent(&mut mounts, limits.tmpfs_mount()?);
    mounts.push(
        MountBuilder::default()
            .destination("/workspace")
            .typ("bind")
            .source(host_code_dir)
            .options(vec!["rbind".to_string(), "ro".to_string()])
            .build()
            .map_err(|e| EngineError::Internal(format!("workspace mount: {e}")))?,
    );

    let linux = LinuxBuilder::default()
        .namespaces(profile.oci_namespaces()?)
        .masked_paths(profile.masked_paths.clone())
        .readonly_paths(profile.readonly_paths.clone())
        .seccomp(profile.seccomp.to_oci()?)
        .resources(limits.oci_resources()?)
        .build()
        .map_err(|e| EngineError::Internal(format!("linux: {e}")))?;

    SpecBuilder::default()
        .version("1.0.2")
        .hostname("sandbox")
        .root(root)
        .process(process)
        .mounts(mounts)
        .linux(linux)
        .build()
        .map_err(|e| EngineError::Internal(format!("spec: {e}")))
}

async fn set_mode(path: &Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use oci_spec::runtime::LinuxNamespaceType;

    fn spec_for(req: &ExecutionRequest, profile: &SecurityProfile) -> Spec {
        let registry = Registry::new();
        let rt = registry.get(&req.language).unwrap();
        build_oci_spec(
            rt.as_ref(),
            req,
            profile,
            ResourceLimits::default(),
            Path::new("/tmp/sandbox-test"),
            &rt.container_code_path(),
        )
        .unwrap()
    }

    #[test]
    fn test_spec_runs_as_nobody_with_readonly_root() {
        let req = ExecutionRequest::new("print(1)", "python");
        let spec = spec_for(&req, &SecurityProfile::standard());

        let process = spec.process().as_ref().unwrap();
        assert_eq!(process.user().uid(), 65534);
        assert_eq!(process.user().gid(), 65534);
        assert_eq!(process.no_new_privileges(), Some(true));
        assert_eq!(spec.root().as_ref().unwrap().readonly(), Some(true));
    }

    #[test]
    fn test_spec_argv_and_env() {
        let mut req = ExecutionRequest::new("print(1)", "python");
        req.env_vars = vec!["MY_VAR=1".to_string()];
        let spec = spec_for(&req, &SecurityProfile::standard());

        let process = spec.process().as_ref().unwrap();
        let args = process.args().as_ref().unwrap();
        assert_eq!(args[0], "python3");
        assert_eq!(args.last().unwrap(), "/workspace/code.py");

        let env = process.env().as_ref().unwrap();
        assert!(env.contains(&"SANDBOX=true".to_string()));
        assert!(env.contains(&"HOME=/tmp".to_string()));
        assert!(env.contains(&"MY_VAR=1".to_string()));
    }

    #[test]
    fn test_spec_namespaces_and_seccomp() {
        let req = ExecutionRequest::new("print(1)", "python");
        let spec = spec_for(&req, &SecurityProfile::standard());
        let linux = spec.linux().as_ref().unwrap();

        let namespaces = linux.namespaces().as_ref().unwrap();
        assert_eq!(namespaces.len(), 7);
        assert!(namespaces
            .iter()
            .any(|ns| ns.typ() == LinuxNamespaceType::Network));

        assert!(linux.seccomp().is_some());
        assert!(!linux.masked_paths().as_ref().unwrap().is_empty());
        assert!(!linux.readonly_paths().as_ref().unwrap().is_empty());
    }

    #[test]
    fn test_network_spec_keeps_net_namespace() {
        // Network-enabled executions still get their own network
        // namespace; only the seccomp rules differ from the base profile.
        let mut req = ExecutionRequest::new("print(1)", "python");
        req.network_enabled = true;
        let spec = spec_for(&req, &SecurityProfile::network_allowed());
        let namespaces = spec.linux().as_ref().unwrap().namespaces().as_ref().unwrap();
        assert!(namespaces
            .iter()
            .any(|ns| ns.typ() == LinuxNamespaceType::Network));
        assert_eq!(namespaces.len(), 7);
    }

    #[test]
    fn test_spec_mounts_include_tmpfs_and_workspace() {
        let req = ExecutionRequest::new("print(1)", "python");
        let spec = spec_for(&req, &SecurityProfile::standard());
        let mounts = spec.mounts().as_ref().unwrap();

        let tmp = mounts
            .iter()
            .find(|m| m.destination().to_str() == Some("/tmp"))
            .unwrap();
        assert_eq!(tmp.typ().as_deref(), Some("tmpfs"));

        let workspace = mounts
            .iter()
            .find(|m| m.destination().to_str() == Some("/workspace"))
            .unwrap();
        assert!(workspace
            .options()
            .as_ref()
            .unwrap()
            .contains(&"ro".to_string()));

        // exactly one /tmp mount
        assert_eq!(
            mounts
                .iter()
                .filter(|m| m.destination().to_str() == Some("/tmp"))
                .count(),
            1
        );
    }

    #[test]
    fn test_compute_chain_id_single_layer() {
        let ids = vec!["sha256:aaa".to_string()];
        assert_eq!(compute_chain_id(&ids), "sha256:aaa");
    }

    #[test]
    fn test_compute_chain_id_is_order_sensitive() {
        let ab = compute_chain_id(&["sha256:a".to_string(), "sha256:b".to_string()]);
        let ba = compute_chain_id(&["sha256:b".to_string(), "sha256:a".to_string()]);
        assert_ne!(ab, ba);
        assert!(ab.starts_with("sha256:"));
    }

    #[test]
    fn test_oom_detection_placeholder() {
        assert!(!task_oom_killed());
    }
}
