//! Execution request and result types

use std::path::PathBuf;
use std::time::Duration;

use crate::limits::ResourceLimits;

/// A validated request to execute code in a sandbox.
///
/// Constructed from the HTTP payload, validated once by
/// [`crate::validate::RequestValidator`], then consumed by a backend.
#[derive(Debug, Clone)]
pub struct ExecutionRequest {
    /// The code blob (or prompt, for the agent runtime)
    pub code: String,

    /// Registered language name
    pub language: String,

    /// Wall-clock budget; `None` uses the per-class default
    pub timeout: Option<Duration>,

    /// Resource overrides; `None` uses the per-class defaults
    pub limits: Option<ResourceLimits>,

    /// Allow outbound network (always on for the agent runtime)
    pub network_enabled: bool,

    /// Host directory mounted writable at /workspace (agent runtime only)
    pub work_dir: Option<PathBuf>,

    /// Extra `KEY=VALUE` environment entries, checked against the blocklist
    pub env_vars: Vec<String>,
}

impl ExecutionRequest {
    pub fn new(code: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            language: language.into(),
            timeout: None,
            limits: None,
            network_enabled: false,
            work_dir: None,
            env_vars: Vec::new(),
        }
    }
}

/// How an execution ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    /// Ran to completion (any exit code)
    Success,
    /// Killed at the deadline; exit code is -1
    Timeout,
    /// Killed by the OOM killer; exit code is 137
    Oom,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Success => "success",
            ExecutionStatus::Timeout => "timeout",
            ExecutionStatus::Oom => "oom",
        }
    }
}

/// The outcome of one sandbox execution. Immutable once the container has
/// terminated.
#[derive(Debug, Clone)]
pub struct ExecutionResult {
    /// Execution id (UUID), also the container-name suffix
    pub id: String,

    /// Captured stdout, capped at 1 MiB
    pub output: String,

    /// Captured stderr, capped at 256 KiB
    pub stderr: String,

    /// -1 on timeout, 137 on resource kill, otherwise the process exit code
    pub exit_code: i32,

    pub duration: Duration,

    pub resource_usage: ResourceUsage,

    pub security_events: Vec<SecurityEvent>,

    /// Hex SHA-256 of the submitted code
    pub code_hash: String,

    pub status: ExecutionStatus,
}

/// Measured resource consumption. Populated when the backend can read
/// cgroup accounting; zeroed otherwise.
#[derive(Debug, Clone, Copy, Default)]
pub struct ResourceUsage {
    pub cpu_time_ms: i64,
    pub memory_peak_mb: i64,
    pub pids_used: i64,
}

/// Suspicious activity observed during an execution.
#[derive(Debug, Clone)]
pub struct SecurityEvent {
    pub kind: String,
    pub syscall: Option<String>,
    pub detail: String,
}

impl SecurityEvent {
    pub fn new(kind: impl Into<String>, detail: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            syscall: None,
            detail: detail.into(),
        }
    }
}
