//! Cinder Engine - Sandbox Execution
//!
//! Runs untrusted code inside ephemeral, deny-by-default Linux containers.
//! Two backends implement the same contract: a containerd backend speaking
//! gRPC on Linux, and a docker-CLI backend everywhere else.

pub mod backend;
pub mod cli_backend;
pub mod containerd;
pub mod limits;
pub mod output;
pub mod runtime;
pub mod seccomp;
pub mod security;
pub mod types;
pub mod validate;

pub use backend::{select_backend, AgentProxyInfo, Backend, StreamSinks};
pub use cli_backend::DockerBackend;
pub use containerd::ContainerdBackend;
pub use limits::{LimitTier, ResourceLimits};
pub use output::{CappedBuffer, MAX_STDERR_BYTES, MAX_STDOUT_BYTES};
pub use runtime::{LanguageRuntime, Registry, AGENT_LANGUAGE};
pub use seccomp::{default_profile, network_profile, SyscallProfile};
pub use security::SecurityProfile;
pub use types::{
    ExecutionRequest, ExecutionResult, ExecutionStatus, ResourceUsage, SecurityEvent,
};
pub use validate::RequestValidator;

/// Reserved container-name prefix; anything carrying it with no tracked
/// execution is an orphan and gets reaped.
pub const CONTAINER_PREFIX: &str = "sandbox-";
