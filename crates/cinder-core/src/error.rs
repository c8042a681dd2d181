//! Core error types for cinder
//!
//! This module defines the error hierarchy shared by the engine, the HTTP
//! surface, and the server binary.

use thiserror::Error;

/// Errors produced while executing code in a sandbox
#[derive(Debug, Error)]
pub enum EngineError {
    /// Request failed validation
    #[error("invalid execution request: {0}")]
    InvalidRequest(String),

    /// Language is not in the runtime registry
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),

    /// Execution exceeded its deadline
    #[error("execution timed out")]
    Timeout,

    /// Process killed by the kernel OOM killer or a resource cap
    #[error("out of memory")]
    Oom,

    /// No container runtime is reachable
    #[error("sandbox backend unavailable: {0}")]
    BackendUnavailable(String),

    /// Blocked by the escape detector
    #[error("security violation: {0}")]
    SecurityViolation(String),

    /// A container lifecycle operation failed
    #[error("container {id}: {op} failed: {reason}")]
    Container {
        id: String,
        op: String,
        reason: String,
    },

    /// Filesystem or pipe error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything unexpected
    #[error("internal error: {0}")]
    Internal(String),
}

impl EngineError {
    /// True if this error carries a usable execution result (timeout, OOM)
    /// rather than denoting a failed run.
    pub fn has_partial_result(&self) -> bool {
        matches!(self, EngineError::Timeout | EngineError::Oom)
    }
}

/// Wraps an [`EngineError`] with the execution id and the operation that
/// failed, so log lines and API errors can be correlated.
#[derive(Debug, Error)]
#[error("execution {exec_id}: {op}: {source}")]
pub struct ExecutionError {
    pub exec_id: String,
    pub op: &'static str,
    #[source]
    pub source: EngineError,
}

impl ExecutionError {
    pub fn new(exec_id: impl Into<String>, op: &'static str, source: EngineError) -> Self {
        Self {
            exec_id: exec_id.into(),
            op,
            source,
        }
    }
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read or parse the config file
    #[error("failed to load config from {path}: {reason}")]
    LoadFailed { path: String, reason: String },

    /// A value is out of range or inconsistent
    #[error("invalid configuration for {key}: {reason}")]
    Invalid { key: String, reason: String },
}

/// Result type alias for engine operations
pub type Result<T, E = EngineError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_execution_error_display() {
        let err = ExecutionError::new(
            "abc-123",
            "create_container",
            EngineError::Internal("boom".into()),
        );
        let msg = err.to_string();
        assert!(msg.contains("abc-123"));
        assert!(msg.contains("create_container"));
    }

    #[test]
    fn test_partial_result_kinds() {
        assert!(EngineError::Timeout.has_partial_result());
        assert!(EngineError::Oom.has_partial_result());
        assert!(!EngineError::Internal("x".into()).has_partial_result());
    }
}
