//! Request validation
//!
//! Ordered, fail-fast checks over an incoming execution request. The
//! workspace-mount gatekeeper resolves symlinks first and validates the
//! resolved path, which then replaces the caller's value so later stages
//! never see the unresolved one.

use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::limits::LimitTier;
use crate::runtime::{Registry, AGENT_LANGUAGE};
use crate::types::ExecutionRequest;
use cinder_core::EngineError;

/// Code blob size cap (1 MiB).
pub const MAX_CODE_BYTES: usize = 1 << 20;

/// Env var keys that must never be passed into a container.
const ENV_BLOCKLIST: &[&str] = &[
    "LD_PRELOAD",
    "LD_LIBRARY_PATH",
    "HTTP_PROXY",
    "HTTPS_PROXY",
    "NODE_OPTIONS",
    "PYTHONPATH",
    "PATH",
    "HOME",
    "USER",
];

/// Directories a work_dir may never equal or live under.
const SENSITIVE_PREFIXES: &[&str] = &["/etc", "/var", "/root"];

/// Path segments that mark a directory as holding credentials.
const SENSITIVE_SEGMENTS: &[&str] = &[".ssh", ".aws", ".gnupg", ".claude"];

/// Validates execution requests against the registry and the configured
/// mount policy.
#[derive(Clone)]
pub struct RequestValidator {
    registry: Arc<Registry>,
    allowed_roots: Vec<PathBuf>,
    tier: LimitTier,
    max_timeout: Duration,
    agent_max_timeout: Duration,
}

impl RequestValidator {
    pub fn new(
        registry: Arc<Registry>,
        allowed_roots: Vec<PathBuf>,
        tier: LimitTier,
        max_timeout: Duration,
        agent_max_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            allowed_roots,
            tier,
            max_timeout,
            agent_max_timeout,
        }
    }

    /// Run all checks in order. On success the request's `work_dir` holds
    /// the symlink-resolved path. Idempotent: validating a validated
    /// request changes nothing.
    pub fn validate(&self, req: &mut ExecutionRequest) -> Result<(), EngineError> {
        if req.code.is_empty() {
            return Err(EngineError::InvalidRequest("code is empty".into()));
        }
        if req.code.len() > MAX_CODE_BYTES {
            return Err(EngineError::InvalidRequest(
                "code exceeds 1MiB limit".into(),
            ));
        }

        self.registry.get(&req.language)?;
        let is_agent = req.language == AGENT_LANGUAGE;

        let max_timeout = if is_agent {
            self.agent_max_timeout
        } else {
            self.max_timeout
        };
        if let Some(timeout) = req.timeout {
            if timeout > max_timeout {
                return Err(EngineError::InvalidRequest(format!(
                    "timeout exceeds {}s maximum",
                    max_timeout.as_secs()
                )));
            }
        }

        for env in &req.env_vars {
            validate_env_var(env)?;
        }

        if let Some(work_dir) = req.work_dir.take() {
            if !is_agent {
                return Err(EngineError::InvalidRequest(
                    "work_dir is only supported by the agent runtime".into(),
                ));
            }
            req.work_dir = Some(self.validate_work_dir(&work_dir)?);
        }

        if let Some(limits) = &req.limits {
            limits.validate(self.tier)?;
        }

        Ok(())
    }

    fn validate_work_dir(&self, work_dir: &Path) -> Result<PathBuf, EngineError> {
        // Resolve symlinks up front; every later check (and the eventual
        // mount) uses the resolved path, closing the check-vs-use race.
        let real = std::fs::canonicalize(work_dir)
            .map_err(|_| EngineError::InvalidRequest("work_dir is not valid".into()))?;
        if !real.is_dir() {
            return Err(EngineError::InvalidRequest(
                "work_dir is not a valid directory".into(),
            ));
        }

        for prefix in SENSITIVE_PREFIXES {
            if real == Path::new(prefix) || real.starts_with(prefix) {
                return Err(EngineError::InvalidRequest(format!(
                    "work_dir {real:?} is under a sensitive path {prefix:?}"
                )));
            }
        }

        for component in real.components() {
            if let Component::Normal(segment) = component {
                if SENSITIVE_SEGMENTS
                    .iter()
                    .any(|s| segment.eq_ignore_ascii_case(s))
                {
                    return Err(EngineError::InvalidRequest(format!(
                        "work_dir contains sensitive directory {segment:?}"
                    )));
                }
            }
        }

        if self.allowed_roots.is_empty() {
            return Err(EngineError::InvalidRequest(
                "no allowed workspace roots configured; work_dir mounts are disabled".into(),
            ));
        }
        if !self
            .allowed_roots
            .iter()
            .any(|root| real == *root || real.starts_with(root))
        {
            return Err(EngineError::InvalidRequest(
                "work_dir is not under an allowed root".into(),
            ));
        }

        Ok(real)
    }
}

fn validate_env_var(env: &str) -> Result<(), EngineError> {
    let Some((key, _)) = env.split_once('=') else {
        return Err(EngineError::InvalidRequest(
            "env var must be KEY=VALUE format".into(),
        ));
    };
    if key.is_empty() || !key.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(EngineError::InvalidRequest(
            "env var key contains invalid characters".into(),
        ));
    }
    let upper = key.to_ascii_uppercase();
    if ENV_BLOCKLIST.contains(&upper.as_str()) {
        return Err(EngineError::InvalidRequest(format!(
            "env var {key:?} is blocked"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn validator(roots: Vec<PathBuf>) -> RequestValidator {
        RequestValidator::new(
            Arc::new(Registry::new()),
            roots,
            LimitTier::Standard,
            Duration::from_secs(60),
            Duration::from_secs(300),
        )
    }

    fn python_req(code: &str) -> ExecutionRequest {
        ExecutionRequest::new(code, "python")
    }

    #[test]
    fn test_empty_code_rejected() {
        let mut req = python_req("");
        assert!(validator(vec![]).validate(&mut req).is_err());
    }

    #[test]
    fn test_oversized_code_rejected() {
        let mut req = python_req(&"a".repeat(MAX_CODE_BYTES + 1));
        assert!(validator(vec![]).validate(&mut req).is_err());
    }

    #[test]
    fn test_unknown_language_rejected() {
        let mut req = ExecutionRequest::new("x", "fortran");
        assert!(matches!(
            validator(vec![]).validate(&mut req),
            Err(EngineError::UnsupportedLanguage(_))
        ));
    }

    #[test]
    fn test_timeout_ceilings_per_class() {
        let v = validator(vec![]);

        let mut req = python_req("print(1)");
        req.timeout = Some(Duration::from_secs(61));
        assert!(v.validate(&mut req).is_err());
        req.timeout = Some(Duration::from_secs(60));
        v.validate(&mut req).unwrap();

        let mut agent = ExecutionRequest::new("do a thing", "agent");
        agent.timeout = Some(Duration::from_secs(120));
        v.validate(&mut agent).unwrap();
        agent.timeout = Some(Duration::from_secs(301));
        assert!(v.validate(&mut agent).is_err());
    }

    #[test]
    fn test_env_blocklist() {
        let v = validator(vec![]);
        for blocked in ["LD_PRELOAD=/lib/x.so", "ld_preload=/lib/x.so", "PATH=/x"] {
            let mut req = python_req("print(1)");
            req.env_vars = vec![blocked.to_string()];
            assert!(v.validate(&mut req).is_err(), "{blocked} must be rejected");
        }

        let mut req = python_req("print(1)");
        req.env_vars = vec!["MY_VAR=ok".to_string(), "DEBUG=1".to_string()];
        v.validate(&mut req).unwrap();
    }

    #[test]
    fn test_env_format() {
        let v = validator(vec![]);
        for bad in ["NOEQUALS", "BAD-KEY=1", "=novalue", "SP ACE=1"] {
            let mut req = python_req("print(1)");
            req.env_vars = vec![bad.to_string()];
            assert!(v.validate(&mut req).is_err(), "{bad} must be rejected");
        }
    }

    #[test]
    fn test_work_dir_rejected_for_standard_runtimes() {
        let dir = tempfile::tempdir().unwrap();
        let v = validator(vec![dir.path().to_path_buf()]);
        let mut req = python_req("print(1)");
        req.work_dir = Some(dir.path().to_path_buf());
        assert!(v.validate(&mut req).is_err());
    }

    #[test]
    fn test_work_dir_requires_allowed_roots() {
        let dir = tempfile::tempdir().unwrap();
        let v = validator(vec![]);
        let mut req = ExecutionRequest::new("task", "agent");
        req.work_dir = Some(dir.path().to_path_buf());
        assert!(v.validate(&mut req).is_err());
    }

    #[test]
    fn test_work_dir_outside_roots_rejected() {
        let root = tempfile::tempdir().unwrap();
        let elsewhere = tempfile::tempdir().unwrap();
        let v = validator(vec![root.path().canonicalize().unwrap()]);
        let mut req = ExecutionRequest::new("task", "agent");
        req.work_dir = Some(elsewhere.path().to_path_buf());
        assert!(v.validate(&mut req).is_err());
    }

    #[test]
    fn test_work_dir_under_root_accepted_and_resolved() {
        let root = tempfile::tempdir().unwrap();
        let sub = root.path().join("project");
        std::fs::create_dir(&sub).unwrap();

        let v = validator(vec![root.path().canonicalize().unwrap()]);
        let mut req = ExecutionRequest::new("task", "agent");
        req.work_dir = Some(sub.clone());
        v.validate(&mut req).unwrap();
        assert_eq!(req.work_dir.unwrap(), sub.canonicalize().unwrap());
    }

    #[test]
    fn test_sensitive_segments_rejected_even_under_allowed_root() {
        let root = tempfile::tempdir().unwrap();
        let v = validator(vec![root.path().canonicalize().unwrap()]);

        for segment in [".ssh", ".aws", ".gnupg", ".claude"] {
            let dir = root.path().join(segment);
            std::fs::create_dir(&dir).unwrap();
            let mut req = ExecutionRequest::new("task", "agent");
            req.work_dir = Some(dir);
            assert!(v.validate(&mut req).is_err(), "{segment} must be rejected");
        }
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_is_resolved_before_checks() {
        let root = tempfile::tempdir().unwrap();
        let outside = tempfile::tempdir().unwrap();
        let link = root.path().join("innocent");
        std::os::unix::fs::symlink(outside.path(), &link).unwrap();

        // The link lives under the allowed root, but it resolves outside it.
        let v = validator(vec![root.path().canonicalize().unwrap()]);
        let mut req = ExecutionRequest::new("task", "agent");
        req.work_dir = Some(link);
        assert!(v.validate(&mut req).is_err());
    }

    #[test]
    fn test_validation_is_idempotent() {
        let root = tempfile::tempdir().unwrap();
        let sub = root.path().join("w");
        std::fs::create_dir(&sub).unwrap();
        let v = validator(vec![root.path().canonicalize().unwrap()]);

        let mut req = ExecutionRequest::new("task", "agent");
        req.work_dir = Some(sub);
        req.env_vars = vec!["A=1".to_string()];
        v.validate(&mut req).unwrap();
        let first = req.clone();
        v.validate(&mut req).unwrap();
        assert_eq!(req.work_dir, first.work_dir);
        assert_eq!(req.env_vars, first.env_vars);
    }
}
