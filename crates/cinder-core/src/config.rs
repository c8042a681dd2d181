//! Configuration structures for cinder
//!
//! Loaded from a YAML file; every field has a default so the server can run
//! without any configuration at all. `Config::validate` must pass before the
//! value is handed to the engine.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::ConfigError;

/// Top-level configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub sandbox: SandboxConfig,

    #[serde(default)]
    pub security: SecurityConfig,

    #[serde(default)]
    pub proxy: ProxyConfig,

    #[serde(default)]
    pub metrics: MetricsConfig,

    #[serde(default)]
    pub audit: AuditConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

/// HTTP listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default = "default_read_timeout")]
    pub read_timeout_secs: u64,

    /// Must exceed the largest sandbox timeout plus overhead
    #[serde(default = "default_write_timeout")]
    pub write_timeout_secs: u64,

    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,

    /// Request body cap in bytes
    #[serde(default = "default_max_request_body")]
    pub max_request_body: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            read_timeout_secs: default_read_timeout(),
            write_timeout_secs: default_write_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
            max_request_body: default_max_request_body(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_read_timeout() -> u64 {
    30
}

fn default_write_timeout() -> u64 {
    65
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_max_request_body() -> usize {
    1 << 20
}

/// Sandbox engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxConfig {
    /// Backend preference: "auto", "containerd", or "docker"
    #[serde(default = "default_backend")]
    pub backend: String,

    #[serde(default = "default_containerd_socket")]
    pub containerd_socket: String,

    #[serde(default = "default_containerd_namespace")]
    pub containerd_namespace: String,

    #[serde(default = "default_default_timeout")]
    pub default_timeout_secs: u64,

    #[serde(default = "default_max_timeout")]
    pub max_timeout_secs: u64,

    /// Timeout ceiling (and default) for the agent runtime
    #[serde(default = "default_agent_max_timeout")]
    pub agent_max_timeout_secs: u64,

    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Hard cap on in-flight agent-class executions
    #[serde(default = "default_max_concurrent_agents")]
    pub max_concurrent_agents: i64,

    #[serde(default)]
    pub default_limits: DefaultLimits,

    /// Absolute paths a work_dir mount must live under; empty disables all
    /// workspace mounts
    #[serde(default)]
    pub allowed_workdir_roots: Vec<String>,

    /// Raises the resource-limit ceilings for development machines
    #[serde(default)]
    pub dev_tier: bool,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            containerd_socket: default_containerd_socket(),
            containerd_namespace: default_containerd_namespace(),
            default_timeout_secs: default_default_timeout(),
            max_timeout_secs: default_max_timeout(),
            agent_max_timeout_secs: default_agent_max_timeout(),
            max_concurrent: default_max_concurrent(),
            max_concurrent_agents: default_max_concurrent_agents(),
            default_limits: DefaultLimits::default(),
            allowed_workdir_roots: Vec::new(),
            dev_tier: false,
        }
    }
}

fn default_backend() -> String {
    "auto".to_string()
}

fn default_containerd_socket() -> String {
    "/run/containerd/containerd.sock".to_string()
}

fn default_containerd_namespace() -> String {
    "sandbox".to_string()
}

fn default_default_timeout() -> u64 {
    10
}

fn default_max_timeout() -> u64 {
    60
}

fn default_agent_max_timeout() -> u64 {
    300
}

fn default_max_concurrent() -> usize {
    1000
}

fn default_max_concurrent_agents() -> i64 {
    4
}

/// Default resource limits applied when a request does not override them
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultLimits {
    #[serde(default = "default_cpu_shares")]
    pub cpu_shares: i64,

    #[serde(default = "default_memory_mb")]
    pub memory_mb: i64,

    #[serde(default = "default_pids_limit")]
    pub pids_limit: i64,

    #[serde(default = "default_disk_mb")]
    pub disk_mb: i64,
}

impl Default for DefaultLimits {
    fn default() -> Self {
        Self {
            cpu_shares: default_cpu_shares(),
            memory_mb: default_memory_mb(),
            pids_limit: default_pids_limit(),
            disk_mb: default_disk_mb(),
        }
    }
}

fn default_cpu_shares() -> i64 {
    512
}

fn default_memory_mb() -> i64 {
    256
}

fn default_pids_limit() -> i64 {
    50
}

fn default_disk_mb() -> i64 {
    100
}

/// API authentication and rate limiting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    /// API keys accepted by the auth middleware
    #[serde(default)]
    pub allowed_keys: Vec<String>,

    /// Serve without authentication when no keys are configured
    #[serde(default)]
    pub allow_unauthenticated: bool,

    #[serde(default = "default_rate_limit_rps")]
    pub rate_limit_rps: f64,

    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self {
            allowed_keys: Vec::new(),
            allow_unauthenticated: false,
            rate_limit_rps: default_rate_limit_rps(),
            rate_limit_burst: default_rate_limit_burst(),
        }
    }
}

fn default_rate_limit_rps() -> f64 {
    100.0
}

fn default_rate_limit_burst() -> u32 {
    200
}

/// Auth-injection proxy for the agent runtime
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ProxyConfig {
    #[serde(default)]
    pub enabled: bool,

    /// Loopback port the proxy listens on
    #[serde(default)]
    pub port: u16,

    /// Upstream API host the proxy forwards to over HTTPS
    #[serde(default)]
    pub upstream_host: String,

    /// Global requests-per-minute cap (0 = unlimited)
    #[serde(default)]
    pub max_rpm: u32,
}

/// Metrics exposition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_metrics_enabled")]
    pub enabled: bool,

    #[serde(default = "default_metrics_path")]
    pub path: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: default_metrics_enabled(),
            path: default_metrics_path(),
        }
    }
}

fn default_metrics_enabled() -> bool {
    true
}

fn default_metrics_path() -> String {
    "/metrics".to_string()
}

/// Audit sink buffering
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "default_audit_enabled")]
    pub enabled: bool,

    #[serde(default = "default_audit_buffer")]
    pub buffer_size: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            enabled: default_audit_enabled(),
            buffer_size: default_audit_buffer(),
        }
    }
}

fn default_audit_enabled() -> bool {
    true
}

fn default_audit_buffer() -> usize {
    10_000
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (json, pretty)
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "json".to_string()
}

impl Config {
    /// Read configuration from a YAML file and validate it.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path).map_err(|e| ConfigError::LoadFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        let cfg: Config = serde_yaml::from_str(&data).map_err(|e| ConfigError::LoadFailed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        cfg.validate()?;
        Ok(cfg)
    }

    /// Check internal consistency. Called by [`Config::load`]; call it
    /// directly when constructing a config in code.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.port == 0 {
            return Err(ConfigError::Invalid {
                key: "server.port".into(),
                reason: "must be non-zero".into(),
            });
        }
        if self.sandbox.default_timeout_secs > self.sandbox.max_timeout_secs {
            return Err(ConfigError::Invalid {
                key: "sandbox.default_timeout_secs".into(),
                reason: format!(
                    "default ({}) must be <= max ({})",
                    self.sandbox.default_timeout_secs, self.sandbox.max_timeout_secs
                ),
            });
        }
        if self.sandbox.max_concurrent < 1 {
            return Err(ConfigError::Invalid {
                key: "sandbox.max_concurrent".into(),
                reason: "must be >= 1".into(),
            });
        }
        if self.sandbox.default_limits.memory_mb < 16 {
            return Err(ConfigError::Invalid {
                key: "sandbox.default_limits.memory_mb".into(),
                reason: "must be >= 16".into(),
            });
        }
        for root in &self.sandbox.allowed_workdir_roots {
            if !Path::new(root).is_absolute() {
                return Err(ConfigError::Invalid {
                    key: "sandbox.allowed_workdir_roots".into(),
                    reason: format!("{root:?} must be an absolute path"),
                });
            }
        }
        if self.proxy.enabled {
            if self.proxy.port == 0 {
                return Err(ConfigError::Invalid {
                    key: "proxy.port".into(),
                    reason: "required when the proxy is enabled".into(),
                });
            }
            if self.proxy.upstream_host.is_empty() {
                return Err(ConfigError::Invalid {
                    key: "proxy.upstream_host".into(),
                    reason: "required when the proxy is enabled".into(),
                });
            }
        }
        Ok(())
    }

    /// Listen address string for the API server.
    pub fn address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let cfg = Config::default();
        cfg.validate().unwrap();
        assert_eq!(cfg.server.port, 8080);
        assert_eq!(cfg.sandbox.max_concurrent, 1000);
        assert_eq!(cfg.sandbox.default_limits.memory_mb, 256);
        assert_eq!(cfg.address(), "0.0.0.0:8080");
    }

    #[test]
    fn test_default_timeout_must_not_exceed_max() {
        let mut cfg = Config::default();
        cfg.sandbox.default_timeout_secs = 120;
        cfg.sandbox.max_timeout_secs = 60;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_workdir_roots_must_be_absolute() {
        let mut cfg = Config::default();
        cfg.sandbox.allowed_workdir_roots = vec!["relative/path".to_string()];
        assert!(cfg.validate().is_err());

        cfg.sandbox.allowed_workdir_roots = vec!["/srv/workspaces".to_string()];
        cfg.validate().unwrap();
    }

    #[test]
    fn test_proxy_requires_port_and_upstream() {
        let mut cfg = Config::default();
        cfg.proxy.enabled = true;
        assert!(cfg.validate().is_err());

        cfg.proxy.port = 18080;
        assert!(cfg.validate().is_err());

        cfg.proxy.upstream_host = "api.example.com".to_string();
        cfg.validate().unwrap();
    }

    #[test]
    fn test_load_yaml() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            f,
            r#"
server:
  port: 9090
sandbox:
  backend: docker
  max_concurrent: 50
  allowed_workdir_roots: ["/srv/work"]
security:
  rate_limit_rps: 10
"#
        )
        .unwrap();

        let cfg = Config::load(f.path()).unwrap();
        assert_eq!(cfg.server.port, 9090);
        assert_eq!(cfg.sandbox.backend, "docker");
        assert_eq!(cfg.sandbox.max_concurrent, 50);
        assert_eq!(cfg.sandbox.allowed_workdir_roots, vec!["/srv/work"]);
        assert_eq!(cfg.security.rate_limit_rps, 10.0);
        // Untouched sections keep their defaults.
        assert_eq!(cfg.sandbox.default_timeout_secs, 10);
        assert!(cfg.metrics.enabled);
    }

    #[test]
    fn test_load_rejects_bad_yaml() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "server: [not, a, map]").unwrap();
        assert!(Config::load(f.path()).is_err());
    }
}
