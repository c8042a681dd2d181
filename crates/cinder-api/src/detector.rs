//! Advisory escape detector
//!
//! Pattern-matches submitted code and captured output for container-escape
//! tooling. Purely advisory on top of seccomp and the capability strip:
//! only critical code detections block a request, everything else becomes
//! metrics and security events.

use regex::Regex;
use serde::Serialize;
use tracing::warn;

/// Threat level of a detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

/// One matched pattern.
#[derive(Debug, Clone, Serialize)]
pub struct Detection {
    pub pattern: String,
    pub severity: String,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<usize>,
}

struct CodePattern {
    name: &'static str,
    description: &'static str,
    regex: Regex,
    severity: Severity,
}

/// Analyzes code and output for escape attempts.
pub struct EscapeDetector {
    patterns: Vec<CodePattern>,
}

impl EscapeDetector {
    pub fn new() -> Self {
        let pattern = |name, description, re: &str, severity| CodePattern {
            name,
            description,
            regex: Regex::new(re).expect("detector pattern"),
            severity,
        };

        Self {
            patterns: vec![
                pattern(
                    "proc_self_access",
                    "Accessing /proc/self for process info",
                    r"/proc/self/(root|exe|fd|ns|maps|status)",
                    Severity::High,
                ),
                pattern(
                    "container_breakout",
                    "Attempting container breakout via cgroup",
                    r"/sys/fs/cgroup|notify_on_release|release_agent",
                    Severity::Critical,
                ),
                pattern(
                    "host_mount_access",
                    "Attempting to access host runtime sockets",
                    r"/var/run/docker|/var/run/containerd",
                    Severity::Critical,
                ),
                pattern(
                    "kernel_exploit",
                    "Potential kernel exploitation attempt",
                    r"(?i)(dirty.?cow|dirty.?pipe|over(lay|l)fs|userfaultfd)",
                    Severity::Critical,
                ),
                pattern(
                    "metadata_service",
                    "Attempting to reach cloud metadata service",
                    r"169\.254\.169\.254|metadata\.google|metadata\.aws",
                    Severity::High,
                ),
                pattern(
                    "reverse_shell",
                    "Potential reverse shell command",
                    r"(?i)(nc|ncat|netcat|socat)\s+.*-[elp]|/dev/tcp/|bash\s+-i\s+>&",
                    Severity::Critical,
                ),
                pattern(
                    "capability_abuse",
                    "Attempting to manipulate capabilities",
                    r"(?i)(cap_sys_admin|cap_net_raw|setcap|getcap|capsh)",
                    Severity::High,
                ),
                pattern(
                    "ptrace_attempt",
                    "Attempting to use ptrace for debugging/injection",
                    r"(?i)(ptrace|process_vm_readv|process_vm_writev|PTRACE_ATTACH)",
                    Severity::Critical,
                ),
                pattern(
                    "symlink_race",
                    "Potential symlink race attack",
                    r"ln\s+-sf?\s+/proc|ln\s+-sf?\s+/sys|ln\s+-sf?\s+/dev",
                    Severity::High,
                ),
                pattern(
                    "crypto_miner",
                    "Potential cryptocurrency mining",
                    r"(?i)(stratum\+tcp|xmrig|minerd|cryptonight|hashrate)",
                    Severity::Medium,
                ),
            ],
        }
    }

    /// Check submitted code line by line, before execution.
    pub fn analyze_code(&self, code: &str) -> Vec<Detection> {
        let mut detections = Vec::new();

        for (i, line) in code.lines().enumerate() {
            for p in &self.patterns {
                if p.regex.is_match(line) {
                    detections.push(Detection {
                        pattern: p.name.to_string(),
                        severity: p.severity.as_str().to_string(),
                        detail: p.description.to_string(),
                        line: Some(i + 1),
                    });
                    warn!(
                        pattern = p.name,
                        severity = p.severity.as_str(),
                        line = i + 1,
                        "escape attempt detected in code"
                    );
                }
            }
        }

        detections
    }

    /// Check execution output for signs of a successful escape.
    pub fn analyze_output(&self, output: &str) -> Vec<Detection> {
        const OUTPUT_PATTERNS: &[(&str, &str, Severity)] = &[
            ("host_info_leak", "host:", Severity::Medium),
            ("kernel_leak", "Linux version", Severity::High),
            ("root_access", "root:x:0:0", Severity::Critical),
            ("docker_socket", "docker.sock", Severity::Critical),
            ("containerd_socket", "containerd.sock", Severity::Critical),
        ];

        OUTPUT_PATTERNS
            .iter()
            .filter(|(_, needle, _)| output.contains(needle))
            .map(|(name, _, severity)| Detection {
                pattern: name.to_string(),
                severity: severity.as_str().to_string(),
                detail: format!("suspicious content in output: {name}"),
                line: None,
            })
            .collect()
    }

    /// True when any detection is critical (hard-block threshold).
    pub fn has_critical(detections: &[Detection]) -> bool {
        detections.iter().any(|d| d.severity == "critical")
    }
}

impl Default for EscapeDetector {
    fn default() -> Self {
        Self::new()
    }
}
