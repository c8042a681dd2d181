//! Deny-by-default syscall profiles
//!
//! A fluent [`ProfileBuilder`] assembles the allowlist once; the resulting
//! [`SyscallProfile`] renders into the two forms the backends consume: the
//! OCI runtime-spec structure for containerd, and the docker CLI's JSON
//! schema for `--security-opt seccomp=<path>`. Both renderings must stay
//! semantically identical for the same profile.

use oci_spec::runtime::{
    Arch, LinuxSeccomp, LinuxSeccompAction, LinuxSeccompArgBuilder, LinuxSeccompBuilder,
    LinuxSeccompOperator, LinuxSyscallBuilder,
};
use serde::Serialize;

use cinder_core::EngineError;

/// prctl(PR_SET_NAME)
const PR_SET_NAME: u64 = 15;
/// prctl(PR_GET_NAME)
const PR_GET_NAME: u64 = 16;

/// Filter decision for a rule or the profile default.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyscallAction {
    Allow,
    /// Fail with EPERM instead of killing the process
    Errno,
    /// Deliver SIGSYS; surfaces as a security event
    Trap,
    Log,
}

impl SyscallAction {
    fn scmp_name(&self) -> &'static str {
        match self {
            SyscallAction::Allow => "SCMP_ACT_ALLOW",
            SyscallAction::Errno => "SCMP_ACT_ERRNO",
            SyscallAction::Trap => "SCMP_ACT_TRAP",
            SyscallAction::Log => "SCMP_ACT_LOG",
        }
    }

    fn oci(&self) -> LinuxSeccompAction {
        match self {
            SyscallAction::Allow => LinuxSeccompAction::ScmpActAllow,
            SyscallAction::Errno => LinuxSeccompAction::ScmpActErrno,
            SyscallAction::Trap => LinuxSeccompAction::ScmpActTrap,
            SyscallAction::Log => LinuxSeccompAction::ScmpActLog,
        }
    }
}

/// Per-argument constraint on a syscall rule.
#[derive(Debug, Clone, Copy)]
pub struct SyscallArg {
    pub index: usize,
    pub value: u64,
}

/// One ordered rule in a profile.
#[derive(Debug, Clone)]
pub struct SyscallRule {
    pub names: Vec<&'static str>,
    pub action: SyscallAction,
    /// Equality constraints; empty means the rule matches unconditionally
    pub args: Vec<SyscallArg>,
}

/// A complete syscall-filter decision table.
#[derive(Debug, Clone)]
pub struct SyscallProfile {
    pub default_action: SyscallAction,
    pub rules: Vec<SyscallRule>,
}

/// Fluent composition of a [`SyscallProfile`].
pub struct ProfileBuilder {
    profile: SyscallProfile,
}

impl ProfileBuilder {
    pub fn new() -> Self {
        Self {
            profile: SyscallProfile {
                default_action: SyscallAction::Errno,
                rules: Vec::new(),
            },
        }
    }

    pub fn allow(mut self, names: &[&'static str]) -> Self {
        self.profile.rules.push(SyscallRule {
            names: names.to_vec(),
            action: SyscallAction::Allow,
            args: Vec::new(),
        });
        self
    }

    pub fn block(mut self, names: &[&'static str]) -> Self {
        self.profile.rules.push(SyscallRule {
            names: names.to_vec(),
            action: SyscallAction::Errno,
            args: Vec::new(),
        });
        self
    }

    pub fn trap(mut self, names: &[&'static str]) -> Self {
        self.profile.rules.push(SyscallRule {
            names: names.to_vec(),
            action: SyscallAction::Trap,
            args: Vec::new(),
        });
        self
    }

    /// Allow `name` only when every listed argument equals its value.
    pub fn allow_with_args(mut self, name: &'static str, args: &[SyscallArg]) -> Self {
        self.profile.rules.push(SyscallRule {
            names: vec![name],
            action: SyscallAction::Allow,
            args: args.to_vec(),
        });
        self
    }

    pub fn build(self) -> SyscallProfile {
        self.profile
    }
}

impl Default for ProfileBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn base_syscalls(b: ProfileBuilder) -> ProfileBuilder {
    b.allow(&[
        "read", "write", "readv", "writev", "pread64", "pwrite64",
        "open", "openat", "close", "lseek",
        "stat", "fstat", "lstat", "newfstatat",
        "access", "faccessat", "faccessat2",
        "dup", "dup2", "dup3",
        "fcntl",
        "poll", "ppoll", "select", "pselect6",
        "pipe", "pipe2",
        "readlink", "readlinkat",
        "getdents64",
    ])
    .allow(&["brk", "mmap", "munmap", "mprotect", "mremap", "madvise"])
    .allow(&[
        "execve", "execveat",
        "exit", "exit_group",
        "wait4", "waitid",
        "clone", "clone3",
        "vfork",
        "set_tid_address",
        "set_robust_list", "get_robust_list",
    ])
    .allow(&[
        "futex",
        "gettid",
        "tgkill",
        "rt_sigaction", "rt_sigprocmask", "rt_sigreturn",
        "sigaltstack",
    ])
    .allow(&[
        "clock_gettime", "clock_getres",
        "gettimeofday",
        "nanosleep", "clock_nanosleep",
    ])
    .allow(&[
        "getpid", "getppid",
        "getuid", "geteuid",
        "getgid", "getegid",
        "uname",
        "getcwd",
    ])
    .allow(&["epoll_create1", "epoll_ctl", "epoll_wait", "epoll_pwait", "eventfd2"])
    .allow(&[
        "getrandom",
        "arch_prctl",
        "ioctl",
        "sysinfo",
        "getrlimit", "prlimit64",
        "umask",
        "chmod", "fchmod", "fchmodat",
        "chdir", "fchdir",
        "rename", "renameat", "renameat2",
        "unlink", "unlinkat",
        "mkdir", "mkdirat",
        "rmdir",
        "symlink", "symlinkat",
        "link", "linkat",
        "ftruncate",
        "fallocate",
        "fsync", "fdatasync",
        "flock",
        "statfs", "fstatfs",
        "statx",
        "copy_file_range",
    ])
    // prctl restricted to thread-name operations only
    .allow_with_args("prctl", &[SyscallArg { index: 0, value: PR_SET_NAME }])
    .allow_with_args("prctl", &[SyscallArg { index: 0, value: PR_GET_NAME }])
}

fn dangerous_syscalls(b: ProfileBuilder) -> ProfileBuilder {
    b.trap(&[
        "ptrace",
        "process_vm_readv", "process_vm_writev",
        "keyctl",
        "add_key", "request_key",
        "bpf",
        "perf_event_open",
        "userfaultfd",
        // fileless execution: anonymous in-memory files executable via /proc/self/fd
        "memfd_create",
        "kexec_load", "kexec_file_load",
        "finit_module", "init_module", "delete_module",
    ])
    .block(&[
        "mount", "umount2", "pivot_root",
        "reboot",
        "swapon", "swapoff",
        "sethostname", "setdomainname",
        "setns", "unshare",
        "acct",
        "settimeofday", "adjtimex", "clock_adjtime",
        "nfsservctl",
        "personality",
        "lookup_dcookie",
        "ioperm", "iopl",
    ])
}

const NETWORK_SYSCALLS: &[&str] = &[
    "socket", "connect", "bind", "listen", "accept", "accept4",
    "sendto", "recvfrom", "sendmsg", "recvmsg",
    "getsockopt", "setsockopt",
    "getsockname", "getpeername",
    "shutdown",
];

/// The deny-by-default allowlist for standard runtimes.
pub fn default_profile() -> SyscallProfile {
    let b = ProfileBuilder::new();
    let b = base_syscalls(b);
    dangerous_syscalls(b).build()
}

/// Same as [`default_profile`] plus the socket-family syscalls.
pub fn network_profile() -> SyscallProfile {
    let b = ProfileBuilder::new();
    let b = base_syscalls(b);
    let b = b.allow(NETWORK_SYSCALLS);
    dangerous_syscalls(b).build()
}

// Docker daemon seccomp JSON schema.
#[derive(Debug, Serialize)]
struct CliProfile {
    #[serde(rename = "defaultAction")]
    default_action: &'static str,
    architectures: Vec<&'static str>,
    syscalls: Vec<CliRule>,
}

#[derive(Debug, Serialize)]
struct CliRule {
    names: Vec<&'static str>,
    action: &'static str,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    args: Vec<CliArg>,
}

#[derive(Debug, Serialize)]
struct CliArg {
    index: usize,
    value: u64,
    op: &'static str,
}

impl SyscallProfile {
    /// Render as the OCI runtime-spec seccomp structure (containerd backend).
    pub fn to_oci(&self) -> Result<LinuxSeccomp, EngineError> {
        let mut syscalls = Vec::with_capacity(self.rules.len());
        for rule in &self.rules {
            let mut builder = LinuxSyscallBuilder::default()
                .names(rule.names.iter().map(|n| n.to_string()).collect::<Vec<_>>())
                .action(rule.action.oci());
            if !rule.args.is_empty() {
                let mut args = Vec::with_capacity(rule.args.len());
                for a in &rule.args {
                    args.push(
                        LinuxSeccompArgBuilder::default()
                            .index(a.index)
                            .value(a.value)
                            .op(LinuxSeccompOperator::ScmpCmpEq)
                            .build()
                            .map_err(|e| EngineError::Internal(format!("seccomp arg: {e}")))?,
                    );
                }
                builder = builder.args(args);
            }
            syscalls.push(
                builder
                    .build()
                    .map_err(|e| EngineError::Internal(format!("seccomp rule: {e}")))?,
            );
        }

        LinuxSeccompBuilder::default()
            .default_action(self.default_action.oci())
            .architectures(vec![Arch::ScmpArchX86_64, Arch::ScmpArchAarch64])
            .syscalls(syscalls)
            .build()
            .map_err(|e| EngineError::Internal(format!("seccomp profile: {e}")))
    }

    /// Render as docker-CLI JSON suitable for `--security-opt seccomp=<path>`.
    pub fn to_cli_json(&self) -> Result<String, EngineError> {
        let profile = CliProfile {
            default_action: self.default_action.scmp_name(),
            architectures: vec!["SCMP_ARCH_X86_64", "SCMP_ARCH_AARCH64"],
            syscalls: self
                .rules
                .iter()
                .map(|rule| CliRule {
                    names: rule.names.clone(),
                    action: rule.action.scmp_name(),
                    args: rule
                        .args
                        .iter()
                        .map(|a| CliArg {
                            index: a.index,
                            value: a.value,
                            op: "SCMP_CMP_EQ",
                        })
                        .collect(),
                })
                .collect(),
        };
        serde_json::to_string(&profile)
            .map_err(|e| EngineError::Internal(format!("seccomp json: {e}")))
    }

    /// All names the profile allows unconditionally (test helper for the
    /// JSON/OCI equivalence invariant).
    pub fn allowed_names(&self) -> Vec<&'static str> {
        let mut names: Vec<&'static str> = self
            .rules
            .iter()
            .filter(|r| r.action == SyscallAction::Allow && r.args.is_empty())
            .flat_map(|r| r.names.iter().copied())
            .collect();
        names.sort_unstable();
        names
    }
}
