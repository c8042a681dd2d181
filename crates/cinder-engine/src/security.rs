//! Container security profiles
//!
//! Bundles the syscall filter with capability stripping, the namespace set,
//! procfs masking, the sandbox user, and the read-only-root flag. The
//! containerd backend turns the bundle into OCI spec components; the CLI
//! backend expresses the same restrictions as docker flags.

use oci_spec::runtime::{
    Capabilities, LinuxCapabilities, LinuxCapabilitiesBuilder, LinuxNamespace,
    LinuxNamespaceBuilder, LinuxNamespaceType, ProcessBuilder, User, UserBuilder,
};

use crate::seccomp::{self, SyscallProfile};
use cinder_core::EngineError;

/// uid/gid for standard runtimes (nobody)
pub const SANDBOX_UID: u32 = 65534;
/// uid/gid for the agent runtime (needs a writable home)
pub const AGENT_UID: u32 = 1000;

const MASKED_PATHS: &[&str] = &[
    "/proc/acpi",
    "/proc/kcore",
    "/proc/keys",
    "/proc/latency_stats",
    "/proc/timer_list",
    "/proc/timer_stats",
    "/proc/sched_debug",
    "/proc/scsi",
    "/sys/firmware",
    "/sys/devices/virtual/powercap",
];

const READONLY_PATHS: &[&str] = &[
    "/proc/asound",
    "/proc/bus",
    "/proc/fs",
    "/proc/irq",
    "/proc/sys",
    "/proc/sysrq-trigger",
];

/// Everything a container is denied or confined to, minus resource caps.
#[derive(Debug, Clone)]
pub struct SecurityProfile {
    pub seccomp: SyscallProfile,
    pub namespaces: Vec<LinuxNamespaceType>,
    pub masked_paths: Vec<String>,
    pub readonly_paths: Vec<String>,
    pub uid: u32,
    pub gid: u32,
    pub readonly_root: bool,
}

impl SecurityProfile {
    /// Profile for standard runtimes: no network, read-only root, nobody.
    pub fn standard() -> Self {
        Self {
            seccomp: seccomp::default_profile(),
            namespaces: vec![
                LinuxNamespaceType::Pid,
                LinuxNamespaceType::Network,
                LinuxNamespaceType::Mount,
                LinuxNamespaceType::Uts,
                LinuxNamespaceType::Ipc,
                LinuxNamespaceType::User,
                LinuxNamespaceType::Cgroup,
            ],
            masked_paths: MASKED_PATHS.iter().map(|s| s.to_string()).collect(),
            readonly_paths: READONLY_PATHS.iter().map(|s| s.to_string()).collect(),
            uid: SANDBOX_UID,
            gid: SANDBOX_UID,
            readonly_root: true,
        }
    }

    /// Standard profile with the socket syscalls allowed. The namespace
    /// set is untouched: the container still gets its own network
    /// namespace, and connectivity comes from the runtime attaching it to
    /// the bridge. Leaving the type out of the list would join the host's
    /// namespace instead.
    pub fn network_allowed() -> Self {
        let mut profile = Self::standard();
        profile.seccomp = seccomp::network_profile();
        profile
    }

    /// Agent runtime: network on, writable root (its interpreter writes to
    /// home-directory caches at startup), uid 1000. Everything else as
    /// [`SecurityProfile::standard`].
    pub fn agent() -> Self {
        let mut profile = Self::network_allowed();
        profile.uid = AGENT_UID;
        profile.gid = AGENT_UID;
        profile.readonly_root = false;
        profile
    }

    /// Namespace list in OCI form.
    pub fn oci_namespaces(&self) -> Result<Vec<LinuxNamespace>, EngineError> {
        self.namespaces
            .iter()
            .map(|ns| {
                LinuxNamespaceBuilder::default()
                    .typ(*ns)
                    .build()
                    .map_err(|e| EngineError::Internal(format!("namespace: {e}")))
            })
            .collect()
    }

    /// All five capability sets, empty.
    pub fn oci_capabilities(&self) -> Result<LinuxCapabilities, EngineError> {
        let empty = Capabilities::new();
        LinuxCapabilitiesBuilder::default()
            .bounding(empty.clone())
            .effective(empty.clone())
            .inheritable(empty.clone())
            .permitted(empty.clone())
            .ambient(empty)
            .build()
            .map_err(|e| EngineError::Internal(format!("capabilities: {e}")))
    }

    /// The unprivileged process user.
    pub fn oci_user(&self) -> Result<User, EngineError> {
        UserBuilder::default()
            .uid(self.uid)
            .gid(self.gid)
            .build()
            .map_err(|e| EngineError::Internal(format!("user: {e}")))
    }

    /// Seed a process builder with the profile's identity and privilege
    /// restrictions; the caller adds argv, env, cwd, and rlimits.
    pub fn process_builder(&self) -> Result<ProcessBuilder, EngineError> {
        Ok(ProcessBuilder::default()
            .terminal(false)
            .user(self.oci_user()?)
            .capabilities(self.oci_capabilities()?)
            .no_new_privileges(true))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_profile() {
        let p = SecurityProfile::standard();
        assert_eq!(p.uid, 65534);
        assert!(p.readonly_root);
        assert!(p.namespaces.contains(&LinuxNamespaceType::Network));
        assert_eq!(p.namespaces.len(), 7);
    }

    #[test]
    fn test_network_profile_changes_seccomp_only() {
        let p = SecurityProfile::network_allowed();
        // The namespace set must match the standard profile; dropping the
        // network type would mean joining the host's namespace.
        assert!(p.namespaces.contains(&LinuxNamespaceType::Network));
        assert_eq!(p.namespaces.len(), 7);
        assert!(p.readonly_root);
        assert_eq!(p.uid, 65534);
    }

    #[test]
    fn test_agent_profile() {
        let p = SecurityProfile::agent();
        assert_eq!(p.uid, 1000);
        assert!(!p.readonly_root);
        assert!(p.namespaces.contains(&LinuxNamespaceType::Network));
        // All other restrictions stay.
        assert_eq!(p.masked_paths.len(), MASKED_PATHS.len());
        assert_eq!(p.readonly_paths.len(), READONLY_PATHS.len());
    }

    #[test]
    fn test_capability_sets_are_empty() {
        let caps = SecurityProfile::standard().oci_capabilities().unwrap();
        assert!(caps.bounding().as_ref().unwrap().is_empty());
        assert!(caps.effective().as_ref().unwrap().is_empty());
        assert!(caps.inheritable().as_ref().unwrap().is_empty());
        assert!(caps.permitted().as_ref().unwrap().is_empty());
        assert!(caps.ambient().as_ref().unwrap().is_empty());
    }

    #[test]
    fn test_no_profile_runs_as_root() {
        for p in [
            SecurityProfile::standard(),
            SecurityProfile::network_allowed(),
            SecurityProfile::agent(),
        ] {
            assert_ne!(p.uid, 0);
            assert_ne!(p.gid, 0);
        }
    }
}
