//! Resource limits
//!
//! A value object for the four caps every sandbox gets: CPU quota, memory,
//! process count, and tmpfs size. Validation runs against one of two tiers;
//! the dev tier raises the ceilings for local machines running heavyweight
//! agent workloads.

use oci_spec::runtime::{
    LinuxCpuBuilder, LinuxMemoryBuilder, LinuxPidsBuilder, LinuxResources,
    LinuxResourcesBuilder, Mount, MountBuilder, PosixRlimit, PosixRlimitBuilder, PosixRlimitType,
};

use cinder_core::EngineError;

/// CFS scheduling period (100 ms, in microseconds)
const CPU_PERIOD_USEC: u64 = 100_000;
/// Floor for the CFS quota (1 ms)
const CPU_QUOTA_MIN_USEC: i64 = 1_000;

const RLIMIT_NOFILE: u64 = 256;
const RLIMIT_STACK_BYTES: u64 = 8 * 1024 * 1024;

/// Validation ceilings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LimitTier {
    #[default]
    Standard,
    /// Raised ceilings for development machines
    Dev,
}

impl LimitTier {
    fn ceilings(&self) -> (i64, i64, i64, i64) {
        match self {
            LimitTier::Standard => (4096, 2048, 500, 1024),
            LimitTier::Dev => (8192, 16384, 2000, 10240),
        }
    }
}

/// Resource caps for one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    /// 1024 = one CPU core
    pub cpu_shares: i64,
    /// Hard memory limit; swap is pinned to the same value
    pub memory_mb: i64,
    /// Fork-bomb protection
    pub pids_limit: i64,
    /// tmpfs size for /tmp
    pub disk_mb: i64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_shares: 512,
            memory_mb: 256,
            pids_limit: 50,
            disk_mb: 100,
        }
    }
}

impl ResourceLimits {
    /// Defaults for the agent runtime, which runs a full interpreter stack.
    pub fn agent_defaults() -> Self {
        Self {
            cpu_shares: 2048,
            memory_mb: 1024,
            pids_limit: 200,
            disk_mb: 500,
        }
    }

    /// Check all four fields against the tier's ranges. Fields are always
    /// validated together; a request either passes whole or not at all.
    pub fn validate(&self, tier: LimitTier) -> Result<(), EngineError> {
        let (max_cpu, max_mem, max_pids, max_disk) = tier.ceilings();

        if self.cpu_shares < 2 || self.cpu_shares > max_cpu {
            return Err(EngineError::InvalidRequest(format!(
                "cpu_shares must be 2-{max_cpu}, got {}",
                self.cpu_shares
            )));
        }
        if self.memory_mb < 16 || self.memory_mb > max_mem {
            return Err(EngineError::InvalidRequest(format!(
                "memory_mb must be 16-{max_mem}, got {}",
                self.memory_mb
            )));
        }
        if self.pids_limit < 5 || self.pids_limit > max_pids {
            return Err(EngineError::InvalidRequest(format!(
                "pids_limit must be 5-{max_pids}, got {}",
                self.pids_limit
            )));
        }
        if self.disk_mb < 1 || self.disk_mb > max_disk {
            return Err(EngineError::InvalidRequest(format!(
                "disk_mb must be 1-{max_disk}, got {}",
                self.disk_mb
            )));
        }
        Ok(())
    }

    /// CFS quota in microseconds derived from the share count.
    pub fn cpu_quota_usec(&self) -> i64 {
        let quota = (self.cpu_shares as f64 / 1024.0 * CPU_PERIOD_USEC as f64) as i64;
        quota.max(CPU_QUOTA_MIN_USEC)
    }

    pub fn memory_bytes(&self) -> i64 {
        self.memory_mb * 1024 * 1024
    }

    pub fn tmpfs_bytes(&self) -> i64 {
        self.disk_mb * 1024 * 1024
    }

    /// cgroup resources in OCI form. A hard CFS quota caps CPU (shares are
    /// soft, best-effort); memory limit equals swap, which disables swap.
    pub fn oci_resources(&self) -> Result<LinuxResources, EngineError> {
        let cpu = LinuxCpuBuilder::default()
            .period(CPU_PERIOD_USEC)
            .quota(self.cpu_quota_usec())
            .build()
            .map_err(|e| EngineError::Internal(format!("cpu limits: {e}")))?;

        let memory = LinuxMemoryBuilder::default()
            .limit(self.memory_bytes())
            .swap(self.memory_bytes())
            .build()
            .map_err(|e| EngineError::Internal(format!("memory limits: {e}")))?;

        let pids = LinuxPidsBuilder::default()
            .limit(self.pids_limit)
            .build()
            .map_err(|e| EngineError::Internal(format!("pids limit: {e}")))?;

        LinuxResourcesBuilder::default()
            .cpu(cpu)
            .memory(memory)
            .pids(pids)
            .build()
            .map_err(|e| EngineError::Internal(format!("resources: {e}")))
    }

    /// Bounded, world-writable /tmp.
    pub fn tmpfs_mount(&self) -> Result<Mount, EngineError> {
        MountBuilder::default()
            .destination("/tmp")
            .typ("tmpfs")
            .source("tmpfs")
            .options(vec![
                "nosuid".to_string(),
                "nodev".to_string(),
                format!("size={}", self.tmpfs_bytes()),
                "mode=1777".to_string(),
            ])
            .build()
            .map_err(|e| EngineError::Internal(format!("tmpfs mount: {e}")))
    }

    /// Process rlimits matching the cgroup caps.
    pub fn rlimits(&self) -> Result<Vec<PosixRlimit>, EngineError> {
        let entries = [
            (PosixRlimitType::RlimitNofile, RLIMIT_NOFILE),
            (PosixRlimitType::RlimitNproc, self.pids_limit.max(0) as u64),
            (PosixRlimitType::RlimitFsize, self.tmpfs_bytes().max(0) as u64),
            (PosixRlimitType::RlimitCore, 0),
            (PosixRlimitType::RlimitStack, RLIMIT_STACK_BYTES),
        ];
        entries
            .into_iter()
            .map(|(typ, v)| {
                PosixRlimitBuilder::default()
                    .typ(typ)
                    .hard(v)
                    .soft(v)
                    .build()
                    .map_err(|e| EngineError::Internal(format!("rlimit: {e}")))
            })
            .collect()
    }
}

/// Append a mount unless one already targets the same destination.
pub fn append_mount_if_absent(mounts: &mut Vec<Mount>, mount: Mount) {
    if mounts.iter().any(|m| m.destination() == mount.destination()) {
        return;
    }
    mounts.push(mount);
}
