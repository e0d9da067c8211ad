//! Cgroup v2 resource control.
//!
//! One leaf directory per VM under the unified hierarchy (default
//! `/sys/fs/cgroup/vm_<name>`). All limit writes are best-effort against
//! individual sysfs files; the kernel is the source of truth and no
//! partial-commit rollback is attempted.

use crate::error::{Result, VirtscaleError};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Default root of the unified cgroup v2 hierarchy.
pub const DEFAULT_CGROUP_ROOT: &str = "/sys/fs/cgroup";

/// Default cpu.weight applied alongside cpu.max.
pub const DEFAULT_CPU_WEIGHT: u64 = 100;

/// Swappiness applied alongside memory limits.
pub const DEFAULT_SWAPPINESS: u64 = 10;

/// Controller for one VM's cgroup v2 leaf.
pub struct CgroupController {
    name: String,
    path: PathBuf,
}

impl CgroupController {
    /// Create the leaf directory `<root>/vm_<name>` (idempotent).
    pub fn create(root: &Path, vm_name: &str) -> Result<Self> {
        let path = root.join(format!("vm_{vm_name}"));
        if !path.exists() {
            std::fs::create_dir_all(&path)
                .map_err(|e| VirtscaleError::from_sysfs_io(path.clone(), e))?;
            debug!(cgroup = %path.display(), "Created cgroup leaf");
        }
        Ok(Self { name: vm_name.to_string(), path })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write `cpu.max` as "<quota_us> <period_us>".
    pub fn set_cpu_limit(&self, quota_us: u64, period_us: u64) -> Result<()> {
        self.write_value("cpu.max", &format!("{quota_us} {period_us}"))
    }

    /// Write `cpu.weight` (1..=10000).
    pub fn set_cpu_weight(&self, weight: u64) -> Result<()> {
        self.write_value("cpu.weight", &weight.to_string())
    }

    /// Write `memory.max` and mirror the value into `memory.swap.max`.
    pub fn set_memory_limit(&self, limit_bytes: u64) -> Result<()> {
        self.write_value("memory.max", &limit_bytes.to_string())?;
        self.write_value("memory.swap.max", &limit_bytes.to_string())
    }

    /// Write `memory.swappiness`.
    pub fn set_memory_swappiness(&self, swappiness: u64) -> Result<()> {
        self.write_value("memory.swappiness", &swappiness.to_string())
    }

    /// Write `io.max` for a block device as "maj:min rbps=<r> wbps=<w>".
    pub fn set_io_limit(&self, device: &str, read_bps: u64, write_bps: u64) -> Result<()> {
        self.write_value("io.max", &format!("{device} rbps={read_bps} wbps={write_bps}"))
    }

    /// Move a process into this cgroup.
    pub fn add_process(&self, pid: u32) -> Result<()> {
        self.write_value("cgroup.procs", &pid.to_string())
    }

    /// Move a process back to the parent cgroup.
    pub fn remove_process(&self, pid: u32) -> Result<()> {
        let parent = self
            .path
            .parent()
            .ok_or_else(|| VirtscaleError::Internal("cgroup leaf has no parent".to_string()))?;
        let procs = parent.join("cgroup.procs");
        std::fs::write(&procs, pid.to_string())
            .map_err(|e| VirtscaleError::from_sysfs_io(procs, e))
    }

    /// True when `cgroup.procs` lists no members.
    pub fn is_empty(&self) -> bool {
        let procs = self.path.join("cgroup.procs");
        match std::fs::read_to_string(&procs) {
            Ok(content) => content.trim().is_empty(),
            // A missing file means the leaf is gone already.
            Err(_) => true,
        }
    }

    /// Remove the leaf directory.
    ///
    /// Runs on the VM teardown path and therefore never propagates an
    /// error: a still-populated leaf is logged and left in place.
    pub fn release(&self) {
        if !self.path.exists() {
            return;
        }
        if !self.is_empty() {
            warn!(cgroup = %self.path.display(), "Not removing non-empty cgroup leaf");
            return;
        }
        // The kernel only allows rmdir on an empty leaf; recursive removal
        // would race member processes anyway.
        if let Err(e) = std::fs::remove_dir(&self.path) {
            warn!(cgroup = %self.path.display(), error = %e, "Failed to remove cgroup leaf");
        } else {
            debug!(cgroup = %self.path.display(), "Removed cgroup leaf");
        }
    }

    fn write_value(&self, filename: &str, value: &str) -> Result<()> {
        let path = self.path.join(filename);
        std::fs::write(&path, value).map_err(|e| VirtscaleError::from_sysfs_io(path, e))
    }
}

impl Drop for CgroupController {
    fn drop(&mut self) {
        self.release();
    }
}
