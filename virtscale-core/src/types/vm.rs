//! VM domain types.

use crate::types::scaling::ResourceLimit;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::SystemTime;

/// VM status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmStatus {
    /// Domain is defined but not running
    Stopped,

    /// Domain definition is in progress
    Creating,

    /// Domain is running
    Running,

    /// Domain is suspended by the hypervisor
    Paused,

    /// Live migration is in flight
    Migrating,

    /// Domain was suspended by a scaling decision
    Suspended,

    /// Last operation left the domain in an unrecoverable state
    Error,
}

impl std::fmt::Display for VmStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Stopped => write!(f, "stopped"),
            Self::Creating => write!(f, "creating"),
            Self::Running => write!(f, "running"),
            Self::Paused => write!(f, "paused"),
            Self::Migrating => write!(f, "migrating"),
            Self::Suspended => write!(f, "suspended"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Declarative VM configuration.
///
/// Handed to the manager once at definition time and never mutated by the
/// caller afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct VmConfig {
    /// Unique VM name (also names the cgroup leaf and libvirt domain)
    pub name: String,

    /// Path to the qcow2 disk image backing the domain
    pub image_path: PathBuf,

    /// Number of vCPUs
    pub vcpus: u32,

    /// Memory in MiB
    pub memory_mb: u64,

    /// Guest OS type for the domain definition (e.g. "hvm")
    pub os_type: String,

    /// Guest architecture (e.g. "x86_64")
    pub arch: String,

    /// Host bridge the virtio interface attaches to
    pub network_bridge: String,

    /// Video model (e.g. "virtio")
    pub video_model: String,

    /// Video RAM in KiB
    pub video_vram_kib: u32,

    /// Initial resource limits, one per resource kind
    pub limits: Vec<ResourceLimit>,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            image_path: PathBuf::new(),
            vcpus: 2,
            memory_mb: 2048,
            os_type: "hvm".to_string(),
            arch: "x86_64".to_string(),
            network_bridge: "virbr0".to_string(),
            video_model: "virtio".to_string(),
            video_vram_kib: 16384,
            limits: Vec::new(),
        }
    }
}

impl VmConfig {
    /// Memory allotment in bytes.
    pub fn memory_bytes(&self) -> u64 {
        self.memory_mb * 1024 * 1024
    }
}

/// Snapshot metadata cached on the VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmSnapshot {
    /// Snapshot name
    pub name: String,

    /// Free-form description
    pub description: String,

    /// Wall-clock creation time
    pub created_at: SystemTime,

    /// Parent snapshot name, if any
    pub parent: Option<String>,

    /// Disk image size at capture time, in bytes
    pub disk_size_bytes: u64,

    /// VM status at capture time
    pub vm_state: VmStatus,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_display() {
        assert_eq!(VmStatus::Running.to_string(), "running");
        assert_eq!(VmStatus::Migrating.to_string(), "migrating");
        assert_eq!(VmStatus::Error.to_string(), "error");
    }

    #[test]
    fn config_defaults() {
        let config = VmConfig::default();
        assert_eq!(config.vcpus, 2);
        assert_eq!(config.memory_mb, 2048);
        assert_eq!(config.network_bridge, "virbr0");
        assert_eq!(config.memory_bytes(), 2048 * 1024 * 1024);
    }

    #[test]
    fn config_json_roundtrip_fills_defaults() {
        let config: VmConfig = serde_json::from_str(r#"{"name":"web1"}"#).unwrap();
        assert_eq!(config.name, "web1");
        assert_eq!(config.arch, "x86_64");
        assert_eq!(config.os_type, "hvm");
    }
}
