//! Configuration management.
//!
//! The daemon reads a JSON configuration on startup and rewrites it on
//! shutdown. Every field is serde-defaulted so a partial file (or none at
//! all) yields a working configuration.

use crate::error::{Result, VirtscaleError};
use crate::scaling::ScalingThresholds;
use crate::types::vm::VmConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default configuration file, relative to the working directory.
pub const DEFAULT_CONFIG_PATH: &str = "./vm_manager_config.json";

/// Persistent daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    /// Hypervisor connection URI.
    pub hypervisor_uri: String,

    /// Root of the cgroup v2 hierarchy the per-VM leaves live under.
    pub cgroup_root: PathBuf,

    /// Monitor sampling cadence in seconds.
    pub monitor_interval_secs: u64,

    /// Scaling thresholds handed to the engine at startup.
    pub thresholds: ScalingThresholds,

    /// Destination URI for Migrate decisions, if any.
    pub migrate_destination: Option<String>,

    /// VMs defined declaratively at startup.
    pub vms: Vec<VmConfig>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            hypervisor_uri: "qemu:///system".to_string(),
            cgroup_root: PathBuf::from("/sys/fs/cgroup"),
            monitor_interval_secs: 1,
            thresholds: ScalingThresholds::default(),
            migrate_destination: None,
            vms: Vec::new(),
        }
    }
}

impl DaemonConfig {
    /// Default configuration file path.
    pub fn default_path() -> PathBuf {
        PathBuf::from(DEFAULT_CONFIG_PATH)
    }

    /// Load the configuration from disk; a missing file yields defaults.
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| VirtscaleError::Configuration {
            reason: format!("failed to read {}: {e}", path.display()),
        })?;
        serde_json::from_str(&content).map_err(|e| VirtscaleError::Configuration {
            reason: format!("failed to parse {}: {e}", path.display()),
        })
    }

    /// Write the configuration back to disk.
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| VirtscaleError::Configuration {
                    reason: format!("failed to create {}: {e}", parent.display()),
                })?;
            }
        }
        let content =
            serde_json::to_string_pretty(self).map_err(|e| VirtscaleError::Configuration {
                reason: format!("failed to serialize configuration: {e}"),
            })?;
        std::fs::write(path, content).map_err(|e| VirtscaleError::Configuration {
            reason: format!("failed to write {}: {e}", path.display()),
        })
    }
}
