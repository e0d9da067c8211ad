//! virtscale core library
//!
//! Host-level VM lifecycle and elastic-scaling control plane on top of a
//! libvirt-style hypervisor API and Linux cgroups v2: a periodic monitor
//! feeds per-VM metrics to a scaling engine whose decisions a serialized
//! executor applies through the VM manager.

pub mod cgroup;
pub mod config;
pub mod error;
pub mod executor;
pub mod hypervisor;
pub mod manager;
pub mod monitor;
pub mod scaling;
pub mod supervisor;
pub mod types;
pub mod vm;

// Re-export commonly used items
pub use config::DaemonConfig;
pub use error::{Result, VirtscaleError};
pub use executor::{Executor, ExecutorConfig};
pub use hypervisor::HypervisorHandle;
pub use manager::{StatusEvent, VmManager};
pub use monitor::Monitor;
pub use scaling::{RateLimitConfig, ScalingEngine, ScalingThresholds};
pub use supervisor::Supervisor;
pub use types::{
    HostMetrics, ResourceKind, ResourceLimit, ResourceUsage, ScalingAction, ScalingDecision,
    VmConfig, VmMetrics, VmSnapshot, VmStatus,
};
