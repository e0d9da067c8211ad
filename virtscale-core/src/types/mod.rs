//! Core domain types.

pub mod metrics;
pub mod scaling;
pub mod vm;

pub use metrics::{HostMetrics, ResourceUsage, VmMetrics};
pub use scaling::{ResourceKind, ResourceLimit, ScalingAction, ScalingDecision};
pub use vm::{VmConfig, VmSnapshot, VmStatus};
