//! Scaling decision and resource limit types.

use serde::{Deserialize, Serialize};
use std::time::SystemTime;

/// Resource kind a limit or decision applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResourceKind {
    Cpu,
    Memory,
    Io,
    Network,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cpu => write!(f, "cpu"),
            Self::Memory => write!(f, "memory"),
            Self::Io => write!(f, "io"),
            Self::Network => write!(f, "network"),
        }
    }
}

/// Action proposed by the scaling engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ScalingAction {
    ScaleUp,
    ScaleDown,
    Maintain,
    Migrate,
    Suspend,
    Resume,
}

impl std::fmt::Display for ScalingAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ScaleUp => write!(f, "scale-up"),
            Self::ScaleDown => write!(f, "scale-down"),
            Self::Maintain => write!(f, "maintain"),
            Self::Migrate => write!(f, "migrate"),
            Self::Suspend => write!(f, "suspend"),
            Self::Resume => write!(f, "resume"),
        }
    }
}

/// Allowed range and current allotment for one (VM, resource kind) pair.
///
/// Invariant: `min <= current <= max`, with `min > 0` for CPU (cores) and
/// memory (bytes).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimit {
    pub kind: ResourceKind,
    pub min: u64,
    pub max: u64,
    pub current: u64,
    pub unit: String,
}

impl ResourceLimit {
    /// CPU limit in cores.
    pub fn cpu(min: u64, max: u64, current: u64) -> Self {
        Self { kind: ResourceKind::Cpu, min, max, current, unit: "cores".to_string() }
    }

    /// Memory limit in bytes.
    pub fn memory(min: u64, max: u64, current: u64) -> Self {
        Self { kind: ResourceKind::Memory, min, max, current, unit: "bytes".to_string() }
    }

    /// IO limit in bytes per second.
    pub fn io(min: u64, max: u64, current: u64) -> Self {
        Self { kind: ResourceKind::Io, min, max, current, unit: "bps".to_string() }
    }

    /// Network limit in bytes per second.
    pub fn network(min: u64, max: u64, current: u64) -> Self {
        Self { kind: ResourceKind::Network, min, max, current, unit: "bps".to_string() }
    }

    /// Check the limit invariant.
    pub fn validate(&self) -> bool {
        let positive_floor = match self.kind {
            ResourceKind::Cpu | ResourceKind::Memory => self.min > 0,
            ResourceKind::Io | ResourceKind::Network => true,
        };
        positive_floor && self.min <= self.current && self.current <= self.max
    }

    /// True if `value` falls within `[min, max]`.
    pub fn admits(&self, value: u64) -> bool {
        self.min <= value && value <= self.max
    }
}

/// A proposed, unapplied scaling action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScalingDecision {
    /// Target VM name
    pub vm_name: String,

    /// Proposed action
    pub action: ScalingAction,

    /// Resource kind the action applies to
    pub resource: ResourceKind,

    /// New absolute allotment (vCPU count for CPU, bytes for memory)
    pub amount: u64,

    /// Confidence in the decision, in `[0.0, 1.0]`
    pub confidence: f64,

    /// Human-readable rationale
    pub reason: String,

    /// Wall-clock emission time
    pub timestamp: SystemTime,
}
