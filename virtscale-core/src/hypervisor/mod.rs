//! Hypervisor abstraction.
//!
//! virtscale drives a libvirt-style management API through the [`Hypervisor`]
//! and [`DomainHandle`] traits so the control plane never depends on a
//! concrete backend:
//! - `fake`: in-memory backend for tests and hosts without a hypervisor
//! - `libvirt` (feature-gated): the real binding via the `virt` crate

use crate::error::{Result, VirtscaleError};
use async_trait::async_trait;
use std::sync::Arc;

pub mod fake;

#[cfg(feature = "libvirt")]
pub mod libvirt;

/// Coarse domain state reported by the hypervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainState {
    Running,
    Paused,
    Shutoff,
    Other,
}

/// Snapshot of `virDomainGetInfo`-style domain data.
#[derive(Debug, Clone, Copy)]
pub struct DomainInfo {
    pub state: DomainState,

    /// Cumulative guest CPU time in nanoseconds
    pub cpu_time_ns: u64,

    pub vcpus: u32,

    /// Current memory allotment in KiB
    pub memory_kib: u64,

    /// Maximum memory allotment in KiB
    pub max_memory_kib: u64,
}

/// Balloon-driver memory statistics.
///
/// Tags are only present when the guest balloon driver cooperates.
#[derive(Debug, Clone, Copy, Default)]
pub struct DomainMemoryStats {
    /// ACTUAL_BALLOON tag: resident memory in KiB
    pub actual_balloon_kib: Option<u64>,

    /// USABLE tag: memory budget in KiB
    pub usable_kib: Option<u64>,
}

/// Cumulative block-device counters for the primary disk.
#[derive(Debug, Clone, Copy, Default)]
pub struct DomainBlockStats {
    pub read_bytes: u64,
    pub write_bytes: u64,
}

/// Cumulative interface counters for the primary interface.
#[derive(Debug, Clone, Copy, Default)]
pub struct DomainInterfaceStats {
    pub rx_bytes: u64,
    pub tx_bytes: u64,
}

/// One entry from domain enumeration (active + defined-but-inactive).
#[derive(Debug, Clone)]
pub struct DomainRecord {
    pub name: String,
    pub uuid: String,
    pub state: DomainState,
    pub vcpus: u32,
    pub memory_kib: u64,
}

/// Per-domain operations.
///
/// Handles are reference-counted; release happens on drop and is idempotent.
#[async_trait]
pub trait DomainHandle: Send + Sync + std::fmt::Debug {
    fn name(&self) -> String;

    fn uuid(&self) -> String;

    /// Boot the domain (`virDomainCreate`).
    async fn create(&self) -> Result<()>;

    /// Force-stop the domain (`virDomainDestroy`).
    async fn destroy(&self) -> Result<()>;

    /// Request graceful guest shutdown (`virDomainShutdown`).
    async fn shutdown(&self) -> Result<()>;

    /// Suspend the domain (`virDomainSuspend`).
    async fn suspend(&self) -> Result<()>;

    /// Resume a suspended domain (`virDomainResume`).
    async fn resume(&self) -> Result<()>;

    /// Remove the persistent definition (`virDomainUndefine`).
    async fn undefine(&self) -> Result<()>;

    /// Change the live vCPU count.
    async fn set_vcpus(&self, vcpus: u32) -> Result<()>;

    /// Change the live memory allotment (balloon target), in KiB.
    async fn set_memory_kib(&self, kib: u64) -> Result<()>;

    async fn info(&self) -> Result<DomainInfo>;

    async fn memory_stats(&self) -> Result<DomainMemoryStats>;

    async fn block_stats(&self) -> Result<DomainBlockStats>;

    async fn interface_stats(&self) -> Result<DomainInterfaceStats>;

    /// Create a snapshot from snapshot XML.
    async fn snapshot_create(&self, xml: &str) -> Result<()>;

    /// Revert to a named snapshot.
    async fn snapshot_revert(&self, name: &str) -> Result<()>;
}

/// Connection-level operations against one hypervisor URI.
#[async_trait]
pub trait Hypervisor: Send + Sync {
    fn uri(&self) -> &str;

    async fn hostname(&self) -> Result<String>;

    /// Hypervisor version string, e.g. "8.0.0".
    async fn version(&self) -> Result<String>;

    async fn is_alive(&self) -> bool;

    /// Enumerate active and defined domains.
    async fn list_domains(&self) -> Result<Vec<DomainRecord>>;

    async fn lookup_domain(&self, name: &str) -> Result<Arc<dyn DomainHandle>>;

    /// Define a persistent domain from XML and return its handle.
    async fn define_domain(&self, xml: &str) -> Result<Arc<dyn DomainHandle>>;

    /// Live-migrate a domain to `dest_uri`.
    ///
    /// Opens a second connection to the destination, migrates with
    /// LIVE | UNDEFINE_SOURCE | PERSIST_DEST and returns the handle adopted
    /// from the destination. The source handle becomes invalid on success.
    async fn migrate_domain(&self, name: &str, dest_uri: &str) -> Result<Arc<dyn DomainHandle>>;
}

/// Shared, read-only handle to the hypervisor connection.
///
/// Exactly one per supervisor; cloned into the monitor, manager and
/// executor. The underlying connection is reference-counted and closed when
/// the last clone drops.
#[derive(Clone)]
pub struct HypervisorHandle {
    inner: Arc<dyn Hypervisor>,
}

impl HypervisorHandle {
    /// Open a connection to the hypervisor at `uri`.
    ///
    /// `fake:///...` URIs select the in-memory backend; anything else
    /// requires the `libvirt` feature.
    pub fn connect(uri: &str) -> Result<Self> {
        if uri.starts_with("fake://") {
            return Ok(Self::with_backend(Arc::new(fake::FakeHypervisor::new(uri))));
        }

        #[cfg(feature = "libvirt")]
        {
            return Ok(Self::with_backend(Arc::new(libvirt::LibvirtHypervisor::open(uri)?)));
        }

        #[cfg(not(feature = "libvirt"))]
        Err(VirtscaleError::Configuration {
            reason: format!("cannot open {uri}: built without libvirt support"),
        })
    }

    /// Wrap an already-constructed backend.
    pub fn with_backend(backend: Arc<dyn Hypervisor>) -> Self {
        Self { inner: backend }
    }

    /// Access the underlying backend.
    pub fn backend(&self) -> &Arc<dyn Hypervisor> {
        &self.inner
    }
}

impl std::ops::Deref for HypervisorHandle {
    type Target = dyn Hypervisor;

    fn deref(&self) -> &Self::Target {
        self.inner.as_ref()
    }
}

impl std::fmt::Debug for HypervisorHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HypervisorHandle").field("uri", &self.inner.uri()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_selects_fake_backend() {
        let handle = HypervisorHandle::connect("fake:///system").unwrap();
        assert_eq!(handle.uri(), "fake:///system");
    }

    #[cfg(not(feature = "libvirt"))]
    #[test]
    fn connect_rejects_real_uri_without_libvirt() {
        let err = HypervisorHandle::connect("qemu:///system").unwrap_err();
        assert!(matches!(err, VirtscaleError::Configuration { .. }));
    }
}
