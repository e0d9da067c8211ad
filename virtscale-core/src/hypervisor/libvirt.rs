//! Libvirt backend via the `virt` crate.
//!
//! Compiled only with the `libvirt` feature; requires libvirt development
//! headers at build time and a reachable libvirtd at run time.

use super::{
    DomainBlockStats, DomainHandle, DomainInfo, DomainInterfaceStats, DomainMemoryStats,
    DomainRecord, DomainState, Hypervisor,
};
use crate::error::{Result, VirtscaleError};
use async_trait::async_trait;
use std::sync::Arc;
use virt::connect::Connect;
use virt::domain::Domain;
use virt::domain_snapshot::DomainSnapshot;

/// Block device target used by the generated domain XML.
const PRIMARY_DISK: &str = "vda";

fn map_err(err: virt::error::Error) -> VirtscaleError {
    VirtscaleError::Hypervisor { code: err.code() as i32, message: err.message().to_string() }
}

/// Discard the success payload of a libvirt call (some return the raw int).
fn ignore<T>(result: std::result::Result<T, virt::error::Error>) -> Result<()> {
    result.map(|_| ()).map_err(map_err)
}

fn map_state(state: u32) -> DomainState {
    match state {
        x if x == virt::sys::VIR_DOMAIN_RUNNING => DomainState::Running,
        x if x == virt::sys::VIR_DOMAIN_PAUSED => DomainState::Paused,
        x if x == virt::sys::VIR_DOMAIN_SHUTOFF => DomainState::Shutoff,
        _ => DomainState::Other,
    }
}

/// libvirt connections are documented thread-safe; the raw pointer inside
/// `Connect`/`Domain` is what keeps the wrapper types from being auto-Send.
struct SharedConnect(Connect);

unsafe impl Send for SharedConnect {}
unsafe impl Sync for SharedConnect {}

struct SharedDomain(Domain);

unsafe impl Send for SharedDomain {}
unsafe impl Sync for SharedDomain {}

/// Connection to a libvirt hypervisor.
pub struct LibvirtHypervisor {
    uri: String,
    conn: SharedConnect,
}

impl LibvirtHypervisor {
    /// Open a connection to `uri` (e.g. `qemu:///system`).
    pub fn open(uri: &str) -> Result<Self> {
        let conn = Connect::open(Some(uri)).map_err(|e| VirtscaleError::Connection {
            uri: uri.to_string(),
            reason: e.to_string(),
        })?;
        Ok(Self { uri: uri.to_string(), conn: SharedConnect(conn) })
    }

    fn wrap(&self, dom: Domain) -> Arc<dyn DomainHandle> {
        let name = dom.get_name().unwrap_or_default();
        let uuid = dom.get_uuid_string().unwrap_or_default();
        Arc::new(LibvirtDomain { name, uuid, dom: SharedDomain(dom) })
    }
}

impl Drop for LibvirtHypervisor {
    fn drop(&mut self) {
        // Close is idempotent; the connection is reference-counted by libvirt.
        let _ = self.conn.0.close();
    }
}

#[async_trait]
impl Hypervisor for LibvirtHypervisor {
    fn uri(&self) -> &str {
        &self.uri
    }

    async fn hostname(&self) -> Result<String> {
        self.conn.0.get_hostname().map_err(map_err)
    }

    async fn version(&self) -> Result<String> {
        let v = self.conn.0.get_hyp_version().map_err(map_err)?;
        Ok(format!("{}.{}.{}", v / 1_000_000, (v % 1_000_000) / 1000, v % 1000))
    }

    async fn is_alive(&self) -> bool {
        self.conn.0.is_alive().unwrap_or(false)
    }

    async fn list_domains(&self) -> Result<Vec<DomainRecord>> {
        let flags =
            virt::sys::VIR_CONNECT_LIST_DOMAINS_ACTIVE | virt::sys::VIR_CONNECT_LIST_DOMAINS_INACTIVE;
        let domains = self.conn.0.list_all_domains(flags).map_err(map_err)?;

        let mut records = Vec::with_capacity(domains.len());
        for dom in domains {
            let name = dom.get_name().map_err(map_err)?;
            let uuid = dom.get_uuid_string().map_err(map_err)?;
            let info = dom.get_info().map_err(map_err)?;
            records.push(DomainRecord {
                name,
                uuid,
                state: map_state(info.state),
                vcpus: info.nr_virt_cpu,
                memory_kib: info.memory,
            });
        }
        Ok(records)
    }

    async fn lookup_domain(&self, name: &str) -> Result<Arc<dyn DomainHandle>> {
        match Domain::lookup_by_name(&self.conn.0, name) {
            Ok(dom) => Ok(self.wrap(dom)),
            Err(_) => Err(VirtscaleError::DomainNotFound { name: name.to_string() }),
        }
    }

    async fn define_domain(&self, xml: &str) -> Result<Arc<dyn DomainHandle>> {
        let dom = Domain::define_xml(&self.conn.0, xml).map_err(map_err)?;
        Ok(self.wrap(dom))
    }

    async fn migrate_domain(&self, name: &str, dest_uri: &str) -> Result<Arc<dyn DomainHandle>> {
        let dom = Domain::lookup_by_name(&self.conn.0, name)
            .map_err(|_| VirtscaleError::DomainNotFound { name: name.to_string() })?;

        let dest = Connect::open(Some(dest_uri)).map_err(|e| VirtscaleError::Connection {
            uri: dest_uri.to_string(),
            reason: e.to_string(),
        })?;

        let flags = virt::sys::VIR_MIGRATE_LIVE
            | virt::sys::VIR_MIGRATE_UNDEFINE_SOURCE
            | virt::sys::VIR_MIGRATE_PERSIST_DEST;
        let result = dom.migrate(&dest, flags as u32, 0).map_err(map_err);
        let _ = dest.close();
        result.map(|migrated| self.wrap(migrated))
    }
}

/// Handle to one libvirt domain.
struct LibvirtDomain {
    name: String,
    uuid: String,
    dom: SharedDomain,
}

impl std::fmt::Debug for LibvirtDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LibvirtDomain")
            .field("name", &self.name)
            .field("uuid", &self.uuid)
            .finish()
    }
}

impl Drop for LibvirtDomain {
    fn drop(&mut self) {
        let _ = self.dom.0.free();
    }
}

#[async_trait]
impl DomainHandle for LibvirtDomain {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn uuid(&self) -> String {
        self.uuid.clone()
    }

    async fn create(&self) -> Result<()> {
        ignore(self.dom.0.create())
    }

    async fn destroy(&self) -> Result<()> {
        ignore(self.dom.0.destroy())
    }

    async fn shutdown(&self) -> Result<()> {
        ignore(self.dom.0.shutdown())
    }

    async fn suspend(&self) -> Result<()> {
        ignore(self.dom.0.suspend())
    }

    async fn resume(&self) -> Result<()> {
        ignore(self.dom.0.resume())
    }

    async fn undefine(&self) -> Result<()> {
        ignore(self.dom.0.undefine())
    }

    async fn set_vcpus(&self, vcpus: u32) -> Result<()> {
        ignore(self.dom.0.set_vcpus(vcpus))
    }

    async fn set_memory_kib(&self, kib: u64) -> Result<()> {
        ignore(self.dom.0.set_memory(kib))
    }

    async fn info(&self) -> Result<DomainInfo> {
        let info = self.dom.0.get_info().map_err(map_err)?;
        Ok(DomainInfo {
            state: map_state(info.state),
            cpu_time_ns: info.cpu_time,
            vcpus: info.nr_virt_cpu,
            memory_kib: info.memory,
            max_memory_kib: info.max_mem,
        })
    }

    async fn memory_stats(&self) -> Result<DomainMemoryStats> {
        let stats = self.dom.0.memory_stats(0).map_err(map_err)?;
        let mut out = DomainMemoryStats::default();
        for stat in stats {
            if stat.tag == virt::sys::VIR_DOMAIN_MEMORY_STAT_ACTUAL_BALLOON as i32 {
                out.actual_balloon_kib = Some(stat.val);
            } else if stat.tag == virt::sys::VIR_DOMAIN_MEMORY_STAT_USABLE as i32 {
                out.usable_kib = Some(stat.val);
            }
        }
        Ok(out)
    }

    async fn block_stats(&self) -> Result<DomainBlockStats> {
        let stats = self.dom.0.get_block_stats(PRIMARY_DISK).map_err(map_err)?;
        Ok(DomainBlockStats {
            read_bytes: stats.rd_bytes.max(0) as u64,
            write_bytes: stats.wr_bytes.max(0) as u64,
        })
    }

    async fn interface_stats(&self) -> Result<DomainInterfaceStats> {
        // The tap device name is assigned by libvirt when the domain starts;
        // interface telemetry lands once that name is plumbed through.
        Ok(DomainInterfaceStats::default())
    }

    async fn snapshot_create(&self, xml: &str) -> Result<()> {
        DomainSnapshot::create_xml(&self.dom.0, xml, 0).map(|_| ()).map_err(map_err)
    }

    async fn snapshot_revert(&self, name: &str) -> Result<()> {
        let snapshot = DomainSnapshot::lookup_by_name(&self.dom.0, name, 0)
            .map_err(|_| VirtscaleError::DomainNotFound { name: name.to_string() })?;
        ignore(snapshot.revert(0))
    }
}
