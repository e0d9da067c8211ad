//! In-memory hypervisor backend.
//!
//! Implements the full [`Hypervisor`] contract against process-local state.
//! Used by the test suite and by development hosts without libvirt
//! (`fake:///` URIs). Domains remember their state transitions, counters and
//! snapshots; tests can inject latency, failures and synthetic cpu-time.

use super::{
    DomainBlockStats, DomainHandle, DomainInfo, DomainInterfaceStats, DomainMemoryStats,
    DomainRecord, DomainState, Hypervisor,
};
use crate::error::{Result, VirtscaleError};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

/// In-memory hypervisor connection.
pub struct FakeHypervisor {
    uri: String,
    domains: RwLock<HashMap<String, Arc<FakeDomain>>>,
    /// Artificial latency applied to every mutating domain op, in millis.
    op_delay_ms: Arc<AtomicU64>,
}

impl FakeHypervisor {
    pub fn new(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            domains: RwLock::new(HashMap::new()),
            op_delay_ms: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Inject latency into every mutating domain operation.
    pub fn set_op_delay(&self, delay: Duration) {
        self.op_delay_ms.store(delay.as_millis() as u64, Ordering::Relaxed);
    }

    /// Direct access to a domain's fake state, for test orchestration.
    pub fn domain(&self, name: &str) -> Option<Arc<FakeDomain>> {
        self.domains.read().unwrap().get(name).cloned()
    }

    /// Pre-seed a defined domain, as if it existed before the controller
    /// started.
    pub fn seed_domain(&self, name: &str, vcpus: u32, memory_kib: u64, state: DomainState) {
        let domain = Arc::new(FakeDomain::new(name, vcpus, memory_kib, self.op_delay_ms.clone()));
        *domain.state.lock().unwrap() = state;
        self.domains.write().unwrap().insert(name.to_string(), domain);
    }
}

#[async_trait]
impl Hypervisor for FakeHypervisor {
    fn uri(&self) -> &str {
        &self.uri
    }

    async fn hostname(&self) -> Result<String> {
        Ok("fakehost".to_string())
    }

    async fn version(&self) -> Result<String> {
        Ok("0.0.0".to_string())
    }

    async fn is_alive(&self) -> bool {
        true
    }

    async fn list_domains(&self) -> Result<Vec<DomainRecord>> {
        let domains = self.domains.read().unwrap();
        Ok(domains
            .values()
            .map(|d| DomainRecord {
                name: d.name.clone(),
                uuid: d.uuid.clone(),
                state: *d.state.lock().unwrap(),
                vcpus: d.vcpus.load(Ordering::Relaxed),
                memory_kib: d.memory_kib.load(Ordering::Relaxed),
            })
            .collect())
    }

    async fn lookup_domain(&self, name: &str) -> Result<Arc<dyn DomainHandle>> {
        self.domains
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .map(|d| d as Arc<dyn DomainHandle>)
            .ok_or_else(|| VirtscaleError::DomainNotFound { name: name.to_string() })
    }

    async fn define_domain(&self, xml: &str) -> Result<Arc<dyn DomainHandle>> {
        let name = xml_tag(xml, "name").ok_or_else(|| VirtscaleError::Hypervisor {
            code: 27,
            message: "domain XML is missing a <name> element".to_string(),
        })?;
        let vcpus = xml_tag(xml, "vcpu").and_then(|v| v.parse().ok()).unwrap_or(1);
        let memory_mib: u64 = xml_tag(xml, "memory").and_then(|v| v.parse().ok()).unwrap_or(512);

        let domain =
            Arc::new(FakeDomain::new(&name, vcpus, memory_mib * 1024, self.op_delay_ms.clone()));
        self.domains.write().unwrap().insert(name, domain.clone());
        Ok(domain as Arc<dyn DomainHandle>)
    }

    async fn migrate_domain(&self, name: &str, dest_uri: &str) -> Result<Arc<dyn DomainHandle>> {
        // A second connection is opened to the destination; here only
        // fake:// destinations are reachable.
        if !dest_uri.starts_with("fake://") {
            return Err(VirtscaleError::Connection {
                uri: dest_uri.to_string(),
                reason: "unable to connect to destination hypervisor".to_string(),
            });
        }

        let domain = self
            .domains
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| VirtscaleError::DomainNotFound { name: name.to_string() })?;

        if *domain.state.lock().unwrap() != DomainState::Running {
            return Err(VirtscaleError::Hypervisor {
                code: 55,
                message: format!("domain {name} is not running"),
            });
        }

        domain.sleep_op_delay().await;
        domain.migration_count.fetch_add(1, Ordering::Relaxed);
        Ok(domain as Arc<dyn DomainHandle>)
    }
}

/// One in-memory domain.
#[derive(Debug)]
pub struct FakeDomain {
    name: String,
    uuid: String,
    state: Mutex<DomainState>,
    vcpus: AtomicU32,
    memory_kib: AtomicU64,
    max_memory_kib: AtomicU64,
    cpu_time_ns: AtomicU64,
    block_read_bytes: AtomicU64,
    block_write_bytes: AtomicU64,
    net_rx_bytes: AtomicU64,
    net_tx_bytes: AtomicU64,
    snapshots: Mutex<Vec<String>>,
    /// Number of mutating ops that should fail before succeeding again.
    fail_next: AtomicU32,
    migration_count: AtomicU64,
    op_delay_ms: Arc<AtomicU64>,
}

impl FakeDomain {
    fn new(name: &str, vcpus: u32, memory_kib: u64, op_delay_ms: Arc<AtomicU64>) -> Self {
        Self {
            name: name.to_string(),
            uuid: uuid::Uuid::new_v4().to_string(),
            state: Mutex::new(DomainState::Shutoff),
            vcpus: AtomicU32::new(vcpus),
            memory_kib: AtomicU64::new(memory_kib),
            max_memory_kib: AtomicU64::new(memory_kib),
            cpu_time_ns: AtomicU64::new(0),
            block_read_bytes: AtomicU64::new(0),
            block_write_bytes: AtomicU64::new(0),
            net_rx_bytes: AtomicU64::new(0),
            net_tx_bytes: AtomicU64::new(0),
            snapshots: Mutex::new(Vec::new()),
            fail_next: AtomicU32::new(0),
            migration_count: AtomicU64::new(0),
            op_delay_ms,
        }
    }

    /// Make the next `count` mutating operations fail.
    pub fn fail_next_ops(&self, count: u32) {
        self.fail_next.store(count, Ordering::Relaxed);
    }

    /// Advance the cumulative guest cpu-time counter.
    pub fn advance_cpu_time(&self, delta_ns: u64) {
        self.cpu_time_ns.fetch_add(delta_ns, Ordering::Relaxed);
    }

    /// Advance the cumulative block counters.
    pub fn advance_block_bytes(&self, read: u64, write: u64) {
        self.block_read_bytes.fetch_add(read, Ordering::Relaxed);
        self.block_write_bytes.fetch_add(write, Ordering::Relaxed);
    }

    /// Advance the cumulative interface counters.
    pub fn advance_net_bytes(&self, rx: u64, tx: u64) {
        self.net_rx_bytes.fetch_add(rx, Ordering::Relaxed);
        self.net_tx_bytes.fetch_add(tx, Ordering::Relaxed);
    }

    /// Number of successful migrations observed by this domain.
    pub fn migrations(&self) -> u64 {
        self.migration_count.load(Ordering::Relaxed)
    }

    async fn sleep_op_delay(&self) {
        let ms = self.op_delay_ms.load(Ordering::Relaxed);
        if ms > 0 {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
    }

    async fn mutating_op(&self) -> Result<()> {
        self.sleep_op_delay().await;
        let pending = self.fail_next.load(Ordering::Relaxed);
        if pending > 0 {
            self.fail_next.store(pending - 1, Ordering::Relaxed);
            return Err(VirtscaleError::Hypervisor {
                code: 1,
                message: format!("injected failure on domain {}", self.name),
            });
        }
        Ok(())
    }

    fn transition(&self, from: &[DomainState], to: DomainState, verb: &str) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        if !from.contains(&state) {
            return Err(VirtscaleError::Hypervisor {
                code: 55,
                message: format!("cannot {verb} domain {} in state {:?}", self.name, *state),
            });
        }
        *state = to;
        Ok(())
    }
}

#[async_trait]
impl DomainHandle for FakeDomain {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn uuid(&self) -> String {
        self.uuid.clone()
    }

    async fn create(&self) -> Result<()> {
        self.mutating_op().await?;
        self.transition(&[DomainState::Shutoff], DomainState::Running, "start")
    }

    async fn destroy(&self) -> Result<()> {
        self.mutating_op().await?;
        self.transition(&[DomainState::Running, DomainState::Paused], DomainState::Shutoff, "destroy")
    }

    async fn shutdown(&self) -> Result<()> {
        self.mutating_op().await?;
        self.transition(&[DomainState::Running], DomainState::Shutoff, "shutdown")
    }

    async fn suspend(&self) -> Result<()> {
        self.mutating_op().await?;
        self.transition(&[DomainState::Running], DomainState::Paused, "suspend")
    }

    async fn resume(&self) -> Result<()> {
        self.mutating_op().await?;
        self.transition(&[DomainState::Paused], DomainState::Running, "resume")
    }

    async fn undefine(&self) -> Result<()> {
        self.mutating_op().await
    }

    async fn set_vcpus(&self, vcpus: u32) -> Result<()> {
        self.mutating_op().await?;
        self.vcpus.store(vcpus, Ordering::Relaxed);
        Ok(())
    }

    async fn set_memory_kib(&self, kib: u64) -> Result<()> {
        self.mutating_op().await?;
        self.memory_kib.store(kib, Ordering::Relaxed);
        self.max_memory_kib.fetch_max(kib, Ordering::Relaxed);
        Ok(())
    }

    async fn info(&self) -> Result<DomainInfo> {
        Ok(DomainInfo {
            state: *self.state.lock().unwrap(),
            cpu_time_ns: self.cpu_time_ns.load(Ordering::Relaxed),
            vcpus: self.vcpus.load(Ordering::Relaxed),
            memory_kib: self.memory_kib.load(Ordering::Relaxed),
            max_memory_kib: self.max_memory_kib.load(Ordering::Relaxed),
        })
    }

    async fn memory_stats(&self) -> Result<DomainMemoryStats> {
        Ok(DomainMemoryStats {
            actual_balloon_kib: Some(self.memory_kib.load(Ordering::Relaxed)),
            usable_kib: Some(self.max_memory_kib.load(Ordering::Relaxed)),
        })
    }

    async fn block_stats(&self) -> Result<DomainBlockStats> {
        Ok(DomainBlockStats {
            read_bytes: self.block_read_bytes.load(Ordering::Relaxed),
            write_bytes: self.block_write_bytes.load(Ordering::Relaxed),
        })
    }

    async fn interface_stats(&self) -> Result<DomainInterfaceStats> {
        Ok(DomainInterfaceStats {
            rx_bytes: self.net_rx_bytes.load(Ordering::Relaxed),
            tx_bytes: self.net_tx_bytes.load(Ordering::Relaxed),
        })
    }

    async fn snapshot_create(&self, xml: &str) -> Result<()> {
        self.mutating_op().await?;
        let name = xml_tag(xml, "name").ok_or_else(|| VirtscaleError::Hypervisor {
            code: 27,
            message: "snapshot XML is missing a <name> element".to_string(),
        })?;
        self.snapshots.lock().unwrap().push(name);
        Ok(())
    }

    async fn snapshot_revert(&self, name: &str) -> Result<()> {
        self.mutating_op().await?;
        if !self.snapshots.lock().unwrap().iter().any(|s| s == name) {
            return Err(VirtscaleError::DomainNotFound { name: name.to_string() });
        }
        Ok(())
    }
}

/// Extract the text content of the first `<tag>...</tag>` element.
fn xml_tag(xml: &str, tag: &str) -> Option<String> {
    let open = format!("<{tag}");
    let close = format!("</{tag}>");
    let start = xml.find(&open)?;
    let content_start = xml[start..].find('>')? + start + 1;
    let content_end = xml[content_start..].find(&close)? + content_start;
    Some(xml[content_start..content_end].trim().to_string())
}
