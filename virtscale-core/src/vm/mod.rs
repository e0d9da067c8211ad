//! Virtual machine runtime representation and state machine.
//!
//! One [`Vm`] per libvirt domain. The VM owns its cgroup leaf and serializes
//! all state transitions through a per-VM async mutex: exactly one
//! transition is in flight at a time, and concurrent callers queue behind
//! it. Status reads never block on an in-flight transition.

pub mod xml;

use crate::cgroup::{CgroupController, DEFAULT_CPU_WEIGHT, DEFAULT_SWAPPINESS};
use crate::error::{Result, VirtscaleError};
use crate::hypervisor::{DomainHandle, HypervisorHandle};
use crate::types::scaling::{ResourceKind, ResourceLimit};
use crate::types::vm::{VmConfig, VmSnapshot, VmStatus};
use std::path::Path;
use std::sync::{Arc, Mutex as StdMutex, RwLock};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::Mutex;
use tracing::{error, info, warn};

/// Block device the io.max limit is written for.
const DEFAULT_IO_DEVICE: &str = "8:0";

/// Delay between the stop and start halves of a restart.
const RESTART_DELAY: Duration = Duration::from_secs(2);

/// Mutable VM state guarded by the transition mutex.
struct VmInner {
    config: VmConfig,
    uuid: String,
    domain: Option<Arc<dyn DomainHandle>>,
    limits: Vec<ResourceLimit>,
    snapshots: Vec<VmSnapshot>,
}

/// Runtime representation of one domain.
pub struct Vm {
    name: String,
    hypervisor: HypervisorHandle,
    cgroup: CgroupController,
    /// Current status; written only while the transition mutex is held.
    status: RwLock<VmStatus>,
    /// Set while a live migration is in flight.
    migrating_since: StdMutex<Option<Instant>>,
    inner: Mutex<VmInner>,
}

impl Vm {
    /// Build a fresh VM from a declarative config.
    ///
    /// Creates the cgroup leaf and applies the initial resource limits; the
    /// domain itself is defined later by [`Vm::create`].
    pub fn new(hypervisor: HypervisorHandle, cgroup_root: &Path, config: VmConfig) -> Result<Self> {
        let cgroup = CgroupController::create(cgroup_root, &config.name)?;
        let limits = config.limits.clone();
        apply_limits_to(&cgroup, &config.name, &limits);
        Ok(Self {
            name: config.name.clone(),
            hypervisor,
            cgroup,
            status: RwLock::new(VmStatus::Stopped),
            migrating_since: StdMutex::new(None),
            inner: Mutex::new(VmInner {
                config,
                uuid: String::new(),
                domain: None,
                limits,
                snapshots: Vec::new(),
            }),
        })
    }

    /// Adopt a pre-existing domain discovered at startup.
    ///
    /// The domain handle is taken at construction; the VM never overwrites
    /// a handle it did not receive here or from define/migrate.
    pub fn adopt(
        hypervisor: HypervisorHandle,
        cgroup_root: &Path,
        config: VmConfig,
        domain: Arc<dyn DomainHandle>,
        status: VmStatus,
    ) -> Result<Self> {
        let cgroup = CgroupController::create(cgroup_root, &config.name)?;
        let limits = config.limits.clone();
        let uuid = domain.uuid();
        Ok(Self {
            name: config.name.clone(),
            hypervisor,
            cgroup,
            status: RwLock::new(status),
            migrating_since: StdMutex::new(None),
            inner: Mutex::new(VmInner {
                config,
                uuid,
                domain: Some(domain),
                limits,
                snapshots: Vec::new(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current status. Never blocks on an in-flight transition.
    pub fn status(&self) -> VmStatus {
        *self.status.read().unwrap()
    }

    /// How long the current migration has been in flight, if any.
    pub fn migrating_for(&self) -> Option<Duration> {
        self.migrating_since.lock().unwrap().map(|since| since.elapsed())
    }

    pub async fn uuid(&self) -> String {
        self.inner.lock().await.uuid.clone()
    }

    pub async fn config(&self) -> VmConfig {
        self.inner.lock().await.config.clone()
    }

    pub async fn resource_limits(&self) -> Vec<ResourceLimit> {
        self.inner.lock().await.limits.clone()
    }

    pub async fn snapshots(&self) -> Vec<VmSnapshot> {
        self.inner.lock().await.snapshots.clone()
    }

    /// Domain handle, if the domain has been defined or adopted.
    pub async fn domain(&self) -> Option<Arc<dyn DomainHandle>> {
        self.inner.lock().await.domain.clone()
    }

    pub fn cgroup(&self) -> &CgroupController {
        &self.cgroup
    }

    fn set_status(&self, status: VmStatus) {
        *self.status.write().unwrap() = status;
    }

    fn invalid(&self, operation: &'static str) -> VirtscaleError {
        VirtscaleError::InvalidState { vm: self.name.clone(), operation, status: self.status() }
    }

    /// Define the domain from generated XML: Stopped -> Creating -> Stopped.
    ///
    /// A hypervisor-confirmed define failure parks the VM in Error; a
    /// missing disk image is a configuration error and leaves it Stopped.
    pub async fn create(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if self.status() != VmStatus::Stopped {
            return Err(self.invalid("create"));
        }
        self.set_status(VmStatus::Creating);

        if !inner.config.image_path.exists() {
            self.set_status(VmStatus::Stopped);
            return Err(VirtscaleError::Configuration {
                reason: format!("disk image {} does not exist", inner.config.image_path.display()),
            });
        }

        let domain_xml = xml::domain_xml(&inner.config);
        match self.hypervisor.define_domain(&domain_xml).await {
            Ok(domain) => {
                inner.uuid = domain.uuid();
                inner.domain = Some(domain);
                self.set_status(VmStatus::Stopped);
                info!(vm = %self.name, uuid = %inner.uuid, "VM created");
                Ok(())
            }
            Err(e) => {
                self.set_status(VmStatus::Error);
                error!(vm = %self.name, error = %e, "Failed to define domain");
                Err(e)
            }
        }
    }

    /// Start (or resume) the domain: Stopped | Paused -> Running.
    ///
    /// Cgroup limits are re-applied once the domain is up.
    pub async fn start(&self) -> Result<()> {
        let inner = self.inner.lock().await;
        let from = self.status();
        if from != VmStatus::Stopped && from != VmStatus::Paused {
            return Err(self.invalid("start"));
        }
        let domain = inner.domain.clone().ok_or_else(|| self.invalid("start"))?;

        let result = if from == VmStatus::Paused {
            domain.resume().await
        } else {
            domain.create().await
        };
        match result {
            Ok(()) => {
                self.set_status(VmStatus::Running);
                self.apply_limits(&inner.limits);
                info!(vm = %self.name, "VM started");
                Ok(())
            }
            Err(e) => {
                self.set_status(VmStatus::Error);
                error!(vm = %self.name, error = %e, "Failed to start VM");
                Err(e)
            }
        }
    }

    /// Force-stop the domain: Running | Paused -> Stopped.
    ///
    /// Already-stopped VMs are left alone; stop is idempotent. From Error,
    /// the destroy is best-effort and the VM lands in Stopped so a
    /// subsequent start can recover it.
    pub async fn stop(&self) -> Result<()> {
        let inner = self.inner.lock().await;
        let from = self.status();
        if from == VmStatus::Stopped || from == VmStatus::Creating || from == VmStatus::Migrating {
            return Ok(());
        }
        let Some(domain) = inner.domain.clone() else {
            self.set_status(VmStatus::Stopped);
            return Ok(());
        };

        match domain.destroy().await {
            Ok(()) => {}
            Err(e) if from == VmStatus::Error => {
                warn!(vm = %self.name, error = %e, "Destroy during error recovery failed");
            }
            Err(e) => return Err(e),
        }
        self.set_status(VmStatus::Stopped);
        info!(vm = %self.name, "VM stopped");
        Ok(())
    }

    /// Request graceful guest shutdown: Running -> Stopped.
    ///
    /// The guest may take time to honor the request; the transition is
    /// recorded once the hypervisor accepts it.
    pub async fn shutdown(&self) -> Result<()> {
        let inner = self.inner.lock().await;
        if self.status() != VmStatus::Running {
            return Err(self.invalid("shutdown"));
        }
        let domain = inner.domain.clone().ok_or_else(|| self.invalid("shutdown"))?;

        domain.shutdown().await?;
        self.set_status(VmStatus::Stopped);
        info!(vm = %self.name, "VM shutdown requested");
        Ok(())
    }

    /// Suspend the domain: Running -> Paused.
    pub async fn pause(&self) -> Result<()> {
        let inner = self.inner.lock().await;
        if self.status() != VmStatus::Running {
            return Err(self.invalid("pause"));
        }
        let domain = inner.domain.clone().ok_or_else(|| self.invalid("pause"))?;

        domain.suspend().await?;
        self.set_status(VmStatus::Paused);
        info!(vm = %self.name, "VM paused");
        Ok(())
    }

    /// Suspend the domain on a scaling decision: Running -> Suspended.
    ///
    /// Distinct from [`Vm::pause`] so an operator can tell a scaling-driven
    /// suspension apart from a manual one.
    pub async fn suspend(&self) -> Result<()> {
        let inner = self.inner.lock().await;
        if self.status() != VmStatus::Running {
            return Err(self.invalid("suspend"));
        }
        let domain = inner.domain.clone().ok_or_else(|| self.invalid("suspend"))?;

        domain.suspend().await?;
        self.set_status(VmStatus::Suspended);
        info!(vm = %self.name, "VM suspended");
        Ok(())
    }

    /// Resume the domain: Paused | Suspended -> Running.
    pub async fn resume(&self) -> Result<()> {
        let inner = self.inner.lock().await;
        let from = self.status();
        if from != VmStatus::Paused && from != VmStatus::Suspended {
            return Err(self.invalid("resume"));
        }
        let domain = inner.domain.clone().ok_or_else(|| self.invalid("resume"))?;

        domain.resume().await?;
        self.set_status(VmStatus::Running);
        info!(vm = %self.name, "VM resumed");
        Ok(())
    }

    /// Stop, wait, start.
    pub async fn restart(&self) -> Result<()> {
        self.stop().await?;
        tokio::time::sleep(RESTART_DELAY).await;
        self.start().await
    }

    /// Live-migrate to another hypervisor: Running -> Migrating -> Running.
    ///
    /// On success the old domain handle is dropped and the handle adopted
    /// from the destination replaces it. On failure the VM reverts to
    /// Running.
    pub async fn migrate(&self, dest_uri: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if self.status() != VmStatus::Running {
            return Err(self.invalid("migrate"));
        }

        self.set_status(VmStatus::Migrating);
        *self.migrating_since.lock().unwrap() = Some(Instant::now());
        info!(vm = %self.name, dest = %dest_uri, "Migration starting");

        let result = self.hypervisor.migrate_domain(&self.name, dest_uri).await;
        *self.migrating_since.lock().unwrap() = None;

        match result {
            Ok(new_domain) => {
                inner.domain = Some(new_domain);
                self.set_status(VmStatus::Running);
                info!(vm = %self.name, dest = %dest_uri, "Migration complete");
                Ok(())
            }
            Err(e) => {
                self.set_status(VmStatus::Running);
                error!(vm = %self.name, dest = %dest_uri, error = %e, "Migration failed");
                Err(e)
            }
        }
    }

    /// Change the live vCPU count. Admissible only in Running or Paused.
    pub async fn scale_cpu(&self, vcpus: u32) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let status = self.status();
        if status != VmStatus::Running && status != VmStatus::Paused {
            return Err(self.invalid("scale CPU for"));
        }
        let domain = inner.domain.clone().ok_or_else(|| self.invalid("scale CPU for"))?;

        if let Some(limit) = inner.limits.iter().find(|l| l.kind == ResourceKind::Cpu) {
            if !limit.admits(vcpus as u64) {
                return Err(VirtscaleError::ResourceExhausted {
                    reason: format!(
                        "{} vCPUs outside [{}, {}] for VM {}",
                        vcpus, limit.min, limit.max, self.name
                    ),
                });
            }
        }

        domain.set_vcpus(vcpus).await?;

        inner.config.vcpus = vcpus;
        if let Some(limit) = inner.limits.iter_mut().find(|l| l.kind == ResourceKind::Cpu) {
            limit.current = vcpus as u64;
        }
        self.apply_limits(&inner.limits);
        info!(vm = %self.name, vcpus, "CPU scaled");
        Ok(())
    }

    /// Change the memory allotment (balloon target), in MiB.
    pub async fn scale_memory(&self, memory_mb: u64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let status = self.status();
        if status != VmStatus::Running && status != VmStatus::Paused {
            return Err(self.invalid("scale memory for"));
        }
        let domain = inner.domain.clone().ok_or_else(|| self.invalid("scale memory for"))?;

        let memory_bytes = memory_mb * 1024 * 1024;
        if let Some(limit) = inner.limits.iter().find(|l| l.kind == ResourceKind::Memory) {
            if !limit.admits(memory_bytes) {
                return Err(VirtscaleError::ResourceExhausted {
                    reason: format!(
                        "{} MiB outside [{}, {}] bytes for VM {}",
                        memory_mb, limit.min, limit.max, self.name
                    ),
                });
            }
        }

        domain.set_memory_kib(memory_mb * 1024).await?;

        inner.config.memory_mb = memory_mb;
        if let Some(limit) = inner.limits.iter_mut().find(|l| l.kind == ResourceKind::Memory) {
            limit.current = memory_bytes;
        }
        self.apply_limits(&inner.limits);
        info!(vm = %self.name, memory_mb, "Memory scaled");
        Ok(())
    }

    /// Capture a snapshot; admissible in Running or Paused for consistency.
    pub async fn create_snapshot(&self, name: &str, description: &str) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let status = self.status();
        if status != VmStatus::Running && status != VmStatus::Paused {
            return Err(self.invalid("snapshot"));
        }
        let domain = inner.domain.clone().ok_or_else(|| self.invalid("snapshot"))?;

        domain.snapshot_create(&xml::snapshot_xml(name, description)).await?;

        let parent = inner.snapshots.last().map(|s| s.name.clone());
        let disk_size_bytes =
            std::fs::metadata(&inner.config.image_path).map(|m| m.len()).unwrap_or(0);
        inner.snapshots.push(VmSnapshot {
            name: name.to_string(),
            description: description.to_string(),
            created_at: SystemTime::now(),
            parent,
            disk_size_bytes,
            vm_state: status,
        });
        info!(vm = %self.name, snapshot = %name, "Snapshot created");
        Ok(())
    }

    /// Revert to a named snapshot and restore the status captured with it.
    pub async fn revert_to_snapshot(&self, name: &str) -> Result<()> {
        let inner = self.inner.lock().await;
        let domain = inner.domain.clone().ok_or_else(|| self.invalid("revert"))?;

        domain.snapshot_revert(name).await?;

        if let Some(meta) = inner.snapshots.iter().find(|s| s.name == name) {
            self.set_status(meta.vm_state);
        }
        info!(vm = %self.name, snapshot = %name, "Reverted to snapshot");
        Ok(())
    }

    /// Drop snapshot metadata older than `max_age`. Returns how many were
    /// pruned.
    pub async fn prune_snapshots(&self, max_age: Duration) -> usize {
        let mut inner = self.inner.lock().await;
        let before = inner.snapshots.len();
        let now = SystemTime::now();
        inner.snapshots.retain(|s| match now.duration_since(s.created_at) {
            Ok(age) => age < max_age,
            Err(_) => true,
        });
        before - inner.snapshots.len()
    }

    /// Translate the resource limit set into cgroup writes.
    fn apply_limits(&self, limits: &[ResourceLimit]) {
        apply_limits_to(&self.cgroup, &self.name, limits);
    }
}

/// Apply each resource limit independently; a failed write is logged and
/// does not abort the remaining kinds.
fn apply_limits_to(cgroup: &CgroupController, vm_name: &str, limits: &[ResourceLimit]) {
    for limit in limits {
        let result = match limit.kind {
            ResourceKind::Cpu => cgroup
                .set_cpu_limit(limit.current * 100_000, 100_000)
                .and_then(|()| cgroup.set_cpu_weight(DEFAULT_CPU_WEIGHT)),
            ResourceKind::Memory => cgroup
                .set_memory_limit(limit.current)
                .and_then(|()| cgroup.set_memory_swappiness(DEFAULT_SWAPPINESS)),
            ResourceKind::Io => cgroup.set_io_limit(DEFAULT_IO_DEVICE, limit.current, limit.current),
            // No cgroup v2 file for network throughput.
            ResourceKind::Network => Ok(()),
        };
        if let Err(e) = result {
            warn!(vm = %vm_name, kind = %limit.kind, error = %e, "Failed to apply resource limit");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::fake::FakeHypervisor;
    use tempfile::TempDir;

    struct Fixture {
        _cgroup_root: TempDir,
        _images: TempDir,
        hv: Arc<FakeHypervisor>,
        vm: Vm,
    }

    fn fixture() -> Fixture {
        fixture_with_limits(vec![
            ResourceLimit::cpu(1, 16, 2),
            ResourceLimit::memory(512 << 20, 16 << 30, 2 << 30),
        ])
    }

    fn fixture_with_limits(limits: Vec<ResourceLimit>) -> Fixture {
        let cgroup_root = TempDir::new().unwrap();
        let images = TempDir::new().unwrap();
        let image_path = images.path().join("vm1.qcow2");
        std::fs::write(&image_path, b"qcow2").unwrap();

        let hv = Arc::new(FakeHypervisor::new("fake:///system"));
        let handle = HypervisorHandle::with_backend(hv.clone());
        let config = VmConfig {
            name: "vm1".to_string(),
            image_path,
            limits,
            ..Default::default()
        };
        let vm = Vm::new(handle, cgroup_root.path(), config).unwrap();
        Fixture { _cgroup_root: cgroup_root, _images: images, hv, vm }
    }

    #[tokio::test]
    async fn create_start_stop() {
        let f = fixture();
        assert_eq!(f.vm.status(), VmStatus::Stopped);

        f.vm.create().await.unwrap();
        assert_eq!(f.vm.status(), VmStatus::Stopped);
        assert!(!f.vm.uuid().await.is_empty());

        f.vm.start().await.unwrap();
        assert_eq!(f.vm.status(), VmStatus::Running);

        f.vm.stop().await.unwrap();
        assert_eq!(f.vm.status(), VmStatus::Stopped);
    }

    #[tokio::test]
    async fn stop_is_idempotent() {
        let f = fixture();
        f.vm.create().await.unwrap();
        // stop from Stopped is a no-op, and start-then-stop equals stop
        f.vm.stop().await.unwrap();
        assert_eq!(f.vm.status(), VmStatus::Stopped);
        f.vm.start().await.unwrap();
        f.vm.stop().await.unwrap();
        f.vm.stop().await.unwrap();
        assert_eq!(f.vm.status(), VmStatus::Stopped);
    }

    #[tokio::test]
    async fn create_requires_stopped() {
        let f = fixture();
        f.vm.create().await.unwrap();
        f.vm.start().await.unwrap();
        let err = f.vm.create().await.unwrap_err();
        assert!(matches!(err, VirtscaleError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn create_with_missing_image_is_config_error() {
        let f = fixture();
        let images = TempDir::new().unwrap();
        let config = VmConfig {
            name: "vm2".to_string(),
            image_path: images.path().join("missing.qcow2"),
            ..Default::default()
        };
        let vm = Vm::new(
            HypervisorHandle::with_backend(f.hv.clone()),
            f._cgroup_root.path(),
            config,
        )
        .unwrap();

        let err = vm.create().await.unwrap_err();
        assert!(matches!(err, VirtscaleError::Configuration { .. }));
        assert_eq!(vm.status(), VmStatus::Stopped);
    }

    #[tokio::test]
    async fn pause_resume_preserves_limits() {
        let f = fixture();
        f.vm.create().await.unwrap();
        f.vm.start().await.unwrap();

        let before = f.vm.resource_limits().await;
        f.vm.pause().await.unwrap();
        assert_eq!(f.vm.status(), VmStatus::Paused);
        f.vm.resume().await.unwrap();
        assert_eq!(f.vm.status(), VmStatus::Running);
        assert_eq!(f.vm.resource_limits().await, before);
    }

    #[tokio::test]
    async fn suspend_resume_roundtrip() {
        let f = fixture();
        f.vm.create().await.unwrap();
        f.vm.start().await.unwrap();

        f.vm.suspend().await.unwrap();
        assert_eq!(f.vm.status(), VmStatus::Suspended);
        f.vm.resume().await.unwrap();
        assert_eq!(f.vm.status(), VmStatus::Running);
    }

    #[tokio::test]
    async fn pause_requires_running() {
        let f = fixture();
        f.vm.create().await.unwrap();
        let err = f.vm.pause().await.unwrap_err();
        assert!(matches!(err, VirtscaleError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn scale_cpu_updates_limit_and_domain() {
        let f = fixture();
        f.vm.create().await.unwrap();
        f.vm.start().await.unwrap();

        f.vm.scale_cpu(3).await.unwrap();
        let limits = f.vm.resource_limits().await;
        let cpu = limits.iter().find(|l| l.kind == ResourceKind::Cpu).unwrap();
        assert_eq!(cpu.current, 3);
        assert_eq!(f.hv.domain("vm1").unwrap().info().await.unwrap().vcpus, 3);
        // cgroup cpu.max reflects the new core count
        let cpu_max = std::fs::read_to_string(f.vm.cgroup().path().join("cpu.max")).unwrap();
        assert_eq!(cpu_max, "300000 100000");
    }

    #[tokio::test]
    async fn scale_cpu_rejects_out_of_range() {
        let f = fixture();
        f.vm.create().await.unwrap();
        f.vm.start().await.unwrap();

        let err = f.vm.scale_cpu(32).await.unwrap_err();
        assert!(matches!(err, VirtscaleError::ResourceExhausted { .. }));
        let err = f.vm.scale_cpu(0).await.unwrap_err();
        assert!(matches!(err, VirtscaleError::ResourceExhausted { .. }));
    }

    #[tokio::test]
    async fn scale_requires_running_or_paused() {
        let f = fixture();
        f.vm.create().await.unwrap();
        let err = f.vm.scale_cpu(4).await.unwrap_err();
        assert!(matches!(err, VirtscaleError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn migration_failure_reverts_to_running() {
        let f = fixture();
        f.vm.create().await.unwrap();
        f.vm.start().await.unwrap();

        let err = f.vm.migrate("qemu+ssh://unreachable/system").await.unwrap_err();
        assert!(matches!(err, VirtscaleError::Connection { .. }));
        assert_eq!(f.vm.status(), VmStatus::Running);
        assert!(f.vm.migrating_for().is_none());
    }

    #[tokio::test]
    async fn migration_success_adopts_new_handle() {
        let f = fixture();
        f.vm.create().await.unwrap();
        f.vm.start().await.unwrap();

        f.vm.migrate("fake:///other").await.unwrap();
        assert_eq!(f.vm.status(), VmStatus::Running);
        assert_eq!(f.hv.domain("vm1").unwrap().migrations(), 1);
    }

    #[tokio::test]
    async fn snapshot_revert_restores_captured_state() {
        let f = fixture();
        f.vm.create().await.unwrap();
        f.vm.start().await.unwrap();

        f.vm.create_snapshot("snap1", "while running").await.unwrap();
        f.vm.pause().await.unwrap();
        f.vm.revert_to_snapshot("snap1").await.unwrap();
        assert_eq!(f.vm.status(), VmStatus::Running);

        let snaps = f.vm.snapshots().await;
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].vm_state, VmStatus::Running);
        assert!(snaps[0].disk_size_bytes > 0);
    }

    #[tokio::test]
    async fn snapshot_chain_records_parent() {
        let f = fixture();
        f.vm.create().await.unwrap();
        f.vm.start().await.unwrap();

        f.vm.create_snapshot("a", "").await.unwrap();
        f.vm.create_snapshot("b", "").await.unwrap();
        let snaps = f.vm.snapshots().await;
        assert_eq!(snaps[0].parent, None);
        assert_eq!(snaps[1].parent.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn prune_drops_old_snapshot_metadata() {
        let f = fixture();
        f.vm.create().await.unwrap();
        f.vm.start().await.unwrap();
        f.vm.create_snapshot("old", "").await.unwrap();

        assert_eq!(f.vm.prune_snapshots(Duration::from_secs(0)).await, 1);
        assert!(f.vm.snapshots().await.is_empty());
    }

    #[tokio::test]
    async fn start_failure_parks_in_error() {
        let f = fixture();
        f.vm.create().await.unwrap();
        f.hv.domain("vm1").unwrap().fail_next_ops(1);

        assert!(f.vm.start().await.is_err());
        assert_eq!(f.vm.status(), VmStatus::Error);
    }
}
