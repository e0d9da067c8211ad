//! VM registry and lifecycle orchestration.
//!
//! [`VmManager`] is the authoritative registry of VMs keyed by unique name
//! and the only mutator of the VM set. The registry lock covers lookup and
//! registration only and is never held across a hypervisor call; the per-VM
//! mutex inside [`Vm`] guards the actual transition.

use crate::error::{Result, VirtscaleError};
use crate::hypervisor::{DomainState, HypervisorHandle};
use crate::types::scaling::ResourceLimit;
use crate::types::vm::{VmConfig, VmSnapshot, VmStatus};
use crate::vm::Vm;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Buffered status events per subscriber.
const STATUS_BUFFER_SIZE: usize = 256;

/// Cadence of the background health loop.
const HEALTH_INTERVAL: Duration = Duration::from_secs(5);

/// Delay between the stop and start halves of an error recovery.
const RECOVERY_DELAY: Duration = Duration::from_secs(2);

/// A migration in flight longer than this gets probed for progress.
const MIGRATION_STUCK_THRESHOLD: Duration = Duration::from_secs(120);

/// Snapshot metadata older than this is garbage-collected.
const SNAPSHOT_MAX_AGE: Duration = Duration::from_secs(30 * 24 * 3600);

/// Status change notification delivered to subscribers.
#[derive(Debug, Clone)]
pub struct StatusEvent {
    pub vm_name: String,
    pub status: VmStatus,
}

/// Registry of VMs on this host.
pub struct VmManager {
    hypervisor: HypervisorHandle,
    cgroup_root: PathBuf,
    vms: RwLock<HashMap<String, Arc<Vm>>>,
    status_tx: broadcast::Sender<StatusEvent>,
}

impl VmManager {
    pub fn new(hypervisor: HypervisorHandle, cgroup_root: PathBuf) -> Self {
        let (status_tx, _) = broadcast::channel(STATUS_BUFFER_SIZE);
        Self { hypervisor, cgroup_root, vms: RwLock::new(HashMap::new()), status_tx }
    }

    /// Subscribe to VM status change events.
    pub fn subscribe_status(&self) -> broadcast::Receiver<StatusEvent> {
        self.status_tx.subscribe()
    }

    fn notify(&self, vm_name: &str, status: VmStatus) {
        // No subscribers is fine.
        let _ = self
            .status_tx
            .send(StatusEvent { vm_name: vm_name.to_string(), status });
    }

    /// Adopt domains that already exist on the hypervisor (active and
    /// defined-but-inactive). Returns how many were adopted.
    pub async fn load_existing(&self) -> Result<usize> {
        let records = self.hypervisor.list_domains().await?;
        let mut adopted = 0;

        for record in records {
            if self.vms.read().unwrap().contains_key(&record.name) {
                continue;
            }

            let domain = match self.hypervisor.lookup_domain(&record.name).await {
                Ok(domain) => domain,
                Err(e) => {
                    warn!(vm = %record.name, error = %e, "Failed to look up existing domain");
                    continue;
                }
            };

            let status = match record.state {
                DomainState::Running => VmStatus::Running,
                DomainState::Paused => VmStatus::Paused,
                _ => VmStatus::Stopped,
            };
            let config = VmConfig {
                name: record.name.clone(),
                vcpus: record.vcpus,
                memory_mb: record.memory_kib / 1024,
                ..Default::default()
            };

            let vm = match Vm::adopt(self.hypervisor.clone(), &self.cgroup_root, config, domain, status)
            {
                Ok(vm) => Arc::new(vm),
                Err(e) => {
                    warn!(vm = %record.name, error = %e, "Failed to adopt existing domain");
                    continue;
                }
            };

            self.vms.write().unwrap().insert(record.name.clone(), vm);
            self.notify(&record.name, status);
            info!(vm = %record.name, status = %status, "Adopted existing domain");
            adopted += 1;
        }

        Ok(adopted)
    }

    /// Define a new VM from a declarative config and register it Stopped.
    pub async fn create_vm(&self, config: VmConfig) -> Result<()> {
        if config.name.is_empty() {
            return Err(VirtscaleError::Configuration { reason: "VM name is empty".to_string() });
        }
        if self.vms.read().unwrap().contains_key(&config.name) {
            return Err(VirtscaleError::AlreadyExists { name: config.name });
        }

        let name = config.name.clone();
        let vm = Arc::new(Vm::new(self.hypervisor.clone(), &self.cgroup_root, config)?);
        vm.create().await?;

        let mut vms = self.vms.write().unwrap();
        if vms.contains_key(&name) {
            return Err(VirtscaleError::AlreadyExists { name });
        }
        vms.insert(name.clone(), vm);
        drop(vms);

        self.notify(&name, VmStatus::Stopped);
        Ok(())
    }

    /// Look up a VM by name.
    pub fn lookup(&self, name: &str) -> Result<Arc<Vm>> {
        self.vms
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| VirtscaleError::DomainNotFound { name: name.to_string() })
    }

    pub async fn start_vm(&self, name: &str) -> Result<()> {
        let vm = self.lookup(name)?;
        vm.start().await?;
        self.notify(name, VmStatus::Running);
        Ok(())
    }

    pub async fn stop_vm(&self, name: &str) -> Result<()> {
        let vm = self.lookup(name)?;
        vm.stop().await?;
        self.notify(name, VmStatus::Stopped);
        Ok(())
    }

    pub async fn shutdown_vm(&self, name: &str) -> Result<()> {
        let vm = self.lookup(name)?;
        vm.shutdown().await?;
        self.notify(name, VmStatus::Stopped);
        Ok(())
    }

    pub async fn pause_vm(&self, name: &str) -> Result<()> {
        let vm = self.lookup(name)?;
        vm.pause().await?;
        self.notify(name, VmStatus::Paused);
        Ok(())
    }

    pub async fn resume_vm(&self, name: &str) -> Result<()> {
        let vm = self.lookup(name)?;
        vm.resume().await?;
        self.notify(name, VmStatus::Running);
        Ok(())
    }

    /// Suspend a VM on behalf of a scaling decision.
    pub async fn suspend_vm(&self, name: &str) -> Result<()> {
        let vm = self.lookup(name)?;
        vm.suspend().await?;
        self.notify(name, VmStatus::Suspended);
        Ok(())
    }

    pub async fn restart_vm(&self, name: &str) -> Result<()> {
        let vm = self.lookup(name)?;
        vm.restart().await?;
        self.notify(name, VmStatus::Running);
        Ok(())
    }

    pub async fn migrate_vm(&self, name: &str, dest_uri: &str) -> Result<()> {
        let vm = self.lookup(name)?;
        vm.migrate(dest_uri).await?;
        self.notify(name, VmStatus::Running);
        Ok(())
    }

    pub async fn scale_vm_cpu(&self, name: &str, vcpus: u32) -> Result<()> {
        self.lookup(name)?.scale_cpu(vcpus).await
    }

    pub async fn scale_vm_memory(&self, name: &str, memory_mb: u64) -> Result<()> {
        self.lookup(name)?.scale_memory(memory_mb).await
    }

    pub async fn create_snapshot(&self, name: &str, snapshot: &str, description: &str) -> Result<()> {
        self.lookup(name)?.create_snapshot(snapshot, description).await
    }

    pub async fn revert_to_snapshot(&self, name: &str, snapshot: &str) -> Result<()> {
        self.lookup(name)?.revert_to_snapshot(snapshot).await
    }

    pub async fn vm_snapshots(&self, name: &str) -> Result<Vec<VmSnapshot>> {
        Ok(self.lookup(name)?.snapshots().await)
    }

    pub fn vm_status(&self, name: &str) -> Result<VmStatus> {
        Ok(self.lookup(name)?.status())
    }

    pub async fn resource_limits(&self, name: &str) -> Result<Vec<ResourceLimit>> {
        Ok(self.lookup(name)?.resource_limits().await)
    }

    /// Names of all registered VMs.
    pub fn list_vms(&self) -> Vec<String> {
        self.vms.read().unwrap().keys().cloned().collect()
    }

    /// Point-in-time snapshot of the registered VMs.
    pub fn vms_snapshot(&self) -> Vec<Arc<Vm>> {
        self.vms.read().unwrap().values().cloned().collect()
    }

    /// Stop a VM, detach it from the registry and hand ownership back to
    /// the caller, who controls final teardown (and thus cgroup release).
    pub async fn remove_vm(&self, name: &str) -> Result<Arc<Vm>> {
        let vm = self.lookup(name)?;
        if let Err(e) = vm.stop().await {
            warn!(vm = %name, error = %e, "Stop during removal failed");
        }

        let removed = self
            .vms
            .write()
            .unwrap()
            .remove(name)
            .ok_or_else(|| VirtscaleError::DomainNotFound { name: name.to_string() })?;

        self.notify(name, VmStatus::Stopped);
        info!(vm = %name, "VM removed from registry");
        Ok(removed)
    }

    /// Background health and maintenance loop.
    ///
    /// Every 5 s: attempt a stop+start recovery for VMs in Error, probe
    /// long-running migrations through the hypervisor, and prune snapshot
    /// metadata older than 30 days.
    pub async fn run_health_loop(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(HEALTH_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("VM health loop started");

        loop {
            tokio::select! {
                _ = ticker.tick() => self.health_tick().await,
                _ = shutdown.recv() => {
                    info!("VM health loop stopped");
                    return;
                }
            }
        }
    }

    async fn health_tick(&self) {
        for vm in self.vms_snapshot() {
            match vm.status() {
                VmStatus::Error => {
                    warn!(vm = %vm.name(), "VM in error state, attempting recovery");
                    if let Err(e) = vm.stop().await {
                        warn!(vm = %vm.name(), error = %e, "Recovery stop failed");
                        continue;
                    }
                    tokio::time::sleep(RECOVERY_DELAY).await;
                    match vm.start().await {
                        Ok(()) => {
                            info!(vm = %vm.name(), "VM recovered");
                            self.notify(vm.name(), VmStatus::Running);
                        }
                        Err(e) => warn!(vm = %vm.name(), error = %e, "Recovery start failed"),
                    }
                }
                VmStatus::Migrating => {
                    if vm.migrating_for().unwrap_or_default() > MIGRATION_STUCK_THRESHOLD {
                        // Probe through the hypervisor; the per-VM mutex is
                        // held by the in-flight migration.
                        match self.hypervisor.lookup_domain(vm.name()).await {
                            Ok(domain) => match domain.info().await {
                                Ok(info) => debug!(
                                    vm = %vm.name(),
                                    state = ?info.state,
                                    "Long-running migration probe"
                                ),
                                Err(e) => {
                                    warn!(vm = %vm.name(), error = %e, "Migration probe failed")
                                }
                            },
                            Err(e) => warn!(vm = %vm.name(), error = %e, "Migration probe failed"),
                        }
                    }
                }
                _ => {
                    let pruned = vm.prune_snapshots(SNAPSHOT_MAX_AGE).await;
                    if pruned > 0 {
                        debug!(vm = %vm.name(), pruned, "Pruned old snapshot metadata");
                    }
                }
            }
        }
    }
}
