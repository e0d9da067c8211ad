//! Periodic resource monitor.
//!
//! A single 1 Hz loop samples every Running VM (domain cpu-time differenced
//! into an instantaneous percentage, balloon memory stats, block/interface
//! byte rates) plus host-level telemetry, maintains the per-VM time series
//! and publishes each fresh snapshot on broadcast channels. A failed tick
//! backs the loop off to 5 s until a tick succeeds again.

pub mod host;

use crate::manager::VmManager;
use crate::types::metrics::{HostMetrics, ResourceUsage, VmMetrics};
use crate::types::vm::VmStatus;
use host::HostSampler;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Default sampling cadence.
pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(1);

/// Cadence after a failed tick, until a tick succeeds.
pub const ERROR_BACKOFF: Duration = Duration::from_secs(5);

/// Hard cap on the per-VM usage history.
const HISTORY_CAPACITY: usize = 1000;

/// Buffered snapshots per subscriber.
const METRICS_BUFFER_SIZE: usize = 256;

/// Previous cumulative counters used for rate differencing.
struct PrevCounters {
    cpu_time_ns: u64,
    block_read_bytes: u64,
    block_write_bytes: u64,
    net_rx_bytes: u64,
    net_tx_bytes: u64,
    sampled_at: Instant,
}

#[derive(Default)]
struct MonitorState {
    metrics: HashMap<String, VmMetrics>,
    history: HashMap<String, VecDeque<ResourceUsage>>,
    prev: HashMap<String, PrevCounters>,
    host: HostMetrics,
}

/// Periodic sampler of per-VM and host metrics.
pub struct Monitor {
    manager: Arc<VmManager>,
    interval: Duration,
    state: Mutex<MonitorState>,
    host_sampler: Mutex<HostSampler>,
    metrics_tx: broadcast::Sender<VmMetrics>,
    host_tx: broadcast::Sender<HostMetrics>,
}

impl Monitor {
    pub fn new(manager: Arc<VmManager>) -> Self {
        Self::with_interval(manager, DEFAULT_INTERVAL)
    }

    pub fn with_interval(manager: Arc<VmManager>, interval: Duration) -> Self {
        let (metrics_tx, _) = broadcast::channel(METRICS_BUFFER_SIZE);
        let (host_tx, _) = broadcast::channel(METRICS_BUFFER_SIZE);
        Self {
            manager,
            interval,
            state: Mutex::new(MonitorState::default()),
            host_sampler: Mutex::new(HostSampler::new()),
            metrics_tx,
            host_tx,
        }
    }

    /// Subscribe to per-VM metric snapshots.
    pub fn subscribe_metrics(&self) -> broadcast::Receiver<VmMetrics> {
        self.metrics_tx.subscribe()
    }

    /// Subscribe to host metric snapshots.
    pub fn subscribe_host_metrics(&self) -> broadcast::Receiver<HostMetrics> {
        self.host_tx.subscribe()
    }

    /// Latest metrics for one VM, by value.
    pub fn vm_metrics(&self, vm_name: &str) -> Option<VmMetrics> {
        self.state.lock().unwrap().metrics.get(vm_name).cloned()
    }

    /// Latest metrics for every sampled VM, by value.
    pub fn all_vm_metrics(&self) -> HashMap<String, VmMetrics> {
        self.state.lock().unwrap().metrics.clone()
    }

    /// Latest host metrics.
    pub fn host_metrics(&self) -> HostMetrics {
        self.state.lock().unwrap().host
    }

    /// Up to `max_points` most recent usage samples for one VM.
    pub fn vm_history(&self, vm_name: &str, max_points: usize) -> Vec<ResourceUsage> {
        let state = self.state.lock().unwrap();
        match state.history.get(vm_name) {
            Some(history) => {
                let skip = history.len().saturating_sub(max_points);
                history.iter().skip(skip).copied().collect()
            }
            None => Vec::new(),
        }
    }

    /// Drop all series for one VM.
    pub fn clear_vm(&self, vm_name: &str) {
        let mut state = self.state.lock().unwrap();
        state.metrics.remove(vm_name);
        state.history.remove(vm_name);
        state.prev.remove(vm_name);
    }

    /// Sampling loop. Runs until the shutdown channel fires.
    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        info!(interval_secs = self.interval.as_secs(), "Monitor started");
        let mut delay = self.interval;

        loop {
            tokio::select! {
                _ = tokio::time::sleep(delay) => {
                    let healthy = self.sample_all().await;
                    delay = if healthy {
                        self.interval
                    } else {
                        debug!(backoff_secs = ERROR_BACKOFF.as_secs(), "Backing off after failed tick");
                        ERROR_BACKOFF
                    };
                }
                _ = shutdown.recv() => {
                    info!("Monitor stopped");
                    return;
                }
            }
        }
    }

    /// Sample every Running VM plus the host. Returns false when any VM
    /// sample failed this tick.
    pub async fn sample_all(&self) -> bool {
        let vms = self.manager.vms_snapshot();
        let registered: Vec<String> = vms.iter().map(|vm| vm.name().to_string()).collect();

        // Series for VMs that left the registry die with them.
        {
            let mut state = self.state.lock().unwrap();
            state.metrics.retain(|name, _| registered.contains(name));
            state.history.retain(|name, _| registered.contains(name));
            state.prev.retain(|name, _| registered.contains(name));
        }

        let mut healthy = true;
        let mut io_total = 0u64;
        let mut net_total = 0u64;

        for vm in vms {
            if vm.status() != VmStatus::Running {
                continue;
            }
            match self.sample_vm(vm.name(), &vm).await {
                Ok(Some(snapshot)) => {
                    io_total += snapshot.usage.io_read_bps + snapshot.usage.io_write_bps;
                    net_total += snapshot.usage.network_rx_bps + snapshot.usage.network_tx_bps;
                    // Publishing with no subscribers is fine.
                    let _ = self.metrics_tx.send(snapshot);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(vm = %vm.name(), error = %e, "Sample failed, skipping VM this tick");
                    healthy = false;
                }
            }
        }

        let host = self.host_sampler.lock().unwrap().sample(io_total, net_total);
        self.state.lock().unwrap().host = host;
        let _ = self.host_tx.send(host);

        healthy
    }

    async fn sample_vm(
        &self,
        name: &str,
        vm: &Arc<crate::vm::Vm>,
    ) -> crate::error::Result<Option<VmMetrics>> {
        let Some(domain) = vm.domain().await else {
            return Ok(None);
        };

        let info = domain.info().await?;
        let memory = domain.memory_stats().await?;
        // Byte counters may be unsupported by a backend; missing telemetry
        // reads as zero rather than failing the tick.
        let block = domain.block_stats().await.unwrap_or_default();
        let net = domain.interface_stats().await.unwrap_or_default();

        let sampled_at = Instant::now();
        let timestamp = SystemTime::now();

        let mut state = self.state.lock().unwrap();

        let (cpu_percent, io_read_bps, io_write_bps, network_rx_bps, network_tx_bps) =
            match state.prev.get(name) {
                Some(prev) => {
                    let elapsed = sampled_at.duration_since(prev.sampled_at).as_secs_f64();
                    if elapsed > 0.0 {
                        let cpu_delta_ns = info.cpu_time_ns.saturating_sub(prev.cpu_time_ns);
                        let cpu = 100.0 * cpu_delta_ns as f64 / (elapsed * 1e9);
                        let rate = |cur: u64, prev_val: u64| {
                            (cur.saturating_sub(prev_val) as f64 / elapsed) as u64
                        };
                        (
                            cpu,
                            rate(block.read_bytes, prev.block_read_bytes),
                            rate(block.write_bytes, prev.block_write_bytes),
                            rate(net.rx_bytes, prev.net_rx_bytes),
                            rate(net.tx_bytes, prev.net_tx_bytes),
                        )
                    } else {
                        (0.0, 0, 0, 0, 0)
                    }
                }
                None => (0.0, 0, 0, 0, 0),
            };

        state.prev.insert(
            name.to_string(),
            PrevCounters {
                cpu_time_ns: info.cpu_time_ns,
                block_read_bytes: block.read_bytes,
                block_write_bytes: block.write_bytes,
                net_rx_bytes: net.rx_bytes,
                net_tx_bytes: net.tx_bytes,
                sampled_at,
            },
        );

        let usage = ResourceUsage {
            cpu_percent,
            memory_bytes: memory.actual_balloon_kib.unwrap_or(info.memory_kib) * 1024,
            memory_max_bytes: memory.usable_kib.unwrap_or(info.max_memory_kib) * 1024,
            io_read_bps,
            io_write_bps,
            network_rx_bps,
            network_tx_bps,
            timestamp,
            sampled_at,
        };

        let metrics = state
            .metrics
            .entry(name.to_string())
            .or_insert_with(|| VmMetrics::new(name));
        metrics.push(usage);
        let snapshot = metrics.clone();

        let history = state.history.entry(name.to_string()).or_default();
        history.push_back(usage);
        if history.len() > HISTORY_CAPACITY {
            history.pop_front();
        }

        Ok(Some(snapshot))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::fake::FakeHypervisor;
    use crate::hypervisor::HypervisorHandle;
    use crate::types::scaling::ResourceLimit;
    use crate::types::vm::VmConfig;
    use tempfile::TempDir;

    struct Fixture {
        _cgroup_root: TempDir,
        _images: TempDir,
        hv: Arc<FakeHypervisor>,
        manager: Arc<VmManager>,
        monitor: Arc<Monitor>,
    }

    async fn fixture_with_running_vm(name: &str) -> Fixture {
        let cgroup_root = TempDir::new().unwrap();
        let images = TempDir::new().unwrap();
        let image_path = images.path().join("disk.qcow2");
        std::fs::write(&image_path, b"qcow2").unwrap();

        let hv = Arc::new(FakeHypervisor::new("fake:///system"));
        let manager = Arc::new(VmManager::new(
            HypervisorHandle::with_backend(hv.clone()),
            cgroup_root.path().to_path_buf(),
        ));
        let monitor = Arc::new(Monitor::new(manager.clone()));

        let config = VmConfig {
            name: name.to_string(),
            image_path,
            limits: vec![ResourceLimit::cpu(1, 16, 2)],
            ..Default::default()
        };
        manager.create_vm(config).await.unwrap();
        manager.start_vm(name).await.unwrap();

        Fixture { _cgroup_root: cgroup_root, _images: images, hv, manager, monitor }
    }

    #[tokio::test]
    async fn sample_produces_metrics_with_memory_budget() {
        let f = fixture_with_running_vm("vm1").await;

        assert!(f.monitor.sample_all().await);
        let metrics = f.monitor.vm_metrics("vm1").unwrap();
        assert_eq!(metrics.vm_name, "vm1");
        assert!(metrics.usage.memory_max_bytes > 0);
        assert_eq!(metrics.cpu_history.len(), 1);
    }

    #[tokio::test]
    async fn cpu_percent_is_differenced_from_cpu_time() {
        let f = fixture_with_running_vm("vm1").await;

        assert!(f.monitor.sample_all().await);
        // Simulate half a core of guest cpu-time over the inter-sample gap.
        tokio::time::sleep(Duration::from_millis(50)).await;
        f.hv.domain("vm1").unwrap().advance_cpu_time(25_000_000);
        assert!(f.monitor.sample_all().await);

        let metrics = f.monitor.vm_metrics("vm1").unwrap();
        assert!(metrics.usage.cpu_percent > 0.0);
        assert!(metrics.usage.cpu_percent <= 100.0);
    }

    #[tokio::test]
    async fn stopped_vms_are_not_sampled() {
        let f = fixture_with_running_vm("vm1").await;
        f.manager.stop_vm("vm1").await.unwrap();

        assert!(f.monitor.sample_all().await);
        assert!(f.monitor.vm_metrics("vm1").is_none());
    }

    #[tokio::test]
    async fn removed_vm_series_are_cleared() {
        let f = fixture_with_running_vm("vm1").await;
        assert!(f.monitor.sample_all().await);
        assert!(f.monitor.vm_metrics("vm1").is_some());

        f.manager.remove_vm("vm1").await.unwrap();
        assert!(f.monitor.sample_all().await);
        assert!(f.monitor.vm_metrics("vm1").is_none());
        assert!(f.monitor.vm_history("vm1", 10).is_empty());
    }

    #[tokio::test]
    async fn history_is_capped_and_tail_ordered() {
        let f = fixture_with_running_vm("vm1").await;
        for _ in 0..5 {
            assert!(f.monitor.sample_all().await);
        }

        let history = f.monitor.vm_history("vm1", 3);
        assert_eq!(history.len(), 3);
        let full = f.monitor.vm_history("vm1", usize::MAX);
        assert_eq!(full.len(), 5);
        // Timestamps are strictly monotonic per VM.
        for pair in full.windows(2) {
            assert!(pair[1].sampled_at > pair[0].sampled_at);
        }
    }

    #[tokio::test]
    async fn snapshots_are_published_to_subscribers() {
        let f = fixture_with_running_vm("vm1").await;
        let mut rx = f.monitor.subscribe_metrics();
        let mut host_rx = f.monitor.subscribe_host_metrics();

        assert!(f.monitor.sample_all().await);

        let snapshot = rx.recv().await.unwrap();
        assert_eq!(snapshot.vm_name, "vm1");
        let host = host_rx.recv().await.unwrap();
        assert!(host.disk_usage_percent <= 100);
    }
}
