//! Metric sample types and per-VM time series.

use std::collections::VecDeque;
use std::time::{Instant, SystemTime};

/// Ring capacity for the per-VM cpu and memory sample histories.
pub const SAMPLE_RING_CAPACITY: usize = 300;

/// Window (in samples) for the 5-minute moving average.
pub const AVG_5MIN_WINDOW: usize = 60;

/// Window (in samples) for the 15-minute moving average.
pub const AVG_15MIN_WINDOW: usize = 180;

/// One resource usage sample. Immutable once produced.
#[derive(Debug, Clone, Copy)]
pub struct ResourceUsage {
    /// Instantaneous CPU usage, 0-100 per vCPU (may exceed 100 on SMP guests)
    pub cpu_percent: f64,

    /// Resident memory in bytes (balloon ACTUAL_BALLOON)
    pub memory_bytes: u64,

    /// Memory budget in bytes (balloon USABLE)
    pub memory_max_bytes: u64,

    /// Disk read rate in bytes per second
    pub io_read_bps: u64,

    /// Disk write rate in bytes per second
    pub io_write_bps: u64,

    /// Network receive rate in bytes per second
    pub network_rx_bps: u64,

    /// Network transmit rate in bytes per second
    pub network_tx_bps: u64,

    /// Wall-clock time of the sample
    pub timestamp: SystemTime,

    /// Monotonic time of the sample (strictly increasing per VM)
    pub sampled_at: Instant,
}

impl ResourceUsage {
    /// Memory usage as a percentage of the budget, or 0 when unknown.
    pub fn memory_percent(&self) -> f64 {
        if self.memory_max_bytes == 0 {
            return 0.0;
        }
        100.0 * self.memory_bytes as f64 / self.memory_max_bytes as f64
    }
}

impl Default for ResourceUsage {
    fn default() -> Self {
        Self {
            cpu_percent: 0.0,
            memory_bytes: 0,
            memory_max_bytes: 0,
            io_read_bps: 0,
            io_write_bps: 0,
            network_rx_bps: 0,
            network_tx_bps: 0,
            timestamp: SystemTime::now(),
            sampled_at: Instant::now(),
        }
    }
}

/// Per-VM metric series: latest sample, bounded rings and moving averages.
///
/// Averages are recomputed on every push.
#[derive(Debug, Clone)]
pub struct VmMetrics {
    /// VM name
    pub vm_name: String,

    /// Latest sample
    pub usage: ResourceUsage,

    /// Ring of recent cpu_percent samples, newest last
    pub cpu_history: VecDeque<f64>,

    /// Ring of recent memory_bytes samples, newest last
    pub memory_history: VecDeque<u64>,

    /// Mean of the last 60 cpu samples
    pub cpu_avg_5min: f64,

    /// Mean of the last 180 cpu samples
    pub cpu_avg_15min: f64,

    /// Mean of the last 60 memory samples, in bytes
    pub memory_avg_5min: f64,
}

impl VmMetrics {
    pub fn new(vm_name: impl Into<String>) -> Self {
        Self {
            vm_name: vm_name.into(),
            usage: ResourceUsage::default(),
            cpu_history: VecDeque::with_capacity(SAMPLE_RING_CAPACITY),
            memory_history: VecDeque::with_capacity(SAMPLE_RING_CAPACITY),
            cpu_avg_5min: 0.0,
            cpu_avg_15min: 0.0,
            memory_avg_5min: 0.0,
        }
    }

    /// Push a new sample, trim the rings and recompute the moving averages.
    pub fn push(&mut self, usage: ResourceUsage) {
        self.usage = usage;

        self.cpu_history.push_back(usage.cpu_percent);
        if self.cpu_history.len() > SAMPLE_RING_CAPACITY {
            self.cpu_history.pop_front();
        }

        self.memory_history.push_back(usage.memory_bytes);
        if self.memory_history.len() > SAMPLE_RING_CAPACITY {
            self.memory_history.pop_front();
        }

        self.cpu_avg_5min = tail_mean(self.cpu_history.iter().copied(), AVG_5MIN_WINDOW);
        self.cpu_avg_15min = tail_mean(self.cpu_history.iter().copied(), AVG_15MIN_WINDOW);
        self.memory_avg_5min =
            tail_mean(self.memory_history.iter().map(|v| *v as f64), AVG_5MIN_WINDOW);
    }

    /// Memory 5-minute average as a percentage of the current budget.
    pub fn memory_avg_5min_percent(&self) -> f64 {
        if self.usage.memory_max_bytes == 0 {
            return 0.0;
        }
        100.0 * self.memory_avg_5min / self.usage.memory_max_bytes as f64
    }

    /// Trailing mean over the full cpu ring; crude load predictor.
    pub fn cpu_trailing_mean(&self) -> f64 {
        tail_mean(self.cpu_history.iter().copied(), SAMPLE_RING_CAPACITY)
    }
}

/// Mean of the last `window` values of `iter` (all values if fewer).
pub(crate) fn tail_mean(iter: impl ExactSizeIterator<Item = f64>, window: usize) -> f64 {
    let len = iter.len();
    if len == 0 {
        return 0.0;
    }
    let take = window.min(len);
    let sum: f64 = iter.skip(len - take).sum();
    sum / take as f64
}

/// Host-wide metrics derived from /proc and statvfs.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostMetrics {
    /// MemTotal in bytes
    pub total_memory: u64,

    /// MemFree in bytes
    pub free_memory: u64,

    /// MemAvailable in bytes
    pub available_memory: u64,

    /// Mean host CPU busy percentage over the last minute of samples
    pub cpu_load_1min: f64,

    /// Mean host CPU busy percentage over the last five minutes
    pub cpu_load_5min: f64,

    /// Mean host CPU busy percentage over the last fifteen minutes
    pub cpu_load_15min: f64,

    /// Root filesystem usage percentage
    pub disk_usage_percent: u64,

    /// Aggregate VM disk throughput in bytes per second
    pub io_throughput_bps: u64,

    /// Aggregate VM network throughput in bytes per second
    pub network_throughput_bps: u64,
}
