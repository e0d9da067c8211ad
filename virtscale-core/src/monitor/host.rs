//! Host telemetry from /proc and statvfs.

use crate::types::metrics::{tail_mean, HostMetrics};
use std::collections::VecDeque;

/// Ring of per-tick busy percentages backing the 1/5/15-minute loads.
const BUSY_RING_CAPACITY: usize = 900;

const LOAD_1MIN_WINDOW: usize = 60;
const LOAD_5MIN_WINDOW: usize = 300;
const LOAD_15MIN_WINDOW: usize = 900;

/// Delta-based sampler over /proc/stat, /proc/meminfo and statvfs("/").
pub struct HostSampler {
    prev_cpu: Option<(u64, u64)>,
    busy_ring: VecDeque<f64>,
}

impl HostSampler {
    pub fn new() -> Self {
        Self { prev_cpu: None, busy_ring: VecDeque::with_capacity(BUSY_RING_CAPACITY) }
    }

    /// Take one host sample. Aggregate VM io/net throughput is supplied by
    /// the caller, summed over the per-VM rates of the same tick.
    pub fn sample(&mut self, io_throughput_bps: u64, network_throughput_bps: u64) -> HostMetrics {
        let mut metrics = HostMetrics {
            io_throughput_bps,
            network_throughput_bps,
            disk_usage_percent: disk_usage_percent(),
            ..Default::default()
        };

        if let Ok(content) = std::fs::read_to_string("/proc/stat") {
            if let Some((total, idle)) = content.lines().next().and_then(parse_proc_stat_line) {
                if let Some((prev_total, prev_idle)) = self.prev_cpu {
                    let total_diff = total.saturating_sub(prev_total);
                    let idle_diff = idle.saturating_sub(prev_idle);
                    if total_diff > 0 {
                        let busy =
                            100.0 * (total_diff.saturating_sub(idle_diff)) as f64 / total_diff as f64;
                        self.push_busy(busy);
                    }
                }
                self.prev_cpu = Some((total, idle));
            }
        }

        metrics.cpu_load_1min = tail_mean(self.busy_ring.iter().copied(), LOAD_1MIN_WINDOW);
        metrics.cpu_load_5min = tail_mean(self.busy_ring.iter().copied(), LOAD_5MIN_WINDOW);
        metrics.cpu_load_15min = tail_mean(self.busy_ring.iter().copied(), LOAD_15MIN_WINDOW);

        if let Ok(content) = std::fs::read_to_string("/proc/meminfo") {
            let (total, free, available) = parse_meminfo(&content);
            metrics.total_memory = total;
            metrics.free_memory = free;
            metrics.available_memory = available;
        }

        metrics
    }

    fn push_busy(&mut self, busy: f64) {
        self.busy_ring.push_back(busy);
        if self.busy_ring.len() > BUSY_RING_CAPACITY {
            self.busy_ring.pop_front();
        }
    }
}

impl Default for HostSampler {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse the aggregate `cpu ` line of /proc/stat into (total, idle) jiffies.
///
/// Only the first four fields (user, nice, system, idle) participate.
fn parse_proc_stat_line(line: &str) -> Option<(u64, u64)> {
    let mut fields = line.split_whitespace();
    if fields.next()? != "cpu" {
        return None;
    }
    let user: u64 = fields.next()?.parse().ok()?;
    let nice: u64 = fields.next()?.parse().ok()?;
    let system: u64 = fields.next()?.parse().ok()?;
    let idle: u64 = fields.next()?.parse().ok()?;
    Some((user + nice + system + idle, idle))
}

/// Parse MemTotal/MemFree/MemAvailable out of /proc/meminfo, in bytes.
fn parse_meminfo(content: &str) -> (u64, u64, u64) {
    let mut total = 0;
    let mut free = 0;
    let mut available = 0;

    for line in content.lines() {
        let mut fields = line.split_whitespace();
        let (Some(key), Some(value)) = (fields.next(), fields.next()) else { continue };
        let Ok(kb) = value.parse::<u64>() else { continue };
        match key {
            "MemTotal:" => total = kb * 1024,
            "MemFree:" => free = kb * 1024,
            "MemAvailable:" => available = kb * 1024,
            _ => {}
        }
    }

    (total, free, available)
}

/// Root filesystem usage percentage via statvfs("/").
fn disk_usage_percent() -> u64 {
    let path = [b'/' as libc::c_char, 0];
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    let rc = unsafe { libc::statvfs(path.as_ptr(), &mut stat) };
    if rc != 0 {
        return 0;
    }

    let total = stat.f_blocks as u64 * stat.f_frsize as u64;
    let available = stat.f_bavail as u64 * stat.f_frsize as u64;
    if total == 0 {
        return 0;
    }
    100 - available * 100 / total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proc_stat_parses_aggregate_line() {
        let (total, idle) =
            parse_proc_stat_line("cpu  1000 50 300 8000 120 0 40 0 0 0").unwrap();
        assert_eq!(total, 1000 + 50 + 300 + 8000);
        assert_eq!(idle, 8000);
    }

    #[test]
    fn proc_stat_rejects_per_core_lines() {
        assert!(parse_proc_stat_line("cpu0 1000 50 300 8000").is_none());
        assert!(parse_proc_stat_line("intr 12345").is_none());
    }

    #[test]
    fn meminfo_values_are_scaled_to_bytes() {
        let content = "MemTotal:       16384 kB\nMemFree:        4096 kB\nMemAvailable:   8192 kB\nBuffers:        100 kB\n";
        let (total, free, available) = parse_meminfo(content);
        assert_eq!(total, 16384 * 1024);
        assert_eq!(free, 4096 * 1024);
        assert_eq!(available, 8192 * 1024);
    }

    #[test]
    fn sampler_produces_monotone_ring() {
        let mut sampler = HostSampler::new();
        for _ in 0..3 {
            let metrics = sampler.sample(0, 0);
            assert!(metrics.cpu_load_1min >= 0.0);
            assert!(metrics.cpu_load_1min <= 100.0);
        }
    }

    #[test]
    fn disk_usage_is_a_percentage() {
        let usage = disk_usage_percent();
        assert!(usage <= 100);
    }
}
