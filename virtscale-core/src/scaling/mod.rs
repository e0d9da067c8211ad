//! Scaling engine: turns metric snapshots into scaling decisions.
//!
//! The engine consumes the monitor's per-VM metrics channel, evaluates each
//! snapshot against configurable thresholds with hysteresis (threshold
//! margins on the 5-minute average, a per-VM cooldown and a daily cap) and
//! publishes non-Maintain decisions to its listeners. Decisions clamped to
//! the current allotment are treated as Maintain and never enqueued.

use crate::manager::VmManager;
use crate::types::metrics::VmMetrics;
use crate::types::scaling::{ResourceKind, ResourceLimit, ScalingAction, ScalingDecision};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant, SystemTime};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

/// Per-VM decision history ring capacity.
const DECISION_HISTORY_CAPACITY: usize = 1000;

/// Buffered decisions per listener.
const DECISION_BUFFER_SIZE: usize = 64;

/// Cadence of the history cleanup sweep.
const CLEANUP_INTERVAL: Duration = Duration::from_secs(2);

/// Age beyond which decision history and daily counters are swept.
const DECISION_MAX_AGE: Duration = Duration::from_secs(24 * 3600);

/// Memory scaling step floor: 1 GiB.
const MEMORY_STEP_FLOOR: u64 = 1 << 30;

/// Confidence assigned to predictive (trailing-mean) decisions.
const PREDICTIVE_CONFIDENCE: f64 = 0.6;

/// Damping factor on the predicted-usage-scaled step.
const PREDICTIVE_STEP_FACTOR: f64 = 0.3;

/// Scale-up/scale-down thresholds per resource kind, in percent.
///
/// Reconfigurable at runtime via [`ScalingEngine::set_thresholds`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ScalingThresholds {
    pub cpu_scale_up: f64,
    pub cpu_scale_down: f64,
    pub memory_scale_up: f64,
    pub memory_scale_down: f64,
    pub io_scale_up: f64,
    pub io_scale_down: f64,
    pub network_scale_up: f64,
    pub network_scale_down: f64,
}

impl Default for ScalingThresholds {
    fn default() -> Self {
        Self {
            cpu_scale_up: 80.0,
            cpu_scale_down: 20.0,
            memory_scale_up: 85.0,
            memory_scale_down: 30.0,
            io_scale_up: 75.0,
            io_scale_down: 15.0,
            network_scale_up: 70.0,
            network_scale_down: 10.0,
        }
    }
}

/// Hysteresis configuration: per-VM cooldown plus a rolling daily cap.
#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    /// Minimum spacing between decisions for one VM.
    pub cooldown: Duration,

    /// Maximum accepted decisions per VM per 24 hours.
    pub max_daily: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self { cooldown: Duration::from_secs(120), max_daily: 50 }
    }
}

/// A threshold evaluation outcome, before rate limiting.
#[derive(Debug, Clone, PartialEq)]
pub struct Proposal {
    pub action: ScalingAction,
    pub resource: ResourceKind,
    pub amount: u64,
    pub confidence: f64,
    pub reason: String,
}

/// Confidence from the spread between the instantaneous value and its
/// 5-minute average: a tight spread means the load is steady.
fn confidence(current: f64, average: f64) -> f64 {
    let diff = (current - average).abs();
    if diff < 5.0 {
        0.9
    } else if diff < 10.0 {
        0.7
    } else if diff < 15.0 {
        0.5
    } else {
        0.3
    }
}

fn step_up(limit: &ResourceLimit, floor: u64) -> u64 {
    let step = floor.max(limit.current / 4);
    limit.current.saturating_add(step).min(limit.max)
}

fn step_down(limit: &ResourceLimit, floor: u64) -> u64 {
    let step = floor.max(limit.current / 4);
    limit.current.saturating_sub(step).max(limit.min)
}

/// Evaluate one metrics snapshot against the thresholds.
///
/// CPU is evaluated first; memory pressure may override a CPU decision when
/// it exceeds the CPU scale-up threshold by 10 points. A trailing-mean
/// predictive pass fires only when nothing else did. IO and network
/// evaluation stays quiet until their byte-rate telemetry is non-zero.
pub fn evaluate(
    metrics: &VmMetrics,
    limits: &[ResourceLimit],
    thresholds: &ScalingThresholds,
) -> Option<Proposal> {
    let mut proposal = evaluate_cpu(metrics, limits, thresholds);

    if let Some(memory) = evaluate_memory(metrics, limits, thresholds, proposal.is_some()) {
        proposal = Some(memory);
    }

    if proposal.is_none() {
        proposal = evaluate_predicted(metrics, limits, thresholds);
    }

    proposal
}

fn evaluate_cpu(
    metrics: &VmMetrics,
    limits: &[ResourceLimit],
    thresholds: &ScalingThresholds,
) -> Option<Proposal> {
    let limit = limits.iter().find(|l| l.kind == ResourceKind::Cpu)?;
    let current = metrics.usage.cpu_percent;
    let avg = metrics.cpu_avg_5min;

    if current > thresholds.cpu_scale_up && avg > thresholds.cpu_scale_up - 10.0 {
        let target = step_up(limit, 1);
        if target == limit.current {
            return None;
        }
        return Some(Proposal {
            action: ScalingAction::ScaleUp,
            resource: ResourceKind::Cpu,
            amount: target,
            confidence: confidence(current, avg),
            reason: format!("High CPU usage: {current:.2}% (5min avg: {avg:.2}%)"),
        });
    }

    if current < thresholds.cpu_scale_down && avg < thresholds.cpu_scale_down + 5.0 {
        let target = step_down(limit, 1);
        if target == limit.current {
            return None;
        }
        return Some(Proposal {
            action: ScalingAction::ScaleDown,
            resource: ResourceKind::Cpu,
            amount: target,
            confidence: confidence(current, avg),
            reason: format!("Low CPU usage: {current:.2}% (5min avg: {avg:.2}%)"),
        });
    }

    None
}

fn evaluate_memory(
    metrics: &VmMetrics,
    limits: &[ResourceLimit],
    thresholds: &ScalingThresholds,
    cpu_decision_pending: bool,
) -> Option<Proposal> {
    let limit = limits.iter().find(|l| l.kind == ResourceKind::Memory)?;
    let current = metrics.usage.memory_percent();
    let avg = metrics.memory_avg_5min_percent();

    // Memory pressure overrides a pending CPU decision only when it is well
    // past the CPU scale-up threshold.
    let more_critical = current > thresholds.memory_scale_up
        && (!cpu_decision_pending || current > thresholds.cpu_scale_up + 10.0);

    if more_critical && avg > thresholds.memory_scale_up - 10.0 {
        let target = step_up(limit, MEMORY_STEP_FLOOR);
        if target == limit.current {
            return None;
        }
        return Some(Proposal {
            action: ScalingAction::ScaleUp,
            resource: ResourceKind::Memory,
            amount: target,
            confidence: confidence(current, avg),
            reason: format!("High memory usage: {current:.2}% (5min avg: {avg:.2}%)"),
        });
    }

    if current < thresholds.memory_scale_down
        && avg < thresholds.memory_scale_down + 5.0
        && !cpu_decision_pending
        && current > 0.0
    {
        let target = step_down(limit, MEMORY_STEP_FLOOR);
        if target == limit.current {
            return None;
        }
        return Some(Proposal {
            action: ScalingAction::ScaleDown,
            resource: ResourceKind::Memory,
            amount: target,
            confidence: confidence(current, avg),
            reason: format!("Low memory usage: {current:.2}% (5min avg: {avg:.2}%)"),
        });
    }

    None
}

fn evaluate_predicted(
    metrics: &VmMetrics,
    limits: &[ResourceLimit],
    thresholds: &ScalingThresholds,
) -> Option<Proposal> {
    let limit = limits.iter().find(|l| l.kind == ResourceKind::Cpu)?;
    let predicted = metrics.cpu_trailing_mean();
    if predicted <= thresholds.cpu_scale_up {
        return None;
    }

    // The step scales with the predicted load itself, floored at one unit.
    let increase =
        ((limit.current as f64 * (predicted / 100.0) * PREDICTIVE_STEP_FACTOR) as u64).max(1);
    let target = limit.current.saturating_add(increase).min(limit.max);
    if target == limit.current {
        return None;
    }
    Some(Proposal {
        action: ScalingAction::ScaleUp,
        resource: ResourceKind::Cpu,
        amount: target,
        confidence: PREDICTIVE_CONFIDENCE,
        reason: format!("Predicted high usage: {predicted:.2}%"),
    })
}

#[derive(Default)]
struct EngineState {
    last_decision: HashMap<String, Instant>,
    daily: HashMap<String, VecDeque<SystemTime>>,
    history: HashMap<String, VecDeque<ScalingDecision>>,
}

/// Decision producer with hysteresis and per-VM history.
pub struct ScalingEngine {
    manager: Arc<VmManager>,
    thresholds: RwLock<ScalingThresholds>,
    rate_limits: RateLimitConfig,
    decision_tx: broadcast::Sender<ScalingDecision>,
    state: Mutex<EngineState>,
}

impl ScalingEngine {
    pub fn new(manager: Arc<VmManager>) -> Self {
        Self::with_rate_limits(manager, RateLimitConfig::default())
    }

    pub fn with_rate_limits(manager: Arc<VmManager>, rate_limits: RateLimitConfig) -> Self {
        let (decision_tx, _) = broadcast::channel(DECISION_BUFFER_SIZE);
        Self {
            manager,
            thresholds: RwLock::new(ScalingThresholds::default()),
            rate_limits,
            decision_tx,
            state: Mutex::new(EngineState::default()),
        }
    }

    pub fn thresholds(&self) -> ScalingThresholds {
        *self.thresholds.read().unwrap()
    }

    /// Reconfigure the thresholds at runtime.
    pub fn set_thresholds(&self, thresholds: ScalingThresholds) {
        *self.thresholds.write().unwrap() = thresholds;
        info!(?thresholds, "Scaling thresholds updated");
    }

    /// Subscribe to emitted decisions.
    pub fn subscribe_decisions(&self) -> broadcast::Receiver<ScalingDecision> {
        self.decision_tx.subscribe()
    }

    /// Decision history for one VM, newest last.
    pub fn decision_history(&self, vm_name: &str) -> Vec<ScalingDecision> {
        self.state
            .lock()
            .unwrap()
            .history
            .get(vm_name)
            .map(|ring| ring.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Record a decision the executor gave up on, so the failure is visible
    /// in the per-VM history.
    pub fn record_abandoned(&self, decision: &ScalingDecision, error: &str) {
        let mut abandoned = decision.clone();
        abandoned.reason = format!("{} [abandoned: {error}]", decision.reason);
        self.push_history(abandoned);
    }

    fn push_history(&self, decision: ScalingDecision) {
        let mut state = self.state.lock().unwrap();
        let ring = state.history.entry(decision.vm_name.clone()).or_default();
        ring.push_back(decision);
        if ring.len() > DECISION_HISTORY_CAPACITY {
            ring.pop_front();
        }
    }

    /// Analyze one metrics snapshot. Returns the emitted decision, if any.
    ///
    /// The authoritative resource limits are read from the manager at
    /// analysis time. Rate-limit state advances only when a decision is
    /// actually emitted.
    pub async fn analyze(&self, metrics: &VmMetrics) -> Option<ScalingDecision> {
        let limits = match self.manager.resource_limits(&metrics.vm_name).await {
            Ok(limits) => limits,
            Err(_) => return None,
        };

        let thresholds = self.thresholds();
        let proposal = evaluate(metrics, &limits, &thresholds)?;

        if !self.admit(&metrics.vm_name) {
            return None;
        }

        let decision = ScalingDecision {
            vm_name: metrics.vm_name.clone(),
            action: proposal.action,
            resource: proposal.resource,
            amount: proposal.amount,
            confidence: proposal.confidence,
            reason: proposal.reason,
            timestamp: SystemTime::now(),
        };
        self.push_history(decision.clone());
        Some(decision)
    }

    /// Hysteresis gate: cooldown since the last emitted decision plus the
    /// rolling daily cap. Advances the counters on admission.
    fn admit(&self, vm_name: &str) -> bool {
        let mut state = self.state.lock().unwrap();
        let now = Instant::now();

        if let Some(last) = state.last_decision.get(vm_name) {
            if now.duration_since(*last) < self.rate_limits.cooldown {
                debug!(vm = %vm_name, "Decision suppressed by cooldown");
                return false;
            }
        }

        let daily = state.daily.entry(vm_name.to_string()).or_default();
        let wall_now = SystemTime::now();
        while let Some(&front) = daily.front() {
            match wall_now.duration_since(front) {
                Ok(age) if age > DECISION_MAX_AGE => {
                    daily.pop_front();
                }
                _ => break,
            }
        }
        if daily.len() >= self.rate_limits.max_daily {
            warn!(vm = %vm_name, "Daily scale limit exceeded, suppressing decision");
            return false;
        }

        daily.push_back(wall_now);
        state.last_decision.insert(vm_name.to_string(), now);
        true
    }

    /// Analysis loop: consumes the monitor's metrics channel until shutdown.
    pub async fn run_analysis(
        self: Arc<Self>,
        mut metrics_rx: broadcast::Receiver<VmMetrics>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!("Scaling analysis started");
        loop {
            tokio::select! {
                received = metrics_rx.recv() => match received {
                    Ok(metrics) => {
                        if let Some(decision) = self.analyze(&metrics).await {
                            info!(
                                vm = %decision.vm_name,
                                action = %decision.action,
                                resource = %decision.resource,
                                amount = decision.amount,
                                confidence = decision.confidence,
                                reason = %decision.reason,
                                "Scaling decision emitted"
                            );
                            let _ = self.decision_tx.send(decision);
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(missed = n, "Analysis lagged behind the metrics channel");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        info!("Metrics channel closed, scaling analysis exiting");
                        return;
                    }
                },
                _ = shutdown.recv() => {
                    info!("Scaling analysis stopped");
                    return;
                }
            }
        }
    }

    /// Cleanup loop: sweeps decision history older than 24 h and decays the
    /// daily counters of idle VMs.
    pub async fn run_cleanup(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = tokio::time::interval(CLEANUP_INTERVAL);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.cleanup_sweep(),
                _ = shutdown.recv() => {
                    info!("Scaling cleanup stopped");
                    return;
                }
            }
        }
    }

    fn cleanup_sweep(&self) {
        let now = SystemTime::now();
        let mut state = self.state.lock().unwrap();

        for ring in state.history.values_mut() {
            ring.retain(|d| match now.duration_since(d.timestamp) {
                Ok(age) => age <= DECISION_MAX_AGE,
                Err(_) => true,
            });
        }
        state.history.retain(|_, ring| !ring.is_empty());

        for daily in state.daily.values_mut() {
            daily.retain(|t| match now.duration_since(*t) {
                Ok(age) => age <= DECISION_MAX_AGE,
                Err(_) => true,
            });
        }
        state.daily.retain(|_, daily| !daily.is_empty());
    }
}
