//! Decision executor: serialized application of scaling decisions.
//!
//! A single worker drains the decision queue in FIFO order and applies each
//! decision through the manager. Per-VM executions are rate limited, a
//! failed application is retried once after a delay, and decisions whose VM
//! has left the registry are dropped. On shutdown the worker finishes the
//! in-flight decision and discards the rest of the queue.

use crate::error::VirtscaleError;
use crate::manager::VmManager;
use crate::scaling::ScalingEngine;
use crate::types::scaling::{ResourceKind, ScalingAction, ScalingDecision};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};

/// Queue capacity between the engine bridge and the worker.
pub const DECISION_QUEUE_CAPACITY: usize = 64;

/// Configuration for the executor worker.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Minimum spacing between executions for one VM.
    pub min_execution_interval: Duration,

    /// Delay before the single retry of a failed execution.
    pub retry_delay: Duration,

    /// Destination URI used for Migrate decisions.
    pub migrate_destination: Option<String>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            min_execution_interval: Duration::from_secs(30),
            retry_delay: Duration::from_secs(5),
            migrate_destination: None,
        }
    }
}

/// Single-worker decision executor.
pub struct Executor {
    manager: Arc<VmManager>,
    engine: Arc<ScalingEngine>,
    config: ExecutorConfig,
    last_execution: Mutex<HashMap<String, Instant>>,
}

impl Executor {
    pub fn new(manager: Arc<VmManager>, engine: Arc<ScalingEngine>, config: ExecutorConfig) -> Self {
        Self { manager, engine, config, last_execution: Mutex::new(HashMap::new()) }
    }

    /// Worker loop: drains `queue` until the shutdown channel fires.
    ///
    /// The in-flight decision always completes; queued decisions left behind
    /// at shutdown are discarded.
    pub async fn run(
        self: Arc<Self>,
        mut queue: mpsc::Receiver<ScalingDecision>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        info!("Decision executor started");
        loop {
            // Shutdown wins over further queued work: the in-flight decision
            // (inside `execute`) always finishes, the queue is discarded.
            tokio::select! {
                biased;
                _ = shutdown.recv() => {
                    info!("Decision executor stopped");
                    return;
                }
                decision = queue.recv() => match decision {
                    Some(decision) => self.execute(decision).await,
                    None => {
                        info!("Decision queue closed, executor exiting");
                        return;
                    }
                },
            }
        }
    }

    /// Apply one decision, honoring the per-VM execution rate limit and the
    /// retry-once policy.
    pub async fn execute(&self, decision: ScalingDecision) {
        if !self.admit(&decision.vm_name) {
            debug!(vm = %decision.vm_name, "Execution suppressed by rate limit");
            return;
        }

        info!(
            vm = %decision.vm_name,
            action = %decision.action,
            resource = %decision.resource,
            amount = decision.amount,
            "Executing decision"
        );

        match self.dispatch(&decision).await {
            Ok(()) => {
                debug!(vm = %decision.vm_name, "Decision applied");
            }
            Err(VirtscaleError::DomainNotFound { name }) => {
                // The VM left the registry while the decision was queued.
                warn!(vm = %name, "Decision target no longer registered, dropping");
            }
            Err(first) => {
                warn!(
                    vm = %decision.vm_name,
                    error = %first,
                    retry_secs = self.config.retry_delay.as_secs(),
                    "Decision failed, retrying once"
                );
                tokio::time::sleep(self.config.retry_delay).await;

                match self.dispatch(&decision).await {
                    Ok(()) => debug!(vm = %decision.vm_name, "Decision applied on retry"),
                    Err(VirtscaleError::DomainNotFound { name }) => {
                        warn!(vm = %name, "Decision target no longer registered, dropping");
                    }
                    Err(second) => {
                        error!(
                            vm = %decision.vm_name,
                            error = %second,
                            "Decision abandoned after retry"
                        );
                        self.engine.record_abandoned(&decision, &second.to_string());
                    }
                }
            }
        }
    }

    /// Per-VM execution rate limit, checked at dequeue time.
    fn admit(&self, vm_name: &str) -> bool {
        let mut last = self.last_execution.lock().unwrap();
        let now = Instant::now();
        if let Some(previous) = last.get(vm_name) {
            if now.duration_since(*previous) < self.config.min_execution_interval {
                return false;
            }
        }
        last.insert(vm_name.to_string(), now);
        true
    }

    async fn dispatch(&self, decision: &ScalingDecision) -> crate::error::Result<()> {
        match decision.action {
            ScalingAction::ScaleUp | ScalingAction::ScaleDown => match decision.resource {
                ResourceKind::Cpu => {
                    self.manager.scale_vm_cpu(&decision.vm_name, decision.amount as u32).await
                }
                ResourceKind::Memory => {
                    self.manager
                        .scale_vm_memory(&decision.vm_name, decision.amount / (1024 * 1024))
                        .await
                }
                ResourceKind::Io | ResourceKind::Network => {
                    // Limit application for these kinds happens through the
                    // cgroup writes on the VM; nothing to resize live yet.
                    Ok(())
                }
            },
            ScalingAction::Migrate => {
                let Some(dest) = self.config.migrate_destination.as_deref() else {
                    return Err(VirtscaleError::Configuration {
                        reason: "no migration destination configured".to_string(),
                    });
                };
                self.manager.migrate_vm(&decision.vm_name, dest).await
            }
            ScalingAction::Suspend => self.manager.suspend_vm(&decision.vm_name).await,
            ScalingAction::Resume => self.manager.resume_vm(&decision.vm_name).await,
            ScalingAction::Maintain => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypervisor::fake::FakeHypervisor;
    use crate::hypervisor::HypervisorHandle;
    use crate::types::scaling::ResourceLimit;
    use crate::types::vm::VmConfig;
    use std::time::SystemTime;
    use tempfile::TempDir;

    struct Fixture {
        _cgroup_root: TempDir,
        _images: TempDir,
        hv: Arc<FakeHypervisor>,
        manager: Arc<VmManager>,
        engine: Arc<ScalingEngine>,
        executor: Arc<Executor>,
    }

    async fn fixture(config: ExecutorConfig) -> Fixture {
        let cgroup_root = TempDir::new().unwrap();
        let images = TempDir::new().unwrap();
        let image_path = images.path().join("disk.qcow2");
        std::fs::write(&image_path, b"qcow2").unwrap();

        let hv = Arc::new(FakeHypervisor::new("fake:///system"));
        let manager = Arc::new(VmManager::new(
            HypervisorHandle::with_backend(hv.clone()),
            cgroup_root.path().to_path_buf(),
        ));
        let engine = Arc::new(ScalingEngine::new(manager.clone()));
        let executor = Arc::new(Executor::new(manager.clone(), engine.clone(), config));

        let vm_config = VmConfig {
            name: "vm1".to_string(),
            image_path,
            limits: vec![ResourceLimit::cpu(1, 16, 2)],
            ..Default::default()
        };
        manager.create_vm(vm_config).await.unwrap();
        manager.start_vm("vm1").await.unwrap();

        Fixture { _cgroup_root: cgroup_root, _images: images, hv, manager, engine, executor }
    }

    fn scale_up_cpu(amount: u64) -> ScalingDecision {
        ScalingDecision {
            vm_name: "vm1".to_string(),
            action: ScalingAction::ScaleUp,
            resource: ResourceKind::Cpu,
            amount,
            confidence: 0.9,
            reason: "test".to_string(),
            timestamp: SystemTime::now(),
        }
    }

    #[tokio::test]
    async fn applies_cpu_scale_decision() {
        let f = fixture(ExecutorConfig::default()).await;
        f.executor.execute(scale_up_cpu(3)).await;

        let limits = f.manager.resource_limits("vm1").await.unwrap();
        let cpu = limits.iter().find(|l| l.kind == ResourceKind::Cpu).unwrap();
        assert_eq!(cpu.current, 3);
    }

    #[tokio::test]
    async fn rate_limit_drops_back_to_back_executions() {
        let f = fixture(ExecutorConfig::default()).await;
        f.executor.execute(scale_up_cpu(3)).await;
        f.executor.execute(scale_up_cpu(4)).await;

        // Second execution was dropped inside the 30 s window.
        let limits = f.manager.resource_limits("vm1").await.unwrap();
        assert_eq!(limits.iter().find(|l| l.kind == ResourceKind::Cpu).unwrap().current, 3);
    }

    #[tokio::test]
    async fn removed_vm_decision_is_dropped_without_retry() {
        let f = fixture(ExecutorConfig::default()).await;
        let vm = f.manager.remove_vm("vm1").await.unwrap();
        drop(vm);

        // Must not retry; the history stays free of abandoned entries.
        f.executor.execute(scale_up_cpu(3)).await;
        assert!(f.engine.decision_history("vm1").is_empty());
    }

    #[tokio::test]
    async fn failure_is_retried_once_then_applied() {
        let config = ExecutorConfig { retry_delay: Duration::from_millis(20), ..Default::default() };
        let f = fixture(config).await;

        f.hv.domain("vm1").unwrap().fail_next_ops(1);
        f.executor.execute(scale_up_cpu(3)).await;

        let limits = f.manager.resource_limits("vm1").await.unwrap();
        assert_eq!(limits.iter().find(|l| l.kind == ResourceKind::Cpu).unwrap().current, 3);
    }

    #[tokio::test]
    async fn second_failure_is_abandoned_into_history() {
        let config = ExecutorConfig { retry_delay: Duration::from_millis(20), ..Default::default() };
        let f = fixture(config).await;

        f.hv.domain("vm1").unwrap().fail_next_ops(2);
        f.executor.execute(scale_up_cpu(3)).await;

        let history = f.engine.decision_history("vm1");
        assert_eq!(history.len(), 1);
        assert!(history[0].reason.contains("abandoned"));

        let limits = f.manager.resource_limits("vm1").await.unwrap();
        assert_eq!(limits.iter().find(|l| l.kind == ResourceKind::Cpu).unwrap().current, 2);
    }

    #[tokio::test]
    async fn suspend_and_resume_decisions_dispatch() {
        let config =
            ExecutorConfig { min_execution_interval: Duration::from_millis(0), ..Default::default() };
        let f = fixture(config).await;

        let mut suspend = scale_up_cpu(0);
        suspend.action = ScalingAction::Suspend;
        f.executor.execute(suspend).await;
        assert_eq!(f.manager.vm_status("vm1").unwrap(), crate::types::vm::VmStatus::Suspended);

        let mut resume = scale_up_cpu(0);
        resume.action = ScalingAction::Resume;
        f.executor.execute(resume).await;
        assert_eq!(f.manager.vm_status("vm1").unwrap(), crate::types::vm::VmStatus::Running);
    }

    #[tokio::test]
    async fn migrate_without_destination_is_abandoned() {
        let config = ExecutorConfig { retry_delay: Duration::from_millis(10), ..Default::default() };
        let f = fixture(config).await;

        let mut migrate = scale_up_cpu(0);
        migrate.action = ScalingAction::Migrate;
        f.executor.execute(migrate).await;

        let history = f.engine.decision_history("vm1");
        assert_eq!(history.len(), 1);
        assert!(history[0].reason.contains("abandoned"));
    }
}
