//! Supervisor: owns and wires the control plane.
//!
//! Brings up the monitor, scaling engine and executor (in that order) plus
//! the manager health loop, bridges engine decisions into the executor
//! queue, and tears everything down in reverse on stop. No background task
//! outlives the supervisor.

use crate::config::DaemonConfig;
use crate::executor::{Executor, ExecutorConfig, DECISION_QUEUE_CAPACITY};
use crate::hypervisor::HypervisorHandle;
use crate::manager::VmManager;
use crate::monitor::Monitor;
use crate::scaling::ScalingEngine;
use crate::types::scaling::ScalingDecision;
use crate::types::vm::VmConfig;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Budget for joining all background tasks on stop.
const STOP_GRACE: Duration = Duration::from_secs(10);

/// Owner of the whole control plane.
pub struct Supervisor {
    hypervisor: HypervisorHandle,
    manager: Arc<VmManager>,
    monitor: Arc<Monitor>,
    engine: Arc<ScalingEngine>,
    executor: Arc<Executor>,
    shutdown_tx: broadcast::Sender<()>,
    queue_tx: Mutex<Option<mpsc::Sender<ScalingDecision>>>,
    tasks: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl Supervisor {
    /// Wire the components against an open hypervisor handle.
    pub fn new(hypervisor: HypervisorHandle, config: &DaemonConfig) -> Self {
        let manager = Arc::new(VmManager::new(hypervisor.clone(), config.cgroup_root.clone()));
        let monitor = Arc::new(Monitor::with_interval(
            manager.clone(),
            Duration::from_secs(config.monitor_interval_secs.max(1)),
        ));
        let engine = Arc::new(ScalingEngine::new(manager.clone()));
        engine.set_thresholds(config.thresholds);
        let executor = Arc::new(Executor::new(
            manager.clone(),
            engine.clone(),
            ExecutorConfig {
                migrate_destination: config.migrate_destination.clone(),
                ..Default::default()
            },
        ));
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            hypervisor,
            manager,
            monitor,
            engine,
            executor,
            shutdown_tx,
            queue_tx: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    pub fn hypervisor(&self) -> &HypervisorHandle {
        &self.hypervisor
    }

    pub fn manager(&self) -> &Arc<VmManager> {
        &self.manager
    }

    pub fn monitor(&self) -> &Arc<Monitor> {
        &self.monitor
    }

    pub fn engine(&self) -> &Arc<ScalingEngine> {
        &self.engine
    }

    /// Adopt pre-existing domains, then define the declaratively configured
    /// VMs. Individual failures are logged, not fatal.
    pub async fn bootstrap(&self, vm_configs: &[VmConfig]) {
        match self.manager.load_existing().await {
            Ok(adopted) if adopted > 0 => info!(adopted, "Adopted pre-existing domains"),
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Failed to enumerate pre-existing domains"),
        }

        for config in vm_configs {
            match self.manager.create_vm(config.clone()).await {
                Ok(()) => info!(vm = %config.name, "Defined configured VM"),
                Err(crate::error::VirtscaleError::AlreadyExists { .. }) => {}
                Err(e) => error!(vm = %config.name, error = %e, "Failed to define configured VM"),
            }
        }
    }

    /// Start the background tasks: monitor, scaling engine, executor, plus
    /// the manager health loop and the decision bridge.
    pub fn start(&self) {
        let mut tasks = self.tasks.lock().unwrap();
        if !tasks.is_empty() {
            return;
        }

        let (queue_tx, queue_rx) = mpsc::channel(DECISION_QUEUE_CAPACITY);
        *self.queue_tx.lock().unwrap() = Some(queue_tx.clone());

        tasks.push((
            "monitor",
            tokio::spawn(self.monitor.clone().run(self.shutdown_tx.subscribe())),
        ));
        tasks.push((
            "scaling-analysis",
            tokio::spawn(self.engine.clone().run_analysis(
                self.monitor.subscribe_metrics(),
                self.shutdown_tx.subscribe(),
            )),
        ));
        tasks.push((
            "scaling-cleanup",
            tokio::spawn(self.engine.clone().run_cleanup(self.shutdown_tx.subscribe())),
        ));

        // Bridge: engine decisions feed the executor queue in emission order.
        let mut decisions = self.engine.subscribe_decisions();
        let mut bridge_shutdown = self.shutdown_tx.subscribe();
        tasks.push((
            "decision-bridge",
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        received = decisions.recv() => match received {
                            Ok(decision) => {
                                if queue_tx.send(decision).await.is_err() {
                                    return;
                                }
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                warn!(missed = n, "Decision bridge lagged");
                            }
                            Err(broadcast::error::RecvError::Closed) => return,
                        },
                        _ = bridge_shutdown.recv() => return,
                    }
                }
            }),
        ));

        tasks.push((
            "executor",
            tokio::spawn(self.executor.clone().run(queue_rx, self.shutdown_tx.subscribe())),
        ));
        tasks.push((
            "health",
            tokio::spawn(self.manager.clone().run_health_loop(self.shutdown_tx.subscribe())),
        ));

        info!("Supervisor started");
    }

    /// Inject a decision directly into the executor queue.
    ///
    /// Returns false when the supervisor is not running or the queue is
    /// full.
    pub fn enqueue_decision(&self, decision: ScalingDecision) -> bool {
        match self.queue_tx.lock().unwrap().as_ref() {
            Some(tx) => tx.try_send(decision).is_ok(),
            None => false,
        }
    }

    /// Signal shutdown and join every background task, newest first.
    ///
    /// Each task drains its in-flight work; a task that misses the grace
    /// budget is aborted.
    pub async fn stop(&self) {
        let tasks: Vec<_> = { self.tasks.lock().unwrap().drain(..).collect() };
        if tasks.is_empty() {
            return;
        }

        *self.queue_tx.lock().unwrap() = None;
        let _ = self.shutdown_tx.send(());

        let deadline = Instant::now() + STOP_GRACE;
        for (name, task) in tasks.into_iter().rev() {
            let remaining = deadline.saturating_duration_since(Instant::now());
            let abort = task.abort_handle();
            match tokio::time::timeout(remaining, task).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(task = name, error = %e, "Background task panicked"),
                Err(_) => {
                    warn!(task = name, "Background task missed the stop grace period, aborting");
                    abort.abort();
                }
            }
        }

        info!("Supervisor stopped");
    }
}
