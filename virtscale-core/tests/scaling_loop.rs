//! Integration tests for the analyze -> decide -> execute loop.

use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use virtscale_core::hypervisor::fake::FakeHypervisor;
use virtscale_core::types::metrics::{ResourceUsage, VmMetrics};
use virtscale_core::{
    Executor, ExecutorConfig, HypervisorHandle, RateLimitConfig, ResourceKind, ResourceLimit,
    ScalingAction, ScalingEngine, VmConfig, VmManager,
};

struct Harness {
    _cgroup_root: TempDir,
    _images: TempDir,
    manager: Arc<VmManager>,
}

fn harness() -> Harness {
    let cgroup_root = TempDir::new().unwrap();
    let images = TempDir::new().unwrap();
    let image_path = images.path().join("vm1.qcow2");
    std::fs::write(&image_path, b"qcow2").unwrap();

    let hv = Arc::new(FakeHypervisor::new("fake:///system"));
    let manager = Arc::new(VmManager::new(
        HypervisorHandle::with_backend(hv),
        cgroup_root.path().to_path_buf(),
    ));
    Harness { _cgroup_root: cgroup_root, _images: images, manager }
}

async fn running_vm(h: &Harness, name: &str, cpu_limit: ResourceLimit) {
    let image_path = {
        let images = h._images.path().join(format!("{name}.qcow2"));
        std::fs::write(&images, b"qcow2").unwrap();
        images
    };
    let config = VmConfig {
        name: name.to_string(),
        vcpus: cpu_limit.current as u32,
        image_path,
        limits: vec![cpu_limit],
        ..Default::default()
    };
    h.manager.create_vm(config).await.unwrap();
    h.manager.start_vm(name).await.unwrap();
}

fn sustained_cpu(name: &str, percent: f64, samples: usize) -> VmMetrics {
    let mut metrics = VmMetrics::new(name);
    for _ in 0..samples {
        metrics.push(ResourceUsage { cpu_percent: percent, ..Default::default() });
    }
    metrics
}

/// Sustained 90% CPU over 60 samples on a 2-vCPU VM emits exactly one
/// ScaleUp(CPU) to 3 vCPUs with high confidence, and the executor applies
/// it.
#[tokio::test]
async fn scale_up_under_sustained_load() {
    let h = harness();
    running_vm(&h, "vm1", ResourceLimit::cpu(1, 16, 2)).await;

    let engine = Arc::new(ScalingEngine::new(h.manager.clone()));
    let executor =
        Arc::new(Executor::new(h.manager.clone(), engine.clone(), ExecutorConfig::default()));

    let metrics = sustained_cpu("vm1", 90.0, 60);
    let decision = engine.analyze(&metrics).await.expect("decision under sustained load");

    assert_eq!(decision.action, ScalingAction::ScaleUp);
    assert_eq!(decision.resource, ResourceKind::Cpu);
    assert_eq!(decision.amount, 3);
    assert!(decision.confidence >= 0.7);

    // The cooldown suppresses an immediate second decision for the same VM.
    assert!(engine.analyze(&metrics).await.is_none());

    executor.execute(decision).await;
    let limits = h.manager.resource_limits("vm1").await.unwrap();
    let cpu = limits.iter().find(|l| l.kind == ResourceKind::Cpu).unwrap();
    assert_eq!(cpu.current, 3);
    assert_eq!(h.manager.lookup("vm1").unwrap().config().await.vcpus, 3);
}

/// The per-VM cooldown suppresses decisions inside the window and admits
/// one again once the window has passed.
#[tokio::test]
async fn cooldown_window_gates_decisions() {
    let h = harness();
    running_vm(&h, "vm1", ResourceLimit::cpu(1, 16, 2)).await;

    let engine = Arc::new(ScalingEngine::with_rate_limits(
        h.manager.clone(),
        RateLimitConfig { cooldown: Duration::from_millis(200), max_daily: 50 },
    ));

    let metrics = sustained_cpu("vm1", 90.0, 60);
    assert!(engine.analyze(&metrics).await.is_some());
    assert!(engine.analyze(&metrics).await.is_none());

    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(engine.analyze(&metrics).await.is_some());
}

/// The rolling daily cap suppresses further decisions once exhausted.
#[tokio::test]
async fn daily_cap_gates_decisions() {
    let h = harness();
    running_vm(&h, "vm1", ResourceLimit::cpu(1, 64, 2)).await;

    let engine = Arc::new(ScalingEngine::with_rate_limits(
        h.manager.clone(),
        RateLimitConfig { cooldown: Duration::from_millis(0), max_daily: 3 },
    ));

    let metrics = sustained_cpu("vm1", 90.0, 60);
    for _ in 0..3 {
        assert!(engine.analyze(&metrics).await.is_some());
    }
    assert!(engine.analyze(&metrics).await.is_none());
}

/// A 1-vCPU VM at its minimum under 5% sustained load enqueues nothing:
/// the clamped scale-down is a Maintain.
#[tokio::test]
async fn scale_down_clamped_at_minimum() {
    let h = harness();
    running_vm(&h, "vm1", ResourceLimit::cpu(1, 16, 1)).await;

    let engine = Arc::new(ScalingEngine::new(h.manager.clone()));
    let metrics = sustained_cpu("vm1", 5.0, 60);

    assert!(engine.analyze(&metrics).await.is_none());
    assert!(engine.decision_history("vm1").is_empty());
}

/// Decisions for unknown VMs are never produced.
#[tokio::test]
async fn unknown_vm_produces_no_decision() {
    let h = harness();
    let engine = Arc::new(ScalingEngine::new(h.manager.clone()));
    let metrics = sustained_cpu("ghost", 90.0, 60);
    assert!(engine.analyze(&metrics).await.is_none());
}

/// Emitted decisions land in the per-VM history ring.
#[tokio::test]
async fn history_records_emitted_decisions() {
    let h = harness();
    running_vm(&h, "vm1", ResourceLimit::cpu(1, 16, 2)).await;

    let engine = Arc::new(ScalingEngine::new(h.manager.clone()));
    let metrics = sustained_cpu("vm1", 90.0, 60);
    let decision = engine.analyze(&metrics).await.unwrap();

    let history = engine.decision_history("vm1");
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].amount, decision.amount);
    assert_eq!(history[0].action, ScalingAction::ScaleUp);
}

/// The per-VM decision history never exceeds its 1000-entry cap.
#[tokio::test]
async fn history_ring_is_capped() {
    use std::time::SystemTime;
    use virtscale_core::ScalingDecision;

    let h = harness();
    let engine = Arc::new(ScalingEngine::new(h.manager.clone()));

    let decision = ScalingDecision {
        vm_name: "vm1".to_string(),
        action: ScalingAction::ScaleUp,
        resource: ResourceKind::Cpu,
        amount: 3,
        confidence: 0.9,
        reason: "fill".to_string(),
        timestamp: SystemTime::now(),
    };
    for _ in 0..1200 {
        engine.record_abandoned(&decision, "overflow probe");
    }

    assert_eq!(engine.decision_history("vm1").len(), 1000);
}
