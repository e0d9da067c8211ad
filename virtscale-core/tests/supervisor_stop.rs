//! Graceful shutdown: the executor finishes the in-flight decision, the
//! queued one is discarded, and no background task survives the stop.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tempfile::TempDir;
use virtscale_core::hypervisor::fake::FakeHypervisor;
use virtscale_core::hypervisor::DomainHandle;
use virtscale_core::{
    DaemonConfig, HypervisorHandle, ResourceKind, ResourceLimit, ScalingAction, ScalingDecision,
    Supervisor, VmConfig,
};

fn decision(vm: &str, amount: u64) -> ScalingDecision {
    ScalingDecision {
        vm_name: vm.to_string(),
        action: ScalingAction::ScaleUp,
        resource: ResourceKind::Cpu,
        amount,
        confidence: 0.9,
        reason: "test decision".to_string(),
        timestamp: SystemTime::now(),
    }
}

#[tokio::test]
async fn stop_drains_in_flight_and_discards_queued() {
    let cgroup_root = TempDir::new().unwrap();
    let images = TempDir::new().unwrap();

    let hv = Arc::new(FakeHypervisor::new("fake:///system"));
    let handle = HypervisorHandle::with_backend(hv.clone());

    let config = DaemonConfig {
        hypervisor_uri: "fake:///system".to_string(),
        cgroup_root: cgroup_root.path().to_path_buf(),
        ..Default::default()
    };
    let supervisor = Supervisor::new(handle, &config);

    let mut vm_configs = Vec::new();
    for name in ["vm1", "vm2"] {
        let image_path = images.path().join(format!("{name}.qcow2"));
        std::fs::write(&image_path, b"qcow2").unwrap();
        vm_configs.push(VmConfig {
            name: name.to_string(),
            image_path,
            limits: vec![ResourceLimit::cpu(1, 16, 2)],
            ..Default::default()
        });
    }

    supervisor.bootstrap(&vm_configs).await;
    supervisor.start();
    supervisor.manager().start_vm("vm1").await.unwrap();
    supervisor.manager().start_vm("vm2").await.unwrap();

    // Slow down domain mutations so the first decision is still in flight
    // when stop is requested; the second stays queued behind it.
    hv.set_op_delay(Duration::from_millis(300));
    assert!(supervisor.enqueue_decision(decision("vm1", 3)));
    assert!(supervisor.enqueue_decision(decision("vm2", 3)));

    // Let the executor dequeue the first decision.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let started = Instant::now();
    supervisor.stop().await;
    assert!(started.elapsed() < Duration::from_secs(10));

    // The in-flight decision completed; the queued one was discarded.
    assert_eq!(hv.domain("vm1").unwrap().info().await.unwrap().vcpus, 3);
    assert_eq!(hv.domain("vm2").unwrap().info().await.unwrap().vcpus, 2);
}

#[tokio::test]
async fn stop_is_idempotent_and_start_guarded() {
    let cgroup_root = TempDir::new().unwrap();
    let hv = Arc::new(FakeHypervisor::new("fake:///system"));
    let config = DaemonConfig {
        cgroup_root: cgroup_root.path().to_path_buf(),
        ..Default::default()
    };
    let supervisor = Supervisor::new(HypervisorHandle::with_backend(hv), &config);

    supervisor.start();
    // A second start must not spawn a duplicate task set.
    supervisor.start();

    supervisor.stop().await;
    // Stopping again is a no-op.
    supervisor.stop().await;

    // After stop, direct enqueue is rejected.
    assert!(!supervisor.enqueue_decision(decision("vm1", 3)));
}
