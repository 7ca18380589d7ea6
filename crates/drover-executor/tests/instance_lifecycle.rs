//! Instance lifecycle against the in-process runtime.
//!
//! Drives the real engine + state machine + checker stack with the
//! simulated container runtime, covering the happy path, every failure
//! stage, cooperative stop, message dispatch, crash recovery, and the
//! zombie reaper.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use drover_core::{
    CheckSpec, CpuAllocation, Envelope, InstanceKind, InstanceSpec, InstanceState,
    MemoryAllocation, MessagePayload, TransportKind,
};
use drover_executor::{
    ContainerRuntime, EngineConfig, EngineError, ExecutorIdentity, ExecutorResourceLock,
    InProcessRuntime, InstanceEngine, LABEL_INSTANCE_ID, ZombieReaper, recover_instances,
};

fn fast_check(max_attempts: u32) -> CheckSpec {
    CheckSpec {
        endpoint: String::new(),
        interval: "10ms".to_string(),
        timeout: "50ms".to_string(),
        max_attempts,
        initial_delay: None,
    }
}

fn instance_spec(instance_id: &str, kind: InstanceKind) -> InstanceSpec {
    InstanceSpec {
        kind,
        app_id: "app-1".to_string(),
        instance_id: instance_id.to_string(),
        image: "registry/web:1.0".to_string(),
        env: HashMap::new(),
        cpu: CpuAllocation::on_node(0, BTreeSet::from([0])),
        memory: MemoryAllocation::on_node(0, 128),
        readiness: fast_check(5),
        health: fast_check(3),
        pre_stop_hooks: Vec::new(),
        probe_addr: None,
    }
}

fn build_engine(runtime: Arc<InProcessRuntime>) -> Arc<InstanceEngine> {
    let resources = Arc::new(ExecutorResourceLock::new(BTreeMap::from([(
        0,
        (BTreeSet::from([0, 1, 2, 3]), 1024),
    )])));
    Arc::new(InstanceEngine::new(
        ExecutorIdentity {
            executor_id: "exec-1".to_string(),
            hostname: "10.0.0.1".to_string(),
            port: 7070,
            transport: TransportKind::InProcess,
            tags: Vec::new(),
        },
        runtime,
        resources,
        EngineConfig::fast(),
    ))
}

/// Poll until the instance reaches `target`, or panic after 2 seconds.
async fn wait_for_state(engine: &InstanceEngine, instance_id: &str, target: InstanceState) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    loop {
        if engine.current_state(&instance_id.to_string()) == Some(target) {
            return;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "instance {instance_id} never reached {target:?}, currently {:?}",
            engine.current_state(&instance_id.to_string())
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Poll until the instance leaves the registry (terminal reached).
async fn wait_for_unregistered(engine: &InstanceEngine, instance_id: &str) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while engine.current_state(&instance_id.to_string()).is_some() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "instance {instance_id} never unregistered"
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Wait for a specific terminal event on the bus.
async fn wait_for_event(
    mut events: tokio::sync::broadcast::Receiver<drover_executor::InstanceEvent>,
    instance_id: &str,
    target: InstanceState,
) -> drover_executor::InstanceEvent {
    tokio::time::timeout(Duration::from_secs(2), async move {
        loop {
            let event = events.recv().await.expect("event bus closed");
            if event.instance_id == instance_id && event.state == target {
                return event;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {target:?} event for {instance_id}"))
}

#[tokio::test]
async fn instance_reaches_healthy_and_locks_resources() {
    let runtime = Arc::new(InProcessRuntime::new());
    let engine = build_engine(runtime.clone());

    engine
        .start_instance(instance_spec("inst-1", InstanceKind::Application))
        .unwrap();
    wait_for_state(&engine, "inst-1", InstanceState::Healthy).await;

    // The core is locked locally and the container runs.
    let snapshot = engine.node_data().snapshot;
    assert!(!snapshot.nodes[&0].free_cores.contains(&0));
    assert_eq!(snapshot.nodes[&0].available_memory_mb, 896);
    assert_eq!(runtime.running_ids().len(), 1);
}

#[tokio::test]
async fn stop_signal_drives_orderly_shutdown() {
    let runtime = Arc::new(InProcessRuntime::new());
    let engine = build_engine(runtime.clone());
    let events = engine.events().subscribe();

    let mut spec = instance_spec("inst-1", InstanceKind::Application);
    spec.pre_stop_hooks = vec!["drain-connections".to_string()];
    engine.start_instance(spec).unwrap();
    wait_for_state(&engine, "inst-1", InstanceState::Healthy).await;

    assert!(engine.stop_instance(&"inst-1".to_string()));
    let stopped = wait_for_event(events, "inst-1", InstanceState::Stopped).await;
    assert!(stopped.error.is_none());
    wait_for_unregistered(&engine, "inst-1").await;

    // Resources back, container gone.
    let snapshot = engine.node_data().snapshot;
    assert!(snapshot.nodes[&0].free_cores.contains(&0));
    assert_eq!(snapshot.nodes[&0].available_memory_mb, 1024);
    assert!(runtime.running_ids().is_empty());
}

#[tokio::test]
async fn stop_for_unknown_instance_is_a_noop() {
    let runtime = Arc::new(InProcessRuntime::new());
    let engine = build_engine(runtime);
    assert!(!engine.stop_instance(&"inst-nope".to_string()));
}

#[tokio::test]
async fn conflicting_grant_is_refused() {
    let runtime = Arc::new(InProcessRuntime::new());
    let engine = build_engine(runtime);

    engine
        .start_instance(instance_spec("inst-1", InstanceKind::Application))
        .unwrap();
    // Same core 0 in the grant.
    let err = engine
        .start_instance(instance_spec("inst-2", InstanceKind::Application))
        .unwrap_err();
    assert!(matches!(err, EngineError::Resources(_)));
}

#[tokio::test]
async fn image_pull_failure_ends_provisioning_failed() {
    let runtime = Arc::new(InProcessRuntime::new());
    runtime.fail_pulls.store(true, Ordering::SeqCst);
    let engine = build_engine(runtime.clone());
    let events = engine.events().subscribe();

    engine
        .start_instance(instance_spec("inst-1", InstanceKind::Application))
        .unwrap();
    let event = wait_for_event(events, "inst-1", InstanceState::ProvisioningFailed).await;
    assert!(event.error.as_deref().unwrap_or("").contains("image pull"));
    wait_for_unregistered(&engine, "inst-1").await;

    // The failed start released its local lock.
    let snapshot = engine.node_data().snapshot;
    assert!(snapshot.nodes[&0].free_cores.contains(&0));
}

#[tokio::test]
async fn container_start_failure_ends_start_failed() {
    let runtime = Arc::new(InProcessRuntime::new());
    runtime.fail_starts.store(true, Ordering::SeqCst);
    let engine = build_engine(runtime.clone());
    let events = engine.events().subscribe();

    engine
        .start_instance(instance_spec("inst-1", InstanceKind::Application))
        .unwrap();
    wait_for_event(events, "inst-1", InstanceState::StartFailed).await;
    wait_for_unregistered(&engine, "inst-1").await;
    // No half-created container lingers.
    assert!(runtime.running_ids().is_empty());
}

#[tokio::test]
async fn unexpected_container_exit_is_lost() {
    let runtime = Arc::new(InProcessRuntime::new());
    let engine = build_engine(runtime.clone());
    let events = engine.events().subscribe();

    engine
        .start_instance(instance_spec("inst-1", InstanceKind::Application))
        .unwrap();
    wait_for_state(&engine, "inst-1", InstanceState::Healthy).await;

    let container_id = runtime.running_ids()[0].clone();
    runtime.exit_container(&container_id, 137);

    let event = wait_for_event(events, "inst-1", InstanceState::Lost).await;
    assert!(event.error.is_some());
    wait_for_unregistered(&engine, "inst-1").await;
}

#[tokio::test]
async fn task_runs_to_completion_and_stops() {
    let runtime = Arc::new(InProcessRuntime::new());
    let engine = build_engine(runtime.clone());
    let events = engine.events().subscribe();

    engine
        .start_instance(instance_spec("task-1", InstanceKind::Task))
        .unwrap();
    wait_for_state(&engine, "task-1", InstanceState::Healthy).await;

    // The task's process finishes cleanly.
    let container_id = runtime.running_ids()[0].clone();
    runtime.exit_container(&container_id, 0);

    let stopped = wait_for_event(events, "task-1", InstanceState::Stopped).await;
    assert!(stopped.error.is_none());
    wait_for_unregistered(&engine, "task-1").await;
}

#[tokio::test]
async fn message_dispatch_covers_all_payloads() {
    let runtime = Arc::new(InProcessRuntime::new());
    let engine = build_engine(runtime);

    let start = Envelope::controller_request(MessagePayload::StartInstance {
        spec: instance_spec("inst-1", InstanceKind::Application),
    });
    assert!(engine.handle_message(&start).is_accepted());
    // A duplicate start is refused, not crashed on.
    assert!(!engine.handle_message(&start).is_accepted());

    wait_for_state(&engine, "inst-1", InstanceState::Healthy).await;

    let query = Envelope::controller_request(MessagePayload::QueryInstance {
        instance_id: "inst-1".to_string(),
    });
    assert!(engine.handle_message(&query).is_accepted());

    let query_unknown = Envelope::controller_request(MessagePayload::QueryInstance {
        instance_id: "inst-404".to_string(),
    });
    assert!(!engine.handle_message(&query_unknown).is_accepted());

    // Stop is idempotent: accepted even for unknown instances.
    let stop_unknown = Envelope::controller_request(MessagePayload::StopInstance {
        instance_id: "inst-404".to_string(),
    });
    assert!(engine.handle_message(&stop_unknown).is_accepted());

    assert!(!engine.node_data().blacklisted);
    let blacklist = Envelope::controller_request(MessagePayload::BlacklistExecutor {
        executor_id: "exec-1".to_string(),
    });
    assert!(engine.handle_message(&blacklist).is_accepted());
    assert!(engine.node_data().blacklisted);
}

#[tokio::test]
async fn recovery_adopts_surviving_containers() {
    let runtime = Arc::new(InProcessRuntime::new());
    let engine = build_engine(runtime.clone());

    engine
        .start_instance(instance_spec("inst-1", InstanceKind::Application))
        .unwrap();
    wait_for_state(&engine, "inst-1", InstanceState::Healthy).await;

    // Simulate an executor crash: the engine's tracking dies, the
    // container survives.
    engine.mark_lost(&"inst-1".to_string(), "simulated crash");
    assert_eq!(runtime.running_ids().len(), 1);

    let fresh = build_engine(runtime.clone());
    let recovered = recover_instances(&fresh).await.unwrap();
    assert_eq!(recovered, 1);

    wait_for_state(&fresh, "inst-1", InstanceState::Healthy).await;
    // Adopted, not re-created: still exactly one container.
    assert_eq!(runtime.running_ids().len(), 1);

    // A second recovery pass adopts nothing new.
    assert_eq!(recover_instances(&fresh).await.unwrap(), 0);
}

#[tokio::test]
async fn reaper_drops_instances_without_containers() {
    let runtime = Arc::new(InProcessRuntime::new());
    let engine = build_engine(runtime.clone());

    engine
        .start_instance(instance_spec("inst-1", InstanceKind::Application))
        .unwrap();
    engine
        .start_instance({
            let mut spec = instance_spec("inst-2", InstanceKind::Application);
            spec.cpu = CpuAllocation::on_node(0, BTreeSet::from([1]));
            spec
        })
        .unwrap();
    wait_for_state(&engine, "inst-1", InstanceState::Healthy).await;
    wait_for_state(&engine, "inst-2", InstanceState::Healthy).await;

    // inst-1's container vanishes without a trace.
    let victim = runtime
        .list_by_label(LABEL_INSTANCE_ID, "inst-1")
        .await
        .unwrap()[0]
        .id
        .clone();
    runtime.drop_container(&victim);

    let reaper = ZombieReaper::new(engine.clone()).with_interval(Duration::from_millis(10));
    let reaped = reaper.sweep_once().await.unwrap();
    assert_eq!(reaped, vec!["inst-1".to_string()]);

    // inst-1 gone from the registry, its core free again; inst-2 intact.
    assert!(engine.current_state(&"inst-1".to_string()).is_none());
    assert_eq!(
        engine.current_state(&"inst-2".to_string()),
        Some(InstanceState::Healthy)
    );
    let snapshot = engine.node_data().snapshot;
    assert!(snapshot.nodes[&0].free_cores.contains(&0));
    assert!(!snapshot.nodes[&0].free_cores.contains(&1));
}
