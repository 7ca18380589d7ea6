//! End-to-end application lifecycle against a scripted executor.
//!
//! The communicator double plays the executor's part: it answers start and
//! stop messages and writes the state reports a real executor would
//! produce, so the whole controller loop (state machine → topology → jobs
//! → scheduler → resources DB → instance store) runs for real.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use drover_cluster::{
    ClusterResourcesDb, ExecutorNodeData, ExecutorResourceSnapshot, NumaNodeSnapshot,
};
use drover_controller::{ApplicationOperation, ApplicationStateMachine, ControllerContext};
use drover_core::{
    ApplicationSpec, ApplicationState, CheckSpec, Communicator, CommsError, Envelope,
    InstanceState, MessagePayload, MessageResponse, PlacementPolicy, ResourceRequirement,
    RetrySpecFactory, TransportKind,
};
use drover_scheduler::InstanceScheduler;
use drover_state::StateStore;

/// Executor stand-in: accepts messages and reports state transitions.
struct FakeExecutor {
    state: StateStore,
    /// When set, starts are rejected (capacity pressure on the executor).
    reject_starts: AtomicBool,
    /// When set, starts are accepted but never reported (hang forever).
    silent_starts: AtomicBool,
    sent: Mutex<Vec<Envelope>>,
}

impl FakeExecutor {
    fn new(state: StateStore) -> Self {
        Self {
            state,
            reject_starts: AtomicBool::new(false),
            silent_starts: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
        }
    }

    fn sent_count(&self) -> usize {
        self.sent.lock().unwrap().len()
    }
}

#[async_trait::async_trait]
impl Communicator for FakeExecutor {
    async fn send(
        &self,
        _executor_id: &String,
        message: Envelope,
    ) -> Result<MessageResponse, CommsError> {
        self.sent.lock().unwrap().push(message.clone());
        match &message.payload {
            MessagePayload::StartInstance { spec } => {
                if self.reject_starts.load(Ordering::SeqCst) {
                    return Ok(MessageResponse::rejected("out of local resources"));
                }
                if !self.silent_starts.load(Ordering::SeqCst) {
                    self.state
                        .update_instance_state(
                            &spec.app_id,
                            &spec.instance_id,
                            InstanceState::Healthy,
                            None,
                            2,
                        )
                        .unwrap();
                }
                Ok(MessageResponse::Accepted)
            }
            MessagePayload::StopInstance { instance_id } => {
                if let Some(info) = self.state.find_instance(instance_id).unwrap() {
                    self.state
                        .update_instance_state(
                            &info.app_id,
                            instance_id,
                            InstanceState::Stopped,
                            None,
                            3,
                        )
                        .unwrap();
                }
                Ok(MessageResponse::Accepted)
            }
            _ => Ok(MessageResponse::Accepted),
        }
    }
}

fn node_data(executor_id: &str, cores: u32, mem: u64) -> ExecutorNodeData {
    ExecutorNodeData {
        executor_id: executor_id.to_string(),
        hostname: "10.0.0.1".to_string(),
        port: 7070,
        transport: TransportKind::InProcess,
        tags: Vec::new(),
        blacklisted: false,
        snapshot: ExecutorResourceSnapshot {
            executor_id: executor_id.to_string(),
            nodes: BTreeMap::from([(
                0,
                NumaNodeSnapshot {
                    free_cores: (0..cores).collect::<BTreeSet<u32>>(),
                    used_cores: BTreeSet::new(),
                    available_memory_mb: mem,
                    used_memory_mb: 0,
                },
            )]),
        },
        running_instances: Vec::new(),
        last_heartbeat: 0,
    }
}

fn app_spec(app_id: &str, instances: u32) -> ApplicationSpec {
    ApplicationSpec {
        id: app_id.to_string(),
        name: "web".to_string(),
        image: "registry/web:1.0".to_string(),
        env: HashMap::new(),
        resources: vec![
            ResourceRequirement::Cpu { count: 1 },
            ResourceRequirement::Memory { size_mb: 128 },
        ],
        placement: PlacementPolicy::Any,
        required_instances: instances,
        readiness: CheckSpec::default(),
        health: CheckSpec::default(),
        pre_stop_hooks: Vec::new(),
        created_at: 0,
        updated_at: 0,
    }
}

struct Harness {
    machine: ApplicationStateMachine,
    ctx: Arc<ControllerContext>,
    executor: Arc<FakeExecutor>,
}

fn harness(nodes: Vec<ExecutorNodeData>) -> Harness {
    let resources = Arc::new(ClusterResourcesDb::new());
    resources.update_nodes(nodes);
    let state = StateStore::open_in_memory().unwrap();
    let scheduler = Arc::new(InstanceScheduler::new(resources.clone(), state.clone()));
    let executor = Arc::new(FakeExecutor::new(state.clone()));
    let ctx = Arc::new(ControllerContext::new(
        resources,
        scheduler,
        executor.clone(),
        state,
        RetrySpecFactory::fast(),
    ));
    Harness {
        machine: ApplicationStateMachine::new(ctx.clone()),
        ctx,
        executor,
    }
}

fn healthy_count(ctx: &ControllerContext, app_id: &str) -> usize {
    ctx.state
        .list_instances_for_app(app_id)
        .unwrap()
        .iter()
        .filter(|i| i.state == InstanceState::Healthy)
        .count()
}

fn free_cores(ctx: &ControllerContext, executor_id: &str) -> usize {
    ctx.resources
        .snapshot_of(&executor_id.to_string())
        .map(|host| host.nodes[&0].free_cores().len())
        .unwrap_or(0)
}

#[tokio::test]
async fn create_brings_up_required_instances() {
    let h = harness(vec![node_data("exec-1", 8, 8192)]);

    let state = h
        .machine
        .handle(
            &"app-1".to_string(),
            ApplicationOperation::Create {
                spec: app_spec("app-1", 3),
            },
        )
        .await
        .unwrap();

    assert_eq!(state, ApplicationState::Running);
    assert_eq!(healthy_count(&h.ctx, "app-1"), 3);
    assert_eq!(free_cores(&h.ctx, "exec-1"), 5);
}

#[tokio::test]
async fn create_for_existing_application_is_drained() {
    let h = harness(vec![node_data("exec-1", 8, 8192)]);
    let app_id = "app-1".to_string();

    h.machine
        .handle(
            &app_id,
            ApplicationOperation::Create {
                spec: app_spec("app-1", 1),
            },
        )
        .await
        .unwrap();
    let sends_after_create = h.executor.sent_count();

    let state = h
        .machine
        .handle(
            &app_id,
            ApplicationOperation::Create {
                spec: app_spec("app-1", 5),
            },
        )
        .await
        .unwrap();

    assert_eq!(state, ApplicationState::Running);
    assert_eq!(h.executor.sent_count(), sends_after_create);
    assert_eq!(healthy_count(&h.ctx, "app-1"), 1);
}

#[tokio::test]
async fn scale_up_and_down_converge() {
    let h = harness(vec![node_data("exec-1", 8, 8192)]);
    let app_id = "app-1".to_string();

    h.machine
        .handle(
            &app_id,
            ApplicationOperation::Create {
                spec: app_spec("app-1", 2),
            },
        )
        .await
        .unwrap();

    let state = h
        .machine
        .handle(&app_id, ApplicationOperation::Scale { required: 5 })
        .await
        .unwrap();
    assert_eq!(state, ApplicationState::Running);
    assert_eq!(healthy_count(&h.ctx, "app-1"), 5);

    let state = h
        .machine
        .handle(&app_id, ApplicationOperation::Scale { required: 1 })
        .await
        .unwrap();
    assert_eq!(state, ApplicationState::Running);
    assert_eq!(healthy_count(&h.ctx, "app-1"), 1);
    // Stopped instances gave their cores back.
    assert_eq!(free_cores(&h.ctx, "exec-1"), 7);
}

#[tokio::test]
async fn scale_to_current_count_is_a_noop() {
    let h = harness(vec![node_data("exec-1", 8, 8192)]);
    let app_id = "app-1".to_string();

    h.machine
        .handle(
            &app_id,
            ApplicationOperation::Create {
                spec: app_spec("app-1", 2),
            },
        )
        .await
        .unwrap();
    let sends_before = h.executor.sent_count();

    let state = h
        .machine
        .handle(&app_id, ApplicationOperation::Scale { required: 2 })
        .await
        .unwrap();

    assert_eq!(state, ApplicationState::Running);
    assert_eq!(h.executor.sent_count(), sends_before);
}

#[tokio::test]
async fn rejected_starts_loop_back_to_scaling_requested() {
    let h = harness(vec![node_data("exec-1", 8, 8192)]);
    let app_id = "app-1".to_string();
    h.executor.reject_starts.store(true, Ordering::SeqCst);

    let state = h
        .machine
        .handle(
            &app_id,
            ApplicationOperation::Create {
                spec: app_spec("app-1", 2),
            },
        )
        .await
        .unwrap();

    assert_eq!(state, ApplicationState::ScalingRequested);
    let app = h.ctx.state.get_application("app-1").unwrap().unwrap();
    assert!(app.error.is_some());
    // Nothing stayed locked for the failed starts.
    assert_eq!(free_cores(&h.ctx, "exec-1"), 8);

    // The operation can be re-issued once the executor recovers.
    h.executor.reject_starts.store(false, Ordering::SeqCst);
    let state = h
        .machine
        .handle(&app_id, ApplicationOperation::Scale { required: 2 })
        .await
        .unwrap();
    assert_eq!(state, ApplicationState::Running);
    assert_eq!(healthy_count(&h.ctx, "app-1"), 2);
}

#[tokio::test]
async fn no_capacity_reports_error_and_stays_requested() {
    // One core total, two instances requested.
    let h = harness(vec![node_data("exec-1", 1, 8192)]);

    let state = h
        .machine
        .handle(
            &"app-1".to_string(),
            ApplicationOperation::Create {
                spec: app_spec("app-1", 2),
            },
        )
        .await
        .unwrap();

    assert_eq!(state, ApplicationState::ScalingRequested);
    let app = h.ctx.state.get_application("app-1").unwrap().unwrap();
    assert!(app.error.is_some());
    // The one instance that fit is healthy and keeps its grant.
    assert_eq!(healthy_count(&h.ctx, "app-1"), 1);
    assert_eq!(free_cores(&h.ctx, "exec-1"), 0);
}

#[tokio::test]
async fn replace_swaps_instance_ids_and_keeps_the_count() {
    let h = harness(vec![node_data("exec-1", 8, 8192)]);
    let app_id = "app-1".to_string();

    h.machine
        .handle(
            &app_id,
            ApplicationOperation::Create {
                spec: app_spec("app-1", 2),
            },
        )
        .await
        .unwrap();
    let before: BTreeSet<String> = h
        .ctx
        .state
        .list_instances_for_app("app-1")
        .unwrap()
        .iter()
        .filter(|i| i.state == InstanceState::Healthy)
        .map(|i| i.instance_id.clone())
        .collect();

    let state = h
        .machine
        .handle(
            &app_id,
            ApplicationOperation::ReplaceInstances {
                instance_ids: Vec::new(),
                stop_first: true,
            },
        )
        .await
        .unwrap();

    assert_eq!(state, ApplicationState::Running);
    let after: BTreeSet<String> = h
        .ctx
        .state
        .list_instances_for_app("app-1")
        .unwrap()
        .iter()
        .filter(|i| i.state == InstanceState::Healthy)
        .map(|i| i.instance_id.clone())
        .collect();
    assert_eq!(after.len(), 2);
    assert!(before.is_disjoint(&after), "instances were not replaced");
    // No net resource drift: 2 running instances → 2 cores locked.
    assert_eq!(free_cores(&h.ctx, "exec-1"), 6);
}

#[tokio::test]
async fn stop_instances_shrinks_the_desired_count() {
    let h = harness(vec![node_data("exec-1", 8, 8192)]);
    let app_id = "app-1".to_string();

    h.machine
        .handle(
            &app_id,
            ApplicationOperation::Create {
                spec: app_spec("app-1", 3),
            },
        )
        .await
        .unwrap();
    let victim = h.ctx.state.list_instances_for_app("app-1").unwrap()[0]
        .instance_id
        .clone();

    let state = h
        .machine
        .handle(
            &app_id,
            ApplicationOperation::StopInstances {
                instance_ids: vec![victim.clone()],
            },
        )
        .await
        .unwrap();

    assert_eq!(state, ApplicationState::Running);
    let app = h.ctx.state.get_application("app-1").unwrap().unwrap();
    assert_eq!(app.desired_instances, 2);
    assert_eq!(healthy_count(&h.ctx, "app-1"), 2);
    let stopped = h.ctx.state.get_instance("app-1", &victim).unwrap().unwrap();
    assert_eq!(stopped.state, InstanceState::Stopped);
}

#[tokio::test]
async fn suspend_keeps_desired_count_and_recover_restores_it() {
    let h = harness(vec![node_data("exec-1", 8, 8192)]);
    let app_id = "app-1".to_string();

    h.machine
        .handle(
            &app_id,
            ApplicationOperation::Create {
                spec: app_spec("app-1", 2),
            },
        )
        .await
        .unwrap();

    let state = h
        .machine
        .handle(&app_id, ApplicationOperation::Suspend)
        .await
        .unwrap();
    assert_eq!(state, ApplicationState::Monitoring);
    assert_eq!(healthy_count(&h.ctx, "app-1"), 0);
    let app = h.ctx.state.get_application("app-1").unwrap().unwrap();
    assert_eq!(app.desired_instances, 2);

    let state = h
        .machine
        .handle(&app_id, ApplicationOperation::Recover)
        .await
        .unwrap();
    assert_eq!(state, ApplicationState::Running);
    assert_eq!(healthy_count(&h.ctx, "app-1"), 2);
}

#[tokio::test]
async fn destroy_tears_down_and_drains_later_operations() {
    let h = harness(vec![node_data("exec-1", 8, 8192)]);
    let app_id = "app-1".to_string();

    h.machine
        .handle(
            &app_id,
            ApplicationOperation::Create {
                spec: app_spec("app-1", 3),
            },
        )
        .await
        .unwrap();

    let state = h
        .machine
        .handle(&app_id, ApplicationOperation::Destroy)
        .await
        .unwrap();
    assert_eq!(state, ApplicationState::Destroyed);
    assert!(h.ctx.state.list_instances_for_app("app-1").unwrap().is_empty());
    assert_eq!(free_cores(&h.ctx, "exec-1"), 8);

    // Terminal: later operations are acknowledged but change nothing.
    let state = h
        .machine
        .handle(&app_id, ApplicationOperation::Scale { required: 4 })
        .await
        .unwrap();
    assert_eq!(state, ApplicationState::Destroyed);
}

#[tokio::test]
async fn cancelled_scale_rolls_desired_back_to_actual() {
    let h = harness(vec![node_data("exec-1", 8, 8192)]);
    let app_id = "app-1".to_string();

    // Starts are accepted but never report healthy, so the scale hangs in
    // its poll loop until cancelled.
    h.executor.silent_starts.store(true, Ordering::SeqCst);

    let machine = Arc::new(h.machine);
    let handle = {
        let machine = machine.clone();
        let app_id = app_id.clone();
        tokio::spawn(async move {
            machine
                .handle(
                    &app_id,
                    ApplicationOperation::Create {
                        spec: app_spec("app-1", 3),
                    },
                )
                .await
        })
    };

    // Let the starts get in flight, then cancel.
    tokio::time::sleep(Duration::from_millis(15)).await;
    assert!(machine.cancel_operation(&app_id));

    let state = handle.await.unwrap().unwrap();
    assert_eq!(state, ApplicationState::Monitoring);

    let app = h.ctx.state.get_application("app-1").unwrap().unwrap();
    let live = h
        .ctx
        .state
        .list_instances_for_app("app-1")
        .unwrap()
        .iter()
        .filter(|i| !i.state.is_terminal())
        .count() as u32;
    assert_eq!(app.desired_instances, live);
    assert!(app.error.as_deref().unwrap_or("").contains("cancelled"));
}
