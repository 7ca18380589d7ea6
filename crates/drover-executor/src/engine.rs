//! InstanceEngine — registry of live instance state machines on one node.
//!
//! The engine is the executor's single entry point: inbound start/stop/
//! query messages dispatch here, resources are locked locally before
//! anything runs, and each instance is driven on a dedicated task until
//! terminal. On terminal the local lock is released, the registry entry
//! removed, and subscribers notified through the event bus.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use drover_cluster::ExecutorNodeData;
use drover_core::{
    Envelope, ExecutorId, InstanceId, InstanceSpec, InstanceState, MessagePayload,
    MessageResponse, TransportKind, epoch_secs,
};

use crate::events::{EventBus, InstanceEvent};
use crate::machine::InstanceMachine;
use crate::resources::{ExecutorResourceLock, ResourceLockError};
use crate::runtime::{ContainerId, ContainerRuntime, RuntimeError};

/// Tunables for instance shutdown behavior.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Grace period given to the container before the runtime kills it.
    pub stop_grace: Duration,
    /// Attempts per pre-stop hook.
    pub hook_attempts: u32,
    /// Delay between pre-stop hook attempts.
    pub hook_retry_delay: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            stop_grace: Duration::from_secs(10),
            hook_attempts: 2,
            hook_retry_delay: Duration::from_millis(500),
        }
    }
}

impl EngineConfig {
    /// Tightened timings for tests.
    pub fn fast() -> Self {
        Self {
            stop_grace: Duration::from_millis(50),
            hook_attempts: 2,
            hook_retry_delay: Duration::from_millis(5),
        }
    }
}

/// Errors refusing an instance start.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("instance already registered: {0}")]
    Duplicate(InstanceId),

    #[error("resources unavailable: {0}")]
    Resources(#[from] ResourceLockError),

    #[error("invalid instance spec: {0}")]
    InvalidSpec(String),

    #[error("runtime error: {0}")]
    Runtime(#[from] RuntimeError),
}

/// How this executor introduces itself to the controller.
#[derive(Debug, Clone)]
pub struct ExecutorIdentity {
    pub executor_id: ExecutorId,
    pub hostname: String,
    pub port: u16,
    pub transport: TransportKind,
    pub tags: Vec<String>,
}

struct InstanceHandle {
    state_rx: watch::Receiver<InstanceState>,
    stop_tx: watch::Sender<bool>,
    task: tokio::task::JoinHandle<()>,
}

/// Registry and dispatcher for every instance on this executor.
pub struct InstanceEngine {
    identity: ExecutorIdentity,
    runtime: Arc<dyn ContainerRuntime>,
    resources: Arc<ExecutorResourceLock>,
    config: EngineConfig,
    instances: Arc<RwLock<HashMap<InstanceId, InstanceHandle>>>,
    events: Arc<EventBus>,
    blacklisted: AtomicBool,
}

impl InstanceEngine {
    pub fn new(
        identity: ExecutorIdentity,
        runtime: Arc<dyn ContainerRuntime>,
        resources: Arc<ExecutorResourceLock>,
        config: EngineConfig,
    ) -> Self {
        Self {
            identity,
            runtime,
            resources,
            config,
            instances: Arc::new(RwLock::new(HashMap::new())),
            events: Arc::new(EventBus::new()),
            blacklisted: AtomicBool::new(false),
        }
    }

    pub fn executor_id(&self) -> &ExecutorId {
        &self.identity.executor_id
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn runtime(&self) -> &Arc<dyn ContainerRuntime> {
        &self.runtime
    }

    /// Lock resources and run a new instance until terminal.
    pub fn start_instance(&self, spec: InstanceSpec) -> Result<(), EngineError> {
        spec.validate().map_err(EngineError::InvalidSpec)?;
        self.register(spec, None)
    }

    /// Re-register a surviving instance around its existing container
    /// (crash recovery). Skips provisioning and the readiness initial
    /// delay.
    pub fn adopt_instance(
        &self,
        spec: InstanceSpec,
        container_id: ContainerId,
    ) -> Result<(), EngineError> {
        self.register(spec, Some(container_id))
    }

    fn register(
        &self,
        spec: InstanceSpec,
        adopted_container: Option<ContainerId>,
    ) -> Result<(), EngineError> {
        let instance_id = spec.instance_id.clone();

        // Local double bookkeeping: refuse before any container work.
        self.resources
            .lock(&instance_id, &spec.cpu, &spec.memory)?;

        let (state_tx, state_rx) = watch::channel(InstanceState::Pending);
        let (stop_tx, stop_rx) = watch::channel(false);

        let machine = InstanceMachine::new(
            spec,
            self.identity.executor_id.clone(),
            self.runtime.clone(),
            self.events.clone(),
            self.config.clone(),
            state_tx,
            stop_rx,
            adopted_container,
        );

        let instances = self.instances.clone();
        let resources = self.resources.clone();
        let cleanup_id = instance_id.clone();
        let watch_rx = state_rx.clone();
        // The machine must not outrun its own registration, or a fast
        // failure would try to unregister an entry not inserted yet.
        let (registered_tx, registered_rx) = tokio::sync::oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            if registered_rx.await.is_err() {
                return;
            }
            machine.run().await;
            let final_state = *watch_rx.borrow();
            resources.release(&cleanup_id);
            instances
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .remove(&cleanup_id);
            debug!(instance = %cleanup_id, ?final_state, "instance unregistered");
        });

        {
            let mut instances = self.lock_instances_mut();
            if instances.contains_key(&instance_id) {
                task.abort();
                self.resources.release(&instance_id);
                return Err(EngineError::Duplicate(instance_id));
            }
            instances.insert(
                instance_id.clone(),
                InstanceHandle {
                    state_rx,
                    stop_tx,
                    task,
                },
            );
        }
        let _ = registered_tx.send(());
        info!(instance = %instance_id, "instance registered");
        Ok(())
    }

    /// Signal the instance's cooperative stop flag. Unknown instances are
    /// a no-op.
    pub fn stop_instance(&self, instance_id: &InstanceId) -> bool {
        let instances = self.lock_instances();
        match instances.get(instance_id) {
            Some(handle) => {
                let _ = handle.stop_tx.send(true);
                info!(instance = %instance_id, "stop signalled");
                true
            }
            None => {
                debug!(instance = %instance_id, "stop for untracked instance ignored");
                false
            }
        }
    }

    /// Point-in-time state of one instance, if tracked.
    pub fn current_state(&self, instance_id: &InstanceId) -> Option<InstanceState> {
        self.lock_instances()
            .get(instance_id)
            .map(|handle| *handle.state_rx.borrow())
    }

    /// Point-in-time state of every tracked instance.
    pub fn current_states(&self) -> HashMap<InstanceId, InstanceState> {
        self.lock_instances()
            .iter()
            .map(|(id, handle)| (id.clone(), *handle.state_rx.borrow()))
            .collect()
    }

    /// Drop a tracked instance whose container no longer exists: abort
    /// its machine, release resources, report `Lost`.
    pub fn mark_lost(&self, instance_id: &InstanceId, reason: &str) -> bool {
        let Some(handle) = self.lock_instances_mut().remove(instance_id) else {
            return false;
        };
        handle.task.abort();
        self.resources.release(instance_id);
        warn!(instance = %instance_id, reason, "instance marked lost");
        self.events.publish(InstanceEvent {
            executor_id: self.identity.executor_id.clone(),
            app_id: String::new(),
            instance_id: instance_id.clone(),
            state: InstanceState::Lost,
            error: Some(reason.to_string()),
            timestamp_secs: epoch_secs(),
        });
        true
    }

    /// Dispatch one inbound message.
    pub fn handle_message(&self, envelope: &Envelope) -> MessageResponse {
        match &envelope.payload {
            MessagePayload::StartInstance { spec } => match self.start_instance(spec.clone()) {
                Ok(()) => MessageResponse::Accepted,
                Err(e) => {
                    warn!(instance = %spec.instance_id, error = %e, "start refused");
                    MessageResponse::rejected(e.to_string())
                }
            },
            MessagePayload::StopInstance { instance_id } => {
                // Stopping something already gone is success, not failure.
                self.stop_instance(instance_id);
                MessageResponse::Accepted
            }
            MessagePayload::QueryInstance { instance_id } => {
                match self.current_state(instance_id) {
                    Some(_) => MessageResponse::Accepted,
                    None => MessageResponse::rejected(format!("unknown instance {instance_id}")),
                }
            }
            MessagePayload::BlacklistExecutor { .. } => {
                self.blacklisted.store(true, Ordering::SeqCst);
                info!(executor = %self.identity.executor_id, "blacklisted by controller");
                MessageResponse::Accepted
            }
        }
    }

    /// The full self-report sent on heartbeats.
    pub fn node_data(&self) -> ExecutorNodeData {
        ExecutorNodeData {
            executor_id: self.identity.executor_id.clone(),
            hostname: self.identity.hostname.clone(),
            port: self.identity.port,
            transport: self.identity.transport,
            tags: self.identity.tags.clone(),
            blacklisted: self.blacklisted.load(Ordering::SeqCst),
            snapshot: self.resources.snapshot(&self.identity.executor_id),
            running_instances: self.lock_instances().keys().cloned().collect(),
            last_heartbeat: epoch_secs(),
        }
    }

    fn lock_instances(
        &self,
    ) -> std::sync::RwLockReadGuard<'_, HashMap<InstanceId, InstanceHandle>> {
        self.instances.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock_instances_mut(
        &self,
    ) -> std::sync::RwLockWriteGuard<'_, HashMap<InstanceId, InstanceHandle>> {
        self.instances
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }
}
