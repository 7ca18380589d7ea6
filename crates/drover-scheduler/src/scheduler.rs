//! InstanceScheduler — placement decisions and session bookkeeping.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use tracing::{debug, warn};

use drover_cluster::{AllocatedExecutorNode, ClusterResourcesDb, ExecutorHostInfo};
use drover_core::{ApplicationSpec, ExecutorId, PlacementPolicy, SessionId};
use drover_state::StateStore;

use crate::error::SchedulerResult;

#[derive(Default)]
struct SessionState {
    /// Grants not yet claimed by a running instance.
    allocations: Vec<AllocatedExecutorNode>,
    closed: bool,
}

/// Stateless placement policy evaluator over the cluster registry.
///
/// Per-application instance counts are read fresh from the instance store
/// on every call (read-then-decide). That is not linearizable with
/// concurrent schedules for the same application — acceptable, because the
/// resources DB's allocation lock is the real double-booking boundary and
/// placement policy is a soft constraint.
pub struct InstanceScheduler {
    resources: std::sync::Arc<ClusterResourcesDb>,
    state: StateStore,
    sessions: Mutex<HashMap<SessionId, SessionState>>,
}

impl InstanceScheduler {
    pub fn new(resources: std::sync::Arc<ClusterResourcesDb>, state: StateStore) -> Self {
        Self {
            resources,
            state,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// A fresh session id for one scale/replace operation.
    pub fn open_session(&self) -> SessionId {
        uuid::Uuid::new_v4().to_string()
    }

    /// Pick and soft-lock an executor for one instance of `spec`.
    ///
    /// `None` means no host satisfies capacity plus placement policy — a
    /// normal outcome, retried by the application action later. The grant
    /// is recorded under `session_id` until claimed or discarded.
    pub fn schedule(
        &self,
        session_id: &SessionId,
        spec: &ApplicationSpec,
    ) -> SchedulerResult<Option<AllocatedExecutorNode>> {
        {
            let mut sessions = self.lock_sessions();
            let session = sessions.entry(session_id.clone()).or_default();
            if session.closed {
                warn!(%session_id, app = %spec.id, "schedule against finalised session refused");
                return Ok(None);
            }
        }

        // Fresh per-executor counts of live instances of this application.
        let mut counts: HashMap<ExecutorId, u32> = HashMap::new();
        for info in self.state.list_instances_for_app(&spec.id)? {
            if !info.state.is_terminal() {
                *counts.entry(info.executor_id).or_insert(0) += 1;
            }
        }

        let policy = spec.placement.clone();
        let app_id = spec.id.clone();
        let filter = move |host: &ExecutorHostInfo| -> bool {
            placement_allows(&policy, &app_id, &counts, host)
        };

        let selected = self.resources.select_node(&spec.resources, filter);

        if let Some(node) = &selected {
            debug!(
                %session_id,
                app = %spec.id,
                executor = %node.executor_id,
                "instance placed"
            );
            let mut sessions = self.lock_sessions();
            if let Some(session) = sessions.get_mut(session_id) {
                session.allocations.push(node.clone());
            }
        }
        Ok(selected)
    }

    /// Mark a grant as consumed by a running instance.
    ///
    /// The instance now owns the resources; they are released when it
    /// stops, not when the session closes.
    pub fn claim_allocation(&self, session_id: &SessionId, node: &AllocatedExecutorNode) {
        let mut sessions = self.lock_sessions();
        if let Some(session) = sessions.get_mut(session_id) {
            session.allocations.retain(|a| a != node);
        }
    }

    /// Roll back a grant whose instance never started. Returns false when
    /// the grant is not held by the session (already claimed/discarded), in
    /// which case nothing is released.
    pub fn discard_allocation(&self, session_id: &SessionId, node: &AllocatedExecutorNode) -> bool {
        let held = {
            let mut sessions = self.lock_sessions();
            match sessions.get_mut(session_id) {
                Some(session) => {
                    let before = session.allocations.len();
                    session.allocations.retain(|a| a != node);
                    session.allocations.len() < before
                }
                None => false,
            }
        };
        if held {
            self.resources.deselect_node(node);
            debug!(%session_id, executor = %node.executor_id, "allocation discarded");
        }
        held
    }

    /// Close a session exactly once, releasing any grant that was neither
    /// claimed nor discarded — nothing soft-locked may outlive its session.
    pub fn finalise_session(&self, session_id: &SessionId) {
        let leftovers = {
            let mut sessions = self.lock_sessions();
            match sessions.get_mut(session_id) {
                Some(session) if !session.closed => {
                    session.closed = true;
                    std::mem::take(&mut session.allocations)
                }
                _ => Vec::new(),
            }
        };
        if !leftovers.is_empty() {
            warn!(
                %session_id,
                count = leftovers.len(),
                "unclaimed allocations released at session close"
            );
            for node in &leftovers {
                self.resources.deselect_node(node);
            }
        }
        debug!(%session_id, "scheduling session finalised");
    }

    fn lock_sessions(&self) -> std::sync::MutexGuard<'_, HashMap<SessionId, SessionState>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Evaluate a placement policy for one candidate host.
fn placement_allows(
    policy: &PlacementPolicy,
    app_id: &str,
    counts: &HashMap<ExecutorId, u32>,
    host: &ExecutorHostInfo,
) -> bool {
    let existing = counts.get(&host.executor_id).copied().unwrap_or(0);
    match policy {
        PlacementPolicy::Any => true,
        PlacementPolicy::OnePerHost => existing == 0,
        PlacementPolicy::MaxPerHost { max } => existing < *max,
        PlacementPolicy::MatchTag { tag } => {
            debug!(%app_id, %tag, "match-tag placement not yet supported, rejecting");
            false
        }
        PlacementPolicy::RuleBased { rule } => {
            debug!(%app_id, %rule, "rule-based placement not yet supported, rejecting");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drover_cluster::{ExecutorNodeData, ExecutorResourceSnapshot, NumaNodeSnapshot};
    use drover_core::{
        CheckSpec, CpuAllocation, InstanceState, MemoryAllocation, ResourceRequirement,
        TransportKind,
    };
    use drover_state::InstanceInfo;
    use std::collections::{BTreeMap, BTreeSet, HashMap as StdHashMap};
    use std::sync::Arc;

    fn node_data(executor_id: &str, cores: Vec<u32>, mem: u64) -> ExecutorNodeData {
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
                        free_cores: cores.into_iter().collect(),
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

    fn app_spec(app_id: &str, placement: PlacementPolicy) -> ApplicationSpec {
        ApplicationSpec {
            id: app_id.to_string(),
            name: "web".to_string(),
            image: "registry/web:1.0".to_string(),
            env: StdHashMap::new(),
            resources: vec![
                ResourceRequirement::Cpu { count: 1 },
                ResourceRequirement::Memory { size_mb: 256 },
            ],
            placement,
            required_instances: 1,
            readiness: CheckSpec::default(),
            health: CheckSpec::default(),
            pre_stop_hooks: Vec::new(),
            created_at: 0,
            updated_at: 0,
        }
    }

    fn running_instance(app_id: &str, instance_id: &str, executor_id: &str) -> InstanceInfo {
        InstanceInfo {
            app_id: app_id.to_string(),
            instance_id: instance_id.to_string(),
            executor_id: executor_id.to_string(),
            state: InstanceState::Healthy,
            cpu: CpuAllocation::default(),
            memory: MemoryAllocation::default(),
            address: None,
            created_at: 0,
            updated_at: 0,
            error: None,
        }
    }

    fn setup(nodes: Vec<ExecutorNodeData>) -> (InstanceScheduler, Arc<ClusterResourcesDb>, StateStore) {
        let resources = Arc::new(ClusterResourcesDb::new());
        resources.update_nodes(nodes);
        let state = StateStore::open_in_memory().unwrap();
        let scheduler = InstanceScheduler::new(resources.clone(), state.clone());
        (scheduler, resources, state)
    }

    #[test]
    fn schedules_onto_a_host_with_capacity() {
        let (scheduler, _, _) = setup(vec![node_data("exec-1", vec![0, 1], 1024)]);
        let session = scheduler.open_session();

        let node = scheduler
            .schedule(&session, &app_spec("app-1", PlacementPolicy::Any))
            .unwrap()
            .unwrap();
        assert_eq!(node.executor_id, "exec-1");
        assert_eq!(node.cpu.core_count(), 1);
    }

    #[test]
    fn one_per_host_never_returns_an_occupied_executor() {
        let (scheduler, _, state) = setup(vec![node_data("exec-1", vec![0, 1, 2, 3], 4096)]);
        state
            .put_instance(&running_instance("app-1", "i-1", "exec-1"))
            .unwrap();
        let session = scheduler.open_session();

        let result = scheduler
            .schedule(&session, &app_spec("app-1", PlacementPolicy::OnePerHost))
            .unwrap();
        assert!(result.is_none());

        // A different application is unaffected.
        let result = scheduler
            .schedule(&session, &app_spec("app-2", PlacementPolicy::OnePerHost))
            .unwrap();
        assert!(result.is_some());
    }

    #[test]
    fn terminal_instances_do_not_count_against_placement() {
        let (scheduler, _, state) = setup(vec![node_data("exec-1", vec![0, 1], 1024)]);
        let mut stopped = running_instance("app-1", "i-1", "exec-1");
        stopped.state = InstanceState::Stopped;
        state.put_instance(&stopped).unwrap();
        let session = scheduler.open_session();

        let result = scheduler
            .schedule(&session, &app_spec("app-1", PlacementPolicy::OnePerHost))
            .unwrap();
        assert!(result.is_some());
    }

    #[test]
    fn max_per_host_caps_the_count() {
        let (scheduler, _, state) = setup(vec![node_data("exec-1", vec![0, 1, 2, 3], 4096)]);
        state
            .put_instance(&running_instance("app-1", "i-1", "exec-1"))
            .unwrap();
        state
            .put_instance(&running_instance("app-1", "i-2", "exec-1"))
            .unwrap();
        let session = scheduler.open_session();

        let at_cap = scheduler
            .schedule(
                &session,
                &app_spec("app-1", PlacementPolicy::MaxPerHost { max: 2 }),
            )
            .unwrap();
        assert!(at_cap.is_none());

        let below_cap = scheduler
            .schedule(
                &session,
                &app_spec("app-1", PlacementPolicy::MaxPerHost { max: 3 }),
            )
            .unwrap();
        assert!(below_cap.is_some());
    }

    #[test]
    fn unsupported_policies_reject_every_candidate() {
        let (scheduler, _, _) = setup(vec![node_data("exec-1", vec![0, 1], 1024)]);
        let session = scheduler.open_session();

        for placement in [
            PlacementPolicy::MatchTag {
                tag: "ssd".to_string(),
            },
            PlacementPolicy::RuleBased {
                rule: "zone == eu".to_string(),
            },
        ] {
            let result = scheduler
                .schedule(&session, &app_spec("app-1", placement))
                .unwrap();
            assert!(result.is_none());
        }
    }

    #[test]
    fn discard_releases_exactly_once() {
        let (scheduler, resources, _) = setup(vec![node_data("exec-1", vec![0], 256)]);
        let session = scheduler.open_session();
        let spec = app_spec("app-1", PlacementPolicy::Any);

        let node = scheduler.schedule(&session, &spec).unwrap().unwrap();
        // Pool exhausted while the grant is held.
        assert!(scheduler.schedule(&session, &spec).unwrap().is_none());

        assert!(scheduler.discard_allocation(&session, &node));
        assert!(!scheduler.discard_allocation(&session, &node));

        let host = resources.snapshot_of(&"exec-1".to_string()).unwrap();
        assert_eq!(host.nodes[&0].free_cores().len(), 1);
    }

    #[test]
    fn finalise_releases_unclaimed_grants_and_closes_the_session() {
        let (scheduler, resources, _) = setup(vec![node_data("exec-1", vec![0, 1], 1024)]);
        let session = scheduler.open_session();
        let spec = app_spec("app-1", PlacementPolicy::Any);

        let claimed = scheduler.schedule(&session, &spec).unwrap().unwrap();
        let leaked = scheduler.schedule(&session, &spec).unwrap().unwrap();
        scheduler.claim_allocation(&session, &claimed);

        scheduler.finalise_session(&session);

        // The claimed grant stays locked; the unclaimed one was released.
        let host = resources.snapshot_of(&"exec-1".to_string()).unwrap();
        assert_eq!(host.nodes[&0].claimed_core_count(), 1);
        assert!(host.nodes[&0].free_cores().contains(
            leaked.cpu.cores[&0].iter().next().unwrap()
        ));

        // The session is closed for further scheduling.
        assert!(scheduler.schedule(&session, &spec).unwrap().is_none());
    }
}
