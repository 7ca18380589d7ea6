//! Shared controller collaborators and the single resource-release path.

use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use drover_cluster::ClusterResourcesDb;
use drover_core::{Communicator, CpuAllocation, MemoryAllocation, RetrySpecFactory, epoch_secs};
use drover_scheduler::InstanceScheduler;
use drover_state::{StateResult, StateStore};

/// The collaborators every controller action and job needs.
pub struct ControllerContext {
    pub resources: Arc<ClusterResourcesDb>,
    pub scheduler: Arc<InstanceScheduler>,
    pub comms: Arc<dyn Communicator>,
    pub state: StateStore,
    pub retries: RetrySpecFactory,
    /// Serializes release-and-clear so a grant recorded on an instance is
    /// returned to the pool at most once.
    release_lock: Mutex<()>,
}

impl ControllerContext {
    pub fn new(
        resources: Arc<ClusterResourcesDb>,
        scheduler: Arc<InstanceScheduler>,
        comms: Arc<dyn Communicator>,
        state: StateStore,
        retries: RetrySpecFactory,
    ) -> Self {
        Self {
            resources,
            scheduler,
            comms,
            state,
            retries,
            release_lock: Mutex::new(()),
        }
    }

    /// Return an instance's recorded grant to the pool and blank it on the
    /// record, exactly once.
    ///
    /// Every path that frees a running-or-dead instance's resources goes
    /// through here: the stop job, the terminal-record sweep, and the
    /// staleness reconciler. Returns true when something was released.
    pub fn release_instance_resources(
        &self,
        app_id: &str,
        instance_id: &str,
    ) -> StateResult<bool> {
        let _guard = self
            .release_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let Some(mut info) = self.state.get_instance(app_id, instance_id)? else {
            return Ok(false);
        };
        if info.cpu.is_empty() && info.memory.total_mb() == 0 {
            return Ok(false);
        }

        self.resources
            .release(&info.executor_id, &info.cpu, &info.memory);
        info.cpu = CpuAllocation::default();
        info.memory = MemoryAllocation::default();
        info.updated_at = epoch_secs();
        self.state.put_instance(&info)?;
        debug!(app = %app_id, instance = %instance_id, "instance resources returned to pool");
        Ok(true)
    }
}
