//! Membership manager — executor registration and liveness.
//!
//! Executors join once, then heartbeat with fresh node data. The manager
//! keeps durable `ExecutorRecord`s in the state store, feeds the live
//! resource registry, and detects dead executors from missed heartbeats so
//! their capacity stops being offered.

use std::time::Duration;

use tracing::{info, warn};

use drover_core::{ExecutorId, epoch_secs};
use drover_state::{ExecutorRecord, StateResult, StateStore};

use crate::resources::ClusterResourcesDb;
use crate::types::{ExecutorNodeData, ExecutorResourceSnapshot};

/// Tracks executor membership and liveness.
pub struct MembershipManager {
    state: StateStore,
    /// Dead executor detection threshold.
    dead_timeout: Duration,
    /// Heartbeat interval expected from executors.
    heartbeat_interval: Duration,
}

impl MembershipManager {
    pub fn new(state: StateStore) -> Self {
        Self {
            state,
            dead_timeout: Duration::from_secs(30),
            heartbeat_interval: Duration::from_secs(5),
        }
    }

    /// Set the dead executor detection timeout.
    pub fn with_dead_timeout(mut self, timeout: Duration) -> Self {
        self.dead_timeout = timeout;
        self
    }

    /// Set the expected heartbeat interval.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Get the heartbeat interval in seconds.
    pub fn heartbeat_interval_secs(&self) -> u32 {
        self.heartbeat_interval.as_secs() as u32
    }

    /// Register an executor and ingest its first resource report.
    ///
    /// Assigns an id when the executor did not bring one. Returns the id
    /// under which the executor is tracked.
    pub fn join(
        &self,
        mut data: ExecutorNodeData,
        resources: &ClusterResourcesDb,
    ) -> StateResult<ExecutorId> {
        if data.executor_id.is_empty() {
            data.executor_id = format!("exec-{}", uuid::Uuid::new_v4().simple());
            data.snapshot.executor_id = data.executor_id.clone();
        }
        let executor_id = data.executor_id.clone();
        let now = epoch_secs();
        data.last_heartbeat = now;

        self.state.put_executor(&ExecutorRecord {
            executor_id: executor_id.clone(),
            hostname: data.hostname.clone(),
            port: data.port,
            tags: data.tags.clone(),
            blacklisted: data.blacklisted,
            last_heartbeat: now,
        })?;
        resources.update_nodes(vec![data]);

        info!(executor = %executor_id, "executor joined");
        Ok(executor_id)
    }

    /// Process a full heartbeat: refresh the durable record and the live
    /// resource view. Returns false for executors that never joined.
    pub fn heartbeat(
        &self,
        mut data: ExecutorNodeData,
        resources: &ClusterResourcesDb,
    ) -> StateResult<bool> {
        let Some(mut record) = self.state.get_executor(&data.executor_id)? else {
            warn!(executor = %data.executor_id, "heartbeat from unknown executor dropped");
            return Ok(false);
        };
        let now = epoch_secs();
        data.last_heartbeat = now;
        record.hostname = data.hostname.clone();
        record.port = data.port;
        record.tags = data.tags.clone();
        record.blacklisted = data.blacklisted;
        record.last_heartbeat = now;
        self.state.put_executor(&record)?;
        resources.update_nodes(vec![data]);
        Ok(true)
    }

    /// Process a lightweight resource-only refresh between full heartbeats.
    pub fn refresh_snapshot(
        &self,
        snapshot: ExecutorResourceSnapshot,
        resources: &ClusterResourcesDb,
    ) -> StateResult<bool> {
        let Some(mut record) = self.state.get_executor(&snapshot.executor_id)? else {
            return Ok(false);
        };
        record.last_heartbeat = epoch_secs();
        self.state.put_executor(&record)?;
        resources.update_snapshot(snapshot);
        Ok(true)
    }

    /// Graceful deregistration.
    pub fn leave(
        &self,
        executor_id: &ExecutorId,
        resources: &ClusterResourcesDb,
    ) -> StateResult<()> {
        resources.remove(std::slice::from_ref(executor_id));
        self.state.delete_executor(executor_id)?;
        info!(executor = %executor_id, "executor left");
        Ok(())
    }

    /// Drop executors whose last heartbeat is older than the dead timeout.
    ///
    /// Their capacity leaves the registry immediately; their instances are
    /// picked up later by the staleness sweep.
    pub fn sweep_dead(
        &self,
        now: u64,
        resources: &ClusterResourcesDb,
    ) -> StateResult<Vec<ExecutorId>> {
        let timeout = self.dead_timeout.as_secs();
        let mut dead = Vec::new();
        for record in self.state.list_executors()? {
            if record.last_heartbeat.saturating_add(timeout) < now {
                warn!(
                    executor = %record.executor_id,
                    last_heartbeat = record.last_heartbeat,
                    "executor declared dead"
                );
                resources.remove(std::slice::from_ref(&record.executor_id));
                self.state.delete_executor(&record.executor_id)?;
                dead.push(record.executor_id);
            }
        }
        Ok(dead)
    }
}
