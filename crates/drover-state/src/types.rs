//! Persisted record types for the Drover state store.
//!
//! These wrap the `drover-core` domain types with the bookkeeping the
//! controller needs: current lifecycle state, desired counts, timestamps,
//! and the last error attached to a record.

use serde::{Deserialize, Serialize};

use drover_core::{
    AppId, ApplicationSpec, ApplicationState, CpuAllocation, ExecutorId, InstanceId,
    InstanceState, MemoryAllocation, TaskId,
};

/// Controller-side record of an application.
///
/// `desired_instances` is the single source of truth for how many instances
/// should exist; scale operations move it, cancellation rolls it back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationInfo {
    pub spec: ApplicationSpec,
    pub state: ApplicationState,
    pub desired_instances: u32,
    pub error: Option<String>,
    pub updated_at: u64,
}

impl ApplicationInfo {
    /// A freshly created application record.
    pub fn created(spec: ApplicationSpec, now: u64) -> Self {
        let desired = spec.required_instances;
        Self {
            spec,
            state: ApplicationState::Created,
            desired_instances: desired,
            error: None,
            updated_at: now,
        }
    }

    pub fn table_key(&self) -> String {
        self.spec.id.clone()
    }
}

/// Controller-side record of one instance.
///
/// Written by the executor-reporting path, read by scheduler validation and
/// the scale/replace actions. An instance whose `updated_at` falls behind
/// the staleness bound is eligible to be swept to `Lost`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceInfo {
    pub app_id: AppId,
    pub instance_id: InstanceId,
    pub executor_id: ExecutorId,
    pub state: InstanceState,
    pub cpu: CpuAllocation,
    pub memory: MemoryAllocation,
    /// Address (`ip:port`) the instance serves on, once known.
    pub address: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
    pub error: Option<String>,
}

impl InstanceInfo {
    pub fn table_key(&self) -> String {
        instance_key(&self.app_id, &self.instance_id)
    }
}

/// Build the composite key for the instances table.
pub fn instance_key(app_id: &str, instance_id: &str) -> String {
    format!("{app_id}:{instance_id}")
}

/// Controller-side record of a one-shot task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInfo {
    pub task_id: TaskId,
    pub image: String,
    pub state: InstanceState,
    pub executor_id: Option<ExecutorId>,
    pub created_at: u64,
    pub updated_at: u64,
    pub error: Option<String>,
}

impl TaskInfo {
    pub fn table_key(&self) -> String {
        self.task_id.clone()
    }
}

/// Durable registration of an executor node.
///
/// The live resource view lives in the in-memory cluster resources DB; this
/// record is identity and reachability only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorRecord {
    pub executor_id: ExecutorId,
    pub hostname: String,
    pub port: u16,
    pub tags: Vec<String>,
    pub blacklisted: bool,
    pub last_heartbeat: u64,
}

impl ExecutorRecord {
    pub fn table_key(&self) -> String {
        self.executor_id.clone()
    }
}
