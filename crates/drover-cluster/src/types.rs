//! Cluster-side resource view types.
//!
//! Executors report raw snapshots (`ExecutorResourceSnapshot`,
//! `ExecutorNodeData`); the registry converts them into per-core
//! `CoreState` bookkeeping (`ExecutorHostInfo`), which is what selection
//! and soft-locking operate on.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use drover_core::{
    CoreId, CpuAllocation, ExecutorId, InstanceId, MemoryAllocation, NumaNodeId, TransportKind,
};

/// Tracked state of a single CPU core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoreState {
    /// Never reported by the executor.
    Unknown,
    /// Reported but not usable (offline, reserved for the host).
    Unavailable,
    /// Usable and unclaimed.
    Free,
    /// Soft-locked by the scheduler; no instance is using it yet.
    Allocated,
    /// Occupied by a running instance.
    InUse,
}

/// Memory bookkeeping for one NUMA node.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryInfo {
    /// Megabytes currently grantable.
    pub available_mb: u64,
    /// Megabytes in use by running instances, as reported.
    pub used_mb: u64,
    /// Megabytes soft-locked by pending grants. Kept so a snapshot refresh
    /// does not hand locked memory back out.
    pub locked_mb: u64,
}

/// Converted per-NUMA-node view held by the registry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumaNodeInfo {
    pub cores: BTreeMap<CoreId, CoreState>,
    pub memory: MemoryInfo,
}

impl NumaNodeInfo {
    /// Core ids currently free, in ascending order.
    pub fn free_cores(&self) -> Vec<CoreId> {
        self.cores
            .iter()
            .filter(|(_, state)| **state == CoreState::Free)
            .map(|(id, _)| *id)
            .collect()
    }

    /// Number of cores soft-locked or in use.
    pub fn claimed_core_count(&self) -> usize {
        self.cores
            .values()
            .filter(|s| matches!(s, CoreState::Allocated | CoreState::InUse))
            .count()
    }
}

/// Raw per-NUMA-node numbers as an executor reports them.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NumaNodeSnapshot {
    pub free_cores: BTreeSet<CoreId>,
    pub used_cores: BTreeSet<CoreId>,
    pub available_memory_mb: u64,
    pub used_memory_mb: u64,
}

/// One executor's full resource report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutorResourceSnapshot {
    pub executor_id: ExecutorId,
    pub nodes: BTreeMap<NumaNodeId, NumaNodeSnapshot>,
}

/// Everything an executor says about itself on a heartbeat.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorNodeData {
    pub executor_id: ExecutorId,
    pub hostname: String,
    pub port: u16,
    pub transport: TransportKind,
    pub tags: Vec<String>,
    /// Executor-side exclusion flag, independent of the registry's own.
    pub blacklisted: bool,
    pub snapshot: ExecutorResourceSnapshot,
    pub running_instances: Vec<InstanceId>,
    pub last_heartbeat: u64,
}

/// The registry's converted view of one executor host.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorHostInfo {
    pub executor_id: ExecutorId,
    pub node_data: ExecutorNodeData,
    pub nodes: BTreeMap<NumaNodeId, NumaNodeInfo>,
}

/// Immutable result of a successful allocation.
///
/// Created by `select_node`, consumed by the start job, and released via
/// `deselect_node` on stop or failure. Every grant must eventually be
/// matched by exactly one deselect, or stay held only as long as its
/// instance is alive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AllocatedExecutorNode {
    pub executor_id: ExecutorId,
    pub hostname: String,
    pub port: u16,
    pub transport: TransportKind,
    pub tags: Vec<String>,
    pub cpu: CpuAllocation,
    pub memory: MemoryAllocation,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn free_cores_are_sorted_and_filtered() {
        let mut node = NumaNodeInfo::default();
        node.cores.insert(3, CoreState::Free);
        node.cores.insert(1, CoreState::InUse);
        node.cores.insert(0, CoreState::Free);
        node.cores.insert(2, CoreState::Allocated);
        assert_eq!(node.free_cores(), vec![0, 3]);
        assert_eq!(node.claimed_core_count(), 2);
    }
}
