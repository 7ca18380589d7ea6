//! ClusterResourcesDb — in-memory registry of per-executor NUMA resources.
//!
//! One `RwLock` guards the whole registry: reads are concurrent, writes
//! exclusive. `select_node` finds capacity AND soft-locks it in a single
//! write-locked pass — the invariant that prevents two schedulers from
//! granting the same core or the same megabyte twice.
//!
//! Returning `None` from selection is a normal no-capacity outcome, not an
//! error; nothing in here fails in normal operation.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use rand::seq::SliceRandom;
use tracing::{debug, warn};

use drover_core::{
    CoreId, CpuAllocation, ExecutorId, MemoryAllocation, NumaNodeId, ResourceRequirement,
};

use crate::types::{
    AllocatedExecutorNode, CoreState, ExecutorHostInfo, ExecutorNodeData,
    ExecutorResourceSnapshot, NumaNodeInfo,
};

#[derive(Default)]
struct Registry {
    hosts: HashMap<ExecutorId, ExecutorHostInfo>,
    /// Registry-level exclusions, independent of the executor's own flag.
    blacklist: HashSet<ExecutorId>,
}

/// Concurrency-safe registry of executor resource state.
#[derive(Default)]
pub struct ClusterResourcesDb {
    inner: RwLock<Registry>,
}

impl ClusterResourcesDb {
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> RwLockReadGuard<'_, Registry> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Registry> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }

    // ── Views ──────────────────────────────────────────────────────

    /// Point-in-time view of all hosts. With `skip_off_duty`, hosts
    /// excluded by either blacklist flag are omitted.
    pub fn snapshot(&self, skip_off_duty: bool) -> Vec<ExecutorHostInfo> {
        let reg = self.read();
        reg.hosts
            .values()
            .filter(|host| {
                !skip_off_duty
                    || !(host.node_data.blacklisted || reg.blacklist.contains(&host.executor_id))
            })
            .cloned()
            .collect()
    }

    /// Point-in-time view of one host.
    pub fn snapshot_of(&self, executor_id: &ExecutorId) -> Option<ExecutorHostInfo> {
        self.read().hosts.get(executor_id).cloned()
    }

    // ── Ingestion ──────────────────────────────────────────────────

    /// Full heartbeat ingestion: replace each reported host's view.
    ///
    /// Snapshot free cores convert to `Free`, used cores to `InUse`; cores
    /// the registry has soft-locked stay `Allocated` and locked memory is
    /// not handed back out.
    pub fn update_nodes(&self, nodes: Vec<ExecutorNodeData>) {
        let mut reg = self.write();
        for data in nodes {
            let existing = reg.hosts.get(&data.executor_id).map(|h| h.nodes.clone());
            let converted = merge_snapshot(existing.as_ref(), &data.snapshot);
            debug!(executor = %data.executor_id, numa_nodes = converted.len(), "node view replaced");
            reg.hosts.insert(
                data.executor_id.clone(),
                ExecutorHostInfo {
                    executor_id: data.executor_id.clone(),
                    node_data: data,
                    nodes: converted,
                },
            );
        }
    }

    /// Incremental single-node refresh with the same conversion. Unknown
    /// executors are ignored — a snapshot cannot register a host.
    pub fn update_snapshot(&self, snapshot: ExecutorResourceSnapshot) {
        let mut reg = self.write();
        let Some(host) = reg.hosts.get_mut(&snapshot.executor_id) else {
            debug!(executor = %snapshot.executor_id, "snapshot for unregistered executor dropped");
            return;
        };
        host.nodes = merge_snapshot(Some(&host.nodes), &snapshot);
        host.node_data.snapshot = snapshot;
    }

    /// Drop executors (deregistration or heartbeat timeout).
    pub fn remove(&self, executor_ids: &[ExecutorId]) {
        let mut reg = self.write();
        for id in executor_ids {
            if reg.hosts.remove(id).is_some() {
                debug!(executor = %id, "executor removed from resource registry");
            }
        }
    }

    // ── Selection ──────────────────────────────────────────────────

    /// Find a host with capacity for `requirements`, soft-lock it, and
    /// return the grant. Candidates are shuffled to avoid hot-node bias;
    /// CPU and memory must fit on the SAME NUMA node. `filter` is the
    /// caller's placement-policy check, applied before locking.
    pub fn select_node<F>(
        &self,
        requirements: &[ResourceRequirement],
        filter: F,
    ) -> Option<AllocatedExecutorNode>
    where
        F: Fn(&ExecutorHostInfo) -> bool,
    {
        let (cpu_needed, mem_needed) = ResourceRequirement::totals(requirements);
        let mut reg = self.write();

        let mut candidates: Vec<ExecutorId> = reg.hosts.keys().cloned().collect();
        candidates.shuffle(&mut rand::rng());

        for executor_id in candidates {
            if reg.blacklist.contains(&executor_id) {
                continue;
            }
            let Some(host) = reg.hosts.get(&executor_id) else {
                continue;
            };
            if host.node_data.blacklisted {
                continue;
            }

            // First NUMA node with enough free cores and memory together.
            let candidate = host.nodes.iter().find_map(|(numa, node)| {
                let free = node.free_cores();
                (free.len() as u32 >= cpu_needed && node.memory.available_mb >= mem_needed)
                    .then_some((*numa, free))
            });
            let Some((numa, free)) = candidate else {
                continue;
            };

            if !filter(host) {
                continue;
            }

            let hostname = host.node_data.hostname.clone();
            let port = host.node_data.port;
            let transport = host.node_data.transport;
            let tags = host.node_data.tags.clone();

            // Commit: still under the same write lock, so find-and-lock is atomic.
            let Some(host) = reg.hosts.get_mut(&executor_id) else {
                continue;
            };
            let Some(node) = host.nodes.get_mut(&numa) else {
                continue;
            };
            let granted: BTreeSet<CoreId> =
                free.into_iter().take(cpu_needed as usize).collect();
            for core in &granted {
                node.cores.insert(*core, CoreState::Allocated);
            }
            node.memory.available_mb -= mem_needed;
            node.memory.locked_mb += mem_needed;

            debug!(
                executor = %executor_id,
                numa,
                cores = granted.len(),
                memory_mb = mem_needed,
                "resources soft-locked"
            );

            return Some(AllocatedExecutorNode {
                executor_id,
                hostname,
                port,
                transport,
                tags,
                cpu: CpuAllocation::on_node(numa, granted),
                memory: MemoryAllocation::on_node(numa, mem_needed),
            });
        }

        debug!(cpu_needed, mem_needed, "no executor satisfies requirements");
        None
    }

    /// Reverse a soft lock: cores back to `Free`, memory back to available.
    pub fn deselect_node(&self, node: &AllocatedExecutorNode) {
        self.release(&node.executor_id, &node.cpu, &node.memory);
    }

    /// Return a grant to the free pool by its raw parts — the path used
    /// when the grant is reconstructed from a persisted instance record.
    pub fn release(
        &self,
        executor_id: &ExecutorId,
        cpu: &CpuAllocation,
        memory: &MemoryAllocation,
    ) {
        let mut reg = self.write();
        let Some(host) = reg.hosts.get_mut(executor_id) else {
            warn!(executor = %executor_id, "release for unknown executor dropped");
            return;
        };
        for (numa, cores) in &cpu.cores {
            if let Some(info) = host.nodes.get_mut(numa) {
                for core in cores {
                    info.cores.insert(*core, CoreState::Free);
                }
            }
        }
        for (numa, mb) in &memory.size_mb {
            if let Some(info) = host.nodes.get_mut(numa) {
                info.memory.available_mb += mb;
                info.memory.locked_mb = info.memory.locked_mb.saturating_sub(*mb);
            }
        }
        debug!(executor = %executor_id, "resources released");
    }

    // ── Blacklist ──────────────────────────────────────────────────

    /// Whether a host is excluded by either flag.
    pub fn is_blacklisted(&self, executor_id: &ExecutorId) -> bool {
        let reg = self.read();
        reg.blacklist.contains(executor_id)
            || reg
                .hosts
                .get(executor_id)
                .is_some_and(|h| h.node_data.blacklisted)
    }

    /// Exclude a host from selection. Idempotent.
    pub fn mark_blacklisted(&self, executor_id: &ExecutorId) {
        self.write().blacklist.insert(executor_id.clone());
    }

    /// Lift the registry-level exclusion. Idempotent; does not clear the
    /// executor's own flag.
    pub fn unmark_blacklisted(&self, executor_id: &ExecutorId) {
        self.write().blacklist.remove(executor_id);
    }
}

/// Convert a raw snapshot, preserving soft locks from the existing view.
fn merge_snapshot(
    existing: Option<&BTreeMap<NumaNodeId, NumaNodeInfo>>,
    snapshot: &ExecutorResourceSnapshot,
) -> BTreeMap<NumaNodeId, NumaNodeInfo> {
    let mut converted = BTreeMap::new();
    for (numa, raw) in &snapshot.nodes {
        let mut info = NumaNodeInfo::default();
        for core in &raw.free_cores {
            info.cores.insert(*core, CoreState::Free);
        }
        for core in &raw.used_cores {
            info.cores.insert(*core, CoreState::InUse);
        }
        info.memory.available_mb = raw.available_memory_mb;
        info.memory.used_mb = raw.used_memory_mb;

        if let Some(old) = existing.and_then(|map| map.get(numa)) {
            // Soft locks survive refreshes: the executor does not know
            // about grants whose instances have not started yet.
            for (core, state) in &old.cores {
                if *state == CoreState::Allocated {
                    info.cores.insert(*core, CoreState::Allocated);
                }
            }
            info.memory.locked_mb = old.memory.locked_mb;
            info.memory.available_mb =
                info.memory.available_mb.saturating_sub(old.memory.locked_mb);
        }

        converted.insert(*numa, info);
    }
    converted
}
