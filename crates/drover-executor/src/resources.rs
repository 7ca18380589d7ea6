//! Executor-local resource lock.
//!
//! The controller soft-locks resources cluster-side before sending a
//! start; the executor locks the same cores and memory again locally
//! before running anything. Double bookkeeping: a confused controller (or
//! a replayed message) cannot oversubscribe a node whose own lock says no.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Mutex, PoisonError};

use thiserror::Error;
use tracing::debug;

use drover_cluster::{ExecutorResourceSnapshot, NumaNodeSnapshot};
use drover_core::{CoreId, CpuAllocation, ExecutorId, InstanceId, MemoryAllocation, NumaNodeId};

/// Why a local lock was refused.
#[derive(Debug, Error)]
pub enum ResourceLockError {
    #[error("unknown NUMA node {0}")]
    UnknownNumaNode(NumaNodeId),

    #[error("core {core} on NUMA node {numa_node} is not free")]
    CoreUnavailable { numa_node: NumaNodeId, core: CoreId },

    #[error("insufficient memory on NUMA node {numa_node}: need {needed_mb} MB, have {free_mb} MB")]
    MemoryUnavailable {
        numa_node: NumaNodeId,
        needed_mb: u64,
        free_mb: u64,
    },

    #[error("instance {0} already holds a lock")]
    AlreadyLocked(InstanceId),
}

struct LocalNuma {
    all_cores: BTreeSet<CoreId>,
    free_cores: BTreeSet<CoreId>,
    total_memory_mb: u64,
    free_memory_mb: u64,
}

struct LockState {
    nodes: BTreeMap<NumaNodeId, LocalNuma>,
    held: HashMap<InstanceId, (CpuAllocation, MemoryAllocation)>,
}

/// Mutex-guarded local core/memory accounting for one executor.
pub struct ExecutorResourceLock {
    inner: Mutex<LockState>,
}

impl ExecutorResourceLock {
    /// Build from the node's hardware topology:
    /// NUMA node → (core ids, memory MB).
    pub fn new(topology: BTreeMap<NumaNodeId, (BTreeSet<CoreId>, u64)>) -> Self {
        let nodes = topology
            .into_iter()
            .map(|(numa, (cores, memory_mb))| {
                (
                    numa,
                    LocalNuma {
                        all_cores: cores.clone(),
                        free_cores: cores,
                        total_memory_mb: memory_mb,
                        free_memory_mb: memory_mb,
                    },
                )
            })
            .collect();
        Self {
            inner: Mutex::new(LockState {
                nodes,
                held: HashMap::new(),
            }),
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, LockState> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Lock the exact cores and memory the controller granted. All-or-
    /// nothing: a partial fit changes nothing and returns the refusal.
    pub fn lock(
        &self,
        instance_id: &InstanceId,
        cpu: &CpuAllocation,
        memory: &MemoryAllocation,
    ) -> Result<(), ResourceLockError> {
        let mut state = self.lock_state();
        if state.held.contains_key(instance_id) {
            return Err(ResourceLockError::AlreadyLocked(instance_id.clone()));
        }

        // Validate before mutating anything.
        for (numa, cores) in &cpu.cores {
            let node = state
                .nodes
                .get(numa)
                .ok_or(ResourceLockError::UnknownNumaNode(*numa))?;
            for core in cores {
                if !node.free_cores.contains(core) {
                    return Err(ResourceLockError::CoreUnavailable {
                        numa_node: *numa,
                        core: *core,
                    });
                }
            }
        }
        for (numa, mb) in &memory.size_mb {
            let node = state
                .nodes
                .get(numa)
                .ok_or(ResourceLockError::UnknownNumaNode(*numa))?;
            if node.free_memory_mb < *mb {
                return Err(ResourceLockError::MemoryUnavailable {
                    numa_node: *numa,
                    needed_mb: *mb,
                    free_mb: node.free_memory_mb,
                });
            }
        }

        for (numa, cores) in &cpu.cores {
            if let Some(node) = state.nodes.get_mut(numa) {
                for core in cores {
                    node.free_cores.remove(core);
                }
            }
        }
        for (numa, mb) in &memory.size_mb {
            if let Some(node) = state.nodes.get_mut(numa) {
                node.free_memory_mb -= mb;
            }
        }
        state
            .held
            .insert(instance_id.clone(), (cpu.clone(), memory.clone()));
        debug!(instance = %instance_id, "local resources locked");
        Ok(())
    }

    /// Release an instance's lock. Unknown instances are a no-op.
    pub fn release(&self, instance_id: &InstanceId) -> bool {
        let mut state = self.lock_state();
        let Some((cpu, memory)) = state.held.remove(instance_id) else {
            return false;
        };
        for (numa, cores) in &cpu.cores {
            if let Some(node) = state.nodes.get_mut(numa) {
                for core in cores {
                    node.free_cores.insert(*core);
                }
            }
        }
        for (numa, mb) in &memory.size_mb {
            if let Some(node) = state.nodes.get_mut(numa) {
                node.free_memory_mb = (node.free_memory_mb + mb).min(node.total_memory_mb);
            }
        }
        debug!(instance = %instance_id, "local resources released");
        true
    }

    /// Raw snapshot for the heartbeat report.
    pub fn snapshot(&self, executor_id: &ExecutorId) -> ExecutorResourceSnapshot {
        let state = self.lock_state();
        let nodes = state
            .nodes
            .iter()
            .map(|(numa, node)| {
                (
                    *numa,
                    NumaNodeSnapshot {
                        free_cores: node.free_cores.clone(),
                        used_cores: node
                            .all_cores
                            .difference(&node.free_cores)
                            .copied()
                            .collect(),
                        available_memory_mb: node.free_memory_mb,
                        used_memory_mb: node.total_memory_mb - node.free_memory_mb,
                    },
                )
            })
            .collect();
        ExecutorResourceSnapshot {
            executor_id: executor_id.clone(),
            nodes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single_numa(cores: u32, memory_mb: u64) -> ExecutorResourceLock {
        ExecutorResourceLock::new(BTreeMap::from([(
            0,
            ((0..cores).collect::<BTreeSet<u32>>(), memory_mb),
        )]))
    }

    fn grant(cores: &[u32], memory_mb: u64) -> (CpuAllocation, MemoryAllocation) {
        (
            CpuAllocation::on_node(0, cores.iter().copied().collect()),
            MemoryAllocation::on_node(0, memory_mb),
        )
    }

    #[test]
    fn lock_and_release_round_trip() {
        let lock = single_numa(4, 1024);
        let (cpu, memory) = grant(&[0, 1], 512);

        lock.lock(&"inst-1".to_string(), &cpu, &memory).unwrap();
        let snapshot = lock.snapshot(&"exec-1".to_string());
        assert_eq!(snapshot.nodes[&0].free_cores.len(), 2);
        assert_eq!(snapshot.nodes[&0].available_memory_mb, 512);

        assert!(lock.release(&"inst-1".to_string()));
        let snapshot = lock.snapshot(&"exec-1".to_string());
        assert_eq!(snapshot.nodes[&0].free_cores.len(), 4);
        assert_eq!(snapshot.nodes[&0].available_memory_mb, 1024);

        assert!(!lock.release(&"inst-1".to_string()));
    }

    #[test]
    fn conflicting_core_is_refused_without_partial_effects() {
        let lock = single_numa(2, 1024);
        let (cpu, memory) = grant(&[0], 256);
        lock.lock(&"inst-1".to_string(), &cpu, &memory).unwrap();

        // Asks for a free core AND the taken one.
        let (cpu2, memory2) = grant(&[0, 1], 256);
        let err = lock.lock(&"inst-2".to_string(), &cpu2, &memory2).unwrap_err();
        assert!(matches!(err, ResourceLockError::CoreUnavailable { core: 0, .. }));

        // Core 1 and the memory are untouched.
        let snapshot = lock.snapshot(&"exec-1".to_string());
        assert!(snapshot.nodes[&0].free_cores.contains(&1));
        assert_eq!(snapshot.nodes[&0].available_memory_mb, 768);
    }

    #[test]
    fn memory_exhaustion_is_refused() {
        let lock = single_numa(4, 512);
        let (cpu, memory) = grant(&[0], 400);
        lock.lock(&"inst-1".to_string(), &cpu, &memory).unwrap();

        let (cpu2, memory2) = grant(&[1], 400);
        let err = lock.lock(&"inst-2".to_string(), &cpu2, &memory2).unwrap_err();
        assert!(matches!(err, ResourceLockError::MemoryUnavailable { .. }));
    }

    #[test]
    fn double_lock_for_same_instance_is_refused() {
        let lock = single_numa(4, 1024);
        let (cpu, memory) = grant(&[0], 128);
        lock.lock(&"inst-1".to_string(), &cpu, &memory).unwrap();
        let err = lock.lock(&"inst-1".to_string(), &cpu, &memory).unwrap_err();
        assert!(matches!(err, ResourceLockError::AlreadyLocked(_)));
    }
}
