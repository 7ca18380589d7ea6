//! Resource model — abstract requirements and concrete NUMA-aware grants.
//!
//! A spec asks for resources in the abstract (`ResourceRequirement`); the
//! scheduler answers with concrete grants (`CpuAllocation`,
//! `MemoryAllocation`) pinned to NUMA nodes on a specific executor. Grants
//! are owned by the instance for its lifetime and handed back to the
//! cluster resources DB when it terminates.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::spec::{CoreId, NumaNodeId};

/// An abstract resource ask, derived from an application or task spec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceRequirement {
    /// Number of CPU cores required.
    Cpu { count: u32 },
    /// Memory required, in megabytes.
    Memory { size_mb: u64 },
}

impl ResourceRequirement {
    /// Fold a requirement list into `(cpu_cores, memory_mb)` totals.
    pub fn totals(requirements: &[ResourceRequirement]) -> (u32, u64) {
        let mut cpu = 0u32;
        let mut mem = 0u64;
        for req in requirements {
            match req {
                ResourceRequirement::Cpu { count } => cpu += count,
                ResourceRequirement::Memory { size_mb } => mem += size_mb,
            }
        }
        (cpu, mem)
    }
}

/// Concrete CPU grant: NUMA node → the core ids reserved there.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CpuAllocation {
    pub cores: BTreeMap<NumaNodeId, BTreeSet<CoreId>>,
}

impl CpuAllocation {
    /// Grant on a single NUMA node.
    pub fn on_node(numa_node: NumaNodeId, cores: BTreeSet<CoreId>) -> Self {
        let mut map = BTreeMap::new();
        map.insert(numa_node, cores);
        Self { cores: map }
    }

    /// Total number of cores across all NUMA nodes.
    pub fn core_count(&self) -> u32 {
        self.cores.values().map(|set| set.len() as u32).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.cores.values().all(BTreeSet::is_empty)
    }
}

/// Concrete memory grant: NUMA node → megabytes reserved there.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemoryAllocation {
    pub size_mb: BTreeMap<NumaNodeId, u64>,
}

impl MemoryAllocation {
    /// Grant on a single NUMA node.
    pub fn on_node(numa_node: NumaNodeId, size_mb: u64) -> Self {
        let mut map = BTreeMap::new();
        map.insert(numa_node, size_mb);
        Self { size_mb: map }
    }

    /// Total megabytes across all NUMA nodes.
    pub fn total_mb(&self) -> u64 {
        self.size_mb.values().sum()
    }
}

/// A concrete grant of either kind.
///
/// Dispatch over the variants is an exhaustive `match` — there is no
/// open-ended allocation hierarchy.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResourceAllocation {
    Cpu(CpuAllocation),
    Memory(MemoryAllocation),
}
