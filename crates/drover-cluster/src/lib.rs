//! drover-cluster — the controller's live view of the executor fleet.
//!
//! Two pieces:
//!
//! - **`resources`** — `ClusterResourcesDb`, the in-memory, concurrency-safe
//!   registry of per-executor NUMA resource state. Node selection plus
//!   soft-lock is one atomic write; this is where double-allocation is
//!   prevented.
//! - **`membership`** — executor join/heartbeat processing and dead-node
//!   detection, feeding the resources registry and the durable executor
//!   records.
//!
//! Placement *policy* lives in `drover-scheduler`; this crate only answers
//! "which host has capacity" and keeps the books.

pub mod membership;
pub mod resources;
pub mod types;

pub use membership::MembershipManager;
pub use resources::ClusterResourcesDb;
pub use types::{
    AllocatedExecutorNode, CoreState, ExecutorHostInfo, ExecutorNodeData,
    ExecutorResourceSnapshot, MemoryInfo, NumaNodeInfo, NumaNodeSnapshot,
};
