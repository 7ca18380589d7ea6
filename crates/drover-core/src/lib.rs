//! drover-core — shared domain types for the Drover orchestrator.
//!
//! Everything here is plain data: the resource model (abstract requirements
//! and concrete NUMA-aware allocations), application/instance specs, the
//! lifecycle state enums for both sides of the control loop, retry budgets,
//! and the controller ↔ executor message vocabulary.
//!
//! The crates that do work (`drover-cluster`, `drover-scheduler`,
//! `drover-controller`, `drover-executor`) all speak these types.

pub mod message;
pub mod resources;
pub mod retry;
pub mod spec;
pub mod state;

pub use message::{
    CommsError, Communicator, Direction, Envelope, MessageHeader, MessagePayload,
    MessageResponse, SenderKind,
};
pub use resources::{CpuAllocation, MemoryAllocation, ResourceAllocation, ResourceRequirement};
pub use retry::{RetrySpec, RetrySpecFactory};
pub use spec::{
    AppId, ApplicationSpec, CheckSpec, CoreId, ExecutorId, InstanceId, InstanceKind,
    InstanceSpec, NumaNodeId, PlacementPolicy, SessionId, TaskId, TransportKind,
};
pub use state::{ApplicationState, InstanceState};

/// Seconds since the unix epoch, saturating to zero on clock skew.
pub fn epoch_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
