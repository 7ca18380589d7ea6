//! drover-executor — the executor half of the reconciliation loop.
//!
//! An [`InstanceEngine`] owns every instance running on this node: it
//! locks resources locally (double bookkeeping with the controller),
//! registers a per-instance state machine, drives it on a dedicated task
//! until terminal, and broadcasts every state change on a typed event bus.
//!
//! The container runtime is an opaque capability behind the
//! [`ContainerRuntime`] trait; an [`InProcessRuntime`] simulation backs
//! tests and single-node mode. Crash recovery re-adopts surviving
//! containers from their labels, and the [`ZombieReaper`] stops engine
//! entries whose containers have vanished.

pub mod checker;
pub mod engine;
pub mod events;
mod machine;
pub mod reaper;
pub mod recovery;
pub mod resources;
pub mod runtime;

pub use checker::{CheckOutcome, CheckPolicy};
pub use engine::{EngineConfig, EngineError, ExecutorIdentity, InstanceEngine};
pub use events::{EventBus, InstanceEvent, InstanceStatsTracker};
pub use reaper::ZombieReaper;
pub use recovery::recover_instances;
pub use resources::{ExecutorResourceLock, ResourceLockError};
pub use runtime::{
    ContainerId, ContainerRuntime, ContainerSpec, ContainerStatus, ContainerSummary,
    InProcessRuntime, RuntimeError, LABEL_INSTANCE_ID, LABEL_INSTANCE_KIND, LABEL_INSTANCE_SPEC,
    LABEL_MANAGED_BY,
};
