//! drover-scheduler — stateless placement policy over the cluster registry.
//!
//! The scheduler answers one question: "which executor gets this instance?"
//! It delegates capacity search and soft-locking to
//! `drover_cluster::ClusterResourcesDb` and contributes the placement-policy
//! filter (one-per-host, max-N-per-host, any) evaluated against fresh
//! instance counts from the state store.
//!
//! Allocations are tracked per scheduling session — the uuid correlation id
//! that groups the grants of one scale/replace operation — so the owning
//! action can roll back or finalise them exactly once.

pub mod error;
pub mod scheduler;

pub use error::{SchedulerError, SchedulerResult};
pub use scheduler::InstanceScheduler;
