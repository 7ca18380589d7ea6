//! drover-state — embedded state store for the Drover controller.
//!
//! Backed by [redb](https://docs.rs/redb), holds the controller's durable
//! view: application records, instance records, task records, and executor
//! registrations. All domain types are JSON-serialized into redb's `&[u8]`
//! value columns; composite keys (`{app_id}:{instance_id}`) enable prefix
//! scans for related records.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and is shared across async tasks. An in-memory backend exists for tests.

pub mod error;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use store::StateStore;
pub use types::*;
