//! drover-controller — the controller half of the reconciliation loop.
//!
//! An [`ApplicationStateMachine`] routes incoming operations (create,
//! scale, replace, stop, destroy, suspend, recover) to per-state actions.
//! Each action computes a `JobTopology` of [`StartSingleInstanceJob`] /
//! [`StopSingleInstanceJob`] units, runs it through the job engine under a
//! fresh scheduling session, and maps the combined outcome back to the next
//! application state.
//!
//! The [`StalenessReconciler`] closes the loop's failure edge: instances
//! that stop reporting are swept to `Lost` and their resources returned to
//! the pool, so a vanished executor cannot leak capacity forever.

pub mod context;
pub mod error;
pub mod jobs;
pub mod machine;
pub mod operations;
pub mod reconcile;

pub use context::ControllerContext;
pub use error::{ControllerError, ControllerResult};
pub use jobs::{StartSingleInstanceJob, StopSingleInstanceJob};
pub use machine::ApplicationStateMachine;
pub use operations::ApplicationOperation;
pub use reconcile::StalenessReconciler;
