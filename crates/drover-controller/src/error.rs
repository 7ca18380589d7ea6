//! Controller error types.

use thiserror::Error;

/// Errors surfaced by controller actions.
///
/// Job-level failures (no capacity, transport, poll exhaustion) are not
/// here — they become job failures and application error messages, never
/// propagated exceptions.
#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("application not found: {0}")]
    ApplicationNotFound(String),

    #[error("state store error: {0}")]
    State(#[from] drover_state::StateError),

    #[error("scheduler error: {0}")]
    Scheduler(#[from] drover_scheduler::SchedulerError),
}

pub type ControllerResult<T> = Result<T, ControllerError>;
