//! Scheduler error types.

use thiserror::Error;

/// Errors that can occur during scheduling operations.
///
/// "No capacity" is not in here — an empty selection is a normal outcome,
/// surfaced as `Ok(None)`.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("application not found: {0}")]
    ApplicationNotFound(String),

    #[error("state store error: {0}")]
    State(#[from] drover_state::StateError),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;
