//! The unit of work: a cancellable asynchronous job.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::watch;

/// Why a job did not produce a result.
#[derive(Debug, Clone, Error)]
pub enum JobError {
    /// The job ran and failed; the message is operator-facing.
    #[error("{0}")]
    Failed(String),

    /// The job observed the cancellation signal and stopped early.
    #[error("job cancelled")]
    Cancelled,
}

impl JobError {
    pub fn failed(reason: impl Into<String>) -> Self {
        JobError::Failed(reason.into())
    }
}

pub type JobResult<R> = Result<R, JobError>;

/// Carried into every job: the cooperative cancellation signal.
///
/// Cancellation is observed at checkpoints (typically between retry
/// attempts), never by pre-empting in-progress work.
#[derive(Clone)]
pub struct JobContext {
    cancelled: watch::Receiver<bool>,
    // Keeps the sender alive for detached contexts (tests, fire-and-forget).
    _keepalive: Option<Arc<watch::Sender<bool>>>,
}

impl JobContext {
    pub(crate) fn new(cancelled: watch::Receiver<bool>) -> Self {
        Self {
            cancelled,
            _keepalive: None,
        }
    }

    /// A context that can never be cancelled.
    pub fn detached() -> Self {
        let (tx, rx) = watch::channel(false);
        Self {
            cancelled: rx,
            _keepalive: Some(Arc::new(tx)),
        }
    }

    /// Whether cancellation has been requested.
    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }

    /// Sleep for `duration`, waking early on cancellation.
    ///
    /// Returns true when the full sleep elapsed, false when the job should
    /// stop. A dropped sender means the run was abandoned and counts as
    /// cancelled.
    pub async fn sleep_unless_cancelled(&self, duration: Duration) -> bool {
        if self.is_cancelled() {
            return false;
        }
        let mut rx = self.cancelled.clone();
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            changed = rx.changed() => match changed {
                Ok(()) => !*rx.borrow(),
                Err(_) => false,
            },
        }
    }
}

/// A cancellable, asynchronous unit of work producing an `R`.
#[async_trait::async_trait]
pub trait Job<R>: Send + Sync {
    /// Short label for logs.
    fn label(&self) -> String;

    async fn execute(&self, ctx: &JobContext) -> JobResult<R>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn detached_context_never_cancels() {
        let ctx = JobContext::detached();
        assert!(!ctx.is_cancelled());
        assert!(ctx.sleep_unless_cancelled(Duration::from_millis(1)).await);
    }

    #[tokio::test]
    async fn sleep_wakes_on_cancellation() {
        let (tx, rx) = watch::channel(false);
        let ctx = JobContext::new(rx);

        let handle = tokio::spawn({
            let ctx = ctx.clone();
            async move { ctx.sleep_unless_cancelled(Duration::from_secs(30)).await }
        });
        tx.send(true).unwrap();
        assert!(!handle.await.unwrap());
        assert!(ctx.is_cancelled());
    }

    #[tokio::test]
    async fn dropped_sender_counts_as_cancelled() {
        let (tx, rx) = watch::channel(false);
        let ctx = JobContext::new(rx);
        drop(tx);
        assert!(!ctx.sleep_unless_cancelled(Duration::from_secs(30)).await);
    }
}
