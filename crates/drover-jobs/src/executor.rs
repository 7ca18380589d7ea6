//! Runs a topology: stage ordering, bounded fan-out, result folding.

use std::sync::Arc;

use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::combiner::ResponseCombiner;
use crate::job::{JobContext, JobError};
use crate::topology::{JobTopology, Stage};

/// Final verdict of one topology run.
///
/// `cancelled` and `failure` are independent: a cancelled run is not a
/// failed run, and callers recover differently from each.
#[derive(Debug, Clone)]
pub struct JobExecutionResult<R> {
    /// The combined result of every job that completed.
    pub result: R,
    /// First failure cause observed, if any.
    pub failure: Option<String>,
    /// Whether cancellation cut the run short.
    pub cancelled: bool,
}

impl<R> JobExecutionResult<R> {
    /// True when every job completed and none failed.
    pub fn is_clean(&self) -> bool {
        self.failure.is_none() && !self.cancelled
    }
}

/// A detachable handle that can cancel a running topology.
#[derive(Clone)]
pub struct TopologyCanceller(Arc<watch::Sender<bool>>);

impl TopologyCanceller {
    /// Request cooperative cancellation.
    pub fn cancel(&self) {
        let _ = self.0.send(true);
    }
}

/// A topology in flight. Cancel is cooperative; `wait` joins the run.
pub struct RunningTopology<R> {
    cancel: Arc<watch::Sender<bool>>,
    handle: JoinHandle<JobExecutionResult<R>>,
}

impl<R: Default> RunningTopology<R> {
    /// Request cooperative cancellation of all in-flight jobs.
    pub fn cancel(&self) {
        let _ = self.cancel.send(true);
    }

    /// A handle that outlives this value, for cancelling from elsewhere.
    pub fn canceller(&self) -> TopologyCanceller {
        TopologyCanceller(self.cancel.clone())
    }

    /// Join the run and take its result.
    pub async fn wait(self) -> JobExecutionResult<R> {
        match self.handle.await {
            Ok(result) => result,
            Err(e) => {
                warn!(error = %e, "topology task aborted");
                JobExecutionResult {
                    result: R::default(),
                    failure: Some(format!("topology task aborted: {e}")),
                    cancelled: false,
                }
            }
        }
    }
}

/// Schedules job topologies onto the tokio runtime.
pub struct JobExecutor;

impl JobExecutor {
    /// Run `topology`, folding results through `combiner`.
    ///
    /// Stages execute strictly in order; parallel stages cap in-flight jobs
    /// at their `parallelism`. Every completed job's result is folded, the
    /// first failure is retained, and cancellation stops new jobs from
    /// starting while in-flight ones observe the signal at their next
    /// checkpoint.
    pub fn schedule<R>(
        topology: JobTopology<R>,
        combiner: Box<dyn ResponseCombiner<R>>,
    ) -> RunningTopology<R>
    where
        R: Send + Default + 'static,
    {
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let ctx = JobContext::new(cancel_rx);
        let handle = tokio::spawn(run(topology, combiner, ctx));
        RunningTopology {
            cancel: Arc::new(cancel_tx),
            handle,
        }
    }
}

async fn run<R>(
    topology: JobTopology<R>,
    mut combiner: Box<dyn ResponseCombiner<R>>,
    ctx: JobContext,
) -> JobExecutionResult<R>
where
    R: Send + Default + 'static,
{
    let mut failure: Option<String> = None;
    let mut cancelled = false;

    for stage in topology.stages {
        if ctx.is_cancelled() {
            cancelled = true;
            break;
        }
        match stage {
            Stage::Sequential(jobs) => {
                for job in jobs {
                    if ctx.is_cancelled() {
                        cancelled = true;
                        break;
                    }
                    let label = job.label();
                    match job.execute(&ctx).await {
                        Ok(response) => combiner.combine(response),
                        Err(JobError::Cancelled) => {
                            debug!(job = %label, "job cancelled");
                            cancelled = true;
                            break;
                        }
                        Err(JobError::Failed(reason)) => {
                            warn!(job = %label, %reason, "job failed");
                            if failure.is_none() {
                                failure = Some(reason);
                            }
                            // A sequential chain stops at its first failure.
                            break;
                        }
                    }
                }
            }
            Stage::Parallel { parallelism, jobs } => {
                let semaphore = Arc::new(Semaphore::new(parallelism.max(1)));
                let mut handles = Vec::with_capacity(jobs.len());
                for job in jobs {
                    let semaphore = semaphore.clone();
                    let ctx = ctx.clone();
                    handles.push(tokio::spawn(async move {
                        let Ok(_permit) = semaphore.acquire_owned().await else {
                            return Err(JobError::Cancelled);
                        };
                        if ctx.is_cancelled() {
                            return Err(JobError::Cancelled);
                        }
                        job.execute(&ctx).await
                    }));
                }
                for handle in handles {
                    match handle.await {
                        Ok(Ok(response)) => combiner.combine(response),
                        Ok(Err(JobError::Cancelled)) => cancelled = true,
                        Ok(Err(JobError::Failed(reason))) => {
                            if failure.is_none() {
                                failure = Some(reason);
                            }
                        }
                        Err(e) => {
                            if failure.is_none() {
                                failure = Some(format!("job panicked: {e}"));
                            }
                        }
                    }
                }
            }
        }
        if cancelled {
            break;
        }
    }

    JobExecutionResult {
        result: combiner.finish(),
        failure,
        cancelled,
    }
}
