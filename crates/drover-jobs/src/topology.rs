//! Topology builder — ordered stages of sequential and parallel work.

use std::sync::Arc;

use crate::job::{Job, JobContext, JobResult};

/// One stage of a topology. Stages run strictly in order.
pub(crate) enum Stage<R> {
    /// Jobs run one after another; a failure stops the rest of the chain.
    Sequential(Vec<Arc<dyn Job<R>>>),
    /// Jobs fan out with at most `parallelism` in flight.
    Parallel {
        parallelism: usize,
        jobs: Vec<Arc<dyn Job<R>>>,
    },
}

/// A composed DAG of jobs: sequential chains and bounded fan-outs.
///
/// A topology can itself be nested inside another via [`SequenceJob`] —
/// replace-instance uses that for its per-instance [stop, start] chains.
pub struct JobTopology<R> {
    pub(crate) stages: Vec<Stage<R>>,
}

impl<R> Default for JobTopology<R> {
    fn default() -> Self {
        Self { stages: Vec::new() }
    }
}

impl<R> JobTopology<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append one job as its own sequential stage.
    pub fn add_job(mut self, job: impl Job<R> + 'static) -> Self {
        self.stages.push(Stage::Sequential(vec![Arc::new(job)]));
        self
    }

    /// Append a sequential chain — each job depends on the one before it.
    pub fn add_jobs(mut self, jobs: Vec<Arc<dyn Job<R>>>) -> Self {
        if !jobs.is_empty() {
            self.stages.push(Stage::Sequential(jobs));
        }
        self
    }

    /// Append a bounded-concurrency fan-out stage.
    pub fn add_parallel(mut self, parallelism: usize, jobs: Vec<Arc<dyn Job<R>>>) -> Self {
        if !jobs.is_empty() {
            self.stages.push(Stage::Parallel { parallelism, jobs });
        }
        self
    }

    /// Whether the topology holds no work at all.
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Total number of jobs across all stages.
    pub fn job_count(&self) -> usize {
        self.stages
            .iter()
            .map(|stage| match stage {
                Stage::Sequential(jobs) => jobs.len(),
                Stage::Parallel { jobs, .. } => jobs.len(),
            })
            .sum()
    }
}

/// An ordered job chain wrapped as a single job, for nesting inside a
/// fan-out stage.
///
/// Fails fast: the first failing link aborts the chain, and the chain's
/// result is the last link's result.
pub struct SequenceJob<R> {
    label: String,
    jobs: Vec<Arc<dyn Job<R>>>,
}

impl<R> SequenceJob<R> {
    pub fn new(label: impl Into<String>, jobs: Vec<Arc<dyn Job<R>>>) -> Self {
        Self {
            label: label.into(),
            jobs,
        }
    }
}

#[async_trait::async_trait]
impl<R: Send + Default> Job<R> for SequenceJob<R> {
    fn label(&self) -> String {
        self.label.clone()
    }

    async fn execute(&self, ctx: &JobContext) -> JobResult<R> {
        let mut last = R::default();
        for job in &self.jobs {
            if ctx.is_cancelled() {
                return Err(crate::job::JobError::Cancelled);
            }
            last = job.execute(ctx).await?;
        }
        Ok(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::JobError;
    use std::sync::Mutex;

    struct RecordingJob {
        name: &'static str,
        outcome: JobResult<bool>,
        log: Arc<Mutex<Vec<&'static str>>>,
    }

    #[async_trait::async_trait]
    impl Job<bool> for RecordingJob {
        fn label(&self) -> String {
            self.name.to_string()
        }

        async fn execute(&self, _ctx: &JobContext) -> JobResult<bool> {
            self.log.lock().unwrap().push(self.name);
            self.outcome.clone()
        }
    }

    #[test]
    fn empty_stages_are_not_added() {
        let topology: JobTopology<bool> = JobTopology::new()
            .add_jobs(Vec::new())
            .add_parallel(4, Vec::new());
        assert!(topology.is_empty());
        assert_eq!(topology.job_count(), 0);
    }

    #[test]
    fn job_count_spans_stages() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let mk = |name| -> Arc<dyn Job<bool>> {
            Arc::new(RecordingJob {
                name,
                outcome: Ok(true),
                log: log.clone(),
            })
        };
        let topology = JobTopology::new()
            .add_jobs(vec![mk("a"), mk("b")])
            .add_parallel(2, vec![mk("c")]);
        assert_eq!(topology.job_count(), 3);
    }

    #[tokio::test]
    async fn sequence_job_fails_fast() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let jobs: Vec<Arc<dyn Job<bool>>> = vec![
            Arc::new(RecordingJob {
                name: "stop",
                outcome: Err(JobError::failed("stop failed")),
                log: log.clone(),
            }),
            Arc::new(RecordingJob {
                name: "start",
                outcome: Ok(true),
                log: log.clone(),
            }),
        ];
        let seq = SequenceJob::new("replace:inst-1", jobs);

        let result = seq.execute(&JobContext::detached()).await;
        assert!(result.is_err());
        // The start link never ran.
        assert_eq!(*log.lock().unwrap(), vec!["stop"]);
    }

    #[tokio::test]
    async fn sequence_job_yields_last_result() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let jobs: Vec<Arc<dyn Job<bool>>> = vec![
            Arc::new(RecordingJob {
                name: "stop",
                outcome: Ok(false),
                log: log.clone(),
            }),
            Arc::new(RecordingJob {
                name: "start",
                outcome: Ok(true),
                log: log.clone(),
            }),
        ];
        let seq = SequenceJob::new("replace:inst-1", jobs);

        assert!(seq.execute(&JobContext::detached()).await.unwrap());
        assert_eq!(*log.lock().unwrap(), vec!["stop", "start"]);
    }
}
