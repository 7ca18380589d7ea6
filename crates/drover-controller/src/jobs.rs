//! The two concrete jobs every application action is built from.
//!
//! `StartSingleInstanceJob`: schedule a node, send the start message, poll
//! the instance store until healthy. `StopSingleInstanceJob`: send the stop
//! message, poll until terminal, return the resources. Both observe
//! cancellation between poll attempts and convert every transport or
//! timeout problem into a job failure — nothing escapes as a panic or
//! unhandled error.

use std::sync::Arc;

use tracing::{debug, warn};

use drover_core::{
    AppId, ApplicationSpec, Envelope, InstanceId, InstanceSpec, InstanceState, MessagePayload,
    MessageResponse, SessionId, epoch_secs,
};
use drover_jobs::{Job, JobContext, JobError, JobResult};
use drover_state::InstanceInfo;

use crate::context::ControllerContext;

/// Schedule, start, and wait for one new instance.
pub struct StartSingleInstanceJob {
    ctx: Arc<ControllerContext>,
    session_id: SessionId,
    spec: ApplicationSpec,
}

impl StartSingleInstanceJob {
    pub fn new(ctx: Arc<ControllerContext>, session_id: SessionId, spec: ApplicationSpec) -> Self {
        Self {
            ctx,
            session_id,
            spec,
        }
    }

    /// Undo the pending record and the soft lock after a failed start.
    fn roll_back(&self, instance_id: &str, node: &drover_cluster::AllocatedExecutorNode) {
        if let Err(e) = self.ctx.state.delete_instance(&self.spec.id, instance_id) {
            warn!(app = %self.spec.id, instance = %instance_id, error = %e,
                "failed to delete pending record during rollback");
        }
        self.ctx.scheduler.discard_allocation(&self.session_id, node);
    }
}

#[async_trait::async_trait]
impl Job<bool> for StartSingleInstanceJob {
    fn label(&self) -> String {
        format!("start:{}", self.spec.id)
    }

    async fn execute(&self, job_ctx: &JobContext) -> JobResult<bool> {
        // 1. Placement. No node is a normal capacity miss, but this job
        //    cannot proceed without one.
        let node = self
            .ctx
            .scheduler
            .schedule(&self.session_id, &self.spec)
            .map_err(|e| JobError::failed(format!("scheduling failed: {e}")))?;
        let Some(node) = node else {
            return Err(JobError::failed("no node available"));
        };

        // 2. Record the pending instance, then hand it to the executor.
        let instance_id = format!("inst-{}", uuid::Uuid::new_v4().simple());
        let now = epoch_secs();
        let info = InstanceInfo {
            app_id: self.spec.id.clone(),
            instance_id: instance_id.clone(),
            executor_id: node.executor_id.clone(),
            state: InstanceState::Pending,
            cpu: node.cpu.clone(),
            memory: node.memory.clone(),
            address: None,
            created_at: now,
            updated_at: now,
            error: None,
        };
        if let Err(e) = self.ctx.state.put_instance(&info) {
            self.ctx.scheduler.discard_allocation(&self.session_id, &node);
            return Err(JobError::failed(format!("failed to record instance: {e}")));
        }

        let instance_spec = InstanceSpec::for_application(
            &self.spec,
            instance_id.clone(),
            node.cpu.clone(),
            node.memory.clone(),
        );
        let envelope =
            Envelope::controller_request(MessagePayload::StartInstance { spec: instance_spec });

        match self.ctx.comms.send(&node.executor_id, envelope).await {
            Ok(MessageResponse::Accepted) => {
                // The executor owns the instance now; the grant belongs to
                // it until a stop or sweep returns it.
                self.ctx.scheduler.claim_allocation(&self.session_id, &node);
            }
            Ok(MessageResponse::Rejected { reason }) | Ok(MessageResponse::Failed { reason }) => {
                self.roll_back(&instance_id, &node);
                return Err(JobError::failed(format!("start not accepted: {reason}")));
            }
            Err(e) => {
                self.roll_back(&instance_id, &node);
                return Err(JobError::failed(format!("start message failed: {e}")));
            }
        }

        // 3. Poll the instance store until the executor reports healthy.
        let retry = self.ctx.retries.instance_state_check();
        if !retry.initial_delay.is_zero()
            && !job_ctx.sleep_unless_cancelled(retry.initial_delay).await
        {
            return Err(JobError::Cancelled);
        }
        for attempt in 0..retry.max_attempts {
            if attempt > 0 && !job_ctx.sleep_unless_cancelled(retry.delay).await {
                return Err(JobError::Cancelled);
            }
            let current = self
                .ctx
                .state
                .get_instance(&self.spec.id, &instance_id)
                .map_err(|e| JobError::failed(format!("instance poll failed: {e}")))?;
            match current {
                Some(report) if report.state == InstanceState::Healthy => {
                    debug!(app = %self.spec.id, instance = %instance_id, "instance healthy");
                    return Ok(true);
                }
                Some(report) if report.state.is_terminal() => {
                    // Died before ever serving: the grant goes straight back.
                    self.ctx
                        .release_instance_resources(&self.spec.id, &instance_id)
                        .map_err(|e| {
                            JobError::failed(format!("resource release failed: {e}"))
                        })?;
                    let reason = report
                        .error
                        .unwrap_or_else(|| format!("instance ended in {:?}", report.state));
                    return Err(JobError::failed(format!("instance failed: {reason}")));
                }
                _ => {}
            }
        }

        // Alive but never healthy: the instance keeps its grant; the stop
        // path or the reconciler returns it later.
        Err(JobError::failed(format!(
            "instance {instance_id} did not become healthy within {} attempts",
            retry.max_attempts
        )))
    }
}

/// Stop one instance and return its resources to the pool.
pub struct StopSingleInstanceJob {
    ctx: Arc<ControllerContext>,
    app_id: AppId,
    instance_id: InstanceId,
}

impl StopSingleInstanceJob {
    pub fn new(ctx: Arc<ControllerContext>, app_id: AppId, instance_id: InstanceId) -> Self {
        Self {
            ctx,
            app_id,
            instance_id,
        }
    }

    fn finish_stopped(&self) -> JobResult<bool> {
        self.ctx
            .release_instance_resources(&self.app_id, &self.instance_id)
            .map_err(|e| JobError::failed(format!("resource release failed: {e}")))?;
        Ok(true)
    }
}

#[async_trait::async_trait]
impl Job<bool> for StopSingleInstanceJob {
    fn label(&self) -> String {
        format!("stop:{}", self.instance_id)
    }

    async fn execute(&self, job_ctx: &JobContext) -> JobResult<bool> {
        // A missing record means there is nothing to stop. Idempotent.
        let current = self
            .ctx
            .state
            .get_instance(&self.app_id, &self.instance_id)
            .map_err(|e| JobError::failed(format!("instance lookup failed: {e}")))?;
        let Some(info) = current else {
            debug!(instance = %self.instance_id, "stop for unknown instance is a no-op");
            return Ok(true);
        };
        if info.state.is_terminal() {
            return self.finish_stopped();
        }

        // Without a resource snapshot of the hosting executor there is no
        // way to confirm a safe stop.
        if self.ctx.resources.snapshot_of(&info.executor_id).is_none() {
            return Err(JobError::failed(format!(
                "no snapshot for executor {} hosting {}",
                info.executor_id, self.instance_id
            )));
        }

        let envelope = Envelope::controller_request(MessagePayload::StopInstance {
            instance_id: self.instance_id.clone(),
        });
        match self.ctx.comms.send(&info.executor_id, envelope).await {
            Ok(MessageResponse::Accepted) => {}
            Ok(MessageResponse::Rejected { reason }) | Ok(MessageResponse::Failed { reason }) => {
                return Err(JobError::failed(format!("stop not accepted: {reason}")));
            }
            Err(e) => {
                return Err(JobError::failed(format!("stop message failed: {e}")));
            }
        }

        let retry = self.ctx.retries.instance_stop_check();
        for attempt in 0..retry.max_attempts {
            if attempt > 0 && !job_ctx.sleep_unless_cancelled(retry.delay).await {
                return Err(JobError::Cancelled);
            }
            let current = self
                .ctx
                .state
                .get_instance(&self.app_id, &self.instance_id)
                .map_err(|e| JobError::failed(format!("instance poll failed: {e}")))?;
            match current {
                None => return Ok(true),
                Some(report) if report.state.is_terminal() => {
                    return self.finish_stopped();
                }
                _ => {}
            }
        }

        Err(JobError::failed(format!(
            "instance {} did not stop within {} attempts",
            self.instance_id, retry.max_attempts
        )))
    }
}
