//! Application state machine — routes operations to job-topology actions.
//!
//! One machine serves all applications; operations for a single
//! application are expected to arrive serialized (the daemon processes
//! them one at a time per app). Each action opens a scheduling session,
//! runs its topology through the job engine, finalises the session exactly
//! once, and settles the application into its next state from the combined
//! result plus the current healthy-instance count.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, PoisonError};

use rand::seq::SliceRandom;
use tracing::{debug, info, warn};

use drover_core::{
    AppId, ApplicationSpec, ApplicationState, InstanceId, InstanceState, SessionId, epoch_secs,
};
use drover_jobs::{
    BooleanResponseCombiner, Job, JobExecutionResult, JobExecutor, JobTopology, SequenceJob,
    TopologyCanceller,
};
use drover_state::{ApplicationInfo, InstanceInfo};

use crate::context::ControllerContext;
use crate::error::{ControllerError, ControllerResult};
use crate::jobs::{StartSingleInstanceJob, StopSingleInstanceJob};
use crate::operations::{ApplicationOperation, route};

/// How a stop action treats the desired count afterwards.
enum StopMode {
    /// Targeted stop: the desired count shrinks to what remains.
    Targeted,
    /// Suspend: the desired count is kept for a later recover.
    Suspend,
}

/// Drives per-application lifecycle through job topologies.
pub struct ApplicationStateMachine {
    ctx: Arc<ControllerContext>,
    /// Fan-out cap for start/stop batches.
    parallelism: usize,
    /// Cancellers for in-flight operations, by application.
    active: Mutex<HashMap<AppId, TopologyCanceller>>,
}

impl ApplicationStateMachine {
    pub fn new(ctx: Arc<ControllerContext>) -> Self {
        Self {
            ctx,
            parallelism: 4,
            active: Mutex::new(HashMap::new()),
        }
    }

    /// Cap concurrent start/stop jobs per operation.
    pub fn with_parallelism(mut self, parallelism: usize) -> Self {
        self.parallelism = parallelism.max(1);
        self
    }

    /// Request cooperative cancellation of the application's in-flight
    /// operation. Returns false when nothing is running.
    pub fn cancel_operation(&self, app_id: &str) -> bool {
        let active = self.lock_active();
        match active.get(app_id) {
            Some(canceller) => {
                canceller.cancel();
                true
            }
            None => false,
        }
    }

    /// Apply one operation and return the application's resulting state.
    pub async fn handle(
        &self,
        app_id: &AppId,
        operation: ApplicationOperation,
    ) -> ControllerResult<ApplicationState> {
        match operation {
            ApplicationOperation::Create { spec } => self.handle_create(spec).await,
            operation => self.handle_existing(app_id, operation).await,
        }
    }

    async fn handle_existing(
        &self,
        app_id: &AppId,
        operation: ApplicationOperation,
    ) -> ControllerResult<ApplicationState> {
        let Some(mut app) = self.ctx.state.get_application(app_id)? else {
            return Err(ControllerError::ApplicationNotFound(app_id.clone()));
        };

        let Some(requested) = route(&app.state, &operation) else {
            debug!(
                app = %app_id,
                operation = operation.name(),
                state = ?app.state,
                "operation drained, no transition defined"
            );
            return Ok(app.state);
        };

        info!(app = %app_id, operation = operation.name(), next = ?requested, "operation accepted");
        if let ApplicationOperation::Scale { required } = &operation {
            app.desired_instances = *required;
        }
        app.state = requested;
        app.error = None;
        app.updated_at = epoch_secs();
        self.ctx.state.put_application(&app)?;

        match operation {
            ApplicationOperation::Scale { .. } | ApplicationOperation::Recover => {
                self.run_scale(app).await
            }
            ApplicationOperation::StopInstances { instance_ids } => {
                self.run_stop(app, instance_ids, StopMode::Targeted).await
            }
            ApplicationOperation::Suspend => {
                self.run_stop(app, Vec::new(), StopMode::Suspend).await
            }
            ApplicationOperation::ReplaceInstances {
                instance_ids,
                stop_first,
            } => self.run_replace(app, instance_ids, stop_first).await,
            ApplicationOperation::Destroy => self.run_destroy(app).await,
            // Handled above; a create against an existing app drains there.
            ApplicationOperation::Create { .. } => Ok(app.state),
        }
    }

    async fn handle_create(&self, spec: ApplicationSpec) -> ControllerResult<ApplicationState> {
        if let Some(existing) = self.ctx.state.get_application(&spec.id)? {
            debug!(app = %spec.id, "create for existing application drained");
            return Ok(existing.state);
        }
        let now = epoch_secs();
        let mut app = ApplicationInfo::created(spec, now);
        info!(app = %app.spec.id, instances = app.desired_instances, "application created");
        app.state = ApplicationState::ScalingRequested;
        self.ctx.state.put_application(&app)?;
        self.run_scale(app).await
    }

    // ── Actions ────────────────────────────────────────────────────

    /// Converge the live instance count toward the desired count.
    async fn run_scale(&self, app: ApplicationInfo) -> ControllerResult<ApplicationState> {
        let app_id = app.spec.id.clone();
        self.release_terminal_allocations(&app_id)?;

        let live = self.live_instances(&app_id)?;
        let current = live.len() as u32;
        let desired = app.desired_instances;
        let session = self.ctx.scheduler.open_session();

        let mut topology: JobTopology<bool> = JobTopology::new();
        if current < desired {
            let jobs: Vec<Arc<dyn Job<bool>>> = (0..desired - current)
                .map(|_| {
                    Arc::new(StartSingleInstanceJob::new(
                        self.ctx.clone(),
                        session.clone(),
                        app.spec.clone(),
                    )) as Arc<dyn Job<bool>>
                })
                .collect();
            debug!(app = %app_id, current, desired, starts = jobs.len(), "scaling up");
            topology = topology.add_parallel(self.parallelism, jobs);
        } else if current > desired {
            let victims = self.pick_stop_victims(&live, (current - desired) as usize);
            debug!(app = %app_id, current, desired, stops = victims.len(), "scaling down");
            let jobs: Vec<Arc<dyn Job<bool>>> = victims
                .into_iter()
                .map(|instance_id| {
                    Arc::new(StopSingleInstanceJob::new(
                        self.ctx.clone(),
                        app_id.clone(),
                        instance_id,
                    )) as Arc<dyn Job<bool>>
                })
                .collect();
            topology = topology.add_parallel(self.parallelism, jobs);
        } else {
            debug!(app = %app_id, desired, "already at desired count, nothing to do");
        }

        let result = self.run_topology(&app_id, &session, topology).await;
        self.settle(&app_id, ApplicationState::ScalingRequested, result)
    }

    /// Stop targeted instances (all live ones when the list is empty).
    async fn run_stop(
        &self,
        app: ApplicationInfo,
        instance_ids: Vec<InstanceId>,
        mode: StopMode,
    ) -> ControllerResult<ApplicationState> {
        let app_id = app.spec.id.clone();
        self.release_terminal_allocations(&app_id)?;

        let targets = self.stop_targets(&app_id, instance_ids)?;
        let session = self.ctx.scheduler.open_session();
        let jobs: Vec<Arc<dyn Job<bool>>> = targets
            .into_iter()
            .map(|instance_id| {
                Arc::new(StopSingleInstanceJob::new(
                    self.ctx.clone(),
                    app_id.clone(),
                    instance_id,
                )) as Arc<dyn Job<bool>>
            })
            .collect();
        let topology = JobTopology::new().add_parallel(self.parallelism, jobs);

        let result = self.run_topology(&app_id, &session, topology).await;

        // A targeted stop is also a statement about the desired count.
        if matches!(mode, StopMode::Targeted) {
            if let Some(mut app) = self.ctx.state.get_application(&app_id)? {
                app.desired_instances = self.live_instances(&app_id)?.len() as u32;
                self.ctx.state.put_application(&app)?;
            }
        }

        match mode {
            StopMode::Targeted => {
                self.settle(&app_id, ApplicationState::StopInstancesRequested, result)
            }
            // Suspend deliberately leaves desired > live; settling on the
            // count would loop forever, so settle on failures only.
            StopMode::Suspend => {
                self.settle_ignoring_count(&app_id, ApplicationState::StopInstancesRequested, result)
            }
        }
    }

    /// Replace targeted instances (all healthy ones when the list is
    /// empty) with fresh ones, one [stop, start] or [start, stop] chain
    /// per instance, fanned out in parallel.
    async fn run_replace(
        &self,
        app: ApplicationInfo,
        instance_ids: Vec<InstanceId>,
        stop_first: bool,
    ) -> ControllerResult<ApplicationState> {
        let app_id = app.spec.id.clone();
        self.release_terminal_allocations(&app_id)?;

        let targets = if instance_ids.is_empty() {
            self.live_instances(&app_id)?
                .into_iter()
                .filter(|i| i.state == InstanceState::Healthy)
                .map(|i| i.instance_id)
                .collect()
        } else {
            instance_ids
        };

        let session = self.ctx.scheduler.open_session();
        let jobs: Vec<Arc<dyn Job<bool>>> = targets
            .into_iter()
            .map(|instance_id| {
                let stop: Arc<dyn Job<bool>> = Arc::new(StopSingleInstanceJob::new(
                    self.ctx.clone(),
                    app_id.clone(),
                    instance_id.clone(),
                ));
                let start: Arc<dyn Job<bool>> = Arc::new(StartSingleInstanceJob::new(
                    self.ctx.clone(),
                    session.clone(),
                    app.spec.clone(),
                ));
                // Stop-first is resource-conservative but leaves a gap;
                // start-first transiently over-allocates.
                let chain = if stop_first {
                    vec![stop, start]
                } else {
                    vec![start, stop]
                };
                Arc::new(SequenceJob::new(format!("replace:{instance_id}"), chain))
                    as Arc<dyn Job<bool>>
            })
            .collect();
        let topology = JobTopology::new().add_parallel(self.parallelism, jobs);

        let result = self.run_topology(&app_id, &session, topology).await;
        self.settle(&app_id, ApplicationState::ReplaceInstancesRequested, result)
    }

    /// Stop everything and tear the application down.
    async fn run_destroy(&self, app: ApplicationInfo) -> ControllerResult<ApplicationState> {
        let app_id = app.spec.id.clone();
        self.release_terminal_allocations(&app_id)?;

        let targets = self.stop_targets(&app_id, Vec::new())?;
        let session = self.ctx.scheduler.open_session();
        let jobs: Vec<Arc<dyn Job<bool>>> = targets
            .into_iter()
            .map(|instance_id| {
                Arc::new(StopSingleInstanceJob::new(
                    self.ctx.clone(),
                    app_id.clone(),
                    instance_id,
                )) as Arc<dyn Job<bool>>
            })
            .collect();
        let topology = JobTopology::new().add_parallel(self.parallelism, jobs);

        let result = self.run_topology(&app_id, &session, topology).await;

        let Some(mut app) = self.ctx.state.get_application(&app_id)? else {
            return Err(ControllerError::ApplicationNotFound(app_id));
        };
        match result {
            Some(res) if !res.is_clean() => {
                let reason = res
                    .failure
                    .unwrap_or_else(|| "destroy cancelled".to_string());
                warn!(app = %app_id, %reason, "destroy incomplete");
                app.error = Some(reason);
                app.updated_at = epoch_secs();
                self.ctx.state.put_application(&app)?;
                Ok(ApplicationState::DestroyRequested)
            }
            _ => {
                let removed = self.ctx.state.delete_instances_for_app(&app_id)?;
                app.state = ApplicationState::Destroyed;
                app.desired_instances = 0;
                app.error = None;
                app.updated_at = epoch_secs();
                self.ctx.state.put_application(&app)?;
                info!(app = %app_id, instances_removed = removed, "application destroyed");
                Ok(ApplicationState::Destroyed)
            }
        }
    }

    // ── Shared mechanics ───────────────────────────────────────────

    /// Run a topology under the app's cancellation slot and finalise the
    /// session exactly once, on every path. `None` means the topology was
    /// empty and nothing ran.
    async fn run_topology(
        &self,
        app_id: &AppId,
        session: &SessionId,
        topology: JobTopology<bool>,
    ) -> Option<JobExecutionResult<bool>> {
        if topology.is_empty() {
            self.ctx.scheduler.finalise_session(session);
            return None;
        }
        let running = JobExecutor::schedule(topology, Box::new(BooleanResponseCombiner::new()));
        self.lock_active()
            .insert(app_id.clone(), running.canceller());
        let result = running.wait().await;
        self.lock_active().remove(app_id);
        self.ctx.scheduler.finalise_session(session);
        Some(result)
    }

    /// Map an action's outcome to the next application state.
    fn settle(
        &self,
        app_id: &str,
        requested: ApplicationState,
        result: Option<JobExecutionResult<bool>>,
    ) -> ControllerResult<ApplicationState> {
        let Some(mut app) = self.ctx.state.get_application(app_id)? else {
            return Err(ControllerError::ApplicationNotFound(app_id.to_string()));
        };
        let live = self.live_instances(app_id)?;
        let healthy = live
            .iter()
            .filter(|i| i.state == InstanceState::Healthy)
            .count() as u32;

        let next = match &result {
            Some(res) if res.cancelled => {
                // Reconcile desired to actual instead of chasing a target
                // that moved under us.
                app.desired_instances = live.len() as u32;
                app.error = Some("operation cancelled; desired count reconciled".to_string());
                info!(app = %app_id, desired = app.desired_instances, "cancelled, desired rolled back");
                steady_state(healthy)
            }
            Some(res) if healthy != app.desired_instances => {
                let reason = res.failure.clone().unwrap_or_else(|| {
                    format!(
                        "desired {} instances but {} healthy",
                        app.desired_instances, healthy
                    )
                });
                warn!(app = %app_id, %reason, "desired count not reached");
                app.error = Some(reason);
                requested
            }
            _ => {
                app.error = None;
                steady_state(healthy)
            }
        };

        app.state = next.clone();
        app.updated_at = epoch_secs();
        self.ctx.state.put_application(&app)?;
        Ok(next)
    }

    /// Like `settle`, but only failures keep the requested state — used by
    /// suspend, where live < desired is the intended outcome.
    fn settle_ignoring_count(
        &self,
        app_id: &str,
        requested: ApplicationState,
        result: Option<JobExecutionResult<bool>>,
    ) -> ControllerResult<ApplicationState> {
        let Some(mut app) = self.ctx.state.get_application(app_id)? else {
            return Err(ControllerError::ApplicationNotFound(app_id.to_string()));
        };
        let healthy = self
            .live_instances(app_id)?
            .iter()
            .filter(|i| i.state == InstanceState::Healthy)
            .count() as u32;

        let next = match &result {
            Some(res) if res.failure.is_some() && !res.cancelled => {
                app.error = res.failure.clone();
                requested
            }
            _ => {
                app.error = None;
                steady_state(healthy)
            }
        };
        app.state = next.clone();
        app.updated_at = epoch_secs();
        self.ctx.state.put_application(&app)?;
        Ok(next)
    }

    /// Non-terminal instance records of one application.
    fn live_instances(&self, app_id: &str) -> ControllerResult<Vec<InstanceInfo>> {
        Ok(self
            .ctx
            .state
            .list_instances_for_app(app_id)?
            .into_iter()
            .filter(|i| !i.state.is_terminal())
            .collect())
    }

    /// Return grants still recorded on terminal instances — failed starts
    /// and executor-forced stops leave these behind.
    fn release_terminal_allocations(&self, app_id: &str) -> ControllerResult<()> {
        for info in self.ctx.state.list_instances_for_app(app_id)? {
            if info.state.is_terminal() {
                self.ctx
                    .release_instance_resources(app_id, &info.instance_id)?;
            }
        }
        Ok(())
    }

    /// Choose which live instances a scale-down stops: healthy ones first,
    /// shuffled so the same instances are not always the victims.
    fn pick_stop_victims(&self, live: &[InstanceInfo], count: usize) -> Vec<InstanceId> {
        let mut healthy: Vec<InstanceId> = live
            .iter()
            .filter(|i| i.state == InstanceState::Healthy)
            .map(|i| i.instance_id.clone())
            .collect();
        healthy.shuffle(&mut rand::rng());

        if healthy.len() < count {
            let chosen: HashSet<&InstanceId> = healthy.iter().collect();
            let mut rest: Vec<InstanceId> = live
                .iter()
                .filter(|i| !chosen.contains(&i.instance_id))
                .map(|i| i.instance_id.clone())
                .collect();
            rest.shuffle(&mut rand::rng());
            healthy.extend(rest);
        }
        healthy.truncate(count);
        healthy
    }

    /// Targets for a stop/destroy action; an empty request means all live.
    fn stop_targets(
        &self,
        app_id: &str,
        instance_ids: Vec<InstanceId>,
    ) -> ControllerResult<Vec<InstanceId>> {
        if instance_ids.is_empty() {
            Ok(self
                .live_instances(app_id)?
                .into_iter()
                .map(|i| i.instance_id)
                .collect())
        } else {
            Ok(instance_ids)
        }
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, HashMap<AppId, TopologyCanceller>> {
        self.active.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// ≥1 healthy means running; zero healthy means monitoring.
fn steady_state(healthy: u32) -> ApplicationState {
    if healthy >= 1 {
        ApplicationState::Running
    } else {
        ApplicationState::Monitoring
    }
}
