//! Per-instance lifecycle state machine.
//!
//! One machine per live instance, driven on its own task: validate →
//! fetch executable → run → readiness gate → recurring health checks →
//! stop → cleanup. Stop is cooperative — a flag observed at the points
//! where stopping is allowed, never a pre-emptive kill of in-progress
//! runtime calls. Every transition is published on the event bus; the
//! terminal state ends the task and the engine reclaims the resources.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, warn};

use drover_core::{InstanceSpec, InstanceState, epoch_secs};

use crate::checker::{CheckOutcome, CheckPolicy, check_instance};
use crate::engine::EngineConfig;
use crate::events::{EventBus, InstanceEvent};
use crate::runtime::{
    ContainerId, ContainerRuntime, ContainerSpec, RuntimeError, LABEL_INSTANCE_ID,
    LABEL_INSTANCE_KIND, LABEL_INSTANCE_SPEC, LABEL_MANAGED_BY,
};

/// Outcome of the readiness gate.
enum Gate {
    Passed,
    Exhausted,
    StopRequested,
    ContainerGone,
}

pub(crate) struct InstanceMachine {
    spec: InstanceSpec,
    executor_id: String,
    runtime: Arc<dyn ContainerRuntime>,
    events: Arc<EventBus>,
    config: EngineConfig,
    state_tx: watch::Sender<InstanceState>,
    stop_rx: watch::Receiver<bool>,
    container_id: Option<ContainerId>,
    /// Adopted from a surviving container after an executor restart:
    /// provisioning is skipped and checks start without initial delay.
    recovered: bool,
}

impl InstanceMachine {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        spec: InstanceSpec,
        executor_id: String,
        runtime: Arc<dyn ContainerRuntime>,
        events: Arc<EventBus>,
        config: EngineConfig,
        state_tx: watch::Sender<InstanceState>,
        stop_rx: watch::Receiver<bool>,
        adopted_container: Option<ContainerId>,
    ) -> Self {
        let recovered = adopted_container.is_some();
        Self {
            spec,
            executor_id,
            runtime,
            events,
            config,
            state_tx,
            stop_rx,
            container_id: adopted_container,
            recovered,
        }
    }

    /// Drive the instance to a terminal state.
    pub(crate) async fn run(mut self) {
        if self.recovered {
            self.transition(InstanceState::Recovered, None);
        } else {
            if !self.provision_and_start().await {
                return;
            }
            match self.readiness_gate().await {
                Gate::Passed => {}
                Gate::StopRequested => {
                    self.shutdown(None).await;
                    return;
                }
                Gate::ContainerGone => {
                    self.vanish("container stopped during readiness checks").await;
                    return;
                }
                Gate::Exhausted => {
                    self.cleanup_container().await;
                    self.transition(
                        InstanceState::ReadinessFailed,
                        Some("readiness check attempts exhausted".to_string()),
                    );
                    return;
                }
            }
        }
        self.monitor().await;
    }

    /// Validate, fetch the executable, create and start the container.
    /// Returns false when a terminal state was reached.
    async fn provision_and_start(&mut self) -> bool {
        if let Err(reason) = self.spec.validate() {
            self.transition(
                InstanceState::ProvisioningFailed,
                Some(format!("invalid spec: {reason}")),
            );
            return false;
        }
        self.transition(InstanceState::Provisioning, None);

        if let Err(e) = self.runtime.pull_image(&self.spec.image).await {
            self.transition(InstanceState::ProvisioningFailed, Some(e.to_string()));
            return false;
        }
        if self.stop_requested() {
            // Stopped before anything was created; nothing to clean up.
            self.transition(InstanceState::Stopped, None);
            return false;
        }

        self.transition(InstanceState::Starting, None);
        let container_spec = self.container_spec();
        let container_id = match self.runtime.create(&container_spec).await {
            Ok(id) => id,
            Err(e) => {
                self.transition(InstanceState::StartFailed, Some(e.to_string()));
                return false;
            }
        };
        self.container_id = Some(container_id.clone());

        if let Err(e) = self.runtime.start(&container_id).await {
            if let Err(remove_err) = self.runtime.remove(&container_id).await {
                warn!(
                    instance = %self.spec.instance_id,
                    error = %remove_err,
                    "failed to remove container after start failure"
                );
            }
            self.container_id = None;
            self.transition(InstanceState::StartFailed, Some(e.to_string()));
            return false;
        }
        true
    }

    /// Bounded-attempt readiness loop with optional initial delay.
    async fn readiness_gate(&mut self) -> Gate {
        self.transition(InstanceState::Unready, None);
        if !self.spec.kind.readiness_gated() {
            self.transition(InstanceState::Ready, None);
            return Gate::Passed;
        }

        let policy = CheckPolicy::from_spec(&self.spec.readiness);
        if !self.recovered
            && !policy.initial_delay.is_zero()
            && !self.sleep_or_stop(policy.initial_delay).await
        {
            return Gate::StopRequested;
        }

        for attempt in 1..=policy.max_attempts {
            if self.stop_requested() {
                return Gate::StopRequested;
            }
            match self.check(&policy).await {
                CheckOutcome::Healthy => {
                    self.transition(InstanceState::Ready, None);
                    return Gate::Passed;
                }
                CheckOutcome::Stopped => return Gate::ContainerGone,
                CheckOutcome::Unhealthy => {
                    debug!(
                        instance = %self.spec.instance_id,
                        attempt,
                        max = policy.max_attempts,
                        "readiness check not passing yet"
                    );
                    if attempt < policy.max_attempts && !self.sleep_or_stop(policy.interval).await
                    {
                        return Gate::StopRequested;
                    }
                }
            }
        }
        Gate::Exhausted
    }

    /// Recurring health loop. Persistent failure beyond the budget kills
    /// the instance instead of leaving it unhealthy indefinitely.
    async fn monitor(&mut self) {
        let policy = CheckPolicy::from_spec(&self.spec.health);
        if !self.spec.kind.monitors_health() {
            self.watch_task_exit(policy).await;
            return;
        }

        let mut consecutive_failures: u32 = 0;
        loop {
            if self.stop_requested() {
                self.shutdown(None).await;
                return;
            }
            if !self.sleep_or_stop(policy.interval).await {
                self.shutdown(None).await;
                return;
            }
            match self.check(&policy).await {
                CheckOutcome::Healthy => {
                    consecutive_failures = 0;
                    if self.current() != InstanceState::Healthy {
                        self.transition(InstanceState::Healthy, None);
                    }
                }
                CheckOutcome::Unhealthy => {
                    consecutive_failures += 1;
                    if self.current() != InstanceState::Unhealthy {
                        self.transition(
                            InstanceState::Unhealthy,
                            Some("health check failing".to_string()),
                        );
                    }
                    if consecutive_failures >= policy.max_attempts {
                        warn!(
                            instance = %self.spec.instance_id,
                            failures = consecutive_failures,
                            "health check budget exhausted, stopping instance"
                        );
                        self.shutdown(Some("persistent health check failure".to_string()))
                            .await;
                        return;
                    }
                }
                CheckOutcome::Stopped => {
                    if self.stop_requested() {
                        self.shutdown(None).await;
                    } else {
                        self.vanish("container exited unexpectedly").await;
                    }
                    return;
                }
            }
        }
    }

    /// Tasks run to completion: watch for container exit or a stop signal.
    async fn watch_task_exit(&mut self, policy: CheckPolicy) {
        loop {
            if self.stop_requested() {
                self.shutdown(None).await;
                return;
            }
            if !self.sleep_or_stop(policy.interval).await {
                self.shutdown(None).await;
                return;
            }
            let Some(container_id) = self.container_id.clone() else {
                self.vanish("task container missing").await;
                return;
            };
            match self.runtime.inspect(&container_id).await {
                Ok(crate::runtime::ContainerStatus::Running) => {
                    if self.current() != InstanceState::Healthy {
                        self.transition(InstanceState::Healthy, None);
                    }
                }
                Ok(crate::runtime::ContainerStatus::Created) => {}
                Ok(crate::runtime::ContainerStatus::Exited { code }) => {
                    self.transition(InstanceState::Deprovisioning, None);
                    self.cleanup_container().await;
                    let error = (code != 0).then(|| format!("task exited with code {code}"));
                    self.transition(InstanceState::Stopped, error);
                    return;
                }
                Err(RuntimeError::NotFound(_)) => {
                    self.vanish("task container disappeared").await;
                    return;
                }
                Err(e) => {
                    debug!(instance = %self.spec.instance_id, error = %e, "task inspect failed");
                }
            }
        }
    }

    /// Orderly stop: pre-stop hooks (bounded retry), stop with grace,
    /// remove. `forced_reason` marks a stop the executor decided on.
    async fn shutdown(&mut self, forced_reason: Option<String>) {
        self.transition(InstanceState::Stopping, forced_reason.clone());

        if let Some(container_id) = self.container_id.clone() {
            for hook in &self.spec.pre_stop_hooks {
                self.run_hook(&container_id, hook).await;
            }
            if let Err(e) = self.runtime.stop(&container_id, self.config.stop_grace).await {
                if !matches!(e, RuntimeError::NotFound(_)) {
                    warn!(instance = %self.spec.instance_id, error = %e, "container stop failed");
                }
            }
            self.transition(InstanceState::Deprovisioning, None);
            self.cleanup_container().await;
        } else {
            self.transition(InstanceState::Deprovisioning, None);
        }

        self.transition(InstanceState::Stopped, forced_reason);
    }

    /// The container is gone without a requested stop.
    async fn vanish(&mut self, reason: &str) {
        warn!(instance = %self.spec.instance_id, reason, "instance lost");
        self.cleanup_container().await;
        self.transition(InstanceState::Lost, Some(reason.to_string()));
    }

    /// One pre-stop hook with bounded retries; failures are logged, never
    /// fatal — the stop proceeds regardless.
    async fn run_hook(&self, container_id: &ContainerId, hook: &str) {
        for attempt in 1..=self.config.hook_attempts.max(1) {
            match self.runtime.exec(container_id, hook).await {
                Ok(()) => return,
                Err(e) if attempt < self.config.hook_attempts => {
                    debug!(
                        instance = %self.spec.instance_id,
                        hook,
                        attempt,
                        error = %e,
                        "pre-stop hook failed, retrying"
                    );
                    tokio::time::sleep(self.config.hook_retry_delay).await;
                }
                Err(e) => {
                    warn!(
                        instance = %self.spec.instance_id,
                        hook,
                        error = %e,
                        "pre-stop hook failed, giving up"
                    );
                }
            }
        }
    }

    async fn cleanup_container(&mut self) {
        if let Some(container_id) = self.container_id.take() {
            if let Err(e) = self.runtime.remove(&container_id).await {
                if !matches!(e, RuntimeError::NotFound(_)) {
                    warn!(
                        instance = %self.spec.instance_id,
                        error = %e,
                        "container remove failed"
                    );
                }
            }
        }
    }

    async fn check(&self, policy: &CheckPolicy) -> CheckOutcome {
        let Some(container_id) = &self.container_id else {
            return CheckOutcome::Stopped;
        };
        let endpoint = if self.current() == InstanceState::Unready
            || self.current() == InstanceState::Recovered
        {
            &self.spec.readiness.endpoint
        } else {
            &self.spec.health.endpoint
        };
        check_instance(
            &self.runtime,
            container_id,
            self.spec.probe_addr.as_deref(),
            endpoint,
            policy.timeout,
        )
        .await
    }

    fn container_spec(&self) -> ContainerSpec {
        let mut labels = HashMap::new();
        labels.insert(LABEL_MANAGED_BY.to_string(), "true".to_string());
        labels.insert(
            LABEL_INSTANCE_ID.to_string(),
            self.spec.instance_id.clone(),
        );
        labels.insert(
            LABEL_INSTANCE_KIND.to_string(),
            self.spec.kind.label().to_string(),
        );
        if let Ok(serialized) = serde_json::to_string(&self.spec) {
            labels.insert(LABEL_INSTANCE_SPEC.to_string(), serialized);
        }
        ContainerSpec {
            image: self.spec.image.clone(),
            env: self.spec.env.clone(),
            labels,
            cpu_cores: self
                .spec
                .cpu
                .cores
                .values()
                .flat_map(|set| set.iter().copied())
                .collect(),
            memory_mb: self.spec.memory.total_mb(),
        }
    }

    fn current(&self) -> InstanceState {
        *self.state_tx.borrow()
    }

    fn stop_requested(&self) -> bool {
        *self.stop_rx.borrow()
    }

    /// Sleep, waking early on the stop signal. Returns false when the
    /// instance should stop.
    async fn sleep_or_stop(&mut self, duration: Duration) -> bool {
        if self.stop_requested() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => true,
            changed = self.stop_rx.changed() => match changed {
                Ok(()) => !*self.stop_rx.borrow(),
                // Engine handle dropped: treat as a stop request.
                Err(_) => false,
            },
        }
    }

    fn transition(&self, state: InstanceState, error: Option<String>) {
        let _ = self.state_tx.send(state);
        debug!(instance = %self.spec.instance_id, ?state, "instance transition");
        self.events.publish(InstanceEvent {
            executor_id: self.executor_id.clone(),
            app_id: self.spec.app_id.clone(),
            instance_id: self.spec.instance_id.clone(),
            state,
            error,
            timestamp_secs: epoch_secs(),
        });
    }
}
