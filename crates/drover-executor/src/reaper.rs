//! Zombie reaper — drops engine entries whose containers vanished.
//!
//! The engine believes an instance is running; the runtime has no
//! matching container. That instance will never report a state change
//! again, so the reaper stops it in the engine and releases its
//! resources instead of waiting for staleness to catch it upstream.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use drover_core::InstanceState;

use crate::engine::InstanceEngine;
use crate::runtime::{ContainerStatus, RuntimeError, LABEL_MANAGED_BY, LABEL_INSTANCE_ID};

/// Periodically diffs tracked instances against live containers.
pub struct ZombieReaper {
    engine: Arc<InstanceEngine>,
    interval: Duration,
}

impl ZombieReaper {
    pub fn new(engine: Arc<InstanceEngine>) -> Self {
        Self {
            engine,
            interval: Duration::from_secs(30),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// One pass. Returns the ids of instances reaped.
    pub async fn sweep_once(&self) -> Result<Vec<String>, RuntimeError> {
        let containers = self
            .engine
            .runtime()
            .list_by_label(LABEL_MANAGED_BY, "true")
            .await?;
        let alive: HashSet<String> = containers
            .iter()
            .filter(|c| c.status == ContainerStatus::Running)
            .filter_map(|c| c.labels.get(LABEL_INSTANCE_ID).cloned())
            .collect();

        let mut reaped = Vec::new();
        for (instance_id, state) in self.engine.current_states() {
            // Only states whose container must exist count; an instance
            // still provisioning has nothing to match yet.
            let container_expected = matches!(
                state,
                InstanceState::Unready
                    | InstanceState::Ready
                    | InstanceState::Healthy
                    | InstanceState::Unhealthy
                    | InstanceState::Recovered
            );
            if container_expected && !alive.contains(&instance_id) {
                if self
                    .engine
                    .mark_lost(&instance_id, "no container backing this instance")
                {
                    reaped.push(instance_id);
                }
            }
        }
        if !reaped.is_empty() {
            info!(count = reaped.len(), "zombie instances reaped");
        }
        Ok(reaped)
    }

    /// Run the sweep loop until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.interval, "zombie reaper started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    match self.sweep_once().await {
                        Ok(reaped) if reaped.is_empty() => {}
                        Ok(reaped) => debug!(?reaped, "reaper pass complete"),
                        Err(e) => warn!(error = %e, "reaper pass failed"),
                    }
                }
                _ = shutdown.changed() => {
                    debug!("zombie reaper shutting down");
                    break;
                }
            }
        }
    }
}
