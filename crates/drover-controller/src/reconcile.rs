//! Staleness reconciler — the loop's safety net.
//!
//! Executors normally report every state change. When one disappears
//! without notice, its instances stop updating; this sweep marks them
//! `Lost`, returns their resources to the pool, and flags applications
//! that silently lost all serving capacity as `OutageDetected`.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use drover_core::{ApplicationState, InstanceState, epoch_secs};

use crate::context::ControllerContext;
use crate::error::ControllerResult;

/// Periodic sweep over instance records.
pub struct StalenessReconciler {
    ctx: Arc<ControllerContext>,
    /// An instance not updated for this long is considered lost.
    staleness_bound: Duration,
    /// Delay between sweeps.
    interval: Duration,
}

impl StalenessReconciler {
    pub fn new(ctx: Arc<ControllerContext>) -> Self {
        Self {
            ctx,
            staleness_bound: Duration::from_secs(60),
            interval: Duration::from_secs(15),
        }
    }

    pub fn with_staleness_bound(mut self, bound: Duration) -> Self {
        self.staleness_bound = bound;
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// One sweep: mark stale instances lost, release their grants, detect
    /// outages. Returns how many instances were swept.
    pub fn sweep_once(&self, now: u64) -> ControllerResult<usize> {
        let swept = self
            .ctx
            .state
            .mark_stale_instances_lost(self.staleness_bound.as_secs(), now)?;
        for info in &swept {
            warn!(
                app = %info.app_id,
                instance = %info.instance_id,
                executor = %info.executor_id,
                "instance marked lost"
            );
            self.ctx
                .release_instance_resources(&info.app_id, &info.instance_id)?;
        }

        self.detect_outages(now)?;
        Ok(swept.len())
    }

    /// An application that should be serving but has zero healthy
    /// instances left — without an operator-requested stop — is an outage.
    fn detect_outages(&self, now: u64) -> ControllerResult<()> {
        for mut app in self.ctx.state.list_applications()? {
            if !matches!(
                app.state,
                ApplicationState::Running | ApplicationState::Monitoring
            ) || app.desired_instances == 0
            {
                continue;
            }
            let healthy = self
                .ctx
                .state
                .list_instances_for_app(&app.spec.id)?
                .iter()
                .filter(|i| i.state == InstanceState::Healthy)
                .count();
            if healthy == 0 && app.state == ApplicationState::Running {
                warn!(app = %app.spec.id, "all healthy instances gone, outage detected");
                app.state = ApplicationState::OutageDetected;
                app.error = Some("no healthy instances remaining".to_string());
                app.updated_at = now;
                self.ctx.state.put_application(&app)?;
            }
        }
        Ok(())
    }

    /// Run the sweep loop until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval = ?self.interval,
            bound = ?self.staleness_bound,
            "staleness reconciler started"
        );
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {
                    match self.sweep_once(epoch_secs()) {
                        Ok(0) => {}
                        Ok(count) => debug!(count, "stale instances swept"),
                        Err(e) => warn!(error = %e, "staleness sweep failed"),
                    }
                }
                _ = shutdown.changed() => {
                    debug!("staleness reconciler shutting down");
                    break;
                }
            }
        }
    }
}
