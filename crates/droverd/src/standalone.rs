//! Standalone mode — controller and executor wired in one process.
//!
//! The in-process runtime stands in for a real container engine and a
//! loopback communicator carries controller messages straight into the
//! engine's dispatcher. Everything else is the production code path:
//! placement, soft-locking, job topologies, state reporting, staleness
//! reconciliation, zombie reaping.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{info, warn};

use drover_cluster::{ClusterResourcesDb, MembershipManager};
use drover_controller::{
    ApplicationOperation, ApplicationStateMachine, ControllerContext, StalenessReconciler,
};
use drover_core::{
    Communicator, CommsError, Envelope, ExecutorId, MessageResponse, RetrySpecFactory,
    TransportKind, epoch_secs,
};
use drover_executor::{
    EngineConfig, ExecutorIdentity, ExecutorResourceLock, InProcessRuntime, InstanceEngine,
    InstanceStatsTracker, ZombieReaper, recover_instances,
};
use drover_scheduler::InstanceScheduler;
use drover_state::{StateStore, StateResult};

use crate::config::DroverConfig;

pub struct StandaloneOptions {
    pub data_dir: PathBuf,
    pub app: Option<PathBuf>,
    pub heartbeat_interval: u64,
    pub reconcile_interval: u64,
    pub reaper_interval: u64,
}

/// Delivers controller messages straight to the local engine.
struct LoopbackCommunicator {
    engine: Arc<InstanceEngine>,
}

#[async_trait::async_trait]
impl Communicator for LoopbackCommunicator {
    async fn send(
        &self,
        _executor_id: &ExecutorId,
        message: Envelope,
    ) -> Result<MessageResponse, CommsError> {
        Ok(self.engine.handle_message(&message))
    }
}

pub async fn run(options: StandaloneOptions) -> anyhow::Result<()> {
    info!("drover daemon starting in standalone mode");

    std::fs::create_dir_all(&options.data_dir)?;
    let db_path = options.data_dir.join("drover.redb");

    // ── Shared state ───────────────────────────────────────────────

    let state = StateStore::open(&db_path)?;
    info!(path = ?db_path, "state store opened");

    let resources = Arc::new(ClusterResourcesDb::new());

    // ── Executor side ──────────────────────────────────────────────

    // The standalone node's hardware view: one NUMA node, the host's
    // logical CPUs, a flat memory budget.
    let core_count = std::thread::available_parallelism()
        .map(|n| n.get() as u32)
        .unwrap_or(4);
    let local_resources = Arc::new(ExecutorResourceLock::new(BTreeMap::from([(
        0,
        ((0..core_count).collect::<BTreeSet<u32>>(), 8192),
    )])));

    let runtime = Arc::new(InProcessRuntime::new());
    let engine = Arc::new(InstanceEngine::new(
        ExecutorIdentity {
            executor_id: "standalone".to_string(),
            hostname: "127.0.0.1".to_string(),
            port: 0,
            transport: TransportKind::InProcess,
            tags: Vec::new(),
        },
        runtime,
        local_resources,
        EngineConfig::default(),
    ));
    info!(cores = core_count, "executor engine initialized");

    // Bridge engine state changes into the controller's instance store.
    connect_state_reporter(&engine, state.clone());
    let stats = Arc::new(InstanceStatsTracker::new());
    stats.clone().attach(engine.events());

    // Re-adopt anything that survived a previous daemon run.
    let recovered = recover_instances(&engine).await?;
    if recovered > 0 {
        info!(recovered, "instances recovered from surviving containers");
    }

    // ── Membership ─────────────────────────────────────────────────

    let membership = MembershipManager::new(state.clone())
        .with_heartbeat_interval(Duration::from_secs(options.heartbeat_interval));
    membership.join(engine.node_data(), &resources)?;

    // ── Controller side ────────────────────────────────────────────

    let scheduler = Arc::new(InstanceScheduler::new(resources.clone(), state.clone()));
    let comms = Arc::new(LoopbackCommunicator {
        engine: engine.clone(),
    });
    let ctx = Arc::new(ControllerContext::new(
        resources.clone(),
        scheduler,
        comms,
        state.clone(),
        RetrySpecFactory::default(),
    ));
    let machine = Arc::new(ApplicationStateMachine::new(ctx.clone()));
    info!("controller initialized");

    // ── Background loops ───────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reconciler = StalenessReconciler::new(ctx.clone())
        .with_interval(Duration::from_secs(options.reconcile_interval));
    tokio::spawn(reconciler.run(shutdown_rx.clone()));

    let reaper = ZombieReaper::new(engine.clone())
        .with_interval(Duration::from_secs(options.reaper_interval));
    tokio::spawn(reaper.run(shutdown_rx.clone()));

    tokio::spawn(heartbeat_loop(
        membership,
        engine.clone(),
        resources.clone(),
        Duration::from_secs(options.heartbeat_interval),
        shutdown_rx.clone(),
    ));

    // ── Optional app spec ──────────────────────────────────────────

    if let Some(path) = &options.app {
        let config = DroverConfig::from_file(path)?;
        let spec = config.to_application_spec()?;
        let app_id = spec.id.clone();
        info!(app = %app_id, instances = spec.required_instances, "creating application from config");
        match machine
            .handle(&app_id, ApplicationOperation::Create { spec })
            .await
        {
            Ok(app_state) => info!(app = %app_id, state = ?app_state, "application settled"),
            Err(e) => warn!(app = %app_id, error = %e, "application create failed"),
        }
    }

    // ── Run until interrupted ──────────────────────────────────────

    tokio::signal::ctrl_c().await?;
    info!("shutdown requested");
    let _ = shutdown_tx.send(true);

    Ok(())
}

/// Subscribes the instance store to the engine's event bus — the
/// executor-report path that closes the reconciliation loop.
fn connect_state_reporter(engine: &Arc<InstanceEngine>, state: StateStore) {
    engine.events().connect("controller-report", move |event| {
        let result: StateResult<bool> = (|| {
            if event.app_id.is_empty() {
                // Reaper events carry only the instance id.
                match state.find_instance(&event.instance_id)? {
                    Some(info) => state.update_instance_state(
                        &info.app_id,
                        &event.instance_id,
                        event.state,
                        event.error.clone(),
                        epoch_secs(),
                    ),
                    None => Ok(false),
                }
            } else {
                state.update_instance_state(
                    &event.app_id,
                    &event.instance_id,
                    event.state,
                    event.error.clone(),
                    epoch_secs(),
                )
            }
        })();
        if let Err(e) = result {
            warn!(instance = %event.instance_id, error = %e, "state report failed");
        }
    });
}

/// Periodic self-report into the membership manager.
async fn heartbeat_loop(
    membership: MembershipManager,
    engine: Arc<InstanceEngine>,
    resources: Arc<ClusterResourcesDb>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                if let Err(e) = membership.heartbeat(engine.node_data(), &resources) {
                    warn!(error = %e, "heartbeat failed");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
}
