//! Container runtime boundary.
//!
//! The engine talks to whatever runs containers through this trait:
//! create/start/stop/remove/inspect/list-by-label/exec, addressed by
//! opaque container ids. Labels stamp the instance id and the serialized
//! instance spec onto each container so a restarted executor can
//! reconstruct its world (see `recovery`).
//!
//! [`InProcessRuntime`] is a faithful in-memory simulation used by tests
//! and standalone mode: containers are records with a status, and failure
//! injection switches let tests drive every error path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use thiserror::Error;

/// Opaque container identifier assigned by the runtime.
pub type ContainerId = String;

/// Marks a container as owned by this system.
pub const LABEL_MANAGED_BY: &str = "io.drover.managed";

/// Carries the instance id a container belongs to.
pub const LABEL_INSTANCE_ID: &str = "io.drover.instance-id";

/// Carries the JSON-serialized `InstanceSpec` for crash recovery.
pub const LABEL_INSTANCE_SPEC: &str = "io.drover.instance-spec";

/// Carries the instance kind label value.
pub const LABEL_INSTANCE_KIND: &str = "io.drover.kind";

/// Errors surfaced by the container runtime.
#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("image pull failed: {0}")]
    ImagePull(String),

    #[error("container create failed: {0}")]
    Create(String),

    #[error("container start failed: {0}")]
    Start(String),

    #[error("container stop failed: {0}")]
    Stop(String),

    #[error("container remove failed: {0}")]
    Remove(String),

    #[error("container not found: {0}")]
    NotFound(String),

    #[error("exec failed: {0}")]
    Exec(String),
}

/// What the engine asks the runtime to create.
#[derive(Debug, Clone)]
pub struct ContainerSpec {
    pub image: String,
    pub env: HashMap<String, String>,
    pub labels: HashMap<String, String>,
    /// Core ids this container is pinned to.
    pub cpu_cores: Vec<u32>,
    /// Memory limit in megabytes.
    pub memory_mb: u64,
}

/// Point-in-time container status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerStatus {
    Created,
    Running,
    Exited { code: i64 },
}

/// One entry from a label-filtered listing.
#[derive(Debug, Clone)]
pub struct ContainerSummary {
    pub id: ContainerId,
    pub labels: HashMap<String, String>,
    pub status: ContainerStatus,
}

/// The capability the executor requires from its container engine.
#[async_trait::async_trait]
pub trait ContainerRuntime: Send + Sync {
    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError>;

    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerId, RuntimeError>;

    async fn start(&self, id: &ContainerId) -> Result<(), RuntimeError>;

    /// Stop with a grace period before the runtime kills the process.
    async fn stop(&self, id: &ContainerId, grace: Duration) -> Result<(), RuntimeError>;

    async fn remove(&self, id: &ContainerId) -> Result<(), RuntimeError>;

    async fn inspect(&self, id: &ContainerId) -> Result<ContainerStatus, RuntimeError>;

    async fn list_by_label(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Vec<ContainerSummary>, RuntimeError>;

    /// Run a command inside the container (pre-stop hooks).
    async fn exec(&self, id: &ContainerId, command: &str) -> Result<(), RuntimeError>;
}

// ── In-process simulation ──────────────────────────────────────────

struct SimContainer {
    spec: ContainerSpec,
    status: ContainerStatus,
}

/// In-memory container runtime for tests and single-node mode.
///
/// Containers are plain records; the failure-injection switches let a test
/// drive each error path of the instance state machine.
#[derive(Default)]
pub struct InProcessRuntime {
    containers: Mutex<HashMap<ContainerId, SimContainer>>,
    next_id: AtomicU64,
    pub fail_pulls: AtomicBool,
    pub fail_creates: AtomicBool,
    pub fail_starts: AtomicBool,
    pub fail_execs: AtomicBool,
}

impl InProcessRuntime {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<ContainerId, SimContainer>> {
        self.containers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Simulate a container process exiting on its own.
    pub fn exit_container(&self, id: &ContainerId, code: i64) -> bool {
        match self.lock().get_mut(id) {
            Some(container) => {
                container.status = ContainerStatus::Exited { code };
                true
            }
            None => false,
        }
    }

    /// Simulate a container vanishing without a trace (for zombie tests).
    pub fn drop_container(&self, id: &ContainerId) -> bool {
        self.lock().remove(id).is_some()
    }

    /// Ids of currently running containers.
    pub fn running_ids(&self) -> Vec<ContainerId> {
        self.lock()
            .iter()
            .filter(|(_, c)| c.status == ContainerStatus::Running)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[async_trait::async_trait]
impl ContainerRuntime for InProcessRuntime {
    async fn pull_image(&self, image: &str) -> Result<(), RuntimeError> {
        if self.fail_pulls.load(Ordering::SeqCst) {
            return Err(RuntimeError::ImagePull(format!("no such image: {image}")));
        }
        Ok(())
    }

    async fn create(&self, spec: &ContainerSpec) -> Result<ContainerId, RuntimeError> {
        if self.fail_creates.load(Ordering::SeqCst) {
            return Err(RuntimeError::Create("create rejected".to_string()));
        }
        let id = format!("ctr-{:08x}", self.next_id.fetch_add(1, Ordering::SeqCst));
        self.lock().insert(
            id.clone(),
            SimContainer {
                spec: spec.clone(),
                status: ContainerStatus::Created,
            },
        );
        Ok(id)
    }

    async fn start(&self, id: &ContainerId) -> Result<(), RuntimeError> {
        if self.fail_starts.load(Ordering::SeqCst) {
            return Err(RuntimeError::Start("start rejected".to_string()));
        }
        match self.lock().get_mut(id) {
            Some(container) => {
                container.status = ContainerStatus::Running;
                Ok(())
            }
            None => Err(RuntimeError::NotFound(id.clone())),
        }
    }

    async fn stop(&self, id: &ContainerId, _grace: Duration) -> Result<(), RuntimeError> {
        match self.lock().get_mut(id) {
            Some(container) => {
                container.status = ContainerStatus::Exited { code: 0 };
                Ok(())
            }
            None => Err(RuntimeError::NotFound(id.clone())),
        }
    }

    async fn remove(&self, id: &ContainerId) -> Result<(), RuntimeError> {
        match self.lock().remove(id) {
            Some(_) => Ok(()),
            None => Err(RuntimeError::NotFound(id.clone())),
        }
    }

    async fn inspect(&self, id: &ContainerId) -> Result<ContainerStatus, RuntimeError> {
        match self.lock().get(id) {
            Some(container) => Ok(container.status),
            None => Err(RuntimeError::NotFound(id.clone())),
        }
    }

    async fn list_by_label(
        &self,
        key: &str,
        value: &str,
    ) -> Result<Vec<ContainerSummary>, RuntimeError> {
        Ok(self
            .lock()
            .iter()
            .filter(|(_, c)| c.spec.labels.get(key).is_some_and(|v| v == value))
            .map(|(id, c)| ContainerSummary {
                id: id.clone(),
                labels: c.spec.labels.clone(),
                status: c.status,
            })
            .collect())
    }

    async fn exec(&self, id: &ContainerId, command: &str) -> Result<(), RuntimeError> {
        if self.fail_execs.load(Ordering::SeqCst) {
            return Err(RuntimeError::Exec(format!("command failed: {command}")));
        }
        match self.lock().get(id) {
            Some(c) if c.status == ContainerStatus::Running => Ok(()),
            Some(_) => Err(RuntimeError::Exec("container not running".to_string())),
            None => Err(RuntimeError::NotFound(id.clone())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec_with_label(key: &str, value: &str) -> ContainerSpec {
        ContainerSpec {
            image: "registry/web:1.0".to_string(),
            env: HashMap::new(),
            labels: HashMap::from([(key.to_string(), value.to_string())]),
            cpu_cores: vec![0],
            memory_mb: 128,
        }
    }

    #[tokio::test]
    async fn container_lifecycle_round_trip() {
        let runtime = InProcessRuntime::new();
        runtime.pull_image("registry/web:1.0").await.unwrap();

        let id = runtime
            .create(&spec_with_label(LABEL_MANAGED_BY, "true"))
            .await
            .unwrap();
        assert_eq!(runtime.inspect(&id).await.unwrap(), ContainerStatus::Created);

        runtime.start(&id).await.unwrap();
        assert_eq!(runtime.inspect(&id).await.unwrap(), ContainerStatus::Running);

        runtime.stop(&id, Duration::from_secs(5)).await.unwrap();
        assert!(matches!(
            runtime.inspect(&id).await.unwrap(),
            ContainerStatus::Exited { code: 0 }
        ));

        runtime.remove(&id).await.unwrap();
        assert!(matches!(
            runtime.inspect(&id).await,
            Err(RuntimeError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn list_by_label_filters() {
        let runtime = InProcessRuntime::new();
        runtime
            .create(&spec_with_label(LABEL_INSTANCE_ID, "inst-1"))
            .await
            .unwrap();
        runtime
            .create(&spec_with_label(LABEL_INSTANCE_ID, "inst-2"))
            .await
            .unwrap();
        runtime
            .create(&spec_with_label("other", "x"))
            .await
            .unwrap();

        let found = runtime
            .list_by_label(LABEL_INSTANCE_ID, "inst-1")
            .await
            .unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].labels[LABEL_INSTANCE_ID], "inst-1");
    }

    #[tokio::test]
    async fn failure_injection_switches() {
        let runtime = InProcessRuntime::new();
        runtime.fail_pulls.store(true, Ordering::SeqCst);
        assert!(matches!(
            runtime.pull_image("x").await,
            Err(RuntimeError::ImagePull(_))
        ));

        runtime.fail_creates.store(true, Ordering::SeqCst);
        assert!(matches!(
            runtime.create(&spec_with_label("a", "b")).await,
            Err(RuntimeError::Create(_))
        ));
    }
}
