//! Application, task, and instance specifications.
//!
//! An `ApplicationSpec` is what an operator submits: image, resources,
//! placement policy, check configuration. An `InstanceSpec` is the concrete
//! unit handed to an executor: one instance id, one executor, and the
//! resources actually granted by the scheduler.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::resources::{CpuAllocation, MemoryAllocation, ResourceRequirement};

/// Unique identifier for an application.
pub type AppId = String;

/// Unique identifier for an instance within an application.
pub type InstanceId = String;

/// Unique identifier for an executor node.
pub type ExecutorId = String;

/// Unique identifier for a one-shot task.
pub type TaskId = String;

/// Correlation id grouping the allocations of one scale/replace operation.
pub type SessionId = String;

/// NUMA locality domain id on an executor host.
pub type NumaNodeId = u32;

/// CPU core id within a NUMA node.
pub type CoreId = u32;

/// Rule constraining which executor may host an application's instances.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "snake_case")]
pub enum PlacementPolicy {
    /// At most one instance of the application per executor host.
    OnePerHost,
    /// At most `max` instances of the application per executor host.
    MaxPerHost { max: u32 },
    /// Only executors carrying the given tag. Not yet supported — rejects
    /// every candidate until the matching semantics are defined.
    MatchTag { tag: String },
    /// Free-form rule expression. Not yet supported — rejects every
    /// candidate until the rule language is defined.
    RuleBased { rule: String },
    /// Any executor with capacity.
    Any,
}

/// Readiness / health check parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckSpec {
    /// HTTP path to probe (e.g., "/healthz"). Empty means "consider the
    /// instance passing while its container is running".
    pub endpoint: String,
    /// Delay between attempts (e.g., "5s").
    pub interval: String,
    /// Timeout per attempt (e.g., "2s").
    pub timeout: String,
    /// Consecutive failures tolerated before the check fails hard.
    pub max_attempts: u32,
    /// Optional delay before the first attempt (e.g., "10s"). Skipped on
    /// crash-recovery flows.
    pub initial_delay: Option<String>,
}

impl Default for CheckSpec {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            interval: "5s".to_string(),
            timeout: "2s".to_string(),
            max_attempts: 3,
            initial_delay: None,
        }
    }
}

/// Specification for a deployable application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ApplicationSpec {
    pub id: AppId,
    pub name: String,
    /// Container image reference.
    pub image: String,
    /// Environment variables injected into each instance.
    pub env: HashMap<String, String>,
    /// Abstract resource asks per instance.
    pub resources: Vec<ResourceRequirement>,
    /// Placement constraint across executor hosts.
    pub placement: PlacementPolicy,
    /// Instance count requested at creation time. The desired count lives
    /// in `ApplicationInfo` afterwards and moves with scale operations.
    pub required_instances: u32,
    /// One-shot gate before the instance counts as ready.
    pub readiness: CheckSpec,
    /// Recurring check while the instance is up.
    pub health: CheckSpec,
    /// Commands run inside the container before it is stopped.
    pub pre_stop_hooks: Vec<String>,
    /// Unix timestamp (seconds) when this spec was created.
    pub created_at: u64,
    /// Unix timestamp (seconds) when this spec was last updated.
    pub updated_at: u64,
}

/// What kind of workload an instance runs.
///
/// The kinds share one state machine; the few kind-specific behaviors are
/// methods here rather than a type hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceKind {
    /// Long-running application instance: readiness-gated, health-monitored.
    Application,
    /// One-shot task: runs to completion, container exit is a normal stop.
    Task,
    /// Node-local support service: health-monitored, not readiness-gated.
    LocalService,
}

impl InstanceKind {
    /// Label value stamped on containers of this kind.
    pub fn label(&self) -> &'static str {
        match self {
            InstanceKind::Application => "application",
            InstanceKind::Task => "task",
            InstanceKind::LocalService => "local-service",
        }
    }

    /// Whether the readiness gate applies before the instance counts as up.
    pub fn readiness_gated(&self) -> bool {
        matches!(self, InstanceKind::Application)
    }

    /// Whether the recurring health loop runs. Tasks run to completion and
    /// are only watched for container exit.
    pub fn monitors_health(&self) -> bool {
        !matches!(self, InstanceKind::Task)
    }
}

/// Transport an executor is reachable over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransportKind {
    Http,
    InProcess,
}

/// The concrete unit of work sent to an executor: one instance with the
/// resources the scheduler actually granted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceSpec {
    pub kind: InstanceKind,
    pub app_id: AppId,
    pub instance_id: InstanceId,
    pub image: String,
    pub env: HashMap<String, String>,
    pub cpu: CpuAllocation,
    pub memory: MemoryAllocation,
    pub readiness: CheckSpec,
    pub health: CheckSpec,
    pub pre_stop_hooks: Vec<String>,
    /// Address (`ip:port`) the instance serves checks on, when it has one.
    pub probe_addr: Option<String>,
}

impl InstanceSpec {
    /// Derive an instance spec from an application spec and a grant.
    pub fn for_application(
        spec: &ApplicationSpec,
        instance_id: InstanceId,
        cpu: CpuAllocation,
        memory: MemoryAllocation,
    ) -> Self {
        Self {
            kind: InstanceKind::Application,
            app_id: spec.id.clone(),
            instance_id,
            image: spec.image.clone(),
            env: spec.env.clone(),
            cpu,
            memory,
            readiness: spec.readiness.clone(),
            health: spec.health.clone(),
            pre_stop_hooks: spec.pre_stop_hooks.clone(),
            probe_addr: None,
        }
    }

    /// Basic shape validation before any container work starts.
    pub fn validate(&self) -> Result<(), String> {
        if self.app_id.is_empty() {
            return Err("app_id is empty".to_string());
        }
        if self.instance_id.is_empty() {
            return Err("instance_id is empty".to_string());
        }
        if self.image.is_empty() {
            return Err("image reference is empty".to_string());
        }
        if self.cpu.is_empty() && self.memory.total_mb() == 0 {
            return Err("no resources allocated".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeSet;

    fn test_spec() -> ApplicationSpec {
        ApplicationSpec {
            id: "app-1".to_string(),
            name: "web".to_string(),
            image: "registry/web:1.0".to_string(),
            env: HashMap::new(),
            resources: vec![
                ResourceRequirement::Cpu { count: 1 },
                ResourceRequirement::Memory { size_mb: 256 },
            ],
            placement: PlacementPolicy::Any,
            required_instances: 2,
            readiness: CheckSpec::default(),
            health: CheckSpec::default(),
            pre_stop_hooks: Vec::new(),
            created_at: 1000,
            updated_at: 1000,
        }
    }

    #[test]
    fn instance_spec_inherits_from_application() {
        let spec = test_spec();
        let inst = InstanceSpec::for_application(
            &spec,
            "inst-1".to_string(),
            CpuAllocation::on_node(0, BTreeSet::from([3])),
            MemoryAllocation::on_node(0, 256),
        );
        assert_eq!(inst.app_id, "app-1");
        assert_eq!(inst.image, "registry/web:1.0");
        assert_eq!(inst.kind, InstanceKind::Application);
        assert!(inst.validate().is_ok());
    }

    #[test]
    fn validation_rejects_empty_image() {
        let spec = test_spec();
        let mut inst = InstanceSpec::for_application(
            &spec,
            "inst-1".to_string(),
            CpuAllocation::on_node(0, BTreeSet::from([3])),
            MemoryAllocation::on_node(0, 256),
        );
        inst.image.clear();
        assert!(inst.validate().is_err());
    }

    #[test]
    fn validation_rejects_missing_resources() {
        let spec = test_spec();
        let mut inst = InstanceSpec::for_application(
            &spec,
            "inst-1".to_string(),
            CpuAllocation::default(),
            MemoryAllocation::default(),
        );
        inst.memory = MemoryAllocation::default();
        assert!(inst.validate().is_err());
    }

    #[test]
    fn task_kind_skips_readiness_and_health() {
        assert!(!InstanceKind::Task.readiness_gated());
        assert!(!InstanceKind::Task.monitors_health());
        assert!(InstanceKind::Application.readiness_gated());
        assert!(InstanceKind::LocalService.monitors_health());
    }
}
