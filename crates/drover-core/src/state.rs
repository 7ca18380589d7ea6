//! Lifecycle state enums for instances and applications.
//!
//! The executor is authoritative for `InstanceState`; the controller reads
//! it back through the instance store. Terminal states admit no transition
//! except an explicit recover operation at the application level.

use serde::{Deserialize, Serialize};

/// Lifecycle state of a single instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InstanceState {
    /// Accepted by the controller, not yet acted on by an executor.
    Pending,
    /// Spec validated, executable being fetched.
    Provisioning,
    /// Executable fetch or validation failed. Terminal.
    ProvisioningFailed,
    /// Container created, start issued.
    Starting,
    /// Container create/start failed. Terminal.
    StartFailed,
    /// Running but the readiness gate has not passed yet.
    Unready,
    /// Readiness gate passed.
    Ready,
    /// Readiness attempts exhausted. Terminal.
    ReadinessFailed,
    /// Recurring health checks passing.
    Healthy,
    /// Health check failing, within the tolerated budget.
    Unhealthy,
    /// Stop in progress (pre-stop hooks, container stop).
    Stopping,
    /// Container being removed.
    Deprovisioning,
    /// Cleanly stopped. Terminal.
    Stopped,
    /// Disappeared without a stop: stale report or vanished container. Terminal.
    Lost,
    /// Re-registered from a surviving container after an executor restart.
    Recovered,
}

impl InstanceState {
    /// Whether the state machine halts here.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            InstanceState::ProvisioningFailed
                | InstanceState::StartFailed
                | InstanceState::ReadinessFailed
                | InstanceState::Stopped
                | InstanceState::Lost
        )
    }

    /// Whether this is a failure outcome (every error state is terminal).
    pub fn is_error(&self) -> bool {
        matches!(
            self,
            InstanceState::ProvisioningFailed
                | InstanceState::StartFailed
                | InstanceState::ReadinessFailed
                | InstanceState::Lost
        )
    }
}

/// Lifecycle state of an application on the controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ApplicationState {
    /// Registered, no instances started yet.
    Created,
    /// Zero healthy instances; watched for recovery.
    Monitoring,
    /// At least one healthy instance.
    Running,
    /// A scale operation is in flight or awaiting retry.
    ScalingRequested,
    /// A targeted stop is in flight or awaiting retry.
    StopInstancesRequested,
    /// A replace operation is in flight or awaiting retry.
    ReplaceInstancesRequested,
    /// Teardown in flight.
    DestroyRequested,
    /// All instances went unhealthy/lost without an operator request.
    OutageDetected,
    /// Torn down. Terminal.
    Destroyed,
}

impl ApplicationState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ApplicationState::Destroyed)
    }
}
