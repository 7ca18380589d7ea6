//! Application operations and state routing.
//!
//! Routing is a pure function: (current state, operation) → the requested
//! state the action will run under, or `None` when the combination has no
//! defined transition. `None` is deliberate idempotent draining — a stale
//! or irrelevant command is acknowledged and dropped, never an error.

use drover_core::{ApplicationSpec, ApplicationState, InstanceId};

/// An operation submitted against an application.
#[derive(Debug, Clone, PartialEq)]
pub enum ApplicationOperation {
    /// Register the application and bring up its required instances.
    Create { spec: ApplicationSpec },
    /// Move the desired instance count to `required`.
    Scale { required: u32 },
    /// Replace the targeted instances (all healthy ones when empty).
    /// `stop_first` trades a serving gap for conservative resource use.
    ReplaceInstances {
        instance_ids: Vec<InstanceId>,
        stop_first: bool,
    },
    /// Stop the targeted instances and shrink the desired count to match.
    StopInstances { instance_ids: Vec<InstanceId> },
    /// Stop everything but keep the desired count for a later recover.
    Suspend,
    /// Tear the application down permanently.
    Destroy,
    /// Bring a monitored/outage application back to its desired count.
    Recover,
}

impl ApplicationOperation {
    /// Short name for logs.
    pub fn name(&self) -> &'static str {
        match self {
            ApplicationOperation::Create { .. } => "create",
            ApplicationOperation::Scale { .. } => "scale",
            ApplicationOperation::ReplaceInstances { .. } => "replace_instances",
            ApplicationOperation::StopInstances { .. } => "stop_instances",
            ApplicationOperation::Suspend => "suspend",
            ApplicationOperation::Destroy => "destroy",
            ApplicationOperation::Recover => "recover",
        }
    }
}

/// Route an operation against the current state.
///
/// Exhaustive over the operation enum; every arm either names the
/// requested state or drains the command.
pub fn route(
    current: &ApplicationState,
    operation: &ApplicationOperation,
) -> Option<ApplicationState> {
    use ApplicationState::*;

    if current.is_terminal() {
        return None;
    }

    match operation {
        // Create is handled before routing (it needs no prior state); a
        // create against an existing application drains.
        ApplicationOperation::Create { .. } => None,

        ApplicationOperation::Scale { .. } => match current {
            Created | Monitoring | Running | ScalingRequested | OutageDetected => {
                Some(ScalingRequested)
            }
            _ => None,
        },

        ApplicationOperation::ReplaceInstances { .. } => match current {
            Running | Monitoring | ReplaceInstancesRequested => Some(ReplaceInstancesRequested),
            _ => None,
        },

        ApplicationOperation::StopInstances { .. } | ApplicationOperation::Suspend => {
            match current {
                Created | Running | Monitoring | OutageDetected | StopInstancesRequested => {
                    Some(StopInstancesRequested)
                }
                _ => None,
            }
        }

        ApplicationOperation::Destroy => Some(DestroyRequested),

        ApplicationOperation::Recover => match current {
            Monitoring | OutageDetected => Some(ScalingRequested),
            _ => None,
        },
    }
}
