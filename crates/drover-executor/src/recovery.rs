//! Crash recovery — re-adopt surviving containers after a restart.
//!
//! Containers carry drover's identifying labels, including the serialized
//! instance spec. On executor start, running containers with those labels
//! are re-registered into the engine around their existing container
//! instead of being re-created — a restart must not double-start
//! surviving workloads.

use tracing::{info, warn};

use drover_core::InstanceSpec;

use crate::engine::{EngineError, InstanceEngine};
use crate::runtime::{ContainerStatus, LABEL_INSTANCE_SPEC, LABEL_MANAGED_BY};

/// Scan the runtime for surviving managed containers and adopt them.
/// Returns the number of instances recovered.
pub async fn recover_instances(engine: &InstanceEngine) -> Result<u32, EngineError> {
    let survivors = engine
        .runtime()
        .list_by_label(LABEL_MANAGED_BY, "true")
        .await?;

    let mut recovered = 0;
    for container in survivors {
        if container.status != ContainerStatus::Running {
            continue;
        }
        let Some(serialized) = container.labels.get(LABEL_INSTANCE_SPEC) else {
            warn!(container = %container.id, "managed container without a spec label, skipping");
            continue;
        };
        let spec: InstanceSpec = match serde_json::from_str(serialized) {
            Ok(spec) => spec,
            Err(e) => {
                warn!(
                    container = %container.id,
                    error = %e,
                    "unparseable spec label, skipping"
                );
                continue;
            }
        };

        let instance_id = spec.instance_id.clone();
        match engine.adopt_instance(spec, container.id.clone()) {
            Ok(()) => {
                info!(instance = %instance_id, container = %container.id, "instance recovered");
                recovered += 1;
            }
            Err(EngineError::Duplicate(_)) => {
                // Already tracked (double recovery call); leave it alone.
            }
            Err(e) => {
                warn!(instance = %instance_id, error = %e, "recovery failed for instance");
            }
        }
    }
    Ok(recovered)
}
