//! State-change event bus and its built-in subscribers.
//!
//! Every instance transition on an executor is published as an
//! [`InstanceEvent`]. Subscribers attach by name — connecting twice under
//! one name is a no-op, disconnecting an unknown name is a no-op — which
//! keeps wiring idempotent across reconfigurations.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use drover_core::{AppId, ExecutorId, InstanceId, InstanceState};

/// One instance state transition, as broadcast to subscribers.
#[derive(Debug, Clone)]
pub struct InstanceEvent {
    pub executor_id: ExecutorId,
    pub app_id: AppId,
    pub instance_id: InstanceId,
    pub state: InstanceState,
    pub error: Option<String>,
    pub timestamp_secs: u64,
}

/// Typed publish/subscribe channel for instance events.
pub struct EventBus {
    sender: broadcast::Sender<InstanceEvent>,
    subscribers: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(256);
        Self {
            sender,
            subscribers: Mutex::new(HashMap::new()),
        }
    }

    /// Publish an event. Having no subscribers is fine.
    pub fn publish(&self, event: InstanceEvent) {
        let _ = self.sender.send(event);
    }

    /// A raw receiver for callers that manage their own task.
    pub fn subscribe(&self) -> broadcast::Receiver<InstanceEvent> {
        self.sender.subscribe()
    }

    /// Attach a named handler on its own task. Idempotent: a second
    /// connect under the same name is ignored.
    pub fn connect<F>(&self, name: &str, handler: F)
    where
        F: Fn(InstanceEvent) + Send + 'static,
    {
        let mut subscribers = self.lock_subscribers();
        if subscribers.contains_key(name) {
            debug!(subscriber = name, "already connected, ignoring");
            return;
        }
        let mut receiver = self.sender.subscribe();
        let task_name = name.to_string();
        let handle = tokio::spawn(async move {
            loop {
                match receiver.recv().await {
                    Ok(event) => handler(event),
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(subscriber = %task_name, missed, "subscriber lagged, events dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        subscribers.insert(name.to_string(), handle);
        debug!(subscriber = name, "connected");
    }

    /// Detach a named handler. Idempotent.
    pub fn disconnect(&self, name: &str) {
        if let Some(handle) = self.lock_subscribers().remove(name) {
            handle.abort();
            debug!(subscriber = name, "disconnected");
        }
    }

    /// Names of currently connected handlers.
    pub fn connected(&self) -> Vec<String> {
        self.lock_subscribers().keys().cloned().collect()
    }

    fn lock_subscribers(&self) -> std::sync::MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Counts transitions per state — the executor's cheap local telemetry.
#[derive(Default)]
pub struct InstanceStatsTracker {
    counts: Mutex<HashMap<&'static str, u64>>,
}

impl InstanceStatsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach to a bus under the conventional subscriber name.
    pub fn attach(self: Arc<Self>, bus: &EventBus) {
        bus.connect("stats-tracker", move |event| {
            self.record(event.state);
        });
    }

    pub fn record(&self, state: InstanceState) {
        let mut counts = self.counts.lock().unwrap_or_else(PoisonError::into_inner);
        *counts.entry(state_key(state)).or_insert(0) += 1;
    }

    pub fn count(&self, state: InstanceState) -> u64 {
        self.counts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(state_key(state))
            .copied()
            .unwrap_or(0)
    }
}

fn state_key(state: InstanceState) -> &'static str {
    match state {
        InstanceState::Pending => "pending",
        InstanceState::Provisioning => "provisioning",
        InstanceState::ProvisioningFailed => "provisioning_failed",
        InstanceState::Starting => "starting",
        InstanceState::StartFailed => "start_failed",
        InstanceState::Unready => "unready",
        InstanceState::Ready => "ready",
        InstanceState::ReadinessFailed => "readiness_failed",
        InstanceState::Healthy => "healthy",
        InstanceState::Unhealthy => "unhealthy",
        InstanceState::Stopping => "stopping",
        InstanceState::Deprovisioning => "deprovisioning",
        InstanceState::Stopped => "stopped",
        InstanceState::Lost => "lost",
        InstanceState::Recovered => "recovered",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::time::Duration;

    fn event(state: InstanceState) -> InstanceEvent {
        InstanceEvent {
            executor_id: "exec-1".to_string(),
            app_id: "app-1".to_string(),
            instance_id: "inst-1".to_string(),
            state,
            error: None,
            timestamp_secs: 0,
        }
    }

    #[tokio::test]
    async fn connect_is_idempotent_by_name() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicU64::new(0));

        for _ in 0..3 {
            let hits = hits.clone();
            bus.connect("reporter", move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }
        assert_eq!(bus.connected().len(), 1);

        bus.publish(event(InstanceState::Healthy));
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn disconnect_stops_delivery() {
        let bus = EventBus::new();
        let hits = Arc::new(AtomicU64::new(0));
        {
            let hits = hits.clone();
            bus.connect("reporter", move |_| {
                hits.fetch_add(1, Ordering::SeqCst);
            });
        }

        bus.publish(event(InstanceState::Healthy));
        tokio::time::sleep(Duration::from_millis(20)).await;
        bus.disconnect("reporter");
        bus.disconnect("reporter"); // idempotent
        bus.publish(event(InstanceState::Stopped));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert!(bus.connected().is_empty());
    }

    #[tokio::test]
    async fn stats_tracker_counts_transitions() {
        let bus = EventBus::new();
        let tracker = Arc::new(InstanceStatsTracker::new());
        tracker.clone().attach(&bus);

        bus.publish(event(InstanceState::Healthy));
        bus.publish(event(InstanceState::Healthy));
        bus.publish(event(InstanceState::Stopped));
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(tracker.count(InstanceState::Healthy), 2);
        assert_eq!(tracker.count(InstanceState::Stopped), 1);
        assert_eq!(tracker.count(InstanceState::Lost), 0);
    }
}
