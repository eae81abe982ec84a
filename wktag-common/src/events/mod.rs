//! Event types for the WKTAG event system
//!
//! Provides worker lifecycle events and the EventBus used to broadcast them
//! to whatever monitoring or UI layer subscribes.

mod worker_types;

pub use worker_types::{DevicePreference, HealthStatus, WorkerState};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Worker lifecycle events
///
/// Emitted by the supervisor; serializable for transmission to monitoring
/// layers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum WorkerEvent {
    /// A worker process was started (first start or restart)
    WorkerSpawned {
        component_id: String,
        execution_tier: u8,
        device_preference: DevicePreference,
        /// Process id reported by the OS, if any
        pid: Option<u32>,
        timestamp: DateTime<Utc>,
    },

    /// The supervisor's view of a worker's health changed
    WorkerStatusChanged {
        component_id: String,
        old_status: HealthStatus,
        new_status: HealthStatus,
        timestamp: DateTime<Utc>,
    },

    /// Worker channel closed without a stop request
    WorkerCrashed {
        component_id: String,
        /// Lifetime crash count including this one
        restart_count: u32,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// Restart policy chose to restart after a delay
    WorkerRestartScheduled {
        component_id: String,
        delay_ms: u64,
        timestamp: DateTime<Utc>,
    },

    /// Worker entered the terminal failed state
    WorkerFailed {
        component_id: String,
        reason: String,
        timestamp: DateTime<Utc>,
    },

    /// Worker exited after a stop request
    WorkerStopped {
        component_id: String,
        /// False when the grace period elapsed and the process was killed
        graceful: bool,
        timestamp: DateTime<Utc>,
    },

    /// Execution tier (re)selected
    TierSelected {
        tier: u8,
        worker_count: usize,
        device_preference: Option<DevicePreference>,
        timestamp: DateTime<Utc>,
    },
}

impl WorkerEvent {
    /// Component the event refers to (None for pool-wide events)
    pub fn component_id(&self) -> Option<&str> {
        match self {
            WorkerEvent::WorkerSpawned { component_id, .. }
            | WorkerEvent::WorkerStatusChanged { component_id, .. }
            | WorkerEvent::WorkerCrashed { component_id, .. }
            | WorkerEvent::WorkerRestartScheduled { component_id, .. }
            | WorkerEvent::WorkerFailed { component_id, .. }
            | WorkerEvent::WorkerStopped { component_id, .. } => Some(component_id),
            WorkerEvent::TierSelected { .. } => None,
        }
    }
}

/// Broadcast bus for worker events
///
/// Slow subscribers lose the oldest events rather than blocking the
/// supervisor.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<WorkerEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// # Arguments
    ///
    /// * `capacity` - Number of events to buffer before dropping old events
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    ///
    /// Events emitted before subscription are not received.
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Ok(subscriber_count)` if at least one subscriber exists.
    pub fn emit(
        &self,
        event: WorkerEvent,
    ) -> Result<usize, broadcast::error::SendError<WorkerEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: WorkerEvent) {
        let _ = self.tx.send(event);
    }

    /// Get the current number of active subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Get the configured channel capacity
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_event_bus_delivers_to_subscriber() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.emit(WorkerEvent::WorkerFailed {
            component_id: "worker:discovery:0".to_string(),
            reason: "lifetime restart limit".to_string(),
            timestamp: Utc::now(),
        })
        .unwrap();

        let event = rx.recv().await.unwrap();
        assert_eq!(event.component_id(), Some("worker:discovery:0"));
    }

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new(4);
        assert!(bus
            .emit(WorkerEvent::TierSelected {
                tier: 4,
                worker_count: 0,
                device_preference: None,
                timestamp: Utc::now(),
            })
            .is_err());
        // Lossy variant never fails
        bus.emit_lossy(WorkerEvent::TierSelected {
            tier: 4,
            worker_count: 0,
            device_preference: None,
            timestamp: Utc::now(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = WorkerEvent::WorkerStopped {
            component_id: "worker:discovery:1".to_string(),
            graceful: true,
            timestamp: Utc::now(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "WorkerStopped");
        assert_eq!(json["graceful"], true);
    }
}
