//! Fabrication events and the broadcast bus that carries them

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

/// Scheduler and pipeline notifications
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum FabricationEvent {
    SegmentCreated {
        chain_id: Uuid,
        segment_id: Uuid,
        offset: u64,
        timestamp: DateTime<Utc>,
    },

    SegmentCrafted {
        chain_id: Uuid,
        segment_id: Uuid,
        offset: u64,
        timestamp: DateTime<Utc>,
    },

    SegmentDubbed {
        chain_id: Uuid,
        segment_id: Uuid,
        offset: u64,
        pick_count: usize,
        timestamp: DateTime<Utc>,
    },

    /// Craft failed and the segment was reverted to Planned
    CraftFailed {
        chain_id: Uuid,
        segment_id: Uuid,
        offset: u64,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// Shipping failed; the segment stays in Dubbing for retry
    DubFailed {
        chain_id: Uuid,
        segment_id: Uuid,
        offset: u64,
        error: String,
        timestamp: DateTime<Utc>,
    },

    SegmentsErased {
        count: usize,
        older_than: DateTime<Utc>,
        timestamp: DateTime<Utc>,
    },

    /// Medic cleared a stalled in-flight marker
    WorkerRestarted {
        chain_id: Uuid,
        stalled_seconds: f64,
        timestamp: DateTime<Utc>,
    },

    ChainCompleted {
        chain_id: Uuid,
        timestamp: DateTime<Utc>,
    },

    ChainStuck {
        chain_id: Uuid,
        consecutive_failures: u32,
        last_error: String,
        timestamp: DateTime<Utc>,
    },
}

impl FabricationEvent {
    /// Chain the event concerns, if any
    pub fn chain_id(&self) -> Option<Uuid> {
        match self {
            FabricationEvent::SegmentCreated { chain_id, .. }
            | FabricationEvent::SegmentCrafted { chain_id, .. }
            | FabricationEvent::SegmentDubbed { chain_id, .. }
            | FabricationEvent::CraftFailed { chain_id, .. }
            | FabricationEvent::DubFailed { chain_id, .. }
            | FabricationEvent::WorkerRestarted { chain_id, .. }
            | FabricationEvent::ChainCompleted { chain_id, .. }
            | FabricationEvent::ChainStuck { chain_id, .. } => Some(*chain_id),
            FabricationEvent::SegmentsErased { .. } => None,
        }
    }
}

/// Broadcast bus for [`FabricationEvent`]s
///
/// Slow subscribers lag and lose the oldest events rather than blocking emitters.
#[derive(Debug)]
pub struct EventBus {
    tx: broadcast::Sender<FabricationEvent>,
    capacity: usize,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Receive all events emitted after this call
    pub fn subscribe(&self) -> broadcast::Receiver<FabricationEvent> {
        self.tx.subscribe()
    }

    /// Emit an event; having no subscribers is not an error
    pub fn emit(&self, event: FabricationEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1000)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_emit_without_subscribers() {
        let bus = EventBus::new(10);
        bus.emit(FabricationEvent::ChainCompleted {
            chain_id: Uuid::new_v4(),
            timestamp: Utc::now(),
        });
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_subscriber_receives_event() {
        let bus = EventBus::new(10);
        let mut rx = bus.subscribe();
        let chain_id = Uuid::new_v4();
        bus.emit(FabricationEvent::ChainCompleted {
            chain_id,
            timestamp: Utc::now(),
        });
        let event = rx.recv().await.unwrap();
        assert_eq!(event.chain_id(), Some(chain_id));
    }

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = FabricationEvent::SegmentsErased {
            count: 3,
            older_than: Utc::now(),
            timestamp: Utc::now(),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"type\":\"SegmentsErased\""));
    }
}
