//! Observable protocol milestones, published for tests and the console.
//! Each event carries the local Lamport clock at the time it was raised.
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

use crate::coord::bully::ElectionState;
use crate::coord::core::ProcessId;

static EVENT_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Event raised by one process
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordEvent {
    /// Unique event identifier for tracking
    pub id: u64,
    /// Wall-clock milliseconds since the Unix epoch
    pub wall_time: i64,
    /// Process that raised the event
    pub process_id: ProcessId,
    /// Lamport clock of that process when the event was raised
    pub clock: u64,
    pub kind: CoordEventKind,
}

impl CoordEvent {
    pub fn new(process_id: ProcessId, clock: u64, kind: CoordEventKind) -> Self {
        Self {
            id: EVENT_COUNTER.fetch_add(1, Ordering::Relaxed) + 1,
            wall_time: chrono::Utc::now().timestamp_millis(),
            process_id,
            clock,
            kind,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum CoordEventKind {
    /// A multicast left the pending queue in total order
    MessageDelivered {
        sender_id: ProcessId,
        timestamp: u64,
        content: String,
    },

    ResourceRequested {
        resource_id: String,
        timestamp: u64,
    },

    /// A competing request was queued until release
    RequestDeferred {
        resource_id: String,
        requester_id: ProcessId,
    },

    ResourceAcquired {
        resource_id: String,
    },

    ResourceReleased {
        resource_id: String,
        deferred_replies: usize,
    },

    ElectionStarted {
        election_id: ProcessId,
    },

    StateChange {
        from_state: ElectionState,
        to_state: ElectionState,
        reason: String,
    },

    LeaderElected {
        leader_id: ProcessId,
    },

    /// The monitored leader stopped answering or its link went down
    LeaderSuspected {
        leader_id: ProcessId,
    },
}

/// Event channel wrapper for broadcasting events to multiple subscribers
#[derive(Debug, Clone)]
pub struct EventBroadcaster {
    sender: tokio::sync::broadcast::Sender<CoordEvent>,
}

impl EventBroadcaster {
    /// Creates a new event broadcaster with specified channel capacity
    pub fn new(capacity: usize) -> (Self, tokio::sync::broadcast::Receiver<CoordEvent>) {
        let (sender, receiver) = tokio::sync::broadcast::channel(capacity);
        (Self { sender }, receiver)
    }

    /// Broadcasts an event to all subscribers
    pub fn emit(
        &self,
        event: CoordEvent,
    ) -> Result<usize, tokio::sync::broadcast::error::SendError<CoordEvent>> {
        self.sender.send(event)
    }

    /// Creates a new subscriber to the event stream
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<CoordEvent> {
        self.sender.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_ids_increase() {
        let first = CoordEvent::new(1, 3, CoordEventKind::LeaderElected { leader_id: 1 });
        let second = CoordEvent::new(1, 4, CoordEventKind::LeaderElected { leader_id: 1 });
        assert!(second.id > first.id);
        assert_eq!(first.process_id, 1);
        assert_eq!(first.clock, 3);
    }

    #[test]
    fn test_event_broadcaster() {
        let (broadcaster, mut receiver) = EventBroadcaster::new(16);
        let event = CoordEvent::new(
            2,
            7,
            CoordEventKind::ResourceAcquired {
                resource_id: "r1".to_string(),
            },
        );
        broadcaster.emit(event.clone()).unwrap();

        let received = receiver.blocking_recv().unwrap();
        assert_eq!(received.id, event.id);
        assert_eq!(received.kind, event.kind);
        assert_eq!(broadcaster.receiver_count(), 1);
    }

    #[test]
    fn test_event_serialization() {
        let event = CoordEvent::new(
            3,
            1,
            CoordEventKind::StateChange {
                from_state: ElectionState::Idle,
                to_state: ElectionState::Electing,
                reason: "operator".to_string(),
            },
        );

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains(r#""type":"StateChange""#));
        let deserialized: CoordEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(deserialized.process_id, 3);
        assert_eq!(deserialized.kind, event.kind);
    }
}
