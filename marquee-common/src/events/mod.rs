//! Event types for the import engine
//!
//! Events are broadcast via EventBus for live observers (operator API, logs).
//! Every fact an event carries is also persisted; a dropped event loses nothing.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

type Timestamp = chrono::DateTime<chrono::Utc>;

/// Import engine events
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum IngestEvent {
    /// A discovery stream finished one unit and moved its cursor forward
    CursorAdvanced {
        stream: String,
        completed_position: i64,
        items_emitted: usize,
        timestamp: Timestamp,
    },

    /// A discovery stream ran out of positions
    CursorCompleted {
        stream: String,
        last_completed: Option<i64>,
        timestamp: Timestamp,
    },

    /// A discovery stream stopped making progress and needs an operator
    CursorStalled {
        stream: String,
        reason: String,
        timestamp: Timestamp,
    },

    /// A catalog item was admitted and resolved to an entity
    ItemAdmitted {
        kind: String,
        external_id: String,
        tier: String,
        entity_guid: Uuid,
        timestamp: Timestamp,
    },

    /// A catalog item was rejected by the admission filter
    ItemRejected {
        kind: String,
        external_id: String,
        reasons: Vec<String>,
        timestamp: Timestamp,
    },

    /// A manifest moved between batch states
    ManifestStatusChanged {
        manifest_id: Uuid,
        batch_key: String,
        old_status: String,
        new_status: String,
        timestamp: Timestamp,
    },

    /// Phase C produced relations for a manifest
    RelationsMaterialized {
        manifest_id: Uuid,
        created: usize,
        failed: usize,
        waiting: usize,
        timestamp: Timestamp,
    },

    /// A manifest ended in the failed state
    ManifestFailed {
        manifest_id: Uuid,
        batch_key: String,
        reason: String,
        timestamp: Timestamp,
    },
}

impl IngestEvent {
    /// Event name for logging and filtering
    pub fn event_type(&self) -> &'static str {
        match self {
            IngestEvent::CursorAdvanced { .. } => "CursorAdvanced",
            IngestEvent::CursorCompleted { .. } => "CursorCompleted",
            IngestEvent::CursorStalled { .. } => "CursorStalled",
            IngestEvent::ItemAdmitted { .. } => "ItemAdmitted",
            IngestEvent::ItemRejected { .. } => "ItemRejected",
            IngestEvent::ManifestStatusChanged { .. } => "ManifestStatusChanged",
            IngestEvent::RelationsMaterialized { .. } => "RelationsMaterialized",
            IngestEvent::ManifestFailed { .. } => "ManifestFailed",
        }
    }
}

/// Broadcast bus for IngestEvent
#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<IngestEvent>,
    capacity: usize,
}

impl EventBus {
    /// Creates a new EventBus with specified channel capacity
    ///
    /// Slow subscribers lose the oldest events once `capacity` is exceeded.
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx, capacity }
    }

    /// Subscribe to all future events
    pub fn subscribe(&self) -> broadcast::Receiver<IngestEvent> {
        self.tx.subscribe()
    }

    /// Emit an event to all subscribers
    ///
    /// Returns `Err` if no subscribers are listening.
    #[allow(clippy::result_large_err)]
    pub fn emit(
        &self,
        event: IngestEvent,
    ) -> Result<usize, broadcast::error::SendError<IngestEvent>> {
        self.tx.send(event)
    }

    /// Emit an event, ignoring if no subscribers are listening
    pub fn emit_lossy(&self, event: IngestEvent) {
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serializes_with_type_tag() {
        let event = IngestEvent::CursorCompleted {
            stream: "movies-by-page".to_string(),
            last_completed: Some(12),
            timestamp: chrono::Utc::now(),
        };

        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "CursorCompleted");
        assert_eq!(json["stream"], "movies-by-page");
        assert_eq!(json["last_completed"], 12);
    }

    #[tokio::test]
    async fn test_subscriber_receives_emitted_event() {
        let bus = EventBus::new(16);
        let mut rx = bus.subscribe();

        bus.emit_lossy(IngestEvent::ManifestFailed {
            manifest_id: Uuid::new_v4(),
            batch_key: "ceremony:2001".to_string(),
            reason: "malformed payload".to_string(),
            timestamp: chrono::Utc::now(),
        });

        let received = rx.recv().await.unwrap();
        assert_eq!(received.event_type(), "ManifestFailed");
    }

    #[test]
    fn test_emit_without_subscribers_errors() {
        let bus = EventBus::new(4);
        let result = bus.emit(IngestEvent::CursorStalled {
            stream: "s".to_string(),
            reason: "r".to_string(),
            timestamp: chrono::Utc::now(),
        });
        assert!(result.is_err());
        assert_eq!(bus.subscriber_count(), 0);
        assert_eq!(bus.capacity(), 4);
    }
}
