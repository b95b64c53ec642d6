//! Read-only event feed for monitoring
//!
//! Connection lifecycle and every frame sent or received are published on
//! a broadcast channel. Subscribers that fall behind lose events; the
//! protocol path never waits for them.

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;

use crate::messages::{Action, OcppMessage};

/// Default number of buffered events per subscriber
pub const DEFAULT_FEED_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum EventKind {
    Connected,
    Disconnected,
    #[serde(rename_all = "camelCase")]
    Frame {
        direction: Direction,
        message_type: u8,
        message_id: String,
        /// Action of the call, or of the call a result/error answers
        action: Option<Action>,
        payload: Value,
    },
}

/// One entry of the monitoring feed
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub peer_id: String,
    pub timestamp: DateTime<Utc>,
    #[serde(flatten)]
    pub kind: EventKind,
}

/// Publisher side of the feed
#[derive(Debug, Clone)]
pub struct Observer {
    tx: broadcast::Sender<Event>,
}

impl Default for Observer {
    fn default() -> Self {
        Self::new(DEFAULT_FEED_CAPACITY)
    }
}

impl Observer {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    pub fn emit(&self, peer_id: &str, kind: EventKind) {
        // No subscribers is fine
        let _ = self.tx.send(Event {
            peer_id: peer_id.to_string(),
            timestamp: Utc::now(),
            kind,
        });
    }

    pub fn connected(&self, peer_id: &str) {
        self.emit(peer_id, EventKind::Connected);
    }

    pub fn disconnected(&self, peer_id: &str) {
        self.emit(peer_id, EventKind::Disconnected);
    }

    /// Publish a decoded frame
    pub fn frame(
        &self,
        peer_id: &str,
        direction: Direction,
        message: &OcppMessage,
        action: Option<Action>,
    ) {
        let payload = match message {
            OcppMessage::Call(call) => call.payload.clone(),
            OcppMessage::CallResult(result) => result.payload.clone(),
            OcppMessage::CallError(error) => json!({
                "errorCode": error.error_code,
                "errorDescription": error.error_description,
                "errorDetails": error.error_details,
            }),
        };

        self.emit(
            peer_id,
            EventKind::Frame {
                direction,
                message_type: message.message_type() as u8,
                message_id: message.message_id().to_string(),
                action,
                payload,
            },
        );
    }

    /// Publish a frame that could not be decoded
    pub fn raw_frame(&self, peer_id: &str, direction: Direction, message_id: &str, text: &str) {
        self.emit(
            peer_id,
            EventKind::Frame {
                direction,
                message_type: 0,
                message_id: message_id.to_string(),
                action: None,
                payload: Value::String(text.to_string()),
            },
        );
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::{Call, CallError, ErrorCode};

    #[tokio::test]
    async fn test_frames_reach_subscribers() {
        let observer = Observer::new(8);
        let mut rx = observer.subscribe();

        observer.connected("CP001");
        let call = OcppMessage::Call(Call::new("m1", Action::Heartbeat, json!({})));
        observer.frame("CP001", Direction::Outbound, &call, Some(Action::Heartbeat));

        assert_eq!(rx.recv().await.unwrap().kind, EventKind::Connected);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.peer_id, "CP001");
        match event.kind {
            EventKind::Frame {
                direction,
                message_type,
                message_id,
                action,
                ..
            } => {
                assert_eq!(direction, Direction::Outbound);
                assert_eq!(message_type, 2);
                assert_eq!(message_id, "m1");
                assert_eq!(action, Some(Action::Heartbeat));
            }
            other => panic!("Expected Frame, got {:?}", other),
        }
    }

    #[test]
    fn test_emit_without_subscribers() {
        let observer = Observer::default();
        observer.disconnected("CP001");
        assert_eq!(observer.subscriber_count(), 0);
    }

    #[test]
    fn test_event_json_shape() {
        let observer = Observer::new(4);
        let mut rx = observer.subscribe();
        let error = OcppMessage::CallError(CallError::new("-1", ErrorCode::FormatViolation, "bad"));
        observer.frame("CP002", Direction::Inbound, &error, None);

        let event = rx.try_recv().unwrap();
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["peerId"], "CP002");
        assert_eq!(json["type"], "frame");
        assert_eq!(json["direction"], "Inbound");
        assert_eq!(json["messageType"], 4);
        assert_eq!(json["payload"]["errorCode"], "FormatViolation");
    }
}
