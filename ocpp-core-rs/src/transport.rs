//! Outbound send path shared by every producer on a connection
//!
//! A connection has exactly one writer task. Everything that wants to put a
//! frame on the wire (call senders, the dispatcher's replies, heartbeat and
//! metering) goes through an [`Outbound`] handle, which queues the frame on
//! an mpsc channel and waits for the writer to acknowledge the write.

use tokio::sync::{mpsc, oneshot};
use thiserror::Error;

/// Default depth of the outbound queue
pub const DEFAULT_QUEUE_DEPTH: usize = 64;

/// Transport-level send failures
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    /// The writer task is gone; the connection is closed
    #[error("connection closed")]
    Closed,

    /// The writer could not put the frame on the wire
    #[error("write failed: {0}")]
    Write(String),
}

impl TransportError {
    /// Whether another attempt might succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Write(_))
    }
}

/// One encoded frame waiting for the writer
#[derive(Debug)]
pub struct OutboundFrame {
    pub text: String,
    ack: oneshot::Sender<Result<(), TransportError>>,
}

impl OutboundFrame {
    /// Report the result of the write back to the sender
    pub fn complete(self, result: Result<(), TransportError>) {
        let _ = self.ack.send(result);
    }
}

/// Cloneable handle onto a connection's writer queue
#[derive(Debug, Clone)]
pub struct Outbound {
    tx: mpsc::Sender<OutboundFrame>,
}

impl Outbound {
    /// Create a handle and the receiver the writer task drains
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<OutboundFrame>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Queue a frame and wait until the writer has handled it
    pub async fn send(&self, text: String) -> Result<(), TransportError> {
        let (ack, done) = oneshot::channel();
        self.tx
            .send(OutboundFrame { text, ack })
            .await
            .map_err(|_| TransportError::Closed)?;

        // A writer that drops the frame without answering has gone away
        done.await.unwrap_or(Err(TransportError::Closed))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
