//! WebSocket plumbing shared by both roles

use std::fmt::Display;

use futures_util::{Sink, SinkExt};
use ocpp_core::transport::DEFAULT_QUEUE_DEPTH;
use ocpp_core::{Outbound, TransportError};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::warn;

/// Sink errors the writer can tell apart
pub(crate) trait WriteError: Display {
    /// Nothing more can be written after this error
    fn is_terminal(&self) -> bool;
}

impl WriteError for tungstenite::Error {
    fn is_terminal(&self) -> bool {
        matches!(
            self,
            tungstenite::Error::ConnectionClosed | tungstenite::Error::AlreadyClosed
        )
    }
}

/// Spawn the single writer task of a connection.
///
/// Frames are written in queue order and each write is acknowledged to its
/// sender. A failed write is reported as [`TransportError::Write`] so the
/// sender may retry; the task only ends once the socket is closed or every
/// [`Outbound`] handle is gone.
pub(crate) fn spawn_writer<S>(mut sink: S) -> (Outbound, JoinHandle<()>)
where
    S: Sink<Message> + Unpin + Send + 'static,
    S::Error: WriteError,
{
    let (outbound, mut frames) = Outbound::channel(DEFAULT_QUEUE_DEPTH);

    let writer = tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            match sink.send(Message::Text(frame.text.clone().into())).await {
                Ok(()) => frame.complete(Ok(())),
                Err(e) if e.is_terminal() => {
                    frame.complete(Err(TransportError::Closed));
                    break;
                }
                Err(e) => {
                    warn!("write failed: {}", e);
                    frame.complete(Err(TransportError::Write(e.to_string())));
                }
            }
        }
        let _ = sink.close().await;
    });

    (outbound, writer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::sync::Arc;
    use std::task::{Context, Poll};
    use std::time::Duration;

    use ocpp_core::{
        Backoff, CallResult, Dispatcher, Endpoint, HeartbeatRequest, OcppMessage, RetryPolicy,
    };
    use serde_json::json;
    use tokio::sync::mpsc;

    #[derive(Debug)]
    enum SinkFault {
        Transient,
        Closed,
    }

    impl Display for SinkFault {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            write!(f, "{:?}", self)
        }
    }

    impl WriteError for SinkFault {
        fn is_terminal(&self) -> bool {
            matches!(self, SinkFault::Closed)
        }
    }

    /// Sink that fails a number of writes before passing frames on
    struct FlakySink {
        faults: Vec<SinkFault>,
        tx: mpsc::UnboundedSender<Message>,
    }

    impl FlakySink {
        fn new(mut faults: Vec<SinkFault>) -> (Self, mpsc::UnboundedReceiver<Message>) {
            faults.reverse();
            let (tx, rx) = mpsc::unbounded_channel();
            (Self { faults, tx }, rx)
        }
    }

    impl Sink<Message> for FlakySink {
        type Error = SinkFault;

        fn poll_ready(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), SinkFault>> {
            Poll::Ready(Ok(()))
        }

        fn start_send(mut self: Pin<&mut Self>, item: Message) -> Result<(), SinkFault> {
            if let Some(fault) = self.faults.pop() {
                return Err(fault);
            }
            self.tx.send(item).map_err(|_| SinkFault::Closed)
        }

        fn poll_flush(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), SinkFault>> {
            Poll::Ready(Ok(()))
        }

        fn poll_close(self: Pin<&mut Self>, _: &mut Context<'_>) -> Poll<Result<(), SinkFault>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_writer_acks_in_order() {
        let (sink, mut rx) = FlakySink::new(Vec::new());
        let (outbound, writer) = spawn_writer(sink);

        outbound.send("first".to_string()).await.unwrap();
        outbound.send("second".to_string()).await.unwrap();

        assert_eq!(rx.recv().await, Some(Message::Text("first".into())));
        assert_eq!(rx.recv().await, Some(Message::Text("second".into())));

        drop(outbound);
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_transient_failure_keeps_writer() {
        let (sink, mut rx) = FlakySink::new(vec![SinkFault::Transient]);
        let (outbound, writer) = spawn_writer(sink);

        let err = outbound.send("lost".to_string()).await.unwrap_err();
        assert!(err.is_retryable());

        outbound.send("after".to_string()).await.unwrap();
        assert_eq!(rx.recv().await, Some(Message::Text("after".into())));
        assert!(!writer.is_finished());
    }

    #[tokio::test]
    async fn test_closed_socket_ends_writer() {
        let (sink, _rx) = FlakySink::new(vec![SinkFault::Closed]);
        let (outbound, writer) = spawn_writer(sink);

        assert_eq!(
            outbound.send("lost".to_string()).await,
            Err(TransportError::Closed)
        );
        writer.await.unwrap();
        assert_eq!(outbound.send("after".to_string()).await, Err(TransportError::Closed));
    }

    #[tokio::test]
    async fn test_call_retried_after_failed_write() {
        let (sink, mut rx) = FlakySink::new(vec![SinkFault::Transient]);
        let (outbound, _writer) = spawn_writer(sink);
        let endpoint = Arc::new(
            Endpoint::new("CP001", outbound, Arc::new(Dispatcher::new()))
                .with_retry(RetryPolicy::new(3, Backoff::Fixed(Duration::from_millis(1))))
                .with_response_timeout(Duration::from_secs(5)),
        );

        let caller = endpoint.clone();
        let call = tokio::spawn(async move { caller.call(&HeartbeatRequest {}).await });

        let written = match rx.recv().await {
            Some(Message::Text(text)) => text,
            other => panic!("Expected text frame, got {:?}", other),
        };
        let message_id = match OcppMessage::decode(written.as_bytes()).unwrap() {
            OcppMessage::Call(call) => call.message_id,
            other => panic!("Expected Call, got {:?}", other),
        };
        let reply = OcppMessage::CallResult(CallResult::new(
            message_id,
            json!({ "currentTime": "2024-01-01T00:00:00Z" }),
        ));
        endpoint.handle_frame(&reply.encode()).await;

        let response = call.await.unwrap().unwrap();
        assert_eq!(response.current_time.timestamp(), 1_704_067_200);
        assert!(rx.try_recv().is_err());
    }
}
