//! Protocol endpoint for one connection
//!
//! Both roles run the same engine: the station and the CSMS each hold an
//! [`Endpoint`] per WebSocket. The connection's read loop feeds every text
//! frame into [`Endpoint::handle_frame`]; any task may originate calls with
//! [`Endpoint::call`] or [`Endpoint::send_call`].

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tracing::{debug, warn};

use crate::correlation::{CallFailure, Correlator};
use crate::dispatcher::Dispatcher;
use crate::messages::{Action, Call, OcppMessage, UNKNOWN_MESSAGE_ID};
use crate::observer::{Direction, Observer};
use crate::retry::RetryPolicy;
use crate::transport::{Outbound, TransportError};
use crate::types::OcppRequest;

/// Default time to wait for a CALLRESULT/CALLERROR
pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(30);

pub struct Endpoint {
    peer_id: String,
    outbound: Outbound,
    correlator: Correlator,
    dispatcher: Arc<Dispatcher>,
    retry: RetryPolicy,
    response_timeout: Duration,
    observer: Option<Observer>,
}

impl Endpoint {
    pub fn new(peer_id: impl Into<String>, outbound: Outbound, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            peer_id: peer_id.into(),
            outbound,
            correlator: Correlator::new(),
            dispatcher,
            retry: RetryPolicy::default(),
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            observer: None,
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn with_observer(mut self, observer: Observer) -> Self {
        self.observer = Some(observer);
        self
    }

    /// Identity of the remote side (station id)
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }

    pub fn response_timeout(&self) -> Duration {
        self.response_timeout
    }

    pub fn pending_calls(&self) -> usize {
        self.correlator.len()
    }

    /// Send a typed request and decode the typed response
    pub async fn call<R: OcppRequest>(&self, request: &R) -> Result<R::Response, CallFailure> {
        let payload = serde_json::to_value(request)?;
        let result = self.send_call(R::ACTION, payload, self.response_timeout).await?;
        Ok(serde_json::from_value(result)?)
    }

    /// Send a call and wait for exactly one outcome
    pub async fn send_call(
        &self,
        action: Action,
        payload: Value,
        timeout: Duration,
    ) -> Result<Value, CallFailure> {
        let (message_id, mut rx) = self.correlator.register(action);
        let message = OcppMessage::Call(Call::new(message_id.clone(), action, payload));

        if let Err(e) = self.send_message(&message, Some(action)).await {
            self.correlator.expire(&message_id);
            return Err(CallFailure::Send(e));
        }

        match tokio::time::timeout(timeout, &mut rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(CallFailure::ConnectionLost),
            Err(_) => {
                if self.correlator.expire(&message_id) {
                    warn!(peer = %self.peer_id, %action, message_id = %message_id, "call timed out after {:?}", timeout);
                    Err(CallFailure::Timeout)
                } else {
                    // Answered between the deadline and the expiry
                    rx.await.unwrap_or(Err(CallFailure::ConnectionLost))
                }
            }
        }
    }

    /// Process one inbound text frame
    pub async fn handle_frame(&self, text: &str) {
        let message = match OcppMessage::decode(text.as_bytes()) {
            Ok(message) => message,
            Err(e) => {
                warn!(peer = %self.peer_id, "undecodable frame: {}", e);
                if let Some(observer) = &self.observer {
                    let id = e.message_id().unwrap_or(UNKNOWN_MESSAGE_ID);
                    observer.raw_frame(&self.peer_id, Direction::Inbound, id, text);
                }
                let reply = OcppMessage::CallError(e.to_call_error());
                if let Err(e) = self.send_message(&reply, None).await {
                    warn!(peer = %self.peer_id, "failed to send FormatViolation: {}", e);
                }
                return;
            }
        };

        match message {
            OcppMessage::Call(ref call) => {
                self.observe(Direction::Inbound, &message, Some(call.action));
                let reply = self.dispatcher.dispatch(call);
                if let Err(e) = self.send_message(&reply, Some(call.action)).await {
                    warn!(peer = %self.peer_id, action = %call.action, "failed to send reply: {}", e);
                }
            }
            OcppMessage::CallResult(ref result) => {
                let action = self
                    .correlator
                    .resolve(&result.message_id, Ok(result.payload.clone()));
                if action.is_none() {
                    warn!(peer = %self.peer_id, message_id = %result.message_id, "unmatched CALLRESULT dropped");
                }
                self.observe(Direction::Inbound, &message, action);
            }
            OcppMessage::CallError(ref error) => {
                let failure = CallFailure::Remote {
                    code: error.error_code,
                    description: error.error_description.clone(),
                    details: error.error_details.clone(),
                };
                let action = self.correlator.resolve(&error.message_id, Err(failure));
                if action.is_none() {
                    warn!(
                        peer = %self.peer_id,
                        message_id = %error.message_id,
                        code = %error.error_code,
                        "unmatched CALLERROR dropped: {}",
                        error.error_description
                    );
                }
                self.observe(Direction::Inbound, &message, action);
            }
        }
    }

    /// Fail every pending call with `ConnectionLost`
    pub fn shutdown(&self) -> usize {
        let failed = self.correlator.fail_all();
        if failed > 0 {
            debug!(peer = %self.peer_id, failed, "pending calls failed on shutdown");
        }
        failed
    }

    async fn send_message(
        &self,
        message: &OcppMessage,
        action: Option<Action>,
    ) -> Result<(), TransportError> {
        let text = message.encode();
        self.retry
            .run_if(
                |_| self.outbound.send(text.clone()),
                TransportError::is_retryable,
            )
            .await?;
        debug!(peer = %self.peer_id, "sent {}", text);
        self.observe(Direction::Outbound, message, action);
        Ok(())
    }

    fn observe(&self, direction: Direction, message: &OcppMessage, action: Option<Action>) {
        if let Some(observer) = &self.observer {
            observer.frame(&self.peer_id, direction, message, action);
        }
    }
}
