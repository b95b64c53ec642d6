//! Inbound action dispatch
//!
//! Maps an action to a synchronous handler. Handlers get the typed request
//! and return the typed response; the dispatcher turns every outcome into
//! the CALLRESULT or CALLERROR frame to send back.

use std::collections::HashMap;

use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, warn};

use crate::messages::{Action, Call, CallError, CallResult, ErrorCode, OcppMessage};
use crate::types::OcppRequest;

/// Failure reported by a handler
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandlerError {
    /// Handler could not process the request; answered `InternalError`
    #[error("{0}")]
    Internal(String),

    /// Request is understood but cannot be honoured; answered `NotSupported`
    #[error("{0}")]
    NotSupported(String),
}

impl HandlerError {
    pub fn internal(message: impl Into<String>) -> Self {
        HandlerError::Internal(message.into())
    }

    fn error_code(&self) -> ErrorCode {
        match self {
            HandlerError::Internal(_) => ErrorCode::InternalError,
            HandlerError::NotSupported(_) => ErrorCode::NotSupported,
        }
    }
}

enum Failure {
    Payload(serde_json::Error),
    Handler(HandlerError),
}

type BoxedHandler = Box<dyn Fn(Value) -> Result<Value, Failure> + Send + Sync>;

/// Registry of inbound action handlers
#[derive(Default)]
pub struct Dispatcher {
    handlers: HashMap<Action, BoxedHandler>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed handler for `Req::ACTION`, replacing any earlier one
    pub fn register<Req, F>(&mut self, handler: F) -> &mut Self
    where
        Req: OcppRequest + DeserializeOwned + 'static,
        F: Fn(Req) -> Result<Req::Response, HandlerError> + Send + Sync + 'static,
    {
        self.register_raw(Req::ACTION, move |payload| {
            let request: Req = serde_json::from_value(payload).map_err(Failure::Payload)?;
            let response = handler(request).map_err(Failure::Handler)?;
            serde_json::to_value(response)
                .map_err(|e| Failure::Handler(HandlerError::internal(e.to_string())))
        })
    }

    fn register_raw<F>(&mut self, action: Action, handler: F) -> &mut Self
    where
        F: Fn(Value) -> Result<Value, Failure> + Send + Sync + 'static,
    {
        if self.handlers.insert(action, Box::new(handler)).is_some() {
            warn!(%action, "handler replaced");
        }
        self
    }

    /// Register an untyped handler working on raw payloads
    pub fn register_value<F>(&mut self, action: Action, handler: F) -> &mut Self
    where
        F: Fn(Value) -> Result<Value, HandlerError> + Send + Sync + 'static,
    {
        self.register_raw(action, move |payload| handler(payload).map_err(Failure::Handler))
    }

    pub fn handles(&self, action: Action) -> bool {
        self.handlers.contains_key(&action)
    }

    /// Actions with a registered handler, sorted
    pub fn actions(&self) -> Vec<Action> {
        let mut actions: Vec<Action> = self.handlers.keys().copied().collect();
        actions.sort();
        actions
    }

    /// Run the handler for an inbound call and build the reply frame
    pub fn dispatch(&self, call: &Call) -> OcppMessage {
        let handler = match self.handlers.get(&call.action) {
            Some(handler) => handler,
            None => {
                debug!(action = %call.action, "no handler registered");
                return CallError::new(
                    &call.message_id,
                    ErrorCode::NotImplemented,
                    format!("{} is not implemented", call.action),
                )
                .into();
            }
        };

        match handler(call.payload.clone()) {
            Ok(payload) => CallResult::new(&call.message_id, payload).into(),
            Err(Failure::Payload(e)) => {
                warn!(action = %call.action, "malformed payload: {}", e);
                CallError::new(&call.message_id, ErrorCode::FormatViolation, e.to_string()).into()
            }
            Err(Failure::Handler(e)) => {
                warn!(action = %call.action, "handler failed: {}", e);
                CallError::new(&call.message_id, e.error_code(), e.to_string()).into()
            }
        }
    }
}
