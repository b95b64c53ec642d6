//! Call correlation
//!
//! Tracks locally-initiated calls until their result, error or timeout.
//! Each pending call owns a oneshot continuation; removing the entry from
//! the table is what decides which outcome wins, so exactly one outcome is
//! ever delivered per message id.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::debug;
use uuid::Uuid;

use crate::messages::{Action, ErrorCode};
use crate::transport::TransportError;

/// Why a call did not produce a result payload
#[derive(Debug, Error)]
pub enum CallFailure {
    #[error("peer answered {code}: {description}")]
    Remote {
        code: ErrorCode,
        description: String,
        details: Value,
    },

    #[error("timeout waiting for response")]
    Timeout,

    #[error("connection lost")]
    ConnectionLost,

    #[error("send failed: {0}")]
    Send(#[from] TransportError),

    #[error("payload error: {0}")]
    Payload(#[from] serde_json::Error),
}

impl CallFailure {
    pub fn is_timeout(&self) -> bool {
        matches!(self, CallFailure::Timeout)
    }
}

/// Outcome delivered to the caller of a pending call
pub type CallOutcome = Result<Value, CallFailure>;

struct PendingCall {
    action: Action,
    submitted_at: Instant,
    tx: oneshot::Sender<CallOutcome>,
}

/// Pending-call table for one connection
#[derive(Default)]
pub struct Correlator {
    pending: Mutex<HashMap<String, PendingCall>>,
}

impl Correlator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new call and allocate its message id
    pub fn register(&self, action: Action) -> (String, oneshot::Receiver<CallOutcome>) {
        let (tx, rx) = oneshot::channel();
        let mut pending = self.pending.lock();

        let mut message_id = Uuid::new_v4().to_string();
        while pending.contains_key(&message_id) {
            message_id = Uuid::new_v4().to_string();
        }

        pending.insert(
            message_id.clone(),
            PendingCall {
                action,
                submitted_at: Instant::now(),
                tx,
            },
        );

        (message_id, rx)
    }

    /// Deliver an outcome to a pending call.
    ///
    /// Returns the call's action, or `None` when no call with this id is
    /// pending (unknown, already answered or timed out).
    pub fn resolve(&self, message_id: &str, outcome: CallOutcome) -> Option<Action> {
        let call = self.pending.lock().remove(message_id)?;
        debug!(
            message_id,
            action = %call.action,
            elapsed = ?call.submitted_at.elapsed(),
            "call answered"
        );
        let _ = call.tx.send(outcome);
        Some(call.action)
    }

    /// Drop a pending call without delivering anything.
    ///
    /// Returns false if the call was no longer pending.
    pub fn expire(&self, message_id: &str) -> bool {
        self.pending.lock().remove(message_id).is_some()
    }

    /// Fail every pending call with `ConnectionLost`
    pub fn fail_all(&self) -> usize {
        let drained: Vec<PendingCall> = self.pending.lock().drain().map(|(_, call)| call).collect();
        let count = drained.len();
        for call in drained {
            let _ = call.tx.send(Err(CallFailure::ConnectionLost));
        }
        count
    }

    /// Action of a pending call
    pub fn action_of(&self, message_id: &str) -> Option<Action> {
        self.pending.lock().get(message_id).map(|call| call.action)
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.pending.lock().contains_key(message_id)
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}
