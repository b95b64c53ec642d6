//! Connector state machine
//!
//! Internal states are finer than the OCPP 2.0.1 wire status: `Preparing`,
//! `Charging` and `Finishing` are all reported as `Occupied`.

use ocpp_core::ConnectorStatus;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ConnectorState {
    Available,
    Preparing,
    Charging,
    Finishing,
    Reserved,
    Unavailable,
    Faulted,
}

impl ConnectorState {
    /// Status carried by StatusNotification
    pub fn wire_status(self) -> ConnectorStatus {
        match self {
            ConnectorState::Available => ConnectorStatus::Available,
            ConnectorState::Preparing | ConnectorState::Charging | ConnectorState::Finishing => {
                ConnectorStatus::Occupied
            }
            ConnectorState::Reserved => ConnectorStatus::Reserved,
            ConnectorState::Unavailable => ConnectorStatus::Unavailable,
            ConnectorState::Faulted => ConnectorStatus::Faulted,
        }
    }

    /// Whether `self -> next` is in the transition table
    pub fn can_transition_to(self, next: ConnectorState) -> bool {
        use ConnectorState::*;

        match (self, next) {
            (Available, Preparing | Reserved) => true,
            (Preparing, Charging | Available) => true,
            (Charging, Finishing) => true,
            (Finishing, Available) => true,
            (Reserved, Available) => true,
            (Unavailable, Available) | (Faulted, Available) => true,
            (Faulted, Unavailable) => true,
            (from, Unavailable) if from != Unavailable => true,
            (from, Faulted) if from != Faulted => true,
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("connector {connector_id}: {from:?} -> {to:?} is not allowed")]
pub struct TransitionError {
    pub connector_id: i32,
    pub from: ConnectorState,
    pub to: ConnectorState,
}

/// One physical charging socket
#[derive(Debug, Clone)]
pub struct Connector {
    id: i32,
    state: ConnectorState,
    transaction_id: Option<String>,
    energy_kwh: f64,
    operative: bool,
    faulted: bool,
}

impl Connector {
    pub fn new(id: i32) -> Self {
        Self {
            id,
            state: ConnectorState::Available,
            transaction_id: None,
            energy_kwh: 0.0,
            operative: true,
            faulted: false,
        }
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn state(&self) -> ConnectorState {
        self.state
    }

    pub fn transaction_id(&self) -> Option<&str> {
        self.transaction_id.as_deref()
    }

    /// Cumulative imported energy (kWh)
    pub fn energy_kwh(&self) -> f64 {
        self.energy_kwh
    }

    pub fn is_operative(&self) -> bool {
        self.operative
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted
    }

    /// Move to `next`, leaving the state unchanged when the table forbids it
    pub fn transition(&mut self, next: ConnectorState) -> Result<ConnectorState, TransitionError> {
        if !self.state.can_transition_to(next) {
            return Err(TransitionError {
                connector_id: self.id,
                from: self.state,
                to: next,
            });
        }
        let previous = self.state;
        self.state = next;
        Ok(previous)
    }

    /// State to settle in when idle
    pub fn resting_state(&self) -> ConnectorState {
        if self.faulted {
            ConnectorState::Faulted
        } else if !self.operative {
            ConnectorState::Unavailable
        } else {
            ConnectorState::Available
        }
    }

    /// Advance the energy counter; only a charging connector meters
    pub fn add_energy(&mut self, delta_kwh: f64) -> f64 {
        if self.state == ConnectorState::Charging && delta_kwh.is_finite() && delta_kwh > 0.0 {
            self.energy_kwh += delta_kwh;
        }
        self.energy_kwh
    }

    pub(crate) fn set_operative(&mut self, operative: bool) {
        self.operative = operative;
    }

    pub(crate) fn set_faulted(&mut self, faulted: bool) {
        self.faulted = faulted;
    }

    pub(crate) fn attach_transaction(&mut self, transaction_id: String) {
        self.transaction_id = Some(transaction_id);
    }

    pub(crate) fn detach_transaction(&mut self) -> Option<String> {
        self.transaction_id.take()
    }
}
