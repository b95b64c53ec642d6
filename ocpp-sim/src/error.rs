//! Error types for the emulators

use ocpp_core::CallFailure;
use thiserror::Error;

use crate::config::ConfigError;

/// Charging station emulator errors
#[derive(Debug, Error)]
pub enum StationError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("invalid CSMS URL: {0}")]
    InvalidUrl(String),

    #[error("WebSocket connection failed: {0}")]
    Connect(String),

    #[error("BootNotification failed: {0}")]
    Boot(CallFailure),

    #[error("not connected to a CSMS")]
    NotConnected,

    #[error(transparent)]
    Call(#[from] CallFailure),
}

/// CSMS emulator errors
#[derive(Debug, Error)]
pub enum CsmsError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("WebSocket handshake failed: {0}")]
    Handshake(String),

    #[error("station {0} is not connected")]
    UnknownStation(String),

    #[error(transparent)]
    Call(#[from] CallFailure),
}
