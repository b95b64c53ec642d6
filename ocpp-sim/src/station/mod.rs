//! Charging station emulator

pub mod client;
pub mod connector;
pub mod heartbeat;
pub mod metering;
pub mod session;
pub mod state;
pub mod transaction;

pub use client::{StationClient, StationHandle, OCPP_SUBPROTOCOL};
pub use connector::{Connector, ConnectorState, TransitionError};
pub use metering::MeterSimulator;
pub use session::StationSession;
pub use state::{ConnectorSnapshot, MeterSample, Notification, Station};
pub use transaction::{Transaction, TransactionManager, TransactionPhase};
