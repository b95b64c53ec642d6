//! # OCPP Simulator
//!
//! Charging station and CSMS emulators built on `ocpp-core`.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────┐        ┌──────────────────────────────┐
//! │ StationClient                │        │ Csms                         │
//! │  Station (connectors,        │  WS    │  server (accept, negotiate)  │
//! │    transactions, outbox)     │◄──────►│  Registry: id → CsmsHandle   │
//! │  StationSession              │ocpp2.0.1  Records: boot, status,     │
//! │    notifier │ heartbeat │    │        │    transactions, meters      │
//! │    metering                  │        │                              │
//! └──────────────────────────────┘        └──────────────────────────────┘
//!            both sides: ocpp_core::Endpoint over one writer task
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use ocpp_sim::{Csms, CsmsConfig, StationClient, StationConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let csms = Arc::new(Csms::new(CsmsConfig::default())?);
//!     tokio::spawn(csms.clone().serve());
//!
//!     let station = StationClient::new(StationConfig::new("CP001", "ws://localhost:9000"))?;
//!     station.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod csms;
pub mod error;
pub mod station;
mod ws;

pub use config::{build_ocpp_url, ConfigError, CsmsConfig, MeteringConfig, StationConfig};
pub use csms::{Csms, CsmsHandle, Records, StationRecord};
pub use error::{CsmsError, StationError};
pub use station::{
    ConnectorState, MeterSimulator, Station, StationClient, StationHandle, StationSession,
    TransitionError, OCPP_SUBPROTOCOL,
};
