//! # OCPP Core
//!
//! OCPP 2.0.1 JSON-RPC protocol engine shared by the charging station and
//! the CSMS emulators.
//!
//! ## Architecture
//!
//! ```text
//!   WebSocket read loop                      any task
//!          │ text frame                         │ call(request)
//!          ▼                                    ▼
//! ┌──────────────────────────────────────────────────────┐
//! │ Endpoint                                             │
//! │  ┌────────┐   result/error   ┌────────────┐          │
//! │  │ Codec  │ ───────────────► │ Correlator │ ─► caller│
//! │  │        │   call           ┌────────────┐          │
//! │  │        │ ───────────────► │ Dispatcher │ ─► reply │
//! │  └────────┘                  └────────────┘          │
//! │        Outbound (retry) ──► writer task ──► socket   │
//! └──────────────────────────────────────────────────────┘
//!          │
//!          ▼ Observer (broadcast feed)
//! ```
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use ocpp_core::{Dispatcher, Endpoint, Outbound, HeartbeatRequest};
//!
//! # async fn demo() -> Result<(), Box<dyn std::error::Error>> {
//! let (outbound, _writer_rx) = Outbound::channel(64);
//! let endpoint = Endpoint::new("CP001", outbound, Arc::new(Dispatcher::new()));
//!
//! let response = endpoint.call(&HeartbeatRequest {}).await?;
//! println!("CSMS time: {}", response.current_time);
//! # Ok(())
//! # }
//! ```

pub mod correlation;
pub mod dispatcher;
pub mod endpoint;
pub mod messages;
pub mod observer;
pub mod outcome;
pub mod retry;
pub mod transport;
pub mod types;

pub use correlation::{CallFailure, Correlator};
pub use dispatcher::{Dispatcher, HandlerError};
pub use endpoint::{Endpoint, DEFAULT_RESPONSE_TIMEOUT};
pub use messages::{
    Action, Call, CallError, CallResult, CodecError, ErrorCode, MessageType, OcppMessage,
};
pub use observer::{Direction, Event, EventKind, Observer};
pub use outcome::{AvailabilityOutcome, StartOutcome, StopOutcome};
pub use retry::{Backoff, RetryPolicy};
pub use transport::{Outbound, OutboundFrame, TransportError};
pub use types::*;
