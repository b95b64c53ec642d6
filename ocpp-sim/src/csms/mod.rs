//! CSMS emulator
//!
//! One [`Csms`] accepts any number of station connections. Each connection
//! gets its own endpoint with the CSMS handlers and is registered by station
//! id, so operators can send calls to a station through its [`CsmsHandle`].

pub mod handlers;
pub mod records;
pub mod registry;
pub mod server;
pub mod session;

use std::sync::atomic::AtomicI32;
use std::sync::Arc;

use ocpp_core::{Endpoint, Observer, Outbound};
use tracing::info;

pub use records::{MeterLogEntry, Records, StationRecord, TransactionLogEntry};
pub use registry::Registry;
pub use session::CsmsHandle;

use crate::config::CsmsConfig;
use crate::error::CsmsError;

pub struct Csms {
    config: Arc<CsmsConfig>,
    records: Records,
    registry: Registry,
    observer: Observer,
    remote_start_ids: Arc<AtomicI32>,
}

impl Csms {
    pub fn new(config: CsmsConfig) -> Result<Self, CsmsError> {
        config.validate()?;
        Ok(Self {
            config: Arc::new(config),
            records: Records::new(),
            registry: Registry::new(),
            observer: Observer::default(),
            remote_start_ids: Arc::new(AtomicI32::new(0)),
        })
    }

    pub fn config(&self) -> &CsmsConfig {
        &self.config
    }

    pub fn records(&self) -> &Records {
        &self.records
    }

    pub fn observer(&self) -> &Observer {
        &self.observer
    }

    /// Bind a new station connection to its outbound queue
    pub fn attach(&self, station_id: &str, outbound: Outbound) -> CsmsHandle {
        let dispatcher = handlers::dispatcher(station_id, self.records.clone(), self.config.clone());
        let endpoint = Endpoint::new(station_id, outbound, Arc::new(dispatcher))
            .with_retry(self.config.retry.clone())
            .with_response_timeout(self.config.response_timeout)
            .with_observer(self.observer.clone());

        let handle = CsmsHandle::new(station_id, Arc::new(endpoint), self.remote_start_ids.clone());
        if let Some(previous) = self.registry.insert(handle.clone()) {
            previous.endpoint().shutdown();
            previous.close();
        }
        self.observer.connected(station_id);
        info!(station = %station_id, connected = self.registry.len(), "station attached");
        handle
    }

    /// Tear down a connection; pending calls fail with `ConnectionLost`
    pub fn detach(&self, handle: &CsmsHandle) {
        handle.endpoint().shutdown();
        if self.registry.remove(handle) {
            info!(station = %handle.station_id(), "station detached");
        }
        self.observer.disconnected(handle.station_id());
    }

    /// Live connection for a station
    pub fn station(&self, station_id: &str) -> Result<CsmsHandle, CsmsError> {
        self.registry
            .get(station_id)
            .ok_or_else(|| CsmsError::UnknownStation(station_id.to_string()))
    }

    pub fn connected_stations(&self) -> Vec<String> {
        self.registry.station_ids()
    }
}
