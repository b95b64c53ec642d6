//! Configuration for the station and CSMS emulators
//!
//! Both are plain structs consumed once when a session starts.

use std::collections::HashSet;
use std::net::SocketAddr;
use std::time::Duration;

use ocpp_core::{Backoff, RetryPolicy, DEFAULT_RESPONSE_TIMEOUT};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ConfigError {
    #[error("station id must not be empty")]
    EmptyStationId,

    #[error("station id must not contain '/': {0}")]
    InvalidStationId(String),

    #[error("CSMS URL must start with ws:// or wss://: {0}")]
    InvalidUrl(String),

    #[error("at least one connector is required")]
    NoConnectors,

    #[error("too many connectors: {0}")]
    TooManyConnectors(u32),

    #[error("{name} must be greater than zero")]
    ZeroDuration { name: &'static str },

    #[error("invalid range for {name}: {min} > {max}")]
    InvalidRange {
        name: &'static str,
        min: f64,
        max: f64,
    },
}

/// Metering simulator settings
#[derive(Debug, Clone)]
pub struct MeteringConfig {
    /// Interval between meter ticks
    pub tick_interval: Duration,

    /// Energy added per tick while charging (kWh)
    pub energy_min_kwh: f64,
    pub energy_max_kwh: f64,

    /// Instantaneous power reported while charging (kW)
    pub power_min_kw: f64,
    pub power_max_kw: f64,

    /// Fixed seed for reproducible runs
    pub seed: Option<u64>,

    /// Also send TransactionEvent(Updated) on every tick
    pub transaction_updates: bool,
}

impl Default for MeteringConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(5),
            energy_min_kwh: 0.1,
            energy_max_kwh: 0.5,
            power_min_kw: 3.0,
            power_max_kw: 22.0,
            seed: None,
            transaction_updates: false,
        }
    }
}

/// Charging station emulator configuration
#[derive(Debug, Clone)]
pub struct StationConfig {
    /// Station identity (last URL path segment)
    pub station_id: String,

    /// CSMS WebSocket URL (without station ID)
    pub csms_url: String,

    /// Vendor name for BootNotification
    pub vendor: String,

    /// Model name for BootNotification
    pub model: String,

    /// Firmware version (optional)
    pub firmware_version: Option<String>,

    /// Number of connectors, numbered from 1
    pub connector_count: u32,

    /// Heartbeat period until the CSMS supplies one
    pub heartbeat_interval: Duration,

    /// Use the interval from an accepted BootNotification
    pub adopt_boot_interval: bool,

    /// Delay before retrying a boot the CSMS did not accept, when it gives none
    pub boot_retry_delay: Duration,

    pub metering: MeteringConfig,

    /// Send retry policy for every outbound frame
    pub retry: RetryPolicy,

    /// Time to wait for a CALLRESULT/CALLERROR
    pub response_timeout: Duration,

    /// Initial reconnect delay
    pub reconnect_delay: Duration,

    /// Maximum reconnect delay (exponential backoff cap)
    pub max_reconnect_delay: Duration,

    /// Tokens allowed to start a transaction; `None` allows every token
    pub authorized_tokens: Option<HashSet<String>>,
}

impl Default for StationConfig {
    fn default() -> Self {
        Self {
            station_id: "CP001".to_string(),
            csms_url: "ws://localhost:9000".to_string(),
            vendor: "OCPP Simulator".to_string(),
            model: "Charging Station Simulator".to_string(),
            firmware_version: Some(env!("CARGO_PKG_VERSION").to_string()),
            connector_count: 2,
            heartbeat_interval: Duration::from_secs(60),
            adopt_boot_interval: true,
            boot_retry_delay: Duration::from_secs(10),
            metering: MeteringConfig::default(),
            retry: RetryPolicy::default(),
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
            reconnect_delay: Duration::from_secs(5),
            max_reconnect_delay: Duration::from_secs(300),
            authorized_tokens: None,
        }
    }
}

impl StationConfig {
    /// Create config with basic parameters
    pub fn new(station_id: impl Into<String>, csms_url: impl Into<String>) -> Self {
        Self {
            station_id: station_id.into(),
            csms_url: csms_url.into(),
            ..Default::default()
        }
    }

    /// Set vendor info
    pub fn with_vendor(mut self, vendor: impl Into<String>, model: impl Into<String>) -> Self {
        self.vendor = vendor.into();
        self.model = model.into();
        self
    }

    pub fn with_connector_count(mut self, count: u32) -> Self {
        self.connector_count = count;
        self
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Keep the configured heartbeat interval even if the CSMS sends one
    pub fn with_fixed_heartbeat(mut self) -> Self {
        self.adopt_boot_interval = false;
        self
    }

    pub fn with_metering(mut self, metering: MeteringConfig) -> Self {
        self.metering = metering;
        self
    }

    pub fn with_meter_tick(mut self, interval: Duration) -> Self {
        self.metering.tick_interval = interval;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.metering.seed = Some(seed);
        self
    }

    pub fn with_retry(mut self, max_attempts: u32, backoff: Backoff) -> Self {
        self.retry = RetryPolicy::new(max_attempts, backoff);
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    /// Restrict transaction starts to the given tokens
    pub fn with_authorized_tokens<I, S>(mut self, tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.authorized_tokens = Some(tokens.into_iter().map(Into::into).collect());
        self
    }

    /// Full WebSocket URL including the station id
    pub fn station_url(&self) -> String {
        build_ocpp_url(&self.csms_url, &self.station_id)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        validate_station_id(&self.station_id)?;
        if !(self.csms_url.starts_with("ws://") || self.csms_url.starts_with("wss://")) {
            return Err(ConfigError::InvalidUrl(self.csms_url.clone()));
        }
        connector_ids(self.connector_count)?;
        non_zero("heartbeat interval", self.heartbeat_interval)?;
        non_zero("meter tick interval", self.metering.tick_interval)?;
        non_zero("response timeout", self.response_timeout)?;
        non_zero("reconnect delay", self.reconnect_delay)?;
        ordered("energy delta", self.metering.energy_min_kwh, self.metering.energy_max_kwh)?;
        ordered("power", self.metering.power_min_kw, self.metering.power_max_kw)?;
        Ok(())
    }
}

/// CSMS emulator configuration
#[derive(Debug, Clone)]
pub struct CsmsConfig {
    /// Listen address for WebSocket connections
    pub bind_addr: SocketAddr,

    /// Heartbeat interval handed out in BootNotification replies
    pub heartbeat_interval: Duration,

    /// Tokens accepted by Authorize; `None` accepts every token
    pub allowed_tokens: Option<HashSet<String>>,

    /// Send retry policy for CSMS-initiated calls
    pub retry: RetryPolicy,

    /// Time to wait for a station's reply
    pub response_timeout: Duration,
}

impl Default for CsmsConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 9000)),
            heartbeat_interval: Duration::from_secs(300),
            allowed_tokens: None,
            retry: RetryPolicy::default(),
            response_timeout: DEFAULT_RESPONSE_TIMEOUT,
        }
    }
}

impl CsmsConfig {
    pub fn new(bind_addr: SocketAddr) -> Self {
        Self {
            bind_addr,
            ..Default::default()
        }
    }

    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Accept only the given tokens in Authorize
    pub fn with_allowed_tokens<I, S>(mut self, tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.allowed_tokens = Some(tokens.into_iter().map(Into::into).collect());
        self
    }

    pub fn with_response_timeout(mut self, timeout: Duration) -> Self {
        self.response_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        non_zero("heartbeat interval", self.heartbeat_interval)?;
        non_zero("response timeout", self.response_timeout)?;
        Ok(())
    }
}

/// Build the full OCPP WebSocket URL
pub fn build_ocpp_url(base_url: &str, station_id: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), station_id)
}

pub(crate) fn validate_station_id(station_id: &str) -> Result<(), ConfigError> {
    if station_id.is_empty() {
        return Err(ConfigError::EmptyStationId);
    }
    if station_id.contains('/') {
        return Err(ConfigError::InvalidStationId(station_id.to_string()));
    }
    Ok(())
}

fn non_zero(name: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::ZeroDuration { name });
    }
    Ok(())
}

/// Connector ids `1..=count` as used on the wire
pub(crate) fn connector_ids(count: u32) -> Result<std::ops::RangeInclusive<i32>, ConfigError> {
    if count == 0 {
        return Err(ConfigError::NoConnectors);
    }
    let last = i32::try_from(count).map_err(|_| ConfigError::TooManyConnectors(count))?;
    Ok(1..=last)
}

fn ordered(name: &'static str, min: f64, max: f64) -> Result<(), ConfigError> {
    if !(min.is_finite() && max.is_finite() && min >= 0.0 && min <= max) {
        return Err(ConfigError::InvalidRange { name, min, max });
    }
    Ok(())
}
