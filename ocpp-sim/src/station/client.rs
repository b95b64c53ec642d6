//! Charging station WebSocket client
//!
//! Connects to the CSMS with the OCPP 2.0.1 subprotocol, runs one
//! [`StationSession`] per connection and reconnects with exponential
//! backoff when the connection drops.

use std::sync::Arc;

use futures_util::StreamExt;
use ocpp_core::{
    AuthorizationStatus, AuthorizeRequest, Endpoint, IdToken, Observer, StartOutcome, StopOutcome,
};
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tokio_tungstenite::{
    connect_async_with_config,
    tungstenite::{
        client::IntoClientRequest,
        http::{header, HeaderValue},
        protocol::WebSocketConfig,
        Message,
    },
};
use tracing::{debug, error, info, warn};

use super::metering::MeterSimulator;
use super::session::{dispatcher, StationSession};
use super::state::Station;
use crate::config::StationConfig;
use crate::error::StationError;
use crate::ws::spawn_writer;

/// OCPP 2.0.1 WebSocket subprotocol
pub const OCPP_SUBPROTOCOL: &str = "ocpp2.0.1";

/// Local control surface of a running station.
///
/// Usable whether or not a connection is up; calls that need the CSMS fail
/// with [`StationError::NotConnected`] while offline.
#[derive(Clone)]
pub struct StationHandle {
    station: Arc<Station>,
    endpoint: Arc<Mutex<Option<Arc<Endpoint>>>>,
}

impl StationHandle {
    pub fn new(station: Arc<Station>) -> Self {
        Self {
            station,
            endpoint: Arc::new(Mutex::new(None)),
        }
    }

    pub fn station(&self) -> &Arc<Station> {
        &self.station
    }

    pub fn attach(&self, endpoint: Arc<Endpoint>) {
        *self.endpoint.lock() = Some(endpoint);
    }

    pub fn detach(&self) {
        self.endpoint.lock().take();
    }

    pub fn is_connected(&self) -> bool {
        self.endpoint.lock().is_some()
    }

    /// Ask the CSMS about a token
    pub async fn authorize(&self, id_token: &IdToken) -> Result<AuthorizationStatus, StationError> {
        let endpoint = self.endpoint.lock().clone().ok_or(StationError::NotConnected)?;
        let response = endpoint
            .call(&AuthorizeRequest {
                id_token: id_token.clone(),
            })
            .await?;
        Ok(response.id_token_info.status)
    }

    /// Start charging on a connector after a local token presentation.
    ///
    /// While connected the token is authorized with the CSMS first; offline
    /// the station's own allow-list decides.
    pub async fn start_local(&self, connector_id: i32, id_token: IdToken) -> StartOutcome {
        if self.is_connected() {
            match self.authorize(&id_token).await {
                Ok(status) if !status.is_accepted() => {
                    info!(station = %self.station.station_id(), token = %id_token.id_token, ?status, "token refused by CSMS");
                    return StartOutcome::rejected("InvalidToken");
                }
                Ok(_) => {}
                Err(e) => warn!(station = %self.station.station_id(), "Authorize failed: {}, using local list", e),
            }
        }
        self.station.start_local(connector_id, id_token)
    }

    pub fn stop_local(&self, connector_id: i32) -> StopOutcome {
        self.station.stop_local(connector_id)
    }
}

/// Charging station emulator
pub struct StationClient {
    config: Arc<StationConfig>,
    station: Arc<Station>,
    meter: Arc<MeterSimulator>,
    observer: Observer,
    handle: StationHandle,
}

impl StationClient {
    pub fn new(config: StationConfig) -> Result<Self, StationError> {
        config.validate()?;

        let station = Arc::new(Station::new(&config)?);
        let meter = Arc::new(MeterSimulator::new(config.metering.clone()));
        let handle = StationHandle::new(station.clone());

        Ok(Self {
            config: Arc::new(config),
            station,
            meter,
            observer: Observer::default(),
            handle,
        })
    }

    pub fn station(&self) -> &Arc<Station> {
        &self.station
    }

    pub fn observer(&self) -> &Observer {
        &self.observer
    }

    pub fn handle(&self) -> StationHandle {
        self.handle.clone()
    }

    /// Run the connection loop forever
    pub async fn run(&self) -> Result<(), StationError> {
        let mut reconnect_delay = self.config.reconnect_delay;

        loop {
            info!("Connecting to CSMS: {}", self.config.station_url());

            match self.connect_and_run().await {
                Ok(()) => {
                    info!(station = %self.config.station_id, "connection closed");
                    reconnect_delay = self.config.reconnect_delay;
                }
                Err(e) => error!(station = %self.config.station_id, "connection error: {}", e),
            }

            info!("Reconnecting in {:?}", reconnect_delay);
            tokio::time::sleep(reconnect_delay).await;
            reconnect_delay = std::cmp::min(reconnect_delay * 2, self.config.max_reconnect_delay);
        }
    }

    /// Connect once and run until the connection ends
    pub async fn connect_and_run(&self) -> Result<(), StationError> {
        let url = self.config.station_url();

        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| StationError::InvalidUrl(format!("{}: {}", url, e)))?;
        request.headers_mut().insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(OCPP_SUBPROTOCOL),
        );

        let ws_config = WebSocketConfig {
            max_message_size: Some(64 * 1024),
            max_frame_size: Some(16 * 1024),
            ..Default::default()
        };

        let (ws_stream, response) = connect_async_with_config(request, Some(ws_config), false)
            .await
            .map_err(|e| StationError::Connect(e.to_string()))?;

        let accepted_protocol = response
            .headers()
            .get(header::SEC_WEBSOCKET_PROTOCOL)
            .and_then(|v| v.to_str().ok());
        if accepted_protocol != Some(OCPP_SUBPROTOCOL) {
            warn!("CSMS did not accept OCPP 2.0.1 subprotocol, got: {:?}", accepted_protocol);
        }

        info!("WebSocket connected to {}", url);

        let (ws_tx, mut ws_rx) = ws_stream.split();
        let (outbound, writer) = spawn_writer(ws_tx);

        let endpoint = Arc::new(
            Endpoint::new(
                self.config.station_id.clone(),
                outbound,
                Arc::new(dispatcher(&self.station)),
            )
            .with_retry(self.config.retry.clone())
            .with_response_timeout(self.config.response_timeout)
            .with_observer(self.observer.clone()),
        );
        self.handle.attach(endpoint.clone());
        self.observer.connected(&self.config.station_id);

        let (stop, stopped) = oneshot::channel::<()>();
        let mut session = tokio::spawn(
            StationSession::new(
                endpoint.clone(),
                self.station.clone(),
                self.meter.clone(),
                self.config.clone(),
            )
            .run_until(async {
                let _ = stopped.await;
            }),
        );
        let mut session_done = false;

        let result = loop {
            tokio::select! {
                msg = ws_rx.next() => match msg {
                    Some(Ok(Message::Text(text))) => endpoint.handle_frame(text.as_str()).await,
                    Some(Ok(Message::Binary(_))) => warn!("binary frame ignored"),
                    Some(Ok(Message::Close(frame))) => {
                        debug!("close frame: {:?}", frame);
                        break Ok(());
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => break Err(StationError::Connect(e.to_string())),
                    None => break Ok(()),
                },
                joined = &mut session => {
                    session_done = true;
                    break match joined {
                        Ok(result) => result,
                        Err(e) => Err(StationError::Connect(format!("session task ended: {}", e))),
                    };
                }
            }
        };

        self.handle.detach();
        if !session_done {
            let _ = stop.send(());
            if let Err(e) = session.await {
                warn!(station = %self.config.station_id, "session task ended: {}", e);
            }
        }
        endpoint.shutdown();
        writer.abort();
        self.station.on_disconnected();
        self.observer.disconnected(&self.config.station_id);

        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StationConfig;
    use crate::station::connector::ConnectorState;

    #[tokio::test]
    async fn test_handle_offline() {
        let station = Arc::new(Station::new(&StationConfig::default()).unwrap());
        let handle = StationHandle::new(station.clone());
        assert!(!handle.is_connected());

        let err = handle.authorize(&IdToken::central("T1")).await.unwrap_err();
        assert!(matches!(err, StationError::NotConnected));

        // Offline the station's own list decides
        let outcome = handle.start_local(1, IdToken::central("T1")).await;
        assert!(outcome.is_accepted());
        assert_eq!(station.connector(1).unwrap().state, ConnectorState::Charging);
        assert!(handle.stop_local(1).is_accepted());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let config = StationConfig::new("CP001", "ws://127.0.0.1:1");
        let client = StationClient::new(config).unwrap();

        let err = client.connect_and_run().await.unwrap_err();
        assert!(matches!(err, StationError::Connect(_)));
        assert!(!client.handle().is_connected());
    }

    #[test]
    fn test_invalid_config_rejected() {
        let config = StationConfig::new("", "ws://localhost:9000");
        assert!(matches!(StationClient::new(config), Err(StationError::Config(_))));
    }
}
