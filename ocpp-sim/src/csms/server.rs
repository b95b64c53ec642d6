//! WebSocket server side of the CSMS

use std::net::SocketAddr;
use std::sync::Arc;

use futures_util::StreamExt;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    accept_hdr_async,
    tungstenite::{
        handshake::server::{ErrorResponse, Request, Response},
        http::{header, HeaderValue, StatusCode},
        Message,
    },
};
use tracing::{debug, error, info, warn};

use super::Csms;
use crate::config::validate_station_id;
use crate::error::CsmsError;
use crate::station::OCPP_SUBPROTOCOL;
use crate::ws::spawn_writer;

/// Station id from the last path segment of the upgrade URI
pub fn station_id_from_path(path: &str) -> Option<&str> {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .filter(|segment| validate_station_id(segment).is_ok())
}

fn reject(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

/// Check an upgrade request and pick the subprotocol.
///
/// A client that offers no subprotocol is accepted as is; one that offers
/// only others is refused.
pub fn negotiate(request: &Request, mut response: Response) -> Result<(String, Response), ErrorResponse> {
    let station_id = station_id_from_path(request.uri().path())
        .ok_or_else(|| reject(StatusCode::NOT_FOUND, "missing station id"))?
        .to_string();

    if let Some(offered) = request.headers().get(header::SEC_WEBSOCKET_PROTOCOL) {
        let supported = offered
            .to_str()
            .map(|list| list.split(',').any(|p| p.trim() == OCPP_SUBPROTOCOL))
            .unwrap_or(false);
        if !supported {
            return Err(reject(StatusCode::BAD_REQUEST, "ocpp2.0.1 subprotocol required"));
        }
        response.headers_mut().insert(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(OCPP_SUBPROTOCOL),
        );
    }

    Ok((station_id, response))
}

impl Csms {
    /// Listen on the configured address until the process ends
    pub async fn serve(self: Arc<Self>) -> Result<(), CsmsError> {
        let listener = TcpListener::bind(self.config.bind_addr).await?;
        info!("CSMS listening on ws://{}", listener.local_addr()?);
        self.serve_on(listener).await
    }

    /// Accept connections from an already bound listener
    pub async fn serve_on(self: Arc<Self>, listener: TcpListener) -> Result<(), CsmsError> {
        loop {
            let (stream, peer) = listener.accept().await?;
            let csms = self.clone();
            tokio::spawn(async move {
                if let Err(e) = csms.handle_connection(stream, peer).await {
                    warn!(%peer, "connection ended with error: {}", e);
                }
            });
        }
    }

    async fn handle_connection(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), CsmsError> {
        let mut station_id = None;
        let ws_stream = accept_hdr_async(stream, |request: &Request, response: Response| {
            let (id, response) = negotiate(request, response)?;
            station_id = Some(id);
            Ok(response)
        })
        .await
        .map_err(|e| CsmsError::Handshake(e.to_string()))?;

        let station_id =
            station_id.ok_or_else(|| CsmsError::Handshake("missing station id".to_string()))?;
        info!(station = %station_id, %peer, "station connected");

        let (ws_tx, mut ws_rx) = ws_stream.split();
        let (outbound, writer) = spawn_writer(ws_tx);
        let handle = self.attach(&station_id, outbound);

        loop {
            let msg = tokio::select! {
                msg = ws_rx.next() => msg,
                _ = handle.closed() => {
                    info!(station = %station_id, %peer, "replaced by a newer connection");
                    break;
                }
            };
            match msg {
                Some(Ok(Message::Text(text))) => handle.endpoint().handle_frame(text.as_str()).await,
                Some(Ok(Message::Binary(_))) => warn!(station = %station_id, "binary frame ignored"),
                Some(Ok(Message::Close(frame))) => {
                    debug!(station = %station_id, "close frame: {:?}", frame);
                    break;
                }
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!(station = %station_id, "WebSocket error: {}", e);
                    break;
                }
                None => break,
            }
        }

        self.detach(&handle);
        writer.abort();
        info!(station = %station_id, "station disconnected");
        Ok(())
    }
}
