//! One connected station, seen from the CSMS

use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::Arc;

use ocpp_core::{
    AvailabilityOutcome, ChangeAvailabilityRequest, Endpoint, IdToken, OperationalStatus,
    RequestStartTransactionRequest, RequestStopTransactionRequest, StartOutcome, StopOutcome,
    EVSE,
};
use tokio::sync::Notify;
use tracing::info;

use crate::error::CsmsError;

/// Typed call sender for one station connection
#[derive(Clone)]
pub struct CsmsHandle {
    station_id: String,
    session_id: String,
    endpoint: Arc<Endpoint>,
    remote_start_ids: Arc<AtomicI32>,
    closing: Arc<Notify>,
}

impl CsmsHandle {
    pub fn new(
        station_id: impl Into<String>,
        endpoint: Arc<Endpoint>,
        remote_start_ids: Arc<AtomicI32>,
    ) -> Self {
        Self {
            station_id: station_id.into(),
            session_id: uuid::Uuid::new_v4().to_string(),
            endpoint,
            remote_start_ids,
            closing: Arc::new(Notify::new()),
        }
    }

    pub fn station_id(&self) -> &str {
        &self.station_id
    }

    /// Identifies this connection among reconnects of the same station
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn endpoint(&self) -> &Arc<Endpoint> {
        &self.endpoint
    }

    /// Ask the connection task to drop the socket
    pub fn close(&self) {
        self.closing.notify_one();
    }

    /// Completes once [`CsmsHandle::close`] was called
    pub async fn closed(&self) {
        self.closing.notified().await;
    }

    pub async fn request_start_transaction(
        &self,
        evse_id: Option<i32>,
        id_token: IdToken,
    ) -> Result<StartOutcome, CsmsError> {
        let remote_start_id = self.remote_start_ids.fetch_add(1, Ordering::Relaxed) + 1;
        let response = self
            .endpoint
            .call(&RequestStartTransactionRequest {
                id_token,
                remote_start_id,
                evse_id,
            })
            .await?;

        let outcome = StartOutcome::from(response);
        info!(station = %self.station_id, remote_start_id, ?outcome, "RequestStartTransaction");
        Ok(outcome)
    }

    pub async fn request_stop_transaction(
        &self,
        transaction_id: impl Into<String>,
    ) -> Result<StopOutcome, CsmsError> {
        let transaction_id = transaction_id.into();
        let response = self
            .endpoint
            .call(&RequestStopTransactionRequest {
                transaction_id: transaction_id.clone(),
            })
            .await?;

        let outcome = StopOutcome::from(response);
        info!(station = %self.station_id, %transaction_id, ?outcome, "RequestStopTransaction");
        Ok(outcome)
    }

    /// Change one EVSE, or the whole station with `None`
    pub async fn change_availability(
        &self,
        evse_id: Option<i32>,
        status: OperationalStatus,
    ) -> Result<AvailabilityOutcome, CsmsError> {
        let response = self
            .endpoint
            .call(&ChangeAvailabilityRequest {
                operational_status: status,
                evse: evse_id.map(|id| EVSE {
                    id,
                    connector_id: None,
                }),
            })
            .await?;

        let outcome = AvailabilityOutcome::from(response);
        info!(station = %self.station_id, ?evse_id, ?status, ?outcome, "ChangeAvailability");
        Ok(outcome)
    }
}
