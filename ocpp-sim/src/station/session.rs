//! One connected lifetime of a charging station
//!
//! A session boots against the CSMS, then runs three supervised tasks until
//! the connection goes away:
//! - notifier: drains the station outbox in order
//! - heartbeat
//! - metering

use std::future::Future;
use std::sync::Arc;

use ocpp_core::{
    BootNotificationRequest, BootReason, CallFailure, ChangeAvailabilityRequest,
    ChangeAvailabilityResponse, ChargingStationInfo, Dispatcher, Endpoint, RegistrationStatus,
    RequestStartTransactionRequest, RequestStartTransactionResponse, RequestStopTransactionRequest,
    RequestStopTransactionResponse, StoppedReason, TriggerReason,
};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use super::heartbeat::{heartbeat_period, run_heartbeat};
use super::metering::MeterSimulator;
use super::state::{Notification, Station};
use crate::config::StationConfig;
use crate::error::StationError;

/// Handlers for the calls a CSMS may send to the station
pub fn dispatcher(station: &Arc<Station>) -> Dispatcher {
    let mut dispatcher = Dispatcher::new();

    let st = station.clone();
    dispatcher.register(move |req: RequestStartTransactionRequest| {
        let outcome = st.start_transaction(req.evse_id, req.id_token, Some(req.remote_start_id));
        Ok(RequestStartTransactionResponse::from(outcome))
    });

    let st = station.clone();
    dispatcher.register(move |req: RequestStopTransactionRequest| {
        let outcome = st.stop_transaction(
            &req.transaction_id,
            StoppedReason::Remote,
            TriggerReason::RemoteStop,
        );
        Ok(RequestStopTransactionResponse::from(outcome))
    });

    let st = station.clone();
    dispatcher.register(move |req: ChangeAvailabilityRequest| {
        let evse_id = req.evse.map(|evse| evse.id);
        Ok(ChangeAvailabilityResponse::from(
            st.change_availability(evse_id, req.operational_status),
        ))
    });

    dispatcher
}

pub struct StationSession {
    endpoint: Arc<Endpoint>,
    station: Arc<Station>,
    meter: Arc<MeterSimulator>,
    config: Arc<StationConfig>,
}

impl StationSession {
    pub fn new(
        endpoint: Arc<Endpoint>,
        station: Arc<Station>,
        meter: Arc<MeterSimulator>,
        config: Arc<StationConfig>,
    ) -> Self {
        Self {
            endpoint,
            station,
            meter,
            config,
        }
    }

    fn boot_request(&self) -> BootNotificationRequest {
        BootNotificationRequest {
            charging_station: ChargingStationInfo {
                model: self.config.model.clone(),
                vendor_name: self.config.vendor.clone(),
                serial_number: None,
                firmware_version: self.config.firmware_version.clone(),
            },
            reason: BootReason::PowerUp,
        }
    }

    /// Send BootNotification until the CSMS accepts it.
    ///
    /// Returns the heartbeat interval the CSMS asked for.
    pub async fn boot(&self) -> Result<i32, StationError> {
        let request = self.boot_request();

        loop {
            let response = match self.endpoint.call(&request).await {
                Ok(response) => response,
                Err(e @ CallFailure::Timeout) | Err(e @ CallFailure::Remote { .. }) => {
                    warn!(station = %self.station.station_id(), "BootNotification failed: {}, retrying", e);
                    tokio::time::sleep(self.config.boot_retry_delay).await;
                    continue;
                }
                Err(e) => return Err(StationError::Boot(e)),
            };

            match response.status {
                RegistrationStatus::Accepted => {
                    info!(
                        station = %self.station.station_id(),
                        interval = response.interval,
                        "boot accepted (CSMS time {})",
                        response.current_time
                    );
                    return Ok(response.interval);
                }
                status => {
                    let delay = if response.interval > 0 {
                        std::time::Duration::from_secs(response.interval as u64)
                    } else {
                        self.config.boot_retry_delay
                    };
                    info!(station = %self.station.station_id(), ?status, "boot not accepted, retrying in {:?}", delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    /// Boot, then run the station tasks until one of them ends
    pub async fn run(self) -> Result<(), StationError> {
        self.run_until(std::future::pending()).await
    }

    /// Like [`StationSession::run`], but also ends once `stop` completes.
    ///
    /// Returns only after every station task has finished.
    pub async fn run_until<F>(self, stop: F) -> Result<(), StationError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(stop);

        let interval = tokio::select! {
            booted = self.boot() => booted?,
            _ = &mut stop => return Ok(()),
        };
        self.station.on_boot_accepted();

        let period = heartbeat_period(
            self.config.heartbeat_interval,
            interval,
            self.config.adopt_boot_interval,
        );
        debug!(station = %self.station.station_id(), "heartbeat every {:?}", period);

        let mut tasks = JoinSet::new();
        tasks.spawn(run_notifier(self.station.clone(), self.endpoint.clone()));
        tasks.spawn(run_heartbeat(self.endpoint.clone(), period));
        tasks.spawn(self.meter.clone().run(self.station.clone(), self.endpoint.clone()));

        tokio::select! {
            joined = tasks.join_next() => {
                if let Some(Err(e)) = joined {
                    warn!(station = %self.station.station_id(), "station task failed: {}", e);
                }
            }
            _ = &mut stop => debug!(station = %self.station.station_id(), "session stopped"),
        }
        tasks.shutdown().await;
        Ok(())
    }
}

/// Deliver queued notifications in order.
///
/// The head is only removed after the CSMS answered, so an item in flight
/// when the connection drops stays queued.
pub async fn run_notifier(station: Arc<Station>, endpoint: Arc<Endpoint>) {
    loop {
        let notification = station.wait_notification().await;

        let result = match &notification {
            Notification::Status(request) => endpoint.call(request).await.map(|_| ()),
            Notification::Transaction(request) => match endpoint.call(request).await {
                Ok(response) => {
                    if let Some(info) = response.id_token_info {
                        debug!(
                            station = %station.station_id(),
                            transaction_id = %request.transaction_info.transaction_id,
                            status = ?info.status,
                            "token verdict"
                        );
                    }
                    station.acknowledge(request);
                    Ok(())
                }
                Err(e) => Err(e),
            },
        };

        match result {
            Ok(()) => {
                station.complete_notification(&notification);
            }
            Err(CallFailure::ConnectionLost) | Err(CallFailure::Send(_)) => return,
            Err(CallFailure::Timeout) if matches!(notification, Notification::Transaction(_)) => {
                warn!(station = %station.station_id(), "TransactionEvent timed out, resending");
            }
            Err(e) => {
                warn!(station = %station.station_id(), "dropping notification: {}", e);
                station.complete_notification(&notification);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocpp_core::{Action, Call, IdToken, OcppMessage, OperationalStatus, EVSE};
    use serde_json::json;

    fn booted_station() -> Arc<Station> {
        let station = Arc::new(Station::new(&StationConfig::default()).unwrap());
        station.on_boot_accepted();
        while station.next_notification().is_some() {}
        station
    }

    fn result_payload(message: OcppMessage) -> serde_json::Value {
        match message {
            OcppMessage::CallResult(result) => result.payload,
            other => panic!("Expected CallResult, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_until_waits_for_tasks() {
        use ocpp_core::{BootNotificationResponse, Outbound};
        use tokio::sync::oneshot;

        let config = Arc::new(StationConfig::default());
        let station = Arc::new(Station::new(&config).unwrap());
        let (outbound, mut frames) = Outbound::channel(16);
        let endpoint = Arc::new(Endpoint::new("CP001", outbound, Arc::new(dispatcher(&station))));
        let meter = Arc::new(MeterSimulator::new(config.metering.clone()));

        let (stop, stopped) = oneshot::channel::<()>();
        let session = StationSession::new(endpoint.clone(), station.clone(), meter, config);
        let running = tokio::spawn(session.run_until(async {
            let _ = stopped.await;
        }));

        let frame = frames.recv().await.unwrap();
        let boot = match OcppMessage::decode(frame.text.as_bytes()).unwrap() {
            OcppMessage::Call(call) => call,
            other => panic!("Expected Call, got {:?}", other),
        };
        frame.complete(Ok(()));
        let reply = OcppMessage::CallResult(ocpp_core::CallResult::new(
            boot.message_id,
            serde_json::to_value(BootNotificationResponse {
                current_time: chrono::Utc::now(),
                interval: 300,
                status: RegistrationStatus::Accepted,
                status_info: None,
            })
            .unwrap(),
        ));
        endpoint.handle_frame(&reply.encode()).await;
        while !station.is_online() {
            tokio::task::yield_now().await;
        }

        stop.send(()).unwrap();
        running.await.unwrap().unwrap();
        assert_eq!(Arc::strong_count(&endpoint), 1);
    }

    #[test]
    fn test_dispatcher_actions() {
        let station = booted_station();
        let dispatcher = dispatcher(&station);
        assert_eq!(
            dispatcher.actions(),
            vec![
                Action::ChangeAvailability,
                Action::RequestStartTransaction,
                Action::RequestStopTransaction,
            ]
        );
    }

    #[test]
    fn test_remote_start_and_stop() {
        let station = booted_station();
        let dispatcher = dispatcher(&station);

        let start = Call::new(
            "s1",
            Action::RequestStartTransaction,
            serde_json::to_value(RequestStartTransactionRequest {
                id_token: IdToken::central("T1"),
                remote_start_id: 9,
                evse_id: Some(2),
            })
            .unwrap(),
        );
        let payload = result_payload(dispatcher.dispatch(&start));
        assert_eq!(payload["status"], "Accepted");
        let transaction_id = payload["transactionId"].as_str().unwrap().to_string();
        assert_eq!(station.transaction(&transaction_id).unwrap().remote_start_id, Some(9));

        let stop = Call::new(
            "s2",
            Action::RequestStopTransaction,
            json!({ "transactionId": transaction_id }),
        );
        assert_eq!(result_payload(dispatcher.dispatch(&stop))["status"], "Accepted");

        let stop_again = Call::new(
            "s3",
            Action::RequestStopTransaction,
            json!({ "transactionId": transaction_id }),
        );
        let payload = result_payload(dispatcher.dispatch(&stop_again));
        assert_eq!(payload["status"], "Rejected");
        assert_eq!(payload["statusInfo"]["reasonCode"], "UnknownTransaction");
    }

    #[test]
    fn test_change_availability_handler() {
        let station = booted_station();
        let dispatcher = dispatcher(&station);

        let call = Call::new(
            "a1",
            Action::ChangeAvailability,
            serde_json::to_value(ChangeAvailabilityRequest {
                operational_status: OperationalStatus::Inoperative,
                evse: Some(EVSE { id: 1, connector_id: None }),
            })
            .unwrap(),
        );
        assert_eq!(result_payload(dispatcher.dispatch(&call))["status"], "Accepted");
        assert!(!station.connector(1).unwrap().operative);
        assert!(station.connector(2).unwrap().operative);
    }
}
