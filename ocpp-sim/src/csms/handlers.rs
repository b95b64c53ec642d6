//! Handlers for the calls a station sends to the CSMS

use std::sync::Arc;

use chrono::Utc;
use ocpp_core::{
    AuthorizationStatus, AuthorizeRequest, AuthorizeResponse, BootNotificationRequest,
    BootNotificationResponse, DataTransferRequest, DataTransferResponse, DataTransferStatus,
    Dispatcher, HeartbeatRequest, HeartbeatResponse, IdToken, IdTokenInfo, Measurand,
    MeterValuesRequest, MeterValuesResponse, RegistrationStatus, StatusNotificationRequest,
    StatusNotificationResponse, TransactionEventRequest, TransactionEventResponse,
};
use tracing::{debug, info};

use super::records::{latest_reading, MeterLogEntry, Records};
use crate::config::CsmsConfig;

fn verdict(config: &CsmsConfig, id_token: &IdToken) -> AuthorizationStatus {
    let allowed = config
        .allowed_tokens
        .as_ref()
        .map_or(true, |tokens| tokens.contains(&id_token.id_token));
    if allowed {
        AuthorizationStatus::Accepted
    } else {
        AuthorizationStatus::Invalid
    }
}

/// Build the dispatcher for one connected station
pub fn dispatcher(station_id: &str, records: Records, config: Arc<CsmsConfig>) -> Dispatcher {
    let mut dispatcher = Dispatcher::new();
    let interval = config.heartbeat_interval.as_secs().min(i32::MAX as u64) as i32;

    let (id, rec) = (station_id.to_string(), records.clone());
    dispatcher.register(move |req: BootNotificationRequest| {
        info!(
            station = %id,
            vendor = %req.charging_station.vendor_name,
            model = %req.charging_station.model,
            reason = ?req.reason,
            "BootNotification"
        );
        let now = Utc::now();
        rec.update(&id, |r| {
            r.info = Some(req.charging_station);
            r.booted_at = Some(now);
        });
        Ok(BootNotificationResponse {
            current_time: now,
            interval,
            status: RegistrationStatus::Accepted,
            status_info: None,
        })
    });

    let (id, rec) = (station_id.to_string(), records.clone());
    dispatcher.register(move |_: HeartbeatRequest| {
        let now = Utc::now();
        rec.update(&id, |r| r.last_heartbeat = Some(now));
        debug!(station = %id, "Heartbeat");
        Ok(HeartbeatResponse { current_time: now })
    });

    let (id, rec) = (station_id.to_string(), records.clone());
    dispatcher.register(move |req: StatusNotificationRequest| {
        info!(station = %id, evse_id = req.evse_id, status = ?req.connector_status, "StatusNotification");
        rec.update(&id, |r| {
            r.connectors.insert(req.evse_id, req.connector_status);
        });
        Ok(StatusNotificationResponse {})
    });

    let (id, cfg) = (station_id.to_string(), config.clone());
    dispatcher.register(move |req: AuthorizeRequest| {
        let status = verdict(&cfg, &req.id_token);
        info!(station = %id, token = %req.id_token.id_token, ?status, "Authorize");
        Ok(AuthorizeResponse {
            id_token_info: IdTokenInfo { status },
        })
    });

    let (id, rec, cfg) = (station_id.to_string(), records.clone(), config);
    dispatcher.register(move |req: TransactionEventRequest| {
        info!(
            station = %id,
            transaction_id = %req.transaction_info.transaction_id,
            event = ?req.event_type,
            seq_no = req.seq_no,
            trigger = ?req.trigger_reason,
            "TransactionEvent"
        );
        rec.update(&id, |r| r.record_transaction_event(&req));
        Ok(TransactionEventResponse {
            id_token_info: req.id_token.as_ref().map(|token| IdTokenInfo {
                status: verdict(&cfg, token),
            }),
            ..Default::default()
        })
    });

    let (id, rec) = (station_id.to_string(), records);
    dispatcher.register(move |req: MeterValuesRequest| {
        let entry = MeterLogEntry {
            received_at: Utc::now(),
            evse_id: req.evse_id,
            energy_kwh: latest_reading(&req.meter_value, Measurand::EnergyActiveImportRegister),
            power_kw: latest_reading(&req.meter_value, Measurand::PowerActiveImport),
        };
        debug!(station = %id, evse_id = entry.evse_id, energy = ?entry.energy_kwh, "MeterValues");
        rec.update(&id, |r| r.meter_log.push(entry));
        Ok(MeterValuesResponse {})
    });

    let id = station_id.to_string();
    dispatcher.register(move |req: DataTransferRequest| {
        info!(station = %id, vendor = %req.vendor_id, message_id = ?req.message_id, "DataTransfer");
        Ok(DataTransferResponse {
            status: DataTransferStatus::Accepted,
            data: None,
        })
    });

    dispatcher
}
