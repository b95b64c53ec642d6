//! End-to-end station/CSMS conversations over an in-memory link

mod common;

use std::time::Duration;

use common::{booted, csms, eventually, station_config, Link, STATION_ID};
use ocpp_core::{
    Action, AvailabilityOutcome, CallFailure, ConnectorStatus, Direction, EventKind,
    HeartbeatRequest, IdToken, OperationalStatus, StartOutcome, StopOutcome, TransactionEventType,
};
use ocpp_sim::{ConnectorState, Csms, CsmsConfig, CsmsError};
use std::sync::Arc;

fn started_id(outcome: StartOutcome) -> String {
    match outcome {
        StartOutcome::Accepted {
            transaction_id: Some(id),
        } => id,
        other => panic!("Expected accepted start, got {:?}", other),
    }
}

#[tokio::test]
async fn boot_notification_accepted() {
    let mut link = Link::new(csms(), station_config());
    link.start_session();
    booted(&link).await;

    let record = link.csms.records().get(STATION_ID).unwrap();
    assert_eq!(record.info.unwrap().vendor_name, "OCPP Simulator");
    assert_eq!(record.connectors.get(&1), Some(&ConnectorStatus::Available));
    assert_eq!(record.connectors.get(&2), Some(&ConnectorStatus::Available));
    assert!(link.station.is_online());
}

#[tokio::test]
async fn remote_start_accepted() {
    let mut link = Link::new(csms(), station_config());
    let mut feed = link.csms.observer().subscribe();
    link.start_session();
    booted(&link).await;

    let outcome = link
        .handle
        .request_start_transaction(Some(1), IdToken::central("TOKEN1"))
        .await
        .unwrap();
    let transaction_id = started_id(outcome);
    assert_eq!(link.station.connector(1).unwrap().state, ConnectorState::Charging);

    let records = link.csms.records().clone();
    let id = transaction_id.clone();
    eventually(|| {
        records
            .get(STATION_ID)
            .map_or(false, |r| r.active_transactions.contains_key(&id))
    })
    .await;

    let record = records.get(STATION_ID).unwrap();
    let events = record.events_of(&transaction_id);
    assert_eq!(events[0].event_type, TransactionEventType::Started);
    assert_eq!(events[0].seq_no, 0);
    assert_eq!(record.connectors.get(&1), Some(&ConnectorStatus::Occupied));

    // Occupied reached the CSMS before the transaction did
    let mut inbound = Vec::new();
    while let Ok(event) = feed.try_recv() {
        if let EventKind::Frame {
            direction: Direction::Inbound,
            message_type: 2,
            action: Some(action),
            payload,
            ..
        } = event.kind
        {
            inbound.push((action, payload));
        }
    }
    let occupied = inbound
        .iter()
        .position(|(action, p)| {
            *action == Action::StatusNotification && p["connectorStatus"] == "Occupied"
        })
        .unwrap();
    let started = inbound
        .iter()
        .position(|(action, p)| *action == Action::TransactionEvent && p["eventType"] == "Started")
        .unwrap();
    assert!(occupied < started);
}

#[tokio::test]
async fn duplicate_start_rejected() {
    let mut link = Link::new(csms(), station_config());
    link.start_session();
    booted(&link).await;

    let first = link
        .handle
        .request_start_transaction(Some(1), IdToken::central("TOKEN1"))
        .await
        .unwrap();
    let transaction_id = started_id(first);

    let second = link
        .handle
        .request_start_transaction(Some(1), IdToken::central("TOKEN2"))
        .await
        .unwrap();
    assert_eq!(
        second,
        StartOutcome::Rejected {
            reason: "ConnectorNotAvailable".to_string()
        }
    );

    let connector = link.station.connector(1).unwrap();
    assert_eq!(connector.state, ConnectorState::Charging);
    assert_eq!(connector.transaction_id, Some(transaction_id));
}

#[tokio::test]
async fn remote_stop_accepted() {
    let mut link = Link::new(csms(), station_config());
    link.start_session();
    booted(&link).await;

    let transaction_id = started_id(
        link.handle
            .request_start_transaction(Some(2), IdToken::central("TOKEN1"))
            .await
            .unwrap(),
    );
    for _ in 0..3 {
        link.meter.tick(&link.station);
    }

    let wrong = link.handle.request_stop_transaction("no-such-tx").await.unwrap();
    assert!(!wrong.is_accepted());

    let stopped = link
        .handle
        .request_stop_transaction(transaction_id.clone())
        .await
        .unwrap();
    assert_eq!(stopped, StopOutcome::Accepted);
    assert_eq!(link.station.connector(2).unwrap().state, ConnectorState::Available);

    let station = link.station.clone();
    let id = transaction_id.clone();
    eventually(|| station.archived_transactions().iter().any(|tx| tx.id == id)).await;

    let archived = link
        .station
        .archived_transactions()
        .into_iter()
        .find(|tx| tx.id == transaction_id)
        .unwrap();
    let meter_stop = archived.meter_stop.unwrap();
    assert!(meter_stop >= archived.meter_start);
    assert!(meter_stop > 0.0);

    let record = link.csms.records().get(STATION_ID).unwrap();
    let events = record.events_of(&transaction_id);
    assert_eq!(events.last().unwrap().event_type, TransactionEventType::Ended);
    assert_eq!(events.last().unwrap().seq_no, 1);
    let reported = events.last().unwrap().energy_kwh.unwrap();
    assert!((reported - meter_stop).abs() < 0.001);
    assert!(record.active_transactions.is_empty());
    assert_eq!(record.connectors.get(&2), Some(&ConnectorStatus::Available));
}

#[tokio::test]
async fn unanswered_call_times_out() {
    let csms = Arc::new(
        Csms::new(CsmsConfig::default().with_response_timeout(Duration::from_millis(200))).unwrap(),
    );
    let mut link = Link::new(csms, station_config());
    link.start_session();
    booted(&link).await;

    link.mute_station(true);
    let err = link
        .handle
        .change_availability(Some(1), OperationalStatus::Inoperative)
        .await
        .unwrap_err();
    assert!(matches!(err, CsmsError::Call(CallFailure::Timeout)));
    assert_eq!(link.handle.endpoint().pending_calls(), 0);

    // The station still applied the change
    assert_eq!(link.station.connector(1).unwrap().state, ConnectorState::Unavailable);

    link.mute_station(false);
    let outcome = link
        .handle
        .change_availability(Some(1), OperationalStatus::Operative)
        .await
        .unwrap();
    assert_eq!(outcome, AvailabilityOutcome::Accepted);
}

#[tokio::test]
async fn malformed_frame_then_heartbeat() {
    let mut link = Link::new(csms(), station_config());
    let mut feed = link.csms.observer().subscribe();
    link.start_session();
    booted(&link).await;

    link.inject_to_csms("[2, \"broken\"");

    let response = link.endpoint.call(&HeartbeatRequest {}).await.unwrap();
    assert!(response.current_time.timestamp() > 0);

    let mut format_violation = false;
    while let Ok(event) = feed.try_recv() {
        if let EventKind::Frame {
            direction: Direction::Outbound,
            message_type: 4,
            message_id,
            payload,
            ..
        } = event.kind
        {
            assert_eq!(message_id, "-1");
            assert_eq!(payload["errorCode"], "FormatViolation");
            format_violation = true;
        }
    }
    assert!(format_violation);
}

#[tokio::test]
async fn disconnect_ends_transaction_and_reports_after_reboot() {
    let csms = csms();
    let mut link = Link::new(csms.clone(), station_config());
    link.start_session();
    booted(&link).await;

    let transaction_id = started_id(
        link.handle
            .request_start_transaction(None, IdToken::central("TOKEN1"))
            .await
            .unwrap(),
    );
    let station = link.station.clone();
    eventually(|| station.pending_notifications() == 0).await;

    let station = link.disconnect();
    assert!(!station.is_online());
    for connector in station.connectors() {
        assert_eq!(connector.state, ConnectorState::Unavailable);
    }
    assert!(csms.connected_stations().is_empty());

    let mut link = Link::connect(csms.clone(), station, station_config());
    link.start_session();
    booted(&link).await;

    let record = csms.records().get(STATION_ID).unwrap();
    let ended = record
        .events_of(&transaction_id)
        .into_iter()
        .find(|e| e.event_type == TransactionEventType::Ended)
        .cloned()
        .unwrap();
    assert!(ended.offline);
    assert!(record.active_transactions.is_empty());
    assert_eq!(link.station.connector(1).unwrap().state, ConnectorState::Available);
}

#[tokio::test]
async fn metering_reports_monotonic_energy() {
    let config = station_config().with_meter_tick(Duration::from_millis(50));
    let mut link = Link::new(csms(), config);
    link.start_session();
    booted(&link).await;

    let transaction_id = started_id(
        link.handle
            .request_start_transaction(Some(1), IdToken::central("TOKEN1"))
            .await
            .unwrap(),
    );

    let records = link.csms.records().clone();
    eventually(|| records.get(STATION_ID).map_or(false, |r| r.meter_log.len() >= 4)).await;

    link.handle
        .request_stop_transaction(transaction_id)
        .await
        .unwrap();
    let after_stop = records.get(STATION_ID).unwrap().meter_log.len();

    let energies: Vec<f64> = records
        .get(STATION_ID)
        .unwrap()
        .meter_log
        .iter()
        .filter(|e| e.evse_id == 1)
        .filter_map(|e| e.energy_kwh)
        .collect();
    assert!(energies.windows(2).all(|w| w[0] <= w[1]));

    // At most one report can still be in flight when the stop lands
    tokio::time::sleep(Duration::from_millis(200)).await;
    let later = records.get(STATION_ID).unwrap().meter_log.len();
    assert!(later <= after_stop + 1);
}
