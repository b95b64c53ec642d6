//! Station state shared by every connection of the emulator
//!
//! Connectors, transactions and the outbox of pending notifications live
//! behind one lock. Every accepted transition queues its StatusNotification
//! while the lock is held, so the notifier task drains them in exactly the
//! order the transitions happened.

use std::collections::{BTreeMap, HashSet, VecDeque};

use chrono::Utc;
use ocpp_core::{
    AvailabilityOutcome, ChargingState, IdToken, MeterValue, MeterValuesRequest,
    OperationalStatus, ReadingContext, SampledValue, StartOutcome, StatusNotificationRequest,
    StopOutcome, StoppedReason, TransactionEventRequest, TransactionEventType, TransactionInfo,
    TriggerReason, EVSE,
};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use super::connector::{Connector, ConnectorState, TransitionError};
use super::transaction::{Transaction, TransactionManager};
use crate::config::{connector_ids, ConfigError, StationConfig};

/// Connector number inside each EVSE; every connector is its own EVSE
const CONNECTOR_IN_EVSE: i32 = 1;

/// A call queued for the notifier task
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Status(StatusNotificationRequest),
    Transaction(TransactionEventRequest),
}

/// One metering sample for a charging connector
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MeterSample {
    pub energy_delta_kwh: f64,
    pub power_kw: f64,
    pub voltage_v: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectorSnapshot {
    pub id: i32,
    pub state: ConnectorState,
    pub transaction_id: Option<String>,
    pub energy_kwh: f64,
    pub operative: bool,
    pub faulted: bool,
}

impl From<&Connector> for ConnectorSnapshot {
    fn from(connector: &Connector) -> Self {
        Self {
            id: connector.id(),
            state: connector.state(),
            transaction_id: connector.transaction_id().map(str::to_string),
            energy_kwh: connector.energy_kwh(),
            operative: connector.is_operative(),
            faulted: connector.is_faulted(),
        }
    }
}

struct StationInner {
    connectors: BTreeMap<i32, Connector>,
    transactions: TransactionManager,
    outbox: VecDeque<Notification>,
    online: bool,
}

impl StationInner {
    /// Transition a connector and queue its StatusNotification
    fn move_connector(&mut self, connector_id: i32, next: ConnectorState) -> Result<(), TransitionError> {
        let Some(connector) = self.connectors.get_mut(&connector_id) else {
            return Ok(());
        };
        let previous = connector.transition(next)?;
        debug!(connector_id, "{:?} -> {:?}", previous, next);

        if self.online {
            self.push_status(connector_id, next);
        }
        Ok(())
    }

    fn push_status(&mut self, connector_id: i32, state: ConnectorState) {
        self.outbox.push_back(Notification::Status(StatusNotificationRequest {
            timestamp: Utc::now(),
            connector_status: state.wire_status(),
            evse_id: connector_id,
            connector_id: CONNECTOR_IN_EVSE,
        }));
    }

    /// Close a connector's transaction and settle the connector.
    ///
    /// Queues `Finishing`, the `Ended` event, then the resting status.
    fn end_transaction(
        &mut self,
        transaction_id: &str,
        reason: StoppedReason,
        trigger: TriggerReason,
    ) -> Result<(), TransitionError> {
        let Some(connector_id) = self.transactions.active(transaction_id).map(|tx| tx.connector_id)
        else {
            return Ok(());
        };

        let charging = self
            .connectors
            .get(&connector_id)
            .map_or(false, |c| c.state() == ConnectorState::Charging);
        if charging {
            self.move_connector(connector_id, ConnectorState::Finishing)?;
        }

        let mut meter_stop = 0.0;
        if let Some(connector) = self.connectors.get_mut(&connector_id) {
            meter_stop = connector.energy_kwh();
            connector.detach_transaction();
        }

        let offline = !self.online;
        if let Some(tx) = self.transactions.close(transaction_id, meter_stop, reason) {
            let meter = vec![energy_reading(meter_stop, ReadingContext::TransactionEnd)];
            let event = transaction_event(
                tx,
                TransactionEventType::Ended,
                trigger,
                Some(ChargingState::Idle),
                meter,
                offline,
            );
            self.outbox.push_back(Notification::Transaction(event));
        }

        if charging {
            let resting = self
                .connectors
                .get(&connector_id)
                .map_or(ConnectorState::Available, Connector::resting_state);
            self.move_connector(connector_id, resting)?;
        }
        Ok(())
    }
}

/// Charging station: connectors, transactions and the notification outbox
pub struct Station {
    station_id: String,
    authorized_tokens: Option<HashSet<String>>,
    transaction_updates: bool,
    inner: Mutex<StationInner>,
    outbox_ready: Notify,
}

impl Station {
    pub fn new(config: &StationConfig) -> Result<Self, ConfigError> {
        let connectors = connector_ids(config.connector_count)?
            .map(|id| (id, Connector::new(id)))
            .collect();

        Ok(Self {
            station_id: config.station_id.clone(),
            authorized_tokens: config.authorized_tokens.clone(),
            transaction_updates: config.metering.transaction_updates,
            inner: Mutex::new(StationInner {
                connectors,
                transactions: TransactionManager::new(),
                outbox: VecDeque::new(),
                online: false,
            }),
            outbox_ready: Notify::new(),
        })
    }

    pub fn station_id(&self) -> &str {
        &self.station_id
    }

    /// Whether the token may start a transaction
    pub fn is_authorized(&self, id_token: &IdToken) -> bool {
        self.authorized_tokens
            .as_ref()
            .map_or(true, |tokens| tokens.contains(&id_token.id_token))
    }

    /// Start a transaction on an available connector.
    ///
    /// With no `evse_id` the first available connector is used. A
    /// `remote_start_id` marks the start as CSMS-initiated.
    pub fn start_transaction(
        &self,
        evse_id: Option<i32>,
        id_token: IdToken,
        remote_start_id: Option<i32>,
    ) -> StartOutcome {
        if !self.is_authorized(&id_token) {
            info!(station = %self.station_id, token = %id_token.id_token, "start rejected: token not authorized");
            return StartOutcome::rejected("InvalidToken");
        }

        let outcome = {
            let mut inner = self.inner.lock();
            Self::start_locked(&mut inner, evse_id, id_token, remote_start_id)
        };
        self.outbox_ready.notify_one();

        match &outcome {
            StartOutcome::Accepted { transaction_id } => {
                info!(station = %self.station_id, ?evse_id, "started transaction {:?}", transaction_id)
            }
            StartOutcome::Rejected { reason } => {
                info!(station = %self.station_id, ?evse_id, "start rejected: {}", reason)
            }
        }
        outcome
    }

    fn start_locked(
        inner: &mut StationInner,
        evse_id: Option<i32>,
        id_token: IdToken,
        remote_start_id: Option<i32>,
    ) -> StartOutcome {
        let connector = match evse_id {
            Some(id) => match inner.connectors.get(&id) {
                Some(connector) => connector,
                None => return StartOutcome::rejected("UnknownEvse"),
            },
            None => match inner
                .connectors
                .values()
                .find(|c| c.state() == ConnectorState::Available)
            {
                Some(connector) => connector,
                None => return StartOutcome::rejected("NoConnectorAvailable"),
            },
        };

        if connector.state() != ConnectorState::Available {
            return StartOutcome::rejected("ConnectorNotAvailable");
        }
        let connector_id = connector.id();
        let meter_start = connector.energy_kwh();

        for next in [ConnectorState::Preparing, ConnectorState::Charging] {
            if let Err(e) = inner.move_connector(connector_id, next) {
                warn!("start aborted: {}", e);
                return StartOutcome::rejected("ConnectorNotAvailable");
            }
        }

        let transaction_id =
            inner
                .transactions
                .open(connector_id, id_token.clone(), meter_start, remote_start_id);
        if let Some(connector) = inner.connectors.get_mut(&connector_id) {
            connector.attach_transaction(transaction_id.clone());
        }

        let trigger = if remote_start_id.is_some() {
            TriggerReason::RemoteStart
        } else {
            TriggerReason::Authorized
        };
        let offline = !inner.online;
        if let Some(tx) = inner.transactions.active_mut(&transaction_id) {
            let meter = vec![energy_reading(meter_start, ReadingContext::TransactionBegin)];
            let mut event = transaction_event(
                tx,
                TransactionEventType::Started,
                trigger,
                Some(ChargingState::Charging),
                meter,
                offline,
            );
            event.id_token = Some(id_token);
            inner.outbox.push_back(Notification::Transaction(event));
        }

        StartOutcome::Accepted {
            transaction_id: Some(transaction_id),
        }
    }

    /// Stop an active transaction by id
    pub fn stop_transaction(
        &self,
        transaction_id: &str,
        reason: StoppedReason,
        trigger: TriggerReason,
    ) -> StopOutcome {
        let result = {
            let mut inner = self.inner.lock();
            if inner.transactions.active(transaction_id).is_none() {
                None
            } else {
                Some(inner.end_transaction(transaction_id, reason, trigger))
            }
        };
        self.outbox_ready.notify_one();

        match result {
            None => {
                info!(station = %self.station_id, transaction_id, "stop rejected: unknown transaction");
                StopOutcome::rejected("UnknownTransaction")
            }
            Some(Err(e)) => {
                warn!(station = %self.station_id, transaction_id, "stop left connector unsettled: {}", e);
                StopOutcome::Accepted
            }
            Some(Ok(())) => {
                info!(station = %self.station_id, transaction_id, ?reason, "stopped transaction");
                StopOutcome::Accepted
            }
        }
    }

    /// Locally authorized start on a specific connector
    pub fn start_local(&self, connector_id: i32, id_token: IdToken) -> StartOutcome {
        self.start_transaction(Some(connector_id), id_token, None)
    }

    /// Locally stop whatever runs on a connector
    pub fn stop_local(&self, connector_id: i32) -> StopOutcome {
        let transaction_id = self
            .inner
            .lock()
            .transactions
            .on_connector(connector_id)
            .map(|tx| tx.id.clone());

        match transaction_id {
            Some(id) => self.stop_transaction(&id, StoppedReason::Local, TriggerReason::StopAuthorized),
            None => StopOutcome::rejected("NoTransaction"),
        }
    }

    /// Apply ChangeAvailability to one EVSE, or to all with `None`/0
    pub fn change_availability(
        &self,
        evse_id: Option<i32>,
        status: OperationalStatus,
    ) -> AvailabilityOutcome {
        let operative = status == OperationalStatus::Operative;
        let mut inner = self.inner.lock();

        let ids: Vec<i32> = match evse_id {
            None | Some(0) => inner.connectors.keys().copied().collect(),
            Some(id) if inner.connectors.contains_key(&id) => vec![id],
            Some(_) => return AvailabilityOutcome::Rejected {
                reason: "UnknownEvse".to_string(),
            },
        };

        let mut scheduled = false;
        for id in ids {
            let Some(connector) = inner.connectors.get_mut(&id) else {
                continue;
            };
            connector.set_operative(operative);

            // Applied by the stop path once the transaction ends
            if connector.transaction_id().is_some() {
                scheduled = true;
                continue;
            }

            let target = connector.resting_state();
            if connector.state() != target {
                if let Err(e) = inner.move_connector(id, target) {
                    warn!(station = %self.station_id, "availability change skipped: {}", e);
                }
            }
        }
        drop(inner);
        self.outbox_ready.notify_one();

        info!(station = %self.station_id, ?evse_id, ?status, scheduled, "availability changed");
        if scheduled {
            AvailabilityOutcome::Scheduled
        } else {
            AvailabilityOutcome::Accepted
        }
    }

    /// Local fault report; ends a running transaction
    pub fn report_fault(&self, connector_id: i32) -> bool {
        let mut inner = self.inner.lock();
        let Some(connector) = inner.connectors.get_mut(&connector_id) else {
            return false;
        };
        connector.set_faulted(true);
        let transaction_id = connector.transaction_id().map(str::to_string);

        let result = match transaction_id {
            Some(id) => {
                inner.end_transaction(&id, StoppedReason::Other, TriggerReason::AbnormalCondition)
            }
            None => inner.move_connector(connector_id, ConnectorState::Faulted),
        };
        drop(inner);
        self.outbox_ready.notify_one();

        if let Err(e) = result {
            warn!(station = %self.station_id, "fault report: {}", e);
        }
        warn!(station = %self.station_id, connector_id, "connector faulted");
        true
    }

    /// Clear a fault; the connector returns to its resting state
    pub fn clear_fault(&self, connector_id: i32) -> bool {
        let mut inner = self.inner.lock();
        let Some(connector) = inner.connectors.get_mut(&connector_id) else {
            return false;
        };
        connector.set_faulted(false);

        if connector.state() == ConnectorState::Faulted {
            let target = connector.resting_state();
            if let Err(e) = inner.move_connector(connector_id, target) {
                warn!(station = %self.station_id, "fault clear: {}", e);
            }
        }
        drop(inner);
        self.outbox_ready.notify_one();
        true
    }

    /// Advance every charging connector by one metering sample.
    ///
    /// Returns the MeterValues to send; TransactionEvent(Updated) goes to
    /// the outbox when enabled.
    pub fn meter_tick<F>(&self, mut sample: F) -> Vec<MeterValuesRequest>
    where
        F: FnMut() -> MeterSample,
    {
        let mut requests = Vec::new();
        let mut inner = self.inner.lock();
        let StationInner {
            connectors,
            transactions,
            outbox,
            online,
        } = &mut *inner;

        for connector in connectors.values_mut() {
            if connector.state() != ConnectorState::Charging {
                continue;
            }

            let reading = sample();
            let energy = connector.add_energy(reading.energy_delta_kwh);
            let current_a = if reading.voltage_v > 0.0 {
                reading.power_kw * 1000.0 / reading.voltage_v
            } else {
                0.0
            };
            let context = ReadingContext::SamplePeriodic;
            let meter_value = MeterValue {
                timestamp: Utc::now(),
                sampled_value: vec![
                    SampledValue::energy_kwh(round3(energy), context),
                    SampledValue::power_kw(round3(reading.power_kw), context),
                    SampledValue::voltage(round3(reading.voltage_v), context),
                    SampledValue::current(round3(current_a), context),
                ],
            };

            if self.transaction_updates && *online {
                let updated = connector
                    .transaction_id()
                    .and_then(|id| transactions.record_update(id));
                if let Some(tx) = updated {
                    let event = transaction_event(
                        tx,
                        TransactionEventType::Updated,
                        TriggerReason::MeterValuePeriodic,
                        Some(ChargingState::Charging),
                        vec![meter_value.clone()],
                        false,
                    );
                    outbox.push_back(Notification::Transaction(event));
                }
            }

            requests.push(MeterValuesRequest {
                evse_id: connector.id(),
                meter_value: vec![meter_value],
            });
        }
        drop(inner);

        if self.transaction_updates && !requests.is_empty() {
            self.outbox_ready.notify_one();
        }
        requests
    }

    /// Boot accepted: report every connector and resume notifications.
    ///
    /// Stale StatusNotifications are dropped; undelivered TransactionEvents
    /// stay queued ahead of the fresh statuses.
    pub fn on_boot_accepted(&self) {
        let mut inner = self.inner.lock();
        inner.online = true;
        inner
            .outbox
            .retain(|n| matches!(n, Notification::Transaction(_)));

        let ids: Vec<i32> = inner.connectors.keys().copied().collect();
        for id in ids {
            let Some(connector) = inner.connectors.get(&id) else {
                continue;
            };
            let current = connector.state();
            let target = if connector.transaction_id().is_some() {
                current
            } else {
                connector.resting_state()
            };

            if current != target && current.can_transition_to(target) {
                if let Err(e) = inner.move_connector(id, target) {
                    warn!(station = %self.station_id, "recovery: {}", e);
                }
            } else {
                inner.push_status(id, current);
            }
        }
        let queued = inner.outbox.len();
        drop(inner);

        info!(station = %self.station_id, queued, "station online");
        self.outbox_ready.notify_one();
    }

    /// Connection lost: close transactions locally and take connectors offline
    pub fn on_disconnected(&self) {
        let mut inner = self.inner.lock();
        inner.online = false;
        inner
            .outbox
            .retain(|n| matches!(n, Notification::Transaction(_)));

        let running: Vec<String> = inner.transactions.active_ids();
        for id in &running {
            if let Err(e) = inner.end_transaction(id, StoppedReason::Other, TriggerReason::AbnormalCondition) {
                warn!(station = %self.station_id, "offline close: {}", e);
            }
        }

        let ids: Vec<i32> = inner.connectors.keys().copied().collect();
        for id in ids {
            let needs_move = inner
                .connectors
                .get(&id)
                .map_or(false, |c| c.state() != ConnectorState::Unavailable);
            if needs_move {
                if let Err(e) = inner.move_connector(id, ConnectorState::Unavailable) {
                    warn!(station = %self.station_id, "offline: {}", e);
                }
            }
        }
        let queued = inner.outbox.len();
        drop(inner);

        warn!(
            station = %self.station_id,
            closed = running.len(),
            queued,
            "station offline"
        );
    }

    pub fn is_online(&self) -> bool {
        self.inner.lock().online
    }

    /// Take the next queued notification
    pub fn next_notification(&self) -> Option<Notification> {
        self.inner.lock().outbox.pop_front()
    }

    /// Head of the queue, left in place until delivered
    pub fn peek_notification(&self) -> Option<Notification> {
        self.inner.lock().outbox.front().cloned()
    }

    /// Remove a delivered notification if it is still at the head
    pub fn complete_notification(&self, delivered: &Notification) -> bool {
        let mut inner = self.inner.lock();
        if inner.outbox.front() == Some(delivered) {
            inner.outbox.pop_front();
            true
        } else {
            false
        }
    }

    /// Wait until a notification is queued and return the head
    pub async fn wait_notification(&self) -> Notification {
        loop {
            if let Some(notification) = self.peek_notification() {
                return notification;
            }
            self.outbox_ready.notified().await;
        }
    }

    /// Copy of everything still queued
    pub fn queued_notifications(&self) -> Vec<Notification> {
        self.inner.lock().outbox.iter().cloned().collect()
    }

    pub fn pending_notifications(&self) -> usize {
        self.inner.lock().outbox.len()
    }

    /// The CSMS accepted a TransactionEvent
    pub fn acknowledge(&self, event: &TransactionEventRequest) {
        if event.event_type == TransactionEventType::Ended {
            let id = &event.transaction_info.transaction_id;
            if self.inner.lock().transactions.acknowledge_end(id) {
                debug!(station = %self.station_id, transaction_id = %id, "transaction archived");
            }
        }
    }

    pub fn connectors(&self) -> Vec<ConnectorSnapshot> {
        self.inner
            .lock()
            .connectors
            .values()
            .map(ConnectorSnapshot::from)
            .collect()
    }

    pub fn connector(&self, connector_id: i32) -> Option<ConnectorSnapshot> {
        self.inner
            .lock()
            .connectors
            .get(&connector_id)
            .map(ConnectorSnapshot::from)
    }

    /// Transaction in any phase
    pub fn transaction(&self, transaction_id: &str) -> Option<Transaction> {
        self.inner.lock().transactions.find(transaction_id).cloned()
    }

    pub fn archived_transactions(&self) -> Vec<Transaction> {
        self.inner.lock().transactions.archived().to_vec()
    }
}

fn energy_reading(energy_kwh: f64, context: ReadingContext) -> MeterValue {
    MeterValue {
        timestamp: Utc::now(),
        sampled_value: vec![SampledValue::energy_kwh(round3(energy_kwh), context)],
    }
}

fn transaction_event(
    tx: &mut Transaction,
    event_type: TransactionEventType,
    trigger_reason: TriggerReason,
    charging_state: Option<ChargingState>,
    meter_value: Vec<MeterValue>,
    offline: bool,
) -> TransactionEventRequest {
    let now = Utc::now();
    TransactionEventRequest {
        event_type,
        timestamp: now,
        trigger_reason,
        seq_no: tx.next_seq_no(),
        transaction_info: TransactionInfo {
            transaction_id: tx.id.clone(),
            charging_state,
            time_spent_charging: Some((now - tx.started_at).num_seconds().max(0)),
            stopped_reason: tx.stopped_reason,
            remote_start_id: tx.remote_start_id,
        },
        offline,
        evse: Some(EVSE {
            id: tx.connector_id,
            connector_id: Some(CONNECTOR_IN_EVSE),
        }),
        id_token: None,
        meter_value,
    }
}

fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocpp_core::ConnectorStatus;

    fn station() -> Station {
        let station = Station::new(&StationConfig::default()).unwrap();
        station.on_boot_accepted();
        drain(&station);
        station
    }

    fn drain(station: &Station) -> Vec<Notification> {
        std::iter::from_fn(|| station.next_notification()).collect()
    }

    fn statuses(notifications: &[Notification]) -> Vec<(i32, ConnectorStatus)> {
        notifications
            .iter()
            .filter_map(|n| match n {
                Notification::Status(sn) => Some((sn.evse_id, sn.connector_status)),
                _ => None,
            })
            .collect()
    }

    fn sample() -> MeterSample {
        MeterSample {
            energy_delta_kwh: 0.25,
            power_kw: 11.0,
            voltage_v: 230.0,
        }
    }

    fn started_id(outcome: StartOutcome) -> String {
        match outcome {
            StartOutcome::Accepted {
                transaction_id: Some(id),
            } => id,
            other => panic!("Expected accepted start, got {:?}", other),
        }
    }

    #[test]
    fn test_boot_reports_every_connector() {
        let station = Station::new(&StationConfig::default()).unwrap();
        assert!(!station.is_online());

        station.on_boot_accepted();
        let notifications = drain(&station);
        assert_eq!(
            statuses(&notifications),
            vec![(1, ConnectorStatus::Available), (2, ConnectorStatus::Available)]
        );
    }

    #[test]
    fn test_start_emits_in_transition_order() {
        let station = station();
        let id = started_id(station.start_transaction(Some(1), IdToken::central("T1"), Some(5)));

        assert_eq!(station.connector(1).unwrap().state, ConnectorState::Charging);

        let notifications = drain(&station);
        assert_eq!(notifications.len(), 3);
        assert_eq!(
            statuses(&notifications),
            vec![(1, ConnectorStatus::Occupied), (1, ConnectorStatus::Occupied)]
        );
        match &notifications[2] {
            Notification::Transaction(event) => {
                assert_eq!(event.event_type, TransactionEventType::Started);
                assert_eq!(event.seq_no, 0);
                assert_eq!(event.trigger_reason, TriggerReason::RemoteStart);
                assert_eq!(event.transaction_info.transaction_id, id);
                assert_eq!(event.transaction_info.remote_start_id, Some(5));
                assert_eq!(event.id_token, Some(IdToken::central("T1")));
            }
            other => panic!("Expected TransactionEvent, got {:?}", other),
        }
    }

    #[test]
    fn test_duplicate_start_rejected_without_change() {
        let station = station();
        started_id(station.start_transaction(Some(1), IdToken::central("T1"), None));
        drain(&station);

        let before = station.connector(1).unwrap();
        let outcome = station.start_transaction(Some(1), IdToken::central("T2"), None);

        assert_eq!(outcome, StartOutcome::rejected("ConnectorNotAvailable"));
        assert_eq!(station.connector(1).unwrap(), before);
        assert!(drain(&station).is_empty());
    }

    #[test]
    fn test_start_picks_first_available() {
        let station = station();
        started_id(station.start_transaction(None, IdToken::central("T1"), None));
        started_id(station.start_transaction(None, IdToken::central("T2"), None));

        assert_eq!(
            station.start_transaction(None, IdToken::central("T3"), None),
            StartOutcome::rejected("NoConnectorAvailable")
        );
        assert_eq!(
            station.start_transaction(Some(9), IdToken::central("T3"), None),
            StartOutcome::rejected("UnknownEvse")
        );
    }

    #[test]
    fn test_allow_list() {
        let config = StationConfig::default().with_authorized_tokens(["GOOD"]);
        let station = Station::new(&config).unwrap();
        station.on_boot_accepted();

        assert_eq!(
            station.start_transaction(Some(1), IdToken::central("BAD"), None),
            StartOutcome::rejected("InvalidToken")
        );
        assert!(station
            .start_transaction(Some(1), IdToken::central("GOOD"), None)
            .is_accepted());
    }

    #[test]
    fn test_stop_sequence_and_meter_values() {
        let station = station();
        let id = started_id(station.start_transaction(Some(1), IdToken::central("T1"), None));
        station.meter_tick(sample);
        station.meter_tick(sample);
        drain(&station);

        assert_eq!(
            station.stop_transaction(&id, StoppedReason::Remote, TriggerReason::RemoteStop),
            StopOutcome::Accepted
        );

        let notifications = drain(&station);
        assert_eq!(notifications.len(), 3);
        match &notifications[1] {
            Notification::Transaction(event) => {
                assert_eq!(event.event_type, TransactionEventType::Ended);
                assert_eq!(event.seq_no, 1);
                assert_eq!(event.transaction_info.stopped_reason, Some(StoppedReason::Remote));
            }
            other => panic!("Expected TransactionEvent, got {:?}", other),
        }
        assert_eq!(
            statuses(&notifications),
            vec![(1, ConnectorStatus::Occupied), (1, ConnectorStatus::Available)]
        );

        let tx = station.transaction(&id).unwrap();
        assert_eq!(tx.meter_start, 0.0);
        assert_eq!(tx.meter_stop, Some(0.5));
        assert_eq!(station.connector(1).unwrap().transaction_id, None);
    }

    #[test]
    fn test_stop_unknown_rejected() {
        let station = station();
        started_id(station.start_transaction(Some(1), IdToken::central("T1"), None));

        assert_eq!(
            station.stop_transaction("other", StoppedReason::Remote, TriggerReason::RemoteStop),
            StopOutcome::rejected("UnknownTransaction")
        );
        assert_eq!(station.connector(1).unwrap().state, ConnectorState::Charging);
    }

    #[test]
    fn test_acknowledged_end_is_archived() {
        let station = station();
        let id = started_id(station.start_local(2, IdToken::central("T1")));
        assert_eq!(station.stop_local(2), StopOutcome::Accepted);
        assert_eq!(station.stop_local(2), StopOutcome::rejected("NoTransaction"));

        for notification in drain(&station) {
            if let Notification::Transaction(event) = notification {
                station.acknowledge(&event);
            }
        }
        let archived = station.archived_transactions();
        assert_eq!(archived.len(), 1);
        assert_eq!(archived[0].id, id);
        assert_eq!(archived[0].stopped_reason, Some(StoppedReason::Local));
    }

    #[test]
    fn test_meter_tick_only_charging() {
        let station = station();
        assert!(station.meter_tick(sample).is_empty());

        started_id(station.start_transaction(Some(2), IdToken::central("T1"), None));
        let requests = station.meter_tick(sample);
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].evse_id, 2);

        let reading = &requests[0].meter_value[0];
        assert_eq!(reading.reading(ocpp_core::Measurand::EnergyActiveImportRegister), Some(0.25));
        assert_eq!(reading.reading(ocpp_core::Measurand::PowerActiveImport), Some(11.0));
        assert_eq!(station.connector(1).unwrap().energy_kwh, 0.0);
    }

    #[test]
    fn test_transaction_updates_sequence() {
        let mut config = StationConfig::default();
        config.metering.transaction_updates = true;
        let station = Station::new(&config).unwrap();
        station.on_boot_accepted();
        drain(&station);

        let id = started_id(station.start_transaction(Some(1), IdToken::central("T1"), None));
        station.meter_tick(sample);
        station.meter_tick(sample);
        station.stop_transaction(&id, StoppedReason::Local, TriggerReason::StopAuthorized);

        let seq: Vec<(TransactionEventType, u32)> = drain(&station)
            .into_iter()
            .filter_map(|n| match n {
                Notification::Transaction(e) => Some((e.event_type, e.seq_no)),
                _ => None,
            })
            .collect();
        assert_eq!(
            seq,
            vec![
                (TransactionEventType::Started, 0),
                (TransactionEventType::Updated, 1),
                (TransactionEventType::Updated, 2),
                (TransactionEventType::Ended, 3),
            ]
        );
    }

    #[test]
    fn test_change_availability() {
        let station = station();

        assert_eq!(
            station.change_availability(Some(1), OperationalStatus::Inoperative),
            AvailabilityOutcome::Accepted
        );
        assert_eq!(station.connector(1).unwrap().state, ConnectorState::Unavailable);
        assert_eq!(
            statuses(&drain(&station)),
            vec![(1, ConnectorStatus::Unavailable)]
        );

        // Unavailable connector refuses starts
        assert_eq!(
            station.start_transaction(Some(1), IdToken::central("T1"), None),
            StartOutcome::rejected("ConnectorNotAvailable")
        );

        station.change_availability(Some(1), OperationalStatus::Operative);
        assert_eq!(station.connector(1).unwrap().state, ConnectorState::Available);

        assert!(matches!(
            station.change_availability(Some(7), OperationalStatus::Operative),
            AvailabilityOutcome::Rejected { .. }
        ));
    }

    #[test]
    fn test_change_availability_scheduled_during_transaction() {
        let station = station();
        let id = started_id(station.start_transaction(Some(1), IdToken::central("T1"), None));

        assert_eq!(
            station.change_availability(None, OperationalStatus::Inoperative),
            AvailabilityOutcome::Scheduled
        );
        assert_eq!(station.connector(1).unwrap().state, ConnectorState::Charging);
        assert_eq!(station.connector(2).unwrap().state, ConnectorState::Unavailable);

        station.stop_transaction(&id, StoppedReason::Remote, TriggerReason::RemoteStop);
        assert_eq!(station.connector(1).unwrap().state, ConnectorState::Unavailable);
    }

    #[test]
    fn test_fault_ends_transaction() {
        let station = station();
        let id = started_id(station.start_transaction(Some(1), IdToken::central("T1"), None));

        assert!(station.report_fault(1));
        assert_eq!(station.connector(1).unwrap().state, ConnectorState::Faulted);
        assert_eq!(
            station.transaction(&id).unwrap().stopped_reason,
            Some(StoppedReason::Other)
        );

        assert!(station.clear_fault(1));
        assert_eq!(station.connector(1).unwrap().state, ConnectorState::Available);
        assert!(!station.report_fault(42));
    }

    #[test]
    fn test_disconnect_closes_and_queues_offline_end() {
        let station = station();
        let id = started_id(station.start_transaction(Some(1), IdToken::central("T1"), None));

        station.on_disconnected();
        assert!(!station.is_online());
        for connector in station.connectors() {
            assert_eq!(connector.state, ConnectorState::Unavailable);
            assert_eq!(connector.transaction_id, None);
        }

        // Started (undelivered) and Ended stay queued; statuses are dropped
        let queued = station.queued_notifications();
        assert!(queued.iter().all(|n| matches!(n, Notification::Transaction(_))));
        match queued.last() {
            Some(Notification::Transaction(event)) => {
                assert_eq!(event.event_type, TransactionEventType::Ended);
                assert!(event.offline);
                assert_eq!(event.transaction_info.transaction_id, id);
            }
            other => panic!("Expected offline Ended, got {:?}", other),
        }

        station.on_boot_accepted();
        let after = drain(&station);
        assert!(matches!(after[0], Notification::Transaction(_)));
        assert_eq!(
            statuses(&after),
            vec![(1, ConnectorStatus::Available), (2, ConnectorStatus::Available)]
        );
    }

    #[tokio::test]
    async fn test_wait_notification_wakes_on_push() {
        let station = std::sync::Arc::new(station());
        let waiter = {
            let station = station.clone();
            tokio::spawn(async move { station.wait_notification().await })
        };

        tokio::task::yield_now().await;
        station.change_availability(Some(2), OperationalStatus::Inoperative);

        let head = waiter.await.unwrap();
        match &head {
            Notification::Status(sn) => assert_eq!(sn.connector_status, ConnectorStatus::Unavailable),
            other => panic!("Expected StatusNotification, got {:?}", other),
        }

        // Still queued until delivery is confirmed
        assert_eq!(station.pending_notifications(), 1);
        assert!(station.complete_notification(&head));
        assert!(!station.complete_notification(&head));
        assert_eq!(station.pending_notifications(), 0);
    }
}
