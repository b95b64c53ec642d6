//! What the CSMS knows about each station

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ocpp_core::{
    ChargingStationInfo, ConnectorStatus, Measurand, MeterValue, TransactionEventRequest,
    TransactionEventType, TriggerReason,
};
use parking_lot::Mutex;
use serde::Serialize;

/// One received TransactionEvent
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionLogEntry {
    pub received_at: DateTime<Utc>,
    pub transaction_id: String,
    pub event_type: TransactionEventType,
    pub seq_no: u32,
    pub trigger_reason: TriggerReason,
    pub evse_id: Option<i32>,
    pub energy_kwh: Option<f64>,
    pub offline: bool,
}

impl TransactionLogEntry {
    pub fn from_event(event: &TransactionEventRequest) -> Self {
        Self {
            received_at: Utc::now(),
            transaction_id: event.transaction_info.transaction_id.clone(),
            event_type: event.event_type,
            seq_no: event.seq_no,
            trigger_reason: event.trigger_reason,
            evse_id: event.evse.as_ref().map(|evse| evse.id),
            energy_kwh: latest_reading(&event.meter_value, Measurand::EnergyActiveImportRegister),
            offline: event.offline,
        }
    }
}

/// One received MeterValues report
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MeterLogEntry {
    pub received_at: DateTime<Utc>,
    pub evse_id: i32,
    pub energy_kwh: Option<f64>,
    pub power_kw: Option<f64>,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StationRecord {
    pub station_id: String,
    pub info: Option<ChargingStationInfo>,
    pub booted_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    /// Last reported status per EVSE
    pub connectors: BTreeMap<i32, ConnectorStatus>,
    /// Running transactions and their EVSE
    pub active_transactions: BTreeMap<String, Option<i32>>,
    pub transaction_log: Vec<TransactionLogEntry>,
    pub meter_log: Vec<MeterLogEntry>,
}

impl StationRecord {
    fn new(station_id: &str) -> Self {
        Self {
            station_id: station_id.to_string(),
            ..Default::default()
        }
    }

    pub fn record_transaction_event(&mut self, event: &TransactionEventRequest) {
        let entry = TransactionLogEntry::from_event(event);
        match entry.event_type {
            TransactionEventType::Ended => {
                self.active_transactions.remove(&entry.transaction_id);
            }
            _ => {
                self.active_transactions
                    .insert(entry.transaction_id.clone(), entry.evse_id);
            }
        }
        self.transaction_log.push(entry);
    }

    /// Events logged for one transaction, in arrival order
    pub fn events_of(&self, transaction_id: &str) -> Vec<&TransactionLogEntry> {
        self.transaction_log
            .iter()
            .filter(|entry| entry.transaction_id == transaction_id)
            .collect()
    }
}

/// Latest value of a measurand across the meter values of one message
pub fn latest_reading(values: &[MeterValue], measurand: Measurand) -> Option<f64> {
    values.iter().rev().find_map(|value| value.reading(measurand))
}

/// Station records shared by every connection
#[derive(Debug, Clone, Default)]
pub struct Records {
    stations: Arc<Mutex<HashMap<String, StationRecord>>>,
}

impl Records {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mutate a station's record, creating it on first use
    pub fn update<R>(&self, station_id: &str, f: impl FnOnce(&mut StationRecord) -> R) -> R {
        let mut stations = self.stations.lock();
        let record = stations
            .entry(station_id.to_string())
            .or_insert_with(|| StationRecord::new(station_id));
        f(record)
    }

    pub fn get(&self, station_id: &str) -> Option<StationRecord> {
        self.stations.lock().get(station_id).cloned()
    }

    /// Known station ids, sorted
    pub fn station_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.stations.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.stations.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.stations.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ocpp_core::{ReadingContext, SampledValue, TransactionInfo, EVSE};

    fn event(kind: TransactionEventType, seq_no: u32, energy: f64) -> TransactionEventRequest {
        TransactionEventRequest {
            event_type: kind,
            timestamp: Utc::now(),
            trigger_reason: TriggerReason::Authorized,
            seq_no,
            transaction_info: TransactionInfo {
                transaction_id: "tx-1".to_string(),
                charging_state: None,
                time_spent_charging: None,
                stopped_reason: None,
                remote_start_id: None,
            },
            offline: false,
            evse: Some(EVSE {
                id: 2,
                connector_id: Some(1),
            }),
            id_token: None,
            meter_value: vec![MeterValue {
                timestamp: Utc::now(),
                sampled_value: vec![SampledValue::energy_kwh(energy, ReadingContext::SamplePeriodic)],
            }],
        }
    }

    #[test]
    fn test_update_creates_record() {
        let records = Records::new();
        assert!(records.is_empty());

        records.update("CP001", |r| r.last_heartbeat = Some(Utc::now()));
        records.update("CP002", |_| ());

        assert_eq!(records.station_ids(), vec!["CP001", "CP002"]);
        assert!(records.get("CP001").unwrap().last_heartbeat.is_some());
        assert!(records.get("CP003").is_none());
    }

    #[test]
    fn test_transaction_log_tracks_active() {
        let records = Records::new();

        records.update("CP001", |r| {
            r.record_transaction_event(&event(TransactionEventType::Started, 0, 0.0))
        });
        let record = records.get("CP001").unwrap();
        assert_eq!(record.active_transactions.get("tx-1"), Some(&Some(2)));

        records.update("CP001", |r| {
            r.record_transaction_event(&event(TransactionEventType::Ended, 1, 1.25))
        });
        let record = records.get("CP001").unwrap();
        assert!(record.active_transactions.is_empty());

        let events = record.events_of("tx-1");
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].energy_kwh, Some(1.25));
        assert_eq!(events[1].seq_no, 1);
    }
}
