//! Transaction bookkeeping
//!
//! A transaction is active from its authorized start until it is closed,
//! then waits for the CSMS to acknowledge its `Ended` event before it is
//! archived.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use ocpp_core::{IdToken, StoppedReason};
use serde::Serialize;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransactionPhase {
    Started,
    Updated,
    Ended,
}

#[derive(Debug, Clone, Serialize)]
pub struct Transaction {
    pub id: String,
    pub connector_id: i32,
    pub id_token: IdToken,
    pub started_at: DateTime<Utc>,
    pub meter_start: f64,
    pub stopped_at: Option<DateTime<Utc>>,
    pub meter_stop: Option<f64>,
    pub phase: TransactionPhase,
    pub remote_start_id: Option<i32>,
    pub stopped_reason: Option<StoppedReason>,
    seq_no: u32,
}

impl Transaction {
    /// Sequence number for the next TransactionEvent
    pub(crate) fn next_seq_no(&mut self) -> u32 {
        let seq_no = self.seq_no;
        self.seq_no += 1;
        seq_no
    }

    /// Number of TransactionEvents issued so far
    pub fn events_issued(&self) -> u32 {
        self.seq_no
    }

    /// Energy delivered, once stopped
    pub fn energy_kwh(&self) -> Option<f64> {
        self.meter_stop.map(|stop| stop - self.meter_start)
    }

    pub fn is_active(&self) -> bool {
        self.phase != TransactionPhase::Ended
    }
}

/// Active, closing and archived transactions of one station
#[derive(Debug, Default)]
pub struct TransactionManager {
    active: HashMap<String, Transaction>,
    closing: HashMap<String, Transaction>,
    archive: Vec<Transaction>,
}

impl TransactionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a transaction and return its id
    pub fn open(
        &mut self,
        connector_id: i32,
        id_token: IdToken,
        meter_start: f64,
        remote_start_id: Option<i32>,
    ) -> String {
        let mut id = Uuid::new_v4().to_string();
        while self.active.contains_key(&id) || self.closing.contains_key(&id) {
            id = Uuid::new_v4().to_string();
        }

        self.active.insert(
            id.clone(),
            Transaction {
                id: id.clone(),
                connector_id,
                id_token,
                started_at: Utc::now(),
                meter_start,
                stopped_at: None,
                meter_stop: None,
                phase: TransactionPhase::Started,
                remote_start_id,
                stopped_reason: None,
                seq_no: 0,
            },
        );
        id
    }

    pub fn active(&self, id: &str) -> Option<&Transaction> {
        self.active.get(id)
    }

    pub(crate) fn active_mut(&mut self, id: &str) -> Option<&mut Transaction> {
        self.active.get_mut(id)
    }

    /// Active transaction on a connector
    pub fn on_connector(&self, connector_id: i32) -> Option<&Transaction> {
        self.active.values().find(|tx| tx.connector_id == connector_id)
    }

    /// Mark an update and return the transaction for event building
    pub(crate) fn record_update(&mut self, id: &str) -> Option<&mut Transaction> {
        let tx = self.active.get_mut(id)?;
        tx.phase = TransactionPhase::Updated;
        Some(tx)
    }

    /// Close an active transaction; it waits for acknowledgement
    pub(crate) fn close(
        &mut self,
        id: &str,
        meter_stop: f64,
        reason: StoppedReason,
    ) -> Option<&mut Transaction> {
        let mut tx = self.active.remove(id)?;
        tx.stopped_at = Some(Utc::now());
        tx.meter_stop = Some(meter_stop);
        tx.stopped_reason = Some(reason);
        tx.phase = TransactionPhase::Ended;

        let id = tx.id.clone();
        Some(self.closing.entry(id).or_insert(tx))
    }

    /// CSMS acknowledged the `Ended` event
    pub fn acknowledge_end(&mut self, id: &str) -> bool {
        match self.closing.remove(id) {
            Some(tx) => {
                self.archive.push(tx);
                true
            }
            None => false,
        }
    }

    /// Look up a transaction in any phase
    pub fn find(&self, id: &str) -> Option<&Transaction> {
        self.active
            .get(id)
            .or_else(|| self.closing.get(id))
            .or_else(|| self.archive.iter().find(|tx| tx.id == id))
    }

    pub fn active_ids(&self) -> Vec<String> {
        self.active.keys().cloned().collect()
    }

    pub fn archived(&self) -> &[Transaction] {
        &self.archive
    }

    pub fn closing_count(&self) -> usize {
        self.closing.len()
    }
}
