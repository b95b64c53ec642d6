//! Station id to live connection

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use super::session::CsmsHandle;

#[derive(Clone, Default)]
pub struct Registry {
    sessions: Arc<Mutex<HashMap<String, CsmsHandle>>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection; a previous one for the same station is returned
    pub fn insert(&self, handle: CsmsHandle) -> Option<CsmsHandle> {
        let previous = self
            .sessions
            .lock()
            .insert(handle.station_id().to_string(), handle);
        if let Some(old) = &previous {
            warn!(station = %old.station_id(), "station reconnected, replacing previous session");
        }
        previous
    }

    /// Remove a connection, unless it was already replaced by a newer one
    pub fn remove(&self, handle: &CsmsHandle) -> bool {
        let mut sessions = self.sessions.lock();
        match sessions.get(handle.station_id()) {
            Some(current) if current.session_id() == handle.session_id() => {
                sessions.remove(handle.station_id());
                true
            }
            _ => false,
        }
    }

    pub fn get(&self, station_id: &str) -> Option<CsmsHandle> {
        self.sessions.lock().get(station_id).cloned()
    }

    /// Connected station ids, sorted
    pub fn station_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.sessions.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.lock().is_empty()
    }
}
