//! In-memory wiring of a station and a CSMS

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use ocpp_core::{Endpoint, Outbound, OutboundFrame};
use ocpp_sim::csms::CsmsHandle;
use ocpp_sim::station::session::dispatcher;
use ocpp_sim::{Csms, CsmsConfig, MeterSimulator, Station, StationConfig, StationSession};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

pub const STATION_ID: &str = "CP001";

/// One simulated connection between a station and a CSMS
pub struct Link {
    pub csms: Arc<Csms>,
    pub handle: CsmsHandle,
    pub station: Arc<Station>,
    pub endpoint: Arc<Endpoint>,
    pub config: Arc<StationConfig>,
    pub meter: Arc<MeterSimulator>,
    to_csms: mpsc::UnboundedSender<String>,
    station_muted: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

pub fn station_config() -> StationConfig {
    StationConfig::new(STATION_ID, "ws://localhost:9000")
        .with_seed(7)
        .with_response_timeout(Duration::from_secs(2))
}

pub fn csms() -> Arc<Csms> {
    Arc::new(Csms::new(CsmsConfig::default().with_response_timeout(Duration::from_secs(2))).unwrap())
}

/// Ack every frame and forward its text unless muted
fn pump(
    mut frames: mpsc::Receiver<OutboundFrame>,
    tx: mpsc::UnboundedSender<String>,
    muted: Arc<AtomicBool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(frame) = frames.recv().await {
            let text = frame.text.clone();
            frame.complete(Ok(()));
            if !muted.load(Ordering::SeqCst) {
                let _ = tx.send(text);
            }
        }
    })
}

fn deliver(mut rx: mpsc::UnboundedReceiver<String>, endpoint: Arc<Endpoint>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            endpoint.handle_frame(&text).await;
        }
    })
}

impl Link {
    pub fn new(csms: Arc<Csms>, config: StationConfig) -> Self {
        let station = Arc::new(Station::new(&config).unwrap());
        Self::connect(csms, station, config)
    }

    /// Connect an existing station, e.g. after a disconnect
    pub fn connect(csms: Arc<Csms>, station: Arc<Station>, config: StationConfig) -> Self {
        let (station_out, station_frames) = Outbound::channel(64);
        let (csms_out, csms_frames) = Outbound::channel(64);

        let endpoint = Arc::new(
            Endpoint::new(config.station_id.clone(), station_out, Arc::new(dispatcher(&station)))
                .with_response_timeout(config.response_timeout),
        );
        let handle = csms.attach(&config.station_id, csms_out);

        let (to_csms, csms_inbox) = mpsc::unbounded_channel();
        let (to_station, station_inbox) = mpsc::unbounded_channel();
        let station_muted = Arc::new(AtomicBool::new(false));

        let tasks = vec![
            pump(station_frames, to_csms.clone(), station_muted.clone()),
            pump(csms_frames, to_station, Arc::new(AtomicBool::new(false))),
            deliver(csms_inbox, handle.endpoint().clone()),
            deliver(station_inbox, endpoint.clone()),
        ];

        let meter = Arc::new(MeterSimulator::new(config.metering.clone()));
        Self {
            csms,
            handle,
            station,
            endpoint,
            config: Arc::new(config),
            meter,
            to_csms,
            station_muted,
            tasks,
        }
    }

    /// Run the station session (boot, notifier, heartbeat, metering)
    pub fn start_session(&mut self) {
        let session = StationSession::new(
            self.endpoint.clone(),
            self.station.clone(),
            self.meter.clone(),
            self.config.clone(),
        );
        self.tasks.push(tokio::spawn(async move {
            let _ = session.run().await;
        }));
    }

    /// Put raw text on the wire towards the CSMS
    pub fn inject_to_csms(&self, text: &str) {
        let _ = self.to_csms.send(text.to_string());
    }

    /// Drop everything the station sends
    pub fn mute_station(&self, muted: bool) {
        self.station_muted.store(muted, Ordering::SeqCst);
    }

    /// Tear the connection down on both sides
    pub fn disconnect(self) -> Arc<Station> {
        for task in &self.tasks {
            task.abort();
        }
        self.endpoint.shutdown();
        self.station.on_disconnected();
        self.csms.detach(&self.handle);
        self.station
    }
}

/// Poll until `condition` holds or two seconds pass
pub async fn eventually<F: Fn() -> bool>(condition: F) {
    let deadline = Instant::now() + Duration::from_secs(2);
    while !condition() {
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Wait until the station booted and reported all connectors
pub async fn booted(link: &Link) {
    let records = link.csms.records().clone();
    let count = link.config.connector_count as usize;
    eventually(|| {
        records
            .get(STATION_ID)
            .map_or(false, |r| r.booted_at.is_some() && r.connectors.len() == count)
    })
    .await;
    let station = link.station.clone();
    eventually(|| station.pending_notifications() == 0).await;
}
