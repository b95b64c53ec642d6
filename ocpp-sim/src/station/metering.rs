//! Metering simulator
//!
//! Every tick advances the energy counter of each charging connector by a
//! pseudo-random amount and reports it with MeterValues. A connector that
//! stops charging is skipped from the next tick on.

use std::sync::Arc;

use ocpp_core::{CallFailure, Endpoint, MeterValuesRequest};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

use super::state::{MeterSample, Station};
use crate::config::MeteringConfig;

/// Grid voltage band for the simulated readings (V)
const VOLTAGE_MIN: f64 = 220.0;
const VOLTAGE_MAX: f64 = 240.0;

pub struct MeterSimulator {
    config: MeteringConfig,
    rng: Mutex<StdRng>,
}

impl MeterSimulator {
    pub fn new(config: MeteringConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        Self {
            config,
            rng: Mutex::new(rng),
        }
    }

    pub fn config(&self) -> &MeteringConfig {
        &self.config
    }

    /// Draw one sample from the configured ranges
    pub fn sample(&self) -> MeterSample {
        let mut rng = self.rng.lock();
        MeterSample {
            energy_delta_kwh: rng.gen_range(self.config.energy_min_kwh..=self.config.energy_max_kwh),
            power_kw: rng.gen_range(self.config.power_min_kw..=self.config.power_max_kw),
            voltage_v: rng.gen_range(VOLTAGE_MIN..=VOLTAGE_MAX),
        }
    }

    /// Advance the station by one tick
    pub fn tick(&self, station: &Station) -> Vec<MeterValuesRequest> {
        station.meter_tick(|| self.sample())
    }

    /// Tick until the connection goes away
    pub async fn run(self: Arc<Self>, station: Arc<Station>, endpoint: Arc<Endpoint>) {
        let period = self.config.tick_interval;
        let mut ticker = interval_at(Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;

            for request in self.tick(&station) {
                let evse_id = request.evse_id;
                match endpoint.call(&request).await {
                    Ok(_) => debug!(evse_id, "meter values delivered"),
                    Err(CallFailure::ConnectionLost) | Err(CallFailure::Send(_)) => return,
                    Err(e) => warn!(evse_id, "MeterValues failed: {}", e),
                }
            }
        }
    }
}
