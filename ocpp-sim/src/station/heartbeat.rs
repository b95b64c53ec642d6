//! Heartbeat loop

use std::sync::Arc;
use std::time::Duration;

use ocpp_core::{CallFailure, Endpoint, HeartbeatRequest};
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, warn};

/// Heartbeat period after an accepted boot.
///
/// A positive `boot_interval` (seconds) wins when `adopt` is set.
pub fn heartbeat_period(configured: Duration, boot_interval: i32, adopt: bool) -> Duration {
    if adopt && boot_interval > 0 {
        Duration::from_secs(boot_interval as u64)
    } else {
        configured
    }
}

/// Send Heartbeat every `period` until the connection goes away
pub async fn run_heartbeat(endpoint: Arc<Endpoint>, period: Duration) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        ticker.tick().await;

        match endpoint.call(&HeartbeatRequest {}).await {
            Ok(response) => debug!(peer = %endpoint.peer_id(), "heartbeat, CSMS time {}", response.current_time),
            Err(CallFailure::ConnectionLost) | Err(CallFailure::Send(_)) => return,
            Err(e) => warn!(peer = %endpoint.peer_id(), "heartbeat failed: {}", e),
        }
    }
}
