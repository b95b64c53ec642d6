//! OCPP Station Node - CLI for the charging station emulator
//!
//! # Usage
//!
//! ```bash
//! # Connect CP001 with two connectors to a local CSMS
//! ocpp-station-node --station CP001 --csms-url ws://localhost:9000
//!
//! # Scripted session: charge on connector 1 for 60 s
//! ocpp-station-node --station CP001 --auto-start 1 --auto-stop-after 60
//! ```

use std::time::Duration;

use clap::Parser;
use ocpp_core::{Backoff, EventKind, IdToken, Observer};
use ocpp_sim::{MeteringConfig, StationClient, StationConfig};
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// OCPP 2.0.1 charging station emulator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Station identity (last path segment of the CSMS URL)
    #[arg(short, long, default_value = "CP001")]
    station: String,

    /// CSMS WebSocket URL
    #[arg(long, default_value = "ws://localhost:9000")]
    csms_url: String,

    /// Number of connectors
    #[arg(short, long, default_value = "2")]
    connectors: u32,

    /// Heartbeat interval in seconds, used unless the CSMS sends one
    #[arg(long, default_value = "60")]
    heartbeat_interval: u64,

    /// Ignore the interval from the BootNotification reply
    #[arg(long)]
    fixed_heartbeat: bool,

    /// Metering tick in seconds
    #[arg(long, default_value = "5")]
    meter_interval: u64,

    /// Also send TransactionEvent(Updated) on each metering tick
    #[arg(long)]
    transaction_updates: bool,

    /// Seed for reproducible meter readings
    #[arg(long)]
    seed: Option<u64>,

    /// Send attempts per frame
    #[arg(long, default_value = "3")]
    max_retries: u32,

    /// Response timeout in seconds
    #[arg(long, default_value = "30")]
    response_timeout: u64,

    /// Tokens accepted for starts (can be repeated); all tokens when omitted
    #[arg(long)]
    token: Vec<String>,

    /// Vendor name
    #[arg(long, default_value = "OCPP Simulator")]
    vendor: String,

    /// Model name
    #[arg(long, default_value = "Charging Station Simulator")]
    model: String,

    /// Start a transaction on this connector once booted
    #[arg(long)]
    auto_start: Option<i32>,

    /// Token presented for --auto-start
    #[arg(long, default_value = "SIMTOKEN")]
    id_token: String,

    /// Stop the --auto-start transaction after this many seconds
    #[arg(long)]
    auto_stop_after: Option<u64>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Setup logging
    let level = match args.log_level.as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .with_thread_ids(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    // Print banner
    println!();
    println!("╔══════════════════════════════════════════════════════════════╗");
    println!("║            OCPP 2.0.1 Station - Charging Station             ║");
    println!("╠══════════════════════════════════════════════════════════════╣");
    println!("║  Station:    {:<48} ║", args.station);
    println!("║  CSMS URL:   {:<48} ║", truncate(&args.csms_url, 48));
    println!("║  Connectors: {:<48} ║", args.connectors);
    println!("╚══════════════════════════════════════════════════════════════╝");
    println!();

    // Build configuration
    let mut config = StationConfig::new(&args.station, &args.csms_url)
        .with_vendor(&args.vendor, &args.model)
        .with_connector_count(args.connectors)
        .with_heartbeat_interval(Duration::from_secs(args.heartbeat_interval))
        .with_metering(MeteringConfig {
            tick_interval: Duration::from_secs(args.meter_interval),
            seed: args.seed,
            transaction_updates: args.transaction_updates,
            ..Default::default()
        })
        .with_retry(args.max_retries, Backoff::Fixed(Duration::from_secs(1)))
        .with_response_timeout(Duration::from_secs(args.response_timeout));

    if args.fixed_heartbeat {
        config = config.with_fixed_heartbeat();
    }
    if !args.token.is_empty() {
        config = config.with_authorized_tokens(args.token.iter().cloned());
    }

    let client = StationClient::new(config)?;
    tokio::spawn(log_feed(client.observer().clone()));

    if let Some(connector_id) = args.auto_start {
        let handle = client.handle();
        let id_token = IdToken::central(args.id_token.clone());
        let stop_after = args.auto_stop_after.map(Duration::from_secs);

        tokio::spawn(async move {
            while !handle.station().is_online() {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }

            let outcome = handle.start_local(connector_id, id_token).await;
            info!("auto-start on connector {}: {:?}", connector_id, outcome);

            if let (true, Some(delay)) = (outcome.is_accepted(), stop_after) {
                tokio::time::sleep(delay).await;
                let outcome = handle.stop_local(connector_id);
                info!("auto-stop on connector {}: {:?}", connector_id, outcome);
            }
        });
    }

    info!("Starting charging station emulator...");

    tokio::select! {
        result = client.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            for connector in client.station().connectors() {
                if let Some(transaction_id) = connector.transaction_id {
                    warn!("transaction {} on connector {} left open", transaction_id, connector.id);
                }
            }
        }
    }

    Ok(())
}

/// Log the monitoring feed at debug level
async fn log_feed(observer: Observer) {
    let mut feed = observer.subscribe();
    loop {
        let event = match feed.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(skipped)) => {
                warn!("monitor fell behind, {} events skipped", skipped);
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        match &event.kind {
            EventKind::Frame { .. } => match serde_json::to_string(&event) {
                Ok(line) => debug!("{}", line),
                Err(e) => warn!("unprintable event: {}", e),
            },
            EventKind::Connected => info!("{} connected", event.peer_id),
            EventKind::Disconnected => info!("{} disconnected", event.peer_id),
        }
    }
}

/// Truncate string with ellipsis
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        return s.to_string();
    }
    let keep = max_len.saturating_sub(3);
    let end = s.char_indices().nth(keep).map_or(s.len(), |(i, _)| i);
    format!("{}...", &s[..end])
}
