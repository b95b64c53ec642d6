//! OCPP CSMS Node - CLI for the central system emulator
//!
//! Accepts station connections and lets an operator send remote commands
//! from stdin.

use std::io::{self, BufRead};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use ocpp_core::{EventKind, IdToken, Observer, OperationalStatus};
use ocpp_sim::{Csms, CsmsConfig};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

/// OCPP 2.0.1 central system emulator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Listen address
    #[arg(short, long, default_value = "0.0.0.0:9000")]
    bind: SocketAddr,

    /// Heartbeat interval handed to stations, in seconds
    #[arg(long, default_value = "300")]
    heartbeat_interval: u64,

    /// Response timeout in seconds
    #[arg(long, default_value = "30")]
    response_timeout: u64,

    /// Tokens accepted by Authorize (can be repeated); all tokens when omitted
    #[arg(long)]
    token: Vec<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,
}

/// Operator command read from stdin
#[derive(Debug)]
enum Command {
    Start {
        station: String,
        evse_id: Option<i32>,
        id_token: String,
    },
    Stop {
        station: String,
        transaction_id: String,
    },
    Availability {
        station: String,
        evse_id: Option<i32>,
        operative: bool,
    },
    List,
    Show(String),
}

fn parse_command(line: &str) -> Result<Command, String> {
    let parts: Vec<&str> = line.split_whitespace().collect();
    match parts.as_slice() {
        ["start", station, rest @ ..] => {
            let evse_id = match rest.first() {
                Some(evse) => Some(evse.parse::<i32>().map_err(|_| "invalid EVSE id")?),
                None => None,
            };
            Ok(Command::Start {
                station: station.to_string(),
                evse_id: evse_id.filter(|id| *id > 0),
                id_token: rest.get(1).unwrap_or(&"REMOTE").to_string(),
            })
        }
        ["stop", station, transaction_id] => Ok(Command::Stop {
            station: station.to_string(),
            transaction_id: transaction_id.to_string(),
        }),
        ["avail", station, evse, state] => {
            let evse_id = evse.parse::<i32>().map_err(|_| "invalid EVSE id")?;
            let operative = match *state {
                "on" => true,
                "off" => false,
                _ => return Err("state must be on or off".to_string()),
            };
            Ok(Command::Availability {
                station: station.to_string(),
                evse_id: Some(evse_id).filter(|id| *id > 0),
                operative,
            })
        }
        ["list"] => Ok(Command::List),
        ["show", station] => Ok(Command::Show(station.to_string())),
        _ => Err("unknown command".to_string()),
    }
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
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = CsmsConfig::new(args.bind)
        .with_heartbeat_interval(Duration::from_secs(args.heartbeat_interval))
        .with_response_timeout(Duration::from_secs(args.response_timeout));
    if !args.token.is_empty() {
        config = config.with_allowed_tokens(args.token.iter().cloned());
    }

    let csms = Arc::new(Csms::new(config)?);
    tokio::spawn(log_feed(csms.observer().clone()));

    let server = csms.clone();
    tokio::spawn(async move {
        if let Err(e) = server.serve().await {
            error!("CSMS server stopped: {}", e);
        }
    });

    // Spawn stdin handler for operator commands
    let (command_tx, mut command_rx) = mpsc::channel::<Command>(16);

    std::thread::spawn(move || {
        println!("\nCommands:");
        println!("  start <station> [evse] [token]      - RequestStartTransaction");
        println!("  stop <station> <transaction_id>     - RequestStopTransaction");
        println!("  avail <station> <evse|0> <on|off>   - ChangeAvailability");
        println!("  list                                - Connected stations");
        println!("  show <station>                      - Station record");
        println!("  quit                                - Exit\n");

        let stdin = io::stdin();
        for line in stdin.lock().lines().map_while(Result::ok) {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            if line == "quit" || line == "exit" {
                std::process::exit(0);
            }
            match parse_command(line) {
                Ok(command) => {
                    if command_tx.blocking_send(command).is_err() {
                        break;
                    }
                }
                Err(e) => println!("{}", e),
            }
        }
    });

    info!("CSMS emulator starting on ws://{}", args.bind);

    // Main event loop
    loop {
        tokio::select! {
            Some(command) = command_rx.recv() => {
                let csms = csms.clone();
                tokio::spawn(async move { execute(&csms, command).await });
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    Ok(())
}

async fn execute(csms: &Csms, command: Command) {
    match command {
        Command::Start {
            station,
            evse_id,
            id_token,
        } => match csms.station(&station) {
            Ok(handle) => match handle
                .request_start_transaction(evse_id, IdToken::central(id_token))
                .await
            {
                Ok(outcome) => println!("{}: {:?}", station, outcome),
                Err(e) => println!("{}: start failed: {}", station, e),
            },
            Err(e) => println!("{}", e),
        },
        Command::Stop {
            station,
            transaction_id,
        } => match csms.station(&station) {
            Ok(handle) => match handle.request_stop_transaction(transaction_id).await {
                Ok(outcome) => println!("{}: {:?}", station, outcome),
                Err(e) => println!("{}: stop failed: {}", station, e),
            },
            Err(e) => println!("{}", e),
        },
        Command::Availability {
            station,
            evse_id,
            operative,
        } => {
            let status = if operative {
                OperationalStatus::Operative
            } else {
                OperationalStatus::Inoperative
            };
            match csms.station(&station) {
                Ok(handle) => match handle.change_availability(evse_id, status).await {
                    Ok(outcome) => println!("{}: {:?}", station, outcome),
                    Err(e) => println!("{}: change availability failed: {}", station, e),
                },
                Err(e) => println!("{}", e),
            }
        }
        Command::List => {
            let connected = csms.connected_stations();
            if connected.is_empty() {
                println!("No stations connected");
            }
            for id in connected {
                let Some(record) = csms.records().get(&id) else {
                    println!("{}: (not booted)", id);
                    continue;
                };
                let connectors: Vec<String> = record
                    .connectors
                    .iter()
                    .map(|(evse, status)| format!("{}={:?}", evse, status))
                    .collect();
                println!("{}: [{}]", id, connectors.join(", "));
                for (transaction_id, evse) in &record.active_transactions {
                    println!("  transaction {} on EVSE {:?}", transaction_id, evse);
                }
            }
        }
        Command::Show(station) => match csms.records().get(&station) {
            Some(record) => match serde_json::to_string_pretty(&record) {
                Ok(json) => println!("{}", json),
                Err(e) => println!("{}: {}", station, e),
            },
            None => println!("{}: unknown station", station),
        },
    }
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
