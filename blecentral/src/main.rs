//! Command-line BLE central
//!
//! Drives the coordinator over the local adapter, either one command at a
//! time or as a newline-delimited JSON bridge on stdin/stdout.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use data_encoding::{HEXLOWER, HEXLOWER_PERMISSIVE};
use tokio::io::BufReader;

use blecentral_btleplug::BtleplugRadio;
use blecentral_core::config::default_config_path;
use blecentral_core::dispatch;
use blecentral_core::marshal::{catalogue_json, snapshot_json};
use blecentral_core::{Central, CentralConfig, CentralHandle, DeviceAddress, WriteMode};
use blecentral_proto::{Uuid, uuid_from_str, uuid_to_string};

type CliResult<T = ()> = Result<T, Box<dyn std::error::Error>>;

/// How long in-flight bridge requests get to finish once stdin closes
const BRIDGE_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Parser)]
#[command(name = "blecentral")]
#[command(about = "BLE central: scan, connect, read, write and subscribe")]
struct Cli {
    /// Config file (defaults to $BLECENTRAL_HOME/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Override the post-disconnect settling delay in milliseconds
    #[arg(long, global = true)]
    settle_ms: Option<u64>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Scan and print one JSON line per advertisement
    Scan {
        /// Scan duration in seconds
        #[arg(short, long, default_value = "5")]
        duration: u64,
        /// Only report devices advertising this service (repeatable)
        #[arg(short, long, value_parser = uuid_from_str)]
        service: Vec<Uuid>,
    },
    /// Connect, print the service catalogue and disconnect
    Inspect {
        #[arg(short, long)]
        device: String,
    },
    /// Write a value to a characteristic
    Write {
        #[arg(short, long)]
        device: String,
        #[arg(short, long, value_parser = uuid_from_str)]
        service: Uuid,
        #[arg(short, long, value_parser = uuid_from_str)]
        characteristic: Uuid,
        /// Value as hex, e.g. 0102ff
        #[arg(long)]
        hex: String,
        /// Use write-without-response
        #[arg(long)]
        no_response: bool,
    },
    /// Subscribe to a characteristic and print values until Ctrl-C
    Listen {
        #[arg(short, long)]
        device: String,
        #[arg(short, long, value_parser = uuid_from_str)]
        service: Uuid,
        #[arg(short, long, value_parser = uuid_from_str)]
        characteristic: Uuid,
    },
    /// Serve JSON requests from stdin, one per line
    Bridge,
}

#[tokio::main]
async fn main() -> CliResult {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let path = match cli.config {
        Some(path) => path,
        None => default_config_path()?,
    };
    let mut config = CentralConfig::load_or_create(&path)?;
    if let Some(ms) = cli.settle_ms {
        config.disconnect_settle_ms = ms;
    }

    let (radio, events) = BtleplugRadio::new(config.adapter_index).await?;
    let (coordinator, central) = Central::new(radio.clone(), events, config);
    let coordinator = tokio::spawn(coordinator.run());

    // The command owns the only handle, so the coordinator stops once it returns
    let outcome = run(cli.command, central).await;
    coordinator.await?;
    drop(radio);
    outcome
}

async fn run(command: Commands, central: CentralHandle) -> CliResult {
    match command {
        Commands::Scan { duration, service } => scan(&central, duration, service).await,
        Commands::Inspect { device } => inspect(&central, DeviceAddress::new(&device)).await,
        Commands::Write { device, service, characteristic, hex, no_response } => {
            let value = HEXLOWER_PERMISSIVE.decode(hex.as_bytes())?;
            let mode = if no_response { WriteMode::WithoutResponse } else { WriteMode::WithResponse };
            let address = DeviceAddress::new(&device);
            central.connect(address.clone()).await?;
            let written = central.write(address.clone(), service, characteristic, value, mode).await;
            central.disconnect(address).await?;
            written?;
            println!("ok");
            Ok(())
        }
        Commands::Listen { device, service, characteristic } => {
            listen(&central, DeviceAddress::new(&device), service, characteristic).await
        }
        Commands::Bridge => bridge(central).await,
    }
}

async fn scan(central: &CentralHandle, duration: u64, services: Vec<Uuid>) -> CliResult {
    log::info!("scanning for {} seconds", duration);
    let mut results = central.start_scan(services).await?;
    let deadline = tokio::time::sleep(Duration::from_secs(duration));
    tokio::pin!(deadline);

    loop {
        tokio::select! {
            _ = &mut deadline => break,
            snapshot = results.recv() => match snapshot {
                Some(snapshot) => println!("{}", snapshot_json(&snapshot)),
                None => break,
            },
        }
    }
    central.stop_scan().await?;
    Ok(())
}

async fn inspect(central: &CentralHandle, address: DeviceAddress) -> CliResult {
    let catalogue = central.connect(address.clone()).await?;
    println!("{}", serde_json::to_string_pretty(&catalogue_json(&catalogue))?);
    central.disconnect(address).await?;
    Ok(())
}

async fn listen(
    central: &CentralHandle,
    address: DeviceAddress,
    service: Uuid,
    characteristic: Uuid,
) -> CliResult {
    central.connect(address.clone()).await?;
    let mut notifications = central.subscribe(address.clone(), service, characteristic).await?;
    log::info!("listening on {} {}, Ctrl-C to stop", uuid_to_string(&service), uuid_to_string(&characteristic));

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            notification = notifications.recv() => match notification {
                Some(n) => println!("{} {}", uuid_to_string(&n.characteristic), HEXLOWER.encode(&n.value)),
                None => {
                    log::warn!("{} disconnected", address);
                    return Ok(());
                }
            },
        }
    }
    central.disconnect(address).await?;
    Ok(())
}

async fn bridge(central: CentralHandle) -> CliResult {
    let input = BufReader::new(tokio::io::stdin());
    dispatch::serve(central, input, tokio::io::stdout(), BRIDGE_DRAIN_TIMEOUT).await?;
    log::info!("bridge exiting");
    Ok(())
}
