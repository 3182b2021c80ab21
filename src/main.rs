// src/main.rs - rtc-sync command line entry point
use std::path::Path;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use rtc_shared::{DeviceChannel, TimeInterface, Timestamp, WireProtocol};
use rtc_sync::communication::SerialChannel;
use rtc_sync::config::{self, Config};
use rtc_sync::scheduler::StdTimeSync;
use rtc_sync::sync::{self, OffsetEstimator, SyncError, SyncSession, TimeBroadcaster};

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

const DEFAULT_CONFIG_PATH: &str = "rtc-sync.toml";

/// Synchronize a serial-attached RTC board to this host's clock.
#[derive(Parser, Debug)]
#[command(name = "rtc-sync", version, about)]
struct Cli {
    /// Path to a TOML config file (default: ./rtc-sync.toml when present)
    #[arg(short, long)]
    config: Option<String>,

    /// Serial port of the board (overrides the config file)
    #[arg(short, long)]
    port: Option<String>,

    /// Wire protocol version (overrides the config file)
    #[arg(long, value_enum)]
    protocol: Option<ProtocolArg>,

    /// Print results as JSON
    #[arg(long)]
    json: bool,

    /// More log output (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Only log errors
    #[arg(short, long, conflicts_with = "verbose")]
    quiet: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Seed, measure and correct until the offset is within tolerance
    Sync {
        #[arg(long)]
        tolerance: Option<f64>,
        #[arg(long)]
        trials: Option<usize>,
    },
    /// Only broadcast the host time to the board
    Seed,
    /// Only measure the offset (mean and standard deviation)
    Measure {
        #[arg(long)]
        trials: Option<usize>,
    },
    /// Read the board's clock with get_time
    GetTime,
    /// List serial ports
    ListPorts,
    /// Write a config file with every default filled in
    InitConfig {
        #[arg(default_value = DEFAULT_CONFIG_PATH)]
        path: String,
    },
}

#[derive(clap::ValueEnum, Clone, Copy, Debug)]
enum ProtocolArg {
    Micros,
    LegacyCentis,
}

impl From<ProtocolArg> for WireProtocol {
    fn from(arg: ProtocolArg) -> Self {
        match arg {
            ProtocolArg::Micros => WireProtocol::Micros,
            ProtocolArg::LegacyCentis => WireProtocol::LegacyCentis,
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), BoxError> {
    let cli = Cli::parse();

    let level = match (cli.quiet, cli.verbose) {
        (true, _) => tracing::Level::ERROR,
        (false, 0) => tracing::Level::INFO,
        (false, 1) => tracing::Level::DEBUG,
        (false, _) => tracing::Level::TRACE,
    };
    tracing_subscriber::fmt().with_max_level(level).with_writer(std::io::stderr).init();

    tracing::info!("Starting rtc-sync {}", env!("CARGO_PKG_VERSION"));

    let mut config = load(&cli)?;
    if let Some(port) = &cli.port {
        config.device.port = port.clone();
    }
    if let Some(protocol) = cli.protocol {
        config.device.protocol = protocol.into();
    }

    match cli.command {
        Commands::ListPorts => {
            for port in SerialChannel::available_ports() {
                println!("{}", port);
            }
            Ok(())
        }
        Commands::InitConfig { ref path } => {
            config.validate()?;
            config.save(path)?;
            tracing::info!("Wrote default configuration to {}", path);
            Ok(())
        }
        Commands::Sync { tolerance, trials } => {
            if let Some(tolerance) = tolerance {
                config.sync.tolerance_seconds = tolerance;
            }
            if let Some(trials) = trials {
                config.sync.trials_per_batch = trials;
            }
            config.validate()?;
            run_sync(&config, cli.json).await
        }
        Commands::Seed => {
            config.validate()?;
            let (mut channel, time) = connect(&config).await?;
            let broadcaster = TimeBroadcaster::from_config(&config.sync_config());
            let summary = broadcaster.broadcast(&mut channel, &time).await?;
            channel.close().await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&summary)?);
            } else {
                println!("sent {} seed message(s)", summary.messages_sent);
            }
            Ok(())
        }
        Commands::Measure { trials } => {
            if let Some(trials) = trials {
                config.sync.trials_per_batch = trials;
            }
            config.validate()?;
            let sync_config = config.sync_config();
            let (mut channel, time) = connect(&config).await?;
            let estimator = OffsetEstimator::from_config(&sync_config);
            let estimate = estimator.estimate(&mut channel, &time, sync_config.trials_per_batch).await?;
            channel.close().await?;
            if cli.json {
                println!("{}", serde_json::to_string_pretty(&estimate)?);
            } else {
                println!("Average offset in seconds: {:+.6}", estimate.mean);
                println!("Standard deviation: {:.6}", estimate.std_dev);
            }
            Ok(())
        }
        Commands::GetTime => {
            config.validate()?;
            let sync_config = config.sync_config();
            let (mut channel, time) = connect(&config).await?;
            let device = sync::query_device_time(&mut channel, sync_config.protocol, sync_config.read_timeout).await?;
            let host = Timestamp::from_system_time(time.now_wallclock(), Timestamp::MICROS);
            channel.close().await?;
            if cli.json {
                let value = serde_json::json!({
                    "device": device,
                    "device_rfc3339": rfc3339(&device),
                    "host_minus_device": host.seconds_since(&device),
                });
                println!("{}", serde_json::to_string_pretty(&value)?);
            } else {
                println!("RTC time:  {} ({})", rfc3339(&device), device);
                println!("host time: {} ({})", rfc3339(&host), host);
            }
            Ok(())
        }
    }
}

fn load(cli: &Cli) -> Result<Config, BoxError> {
    let path = match &cli.config {
        Some(path) => path.as_str(),
        None if Path::new(DEFAULT_CONFIG_PATH).exists() => DEFAULT_CONFIG_PATH,
        None => {
            tracing::info!("No configuration file; using defaults");
            return Ok(Config::default());
        }
    };
    tracing::info!("Loading configuration from: {}", path);
    // Flags may still fix an invalid value; every subcommand validates after applying them.
    config::read_config(path).map_err(|e| {
        tracing::error!("Failed to load config from '{}': {}", path, e);
        Box::new(e) as BoxError
    })
}

/// Writes share the read bound, so no wait on the port is unbounded.
fn open_channel(config: &Config) -> Result<SerialChannel, BoxError> {
    let channel = SerialChannel::open(&config.device.port, config.device.baud)?;
    Ok(channel.with_write_timeout(config.sync_config().read_timeout))
}

/// Open the port and wait out the board reset that opening triggers.
async fn connect(config: &Config) -> Result<(SerialChannel, StdTimeSync), BoxError> {
    let mut channel = open_channel(config)?;
    let time = StdTimeSync;
    let settle = config.sync_config().settle_delay;
    if !settle.is_zero() {
        tracing::info!("waiting {:?} for the device to settle", settle);
        time.sleep(settle).await;
    }
    channel.reset_input_buffer().await?;
    channel.reset_output_buffer().await?;
    tracing::debug!("connected to {}", channel.path());
    Ok((channel, time))
}

async fn run_sync(config: &Config, json: bool) -> Result<(), BoxError> {
    tracing::info!(
        "RTC: {} @ {} baud ({:?} protocol), tolerance {} s",
        config.device.port,
        config.device.baud,
        config.device.protocol,
        config.sync.tolerance_seconds
    );
    let channel = open_channel(config)?;
    let mut session = SyncSession::new(Box::new(channel), Arc::new(StdTimeSync), config.sync_config());

    let outcome = tokio::select! {
        outcome = session.run() => outcome,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Interrupted; closing the port");
            session.close().await?;
            return Err("interrupted".into());
        }
    };
    session.close().await?;

    match outcome {
        Ok(report) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "converged: offset {:+.6} s (std dev {:.6}) after {} correction round(s)",
                    report.offset.mean, report.offset.std_dev, report.correction_rounds
                );
            }
            Ok(())
        }
        Err(e) => {
            print_failure(&e, json)?;
            Err(Box::new(e))
        }
    }
}

fn print_failure(error: &SyncError, json: bool) -> Result<(), BoxError> {
    let (rounds, last) = match error {
        SyncError::ConvergenceFailed { rounds, last_estimate, .. } => (Some(*rounds), last_estimate.clone()),
        _ => (None, None),
    };
    if json {
        let value = serde_json::json!({
            "status": "failed",
            "kind": error.kind(),
            "message": error.to_string(),
            "correction_rounds": rounds,
            "last_estimate": last,
        });
        println!("{}", serde_json::to_string_pretty(&value)?);
    } else {
        match last {
            Some(estimate) => println!("failed ({}): last offset {:+.6} s", error.kind(), estimate.mean),
            None => println!("failed ({}): no offset measured", error.kind()),
        }
    }
    Ok(())
}

fn rfc3339(ts: &Timestamp) -> String {
    chrono::DateTime::<chrono::Utc>::from(ts.to_system_time()).to_rfc3339_opts(chrono::SecondsFormat::Micros, true)
}
