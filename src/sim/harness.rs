//! CLI entry point for the simulation harness: run sync sessions against a simulated RTC
//! with chosen skew, link delay and misbehaviour, and report how they end.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use clap::{Parser, Subcommand};
use rtc_shared::WireProtocol;
use rtc_simulator::{SimClock, SimDeviceConfig, SimulatedRtc};
use rtc_sync::sync::{SyncConfig, SyncSession};

/// Simulation Harness CLI
#[derive(Parser, Debug)]
#[command(name = "sim-harness", about = "Run RTC sync sessions against a simulated board.")]
pub struct Cli {
    /// Path to an rtc-sync TOML config file (session parameters)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Path to a TOML file describing the simulated device
    #[arg(long)]
    device: Option<PathBuf>,

    /// Built-in scenario to start from
    #[arg(long, default_value = "skewed")]
    scenario: String,

    /// Device override (e.g. --param skew_seconds=-3.5)
    #[arg(long, value_parser = parse_key_val, number_of_values = 1)]
    param: Vec<(String, String)>,

    /// Convergence tolerance in seconds
    #[arg(long)]
    tolerance: Option<f64>,

    /// Trials per measurement batch
    #[arg(long)]
    trials: Option<usize>,

    /// Print the outcome as JSON
    #[arg(long)]
    json: bool,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List available built-in scenarios
    ListScenarios,
    /// Run one session (default)
    Run,
}

const SCENARIOS: &[(&str, &str)] = &[
    ("nominal", "device already in step, 1 ms links"),
    ("skewed", "device 2.5 s behind, 5 ms jittery links"),
    ("noisy", "debug chatter before every request marker"),
    ("flaky", "first pings unanswered, first replies truncated"),
    ("slow", "link slower than the read timeout"),
    ("legacy", "hundredth-second protocol, bare seed lines"),
    ("stubborn", "device ignores change_time and never seeds"),
    ("silent", "device never answers"),
];

fn scenario(name: &str) -> Option<SimDeviceConfig> {
    let base = SimDeviceConfig::default();
    let config = match name {
        "nominal" => base,
        "skewed" => SimDeviceConfig { skew_seconds: -2.5, latency_ms: 5.0, jitter_ms: 2.0, ..base },
        "noisy" => SimDeviceConfig {
            skew_seconds: 0.75,
            noise_lines: vec!["debug: ping received".to_string(), "Invalid command".to_string()],
            ..base
        },
        "flaky" => SimDeviceConfig { skew_seconds: 1.0, unanswered_pings: 2, malformed_replies: 1, ..base },
        "slow" => SimDeviceConfig { latency_ms: 1500.0, ..base },
        "legacy" => SimDeviceConfig { protocol: WireProtocol::LegacyCentis, skew_seconds: 4.0, ..base },
        "stubborn" => SimDeviceConfig { skew_seconds: 3.0, ignore_corrections: true, ..base },
        "silent" => SimDeviceConfig { silent: true, ..base },
        _ => return None,
    };
    Some(config)
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    match s.find('=') {
        Some(pos) => Ok((s[..pos].to_string(), s[pos + 1..].to_string())),
        None => Err(format!("Invalid KEY=VAL: no `=` found in '{}'.", s)),
    }
}

fn apply_param(device: &mut SimDeviceConfig, key: &str, val: &str) -> Result<(), String> {
    let float = |v: &str| v.parse::<f64>().map_err(|e| format!("{}: {}", key, e));
    let count = |v: &str| v.parse::<usize>().map_err(|e| format!("{}: {}", key, e));
    let flag = |v: &str| v.parse::<bool>().map_err(|e| format!("{}: {}", key, e));
    match key {
        "skew_seconds" => device.skew_seconds = float(val)?,
        "latency_ms" => device.latency_ms = float(val)?,
        "jitter_ms" => device.jitter_ms = float(val)?,
        "rng_seed" => device.rng_seed = val.parse::<u64>().map_err(|e| format!("{}: {}", key, e))?,
        "unanswered_pings" => device.unanswered_pings = count(val)?,
        "lost_ping_period" => device.lost_ping_period = count(val)?,
        "malformed_replies" => device.malformed_replies = count(val)?,
        "silent" => device.silent = flag(val)?,
        "ignore_corrections" => device.ignore_corrections = flag(val)?,
        "protocol" => {
            device.protocol = match val {
                "micros" => WireProtocol::Micros,
                "legacy-centis" => WireProtocol::LegacyCentis,
                other => return Err(format!("unknown protocol '{}'", other)),
            }
        }
        _ => return Err(format!("unknown device parameter '{}'", key)),
    }
    Ok(())
}

fn session_config(cli: &Cli, device: &SimDeviceConfig) -> Result<SyncConfig, String> {
    let mut config = match &cli.config {
        Some(path) => {
            let path = path.to_str().ok_or_else(|| "config path is not UTF-8".to_string())?;
            let mut file = rtc_sync::config::read_config(path).map_err(|e| e.to_string())?;
            if let Some(tolerance) = cli.tolerance {
                file.sync.tolerance_seconds = tolerance;
            }
            if let Some(trials) = cli.trials {
                file.sync.trials_per_batch = trials;
            }
            file.validate().map_err(|e| e.to_string())?;
            file.sync_config()
        }
        None => {
            let mut config = SyncConfig { settle_delay: Duration::ZERO, ..SyncConfig::default() };
            if let Some(tolerance) = cli.tolerance {
                config.tolerance = tolerance;
            }
            if let Some(trials) = cli.trials {
                config.trials_per_batch = trials.max(1);
            }
            config
        }
    };
    config.protocol = device.protocol;
    if cli.scenario == "stubborn" {
        // A seed would fix the skew the scenario is about.
        config.seed_duration = Duration::ZERO;
        config.max_correction_rounds = config.max_correction_rounds.min(3);
    }
    if cli.scenario == "silent" {
        config.read_timeout = config.read_timeout.min(Duration::from_millis(100));
    }
    Ok(config)
}

fn device_config(cli: &Cli) -> Result<SimDeviceConfig, String> {
    let mut device = match &cli.device {
        Some(path) => {
            let contents = std::fs::read_to_string(path).map_err(|e| format!("{}: {}", path.display(), e))?;
            toml::from_str(&contents).map_err(|e| format!("{}: {}", path.display(), e))?
        }
        None => scenario(&cli.scenario).ok_or_else(|| format!("unknown scenario '{}'", cli.scenario))?,
    };
    for (key, val) in &cli.param {
        apply_param(&mut device, key, val)?;
    }
    Ok(device)
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    tracing_subscriber::fmt().with_writer(std::io::stderr).init();

    if let Some(Commands::ListScenarios) = cli.command {
        for (name, about) in SCENARIOS {
            println!("{:<10} {}", name, about);
        }
        return;
    }

    let (device_config, config) = match device_config(&cli).and_then(|d| session_config(&cli, &d).map(|c| (d, c))) {
        Ok(pair) => pair,
        Err(e) => {
            eprintln!("Failed to set up simulation: {e}");
            std::process::exit(2);
        }
    };

    let clock = SimClock::new(SystemTime::now());
    let device = SimulatedRtc::new(device_config.clone(), clock.clone());
    let handle = device.handle();
    let mut session = SyncSession::new(Box::new(device), Arc::new(clock.clone()), config);
    tracing::info!("scenario '{}': initial device lead {:+.6} s", cli.scenario, device_config.skew_seconds);

    let outcome = session.run().await;
    let final_lead = handle.skew_seconds();
    let simulated = clock.current_time();

    match outcome {
        Ok(report) => {
            if cli.json {
                let value = serde_json::json!({
                    "status": "converged",
                    "report": report,
                    "final_device_lead": final_lead,
                    "simulated_seconds": simulated.as_secs_f64(),
                });
                println!("{}", serde_json::to_string_pretty(&value).unwrap_or_default());
            } else {
                println!(
                    "converged after {} round(s): measured {:+.6} s, true device lead {:+.6} s ({:.3} s simulated)",
                    report.correction_rounds,
                    report.offset.mean,
                    final_lead,
                    simulated.as_secs_f64()
                );
            }
        }
        Err(e) => {
            if cli.json {
                let value = serde_json::json!({
                    "status": "failed",
                    "kind": e.kind(),
                    "message": e.to_string(),
                    "final_device_lead": final_lead,
                    "simulated_seconds": simulated.as_secs_f64(),
                });
                println!("{}", serde_json::to_string_pretty(&value).unwrap_or_default());
            } else {
                println!("failed ({}): {}; true device lead {:+.6} s", e.kind(), e, final_lead);
            }
            std::process::exit(1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_every_listed_scenario_exists() {
        for (name, _) in SCENARIOS {
            assert!(scenario(name).is_some(), "missing scenario {}", name);
        }
        assert!(scenario("warp-drive").is_none());
    }

    #[test]
    fn test_param_overrides() {
        let mut device = SimDeviceConfig::default();
        apply_param(&mut device, "skew_seconds", "-3.5").unwrap();
        apply_param(&mut device, "protocol", "legacy-centis").unwrap();
        apply_param(&mut device, "silent", "true").unwrap();
        apply_param(&mut device, "lost_ping_period", "3").unwrap();
        assert_eq!(device.lost_ping_period, 3);
        assert_eq!(device.skew_seconds, -3.5);
        assert_eq!(device.protocol, WireProtocol::LegacyCentis);
        assert!(device.silent);
        assert!(apply_param(&mut device, "latency_ms", "fast").is_err());
        assert!(apply_param(&mut device, "colour", "blue").is_err());
        assert_eq!(parse_key_val("a=b=c").unwrap(), ("a".to_string(), "b=c".to_string()));
    }
}
