//! Sequencer daemon entry point.
//!
//! Loads a session configuration, runs one sequencer session with signal
//! handling, and prints the run report.

mod diagnostics;
mod signals;

use anyhow::{Context, Result};
use clap::Parser;
use seq_common::config::SequencerConfig;
use seq_runtime::{ChannelSink, SequencerRuntime};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::diagnostics::{format_report_json, format_report_text, log_report};
use crate::signals::SignalHandler;

/// Sequencer daemon command-line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "seq-daemon",
    about = "Multi-rate real-time sequencer - releases periodic services from a single timer",
    version,
    long_about = None
)]
struct Args {
    /// Path to a sequencer configuration file (TOML).
    #[arg(long, short = 'c', value_name = "FILE")]
    config: Option<PathBuf>,

    /// Run length in base ticks (overrides config file).
    #[arg(long, value_name = "N")]
    cycles: Option<u64>,

    /// Base tick interval, e.g. "10ms" (overrides config file).
    #[arg(long, value_name = "DURATION", value_parser = humantime::parse_duration)]
    tick: Option<Duration>,

    /// Wall-clock limit after which the run is aborted, e.g. "5s".
    #[arg(long, value_name = "DURATION", value_parser = humantime::parse_duration)]
    max_runtime: Option<Duration>,

    /// Apply SCHED_FIFO priorities and CPU affinity (requires privileges).
    #[arg(long, conflicts_with = "no_realtime")]
    realtime: bool,

    /// Compute the plan but do not apply it (overrides the config file).
    #[arg(long)]
    no_realtime: bool,

    /// Print the run report as JSON instead of text.
    #[arg(long)]
    report_json: bool,

    /// Log level (trace, debug, info, warn, error).
    #[arg(long, short = 'l', default_value = "info")]
    log_level: String,
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level);

    info!(version = env!("CARGO_PKG_VERSION"), "Starting sequencer daemon");

    let mut config = load_config(&args)?;
    apply_overrides(&mut config, &args);

    info!(
        tick = ?config.tick_interval,
        divisors = ?config.divisors(),
        realtime = config.realtime.enabled,
        "Configuration loaded"
    );

    run_session(config, args.report_json)
}

/// Initialize logging with the specified log level.
fn init_logging(level: &str) {
    let filter = format!(
        "seq_daemon={level},seq_runtime={level},seq_common={level},seq::events={level}"
    );

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&filter)),
        )
        .with_target(true)
        .with_thread_ids(true)
        .init();
}

/// Load configuration from file or use defaults.
///
/// Resolution priority (first existing file wins):
/// 1. Command-line `--config` argument
/// 2. `SEQ_CONFIG_PATH` environment variable
/// 3. `/etc/rt-sequencer/config.toml` (system path)
/// 4. `config/default.toml` (local development)
/// 5. Built-in defaults
fn load_config(args: &Args) -> Result<SequencerConfig> {
    if let Some(config_path) = &args.config {
        info!(?config_path, "Loading config from command-line argument");
        return SequencerConfig::from_file(config_path)
            .with_context(|| format!("Failed to load config from {config_path:?}"));
    }

    if let Ok(env_path) = std::env::var("SEQ_CONFIG_PATH") {
        let config_path = PathBuf::from(&env_path);
        if config_path.exists() {
            info!(?config_path, "Loading config from SEQ_CONFIG_PATH");
            return SequencerConfig::from_file(&config_path).with_context(|| {
                format!("Failed to load config from SEQ_CONFIG_PATH={env_path:?}")
            });
        }
        warn!(
            path = %env_path,
            "SEQ_CONFIG_PATH set but file does not exist, checking other locations"
        );
    }

    for path in ["/etc/rt-sequencer/config.toml", "config/default.toml"] {
        let config_path = PathBuf::from(path);
        if config_path.exists() {
            info!(?config_path, "Loading config file");
            return SequencerConfig::from_file(&config_path)
                .with_context(|| format!("Failed to load config from {config_path:?}"));
        }
    }

    info!("No config file found, using built-in defaults");
    Ok(SequencerConfig::default())
}

/// Apply command-line overrides on top of the loaded configuration.
fn apply_overrides(config: &mut SequencerConfig, args: &Args) {
    if let Some(cycles) = args.cycles {
        config.total_cycles = Some(cycles);
    }
    if let Some(tick) = args.tick {
        config.tick_interval = tick;
    }
    if let Some(limit) = args.max_runtime {
        config.max_runtime = Some(limit);
    }
    if args.realtime {
        config.realtime.enabled = true;
    }
    if args.no_realtime {
        config.realtime.enabled = false;
    }
}

/// Run one session and print its report.
fn run_session(config: SequencerConfig, report_json: bool) -> Result<()> {
    let (sink, drain) =
        ChannelSink::spawn(config.sink.capacity).context("Failed to start event sink")?;
    let runtime = SequencerRuntime::new(config, Arc::new(sink));

    let signal_handler = SignalHandler::install(runtime.abort_handle())
        .context("Failed to set up signal handlers")?;

    let outcome = runtime.run();
    let signals = signal_handler.signal_count();
    signal_handler.shutdown();
    let drained = drain.finish();

    let report = match outcome {
        Ok(report) => report,
        Err(e) => {
            error!(startup = e.is_startup_fatal(), "Sequencer run failed: {e}");
            return Err(e).context("Sequencer run failed");
        }
    };

    log_report(&report);
    if report_json {
        println!(
            "{}",
            format_report_json(&report).context("Failed to serialize run report")?
        );
    } else {
        print!("{}", format_report_text(&report));
    }

    let emitted: u64 = report.services.iter().map(|s| s.events).sum();
    if drained.total != emitted {
        warn!(emitted, logged = drained.total, "Event log count mismatch");
    }
    info!(
        cycles = report.cycles,
        cause = ?report.cause,
        events = drained.total,
        signals,
        "Daemon shutdown complete"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_args_parsing() {
        let args = Args::parse_from(["seq-daemon", "--no-realtime", "--cycles", "30"]);
        assert!(args.no_realtime);
        assert!(!args.realtime);
        assert_eq!(args.cycles, Some(30));
        assert!(args.config.is_none());
    }

    #[test]
    fn test_args_with_config_and_durations() {
        let args = Args::parse_from([
            "seq-daemon",
            "-c",
            "session.toml",
            "--tick",
            "5ms",
            "--max-runtime",
            "2s",
            "--report-json",
        ]);
        assert_eq!(args.config, Some(PathBuf::from("session.toml")));
        assert_eq!(args.tick, Some(Duration::from_millis(5)));
        assert_eq!(args.max_runtime, Some(Duration::from_secs(2)));
        assert!(args.report_json);
    }

    #[test]
    fn test_realtime_flags_conflict() {
        let result = Args::try_parse_from(["seq-daemon", "--realtime", "--no-realtime"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_overrides_applied() {
        let args = Args::parse_from(["seq-daemon", "--cycles", "60", "--realtime"]);
        let mut config = SequencerConfig::default();
        apply_overrides(&mut config, &args);
        assert_eq!(config.total_cycles, Some(60));
        assert!(config.realtime.enabled);
        assert_eq!(config.tick_interval, Duration::from_millis(10));
    }

    #[test]
    fn test_run_session_without_realtime() {
        let _guard = crate::signals::SIGNAL_LOCK
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let config = SequencerConfig {
            tick_interval: Duration::from_millis(1),
            ..SequencerConfig::default()
        };
        run_session(config, true).unwrap();
    }
}
