//! # Inky Renderer Entry Point
//!
//! Runs one wake cycle of the picture frame on a host machine: load the
//! configuration and the saved wake state, fetch and draw an image, persist
//! the next wake decision and drain the log relay. With `--loop` the process
//! stays resident and sleeps until each decided wake time instead of exiting.
//!
//! ```text
//! inky-renderer [--config <path>] [--stdout] [--button | --power-on] [--loop]
//! ```

// Test modules
#[cfg(test)]
mod tests;

use anyhow::{bail, Context};
use chrono::Utc;
use inky_core::config::{Config, DEFAULT_CONFIG_PATH};
use inky_core::cycle::{CycleOutcome, PersistedState, SystemClock, WakeCycle, WakeReason};
use inky_core::relay::{FileSink, LogRelay, RelayLayer};
use inky_core::renderer::{ConsoleRenderer, FileRenderer, Renderer};
use inky_core::transport::SchemeTransport;
use std::path::PathBuf;
use std::time::Duration;
use std::{env, thread};
use tracing::level_filters::LevelFilter;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// Command line options.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Args {
    config: PathBuf,
    stdout: bool,
    reason: WakeReason,
    run_loop: bool,
}

impl Default for Args {
    fn default() -> Self {
        Self {
            config: PathBuf::from(DEFAULT_CONFIG_PATH),
            stdout: false,
            reason: WakeReason::Timer,
            run_loop: false,
        }
    }
}

fn parse_args<I: IntoIterator<Item = String>>(args: I) -> anyhow::Result<Args> {
    let mut parsed = Args::default();
    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--config" => {
                let path = args.next().context("--config needs a path")?;
                parsed.config = PathBuf::from(path);
            }
            "--stdout" => parsed.stdout = true,
            "--button" => parsed.reason = WakeReason::Button,
            "--power-on" => parsed.reason = WakeReason::PowerOn,
            "--loop" => parsed.run_loop = true,
            other => bail!("unknown argument {other:?}"),
        }
    }
    Ok(parsed)
}

fn init_tracing(level: &str, relay: RelayLayer) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_env("INKY_LOG").unwrap_or_else(|_| EnvFilter::new(level));
    let relay_level = level.parse::<LevelFilter>().unwrap_or(LevelFilter::INFO);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(std::io::stderr)
                .with_filter(filter),
        )
        .with(relay.with_filter(relay_level))
        .try_init()
        .map_err(|error| anyhow::anyhow!("failed to initialize tracing subscriber: {error}"))?;

    Ok(())
}

fn open_sink(config: &Config) -> FileSink {
    match &config.logging.relay_file {
        Some(path) => FileSink::open(path).unwrap_or_else(|e| {
            eprintln!("Warning: could not open relay file {}: {e}", path.display());
            FileSink::disconnected()
        }),
        None => FileSink::disconnected(),
    }
}

/// Time to sleep until `wake_epoch`, or `fallback` if it has already passed.
fn sleep_until(wake_epoch: i64, now_epoch: i64, fallback: Duration) -> Duration {
    match u64::try_from(wake_epoch - now_epoch) {
        Ok(secs) if secs > 0 => Duration::from_secs(secs),
        _ => fallback,
    }
}

fn run_cycle(
    config: &Config,
    state: PersistedState,
    reason: WakeReason,
    renderer: &mut dyn Renderer,
) -> CycleOutcome {
    let mut cycle = WakeCycle::new(config, SchemeTransport::default(), renderer, SystemClock);
    cycle.run(state, reason)
}

/// Main application entry point.
fn main() -> anyhow::Result<()> {
    let args = parse_args(env::args().skip(1))?;
    let (config, config_source) = Config::load_with_source(&args.config);

    let sink = open_sink(&config);
    let mut relay =
        LogRelay::new(config.logging.queue_capacity, sink).with_topic(config.logging.topic.clone());
    init_tracing(&config.logging.level, relay.layer())?;
    config_source.log(&args.config);
    info!(
        config = %args.config.display(),
        api = %config.masked_api(),
        "inky-renderer starting"
    );

    let mut renderer: Box<dyn Renderer> = if args.stdout {
        Box::new(ConsoleRenderer::stdout())
    } else {
        Box::new(FileRenderer::new(&config.output.dir))
    };

    let mut state = PersistedState::load(&config.state.path);
    let mut reason = args.reason;
    loop {
        let outcome = run_cycle(&config, state, reason, renderer.as_mut());
        if let Err(e) = outcome.state.save(&config.state.path) {
            warn!(path = %config.state.path.display(), error = %e, "could not save wake state");
        }

        let wait = sleep_until(outcome.decision.epoch, Utc::now().timestamp(), config.fallback_sleep());
        info!(seconds = wait.as_secs(), endpoint = %outcome.decision.endpoint, "going to sleep");
        if !relay.wait_for_drain(config.drain_timeout()) {
            warn!(pending = relay.pending(), "log relay did not drain before sleep");
        }

        if !args.run_loop {
            break;
        }
        thread::sleep(wait);
        state = outcome.state;
        reason = WakeReason::Timer;
    }

    Ok(())
}
