//! Check-in scanner - live QR check-in from a camera feed
//!
//! Reads badges from the configured camera, resolves them against the
//! participant directory and prints every scan update as a JSON line on
//! stdout. Logs go to stderr.
//!
//! Module structure:
//! - `domain/` - Core types (Frame, ScanUpdate, Directory)
//! - `io/` - Camera backends, directory loading, update output
//! - `services/` - Decode pipeline, debouncer, matcher, scan session
//! - `infra/` - Config and metrics

use anyhow::Context;
use checkin_scanner::domain::types::ScanStatus;
use checkin_scanner::infra::{Config, Metrics, StrategyPreference};
use checkin_scanner::io::{camera_backend, load_directory, JsonlSink};
use checkin_scanner::services::Scanner;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

/// Live QR check-in scanner
#[derive(Parser, Debug)]
#[command(name = "checkin-scanner", version, about)]
struct Args {
    /// Path to TOML configuration file (default: $CONFIG_FILE, then config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Participant directory JSON file (overrides [directory] file)
    #[arg(short, long)]
    directory: Option<String>,

    /// Replay a directory of images instead of the configured camera
    #[arg(long)]
    replay: Option<String>,

    /// Check-in URL prefix stripped from badge payloads (overrides [matcher])
    #[arg(long)]
    checkin_base_url: Option<String>,

    /// Decode strategy override
    #[arg(long, value_parser = ["auto", "detector", "software"])]
    strategy: Option<String>,

    /// Treat each line on stdin as "next scan"
    #[arg(long)]
    next_scan_on_enter: bool,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

fn init_logging(json: bool) {
    // Default: INFO, use RUST_LOG=debug for per-detection visibility
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn apply_overrides(mut config: Config, args: &Args) -> Config {
    if let Some(dir) = &args.replay {
        config = config.with_replay_dir(dir.clone());
    }
    if let Some(file) = &args.directory {
        config = config.with_directory_file(file.clone());
    }
    if let Some(url) = &args.checkin_base_url {
        config = config.with_checkin_base_url(url.clone());
    }
    match args.strategy.as_deref() {
        Some("detector") => config.with_strategy(StrategyPreference::Detector),
        Some("software") => config.with_strategy(StrategyPreference::Software),
        Some(_) => config.with_strategy(StrategyPreference::Auto),
        None => config,
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(args.log_json);

    info!("checkin-scanner starting");

    let config_path = args.config.clone().unwrap_or_else(|| Config::resolve_config_path(&[]));
    let config = apply_overrides(Config::load_from_path(&config_path), &args);
    info!(
        config_file = %config.config_file(),
        camera_backend = ?config.camera_backend(),
        facing = %config.camera().facing.as_str(),
        strategy = ?config.strategy_preference(),
        tick_interval_ms = %config.tick_interval().as_millis(),
        found_cooldown_ms = %config.found_cooldown().as_millis(),
        miss_cooldown_ms = %config.miss_cooldown().as_millis(),
        checkin_base_url = ?config.checkin_base_url(),
        directory_file = %config.directory_file(),
        "config_loaded"
    );

    let directory = Arc::new(load_directory(config.directory_file())?);
    let backend = camera_backend(&config).context("Failed to select camera backend")?;
    let metrics = Arc::new(Metrics::new());

    // Periodic metrics report
    let metrics_clone = metrics.clone();
    let metrics_interval = config.metrics_interval_secs();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(metrics_interval));
        interval.tick().await;
        loop {
            interval.tick().await;
            metrics_clone.report().log();
        }
    });

    let (mut scanner, updates_rx) = Scanner::new(config, directory, backend, metrics.clone());
    let sink = tokio::task::spawn_blocking(move || JsonlSink::new(std::io::stdout()).run(updates_rx));

    let result = run(&mut scanner, args.next_scan_on_enter).await;

    scanner.stop().await;
    metrics.report().log();

    // Closing the update channel lets the sink drain and finish
    drop(scanner);
    if let Err(e) = sink.await {
        error!(error = %e, "update_sink_failed");
    }

    info!("checkin-scanner shutdown complete");
    result
}

/// Lines on stdin, read on a plain thread so a pending read never holds up shutdown
fn spawn_stdin_reader() -> mpsc::Receiver<()> {
    let (tx, rx) = mpsc::channel(4);
    std::thread::spawn(move || {
        for line in std::io::stdin().lines() {
            if line.is_err() || tx.blocking_send(()).is_err() {
                break;
            }
        }
    });
    rx
}

/// Scan until Ctrl+C or a camera failure
async fn run(scanner: &mut Scanner, next_scan_on_enter: bool) -> anyhow::Result<()> {
    let session_id = scanner.start().await.context("Failed to start scanning")?;
    info!(session_id = %session_id, next_scan_on_enter, "scanning");

    let mut status_rx = scanner.subscribe();
    let mut enter_rx = if next_scan_on_enter { Some(spawn_stdin_reader()) } else { None };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown_signal_received");
                return Ok(());
            }
            line = recv_line(&mut enter_rx), if enter_rx.is_some() => match line {
                Some(()) => scanner.next_scan().await,
                None => {
                    warn!("stdin_closed_next_scan_disabled");
                    enter_rx = None;
                }
            },
            changed = status_rx.changed() => {
                if changed.is_err() {
                    return Ok(());
                }
                if *status_rx.borrow_and_update() == ScanStatus::Error {
                    anyhow::bail!("camera failed while scanning");
                }
            }
        }
    }
}

async fn recv_line(enter_rx: &mut Option<mpsc::Receiver<()>>) -> Option<()> {
    match enter_rx {
        Some(rx) => rx.recv().await,
        None => None,
    }
}
