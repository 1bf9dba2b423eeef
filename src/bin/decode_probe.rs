//! Decode probe - checks badge prints against the scanner's decode pipeline
//!
//! Decodes each image with the chosen strategy's preprocessing, resolves the
//! payload against the participant directory and prints one JSON line per
//! image.
//!
//! Usage:
//!   decode-probe badge1.png badge2.jpg
//!   decode-probe --strategy detector --directory participants.json scans/*.png

use anyhow::Context;
use checkin_scanner::domain::directory::Directory;
use checkin_scanner::domain::types::Frame;
use checkin_scanner::infra::{Config, Metrics};
use checkin_scanner::io::load_directory;
use checkin_scanner::services::decode::{BarcodeDetector, RqrrDetector, SoftwareStrategy};
use checkin_scanner::services::ParticipantMatcher;
use clap::Parser;
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::warn;
use tracing_subscriber::fmt::time::UtcTime;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "decode-probe", version, about = "Decode badge images like the live scanner does")]
struct Args {
    /// Images to decode
    #[arg(required = true)]
    images: Vec<PathBuf>,

    /// Path to TOML configuration file (default: $CONFIG_FILE, then config/dev.toml)
    #[arg(short, long)]
    config: Option<String>,

    /// Participant directory JSON file; without it every payload is unmatched
    #[arg(short, long)]
    directory: Option<String>,

    /// Preprocessing to apply
    #[arg(long, default_value = "software", value_parser = ["software", "detector"])]
    strategy: String,
}

fn load_frame(path: &Path) -> anyhow::Result<Frame> {
    let image = image::open(path).with_context(|| format!("Failed to open image {}", path.display()))?;
    Frame::from_luma_image(0, image.into_luma8())
        .with_context(|| format!("Image {} is empty", path.display()))
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_timer(UtcTime::rfc_3339())
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();
    let config_path = args.config.clone().unwrap_or_else(|| Config::resolve_config_path(&[]));
    let config = Config::load_from_path(&config_path);
    let directory = match &args.directory {
        Some(path) => load_directory(path)?,
        None => Directory::default(),
    };
    let matcher = ParticipantMatcher::from_config(&config);

    let mut software = SoftwareStrategy::new(
        config.software_interval(),
        config.software_crop_ratio(),
        config.software_resolution(),
        Arc::new(Metrics::new()),
    );
    let detector = RqrrDetector::new();

    let mut decoded = 0usize;
    for path in &args.images {
        let frame = match load_frame(path) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %format!("{e:#}"), "image_skipped");
                continue;
            }
        };

        let started = std::time::Instant::now();
        let result = if args.strategy == "detector" {
            detector.detect(frame.clone()).await.map(|values| values.into_iter().next())
        } else {
            software.decode_frame(&frame)
        };
        let elapsed_us = started.elapsed().as_micros() as u64;

        let line = match result {
            Ok(Some(raw_value)) => {
                decoded += 1;
                let resolved = matcher.resolve(&raw_value, &directory);
                json!({
                    "file": path.display().to_string(),
                    "strategy": args.strategy,
                    "width": frame.width,
                    "height": frame.height,
                    "elapsedUs": elapsed_us,
                    "rawValue": raw_value,
                    "participantId": resolved.participant_id,
                    "matched": resolved.is_match(),
                    "name": resolved.record.as_ref().map(|r| r.name.clone()),
                })
            }
            Ok(None) => json!({
                "file": path.display().to_string(),
                "strategy": args.strategy,
                "elapsedUs": elapsed_us,
                "rawValue": null,
            }),
            Err(e) => json!({
                "file": path.display().to_string(),
                "strategy": args.strategy,
                "elapsedUs": elapsed_us,
                "rawValue": null,
                "error": e.to_string(),
            }),
        };
        println!("{line}");
    }

    if decoded == 0 {
        anyhow::bail!("no QR code decoded in {} image(s)", args.images.len());
    }
    Ok(())
}
