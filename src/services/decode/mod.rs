//! Decode pipeline - turns video frames into text payloads
//!
//! Two interchangeable strategies sit behind `DecodeStrategy`:
//! - `detector` - fire-and-forget detection over the full frame, results come
//!   back on a channel tagged with the session and debouncer epoch
//! - `software` - throttled, synchronous decode of a downscaled center crop
//!
//! The strategy is chosen once per session from `Capabilities`.

pub mod detector;
pub mod qr;
pub mod software;

pub use detector::{BarcodeDetector, DetectorStrategy, RqrrDetector};
pub use software::SoftwareStrategy;

use crate::domain::types::{DecodedPayload, Frame, SessionId};
use crate::infra::config::{Config, StrategyPreference};
use crate::infra::metrics::Metrics;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{info, warn};

/// Decode failures are never surfaced to the operator
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    #[error("transient decode failure: {0}")]
    Transient(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StrategyKind {
    Detector,
    Software,
}

impl StrategyKind {
    pub fn as_str(&self) -> &str {
        match self {
            StrategyKind::Detector => "detector",
            StrategyKind::Software => "software",
        }
    }
}

/// Identifies which session and debouncer epoch a detection was started under
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DetectionTag {
    pub session: SessionId,
    pub epoch: u64,
}

/// Completed asynchronous detection
#[derive(Debug, Clone)]
pub struct TaggedDetection {
    pub tag: DetectionTag,
    pub payload: DecodedPayload,
}

/// What a strategy did with one tick
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    /// Synchronous decode produced a payload
    Decoded(DecodedPayload),
    /// Attempted, nothing readable in the frame
    NoCode,
    /// Too soon since the last attempt
    Throttled,
    /// Detection started; any result arrives on the detection channel
    Dispatched,
    /// Too many detections already running, tick skipped
    Saturated,
}

pub trait DecodeStrategy: Send {
    fn kind(&self) -> StrategyKind;

    /// Handle one tick's frame. Must not block on the detector.
    fn on_tick(&mut self, frame: &Frame, now: Instant, tag: DetectionTag) -> TickOutcome;
}

/// One-time probe of what the host can run
#[derive(Clone)]
pub struct Capabilities {
    detector: Option<Arc<dyn BarcodeDetector>>,
    runtime: bool,
    hardware_threads: usize,
}

impl Capabilities {
    pub fn probe(detector: Option<Arc<dyn BarcodeDetector>>) -> Self {
        Self {
            detector,
            runtime: tokio::runtime::Handle::try_current().is_ok(),
            hardware_threads: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
        }
    }

    pub fn hardware_threads(&self) -> usize {
        self.hardware_threads
    }

    /// Detector registered and a runtime to run it on
    pub fn detector_usable(&self) -> bool {
        self.detector.is_some() && self.runtime
    }

    /// Detector worth picking automatically: usable, with a spare core for it
    pub fn detector_available(&self) -> bool {
        self.detector_usable() && self.hardware_threads >= 2
    }
}

/// Pick the decode strategy for a session
pub fn select_strategy(
    config: &Config,
    capabilities: &Capabilities,
    results_tx: mpsc::Sender<TaggedDetection>,
    metrics: Arc<Metrics>,
) -> Box<dyn DecodeStrategy> {
    let preference = config.strategy_preference();
    let use_detector = match preference {
        StrategyPreference::Auto => capabilities.detector_available(),
        StrategyPreference::Detector => {
            if !capabilities.detector_usable() {
                warn!(
                    detector_registered = %capabilities.detector.is_some(),
                    runtime = %capabilities.runtime,
                    "detector_unavailable_falling_back_to_software"
                );
            }
            capabilities.detector_usable()
        }
        StrategyPreference::Software => false,
    };

    let strategy: Box<dyn DecodeStrategy> = match (use_detector, capabilities.detector.clone()) {
        (true, Some(detector)) => {
            Box::new(DetectorStrategy::new(detector, config.max_in_flight(), results_tx, metrics))
        }
        _ => Box::new(SoftwareStrategy::new(
            config.software_interval(),
            config.software_crop_ratio(),
            config.software_resolution(),
            metrics,
        )),
    };

    info!(
        strategy = %strategy.kind().as_str(),
        hardware_threads = %capabilities.hardware_threads,
        detector = ?capabilities.detector.as_ref().map(|d| d.name()),
        "decode_strategy_selected"
    );
    strategy
}
