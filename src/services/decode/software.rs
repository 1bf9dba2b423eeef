//! Software decode strategy
//!
//! Runs inside the tick, so it is throttled and works on a small image: the
//! centered square of the frame, downsampled before rqrr sees it.

use super::qr::{decode_luma, CropResizer, Polarity};
use super::{DecodeError, DecodeStrategy, DetectionTag, StrategyKind, TickOutcome};
use crate::domain::types::{DecodedPayload, Frame};
use crate::infra::metrics::Metrics;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::trace;

pub struct SoftwareStrategy {
    interval: Duration,
    last_attempt: Option<Instant>,
    stage: CropResizer,
    metrics: Arc<Metrics>,
}

impl SoftwareStrategy {
    pub fn new(interval: Duration, crop_ratio: f32, resolution: u32, metrics: Arc<Metrics>) -> Self {
        Self {
            interval,
            last_attempt: None,
            stage: CropResizer::new(crop_ratio, resolution),
            metrics,
        }
    }

    /// Crop, downsample and decode one frame, normal polarity only
    pub fn decode_frame(&mut self, frame: &Frame) -> Result<Option<String>, DecodeError> {
        let side = self.stage.resolution() as usize;
        let plane = self.stage.process(frame)?;
        decode_luma(plane, side, side, Polarity::Normal)
    }
}

impl DecodeStrategy for SoftwareStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Software
    }

    fn on_tick(&mut self, frame: &Frame, now: Instant, _tag: DetectionTag) -> TickOutcome {
        if let Some(last) = self.last_attempt {
            if now.saturating_duration_since(last) < self.interval {
                return TickOutcome::Throttled;
            }
        }
        self.last_attempt = Some(now);

        let started = std::time::Instant::now();
        let result = self.decode_frame(frame);
        self.metrics.record_decode_attempt(started.elapsed().as_micros() as u64);

        match result {
            Ok(Some(text)) => TickOutcome::Decoded(DecodedPayload::new(text)),
            Ok(None) => TickOutcome::NoCode,
            Err(e) => {
                trace!(seq = %frame.seq, error = %e, "software_decode_failed");
                self.metrics.record_decode_failure();
                TickOutcome::NoCode
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::SessionId;
    use crate::services::decode::qr::tests::{empty_frame, qr_frame};

    fn tag() -> DetectionTag {
        DetectionTag { session: SessionId::new(), epoch: 0 }
    }

    fn strategy(metrics: Arc<Metrics>) -> SoftwareStrategy {
        SoftwareStrategy::new(Duration::from_millis(50), 0.85, 300, metrics)
    }

    #[test]
    fn test_decodes_centered_badge() {
        let mut software = strategy(Arc::new(Metrics::new()));
        let frame = qr_frame("PART-003", 640, 480, 6);

        match software.on_tick(&frame, Instant::now(), tag()) {
            TickOutcome::Decoded(payload) => assert_eq!(payload.raw_value, "PART-003"),
            other => panic!("expected a payload, got {other:?}"),
        }
    }

    #[test]
    fn test_blank_frame_yields_nothing() {
        let mut software = strategy(Arc::new(Metrics::new()));
        let frame = Frame::blank(0, 640, 480, 255).unwrap();
        assert_eq!(software.on_tick(&frame, Instant::now(), tag()), TickOutcome::NoCode);
    }

    #[test]
    fn test_zero_sized_frame_counts_as_failure() {
        let metrics = Arc::new(Metrics::new());
        let mut software = strategy(metrics.clone());
        assert_eq!(software.on_tick(&empty_frame(0, 480), Instant::now(), tag()), TickOutcome::NoCode);
        assert_eq!(metrics.decode_attempts_total(), 1);
    }

    #[test]
    fn test_throttle_caps_attempts_per_second() {
        let metrics = Arc::new(Metrics::new());
        let mut software = strategy(metrics.clone());
        let frame = Frame::blank(0, 320, 240, 255).unwrap();
        let start = Instant::now();

        // 16 ms ticks for one second
        let mut throttled = 0;
        for i in 0..63u64 {
            let now = start + Duration::from_millis(16 * i);
            if software.on_tick(&frame, now, tag()) == TickOutcome::Throttled {
                throttled += 1;
            }
        }

        let attempts = metrics.decode_attempts_total();
        assert!(attempts <= 20, "{attempts} attempts in one second");
        assert!(attempts > 0);
        assert_eq!(attempts + throttled, 63);
    }

    #[test]
    fn test_attempt_allowed_once_interval_elapsed() {
        let metrics = Arc::new(Metrics::new());
        let mut software = strategy(metrics.clone());
        let frame = Frame::blank(0, 320, 240, 255).unwrap();
        let start = Instant::now();

        assert_eq!(software.on_tick(&frame, start, tag()), TickOutcome::NoCode);
        assert_eq!(
            software.on_tick(&frame, start + Duration::from_millis(49), tag()),
            TickOutcome::Throttled
        );
        assert_eq!(
            software.on_tick(&frame, start + Duration::from_millis(50), tag()),
            TickOutcome::NoCode
        );
        assert_eq!(metrics.decode_attempts_total(), 2);
    }
}
