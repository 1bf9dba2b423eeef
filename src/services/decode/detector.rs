//! Accelerated detector strategy
//!
//! Each tick hands the full frame to a `BarcodeDetector` on its own task and
//! returns at once. Completed detections are sent back tagged with the
//! session and epoch they were started under; the session decides whether
//! they still apply.

use super::qr::{decode_luma, Polarity};
use super::{DecodeError, DecodeStrategy, DetectionTag, StrategyKind, TaggedDetection, TickOutcome};
use crate::domain::types::{DecodedPayload, Frame};
use crate::infra::metrics::Metrics;
use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant as StdInstant;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// A barcode detector that may run off the scan loop
#[async_trait]
pub trait BarcodeDetector: Send + Sync {
    fn name(&self) -> &'static str;

    /// Detect QR codes in the frame, returning their raw values
    async fn detect(&self, frame: Frame) -> Result<Vec<String>, DecodeError>;
}

/// Bundled detector: rqrr on the blocking pool, full resolution, both polarities
#[derive(Debug, Default, Clone, Copy)]
pub struct RqrrDetector;

impl RqrrDetector {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl BarcodeDetector for RqrrDetector {
    fn name(&self) -> &'static str {
        "rqrr"
    }

    async fn detect(&self, frame: Frame) -> Result<Vec<String>, DecodeError> {
        tokio::task::spawn_blocking(move || detect_any_polarity(&frame))
            .await
            .map_err(|e| DecodeError::Transient(format!("detector task failed: {e}")))?
    }
}

fn detect_any_polarity(frame: &Frame) -> Result<Vec<String>, DecodeError> {
    let (width, height) = (frame.width as usize, frame.height as usize);

    let first_error = match decode_luma(&frame.luma, width, height, Polarity::Normal) {
        Ok(Some(text)) => return Ok(vec![text]),
        Ok(None) => None,
        Err(e) => Some(e),
    };

    match decode_luma(&frame.luma, width, height, Polarity::Inverted) {
        Ok(Some(text)) => Ok(vec![text]),
        Ok(None) => first_error.map_or(Ok(Vec::new()), Err),
        Err(e) => Err(first_error.unwrap_or(e)),
    }
}

/// Releases an in-flight slot when the detection finishes, however it ends
struct InFlightSlot {
    in_flight: Arc<AtomicUsize>,
    metrics: Arc<Metrics>,
}

impl Drop for InFlightSlot {
    fn drop(&mut self) {
        self.in_flight.fetch_sub(1, Ordering::AcqRel);
        self.metrics.detection_finished();
    }
}

pub struct DetectorStrategy {
    detector: Arc<dyn BarcodeDetector>,
    max_in_flight: usize,
    in_flight: Arc<AtomicUsize>,
    results_tx: mpsc::Sender<TaggedDetection>,
    metrics: Arc<Metrics>,
}

impl DetectorStrategy {
    pub fn new(
        detector: Arc<dyn BarcodeDetector>,
        max_in_flight: usize,
        results_tx: mpsc::Sender<TaggedDetection>,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            detector,
            max_in_flight: max_in_flight.max(1),
            in_flight: Arc::new(AtomicUsize::new(0)),
            results_tx,
            metrics,
        }
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::Acquire)
    }

    fn try_reserve(&self) -> Option<InFlightSlot> {
        self.in_flight
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_in_flight).then_some(n + 1)
            })
            .ok()?;
        self.metrics.detection_started();
        Some(InFlightSlot { in_flight: self.in_flight.clone(), metrics: self.metrics.clone() })
    }
}

impl DecodeStrategy for DetectorStrategy {
    fn kind(&self) -> StrategyKind {
        StrategyKind::Detector
    }

    fn on_tick(&mut self, frame: &Frame, _now: Instant, tag: DetectionTag) -> TickOutcome {
        let Some(slot) = self.try_reserve() else {
            self.metrics.record_detection_skipped();
            return TickOutcome::Saturated;
        };

        let detector = self.detector.clone();
        let results_tx = self.results_tx.clone();
        let metrics = self.metrics.clone();
        let frame = frame.clone();
        let seq = frame.seq;

        tokio::spawn(async move {
            let _slot = slot;
            let started = StdInstant::now();

            // Run the detector on its own task so a panic inside it stays contained
            let outcome = tokio::spawn(async move { detector.detect(frame).await }).await;
            metrics.record_decode_attempt(started.elapsed().as_micros() as u64);

            let raw_value = match outcome {
                Ok(Ok(values)) => values.into_iter().next(),
                Ok(Err(e)) => {
                    trace!(seq = %seq, error = %e, "detection_failed");
                    metrics.record_decode_failure();
                    None
                }
                Err(e) => {
                    warn!(seq = %seq, error = %e, "detection_task_panicked");
                    metrics.record_decode_failure();
                    None
                }
            };

            if let Some(raw_value) = raw_value {
                let detection = TaggedDetection { tag, payload: DecodedPayload::new(raw_value) };
                if results_tx.send(detection).await.is_err() {
                    debug!(seq = %seq, "detection_result_discarded_session_closed");
                }
            }
        });

        TickOutcome::Dispatched
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::domain::types::SessionId;
    use crate::services::decode::qr::tests::{empty_frame, inverted, qr_frame};
    use std::collections::VecDeque;
    use std::time::Duration;
    use tokio::sync::Semaphore;

    /// Detector returning a scripted sequence of results, one per call
    pub(crate) struct ScriptedDetector {
        script: parking_lot::Mutex<VecDeque<Option<String>>>,
    }

    impl ScriptedDetector {
        pub(crate) fn new<I, S>(script: I) -> Self
        where
            I: IntoIterator<Item = Option<S>>,
            S: Into<String>,
        {
            Self { script: parking_lot::Mutex::new(script.into_iter().map(|s| s.map(Into::into)).collect()) }
        }
    }

    #[async_trait]
    impl BarcodeDetector for ScriptedDetector {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn detect(&self, _frame: Frame) -> Result<Vec<String>, DecodeError> {
            Ok(self.script.lock().pop_front().flatten().into_iter().collect())
        }
    }

    /// Detector that blocks until a permit is released
    struct GatedDetector {
        gate: Arc<Semaphore>,
    }

    #[async_trait]
    impl BarcodeDetector for GatedDetector {
        fn name(&self) -> &'static str {
            "gated"
        }

        async fn detect(&self, _frame: Frame) -> Result<Vec<String>, DecodeError> {
            let _permit = self.gate.acquire().await.map_err(|e| DecodeError::Transient(e.to_string()))?;
            Ok(vec!["GATED".to_string()])
        }
    }

    struct PanickingDetector;

    #[async_trait]
    impl BarcodeDetector for PanickingDetector {
        fn name(&self) -> &'static str {
            "panicking"
        }

        async fn detect(&self, _frame: Frame) -> Result<Vec<String>, DecodeError> {
            panic!("detector blew up");
        }
    }

    fn tag(epoch: u64) -> DetectionTag {
        DetectionTag { session: SessionId::new(), epoch }
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_rqrr_detector_reads_both_polarities() {
        let detector = RqrrDetector::new();

        let normal = detector.detect(qr_frame("PART-001", 640, 480, 8)).await.unwrap();
        assert_eq!(normal, vec!["PART-001".to_string()]);

        let dark = detector.detect(inverted(&qr_frame("PART-002", 640, 480, 8))).await.unwrap();
        assert_eq!(dark, vec!["PART-002".to_string()]);

        let blank = detector.detect(Frame::blank(0, 320, 240, 255).unwrap()).await.unwrap();
        assert!(blank.is_empty());
    }

    #[tokio::test]
    async fn test_rqrr_detector_rejects_zero_sized_frame() {
        let detector = RqrrDetector::new();
        assert!(matches!(detector.detect(empty_frame(640, 0)).await, Err(DecodeError::Transient(_))));
    }

    #[tokio::test]
    async fn test_dispatch_returns_tagged_result() {
        let (tx, mut rx) = mpsc::channel(8);
        let detector = Arc::new(ScriptedDetector::new([Some("PART-001")]));
        let mut strategy = DetectorStrategy::new(detector, 4, tx, Arc::new(Metrics::new()));

        let tag = tag(7);
        let outcome = strategy.on_tick(&Frame::blank(1, 8, 8, 0).unwrap(), Instant::now(), tag);
        assert_eq!(outcome, TickOutcome::Dispatched);

        let detection = rx.recv().await.unwrap();
        assert_eq!(detection.tag, tag);
        assert_eq!(detection.payload.raw_value, "PART-001");
    }

    #[tokio::test]
    async fn test_empty_detection_sends_nothing() {
        let (tx, mut rx) = mpsc::channel(8);
        let detector = Arc::new(ScriptedDetector::new([None, Some("SECOND")]));
        let mut strategy = DetectorStrategy::new(detector, 1, tx, Arc::new(Metrics::new()));

        strategy.on_tick(&Frame::blank(1, 8, 8, 0).unwrap(), Instant::now(), tag(0));
        wait_until(|| strategy.in_flight() == 0).await;
        strategy.on_tick(&Frame::blank(2, 8, 8, 0).unwrap(), Instant::now(), tag(0));

        assert_eq!(rx.recv().await.unwrap().payload.raw_value, "SECOND");
    }

    #[tokio::test]
    async fn test_in_flight_bound_skips_ticks() {
        let (tx, mut rx) = mpsc::channel(8);
        let gate = Arc::new(Semaphore::new(0));
        let metrics = Arc::new(Metrics::new());
        let detector = Arc::new(GatedDetector { gate: gate.clone() });
        let mut strategy = DetectorStrategy::new(detector, 2, tx, metrics.clone());
        let frame = Frame::blank(0, 8, 8, 0).unwrap();

        assert_eq!(strategy.on_tick(&frame, Instant::now(), tag(0)), TickOutcome::Dispatched);
        assert_eq!(strategy.on_tick(&frame, Instant::now(), tag(0)), TickOutcome::Dispatched);
        assert_eq!(strategy.on_tick(&frame, Instant::now(), tag(0)), TickOutcome::Saturated);
        assert_eq!(strategy.in_flight(), 2);
        assert_eq!(metrics.report().detections_skipped, 1);

        gate.add_permits(2);
        rx.recv().await.unwrap();
        rx.recv().await.unwrap();
        wait_until(|| strategy.in_flight() == 0).await;
        assert_eq!(strategy.on_tick(&frame, Instant::now(), tag(0)), TickOutcome::Dispatched);
    }

    #[tokio::test]
    async fn test_panicking_detector_frees_slot() {
        let (tx, _rx) = mpsc::channel(8);
        let metrics = Arc::new(Metrics::new());
        let mut strategy = DetectorStrategy::new(Arc::new(PanickingDetector), 1, tx, metrics.clone());

        assert_eq!(
            strategy.on_tick(&Frame::blank(0, 8, 8, 0).unwrap(), Instant::now(), tag(0)),
            TickOutcome::Dispatched
        );
        wait_until(|| strategy.in_flight() == 0).await;
        assert_eq!(metrics.report().decode_failures_total, 1);
        assert_eq!(metrics.detections_in_flight(), 0);
    }
}
