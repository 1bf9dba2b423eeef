//! Scan session - one camera lifecycle worth of scan state
//!
//! A session owns the stream handle, the chosen decode strategy and the
//! debouncer. Its task ticks at a fixed rate and `select!`s over:
//! - the tick (poll newest frame, run the strategy)
//! - completed detections from the detector strategy
//! - the pending cooldown deadline
//! - operator commands (`NextScan`, `Stop`)
//!
//! The session is dropped on stop; nothing survives into the next one.

use crate::domain::directory::Directory;
use crate::domain::types::{DecodedPayload, Frame, MatchResult, ScanStatus, ScanUpdate, SessionId};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::capture::{CameraError, FramePoll, StreamHandle};
use crate::services::debouncer::{Admission, ScanDebouncer};
use crate::services::decode::{DecodeStrategy, DetectionTag, TaggedDetection, TickOutcome};
use crate::services::matcher::ParticipantMatcher;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionCommand {
    NextScan,
    Stop,
}

/// Why a session task ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    Stopped,
    Failed(CameraError),
}

/// Fans scan updates out to the presentation layer.
///
/// Updates go on a bounded channel (dropped and counted when the consumer
/// lags) and the latest status is kept in a `watch`.
#[derive(Clone)]
pub struct UpdatePublisher {
    updates_tx: mpsc::Sender<ScanUpdate>,
    status_tx: Arc<watch::Sender<ScanStatus>>,
    metrics: Arc<Metrics>,
}

impl UpdatePublisher {
    pub fn new(
        updates_tx: mpsc::Sender<ScanUpdate>,
        metrics: Arc<Metrics>,
    ) -> (Self, watch::Receiver<ScanStatus>) {
        let (status_tx, status_rx) = watch::channel(ScanStatus::Idle);
        (Self { updates_tx, status_tx: Arc::new(status_tx), metrics }, status_rx)
    }

    pub fn status(&self) -> ScanStatus {
        *self.status_tx.borrow()
    }

    pub fn publish(&self, update: ScanUpdate) {
        self.status_tx.send_replace(update.status);
        match self.updates_tx.try_send(update) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(update)) => {
                self.metrics.record_update_dropped();
                warn!(status = %update.status, scan_count = %update.scan_count, "update_dropped_consumer_lagging");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("update_dropped_no_consumer");
            }
        }
    }
}

pub struct ScanSession {
    id: SessionId,
    debouncer: ScanDebouncer,
    matcher: ParticipantMatcher,
    directory: Arc<Directory>,
    strategy: Box<dyn DecodeStrategy>,
    stream: Option<StreamHandle>,
    publisher: UpdatePublisher,
    metrics: Arc<Metrics>,
    tick_interval: Duration,
}

impl ScanSession {
    pub fn new(
        id: SessionId,
        config: &Config,
        directory: Arc<Directory>,
        strategy: Box<dyn DecodeStrategy>,
        publisher: UpdatePublisher,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            id,
            debouncer: ScanDebouncer::from_config(config),
            matcher: ParticipantMatcher::from_config(config),
            directory,
            strategy,
            stream: None,
            publisher,
            metrics,
            tick_interval: config.tick_interval(),
        }
    }

    pub fn with_stream(mut self, stream: StreamHandle) -> Self {
        self.stream = Some(stream);
        self
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn debouncer(&self) -> &ScanDebouncer {
        &self.debouncer
    }

    fn publish(&self, status: ScanStatus) {
        self.publisher.publish(ScanUpdate::new(self.id, status, self.debouncer.scan_count()));
    }

    fn tag(&self) -> DetectionTag {
        DetectionTag { session: self.id, epoch: self.debouncer.epoch() }
    }

    /// Enter `scanning`
    pub fn begin(&mut self) {
        self.debouncer.start();
        let device = self.stream.as_ref().map(|s| s.info().device.as_str()).unwrap_or("none");
        info!(
            session_id = %self.id,
            strategy = %self.strategy.kind().as_str(),
            device = %device,
            "scan_session_started"
        );
        self.publish(ScanStatus::Scanning);
    }

    /// One tick: take the newest frame from the stream and decode it
    pub fn on_tick(&mut self, now: Instant) -> Result<(), CameraError> {
        self.metrics.record_tick();
        let frame = match self.stream.as_mut().map(StreamHandle::poll) {
            Some(FramePoll::Frame(frame)) => frame,
            Some(FramePoll::Failed(e)) => return Err(e),
            Some(FramePoll::Idle) | None => return Ok(()),
        };
        self.process_frame(&frame, now);
        Ok(())
    }

    /// Run the decode strategy on a frame while input is accepted
    pub fn process_frame(&mut self, frame: &Frame, now: Instant) -> Option<MatchResult> {
        if !self.debouncer.is_accepting() {
            return None;
        }
        let tag = self.tag();
        match self.strategy.on_tick(frame, now, tag) {
            TickOutcome::Decoded(payload) => self.apply_payload(payload, now),
            _ => None,
        }
    }

    /// Apply a completed detection if it still belongs to this session and epoch
    pub fn apply_detection(&mut self, detection: TaggedDetection, now: Instant) -> Option<MatchResult> {
        if detection.tag != self.tag() {
            self.metrics.record_stale_detection();
            debug!(
                session_id = %self.id,
                detection_epoch = %detection.tag.epoch,
                epoch = %self.debouncer.epoch(),
                "stale_detection_dropped"
            );
            return None;
        }
        self.apply_payload(detection.payload, now)
    }

    fn apply_payload(&mut self, payload: DecodedPayload, now: Instant) -> Option<MatchResult> {
        self.metrics.record_payload();
        match self.debouncer.offer(&payload.raw_value) {
            Admission::Accepted => {}
            Admission::Duplicate => {
                self.metrics.record_duplicate();
                return None;
            }
            Admission::NotAccepting => return None,
        }

        let result = self.matcher.resolve(&payload.raw_value, &self.directory);
        self.debouncer.record_outcome(result.is_match(), now);
        self.metrics.record_match(result.is_match());

        info!(
            session_id = %self.id,
            scan_count = %self.debouncer.scan_count(),
            participant_id = %result.participant_id,
            matched = %result.is_match(),
            "payload_accepted"
        );

        self.publisher.publish(
            ScanUpdate::new(self.id, self.debouncer.status(), self.debouncer.scan_count())
                .with_match(result.clone()),
        );
        Some(result)
    }

    /// Expire the cooldown if due
    pub fn on_cooldown(&mut self, now: Instant) {
        if self.debouncer.poll_cooldown(now) {
            self.publish(ScanStatus::Scanning);
        }
    }

    pub fn next_scan(&mut self) {
        if self.debouncer.next_scan() {
            info!(session_id = %self.id, "next_scan");
            self.publish(ScanStatus::Scanning);
        }
    }

    /// Release the camera off the async workers; the capture thread is joined
    async fn release_stream(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = tokio::task::spawn_blocking(move || stream.stop()).await {
                error!(session_id = %self.id, error = %e, "stream_release_failed");
            }
        }
    }

    pub async fn stop(&mut self) {
        self.debouncer.stop();
        self.release_stream().await;
        info!(session_id = %self.id, scan_count = %self.debouncer.scan_count(), "scan_session_stopped");
        self.publish(ScanStatus::Idle);
    }

    pub async fn fail(&mut self, e: &CameraError) {
        self.debouncer.fail();
        self.release_stream().await;
        error!(session_id = %self.id, error = %e, "scan_session_failed");
        self.publisher.publish(
            ScanUpdate::new(self.id, ScanStatus::Error, self.debouncer.scan_count())
                .with_message(e.user_message()),
        );
    }

    /// Drive the session until stopped or the camera fails
    pub async fn run(
        mut self,
        mut cmd_rx: mpsc::Receiver<SessionCommand>,
        mut detections_rx: mpsc::Receiver<TaggedDetection>,
    ) -> SessionEnd {
        let mut tick = tokio::time::interval(self.tick_interval);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let deadline = self.debouncer.cooldown_deadline();

            tokio::select! {
                _ = tick.tick() => {
                    if let Err(e) = self.on_tick(Instant::now()) {
                        self.fail(&e).await;
                        return SessionEnd::Failed(e);
                    }
                }
                Some(detection) = detections_rx.recv() => {
                    self.apply_detection(detection, Instant::now());
                }
                _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                    self.on_cooldown(Instant::now());
                }
                cmd = cmd_rx.recv() => match cmd {
                    Some(SessionCommand::NextScan) => self.next_scan(),
                    Some(SessionCommand::Stop) | None => {
                        self.stop().await;
                        return SessionEnd::Stopped;
                    }
                },
            }
        }
    }
}
