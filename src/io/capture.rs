//! Camera acquisition and release
//!
//! `CaptureManager::start` opens a backend on a dedicated capture thread and
//! returns a `StreamHandle`. The capture thread owns the device for its whole
//! life and publishes the most recent frame through a `watch` channel, so the
//! scan loop always sees the newest picture and never queues stale ones.
//!
//! Release is RAII: stopping (or dropping) the handle disconnects the stop
//! channel, the capture thread drops the device and is joined before `stop`
//! returns. At most one handle is live per manager.

use crate::domain::types::Frame;
use crate::infra::config::{CameraConfig, FacingMode};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, RecvTimeoutError, SyncSender};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Consecutive read failures tolerated before the stream is declared dead
const MAX_READ_FAILURES: usize = 30;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CameraError {
    #[error("camera permission denied")]
    PermissionDenied,
    #[error("no camera device found")]
    DeviceNotFound,
    #[error("camera error: {0}")]
    Other(String),
}

impl CameraError {
    /// Message suitable for showing to the operator
    pub fn user_message(&self) -> String {
        match self {
            CameraError::PermissionDenied => {
                "Camera access was denied. Allow camera access and start scanning again.".to_string()
            }
            CameraError::DeviceNotFound => {
                "No camera was found. Connect a camera and start scanning again.".to_string()
            }
            CameraError::Other(detail) => format!("Could not use the camera: {detail}"),
        }
    }
}

/// Capture preferences. Backends pick the closest supported mode.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CameraConstraints {
    pub facing: FacingMode,
    pub ideal_width: u32,
    pub ideal_height: u32,
    pub ideal_frame_rate: u32,
    /// Device name fragment or index that overrides the facing preference
    pub device: Option<String>,
}

impl CameraConstraints {
    pub fn from_config(config: &CameraConfig) -> Self {
        Self {
            facing: config.facing,
            ideal_width: config.ideal_width,
            ideal_height: config.ideal_height,
            ideal_frame_rate: config.ideal_frame_rate,
            device: config.device.clone(),
        }
    }
}

impl Default for CameraConstraints {
    fn default() -> Self {
        Self::from_config(&CameraConfig::default())
    }
}

/// Mode the backend actually negotiated
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamInfo {
    pub device: String,
    pub width: u32,
    pub height: u32,
    pub frame_rate: u32,
}

/// An open device producing frames. Dropping it releases the device.
///
/// Sources live on the capture thread only, so they need not be `Send`.
pub trait FrameSource {
    fn info(&self) -> StreamInfo;

    /// Read the next frame. `Ok(None)` means the source is exhausted.
    fn next_frame(&mut self, seq: u64) -> Result<Option<Frame>, CameraError>;
}

/// A way of opening a camera
pub trait CameraBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Open a device matching the constraints as closely as possible.
    /// Anything acquired before a failure must be released before returning.
    fn open(&self, constraints: &CameraConstraints) -> Result<Box<dyn FrameSource>, CameraError>;
}

/// Latest state of the capture feed
#[derive(Debug, Clone)]
pub enum FeedState {
    Waiting,
    Live(Frame),
    Failed(CameraError),
}

/// What a poll of the stream handle observed
#[derive(Debug, Clone)]
pub enum FramePoll {
    /// Nothing new since the last poll
    Idle,
    Frame(Frame),
    Failed(CameraError),
}

/// Clears the manager's "in use" flag when dropped
struct ActiveGuard(Arc<AtomicBool>);

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Exclusive handle on a running capture stream
pub struct StreamHandle {
    info: StreamInfo,
    feed: watch::Receiver<FeedState>,
    stop_tx: Option<SyncSender<()>>,
    thread: Option<JoinHandle<()>>,
    guard: Option<ActiveGuard>,
}

impl StreamHandle {
    pub fn info(&self) -> &StreamInfo {
        &self.info
    }

    /// Take the newest frame if one arrived since the last poll
    pub fn poll(&mut self) -> FramePoll {
        if self.guard.is_none() {
            return FramePoll::Idle;
        }
        // A closed sender means the capture thread exited; its final state still counts
        let changed = self.feed.has_changed().unwrap_or(true);
        if !changed {
            return FramePoll::Idle;
        }
        match &*self.feed.borrow_and_update() {
            FeedState::Waiting => FramePoll::Idle,
            FeedState::Live(frame) => FramePoll::Frame(frame.clone()),
            FeedState::Failed(e) => FramePoll::Failed(e.clone()),
        }
    }

    /// Release the device. Safe to call any number of times.
    pub fn stop(&mut self) {
        // Disconnecting the stop channel wakes the capture thread
        self.stop_tx.take();
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!(device = %self.info.device, "capture_thread_panicked");
            }
            info!(device = %self.info.device, "camera_released");
        }
        self.guard.take();
    }
}

impl Drop for StreamHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Acquires and releases the video input device
#[derive(Clone)]
pub struct CaptureManager {
    backend: Arc<dyn CameraBackend>,
    active: Arc<AtomicBool>,
}

impl CaptureManager {
    pub fn new(backend: Arc<dyn CameraBackend>) -> Self {
        Self { backend, active: Arc::new(AtomicBool::new(false)) }
    }

    pub fn backend_name(&self) -> &'static str {
        self.backend.name()
    }

    /// True while a stream handle from this manager is live
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Open the camera. Blocks until the device is streaming or has failed.
    pub fn start(&self, constraints: &CameraConstraints) -> Result<StreamHandle, CameraError> {
        if self.active.compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst).is_err() {
            return Err(CameraError::Other("camera already in use".to_string()));
        }
        let guard = ActiveGuard(self.active.clone());

        let (ready_tx, ready_rx) = sync_channel::<Result<StreamInfo, CameraError>>(1);
        let (stop_tx, stop_rx) = sync_channel::<()>(1);
        let (feed_tx, feed_rx) = watch::channel(FeedState::Waiting);
        let backend = self.backend.clone();
        let open_constraints = constraints.clone();

        let thread = std::thread::Builder::new()
            .name("camera-capture".to_string())
            .spawn(move || {
                let mut source = match backend.open(&open_constraints) {
                    Ok(source) => source,
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return;
                    }
                };
                let info = source.info();
                let _ = ready_tx.send(Ok(info.clone()));
                run_capture(source.as_mut(), &info, &feed_tx, &stop_rx);
                // source dropped here, releasing the device on this thread
            })
            .map_err(|e| CameraError::Other(format!("failed to spawn capture thread: {e}")))?;

        let info = match ready_rx.recv() {
            Ok(Ok(info)) => info,
            Ok(Err(e)) => {
                let _ = thread.join();
                warn!(backend = %self.backend.name(), error = %e, "camera_open_failed");
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(CameraError::Other("capture thread exited during open".to_string()));
            }
        };

        info!(
            backend = %self.backend.name(),
            device = %info.device,
            width = %info.width,
            height = %info.height,
            frame_rate = %info.frame_rate,
            requested_width = %constraints.ideal_width,
            requested_height = %constraints.ideal_height,
            requested_frame_rate = %constraints.ideal_frame_rate,
            facing = %constraints.facing.as_str(),
            "camera_started"
        );

        Ok(StreamHandle {
            info,
            feed: feed_rx,
            stop_tx: Some(stop_tx),
            thread: Some(thread),
            guard: Some(guard),
        })
    }

    /// Release a stream. Idempotent.
    pub fn stop(&self, handle: &mut StreamHandle) {
        handle.stop();
    }
}

/// Capture loop: read, publish latest, pace to the negotiated frame rate
fn run_capture(
    source: &mut dyn FrameSource,
    info: &StreamInfo,
    feed_tx: &watch::Sender<FeedState>,
    stop_rx: &std::sync::mpsc::Receiver<()>,
) {
    let frame_interval = Duration::from_secs_f64(1.0 / info.frame_rate.max(1) as f64);
    let mut seq = 0u64;
    let mut consecutive_failures = 0usize;

    loop {
        let started = Instant::now();

        let state = match source.next_frame(seq) {
            Ok(Some(frame)) => {
                consecutive_failures = 0;
                seq += 1;
                Some(FeedState::Live(frame))
            }
            Ok(None) => {
                info!(device = %info.device, frames = %seq, "camera_stream_ended");
                Some(FeedState::Failed(CameraError::Other("video stream ended".to_string())))
            }
            Err(e) => {
                consecutive_failures += 1;
                debug!(error = %e, consecutive_failures, "camera_read_failed");
                if consecutive_failures >= MAX_READ_FAILURES {
                    error!(device = %info.device, error = %e, "camera_stream_failed");
                    Some(FeedState::Failed(e))
                } else {
                    None
                }
            }
        };

        if let Some(state) = state {
            let terminal = matches!(state, FeedState::Failed(_));
            if feed_tx.send(state).is_err() || terminal {
                // No receivers left, or nothing more to produce
                return;
            }
        }

        let remaining = frame_interval.saturating_sub(started.elapsed());
        match stop_rx.recv_timeout(remaining) {
            Err(RecvTimeoutError::Timeout) => {}
            Ok(()) | Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}
