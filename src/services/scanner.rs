//! Scanner controller - start/stop/next-scan surface for the presentation layer
//!
//! Each `start` opens the camera, probes decode capabilities and spawns a
//! fresh `ScanSession` task. `stop` tells the session to stop and waits for
//! it, so the camera is released by the time it returns.

use crate::domain::directory::Directory;
use crate::domain::types::{ScanStatus, ScanUpdate, SessionId};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::capture::{CameraBackend, CameraConstraints, CameraError, CaptureManager};
use crate::services::decode::{select_strategy, BarcodeDetector, Capabilities, RqrrDetector};
use crate::services::session::{ScanSession, SessionCommand, SessionEnd, UpdatePublisher};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// Updates buffered for the presentation layer before drops start
const UPDATE_BUFFER: usize = 256;

struct RunningSession {
    id: SessionId,
    cmd_tx: mpsc::Sender<SessionCommand>,
    task: JoinHandle<SessionEnd>,
}

pub struct Scanner {
    config: Config,
    directory: Arc<Directory>,
    capture: CaptureManager,
    detector: Option<Arc<dyn BarcodeDetector>>,
    metrics: Arc<Metrics>,
    publisher: UpdatePublisher,
    status_rx: watch::Receiver<ScanStatus>,
    running: Option<RunningSession>,
    last_session: Option<SessionId>,
}

impl Scanner {
    /// Create a scanner and the receiver its updates are delivered on
    pub fn new(
        config: Config,
        directory: Arc<Directory>,
        backend: Arc<dyn CameraBackend>,
        metrics: Arc<Metrics>,
    ) -> (Self, mpsc::Receiver<ScanUpdate>) {
        let (updates_tx, updates_rx) = mpsc::channel(UPDATE_BUFFER);
        let (publisher, status_rx) = UpdatePublisher::new(updates_tx, metrics.clone());
        let scanner = Self {
            config,
            directory,
            capture: CaptureManager::new(backend),
            detector: Some(Arc::new(RqrrDetector::new())),
            metrics,
            publisher,
            status_rx,
            running: None,
            last_session: None,
        };
        (scanner, updates_rx)
    }

    /// Replace the barcode detector; None disables the detector strategy
    pub fn with_detector(mut self, detector: Option<Arc<dyn BarcodeDetector>>) -> Self {
        self.detector = detector;
        self
    }

    pub fn status(&self) -> ScanStatus {
        *self.status_rx.borrow()
    }

    /// Watch the latest status
    pub fn subscribe(&self) -> watch::Receiver<ScanStatus> {
        self.status_rx.clone()
    }

    pub fn session_id(&self) -> Option<SessionId> {
        self.running.as_ref().map(|r| r.id)
    }

    pub fn is_camera_active(&self) -> bool {
        self.capture.is_active()
    }

    /// Open the camera and start scanning.
    ///
    /// Starting while a session is live returns that session. A camera
    /// failure moves the scanner to `error` and is returned.
    pub async fn start(&mut self) -> Result<SessionId, CameraError> {
        self.reap_finished().await;
        if let Some(running) = &self.running {
            warn!(session_id = %running.id, "scanner_already_started");
            return Ok(running.id);
        }

        let session_id = SessionId::new();
        self.last_session = Some(session_id);

        let constraints = CameraConstraints::from_config(self.config.camera());
        let capture = self.capture.clone();
        let opened = tokio::task::spawn_blocking(move || capture.start(&constraints))
            .await
            .map_err(|e| CameraError::Other(format!("camera start task failed: {e}")))
            .and_then(|result| result);

        let stream = match opened {
            Ok(stream) => stream,
            Err(e) => {
                error!(session_id = %session_id, backend = %self.capture.backend_name(), error = %e, "scanner_start_failed");
                self.publisher.publish(
                    ScanUpdate::new(session_id, ScanStatus::Error, 0).with_message(e.user_message()),
                );
                return Err(e);
            }
        };

        let (detections_tx, detections_rx) = mpsc::channel(self.config.max_in_flight() * 2);
        let capabilities = Capabilities::probe(self.detector.clone());
        let strategy =
            select_strategy(&self.config, &capabilities, detections_tx, self.metrics.clone());

        let mut session = ScanSession::new(
            session_id,
            &self.config,
            self.directory.clone(),
            strategy,
            self.publisher.clone(),
            self.metrics.clone(),
        )
        .with_stream(stream);
        session.begin();

        let (cmd_tx, cmd_rx) = mpsc::channel(8);
        let task = tokio::spawn(session.run(cmd_rx, detections_rx));
        self.running = Some(RunningSession { id: session_id, cmd_tx, task });

        info!(session_id = %session_id, participants = %self.directory.len(), "scanner_started");
        Ok(session_id)
    }

    /// Stop scanning and release the camera. Always ends `idle`; safe to
    /// call repeatedly or before `start`.
    pub async fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            // A closed channel means the session already ended
            let _ = running.cmd_tx.send(SessionCommand::Stop).await;
            match running.task.await {
                Ok(SessionEnd::Stopped) => {}
                Ok(SessionEnd::Failed(e)) => info!(session_id = %running.id, error = %e, "stopped_after_camera_failure"),
                Err(e) => error!(session_id = %running.id, error = %e, "scan_session_task_failed"),
            }
        }

        if self.publisher.status() != ScanStatus::Idle {
            let session_id = self.last_session.unwrap_or_default();
            self.publisher.publish(ScanUpdate::new(session_id, ScanStatus::Idle, 0));
        }
    }

    /// Clear the last value and any cooldown. No-op unless scanning.
    pub async fn next_scan(&self) {
        if let Some(running) = &self.running {
            let _ = running.cmd_tx.send(SessionCommand::NextScan).await;
        }
    }

    /// Drop a session that failed or whose task already ended
    async fn reap_finished(&mut self) {
        let failed = self.publisher.status() == ScanStatus::Error;
        if !self.running.as_ref().is_some_and(|r| failed || r.task.is_finished()) {
            return;
        }
        if let Some(running) = self.running.take() {
            if let Err(e) = running.task.await {
                error!(session_id = %running.id, error = %e, "scan_session_task_failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::directory::ParticipantRecord;
    use crate::io::capture::tests::BlankBackend;
    use std::sync::atomic::Ordering;
    use std::time::Duration;

    fn directory() -> Arc<Directory> {
        Arc::new(Directory::from_records([ParticipantRecord::new("A1", "Alice")]))
    }

    async fn next_status(rx: &mut mpsc::Receiver<ScanUpdate>) -> ScanUpdate {
        tokio::time::timeout(Duration::from_secs(5), rx.recv()).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn test_stop_without_start_is_idle() {
        let backend = Arc::new(BlankBackend::default());
        let (mut scanner, mut rx) =
            Scanner::new(Config::default(), directory(), backend, Arc::new(Metrics::new()));

        scanner.stop().await;
        scanner.stop().await;
        assert_eq!(scanner.status(), ScanStatus::Idle);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_start_then_stop_twice_releases_camera() {
        let backend = Arc::new(BlankBackend::default());
        let released = backend.released.clone();
        let opened = backend.opened.clone();
        let (mut scanner, mut rx) =
            Scanner::new(Config::default(), directory(), backend, Arc::new(Metrics::new()));

        let id = scanner.start().await.unwrap();
        assert_eq!(scanner.status(), ScanStatus::Scanning);
        assert!(scanner.is_camera_active());
        // Second start keeps the live session
        assert_eq!(scanner.start().await.unwrap(), id);
        assert_eq!(opened.load(Ordering::SeqCst), 1);

        scanner.stop().await;
        assert_eq!(released.load(Ordering::SeqCst), 1);
        assert!(!scanner.is_camera_active());
        scanner.stop().await;
        assert_eq!(scanner.status(), ScanStatus::Idle);

        assert_eq!(next_status(&mut rx).await.status, ScanStatus::Scanning);
        assert_eq!(next_status(&mut rx).await.status, ScanStatus::Idle);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_start_failure_reports_error() {
        let backend = Arc::new(BlankBackend {
            fail_with: Some(CameraError::PermissionDenied),
            ..Default::default()
        });
        let (mut scanner, mut rx) =
            Scanner::new(Config::default(), directory(), backend, Arc::new(Metrics::new()));

        assert_eq!(scanner.start().await, Err(CameraError::PermissionDenied));
        assert_eq!(scanner.status(), ScanStatus::Error);
        let update = next_status(&mut rx).await;
        assert_eq!(update.status, ScanStatus::Error);
        assert!(update.message.unwrap().contains("denied"));

        scanner.stop().await;
        assert_eq!(scanner.status(), ScanStatus::Idle);
    }

    #[tokio::test]
    async fn test_stream_end_moves_to_error_and_restart_works() {
        let backend = Arc::new(BlankBackend { frame_limit: Some(3), ..Default::default() });
        let config = Config::default().with_strategy(crate::infra::config::StrategyPreference::Software);
        let (mut scanner, mut rx) = Scanner::new(config, directory(), backend, Arc::new(Metrics::new()));

        scanner.start().await.unwrap();
        assert_eq!(next_status(&mut rx).await.status, ScanStatus::Scanning);
        let failed = next_status(&mut rx).await;
        assert_eq!(failed.status, ScanStatus::Error);
        assert!(failed.message.unwrap().contains("video stream ended"));

        // Explicit retry
        scanner.start().await.unwrap();
        assert_eq!(scanner.status(), ScanStatus::Scanning);
        scanner.stop().await;
    }
}
