//! IO modules - external system interfaces
//!
//! - `capture` - Camera acquisition/release and the latest-frame feed
//! - `replay` - Image-sequence camera backend
//! - `webcam` - Native camera backend (feature `webcam`)
//! - `directory` - Participant directory loading (JSON)
//! - `console` - JSON-lines output of scan updates

pub mod capture;
pub mod console;
pub mod directory;
pub mod replay;
#[cfg(feature = "webcam")]
pub mod webcam;

// Re-export commonly used types
pub use capture::{
    CameraBackend, CameraConstraints, CameraError, CaptureManager, FramePoll, FrameSource,
    StreamHandle, StreamInfo,
};
pub use console::JsonlSink;
pub use directory::{load_directory, parse_directory};
pub use replay::ReplayBackend;
#[cfg(feature = "webcam")]
pub use webcam::WebcamBackend;

use crate::infra::config::{CameraBackendKind, Config};
use std::sync::Arc;

/// Build the camera backend selected in the config
pub fn camera_backend(config: &Config) -> Result<Arc<dyn CameraBackend>, CameraError> {
    match config.camera_backend() {
        CameraBackendKind::Replay => Ok(Arc::new(ReplayBackend::new(
            config.camera().replay_dir.clone(),
            config.camera().replay_loop,
        ))),
        #[cfg(feature = "webcam")]
        CameraBackendKind::Webcam => Ok(Arc::new(WebcamBackend::new())),
        #[cfg(not(feature = "webcam"))]
        CameraBackendKind::Webcam => Err(CameraError::Other(
            "webcam backend not compiled in (build with --features webcam)".to_string(),
        )),
    }
}
