//! Image-sequence camera backend
//!
//! Plays back a directory of still images (sorted by file name) as if they
//! came from a camera. Used for kiosk demos, badge print checks and tests on
//! machines without a camera.

use crate::domain::types::Frame;
use crate::io::capture::{CameraBackend, CameraConstraints, CameraError, FrameSource, StreamInfo};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const IMAGE_EXTENSIONS: [&str; 5] = ["png", "jpg", "jpeg", "bmp", "gif"];

pub struct ReplayBackend {
    dir: PathBuf,
    looping: bool,
}

impl ReplayBackend {
    pub fn new(dir: impl Into<PathBuf>, looping: bool) -> Self {
        Self { dir: dir.into(), looping }
    }

    fn list_frames(&self) -> Result<Vec<PathBuf>, CameraError> {
        let entries = std::fs::read_dir(&self.dir).map_err(|e| match e.kind() {
            ErrorKind::NotFound => CameraError::DeviceNotFound,
            ErrorKind::PermissionDenied => CameraError::PermissionDenied,
            _ => CameraError::Other(format!("{}: {e}", self.dir.display())),
        })?;

        let mut paths: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| is_image(path))
            .collect();
        paths.sort();
        Ok(paths)
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

fn load_luma(path: &Path) -> Result<image::GrayImage, CameraError> {
    image::open(path)
        .map(|img| img.to_luma8())
        .map_err(|e| CameraError::Other(format!("{}: {e}", path.display())))
}

impl CameraBackend for ReplayBackend {
    fn name(&self) -> &'static str {
        "replay"
    }

    fn open(&self, constraints: &CameraConstraints) -> Result<Box<dyn FrameSource>, CameraError> {
        let paths = self.list_frames()?;
        let Some(first) = paths.first() else {
            warn!(dir = %self.dir.display(), "replay_dir_empty");
            return Err(CameraError::DeviceNotFound);
        };

        // Stream dimensions come from the first image, not the requested ideal
        let (width, height) = load_luma(first)?.dimensions();
        info!(
            dir = %self.dir.display(),
            frames = %paths.len(),
            looping = %self.looping,
            "replay_opened"
        );

        Ok(Box::new(ReplaySource {
            info: StreamInfo {
                device: self.dir.display().to_string(),
                width,
                height,
                frame_rate: constraints.ideal_frame_rate.max(1),
            },
            paths,
            cursor: 0,
            looping: self.looping,
        }))
    }
}

struct ReplaySource {
    info: StreamInfo,
    paths: Vec<PathBuf>,
    cursor: usize,
    looping: bool,
}

impl FrameSource for ReplaySource {
    fn info(&self) -> StreamInfo {
        self.info.clone()
    }

    fn next_frame(&mut self, seq: u64) -> Result<Option<Frame>, CameraError> {
        if self.cursor >= self.paths.len() {
            if !self.looping {
                return Ok(None);
            }
            self.cursor = 0;
        }
        let path = &self.paths[self.cursor];
        self.cursor += 1;

        let image = load_luma(path)?;
        debug!(path = %path.display(), seq, "replay_frame");
        Frame::from_luma_image(seq, image)
            .map(Some)
            .ok_or_else(|| CameraError::Other(format!("{}: empty image", path.display())))
    }
}
