//! Native camera backend (nokhwa)
//!
//! Handles V4L2 (Linux), AVFoundation (macOS) and Media Foundation (Windows).
//! Desktop APIs carry no facing information, so the facing preference is
//! matched against device names.

use crate::domain::types::Frame;
use crate::infra::config::FacingMode;
use crate::io::capture::{CameraBackend, CameraConstraints, CameraError, FrameSource, StreamInfo};
use nokhwa::pixel_format::LumaFormat;
use nokhwa::utils::{
    ApiBackend, CameraFormat, CameraIndex, CameraInfo, FrameFormat, RequestedFormat,
    RequestedFormatType, Resolution,
};
use nokhwa::{Camera, NokhwaError};
use tracing::{debug, info, warn};

const REAR_HINTS: [&str; 3] = ["back", "rear", "environment"];
const FRONT_HINTS: [&str; 3] = ["front", "user", "face"];

pub struct WebcamBackend;

impl WebcamBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for WebcamBackend {
    fn default() -> Self {
        Self::new()
    }
}

/// Classify a nokhwa error into the scanner's camera error kinds
fn classify(e: NokhwaError) -> CameraError {
    let text = e.to_string();
    let lower = text.to_ascii_lowercase();
    if lower.contains("permission") || lower.contains("denied") || lower.contains("not authorized")
    {
        CameraError::PermissionDenied
    } else if lower.contains("not found") || lower.contains("no such") || lower.contains("no device")
    {
        CameraError::DeviceNotFound
    } else {
        CameraError::Other(text)
    }
}

/// Pick a device: explicit override, then facing hint, then the first one
fn pick_device(devices: &[CameraInfo], constraints: &CameraConstraints) -> Option<CameraIndex> {
    if let Some(wanted) = constraints.device.as_deref() {
        if let Ok(index) = wanted.parse::<u32>() {
            return Some(CameraIndex::Index(index));
        }
        let wanted = wanted.to_ascii_lowercase();
        return devices
            .iter()
            .find(|d| d.human_name().to_ascii_lowercase().contains(&wanted))
            .map(|d| d.index().clone());
    }

    let hints: &[&str] = match constraints.facing {
        FacingMode::Environment => &REAR_HINTS,
        FacingMode::User => &FRONT_HINTS,
    };
    devices
        .iter()
        .find(|d| {
            let name = d.human_name().to_ascii_lowercase();
            hints.iter().any(|hint| name.contains(hint))
        })
        .or_else(|| devices.first())
        .map(|d| d.index().clone())
}

impl CameraBackend for WebcamBackend {
    fn name(&self) -> &'static str {
        "webcam"
    }

    fn open(&self, constraints: &CameraConstraints) -> Result<Box<dyn FrameSource>, CameraError> {
        let devices = nokhwa::query(ApiBackend::Auto).map_err(classify)?;
        debug!(count = %devices.len(), "webcam_devices_found");
        let index = pick_device(&devices, constraints).ok_or(CameraError::DeviceNotFound)?;

        let ideal = CameraFormat::new(
            Resolution::new(constraints.ideal_width, constraints.ideal_height),
            FrameFormat::MJPEG,
            constraints.ideal_frame_rate,
        );
        let requested = RequestedFormat::new::<LumaFormat>(RequestedFormatType::Closest(ideal));

        let mut camera = Camera::new(index.clone(), requested).map_err(classify)?;
        // camera is dropped (and the device closed) if the stream fails to open
        camera.open_stream().map_err(classify)?;

        let format = camera.camera_format();
        let info = StreamInfo {
            device: camera.info().human_name(),
            width: format.resolution().width(),
            height: format.resolution().height(),
            frame_rate: format.frame_rate(),
        };
        info!(index = %index, device = %info.device, "webcam_opened");

        Ok(Box::new(WebcamSource { camera, info }))
    }
}

struct WebcamSource {
    camera: Camera,
    info: StreamInfo,
}

impl FrameSource for WebcamSource {
    fn info(&self) -> StreamInfo {
        self.info.clone()
    }

    fn next_frame(&mut self, seq: u64) -> Result<Option<Frame>, CameraError> {
        let buffer = self.camera.frame().map_err(classify)?;
        let image = buffer.decode_image::<LumaFormat>().map_err(classify)?;
        let (width, height) = image.dimensions();
        Frame::new(seq, width, height, image.into_raw())
            .map(Some)
            .ok_or_else(|| CameraError::Other("camera returned an empty frame".to_string()))
    }
}

impl Drop for WebcamSource {
    fn drop(&mut self) {
        if let Err(e) = self.camera.stop_stream() {
            warn!(error = %e, "webcam_stop_failed");
        }
    }
}
