//! QR decoding primitives shared by both strategies
//!
//! - `decode_luma` runs rqrr over a luma buffer in one colour polarity
//! - `CropResizer` cuts the centered square out of a frame and downsamples it

use super::DecodeError;
use crate::domain::types::Frame;
use fast_image_resize as fr;
use rqrr::PreparedImage;

/// Which contrast the decoder assumes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    /// Dark modules on a light background (printed badges)
    Normal,
    /// Light modules on a dark background
    Inverted,
}

/// Decode the first readable QR code in a luma buffer.
///
/// `Ok(None)` means no symbol was found. A symbol that was found but could
/// not be read is a transient error: the next frame usually reads fine.
pub fn decode_luma(
    luma: &[u8],
    width: usize,
    height: usize,
    polarity: Polarity,
) -> Result<Option<String>, DecodeError> {
    if width == 0 || height == 0 || luma.len() != width * height {
        return Err(DecodeError::Transient(format!(
            "buffer of {} bytes does not match {width}x{height}",
            luma.len()
        )));
    }

    let mut img = match polarity {
        Polarity::Normal => PreparedImage::prepare_from_greyscale(width, height, |x, y| luma[y * width + x]),
        Polarity::Inverted => {
            PreparedImage::prepare_from_greyscale(width, height, |x, y| 255 - luma[y * width + x])
        }
    };

    let mut last_error = None;
    for grid in img.detect_grids() {
        match grid.decode() {
            Ok((_, content)) => return Ok(Some(content)),
            Err(e) => last_error = Some(e),
        }
    }

    match last_error {
        Some(e) => Err(DecodeError::Transient(e.to_string())),
        None => Ok(None),
    }
}

/// Square crop centered in a `width x height` frame, side = ratio * shorter side.
/// None for an empty frame.
pub fn centered_square(width: u32, height: u32, ratio: f32) -> Option<(u32, u32, u32)> {
    let shorter = width.min(height);
    if shorter == 0 {
        return None;
    }
    let side = ((shorter as f32 * ratio).round() as u32).clamp(1, shorter);
    Some(((width - side) / 2, (height - side) / 2, side))
}

/// Reusable crop + downsample stage for the software strategy
pub struct CropResizer {
    crop_ratio: f32,
    resolution: u32,
    resizer: fr::Resizer,
    dst: fr::images::Image<'static>,
}

impl CropResizer {
    pub fn new(crop_ratio: f32, resolution: u32) -> Self {
        Self {
            crop_ratio,
            resolution,
            resizer: fr::Resizer::new(),
            dst: fr::images::Image::new(resolution, resolution, fr::PixelType::U8),
        }
    }

    pub fn resolution(&self) -> u32 {
        self.resolution
    }

    /// Crop the center of the frame and downsample it into the internal
    /// buffer, returning the `resolution x resolution` luma plane.
    pub fn process(&mut self, frame: &Frame) -> Result<&[u8], DecodeError> {
        let (left, top, side) = centered_square(frame.width, frame.height, self.crop_ratio)
            .ok_or_else(|| DecodeError::Transient(format!("empty {}x{} frame", frame.width, frame.height)))?;

        let src = fr::images::ImageRef::new(frame.width, frame.height, &frame.luma, fr::PixelType::U8)
            .map_err(|e| DecodeError::Transient(e.to_string()))?;

        let options = fr::ResizeOptions::new()
            .resize_alg(fr::ResizeAlg::Convolution(fr::FilterType::Bilinear))
            .crop(left as f64, top as f64, side as f64, side as f64);

        self.resizer
            .resize(&src, &mut self.dst, &options)
            .map_err(|e| DecodeError::Transient(e.to_string()))?;

        Ok(self.dst.buffer())
    }
}
