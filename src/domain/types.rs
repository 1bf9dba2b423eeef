//! Shared types for the check-in scanner

use crate::domain::directory::ParticipantRecord;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Instant;
use uuid::Uuid;

/// Newtype wrapper for scan session IDs (UUIDv7, time-sortable)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(transparent)]
pub struct SessionId(pub Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for SessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A single video frame as seen by the decode pipeline.
///
/// Only the luma plane is kept: both decode strategies binarize on
/// brightness, so colour is converted away at the capture boundary.
#[derive(Debug, Clone)]
pub struct Frame {
    /// Monotonic sequence number assigned by the capture thread
    pub seq: u64,
    pub width: u32,
    pub height: u32,
    /// 8-bit luma, row-major, exactly `width * height` bytes
    pub luma: Bytes,
    pub captured_at: Instant,
}

impl Frame {
    /// Build a frame from a luma buffer. Returns None if the buffer length
    /// does not match the dimensions.
    pub fn new(seq: u64, width: u32, height: u32, luma: impl Into<Bytes>) -> Option<Self> {
        let luma = luma.into();
        if width == 0 || height == 0 || luma.len() != (width as usize) * (height as usize) {
            return None;
        }
        Some(Self { seq, width, height, luma, captured_at: Instant::now() })
    }

    pub fn from_luma_image(seq: u64, image: image::GrayImage) -> Option<Self> {
        let (width, height) = image.dimensions();
        Self::new(seq, width, height, image.into_raw())
    }

    /// Uniform frame of a single grey level. None for a zero size.
    pub fn blank(seq: u64, width: u32, height: u32, level: u8) -> Option<Self> {
        Self::new(seq, width, height, vec![level; (width as usize) * (height as usize)])
    }

    #[cfg(test)]
    pub fn pixel(&self, x: u32, y: u32) -> u8 {
        self.luma[(y as usize) * (self.width as usize) + x as usize]
    }
}

/// Text payload extracted from a frame
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DecodedPayload {
    pub raw_value: String,
    pub decoded_at: DateTime<Utc>,
}

impl DecodedPayload {
    pub fn new(raw_value: impl Into<String>) -> Self {
        Self { raw_value: raw_value.into(), decoded_at: Utc::now() }
    }
}

/// Lifecycle status of a scan session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScanStatus {
    #[default]
    Idle,
    Scanning,
    Found,
    NotFound,
    Error,
}

impl ScanStatus {
    pub fn as_str(&self) -> &str {
        match self {
            ScanStatus::Idle => "idle",
            ScanStatus::Scanning => "scanning",
            ScanStatus::Found => "found",
            ScanStatus::NotFound => "not_found",
            ScanStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for ScanStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of resolving a decoded payload against the directory.
/// `record == None` means the code decoded but matched nobody.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MatchResult {
    pub participant_id: String,
    pub raw_value: String,
    pub record: Option<ParticipantRecord>,
}

impl MatchResult {
    #[inline]
    pub fn is_match(&self) -> bool {
        self.record.is_some()
    }
}

/// State change published to the presentation layer
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanUpdate {
    pub session_id: SessionId,
    pub status: ScanStatus,
    pub scan_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub match_result: Option<MatchResult>,
    /// Human-readable detail, set for camera errors
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub at: DateTime<Utc>,
}

impl ScanUpdate {
    pub fn new(session_id: SessionId, status: ScanStatus, scan_count: u64) -> Self {
        Self { session_id, status, scan_count, match_result: None, message: None, at: Utc::now() }
    }

    pub fn with_match(mut self, result: MatchResult) -> Self {
        self.match_result = Some(result);
        self
    }

    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_rejects_wrong_length() {
        assert!(Frame::new(0, 4, 4, vec![0u8; 15]).is_none());
        assert!(Frame::new(0, 0, 4, Vec::<u8>::new()).is_none());
        let frame = Frame::new(7, 4, 4, vec![9u8; 16]).unwrap();
        assert_eq!(frame.seq, 7);
        assert_eq!(frame.pixel(3, 3), 9);
    }

    #[test]
    fn test_blank_rejects_zero_size() {
        assert!(Frame::blank(0, 0, 480, 255).is_none());
        assert!(Frame::blank(0, 640, 0, 255).is_none());
        assert_eq!(Frame::blank(0, 2, 2, 7).unwrap().luma.len(), 4);
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&ScanStatus::NotFound).unwrap();
        assert_eq!(json, "\"not_found\"");
        assert_eq!(ScanStatus::NotFound.as_str(), "not_found");
    }

    #[test]
    fn test_update_json_omits_empty_fields() {
        let update = ScanUpdate::new(SessionId::new(), ScanStatus::Scanning, 3);
        let json = update.to_json();
        assert!(json.contains("\"status\":\"scanning\""));
        assert!(json.contains("\"scanCount\":3"));
        assert!(!json.contains("matchResult"));
        assert!(!json.contains("message"));
    }

    #[test]
    fn test_unmatched_result_serializes_null_record() {
        let result = MatchResult {
            participant_id: "PART-999".to_string(),
            raw_value: "PART-999".to_string(),
            record: None,
        };
        assert!(!result.is_match());
        let json = serde_json::to_string(&result).unwrap();
        assert!(json.contains("\"participantId\":\"PART-999\""));
        assert!(json.contains("\"record\":null"));
    }
}
