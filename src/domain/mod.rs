//! Domain models - core scanner types
//!
//! This module contains the canonical data types used throughout the system:
//! - `Frame` - luma frame handed from capture to decode
//! - `DecodedPayload` - text extracted from a frame
//! - `ScanStatus` / `ScanUpdate` - session lifecycle as seen by the presentation layer
//! - `Directory` / `ParticipantRecord` - the read-only participant set

pub mod directory;
pub mod types;

pub use directory::{Directory, ParticipantRecord};
pub use types::{DecodedPayload, Frame, MatchResult, ScanStatus, ScanUpdate, SessionId};
