//! Services - scan logic and state management
//!
//! - `decode` - Decode pipeline (detector and software strategies)
//! - `debouncer` - Scan lifecycle state machine and duplicate suppression
//! - `matcher` - Payload to participant resolution
//! - `session` - Per-camera-lifecycle scan loop
//! - `scanner` - Start/stop controller used by the binaries

pub mod debouncer;
pub mod decode;
pub mod matcher;
pub mod scanner;
pub mod session;

// Re-export commonly used types
pub use debouncer::{Admission, ScanDebouncer};
pub use decode::{BarcodeDetector, Capabilities, DecodeStrategy, RqrrDetector, StrategyKind};
pub use matcher::ParticipantMatcher;
pub use scanner::Scanner;
pub use session::{ScanSession, SessionCommand, SessionEnd, UpdatePublisher};
