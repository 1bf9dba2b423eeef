//! Scan update output - writes state changes as JSON lines
//!
//! Each `ScanUpdate` becomes one JSON object per line, which is what the
//! dashboard's presentation layer tails. Nothing is persisted here: the
//! writer is usually stdout.

use crate::domain::types::{ScanStatus, ScanUpdate};
use std::io::Write;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

/// JSON-lines writer for scan updates
pub struct JsonlSink<W: Write> {
    writer: W,
}

impl<W: Write> JsonlSink<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Write one update. Returns false if the writer failed.
    pub fn write_update(&mut self, update: &ScanUpdate) -> bool {
        log_update(update);
        match writeln!(self.writer, "{}", update.to_json()).and_then(|_| self.writer.flush()) {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "update_write_failed");
                false
            }
        }
    }

    /// Drain updates until the channel closes, then hand back the writer.
    /// Blocks on every write, so run it on a blocking thread.
    pub fn run(mut self, mut update_rx: mpsc::Receiver<ScanUpdate>) -> W {
        while let Some(update) = update_rx.blocking_recv() {
            self.write_update(&update);
        }
        self.writer
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

fn log_update(update: &ScanUpdate) {
    let participant_id = update.match_result.as_ref().map(|m| m.participant_id.as_str());
    let name = update
        .match_result
        .as_ref()
        .and_then(|m| m.record.as_ref())
        .map(|r| r.name.as_str());

    match update.status {
        ScanStatus::Found => info!(
            scan_count = %update.scan_count,
            participant_id = ?participant_id,
            name = ?name,
            "participant_found"
        ),
        ScanStatus::NotFound => info!(
            scan_count = %update.scan_count,
            participant_id = ?participant_id,
            "participant_not_found"
        ),
        ScanStatus::Error => warn!(message = ?update.message, "scanner_error"),
        status => info!(status = %status, "scanner_status"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::directory::ParticipantRecord;
    use crate::domain::types::{MatchResult, SessionId};

    #[test]
    fn test_writes_one_line_per_update() {
        let session = SessionId::new();
        let mut sink = JsonlSink::new(Vec::new());

        let found = ScanUpdate::new(session, ScanStatus::Found, 1).with_match(MatchResult {
            participant_id: "A1".to_string(),
            raw_value: "A1".to_string(),
            record: Some(ParticipantRecord::new("A1", "Alice")),
        });
        assert!(sink.write_update(&found));
        assert!(sink.write_update(&ScanUpdate::new(session, ScanStatus::Scanning, 1)));

        let output = String::from_utf8(sink.into_inner()).unwrap();
        let lines: Vec<&str> = output.lines().collect();
        assert_eq!(lines.len(), 2);

        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["status"], "found");
        assert_eq!(first["matchResult"]["record"]["name"], "Alice");
    }

    #[tokio::test]
    async fn test_run_drains_channel() {
        let (tx, rx) = mpsc::channel(8);
        let session = SessionId::new();
        tx.send(ScanUpdate::new(session, ScanStatus::Scanning, 0)).await.unwrap();
        tx.send(ScanUpdate::new(session, ScanStatus::Idle, 0)).await.unwrap();
        drop(tx);

        let output = tokio::task::spawn_blocking(move || JsonlSink::new(Vec::new()).run(rx))
            .await
            .unwrap();
        let output = String::from_utf8(output).unwrap();
        assert_eq!(output.lines().count(), 2);
        assert!(output.lines().last().unwrap().contains("\"status\":\"idle\""));
    }
}
