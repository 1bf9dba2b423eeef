//! Participant directory loading
//!
//! The dashboard exports participants as a JSON array. The file is read once
//! before scanning starts; the scanner never writes it back.

use crate::domain::directory::{Directory, ParticipantRecord};
use anyhow::Context;
use std::path::Path;
use tracing::{info, warn};

/// Load a directory from a JSON array file.
///
/// Entries that are not valid participant records are skipped with a
/// warning so one bad row does not block check-in for everyone else.
pub fn load_directory<P: AsRef<Path>>(path: P) -> anyhow::Result<Directory> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read directory file {}", path.display()))?;
    let directory = parse_directory(&content)
        .with_context(|| format!("Failed to parse directory file {}", path.display()))?;

    info!(path = %path.display(), participants = %directory.len(), "directory_loaded");
    Ok(directory)
}

/// Parse a JSON array of participant records
pub fn parse_directory(json: &str) -> anyhow::Result<Directory> {
    let rows: Vec<serde_json::Value> =
        serde_json::from_str(json).context("expected a JSON array of participants")?;

    let mut records = Vec::with_capacity(rows.len());
    for (row, value) in rows.into_iter().enumerate() {
        match serde_json::from_value::<ParticipantRecord>(value) {
            Ok(record) => records.push(record),
            Err(e) => warn!(row = %row, error = %e, "directory_row_skipped"),
        }
    }
    Ok(Directory::from_records(records))
}
