//! Participant directory - the read-only set of records the matcher resolves against

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::warn;

/// A participant as exported by the check-in dashboard.
///
/// Only the identity fields are typed; check-in flags and any other
/// dashboard fields are carried opaquely in `extra`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", try_from = "DashboardRow")]
pub struct ParticipantRecord {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub team: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub institute: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Dashboard row as exported. Rows may carry a database `id`, a
/// `participantId`, or both; the participant id is the badge key.
#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DashboardRow {
    participant_id: Option<String>,
    id: Option<String>,
    name: String,
    #[serde(default)]
    email: String,
    #[serde(default)]
    phone: Option<String>,
    #[serde(default)]
    team: Option<String>,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    institute: Option<String>,
    #[serde(flatten)]
    extra: BTreeMap<String, serde_json::Value>,
}

impl TryFrom<DashboardRow> for ParticipantRecord {
    type Error = String;

    fn try_from(row: DashboardRow) -> Result<Self, Self::Error> {
        let id = row
            .participant_id
            .or(row.id)
            .ok_or_else(|| "missing field `participantId` or `id`".to_string())?;
        Ok(Self {
            id,
            name: row.name,
            email: row.email,
            phone: row.phone,
            team: row.team,
            role: row.role,
            institute: row.institute,
            extra: row.extra,
        })
    }
}

impl ParticipantRecord {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            email: String::new(),
            phone: None,
            team: None,
            role: None,
            institute: None,
            extra: BTreeMap::new(),
        }
    }
}

/// Participant records indexed by id
#[derive(Debug, Clone, Default)]
pub struct Directory {
    by_id: FxHashMap<String, ParticipantRecord>,
}

impl Directory {
    /// Build a directory from records. Blank ids are skipped and on
    /// duplicate ids the first record wins.
    pub fn from_records(records: impl IntoIterator<Item = ParticipantRecord>) -> Self {
        let mut by_id = FxHashMap::default();
        for mut record in records {
            let id = record.id.trim().to_string();
            if id.is_empty() {
                warn!(name = %record.name, "directory_record_without_id");
                continue;
            }
            if by_id.contains_key(&id) {
                warn!(participant_id = %id, "directory_duplicate_id");
                continue;
            }
            record.id.clone_from(&id);
            by_id.insert(id, record);
        }
        Self { by_id }
    }

    #[inline]
    pub fn get(&self, participant_id: &str) -> Option<&ParticipantRecord> {
        self.by_id.get(participant_id)
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

impl FromIterator<ParticipantRecord> for Directory {
    fn from_iter<I: IntoIterator<Item = ParticipantRecord>>(iter: I) -> Self {
        Self::from_records(iter)
    }
}
