//! Participant matcher - maps decoded payloads to directory entries
//!
//! Badges carry either the bare participant id or a check-in URL ending in
//! it. The id is the path segment right after the check-in prefix; anything
//! after it (further segments, query, fragment) is ignored.

use crate::domain::directory::Directory;
use crate::domain::types::MatchResult;
use crate::infra::config::Config;

const CHECKIN_SEGMENT: &str = "/checkin/";

#[derive(Debug, Clone, Default)]
pub struct ParticipantMatcher {
    /// Configured badge URL prefix; None accepts any http(s) check-in URL
    base_url: Option<String>,
}

impl ParticipantMatcher {
    pub fn new(base_url: Option<String>) -> Self {
        Self { base_url: base_url.filter(|url| !url.is_empty()) }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.checkin_base_url().map(str::to_string))
    }

    /// Participant id carried by a raw payload
    pub fn extract_participant_id<'a>(&self, raw_value: &'a str) -> &'a str {
        let value = raw_value.trim();
        let after_prefix = match &self.base_url {
            Some(base) => value.strip_prefix(base.as_str()),
            None => after_checkin_segment(value),
        };

        match after_prefix {
            Some(rest) => {
                let rest = rest.trim_start_matches('/');
                let end = rest.find(['/', '?', '#']).unwrap_or(rest.len());
                &rest[..end]
            }
            None => value,
        }
    }

    pub fn resolve(&self, raw_value: &str, directory: &Directory) -> MatchResult {
        let participant_id = self.extract_participant_id(raw_value);
        MatchResult {
            participant_id: participant_id.to_string(),
            raw_value: raw_value.to_string(),
            record: directory.get(participant_id).cloned(),
        }
    }
}

/// Remainder of an http(s) URL after its `/checkin/` segment
fn after_checkin_segment(value: &str) -> Option<&str> {
    let without_scheme = value
        .strip_prefix("https://")
        .or_else(|| value.strip_prefix("http://"))?;
    let at = without_scheme.find(CHECKIN_SEGMENT)?;
    Some(&without_scheme[at + CHECKIN_SEGMENT.len()..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::directory::ParticipantRecord;

    fn directory() -> Directory {
        Directory::from_records([
            ParticipantRecord::new("PART-001", "Ada"),
            ParticipantRecord::new("PART-002", "Grace"),
            ParticipantRecord::new("PART-003", "Linus"),
        ])
    }

    #[test]
    fn test_extracts_id_from_checkin_url() {
        let matcher = ParticipantMatcher::default();
        assert_eq!(matcher.extract_participant_id("https://checkin.example/checkin/PART-001"), "PART-001");
        assert_eq!(matcher.extract_participant_id("http://checkin.x/checkin/A1/extra"), "A1");
        assert_eq!(matcher.extract_participant_id("https://checkin.x/checkin/A1?src=badge"), "A1");
        assert_eq!(matcher.extract_participant_id("https://checkin.x/checkin/A1#top"), "A1");
    }

    #[test]
    fn test_bare_id_is_trimmed() {
        let matcher = ParticipantMatcher::default();
        assert_eq!(matcher.extract_participant_id("PART-001"), "PART-001");
        assert_eq!(matcher.extract_participant_id("  PART-001\n"), "PART-001");
    }

    #[test]
    fn test_other_urls_are_used_verbatim() {
        let matcher = ParticipantMatcher::default();
        assert_eq!(matcher.extract_participant_id("https://example.org/PART-001"), "https://example.org/PART-001");
        assert_eq!(matcher.extract_participant_id("ftp://x/checkin/A1"), "ftp://x/checkin/A1");
    }

    #[test]
    fn test_configured_prefix() {
        let matcher = ParticipantMatcher::new(Some("https://checkin.example/checkin/".to_string()));
        assert_eq!(matcher.extract_participant_id("https://checkin.example/checkin/PART-002/x"), "PART-002");
        // Only the configured origin counts
        assert_eq!(
            matcher.extract_participant_id("https://elsewhere.example/checkin/PART-002"),
            "https://elsewhere.example/checkin/PART-002"
        );

        let no_slash = ParticipantMatcher::new(Some("https://checkin.example/checkin".to_string()));
        assert_eq!(no_slash.extract_participant_id("https://checkin.example/checkin/PART-003"), "PART-003");
    }

    #[test]
    fn test_resolve_match() {
        let result = ParticipantMatcher::default()
            .resolve("https://checkin.example/checkin/PART-001", &directory());
        assert!(result.is_match());
        assert_eq!(result.participant_id, "PART-001");
        assert_eq!(result.raw_value, "https://checkin.example/checkin/PART-001");
        assert_eq!(result.record.unwrap().name, "Ada");
    }

    #[test]
    fn test_resolve_unknown_id() {
        let result = ParticipantMatcher::default().resolve("PART-999", &directory());
        assert!(!result.is_match());
        assert_eq!(result.participant_id, "PART-999");
        assert!(result.record.is_none());
    }

    #[test]
    fn test_lookup_is_case_sensitive() {
        let result = ParticipantMatcher::default().resolve("part-001", &directory());
        assert!(!result.is_match());
    }
}
