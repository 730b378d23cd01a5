use std::fmt;

use serde::{Deserialize, Serialize};

/// One of the five upstream webhook sources this core accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Source {
    Calendar,
    MeetingTranscript,
    SupportTag,
    SupportCompany,
    ManualEnrich,
}

impl fmt::Display for Source {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Source::Calendar => "calendar",
            Source::MeetingTranscript => "meeting_transcript",
            Source::SupportTag => "support_tag",
            Source::SupportCompany => "support_company",
            Source::ManualEnrich => "manual_enrich",
        };
        f.write_str(s)
    }
}

/// Fingerprint of a business event: `"{source}:{event_type}:{external_id}"`.
///
/// Two requests that resolve to the same `IdKey` are the same event no
/// matter how many times they are delivered.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdKey {
    pub source: Source,
    pub event_type: String,
    pub external_id: String,
}

impl IdKey {
    pub fn new(source: Source, event_type: impl Into<String>, external_id: impl Into<String>) -> Self {
        Self {
            source,
            event_type: event_type.into(),
            external_id: external_id.into(),
        }
    }
}

impl fmt::Display for IdKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.source, self.event_type, self.external_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_key_formats_as_colon_separated_triple() {
        let key = IdKey::new(Source::Calendar, "booked", "evt_123");
        assert_eq!(key.to_string(), "calendar:booked:evt_123");
    }

    #[test]
    fn source_display_matches_idempotency_key_segment() {
        assert_eq!(Source::MeetingTranscript.to_string(), "meeting_transcript");
        assert_eq!(Source::SupportCompany.to_string(), "support_company");
    }

    #[test]
    fn source_roundtrips_through_serde() {
        let raw = serde_json::to_string(&Source::SupportTag).unwrap();
        assert_eq!(raw, "\"support_tag\"");
        let back: Source = serde_json::from_str(&raw).unwrap();
        assert_eq!(back, Source::SupportTag);
    }
}
