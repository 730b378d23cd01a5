use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::source::Source;

/// Lifecycle status of a staged [`Event`]. Transitions are monotonic along
/// `Queued -> Processing -> {Processed, Ignored, Failed}`; `Failed` is
/// terminal and the Job Runner never resurrects it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventStatus {
    Queued,
    Processing,
    Processed,
    Ignored,
    Failed,
}

/// A durably staged record of one incoming webhook, keyed by a
/// server-generated `event_id`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub event_id: String,
    pub source: Source,
    pub event_type: String,
    pub external_id: String,
    pub idempotency_key: String,
    pub status: EventStatus,
    pub attempts: u32,
    pub last_error: Option<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub created_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339")]
    pub updated_at: OffsetDateTime,
    pub payload: Vec<u8>,
}

impl Event {
    /// Builds a freshly staged event with a new server-assigned id and
    /// `status = Queued, attempts = 0`.
    pub fn new(
        source: Source,
        event_type: impl Into<String>,
        external_id: impl Into<String>,
        idempotency_key: impl Into<String>,
        payload: Vec<u8>,
        now: OffsetDateTime,
    ) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            source,
            event_type: event_type.into(),
            external_id: external_id.into(),
            idempotency_key: idempotency_key.into(),
            status: EventStatus::Queued,
            attempts: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
            payload,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self.status,
            EventStatus::Processed | EventStatus::Ignored | EventStatus::Failed
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_event_starts_queued_with_zero_attempts() {
        let now = OffsetDateTime::now_utc();
        let ev = Event::new(
            Source::Calendar,
            "booked",
            "ext-1",
            "calendar:booked:ext-1",
            b"{}".to_vec(),
            now,
        );
        assert_eq!(ev.status, EventStatus::Queued);
        assert_eq!(ev.attempts, 0);
        assert!(!ev.is_terminal());
    }

    #[test]
    fn processed_ignored_and_failed_are_terminal() {
        let now = OffsetDateTime::now_utc();
        let mut ev = Event::new(Source::Calendar, "booked", "e", "k", vec![], now);
        for status in [EventStatus::Processed, EventStatus::Ignored, EventStatus::Failed] {
            ev.status = status;
            assert!(ev.is_terminal());
        }
        ev.status = EventStatus::Processing;
        assert!(!ev.is_terminal());
    }

    #[test]
    fn event_roundtrips_through_json() {
        let now = OffsetDateTime::now_utc();
        let ev = Event::new(Source::SupportTag, "tag_added", "c-1", "k", vec![1, 2, 3], now);
        let raw = serde_json::to_string(&ev).unwrap();
        let back: Event = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.event_id, ev.event_id);
        assert_eq!(back.payload, vec![1, 2, 3]);
    }
}
