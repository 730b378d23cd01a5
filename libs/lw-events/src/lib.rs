//! Event Store: durable staging for incoming webhooks. Each event is a
//! single JSON record under one key, read-modify-written under the
//! K/V store's single-key atomicity guarantee (spec §4.1/§4.2).

use anyhow::{Context, Result, bail};
use lw_core::{Event, EventStatus, Source};
use lw_kv::SharedKvStore;
use time::OffsetDateTime;

const EVENT_PREFIX: &str = "event:";

#[derive(Clone)]
pub struct EventStoreConfig {
    pub ttl_secs: u64,
}

impl Default for EventStoreConfig {
    fn default() -> Self {
        Self { ttl_secs: 30 * 24 * 3600 }
    }
}

impl EventStoreConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(raw) = std::env::var("EVENT_TTL_SECONDS") {
            if let Ok(parsed) = raw.parse::<u64>() {
                cfg.ttl_secs = parsed.max(1);
            }
        }
        cfg
    }
}

#[derive(Clone)]
pub struct EventStore {
    kv: SharedKvStore,
    ttl_secs: u64,
}

impl EventStore {
    pub fn new(kv: SharedKvStore, cfg: EventStoreConfig) -> Self {
        Self { kv, ttl_secs: cfg.ttl_secs }
    }

    fn key(event_id: &str) -> String {
        format!("{EVENT_PREFIX}{event_id}")
    }

    /// Stages a fresh event with a server-generated id and
    /// `status = Queued, attempts = 0`.
    pub async fn store(
        &self,
        source: Source,
        event_type: impl Into<String>,
        external_id: impl Into<String>,
        idempotency_key: impl Into<String>,
        payload: Vec<u8>,
    ) -> Result<Event> {
        let event = Event::new(
            source,
            event_type,
            external_id,
            idempotency_key,
            payload,
            OffsetDateTime::now_utc(),
        );
        let key = Self::key(&event.event_id);
        let raw = serde_json::to_vec(&event).context("serialize event record")?;
        // the record's own TTL is applied via set_if_absent_with_ttl so a
        // fresh event_id (always unique) never races a prior write.
        self.kv
            .set_if_absent_with_ttl(&key, raw, self.ttl_secs)
            .await
            .with_context(|| format!("store event {}", event.event_id))?;
        Ok(event)
    }

    pub async fn load(&self, event_id: &str) -> Result<Option<Event>> {
        let raw = self.kv.get(&Self::key(event_id)).await?;
        match raw {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes).context("deserialize event record")?)),
            None => Ok(None),
        }
    }

    /// Read-modify-write: loads the current record, applies the requested
    /// fields, and writes the whole record back under the same key.
    pub async fn set_status(
        &self,
        event_id: &str,
        status: EventStatus,
        attempts: Option<u32>,
        last_error: Option<String>,
    ) -> Result<Event> {
        let mut event = self
            .load(event_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("event {event_id} not found"))?;
        if event.is_terminal() && status != event.status {
            bail!("cannot transition terminal event {event_id} from {:?} to {:?}", event.status, status);
        }
        event.status = status;
        if let Some(attempts) = attempts {
            event.attempts = attempts;
        }
        if last_error.is_some() {
            event.last_error = last_error;
        }
        event.updated_at = OffsetDateTime::now_utc();
        let raw = serde_json::to_vec(&event).context("serialize event record")?;
        self.kv.set(&Self::key(event_id), raw).await?;
        Ok(event)
    }

    pub async fn delete(&self, event_id: &str) -> Result<()> {
        self.kv.delete(&Self::key(event_id)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lw_kv::InMemoryKvStore;
    use std::sync::Arc;

    fn store() -> EventStore {
        EventStore::new(Arc::new(InMemoryKvStore::new()), EventStoreConfig { ttl_secs: 3600 })
    }

    #[tokio::test]
    async fn store_then_load_roundtrips() {
        let s = store();
        let ev = s
            .store(Source::Calendar, "booked", "ext-1", "calendar:booked:ext-1", b"{}".to_vec())
            .await
            .unwrap();
        let loaded = s.load(&ev.event_id).await.unwrap().unwrap();
        assert_eq!(loaded.event_id, ev.event_id);
        assert_eq!(loaded.status, EventStatus::Queued);
    }

    #[tokio::test]
    async fn set_status_preserves_other_fields() {
        let s = store();
        let ev = s
            .store(Source::Calendar, "booked", "ext-1", "k", b"{}".to_vec())
            .await
            .unwrap();
        let updated = s
            .set_status(&ev.event_id, EventStatus::Processing, Some(1), None)
            .await
            .unwrap();
        assert_eq!(updated.status, EventStatus::Processing);
        assert_eq!(updated.attempts, 1);
        assert_eq!(updated.external_id, "ext-1");
    }

    #[tokio::test]
    async fn terminal_status_cannot_be_overwritten_to_a_different_status() {
        let s = store();
        let ev = s.store(Source::Calendar, "booked", "e", "k", vec![]).await.unwrap();
        s.set_status(&ev.event_id, EventStatus::Failed, None, Some("boom".into()))
            .await
            .unwrap();
        let err = s
            .set_status(&ev.event_id, EventStatus::Processing, None, None)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("terminal"));
    }

    #[tokio::test]
    async fn load_missing_event_returns_none() {
        let s = store();
        assert!(s.load("does-not-exist").await.unwrap().is_none());
    }
}
