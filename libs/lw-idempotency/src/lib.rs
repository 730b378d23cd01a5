//! Idempotency Guard: atomic acquire of a fingerprint key, plus a
//! "processed" marker that once set is never written past, so a retried
//! job never re-executes a handler's outbound effects.

use std::sync::Arc;

use anyhow::{Context, Result};
use lw_kv::SharedKvStore;
use tracing::warn;

const EVENT_BY_IDEM_PREFIX: &str = "event_by_idem:";
const PROCESSED_PREFIX: &str = "processed:";

/// Outcome of [`IdempotencyGuard::try_acquire`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Acquisition {
    /// First sighting of this fingerprint; the caller owns it.
    Acquired,
    /// A prior caller already owns this fingerprint, staged as this event id.
    AlreadyHeld(String),
}

#[derive(Clone)]
pub struct IdempotencyConfig {
    pub ttl_secs: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self { ttl_secs: 90 * 24 * 3600 }
    }
}

impl IdempotencyConfig {
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Ok(raw) = std::env::var("IDEMPOTENCY_TTL_SECONDS") {
            if let Ok(parsed) = raw.parse::<u64>() {
                cfg.ttl_secs = parsed.max(1);
            }
        }
        cfg
    }
}

#[derive(Clone)]
pub struct IdempotencyGuard {
    store: SharedKvStore,
    ttl_secs: u64,
}

impl IdempotencyGuard {
    pub fn new(store: SharedKvStore, cfg: IdempotencyConfig) -> Self {
        Self {
            store,
            ttl_secs: cfg.ttl_secs,
        }
    }

    /// Atomically registers `key -> event_id`. Returns `AlreadyHeld` with
    /// the event id that won the race when another caller got there first.
    pub async fn try_acquire(&self, key: &str, event_id: &str) -> Result<Acquisition> {
        let kv_key = format!("{EVENT_BY_IDEM_PREFIX}{key}");
        let created = self
            .store
            .set_if_absent_with_ttl(&kv_key, event_id.as_bytes().to_vec(), self.ttl_secs)
            .await
            .with_context(|| format!("acquire idempotency key {key}"))?;
        if created {
            return Ok(Acquisition::Acquired);
        }
        let existing = self
            .store
            .get(&kv_key)
            .await
            .with_context(|| format!("read existing idempotency owner for {key}"))?
            .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
            .unwrap_or_else(|| event_id.to_string());
        warn!(idempotency_key = %key, existing_event_id = %existing, "duplicate fingerprint");
        metrics::counter!("idempotency_hit", "idempotency_key" => key.to_string()).increment(1);
        Ok(Acquisition::AlreadyHeld(existing))
    }

    pub async fn is_processed(&self, key: &str) -> Result<bool> {
        let kv_key = format!("{PROCESSED_PREFIX}{key}");
        Ok(self.store.get(&kv_key).await?.is_some())
    }

    /// Read-only peek at the current owner of a fingerprint, used by the
    /// debug endpoints. Does not acquire or create anything.
    pub async fn owner(&self, key: &str) -> Result<Option<String>> {
        let kv_key = format!("{EVENT_BY_IDEM_PREFIX}{key}");
        Ok(self.store.get(&kv_key).await?.map(|bytes| String::from_utf8_lossy(&bytes).into_owned()))
    }

    /// Marks `key` as processed. A handler must never perform an
    /// externally-observable write after this call returns.
    pub async fn mark_processed(&self, key: &str) -> Result<()> {
        let kv_key = format!("{PROCESSED_PREFIX}{key}");
        self.store
            .set_if_absent_with_ttl(&kv_key, b"1".to_vec(), self.ttl_secs)
            .await
            .with_context(|| format!("mark idempotency key {key} processed"))?;
        Ok(())
    }
}

pub type SharedIdempotencyGuard = Arc<IdempotencyGuard>;

#[cfg(test)]
mod tests {
    use super::*;
    use lw_kv::InMemoryKvStore;

    fn guard() -> IdempotencyGuard {
        IdempotencyGuard::new(Arc::new(InMemoryKvStore::new()), IdempotencyConfig { ttl_secs: 60 })
    }

    #[tokio::test]
    async fn first_acquire_wins_second_sees_existing_owner() {
        let g = guard();
        assert_eq!(g.try_acquire("k", "evt-1").await.unwrap(), Acquisition::Acquired);
        assert_eq!(
            g.try_acquire("k", "evt-2").await.unwrap(),
            Acquisition::AlreadyHeld("evt-1".to_string())
        );
    }

    #[tokio::test]
    async fn is_processed_false_until_marked() {
        let g = guard();
        assert!(!g.is_processed("k").await.unwrap());
        g.mark_processed("k").await.unwrap();
        assert!(g.is_processed("k").await.unwrap());
    }

    #[tokio::test]
    async fn acquire_and_processed_are_independent_keys() {
        let g = guard();
        g.try_acquire("k", "evt-1").await.unwrap();
        assert!(!g.is_processed("k").await.unwrap());
    }

    #[tokio::test]
    async fn owner_is_none_until_acquired_then_reflects_the_winner() {
        let g = guard();
        assert_eq!(g.owner("k").await.unwrap(), None);
        g.try_acquire("k", "evt-1").await.unwrap();
        g.try_acquire("k", "evt-2").await.unwrap();
        assert_eq!(g.owner("k").await.unwrap(), Some("evt-1".to_string()));
    }
}
