//! Typed access to the external key-value store backing the Event Store,
//! the Idempotency Guard, the CRM token cache, and the Queue's in-flight
//! markers. Backed by NATS JetStream key-value buckets in production; an
//! in-memory implementation backs tests and local development without a
//! NATS server.

use std::{collections::HashMap, sync::Arc, time::Duration as StdDuration};

use anyhow::{Context, Result};
use async_nats::jetstream::{
    context::KeyValueErrorKind,
    kv::{self, CreateErrorKind},
    Context as JsContext,
};
use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::RwLock;
use tracing::instrument;

/// Single-key atomicity is the only transactional guarantee this store
/// offers; there is no multi-key transaction support, by design (spec
/// §4.1).
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Overwrites `key` unconditionally.
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()>;

    /// Atomically creates `key` only if absent, with a per-key TTL.
    /// Returns `true` when the key was created by this call, `false` when
    /// it already existed.
    async fn set_if_absent_with_ttl(&self, key: &str, value: Vec<u8>, ttl_secs: u64) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<()>;
}

pub type SharedKvStore = Arc<dyn KvStore>;

/// In-memory [`KvStore`] used in tests. TTLs are honored on read: an
/// expired entry reads back as absent and is lazily evicted.
#[derive(Clone, Default)]
pub struct InMemoryKvStore {
    inner: Arc<RwLock<HashMap<String, (Vec<u8>, Option<OffsetDateTime>)>>>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let mut guard = self.inner.write().await;
        match guard.get(key) {
            Some((_, Some(expires))) if *expires <= OffsetDateTime::now_utc() => {
                guard.remove(key);
                Ok(None)
            }
            Some((value, _)) => Ok(Some(value.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.inner.write().await.insert(key.to_string(), (value, None));
        Ok(())
    }

    async fn set_if_absent_with_ttl(&self, key: &str, value: Vec<u8>, ttl_secs: u64) -> Result<bool> {
        let now = OffsetDateTime::now_utc();
        let mut guard = self.inner.write().await;
        let expired = matches!(guard.get(key), Some((_, Some(exp))) if *exp <= now);
        if guard.contains_key(key) && !expired {
            return Ok(false);
        }
        let expires_at = now + time::Duration::seconds(ttl_secs.max(1) as i64);
        guard.insert(key.to_string(), (value, Some(expires_at)));
        Ok(true)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.inner.write().await.remove(key);
        Ok(())
    }
}

/// JetStream KV bucket-backed [`KvStore`].
pub struct NatsKvStore {
    bucket: kv::Store,
}

impl NatsKvStore {
    /// Ensures the named bucket exists, creating it with `default_ttl_secs`
    /// as its bucket-wide max age (0 = no expiry, matching the teacher's
    /// idempotency bucket configuration).
    pub async fn new(js: &JsContext, bucket_name: &str, default_ttl_secs: u64) -> Result<Self> {
        let bucket = match js.get_key_value(bucket_name).await {
            Ok(store) => store,
            Err(err) if err.kind() == KeyValueErrorKind::GetBucket => js
                .create_key_value(kv::Config {
                    bucket: bucket_name.to_string(),
                    history: 1,
                    max_age: StdDuration::from_secs(default_ttl_secs),
                    ..Default::default()
                })
                .await
                .with_context(|| format!("create JetStream KV bucket {bucket_name}"))?,
            Err(err) => anyhow::bail!("kv bucket init failed for {bucket_name}: {err}"),
        };
        Ok(Self { bucket })
    }
}

#[async_trait]
impl KvStore for NatsKvStore {
    #[instrument(name = "kv.get", skip(self, key), fields(key = %key))]
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let entry = self
            .bucket
            .get(key)
            .await
            .with_context(|| format!("get kv key {key}"))?;
        Ok(entry.map(|bytes| bytes.to_vec()))
    }

    #[instrument(name = "kv.set", skip(self, key, value), fields(key = %key))]
    async fn set(&self, key: &str, value: Vec<u8>) -> Result<()> {
        self.bucket
            .put(key, value.into())
            .await
            .with_context(|| format!("put kv key {key}"))?;
        Ok(())
    }

    #[instrument(name = "kv.set_if_absent_with_ttl", skip(self, key, value), fields(key = %key))]
    async fn set_if_absent_with_ttl(&self, key: &str, value: Vec<u8>, ttl_secs: u64) -> Result<bool> {
        let ttl = StdDuration::from_secs(ttl_secs.max(1));
        match self.bucket.create_with_ttl(key, value.into(), ttl).await {
            Ok(_) => Ok(true),
            Err(err) if err.kind() == CreateErrorKind::AlreadyExists => Ok(false),
            Err(err) => Err(anyhow::anyhow!(err).context(format!("create kv key {key} with ttl {ttl_secs}s"))),
        }
    }

    #[instrument(name = "kv.delete", skip(self, key), fields(key = %key))]
    async fn delete(&self, key: &str) -> Result<()> {
        self.bucket
            .delete(key)
            .await
            .with_context(|| format!("delete kv key {key}"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn in_memory_set_and_get_roundtrip() {
        let store = InMemoryKvStore::new();
        store.set("a", b"hello".to_vec()).await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), Some(b"hello".to_vec()));
    }

    #[tokio::test]
    async fn in_memory_set_if_absent_is_atomic_create() {
        let store = InMemoryKvStore::new();
        assert!(store.set_if_absent_with_ttl("k", b"1".to_vec(), 60).await.unwrap());
        assert!(!store.set_if_absent_with_ttl("k", b"2".to_vec(), 60).await.unwrap());
        assert_eq!(store.get("k").await.unwrap(), Some(b"1".to_vec()));
    }

    #[tokio::test]
    async fn in_memory_expired_key_reads_back_absent_and_is_recreatable() {
        let store = InMemoryKvStore::new();
        store.inner.write().await.insert(
            "expired".to_string(),
            (b"old".to_vec(), Some(OffsetDateTime::now_utc() - time::Duration::seconds(5))),
        );
        assert_eq!(store.get("expired").await.unwrap(), None);
        assert!(
            store
                .set_if_absent_with_ttl("expired", b"new".to_vec(), 60)
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn delete_removes_key() {
        let store = InMemoryKvStore::new();
        store.set("a", b"1".to_vec()).await.unwrap();
        store.delete("a").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);
    }
}
