//! FIFO job queue over a JetStream work-queue stream. Job identity is the
//! idempotency key (`job_id == idempotency_key`), enforced by an in-flight
//! marker in the K/V store so a second enqueue for the same fingerprint
//! while the first is still outstanding is a no-op (spec §4.4).

use std::time::Duration;

use anyhow::{Context, Result};
use async_nats::{
    Client,
    jetstream::{
        Context as JsContext,
        consumer::{
            AckPolicy,
            push::{Config as PushConfig, Messages},
        },
        stream::{Config as StreamConfig, RetentionPolicy},
    },
};
use lw_kv::SharedKvStore;
use serde::{Deserialize, Serialize};

const STREAM_NAME: &str = "JOBS";
const SUBJECT: &str = "jobs.default";
const DELIVER_SUBJECT: &str = "deliver.jobs.default";
const CONSUMER_GROUP: &str = "workers";
/// Upper bound on how long a job may remain in-flight before its marker
/// expires and a duplicate enqueue would be accepted again. Generously
/// larger than the worst-case total retry window (60+120+240s).
const INFLIGHT_TTL_SECS: u64 = 3600;

/// Bounded retry schedule applied by the Job Runner to transient errors.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub intervals: Vec<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            intervals: vec![Duration::from_secs(60), Duration::from_secs(120), Duration::from_secs(240)],
        }
    }
}

impl RetryPolicy {
    /// `attempt` is the 1-based count of attempts made so far (after the
    /// Runner increments it). Returns the delay before the next attempt,
    /// or `None` once retries are exhausted and the job belongs in the
    /// failure sink.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.max_retries {
            return None;
        }
        self.intervals
            .get((attempt - 1) as usize)
            .or_else(|| self.intervals.last())
            .copied()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobEnvelope {
    pub job_id: String,
    pub event_id: String,
}

pub struct Queue {
    js: JsContext,
    kv: SharedKvStore,
}

impl Queue {
    pub async fn connect(client: Client, kv: SharedKvStore) -> Result<Self> {
        let js = async_nats::jetstream::new(client);
        ensure_stream(&js).await?;
        Ok(Self { js, kv })
    }

    fn inflight_key(job_id: &str) -> String {
        format!("queue:inflight:{job_id}")
    }

    /// Enqueues `event_id` under `job_id`. Returns `false` without
    /// publishing when a job with this id is already in flight.
    pub async fn enqueue(&self, job_id: &str, event_id: &str) -> Result<bool> {
        let created = self
            .kv
            .set_if_absent_with_ttl(&Self::inflight_key(job_id), event_id.as_bytes().to_vec(), INFLIGHT_TTL_SECS)
            .await
            .with_context(|| format!("set in-flight marker for job {job_id}"))?;
        if !created {
            return Ok(false);
        }
        let envelope = JobEnvelope {
            job_id: job_id.to_string(),
            event_id: event_id.to_string(),
        };
        let payload = serde_json::to_vec(&envelope).context("serialize job envelope")?;
        self.js
            .publish(SUBJECT, payload.into())
            .await
            .with_context(|| format!("publish job {job_id}"))?;
        Ok(true)
    }

    /// Clears the in-flight marker once a job reaches a terminal outcome
    /// (acked as processed/ignored, or moved to the failure sink).
    pub async fn clear_inflight(&self, job_id: &str) -> Result<()> {
        self.kv.delete(&Self::inflight_key(job_id)).await
    }

    pub async fn subscribe(&self, durable_name: &str) -> Result<Messages> {
        let stream = self.js.get_stream(STREAM_NAME).await.context("get JOBS stream")?;
        let consumer = stream
            .get_or_create_consumer(
                durable_name,
                PushConfig {
                    durable_name: Some(durable_name.to_string()),
                    deliver_subject: DELIVER_SUBJECT.to_string(),
                    deliver_group: Some(CONSUMER_GROUP.to_string()),
                    filter_subject: SUBJECT.to_string(),
                    ack_policy: AckPolicy::Explicit,
                    max_ack_pending: 256,
                    ..Default::default()
                },
            )
            .await
            .with_context(|| format!("ensure consumer {durable_name}"))?;
        consumer.messages().await.context("attach consumer message stream")
    }
}

async fn ensure_stream(js: &JsContext) -> Result<()> {
    let cfg = StreamConfig {
        name: STREAM_NAME.into(),
        subjects: vec![SUBJECT.to_string()],
        retention: RetentionPolicy::WorkQueue,
        max_messages: -1,
        max_messages_per_subject: -1,
        max_bytes: -1,
        description: Some("jobs staged by the ingress pipeline for background processing".into()),
        ..StreamConfig::default()
    };
    match js.get_stream(STREAM_NAME).await {
        Ok(_) => Ok(()),
        Err(_) => {
            js.create_stream(cfg).await.context("create JOBS stream")?;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retry_policy_returns_the_configured_interval_per_attempt() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.next_delay(1), Some(Duration::from_secs(60)));
        assert_eq!(policy.next_delay(2), Some(Duration::from_secs(120)));
        assert_eq!(policy.next_delay(3), Some(Duration::from_secs(240)));
    }

    #[test]
    fn retry_policy_exhausts_after_max_retries() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.next_delay(4), None);
        assert_eq!(policy.next_delay(0), None);
    }

    #[test]
    fn job_envelope_roundtrips_json() {
        let env = JobEnvelope {
            job_id: "calendar:booked:ext-1".into(),
            event_id: "evt-1".into(),
        };
        let raw = serde_json::to_vec(&env).unwrap();
        let back: JobEnvelope = serde_json::from_slice(&raw).unwrap();
        assert_eq!(back.job_id, env.job_id);
        assert_eq!(back.event_id, env.event_id);
    }
}
