//! Failure sink for the Queue: jobs that exhaust retries or hit a
//! permanent error are published here for operator inspection and
//! replay, rather than dropped.

use anyhow::{Context, Result};
use async_nats::{
    Client,
    jetstream::{
        Context as JsContext,
        consumer::{AckPolicy, DeliverPolicy, pull::Config as PullConfig},
        stream::{Config as StreamConfig, RetentionPolicy},
    },
};
use futures::TryStreamExt;
use lw_core::Source;
use serde::{Deserialize, Serialize};
use time::{OffsetDateTime, format_description::well_known::Rfc3339};
use tracing::info;

const DLQ_ENABLED_ENV: &str = "DLQ_ENABLED";
const DLQ_STREAM_NAME: &str = "JOBS_DLQ";
const DLQ_SUBJECT: &str = "jobs.dlq";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqError {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqRecord {
    pub event_id: String,
    pub idempotency_key: String,
    pub source: Source,
    pub event_type: String,
    pub attempts: u32,
    pub ts: String,
    pub error: DlqError,
}

#[derive(Clone)]
pub struct DlqPublisher {
    js: JsContext,
    enabled: bool,
}

impl DlqPublisher {
    pub async fn new(client: Client) -> Result<Self> {
        let enabled = std::env::var(DLQ_ENABLED_ENV)
            .map(|v| v.eq_ignore_ascii_case("true"))
            .unwrap_or(true);
        let js = async_nats::jetstream::new(client);
        ensure_stream(&js).await?;
        Ok(Self { js, enabled })
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub async fn publish(
        &self,
        event_id: &str,
        idempotency_key: &str,
        source: Source,
        event_type: &str,
        attempts: u32,
        error: DlqError,
    ) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        let ts = OffsetDateTime::now_utc()
            .format(&Rfc3339)
            .unwrap_or_else(|_| "1970-01-01T00:00:00Z".into());
        let record = DlqRecord {
            event_id: event_id.to_string(),
            idempotency_key: idempotency_key.to_string(),
            source,
            event_type: event_type.to_string(),
            attempts,
            ts,
            error,
        };
        let payload = serde_json::to_vec(&record)?;
        self.js
            .publish(DLQ_SUBJECT, payload.into())
            .await
            .context("publish failure-sink entry")?;
        metrics::counter!("dlq_published", "code" => record.error.code.clone()).increment(1);
        info!(
            event_id = %record.event_id,
            idempotency_key = %record.idempotency_key,
            code = %record.error.code,
            "job moved to failure sink"
        );
        Ok(())
    }
}

async fn ensure_stream(js: &JsContext) -> Result<()> {
    let cfg = StreamConfig {
        name: DLQ_STREAM_NAME.into(),
        subjects: vec![DLQ_SUBJECT.to_string()],
        retention: RetentionPolicy::WorkQueue,
        max_messages_per_subject: -1,
        max_messages: -1,
        max_bytes: -1,
        description: Some("failure sink for jobs that exhausted retries or hit a permanent error".into()),
        ..StreamConfig::default()
    };
    match js.get_stream(DLQ_STREAM_NAME).await {
        Ok(_) => Ok(()),
        Err(_) => {
            js.create_stream(cfg).await.context("create failure-sink stream")?;
            Ok(())
        }
    }
}

#[derive(Debug, Clone)]
pub struct DlqEntry {
    pub record: DlqRecord,
    pub sequence: u64,
}

/// Lists failure-sink entries for operator inspection via the debug
/// endpoints.
pub async fn list_entries(client: &Client, limit: usize) -> Result<Vec<DlqEntry>> {
    let js = async_nats::jetstream::new(client.clone());
    ensure_stream(&js).await?;
    let stream = js.get_stream(DLQ_STREAM_NAME).await?;
    let consumer = stream
        .create_consumer(PullConfig {
            deliver_policy: DeliverPolicy::All,
            ack_policy: AckPolicy::None,
            filter_subject: DLQ_SUBJECT.to_string(),
            ..Default::default()
        })
        .await?;
    let mut messages = consumer.fetch().max_messages(limit).messages().await?;
    let mut out = Vec::new();
    while let Some(msg) = messages.try_next().await.map_err(|e| anyhow::anyhow!(e))? {
        if let Ok(record) = serde_json::from_slice::<DlqRecord>(&msg.payload) {
            out.push(DlqEntry {
                sequence: msg.info().map(|info| info.stream_sequence).unwrap_or(0),
                record,
            });
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_roundtrips_json() {
        let record = DlqRecord {
            event_id: "evt-1".into(),
            idempotency_key: "calendar:booked:ext-1".into(),
            source: Source::Calendar,
            event_type: "booked".into(),
            attempts: 3,
            ts: "2024-01-01T00:00:00Z".into(),
            error: DlqError {
                code: "crm_upsert".into(),
                message: "404 not found".into(),
            },
        };
        let raw = serde_json::to_string(&record).unwrap();
        let parsed: DlqRecord = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.event_id, "evt-1");
        assert_eq!(parsed.error.code, "crm_upsert");
    }
}
