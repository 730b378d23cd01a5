//! The Staging Pipeline: store the event, acquire its idempotency
//! fingerprint, and enqueue it — or discover a duplicate and discard the
//! event it just wrote.

use std::sync::Arc;

use axum::Json;
use axum::http::StatusCode;
use lw_core::Source;
use lw_idempotency::Acquisition;
use serde_json::{Value, json};

use crate::AppState;

pub type StageResult = Result<(StatusCode, Json<Value>), (StatusCode, Json<Value>)>;

fn error(status: StatusCode, detail: impl Into<String>) -> (StatusCode, Json<Value>) {
    (status, Json(json!({"detail": detail.into()})))
}

/// Stores the event, acquires its idempotency fingerprint, and either
/// reports the duplicate or enqueues it. Any store/queue failure here is
/// the caller's responsibility to retry; no handler side effect has run
/// yet, so retrying is always safe.
pub async fn stage(
    state: &Arc<AppState>,
    source: Source,
    event_type: &str,
    external_id: &str,
    idempotency_key: &str,
    payload: Vec<u8>,
) -> StageResult {
    let ev = state
        .event_store
        .store(source, event_type, external_id, idempotency_key, payload)
        .await
        .map_err(|err| error(StatusCode::INTERNAL_SERVER_ERROR, format!("failed to stage event: {err}")))?;

    let acquisition = state
        .idempotency
        .try_acquire(idempotency_key, &ev.event_id)
        .await
        .map_err(|err| error(StatusCode::INTERNAL_SERVER_ERROR, format!("failed to acquire idempotency key: {err}")))?;

    match acquisition {
        Acquisition::AlreadyHeld(existing_event_id) => {
            if let Err(err) = state.event_store.delete(&ev.event_id).await {
                tracing::warn!(event_id = %ev.event_id, error = %err, "failed to delete superseded duplicate event");
            }
            Ok((StatusCode::OK, Json(json!({"ok": true, "duplicate": true, "event_id": existing_event_id}))))
        }
        Acquisition::Acquired => {
            let enqueued = state
                .queue
                .enqueue(idempotency_key, &ev.event_id)
                .await
                .map_err(|err| error(StatusCode::INTERNAL_SERVER_ERROR, format!("failed to enqueue job: {err}")))?;
            if !enqueued {
                // a job for this fingerprint is already in flight; the
                // newly staged event is redundant with it.
                if let Err(err) = state.event_store.delete(&ev.event_id).await {
                    tracing::warn!(event_id = %ev.event_id, error = %err, "failed to delete redundant in-flight event");
                }
                return Ok((StatusCode::OK, Json(json!({"ok": true, "duplicate": true, "event_id": ev.event_id}))));
            }
            Ok((
                StatusCode::OK,
                Json(json!({"ok": true, "queued": true, "event_id": ev.event_id, "idempotency_key": idempotency_key})),
            ))
        }
    }
}
