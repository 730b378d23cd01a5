use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use lw_core::{PipelineError, Source};
use serde_json::{Value, json};

use crate::staging::{StageResult, stage};
use crate::AppState;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/webhooks/calendar", post(calendar))
        .route("/webhooks/meetings", post(meetings))
        .route("/webhooks/support", post(support))
        .route("/enrich/lead", post(enrich_lead))
        .route("/healthz", get(healthz))
        .route("/debug/events/{event_id}", get(debug_event))
        .route("/debug/idem/{key}", get(debug_idem))
        .route("/debug/status", get(debug_status))
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

fn bad_request(detail: impl Into<String>) -> (StatusCode, Json<Value>) {
    (StatusCode::BAD_REQUEST, Json(json!({"detail": detail.into()})))
}

fn unauthorized() -> (StatusCode, Json<Value>) {
    (StatusCode::UNAUTHORIZED, Json(json!({"detail": "signature verification failed"})))
}

fn ignored(reason: &str) -> StageResult {
    Ok((StatusCode::OK, Json(json!({"ok": true, "ignored": true, "reason": reason}))))
}

fn str_field<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}

/// What a route handler should do with a parsed body, decided without any
/// I/O so the per-source filtering rules can be unit-tested directly.
#[derive(Debug, PartialEq, Eq)]
enum RouteDecision {
    Ignored(&'static str),
    Proceed { event_type: String, external_id: String, idempotency_key: String },
}

fn decide_calendar(value: &Value) -> Result<RouteDecision, &'static str> {
    let event_type = str_field(value, "event_type").ok_or("missing event_type")?;
    if !lw_handlers::recognized_event_types(Source::Calendar).contains(&event_type) {
        return Ok(RouteDecision::Ignored("unknown_event_type"));
    }
    let external_id = str_field(value, "external_id").ok_or("missing external_id")?.to_string();
    let idempotency_key = format!("calendar:{event_type}:{external_id}");
    Ok(RouteDecision::Proceed { event_type: event_type.to_string(), external_id, idempotency_key })
}

fn decide_meeting(value: &Value, min_duration_minutes: u32) -> Result<RouteDecision, &'static str> {
    let event_type = "completed";
    let external_id = str_field(value, "external_id").ok_or("missing external_id")?.to_string();
    let duration_minutes = value.get("duration_minutes").and_then(Value::as_u64).unwrap_or(0);
    if duration_minutes < min_duration_minutes as u64 {
        return Ok(RouteDecision::Ignored("too_short"));
    }
    let idempotency_key = format!("meeting_transcript:{event_type}:{external_id}");
    Ok(RouteDecision::Proceed { event_type: event_type.to_string(), external_id, idempotency_key })
}

fn decide_support(value: &Value, qualifying_tags: &std::collections::HashSet<String>) -> Result<RouteDecision, &'static str> {
    let topic = str_field(value, "topic").ok_or("missing topic")?;
    let is_tag_topic = lw_handlers::recognized_event_types(Source::SupportTag).contains(&topic);
    let is_company_topic = lw_handlers::recognized_event_types(Source::SupportCompany).contains(&topic);
    match topic {
        _ if is_tag_topic => {
            let company_id = str_field(value, "company_id").ok_or("missing company_id")?;
            let tag = str_field(value, "tag").ok_or("missing tag")?;
            if !qualifying_tags.is_empty() && !qualifying_tags.contains(tag) {
                return Ok(RouteDecision::Ignored("tag_not_qualifying"));
            }
            let external_id = format!("{company_id}:{tag}");
            let idempotency_key = format!("support_tag:tag_added:{external_id}");
            Ok(RouteDecision::Proceed { event_type: "tag_added".to_string(), external_id, idempotency_key })
        }
        _ if is_company_topic => {
            let company_id = str_field(value, "company_id").ok_or("missing company_id")?.to_string();
            let idempotency_key = format!("support_company:company_updated:{company_id}");
            Ok(RouteDecision::Proceed { event_type: "company_updated".to_string(), external_id: company_id, idempotency_key })
        }
        _ => Ok(RouteDecision::Ignored("unknown_event_type")),
    }
}

fn decide_enrich(value: &Value) -> Result<RouteDecision, &'static str> {
    let email = str_field(value, "email").ok_or("missing email")?.to_string();
    let idempotency_key = format!("manual_enrich:enrich_request:{email}");
    Ok(RouteDecision::Proceed { event_type: "enrich_request".to_string(), external_id: email, idempotency_key })
}

fn verify_or_401(
    verifier: &dyn lw_security::SignatureVerifier,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<(), (StatusCode, Json<Value>)> {
    verifier.verify(headers, body).map_err(|_: PipelineError| unauthorized())
}

async fn calendar(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> StageResult {
    verify_or_401(state.verifiers.calendar.as_ref(), &headers, &body)?;
    let value: Value = serde_json::from_slice(&body).map_err(|e| bad_request(format!("malformed JSON body: {e}")))?;
    match decide_calendar(&value).map_err(bad_request)? {
        RouteDecision::Ignored(reason) => ignored(reason),
        RouteDecision::Proceed { event_type, external_id, idempotency_key } => {
            stage(&state, Source::Calendar, &event_type, &external_id, &idempotency_key, body.to_vec()).await
        }
    }
}

async fn meetings(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> StageResult {
    verify_or_401(state.verifiers.meeting.as_ref(), &headers, &body)?;
    let value: Value = serde_json::from_slice(&body).map_err(|e| bad_request(format!("malformed JSON body: {e}")))?;
    match decide_meeting(&value, state.config.min_duration_minutes).map_err(bad_request)? {
        RouteDecision::Ignored(reason) => ignored(reason),
        RouteDecision::Proceed { event_type, external_id, idempotency_key } => {
            stage(&state, Source::MeetingTranscript, &event_type, &external_id, &idempotency_key, body.to_vec()).await
        }
    }
}

async fn support(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> StageResult {
    verify_or_401(state.verifiers.support.as_ref(), &headers, &body)?;
    let value: Value = serde_json::from_slice(&body).map_err(|e| bad_request(format!("malformed JSON body: {e}")))?;
    match decide_support(&value, &state.config.qualifying_tags).map_err(bad_request)? {
        RouteDecision::Ignored(reason) => ignored(reason),
        RouteDecision::Proceed { event_type, external_id, idempotency_key } => {
            let source = if event_type == "tag_added" { Source::SupportTag } else { Source::SupportCompany };
            stage(&state, source, &event_type, &external_id, &idempotency_key, body.to_vec()).await
        }
    }
}

async fn enrich_lead(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> StageResult {
    verify_or_401(state.verifiers.enrich.as_ref(), &headers, &body)?;
    let value: Value = serde_json::from_slice(&body).map_err(|e| bad_request(format!("malformed JSON body: {e}")))?;
    match decide_enrich(&value).map_err(bad_request)? {
        RouteDecision::Ignored(reason) => ignored(reason),
        RouteDecision::Proceed { event_type, external_id, idempotency_key } => {
            stage(&state, Source::ManualEnrich, &event_type, &external_id, &idempotency_key, body.to_vec()).await
        }
    }
}

async fn debug_event(State(state): State<Arc<AppState>>, Path(event_id): Path<String>) -> (StatusCode, Json<Value>) {
    if !state.config.allow_debug_endpoints {
        return (StatusCode::NOT_FOUND, Json(json!({"detail": "not found"})));
    }
    match state.event_store.load(&event_id).await {
        Ok(Some(ev)) => (StatusCode::OK, Json(serde_json::to_value(ev).unwrap_or_default())),
        Ok(None) => (StatusCode::NOT_FOUND, Json(json!({"detail": "event not found"}))),
        Err(err) => (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"detail": err.to_string()}))),
    }
}

async fn debug_idem(State(state): State<Arc<AppState>>, Path(key): Path<String>) -> (StatusCode, Json<Value>) {
    if !state.config.allow_debug_endpoints {
        return (StatusCode::NOT_FOUND, Json(json!({"detail": "not found"})));
    }
    let owner = state.idempotency.owner(&key).await.unwrap_or(None);
    let processed = state.idempotency.is_processed(&key).await.unwrap_or(false);
    (StatusCode::OK, Json(json!({"key": key, "owner_event_id": owner, "processed": processed})))
}

async fn debug_status(State(state): State<Arc<AppState>>) -> (StatusCode, Json<Value>) {
    if !state.config.allow_debug_endpoints {
        return (StatusCode::NOT_FOUND, Json(json!({"detail": "not found"})));
    }
    let js = async_nats::jetstream::new(state.nats.clone());
    let queued = match js.get_stream("JOBS").await {
        Ok(mut stream) => stream.info().await.map(|info| info.state.messages).unwrap_or(0),
        Err(_) => 0,
    };
    let failures = lw_dlq::list_entries(&state.nats, 20).await.unwrap_or_default();
    (
        StatusCode::OK,
        Json(json!({
            "queued": queued,
            "failed": failures.len(),
            "recent_failures": failures.into_iter().map(|e| e.record).collect::<Vec<_>>(),
        })),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn proceed(decision: RouteDecision) -> (String, String, String) {
        match decision {
            RouteDecision::Proceed { event_type, external_id, idempotency_key } => (event_type, external_id, idempotency_key),
            RouteDecision::Ignored(reason) => panic!("expected proceed, got ignored({reason})"),
        }
    }

    #[test]
    fn calendar_booked_proceeds_with_composed_idempotency_key() {
        let body = json!({"event_type": "booked", "external_id": "cal-1"});
        let (event_type, external_id, key) = proceed(decide_calendar(&body).unwrap());
        assert_eq!(event_type, "booked");
        assert_eq!(external_id, "cal-1");
        assert_eq!(key, "calendar:booked:cal-1");
    }

    #[test]
    fn calendar_unknown_event_type_is_ignored() {
        let body = json!({"event_type": "deleted", "external_id": "cal-1"});
        assert!(matches!(decide_calendar(&body), Ok(RouteDecision::Ignored("unknown_event_type"))));
    }

    #[test]
    fn calendar_missing_external_id_is_a_bad_request() {
        let body = json!({"event_type": "booked"});
        assert_eq!(decide_calendar(&body), Err("missing external_id"));
    }

    #[test]
    fn meeting_below_minimum_duration_is_ignored() {
        let body = json!({"external_id": "mt-1", "duration_minutes": 2});
        assert!(matches!(decide_meeting(&body, 5), Ok(RouteDecision::Ignored("too_short"))));
    }

    #[test]
    fn meeting_meeting_minimum_duration_proceeds() {
        let body = json!({"external_id": "mt-1", "duration_minutes": 5});
        let (_, _, key) = proceed(decide_meeting(&body, 5).unwrap());
        assert_eq!(key, "meeting_transcript:completed:mt-1");
    }

    #[test]
    fn support_tag_added_outside_qualifying_set_is_ignored() {
        let body = json!({"topic": "tag_added", "company_id": "co-1", "tag": "trial"});
        let mut tags = HashSet::new();
        tags.insert("enterprise".to_string());
        assert!(matches!(decide_support(&body, &tags), Ok(RouteDecision::Ignored("tag_not_qualifying"))));
    }

    #[test]
    fn support_tag_added_with_no_configured_tags_always_qualifies() {
        let body = json!({"topic": "tag_added", "company_id": "co-1", "tag": "trial"});
        let (_, external_id, key) = proceed(decide_support(&body, &HashSet::new()).unwrap());
        assert_eq!(external_id, "co-1:trial");
        assert_eq!(key, "support_tag:tag_added:co-1:trial");
    }

    #[test]
    fn support_company_updated_keys_on_company_id_alone() {
        let body = json!({"topic": "company_updated", "company_id": "co-1"});
        let (event_type, external_id, key) = proceed(decide_support(&body, &HashSet::new()).unwrap());
        assert_eq!(event_type, "company_updated");
        assert_eq!(external_id, "co-1");
        assert_eq!(key, "support_company:company_updated:co-1");
    }

    #[test]
    fn support_unknown_topic_is_ignored() {
        let body = json!({"topic": "ticket_closed"});
        assert!(matches!(decide_support(&body, &HashSet::new()), Ok(RouteDecision::Ignored("unknown_event_type"))));
    }

    #[test]
    fn enrich_keys_idempotency_on_email() {
        let body = json!({"email": "lead@example.com"});
        let (event_type, external_id, key) = proceed(decide_enrich(&body).unwrap());
        assert_eq!(event_type, "enrich_request");
        assert_eq!(external_id, "lead@example.com");
        assert_eq!(key, "manual_enrich:enrich_request:lead@example.com");
    }

    #[test]
    fn enrich_missing_email_is_a_bad_request() {
        let body = json!({});
        assert_eq!(decide_enrich(&body), Err("missing email"));
    }

    #[test]
    fn calendar_accepts_every_type_lw_handlers_recognizes() {
        for event_type in lw_handlers::recognized_event_types(Source::Calendar) {
            let body = json!({"event_type": event_type, "external_id": "cal-1"});
            assert!(matches!(decide_calendar(&body), Ok(RouteDecision::Proceed { .. })), "{event_type} should proceed");
        }
    }

    #[test]
    fn support_accepts_every_topic_lw_handlers_recognizes_for_both_sources() {
        for event_type in lw_handlers::recognized_event_types(Source::SupportTag) {
            let body = json!({"topic": event_type, "company_id": "co-1", "tag": "t"});
            assert!(matches!(decide_support(&body, &HashSet::new()), Ok(RouteDecision::Proceed { .. })), "{event_type} should proceed");
        }
        for event_type in lw_handlers::recognized_event_types(Source::SupportCompany) {
            let body = json!({"topic": event_type, "company_id": "co-1"});
            assert!(matches!(decide_support(&body, &HashSet::new()), Ok(RouteDecision::Proceed { .. })), "{event_type} should proceed");
        }
    }
}
