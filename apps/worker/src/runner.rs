//! The Job Runner's execution wrapper: loads the staged event, dispatches
//! it to its handler, and classifies the outcome into the queue's
//! ack/nak/failure-sink protocol. Grounded on the dispatch-then-classify
//! shape of a consume loop, generalized from one message type to the
//! five-source handler table in [`lw_handlers`].

use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::AckKind;
use lw_core::{EventStatus, Outcome, PipelineError};
use lw_dlq::{DlqError, DlqPublisher};
use lw_events::EventStore;
use lw_handlers::Clients;
use lw_idempotency::IdempotencyGuard;
use lw_notifier::Severity;
use lw_queue::{JobEnvelope, Queue, RetryPolicy};

pub struct RunnerCtx {
    pub event_store: EventStore,
    pub idempotency: Arc<IdempotencyGuard>,
    pub queue: Arc<Queue>,
    pub dlq: DlqPublisher,
    pub clients: Clients,
    pub retry_policy: RetryPolicy,
}

/// Outcome of processing one queue message, telling the caller how to
/// acknowledge it. The runner never leaves a message unacked.
pub enum AckDecision {
    Ack,
    NakWithDelay(Duration),
}

/// What to persist once a handler outcome has been classified, separated
/// from `AckDecision` so the classification itself can be unit-tested
/// without touching the event store or queue.
pub enum Classified {
    /// Event reached a terminal, successful or ignored state.
    Terminal { status: EventStatus, reason: Option<String> },
    /// Transient error with retries remaining; event stays `Queued`.
    RetryLater { delay: Duration, code: String, message: String },
    /// Transient error with retries exhausted, or a permanent error.
    Failed { code: String, message: String },
}

/// Pure decision: given a handler's outcome and the retry policy, decide
/// what should happen next. Contains no I/O so it can be exercised
/// directly against every `Outcome`/`PipelineError` shape.
fn classify(outcome: Result<Outcome, PipelineError>, attempts: u32, retry_policy: &RetryPolicy) -> (Classified, AckDecision) {
    match outcome {
        Ok(Outcome::Success) => (Classified::Terminal { status: EventStatus::Processed, reason: None }, AckDecision::Ack),
        Ok(Outcome::Ignored(reason)) => {
            (Classified::Terminal { status: EventStatus::Ignored, reason: Some(reason) }, AckDecision::Ack)
        }
        Err(PipelineError::Transient { code, message, .. }) => match retry_policy.next_delay(attempts) {
            Some(delay) => {
                (Classified::RetryLater { delay, code, message }, AckDecision::NakWithDelay(delay))
            }
            None => (Classified::Failed { code, message }, AckDecision::Ack),
        },
        Err(PipelineError::Permanent { code, message }) => (Classified::Failed { code, message }, AckDecision::Ack),
        Err(PipelineError::Validation(message)) => {
            (Classified::Failed { code: "validation_error".into(), message }, AckDecision::Ack)
        }
        Err(PipelineError::Signature) => (
            Classified::Failed { code: "signature_error".into(), message: "signature rejected post-staging".into() },
            AckDecision::Ack,
        ),
    }
}

pub async fn process_job(ctx: &RunnerCtx, envelope: &JobEnvelope) -> AckDecision {
    let span = tracing::info_span!("job", job_id = %envelope.job_id, event_id = %envelope.event_id);
    let _enter = span.enter();

    let event = match ctx.event_store.load(&envelope.event_id).await {
        Ok(Some(ev)) => ev,
        Ok(None) => {
            tracing::warn!("staged event not found, treating as expired");
            return AckDecision::Ack;
        }
        Err(err) => {
            tracing::error!(error = %err, "failed to load event, redelivering");
            return AckDecision::NakWithDelay(Duration::from_secs(5));
        }
    };

    if event.status == EventStatus::Processed {
        return AckDecision::Ack;
    }
    match ctx.idempotency.is_processed(&event.idempotency_key).await {
        Ok(true) => return AckDecision::Ack,
        Ok(false) => {}
        Err(err) => {
            tracing::error!(error = %err, "failed to check idempotency marker, redelivering");
            return AckDecision::NakWithDelay(Duration::from_secs(5));
        }
    }

    let attempts = event.attempts + 1;
    if let Err(err) = ctx
        .event_store
        .set_status(&event.event_id, EventStatus::Processing, Some(attempts), None)
        .await
    {
        tracing::error!(error = %err, "failed to mark event processing, redelivering");
        return AckDecision::NakWithDelay(Duration::from_secs(5));
    }

    let outcome = match lw_handlers::dispatch(event.source, &event.event_type) {
        Some(handler) => handler.handle(&event, &ctx.clients).await,
        None => Err(PipelineError::permanent(
            "unrecognized_event_type",
            format!("no handler registered for {}:{}", event.source, event.event_type),
        )),
    };

    let is_transient = matches!(outcome, Err(PipelineError::Transient { .. }));
    let (classified, decision) = classify(outcome, attempts, &ctx.retry_policy);
    match classified {
        Classified::Terminal { status, reason } => {
            if status == EventStatus::Processed {
                metrics::counter!("handler_success").increment(1);
            }
            finish_terminal(ctx, &event.event_id, &event.idempotency_key, status, attempts, reason).await;
        }
        Classified::RetryLater { code, message, .. } => {
            metrics::counter!("handler_transient_error", "code" => code).increment(1);
            let _ = ctx
                .event_store
                .set_status(&event.event_id, EventStatus::Queued, Some(attempts), Some(message))
                .await;
        }
        Classified::Failed { code, message } => {
            if is_transient {
                metrics::counter!("handler_transient_error", "code" => code.clone()).increment(1);
            } else {
                metrics::counter!("handler_permanent_error", "code" => code.clone()).increment(1);
            }
            fail_permanently(ctx, &event, attempts, code, message).await;
        }
    }
    decision
}

async fn finish_terminal(
    ctx: &RunnerCtx,
    event_id: &str,
    idempotency_key: &str,
    status: EventStatus,
    attempts: u32,
    last_error: Option<String>,
) {
    if let Err(err) = ctx.idempotency.mark_processed(idempotency_key).await {
        tracing::error!(error = %err, "failed to mark idempotency key processed");
    }
    if let Err(err) = ctx.event_store.set_status(event_id, status, Some(attempts), last_error).await {
        tracing::error!(error = %err, "failed to record terminal event status");
    }
    if let Err(err) = ctx.queue.clear_inflight(idempotency_key).await {
        tracing::warn!(error = %err, "failed to clear in-flight marker");
    }
}

async fn fail_permanently(ctx: &RunnerCtx, event: &lw_core::Event, attempts: u32, code: String, message: String) {
    if let Err(err) = ctx
        .event_store
        .set_status(&event.event_id, EventStatus::Failed, Some(attempts), Some(message.clone()))
        .await
    {
        tracing::error!(error = %err, "failed to record failed event status");
    }
    if let Err(err) = ctx.idempotency.mark_processed(&event.idempotency_key).await {
        tracing::error!(error = %err, "failed to mark idempotency key processed after failure");
    }
    if let Err(err) = ctx.queue.clear_inflight(&event.idempotency_key).await {
        tracing::warn!(error = %err, "failed to clear in-flight marker after failure");
    }
    if let Err(err) = ctx
        .dlq
        .publish(
            &event.event_id,
            &event.idempotency_key,
            event.source,
            &event.event_type,
            attempts,
            DlqError { code: code.clone(), message: message.clone() },
        )
        .await
    {
        tracing::error!(error = %err, "failed to publish to failure sink");
    }
    ctx.clients
        .notifier
        .notify(
            &format!("{}:{} failed permanently", event.source, event.event_type),
            &format!("event {} ({}): {message}", event.event_id, code),
            Severity::Critical,
        )
        .await;
}

pub fn ack_kind(decision: AckDecision) -> Option<AckKind> {
    match decision {
        AckDecision::Ack => None,
        AckDecision::NakWithDelay(delay) => Some(AckKind::Nak(Some(delay))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lw_queue::RetryPolicy;

    fn policy() -> RetryPolicy {
        RetryPolicy { max_retries: 2, intervals: vec![Duration::from_secs(1), Duration::from_secs(2)] }
    }

    #[test]
    fn success_is_terminal_processed_and_acks() {
        let (classified, decision) = classify(Ok(Outcome::Success), 1, &policy());
        assert!(matches!(classified, Classified::Terminal { status: EventStatus::Processed, reason: None }));
        assert!(matches!(ack_kind(decision), None));
    }

    #[test]
    fn ignored_is_terminal_ignored_with_reason_and_acks() {
        let (classified, decision) = classify(Ok(Outcome::Ignored("too_short".into())), 1, &policy());
        match classified {
            Classified::Terminal { status: EventStatus::Ignored, reason: Some(reason) } => assert_eq!(reason, "too_short"),
            _ => panic!("expected terminal ignored"),
        }
        assert!(matches!(ack_kind(decision), None));
    }

    #[test]
    fn transient_error_with_retries_left_naks_with_delay() {
        let err = PipelineError::transient("crm_upsert", "timed out", None);
        let (classified, decision) = classify(Err(err), 1, &policy());
        assert!(matches!(classified, Classified::RetryLater { .. }));
        match ack_kind(decision) {
            Some(AckKind::Nak(Some(delay))) => assert_eq!(delay, Duration::from_secs(1)),
            other => panic!("expected nak with delay, got {other:?}"),
        }
    }

    #[test]
    fn transient_error_past_max_retries_fails_and_acks() {
        let err = PipelineError::transient("crm_upsert", "timed out", None);
        let (classified, decision) = classify(Err(err), 3, &policy());
        match classified {
            Classified::Failed { code, .. } => assert_eq!(code, "crm_upsert"),
            _ => panic!("expected failed"),
        }
        assert!(matches!(ack_kind(decision), None));
    }

    #[test]
    fn permanent_error_fails_immediately_and_acks() {
        let err = PipelineError::permanent("unrecognized_event_type", "no handler");
        let (classified, decision) = classify(Err(err), 1, &policy());
        match classified {
            Classified::Failed { code, .. } => assert_eq!(code, "unrecognized_event_type"),
            _ => panic!("expected failed"),
        }
        assert!(matches!(ack_kind(decision), None));
    }

    #[test]
    fn validation_error_fails_with_validation_error_code() {
        let err = PipelineError::Validation("missing field".into());
        let (classified, _decision) = classify(Err(err), 1, &policy());
        match classified {
            Classified::Failed { code, message } => {
                assert_eq!(code, "validation_error");
                assert_eq!(message, "missing field");
            }
            _ => panic!("expected failed"),
        }
    }
}
