use async_trait::async_trait;
use lw_core::{Event, Outcome, PipelineError};
use schemars::schema_for;
use serde_json::json;

use crate::types::{parse_payload, CalendarBooked, CalendarCanceled, CalendarRescheduled, ExtractedIntel};
use crate::{Clients, Handler};

const LEAD_STATUS_BOOKED: &str = "demo_booked";
const LEAD_STATUS_CANCELED: &str = "demo_canceled";
const LEAD_STATUS_RESCHEDULED: &str = "demo_rescheduled";

pub struct Booked;

#[async_trait]
impl Handler for Booked {
    async fn handle(&self, event: &Event, clients: &Clients) -> Result<Outcome, PipelineError> {
        let payload: CalendarBooked = parse_payload(&event.payload)?;

        let intel = if payload.notes.as_deref().unwrap_or_default().trim().is_empty() {
            ExtractedIntel::default()
        } else {
            let schema = serde_json::to_value(schema_for!(ExtractedIntel))
                .map_err(|err| PipelineError::permanent("schema_encode", err.to_string()))?;
            let value = clients
                .llm
                .extract(
                    "Extract structured sales intelligence from the booking notes as JSON.",
                    payload.notes.as_deref().unwrap_or_default(),
                    &schema,
                )
                .await?;
            serde_json::from_value(value).unwrap_or_default()
        };

        let fields = json!({
            "status": LEAD_STATUS_BOOKED,
            "company": payload.company,
            "name": payload.name,
            "meeting_time": payload.meeting_time,
            "summary": intel.summary,
            "pain_points": intel.pain_points,
            "budget_mentioned": intel.budget_mentioned,
        });
        let lead = clients.crm.upsert_lead_by_email(&payload.email, fields).await?;
        clients
            .crm
            .create_note(&lead.id, "Demo booked", payload.notes.as_deref().unwrap_or("(no notes)"))
            .await?;

        if let Some(staging) = clients.staging.as_ref() {
            if let Err(err) = staging.stage_manual_enrich(&payload.email, Some(lead.id.clone())).await {
                tracing::warn!(error = %err, email = %payload.email, "failed to stage follow-up enrichment");
            }
        }

        Ok(Outcome::Success)
    }
}

pub struct Canceled;

#[async_trait]
impl Handler for Canceled {
    async fn handle(&self, event: &Event, clients: &Clients) -> Result<Outcome, PipelineError> {
        let payload: CalendarCanceled = parse_payload(&event.payload)?;
        let fields = json!({
            "status": LEAD_STATUS_CANCELED,
            "cancel_reason": payload.reason,
        });
        clients.crm.upsert_lead_by_email(&payload.email, fields).await?;
        Ok(Outcome::Success)
    }
}

pub struct Rescheduled;

#[async_trait]
impl Handler for Rescheduled {
    async fn handle(&self, event: &Event, clients: &Clients) -> Result<Outcome, PipelineError> {
        let payload: CalendarRescheduled = parse_payload(&event.payload)?;
        let fields = json!({
            "status": LEAD_STATUS_RESCHEDULED,
            "meeting_time": payload.new_meeting_time,
        });
        let lead = clients.crm.upsert_lead_by_email(&payload.email, fields).await?;
        clients
            .crm
            .create_note(&lead.id, "Demo rescheduled", &format!("New time: {}", payload.new_meeting_time))
            .await?;
        Ok(Outcome::Success)
    }
}
