use async_trait::async_trait;
use lw_config::DemoDatePolicy;
use lw_core::{Event, Outcome, PipelineError};
use schemars::schema_for;
use serde_json::json;

use crate::types::{parse_payload, ExtractedIntel, MeetingParticipant, MeetingTranscriptCompleted};
use crate::{Clients, Handler};

fn domain_of(email: &str) -> &str {
    email.rsplit('@').next().unwrap_or("")
}

fn is_external(email: &str, customer_domains: &std::collections::HashSet<String>) -> bool {
    !customer_domains.contains(domain_of(email))
}

/// Orders candidates so the meeting owner is tried first when the owner's
/// domain is external; every other candidate keeps its original relative
/// order (spec §8 property 8).
fn rank_candidates(owner_email: &str, participants: &[MeetingParticipant], customer_domains: &std::collections::HashSet<String>) -> Vec<String> {
    let mut ranked: Vec<String> = participants.iter().map(|p| p.email.clone()).collect();
    if !ranked.iter().any(|e| e == owner_email) {
        ranked.insert(0, owner_email.to_string());
    }
    if is_external(owner_email, customer_domains) {
        if let Some(pos) = ranked.iter().position(|e| e == owner_email) {
            let owner = ranked.remove(pos);
            ranked.insert(0, owner);
        }
    }
    ranked
}

pub struct Completed;

#[async_trait]
impl Handler for Completed {
    async fn handle(&self, event: &Event, clients: &Clients) -> Result<Outcome, PipelineError> {
        let payload: MeetingTranscriptCompleted = parse_payload(&event.payload)?;

        if payload.duration_minutes < clients.config.min_duration_minutes {
            return Ok(Outcome::Ignored("too_short".to_string()));
        }

        let ranked = rank_candidates(&payload.meeting_owner_email, &payload.participants, &clients.config.customer_domains);

        let mut resolved_email = None;
        for candidate in &ranked {
            if let Some(lead) = clients.crm.find_lead_by_email(candidate).await? {
                resolved_email = Some(lead.email);
                break;
            }
        }

        let target_email = match resolved_email {
            Some(email) => email,
            None => ranked
                .iter()
                .find(|e| is_external(e, &clients.config.customer_domains))
                .cloned()
                .ok_or_else(|| PipelineError::permanent("no_usable_email", "no external participant email to create a lead from"))?,
        };

        let truncated = lw_llm::truncate(&payload.transcript_text, clients.config.llm_truncation_chars);
        let schema = serde_json::to_value(schema_for!(ExtractedIntel))
            .map_err(|err| PipelineError::permanent("schema_encode", err.to_string()))?;
        let intel: ExtractedIntel = serde_json::from_value(
            clients
                .llm
                .extract(
                    "Extract structured sales intelligence from this meeting transcript as JSON.",
                    &truncated,
                    &schema,
                )
                .await?,
        )
        .unwrap_or_default();

        let mut fields = json!({
            "summary": intel.summary,
            "pain_points": intel.pain_points,
            "budget_mentioned": intel.budget_mentioned,
        });
        if clients.config.meeting_demo_date_policy == DemoDatePolicy::Overwrite {
            fields["next_step"] = json!(intel.next_step);
        }

        let lead = clients.crm.upsert_lead_by_email(&target_email, fields).await?;
        clients
            .crm
            .create_note(&lead.id, "Meeting transcript processed", &intel.summary)
            .await?;
        Ok(Outcome::Success)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn customer_domains() -> HashSet<String> {
        ["cust".to_string()].into_iter().collect()
    }

    fn participant(email: &str) -> MeetingParticipant {
        MeetingParticipant { email: email.to_string(), name: None }
    }

    #[test]
    fn owner_external_is_ranked_first() {
        let participants = vec![
            participant("o@int"),
            participant("a@cust"),
            participant("b@cust"),
            participant("c@int"),
        ];
        let ranked = rank_candidates("o@int", &participants, &customer_domains());
        assert_eq!(ranked[0], "o@int");
    }

    #[test]
    fn internal_owner_does_not_preempt_original_order() {
        let participants = vec![participant("a@cust"), participant("o@cust"), participant("c@int")];
        let ranked = rank_candidates("o@cust", &participants, &customer_domains());
        assert_eq!(ranked[0], "a@cust");
    }
}
