use async_trait::async_trait;
use lw_core::{Event, Outcome, PipelineError};
use lw_notifier::Severity;
use serde_json::json;
use time::{Duration, OffsetDateTime};

use crate::signals::{detect_signals, PlanLimits, Priority};
use crate::types::{parse_payload, SupportCompanyUpdated, SupportTagAdded};
use crate::{Clients, Handler};

pub struct TagAdded;

#[async_trait]
impl Handler for TagAdded {
    async fn handle(&self, event: &Event, clients: &Clients) -> Result<Outcome, PipelineError> {
        let payload: SupportTagAdded = parse_payload(&event.payload)?;

        if !clients.config.qualifying_tags.is_empty() && !clients.config.qualifying_tags.contains(&payload.tag) {
            return Ok(Outcome::Ignored("tag_not_qualifying".to_string()));
        }

        let mut enrichment = json!({});
        if let (Some(enricher), Some(contact_email)) = (clients.contact_enrichment.as_ref(), payload.contact_email.as_deref()) {
            match enricher.enrich(contact_email).await {
                Ok(data) => enrichment = data,
                Err(err) => tracing::warn!(error = %err, contact_email, "contact enrichment lookup failed, continuing without it"),
            }
        }

        let mut usage = json!(null);
        if let Some(directory) = clients.company_directory.as_ref() {
            match directory.lookup(&payload.company_id).await {
                Ok(snapshot) => {
                    let limits = clients
                        .config
                        .member_limit_table
                        .get(&snapshot.plan)
                        .map(|entry| PlanLimits {
                            members: entry.get("members").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
                            projects: entry.get("projects").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
                        })
                        .unwrap_or_default();
                    let signals = detect_signals(snapshot.members, snapshot.active_projects, limits);
                    usage = json!({
                        "plan": snapshot.plan,
                        "members": snapshot.members,
                        "member_limit": limits.members,
                        "active_projects": snapshot.active_projects,
                        "project_limit": limits.projects,
                        "signals": signals.iter().map(|s| s.name).collect::<Vec<_>>(),
                    });
                }
                Err(err) => tracing::warn!(error = %err, company_id = payload.company_id, "company directory lookup failed, continuing without usage metadata"),
            }
        }

        let fields = json!({
            "support_company_id": payload.company_id,
            "engagement_tag": payload.tag,
            "enrichment": enrichment,
            "usage_metadata": usage,
        });
        let email = payload.contact_email.clone().unwrap_or_else(|| format!("company+{}@support.invalid", payload.company_id));
        clients.crm.upsert_lead_by_email(&email, fields).await?;
        Ok(Outcome::Success)
    }
}

pub struct CompanyUpdated;

#[async_trait]
impl Handler for CompanyUpdated {
    async fn handle(&self, event: &Event, clients: &Clients) -> Result<Outcome, PipelineError> {
        let payload: SupportCompanyUpdated = parse_payload(&event.payload)?;

        let limits = clients
            .config
            .member_limit_table
            .get(&payload.plan)
            .map(|entry| PlanLimits {
                members: entry.get("members").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
                projects: entry.get("projects").and_then(|v| v.as_u64()).unwrap_or(0) as u32,
            })
            .unwrap_or_default();

        let signals = detect_signals(payload.members, payload.active_projects, limits);
        for signal in &signals {
            let body = format!(
                "Company {} plan={} members={}/{} projects={}/{}",
                payload.company_id, payload.plan, payload.members, limits.members, payload.active_projects, limits.projects
            );
            clients
                .crm
                .create_task(
                    &payload.company_id,
                    signal.name,
                    OffsetDateTime::now_utc() + Duration::days(1),
                    priority_label(signal.priority),
                    &body,
                )
                .await?;
            if signal.priority == Priority::Critical {
                clients
                    .notifier
                    .notify(&format!("{} triggered for {}", signal.name, payload.company_id), &body, Severity::Critical)
                    .await;
            }
        }

        Ok(Outcome::Success)
    }
}

fn priority_label(priority: Priority) -> &'static str {
    match priority {
        Priority::Critical => "high",
        Priority::Warning => "medium",
        Priority::Info => "low",
    }
}
