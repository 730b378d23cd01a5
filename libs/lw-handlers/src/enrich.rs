use async_trait::async_trait;
use lw_core::{Event, Outcome, PipelineError};
use schemars::schema_for;
use serde_json::json;

use crate::types::{parse_payload, ManualEnrichRequest, WebsiteAnalysis};
use crate::{Clients, Handler};

fn domain_of(email: &str) -> &str {
    email.rsplit('@').next().unwrap_or("")
}

pub struct EnrichRequest;

#[async_trait]
impl Handler for EnrichRequest {
    async fn handle(&self, event: &Event, clients: &Clients) -> Result<Outcome, PipelineError> {
        let payload: ManualEnrichRequest = parse_payload(&event.payload)?;
        let domain = domain_of(&payload.email);

        let contact_fut = async {
            match clients.contact_enrichment.as_ref() {
                Some(enricher) => enricher.enrich(&payload.email).await.ok(),
                None => None,
            }
        };
        let website_fut = async {
            match clients.scraper.as_ref() {
                Some(scraper) => scraper.scrape(domain).await.ok(),
                None => None,
            }
        };
        let logo_fut = async {
            match clients.logo_fetcher.as_ref() {
                Some(fetcher) => fetcher.fetch_logo(domain).await.ok(),
                None => None,
            }
        };
        let llm_fut = async {
            let schema = serde_json::to_value(schema_for!(WebsiteAnalysis)).ok()?;
            clients
                .llm
                .extract(
                    "Analyze this company's likely industry and size from its domain as JSON.",
                    domain,
                    &schema,
                )
                .await
                .ok()
                .and_then(|value| serde_json::from_value::<WebsiteAnalysis>(value).ok())
        };
        let (contact, website, logo_url, website_analysis) =
            futures::future::join4(contact_fut, website_fut, logo_fut, llm_fut).await;

        if contact.is_none() && website.is_none() && logo_url.is_none() && website_analysis.is_none() {
            return Err(PipelineError::permanent(
                "enrichment_exhausted",
                format!("all enrichment sub-steps failed for {}", payload.email),
            ));
        }

        let fields = json!({
            "contact_enrichment": contact,
            "website_enrichment": website,
            "logo_url": logo_url,
            "website_analysis": website_analysis,
        });
        let lead = clients.crm.upsert_lead_by_email(&payload.email, fields).await?;
        if let Some(requested_lead_id) = payload.lead_id.filter(|id| *id != lead.id) {
            tracing::info!(requested_lead_id, resolved_lead_id = %lead.id, "enrich request resolved to a different lead id than requested");
        }
        Ok(Outcome::Success)
    }
}
