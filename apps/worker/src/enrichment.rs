//! Thin reqwest-backed implementations of three of the four `Manual_enrich`
//! sub-step traits (contact lookup, page scrape, logo fetch), the company
//! directory lookup `Support_tag.tag_added` uses, and the follow-up
//! staging trait, grounded on the same request/classify pattern as
//! [`lw_crm::HttpCrmClient`]. The fourth `Manual_enrich` sub-step, LLM
//! website analysis, reuses the `Extractor` client already built in
//! `main.rs` rather than a type defined here. Each HTTP client here is
//! only constructed when its endpoint is configured; an unconfigured one
//! is simply absent from `Clients`, and the handler that would use it
//! already treats that as a best-effort miss.

use std::sync::Arc;

use async_trait::async_trait;
use lw_core::{PipelineError, Source};
use lw_events::EventStore;
use lw_handlers::types::CompanySnapshot;
use lw_handlers::{CompanyDirectory, ContactEnrichment, FollowUpStaging, WebsiteScraper};
use lw_idempotency::{Acquisition, IdempotencyGuard};
use lw_queue::Queue;
use serde_json::Value;

pub struct HttpContactEnrichment {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpContactEnrichment {
    pub fn new(http: reqwest::Client, base_url: String, api_key: String) -> Self {
        Self { http, base_url, api_key }
    }
}

#[async_trait]
impl ContactEnrichment for HttpContactEnrichment {
    async fn enrich(&self, email: &str) -> Result<Value, PipelineError> {
        let url = format!("{}/contacts/lookup", self.base_url.trim_end_matches('/'));
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.api_key)
            .query(&[("email", email)])
            .send()
            .await
            .map_err(|err| PipelineError::transient("contact_enrichment_http", err.to_string(), None))?;
        let status = resp.status().as_u16();
        if !(200..300).contains(&status) {
            let body = resp.text().await.unwrap_or_default();
            return Err(PipelineError::from_http_status("contact_enrichment_http", status, body));
        }
        resp.json::<Value>()
            .await
            .map_err(|err| PipelineError::transient("contact_enrichment_http", err.to_string(), None))
    }
}

pub struct HttpCompanyDirectory {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpCompanyDirectory {
    pub fn new(http: reqwest::Client, base_url: String, api_key: String) -> Self {
        Self { http, base_url, api_key }
    }
}

#[async_trait]
impl CompanyDirectory for HttpCompanyDirectory {
    async fn lookup(&self, company_id: &str) -> Result<CompanySnapshot, PipelineError> {
        let url = format!("{}/companies/{}", self.base_url.trim_end_matches('/'), company_id);
        let resp = self
            .http
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(|err| PipelineError::transient("company_directory_http", err.to_string(), None))?;
        let status = resp.status().as_u16();
        if !(200..300).contains(&status) {
            let body = resp.text().await.unwrap_or_default();
            return Err(PipelineError::from_http_status("company_directory_http", status, body));
        }
        resp.json::<CompanySnapshot>()
            .await
            .map_err(|err| PipelineError::transient("company_directory_http", err.to_string(), None))
    }
}

/// Fetches a bare domain's home page and reports its size as a coarse
/// enrichment signal; `enrich.rs` only cares that this sub-step returns
/// something or fails, not the shape of the result.
pub struct HttpWebsiteScraper {
    http: reqwest::Client,
}

impl HttpWebsiteScraper {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl WebsiteScraper for HttpWebsiteScraper {
    async fn scrape(&self, domain: &str) -> Result<Value, PipelineError> {
        let url = format!("https://{domain}");
        let resp = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|err| PipelineError::transient("website_scrape_http", err.to_string(), None))?;
        let status = resp.status().as_u16();
        if !(200..300).contains(&status) {
            let body = resp.text().await.unwrap_or_default();
            return Err(PipelineError::from_http_status("website_scrape_http", status, body));
        }
        let body = resp
            .text()
            .await
            .map_err(|err| PipelineError::transient("website_scrape_http", err.to_string(), None))?;
        Ok(serde_json::json!({"domain": domain, "byte_len": body.len()}))
    }
}

pub struct HttpLogoFetcher {
    http: reqwest::Client,
}

impl HttpLogoFetcher {
    pub fn new(http: reqwest::Client) -> Self {
        Self { http }
    }
}

#[async_trait]
impl lw_handlers::LogoFetcher for HttpLogoFetcher {
    async fn fetch_logo(&self, domain: &str) -> Result<String, PipelineError> {
        let url = format!("https://logo.clearbit.com/{domain}");
        let resp = self
            .http
            .head(&url)
            .send()
            .await
            .map_err(|err| PipelineError::transient("logo_fetch_http", err.to_string(), None))?;
        let status = resp.status().as_u16();
        if (200..300).contains(&status) {
            Ok(url)
        } else {
            Err(PipelineError::from_http_status("logo_fetch_http", status, String::new()))
        }
    }
}

/// Stages a follow-up `manual_enrich` job via the same store/guard/queue
/// triple the Ingress Router uses, under a fingerprint keyed by the
/// email so repeated follow-ups for the same lead collapse to one job.
pub struct QueueFollowUpStaging {
    event_store: EventStore,
    idempotency: Arc<IdempotencyGuard>,
    queue: Arc<Queue>,
}

impl QueueFollowUpStaging {
    pub fn new(event_store: EventStore, idempotency: Arc<IdempotencyGuard>, queue: Arc<Queue>) -> Self {
        Self { event_store, idempotency, queue }
    }
}

#[async_trait]
impl FollowUpStaging for QueueFollowUpStaging {
    async fn stage_manual_enrich(&self, email: &str, lead_id: Option<String>) -> Result<(), PipelineError> {
        let payload = serde_json::to_vec(&serde_json::json!({"email": email, "lead_id": lead_id}))
            .map_err(|err| PipelineError::permanent("follow_up_encode", err.to_string()))?;
        let idempotency_key = format!("manual_enrich:enrich_request:{email}");
        let ev = self
            .event_store
            .store(Source::ManualEnrich, "enrich_request", email, &idempotency_key, payload)
            .await
            .map_err(|err| PipelineError::transient("follow_up_stage", err.to_string(), None))?;
        let acquisition = self
            .idempotency
            .try_acquire(&idempotency_key, &ev.event_id)
            .await
            .map_err(|err| PipelineError::transient("follow_up_idempotency", err.to_string(), None))?;
        match acquisition {
            Acquisition::AlreadyHeld(_) => {
                let _ = self.event_store.delete(&ev.event_id).await;
                Ok(())
            }
            Acquisition::Acquired => {
                let enqueued = self
                    .queue
                    .enqueue(&idempotency_key, &ev.event_id)
                    .await
                    .map_err(|err| PipelineError::transient("follow_up_enqueue", err.to_string(), None))?;
                if !enqueued {
                    let _ = self.event_store.delete(&ev.event_id).await;
                }
                Ok(())
            }
        }
    }
}
