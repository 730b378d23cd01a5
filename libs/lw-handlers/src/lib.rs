//! The per-`(source, event_type)` handler set. Each handler is a pure
//! dispatch target: given a staged [`Event`] and the set of outbound
//! [`Clients`], it performs whatever external side effects the event
//! calls for and returns an [`Outcome`], or a [`PipelineError`] the Job
//! Runner classifies into retry/fail-fast behavior. Handlers hold no
//! state of their own; everything they need crosses the call boundary.

pub mod calendar;
pub mod enrich;
pub mod meeting;
pub mod signals;
pub mod support;
pub mod types;

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use lw_config::Config;
use lw_core::{Event, Outcome, PipelineError, Source};
use lw_crm::CrmClient;
use lw_llm::Extractor;
use lw_notifier::Notifier;
use once_cell::sync::Lazy;
use serde_json::Value;

/// A handler-side trait for the contact-enrichment API sub-step of
/// `Manual_enrich.enrich_request` (spec §4.11). Kept trait-based for the
/// same reason [`lw_crm::CrmClient`] is: tests substitute a scripted
/// double instead of a live HTTP dependency.
#[async_trait]
pub trait ContactEnrichment: Send + Sync {
    async fn enrich(&self, email: &str) -> Result<Value, PipelineError>;
}

#[async_trait]
pub trait WebsiteScraper: Send + Sync {
    async fn scrape(&self, domain: &str) -> Result<Value, PipelineError>;
}

#[async_trait]
pub trait LogoFetcher: Send + Sync {
    async fn fetch_logo(&self, domain: &str) -> Result<String, PipelineError>;
}

/// Looks up a support company's plan and current usage, the same shape
/// `Support_company.company_updated` carries on its payload, for
/// `Support_tag.tag_added` to attach to the lead it upserts. A tag event
/// only carries the company id, not its usage, so this is a real
/// external lookup rather than a reshaping of the incoming payload.
#[async_trait]
pub trait CompanyDirectory: Send + Sync {
    async fn lookup(&self, company_id: &str) -> Result<crate::types::CompanySnapshot, PipelineError>;
}

/// Stages a follow-up `manual_enrich` event with a distinct idempotency
/// key, implemented by the app binary that owns the Event Store, the
/// Idempotency Guard and the Queue so this crate does not need to depend
/// on any of them.
#[async_trait]
pub trait FollowUpStaging: Send + Sync {
    async fn stage_manual_enrich(&self, email: &str, lead_id: Option<String>) -> Result<(), PipelineError>;
}

pub struct Clients {
    pub crm: Arc<dyn CrmClient>,
    pub llm: Arc<dyn Extractor>,
    pub notifier: Arc<Notifier>,
    pub config: Arc<Config>,
    pub contact_enrichment: Option<Arc<dyn ContactEnrichment>>,
    pub scraper: Option<Arc<dyn WebsiteScraper>>,
    pub logo_fetcher: Option<Arc<dyn LogoFetcher>>,
    pub company_directory: Option<Arc<dyn CompanyDirectory>>,
    pub staging: Option<Arc<dyn FollowUpStaging>>,
}

#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, event: &Event, clients: &Clients) -> Result<Outcome, PipelineError>;
}

fn dispatch_key(source: Source, event_type: &str) -> String {
    format!("{source}:{event_type}")
}

static DISPATCH: Lazy<HashMap<String, Arc<dyn Handler>>> = Lazy::new(|| {
    let mut map: HashMap<String, Arc<dyn Handler>> = HashMap::new();
    map.insert(dispatch_key(Source::Calendar, "booked"), Arc::new(calendar::Booked));
    map.insert(dispatch_key(Source::Calendar, "canceled"), Arc::new(calendar::Canceled));
    map.insert(dispatch_key(Source::Calendar, "rescheduled"), Arc::new(calendar::Rescheduled));
    map.insert(dispatch_key(Source::MeetingTranscript, "completed"), Arc::new(meeting::Completed));
    map.insert(dispatch_key(Source::SupportTag, "tag_added"), Arc::new(support::TagAdded));
    map.insert(dispatch_key(Source::SupportCompany, "company_updated"), Arc::new(support::CompanyUpdated));
    map.insert(dispatch_key(Source::ManualEnrich, "enrich_request"), Arc::new(enrich::EnrichRequest));
    map
});

/// Looks up the handler registered for `(source, event_type)`. `None`
/// means the Runner should treat the job as permanently failed: staging
/// only ever enqueues event types the Ingress Router already recognized.
pub fn dispatch(source: Source, event_type: &str) -> Option<Arc<dyn Handler>> {
    DISPATCH.get(&dispatch_key(source, event_type)).cloned()
}

/// The recognized `(source, event_type)` pairs. The Ingress Router calls
/// this directly to decide `unknown_event_type` ignores, so the
/// allowlist the router enforces cannot drift from the handler table
/// this crate actually dispatches to.
pub fn recognized_event_types(source: Source) -> &'static [&'static str] {
    match source {
        Source::Calendar => &["booked", "canceled", "rescheduled"],
        Source::MeetingTranscript => &["completed"],
        Source::SupportTag => &["tag_added"],
        Source::SupportCompany => &["company_updated"],
        Source::ManualEnrich => &["enrich_request"],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dispatch_resolves_every_recognized_event_type() {
        for source in [
            Source::Calendar,
            Source::MeetingTranscript,
            Source::SupportTag,
            Source::SupportCompany,
            Source::ManualEnrich,
        ] {
            for event_type in recognized_event_types(source) {
                assert!(dispatch(source, event_type).is_some(), "missing handler for {source}:{event_type}");
            }
        }
    }

    #[test]
    fn dispatch_returns_none_for_unknown_event_type() {
        assert!(dispatch(Source::Calendar, "nonexistent").is_none());
    }
}
