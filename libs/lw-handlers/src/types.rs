//! Closed, `serde`-derived payload shapes for each `(source, event_type)`
//! pair this core accepts. Optional fields default rather than reject, so
//! a field an upstream later adds does not break parsing of the fields we
//! already understand.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CalendarBooked {
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub company: Option<String>,
    pub meeting_time: String,
    #[serde(default)]
    pub notes: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CalendarCanceled {
    pub email: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CalendarRescheduled {
    pub email: String,
    pub new_meeting_time: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MeetingParticipant {
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct MeetingTranscriptCompleted {
    pub meeting_owner_email: String,
    pub duration_minutes: u32,
    #[serde(default)]
    pub participants: Vec<MeetingParticipant>,
    pub transcript_text: String,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SupportTagAdded {
    pub company_id: String,
    pub tag: String,
    #[serde(default)]
    pub contact_email: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SupportCompanyUpdated {
    pub company_id: String,
    pub plan: String,
    pub members: u32,
    #[serde(default)]
    pub active_projects: u32,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ManualEnrichRequest {
    pub email: String,
    #[serde(default)]
    pub lead_id: Option<String>,
}

/// Structured intelligence the LLM extracts from free-form text (meeting
/// notes, transcripts). `schemars` derives the JSON Schema handed to
/// [`lw_llm::LlmClient::extract`] from this same struct so the
/// compile-time shape and the runtime-validated schema cannot drift.
#[derive(Debug, Clone, Default, Deserialize, Serialize, schemars::JsonSchema)]
pub struct ExtractedIntel {
    pub summary: String,
    #[serde(default)]
    pub pain_points: Vec<String>,
    #[serde(default)]
    pub budget_mentioned: bool,
    #[serde(default)]
    pub next_step: Option<String>,
}

/// Structured read on a lead's domain the LLM produces independently of
/// the raw page scrape, derived the same way as [`ExtractedIntel`].
#[derive(Debug, Clone, Default, Deserialize, Serialize, schemars::JsonSchema)]
pub struct WebsiteAnalysis {
    pub summary: String,
    #[serde(default)]
    pub likely_industry: Option<String>,
    #[serde(default)]
    pub company_size_estimate: Option<String>,
}

/// A support company's plan and current usage as the company directory
/// reports it, the same fields [`SupportCompanyUpdated`] carries inline.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CompanySnapshot {
    pub plan: String,
    pub members: u32,
    #[serde(default)]
    pub active_projects: u32,
}

pub fn parse_payload<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, lw_core::PipelineError> {
    serde_json::from_slice(bytes).map_err(|err| lw_core::PipelineError::validation(format!("malformed payload: {err}")))
}
