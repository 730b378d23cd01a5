//! Builds the per-source [`lw_security::SignatureVerifier`] once at
//! startup from `Config::source_secrets`, so a request handler never
//! touches the environment directly.

use std::sync::Arc;

use lw_config::Config;
use lw_security::{HmacTimestampVerifier, NoneVerifier, SharedSecretVerifier, SignatureVerifier};

pub struct SourceVerifiers {
    pub calendar: Arc<dyn SignatureVerifier>,
    pub meeting: Arc<dyn SignatureVerifier>,
    pub support: Arc<dyn SignatureVerifier>,
    pub enrich: Arc<dyn SignatureVerifier>,
}

impl SourceVerifiers {
    pub fn from_config(config: &Config) -> Self {
        let calendar: Arc<dyn SignatureVerifier> = match config.source_secrets.get("calendar") {
            Some(secret) => Arc::new(HmacTimestampVerifier::new(secret.clone(), "calendar-signature")),
            None => Arc::new(NoneVerifier::new("calendar")),
        };
        let meeting: Arc<dyn SignatureVerifier> = match config.source_secrets.get("meeting_transcript") {
            Some(secret) => Arc::new(SharedSecretVerifier::new(secret.clone(), "x-meeting-secret")),
            None => Arc::new(NoneVerifier::new("meeting_transcript")),
        };
        let support: Arc<dyn SignatureVerifier> = match config.source_secrets.get("support") {
            Some(secret) => Arc::new(HmacTimestampVerifier::new(secret.clone(), "support-signature")),
            None => Arc::new(NoneVerifier::new("support")),
        };
        let enrich: Arc<dyn SignatureVerifier> = match config.source_secrets.get("manual_enrich") {
            Some(secret) => Arc::new(SharedSecretVerifier::new(secret.clone(), "x-enrich-secret")),
            None => Arc::new(NoneVerifier::new("manual_enrich")),
        };
        Self { calendar, meeting, support, enrich }
    }
}
