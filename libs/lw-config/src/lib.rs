//! Typed, validated startup configuration assembled once from
//! environment variables (spec §3/§4.13). `Config::load()` is the only
//! place this crate reads `std::env`; everything downstream receives an
//! `Arc<Config>` reference.

use std::collections::{HashMap, HashSet};

use anyhow::{Context, Result, bail};
use serde_json::Value;

fn env_string(name: &str, default: &str) -> String {
    std::env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_opt(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_bool(name: &str, default: bool) -> bool {
    std::env::var(name)
        .ok()
        .map(|v| v.eq_ignore_ascii_case("true") || v == "1")
        .unwrap_or(default)
}

fn env_u64(name: &str, default: u64) -> u64 {
    std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_u32(name: &str, default: u32) -> u32 {
    std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_usize(name: &str, default: usize) -> usize {
    std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
}

fn env_set(name: &str) -> HashSet<String> {
    std::env::var(name)
        .ok()
        .map(|raw| raw.split(',').map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect())
        .unwrap_or_default()
}

#[derive(Debug, Clone)]
pub struct Config {
    pub dry_run: bool,
    pub event_ttl_secs: u64,
    pub idempotency_ttl_secs: u64,
    pub max_retries: u32,
    pub retry_intervals_secs: Vec<u64>,
    pub allow_debug_endpoints: bool,
    pub source_secrets: HashMap<String, String>,
    pub crm_datacenter: String,
    pub customer_domains: HashSet<String>,
    pub min_duration_minutes: u32,
    pub qualifying_tags: HashSet<String>,

    pub bind_addr: String,
    pub nats_url: String,
    pub log_format: String,

    pub crm_client_id: Option<String>,
    pub crm_client_secret: Option<String>,
    pub crm_refresh_token: Option<String>,
    pub crm_token_endpoint: Option<String>,
    pub crm_api_base: String,

    pub llm_api_key: String,
    pub llm_api_base: String,
    pub llm_model: String,
    pub llm_truncation_chars: usize,

    pub notifier_webhook_url: Option<String>,
    pub request_timeout_secs: u64,

    pub contact_enrichment_api_key: Option<String>,
    pub contact_enrichment_base_url: Option<String>,

    pub company_directory_api_key: Option<String>,
    pub company_directory_base_url: Option<String>,

    pub member_limit_table: Value,
    pub meeting_demo_date_policy: DemoDatePolicy,
    pub worker_concurrency: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemoDatePolicy {
    PreserveExisting,
    Overwrite,
}

impl Config {
    /// Reads every recognized option from the environment and validates
    /// required fields. Returns an error the caller should print and
    /// exit(1) on, rather than panicking, so `main` controls the process
    /// exit code.
    pub fn load() -> Result<Self> {
        let dry_run = env_bool("DRY_RUN", false);

        let source_secrets = match env_opt("SOURCE_SECRETS") {
            Some(raw) => serde_json::from_str(&raw).context("SOURCE_SECRETS must be a JSON object of source -> secret")?,
            None => HashMap::new(),
        };

        let member_limit_table = match env_opt("MEMBER_LIMIT_TABLE") {
            Some(raw) => serde_json::from_str(&raw).context("MEMBER_LIMIT_TABLE must be valid JSON")?,
            None => Value::Object(Default::default()),
        };

        let meeting_demo_date_policy = match env_string("MEETING_DEMO_DATE_POLICY", "preserve_existing").as_str() {
            "overwrite" => DemoDatePolicy::Overwrite,
            _ => DemoDatePolicy::PreserveExisting,
        };

        let nats_url = env_string("NATS_URL", "nats://127.0.0.1:4222");
        url::Url::parse(&nats_url).map(|_| ()).or_else(|_| {
            if nats_url.starts_with("nats://") {
                Ok(())
            } else {
                bail!("NATS_URL is not a valid URL: {nats_url}")
            }
        })?;

        let cfg = Config {
            dry_run,
            event_ttl_secs: env_u64("EVENT_TTL_SECONDS", 30 * 24 * 3600),
            idempotency_ttl_secs: env_u64("IDEMPOTENCY_TTL_SECONDS", 90 * 24 * 3600),
            max_retries: env_u32("MAX_RETRIES", 3),
            retry_intervals_secs: match env_opt("RETRY_INTERVALS") {
                Some(raw) => raw
                    .split(',')
                    .map(|s| s.trim().parse::<u64>().context("RETRY_INTERVALS must be comma-separated integers"))
                    .collect::<Result<Vec<_>>>()?,
                None => vec![60, 120, 240],
            },
            allow_debug_endpoints: env_bool("ALLOW_DEBUG_ENDPOINTS", false),
            source_secrets,
            crm_datacenter: env_string("CRM_DATACENTER", "na1"),
            customer_domains: env_set("CUSTOMER_DOMAINS"),
            min_duration_minutes: env_u32("MIN_DURATION_MINUTES", 5),
            qualifying_tags: env_set("QUALIFYING_TAGS"),

            bind_addr: env_string("BIND_ADDR", "0.0.0.0:8080"),
            nats_url,
            log_format: env_string("LOG_FORMAT", "json"),

            crm_client_id: env_opt("CRM_CLIENT_ID"),
            crm_client_secret: env_opt("CRM_CLIENT_SECRET"),
            crm_refresh_token: env_opt("CRM_REFRESH_TOKEN"),
            crm_token_endpoint: env_opt("CRM_TOKEN_ENDPOINT"),
            crm_api_base: env_string("CRM_API_BASE", "https://api.crm.example.com"),

            llm_api_key: env_string("LLM_API_KEY", ""),
            llm_api_base: env_string("LLM_API_BASE", "https://api.openai.com/v1"),
            llm_model: env_string("LLM_MODEL", "gpt-4o-mini"),
            llm_truncation_chars: env_usize("LLM_TRUNCATION_CHARS", 12_000),

            notifier_webhook_url: env_opt("NOTIFIER_WEBHOOK_URL"),
            request_timeout_secs: env_u64("REQUEST_TIMEOUT_SECONDS", 30),

            contact_enrichment_api_key: env_opt("CONTACT_ENRICHMENT_API_KEY"),
            contact_enrichment_base_url: env_opt("CONTACT_ENRICHMENT_BASE_URL"),

            company_directory_api_key: env_opt("COMPANY_DIRECTORY_API_KEY"),
            company_directory_base_url: env_opt("COMPANY_DIRECTORY_BASE_URL"),

            member_limit_table,
            meeting_demo_date_policy,
            worker_concurrency: env_usize("WORKER_CONCURRENCY", 4),
        };

        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if !self.dry_run {
            if self.crm_client_id.is_none() {
                bail!("CRM_CLIENT_ID is required unless DRY_RUN=true");
            }
            if self.crm_client_secret.is_none() {
                bail!("CRM_CLIENT_SECRET is required unless DRY_RUN=true");
            }
            if self.crm_refresh_token.is_none() {
                bail!("CRM_REFRESH_TOKEN is required unless DRY_RUN=true");
            }
        }
        if self.max_retries as usize != self.retry_intervals_secs.len() {
            bail!(
                "MAX_RETRIES ({}) must match the number of RETRY_INTERVALS entries ({})",
                self.max_retries,
                self.retry_intervals_secs.len()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Mutex, OnceLock};

    fn env_lock() -> &'static Mutex<()> {
        static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
        LOCK.get_or_init(|| Mutex::new(()))
    }

    fn clear_crm_env() {
        for key in ["DRY_RUN", "CRM_CLIENT_ID", "CRM_CLIENT_SECRET", "CRM_REFRESH_TOKEN"] {
            unsafe { std::env::remove_var(key); }
        }
    }

    #[test]
    fn load_fails_without_crm_credentials_when_not_dry_run() {
        let _guard = env_lock().lock().unwrap();
        clear_crm_env();
        unsafe { std::env::set_var("DRY_RUN", "false"); }
        let err = Config::load().unwrap_err();
        assert!(err.to_string().contains("CRM_CLIENT_ID"));
        clear_crm_env();
    }

    #[test]
    fn load_succeeds_dry_run_without_crm_credentials() {
        let _guard = env_lock().lock().unwrap();
        clear_crm_env();
        unsafe { std::env::set_var("DRY_RUN", "true"); }
        let cfg = Config::load().unwrap();
        assert!(cfg.dry_run);
        clear_crm_env();
    }

    #[test]
    fn load_succeeds_with_crm_credentials_set() {
        let _guard = env_lock().lock().unwrap();
        clear_crm_env();
        unsafe { std::env::set_var("DRY_RUN", "false"); }
        unsafe { std::env::set_var("CRM_CLIENT_ID", "id"); }
        unsafe { std::env::set_var("CRM_CLIENT_SECRET", "secret"); }
        unsafe { std::env::set_var("CRM_REFRESH_TOKEN", "token"); }
        let cfg = Config::load().unwrap();
        assert!(!cfg.dry_run);
        assert_eq!(cfg.crm_client_id.as_deref(), Some("id"));
        clear_crm_env();
    }

    #[test]
    fn default_retry_policy_is_three_intervals() {
        let _guard = env_lock().lock().unwrap();
        clear_crm_env();
        unsafe { std::env::set_var("DRY_RUN", "true"); }
        let cfg = Config::load().unwrap();
        assert_eq!(cfg.max_retries, 3);
        assert_eq!(cfg.retry_intervals_secs, vec![60, 120, 240]);
        clear_crm_env();
    }
}
