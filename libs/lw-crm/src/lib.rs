//! Outbound CRM client: token-caching OAuth refresh plus upsert-by-email,
//! find-by-email, note and task creation (spec §4.9). `DryRunCrmClient`
//! gives every handler the same interface without performing any real
//! write, for `DRY_RUN=true`.

mod token;

use async_trait::async_trait;
use lw_core::PipelineError;
use lw_kv::SharedKvStore;
use serde_json::Value;
use time::OffsetDateTime;
use tokio::sync::Mutex;

pub use token::{ReqwestTokenTransport, TokenCache, TokenRequest, TokenTransport};

const TOKEN_CACHE_KEY: &str = "crm:access_token";

#[derive(serde::Deserialize, serde::Serialize)]
struct StoredToken {
    access_token: String,
    #[serde(with = "time::serde::rfc3339")]
    expires_at: OffsetDateTime,
}

impl From<TokenCache> for StoredToken {
    fn from(cache: TokenCache) -> Self {
        Self {
            access_token: cache.access_token,
            expires_at: cache.expires_at,
        }
    }
}

impl From<StoredToken> for TokenCache {
    fn from(stored: StoredToken) -> Self {
        Self {
            access_token: stored.access_token,
            expires_at: stored.expires_at,
        }
    }
}

#[derive(Debug, Clone, serde::Deserialize, serde::Serialize)]
pub struct Lead {
    pub id: String,
    pub email: String,
    pub fields: Value,
}

#[async_trait]
pub trait CrmClient: Send + Sync {
    async fn find_lead_by_email(&self, email: &str) -> Result<Option<Lead>, PipelineError>;
    async fn upsert_lead_by_email(&self, email: &str, fields: Value) -> Result<Lead, PipelineError>;
    async fn create_note(&self, lead_id: &str, title: &str, body: &str) -> Result<(), PipelineError>;
    async fn create_task(
        &self,
        lead_id: &str,
        subject: &str,
        due: OffsetDateTime,
        priority: &str,
        body: &str,
    ) -> Result<(), PipelineError>;
}

/// Logs every call and returns a synthetic success, never touching the
/// network. Used when `DRY_RUN=true`.
pub struct DryRunCrmClient;

#[async_trait]
impl CrmClient for DryRunCrmClient {
    async fn find_lead_by_email(&self, email: &str) -> Result<Option<Lead>, PipelineError> {
        tracing::info!(email, "dry_run: find_lead_by_email skipped");
        Ok(None)
    }

    async fn upsert_lead_by_email(&self, email: &str, fields: Value) -> Result<Lead, PipelineError> {
        tracing::info!(email, %fields, "dry_run: upsert_lead_by_email skipped");
        Ok(Lead {
            id: format!("dry-run:{email}"),
            email: email.to_string(),
            fields,
        })
    }

    async fn create_note(&self, lead_id: &str, title: &str, body: &str) -> Result<(), PipelineError> {
        tracing::info!(lead_id, title, body, "dry_run: create_note skipped");
        Ok(())
    }

    async fn create_task(
        &self,
        lead_id: &str,
        subject: &str,
        due: OffsetDateTime,
        priority: &str,
        body: &str,
    ) -> Result<(), PipelineError> {
        tracing::info!(lead_id, subject, %due, priority, body, "dry_run: create_task skipped");
        Ok(())
    }
}

pub struct HttpCrmConfig {
    pub api_base: String,
}

/// Real CRM client: refreshes an OAuth token lazily (on expiry or on a
/// 401 response). The token is cached both in process memory (a
/// `tokio::sync::Mutex`, for the common case of one worker refreshing
/// its own token) and in the shared K/V store under
/// [`TOKEN_CACHE_KEY`], so a fleet of worker processes shares a single
/// refresh rather than each hitting the CRM token endpoint.
pub struct HttpCrmClient<T: TokenTransport = ReqwestTokenTransport> {
    http: reqwest::Client,
    cfg: HttpCrmConfig,
    transport: T,
    token: Mutex<Option<TokenCache>>,
    kv: Option<SharedKvStore>,
}

impl<T: TokenTransport> HttpCrmClient<T> {
    pub fn with_transport(http: reqwest::Client, cfg: HttpCrmConfig, transport: T) -> Self {
        Self {
            http,
            cfg,
            transport,
            token: Mutex::new(None),
            kv: None,
        }
    }

    pub fn with_kv_cache(mut self, kv: SharedKvStore) -> Self {
        self.kv = Some(kv);
        self
    }

    async fn access_token(&self) -> Result<String, PipelineError> {
        let mut guard = self.token.lock().await;
        if let Some(cached) = guard.as_ref() {
            if cached.expires_at > OffsetDateTime::now_utc() {
                return Ok(cached.access_token.clone());
            }
        }
        if let Some(cached) = self.load_from_kv().await {
            if cached.expires_at > OffsetDateTime::now_utc() {
                let token = cached.access_token.clone();
                *guard = Some(cached);
                return Ok(token);
            }
        }
        let fresh = self.transport.refresh().await?;
        self.store_to_kv(&fresh).await;
        let token = fresh.access_token.clone();
        *guard = Some(fresh);
        Ok(token)
    }

    async fn load_from_kv(&self) -> Option<TokenCache> {
        let kv = self.kv.as_ref()?;
        let bytes = kv.get(TOKEN_CACHE_KEY).await.ok()??;
        serde_json::from_slice::<StoredToken>(&bytes).ok().map(Into::into)
    }

    async fn store_to_kv(&self, cache: &TokenCache) {
        let Some(kv) = self.kv.as_ref() else { return };
        let stored = StoredToken::from(cache.clone());
        let Ok(bytes) = serde_json::to_vec(&stored) else { return };
        if let Err(err) = kv.set(TOKEN_CACHE_KEY, bytes).await {
            tracing::warn!(error = %err, "failed to persist CRM token to shared cache");
        }
    }

    async fn invalidate_token(&self) {
        self.token.lock().await.take();
        if let Some(kv) = self.kv.as_ref() {
            let _ = kv.delete(TOKEN_CACHE_KEY).await;
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.cfg.api_base.trim_end_matches('/'), path)
    }

    async fn request_with_retry(
        &self,
        build: impl Fn(&str) -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response, PipelineError> {
        let token = self.access_token().await?;
        let resp = build(&token)
            .send()
            .await
            .map_err(|err| PipelineError::transient("crm_http", err.to_string(), None))?;
        if resp.status().as_u16() == 401 {
            self.invalidate_token().await;
            let token = self.access_token().await?;
            return build(&token)
                .send()
                .await
                .map_err(|err| PipelineError::transient("crm_http", err.to_string(), None));
        }
        Ok(resp)
    }

    async fn classify(resp: reqwest::Response) -> Result<Value, PipelineError> {
        let status = resp.status().as_u16();
        if (200..300).contains(&status) {
            resp.json::<Value>()
                .await
                .map_err(|err| PipelineError::transient("crm_http", err.to_string(), None))
        } else {
            let body = resp.text().await.unwrap_or_default();
            Err(PipelineError::from_http_status("crm_http", status, body))
        }
    }
}

#[async_trait]
impl<T: TokenTransport> CrmClient for HttpCrmClient<T> {
    async fn find_lead_by_email(&self, email: &str) -> Result<Option<Lead>, PipelineError> {
        let url = self.url("/leads/search");
        let resp = self
            .request_with_retry(|token| self.http.get(&url).bearer_auth(token).query(&[("email", email)]))
            .await?;
        if resp.status().as_u16() == 404 {
            return Ok(None);
        }
        let value = Self::classify(resp).await?;
        if value.is_null() {
            return Ok(None);
        }
        let lead: Lead = serde_json::from_value(value).map_err(|err| PipelineError::permanent("crm_decode", err.to_string()))?;
        Ok(Some(lead))
    }

    async fn upsert_lead_by_email(&self, email: &str, fields: Value) -> Result<Lead, PipelineError> {
        let url = self.url("/leads/upsert");
        let body = serde_json::json!({ "email": email, "fields": fields });
        let resp = self
            .request_with_retry(|token| self.http.post(&url).bearer_auth(token).json(&body))
            .await?;
        let value = Self::classify(resp).await?;
        serde_json::from_value(value).map_err(|err| PipelineError::permanent("crm_decode", err.to_string()))
    }

    async fn create_note(&self, lead_id: &str, title: &str, body: &str) -> Result<(), PipelineError> {
        let url = self.url(&format!("/leads/{lead_id}/notes"));
        let payload = serde_json::json!({ "title": title, "body": body });
        let resp = self
            .request_with_retry(|token| self.http.post(&url).bearer_auth(token).json(&payload))
            .await?;
        Self::classify(resp).await.map(|_| ())
    }

    async fn create_task(
        &self,
        lead_id: &str,
        subject: &str,
        due: OffsetDateTime,
        priority: &str,
        body: &str,
    ) -> Result<(), PipelineError> {
        let url = self.url(&format!("/leads/{lead_id}/tasks"));
        let due_str = due
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap_or_default();
        let payload = serde_json::json!({
            "subject": subject,
            "due": due_str,
            "priority": priority,
            "body": body,
        });
        let resp = self
            .request_with_retry(|token| self.http.post(&url).bearer_auth(token).json(&payload))
            .await?;
        Self::classify(resp).await.map(|_| ())
    }
}
