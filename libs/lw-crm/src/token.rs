use async_trait::async_trait;
use lw_core::PipelineError;
use serde::Deserialize;
use time::{Duration, OffsetDateTime};

#[derive(Debug, Clone)]
pub struct TokenCache {
    pub access_token: String,
    pub expires_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct TokenRequest {
    pub token_endpoint: String,
    pub client_id: String,
    pub client_secret: String,
    pub refresh_token: String,
}

/// Trait-isolated transport for the OAuth token refresh call, mirroring
/// the oauth-start transport abstraction used elsewhere in this
/// workspace: production code talks to `reqwest`, tests substitute a
/// mock that never hits the network.
#[async_trait]
pub trait TokenTransport: Send + Sync {
    async fn refresh(&self) -> Result<TokenCache, PipelineError>;
}

#[derive(Clone)]
pub struct ReqwestTokenTransport {
    http: reqwest::Client,
    request: TokenRequest,
}

impl ReqwestTokenTransport {
    pub fn new(http: reqwest::Client, request: TokenRequest) -> Self {
        Self { http, request }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: i64,
}

#[async_trait]
impl TokenTransport for ReqwestTokenTransport {
    async fn refresh(&self) -> Result<TokenCache, PipelineError> {
        let resp = self
            .http
            .post(&self.request.token_endpoint)
            .form(&[
                ("grant_type", "refresh_token"),
                ("client_id", &self.request.client_id),
                ("client_secret", &self.request.client_secret),
                ("refresh_token", &self.request.refresh_token),
            ])
            .send()
            .await
            .map_err(|err| PipelineError::transient("crm_token_refresh", err.to_string(), None))?;

        let status = resp.status().as_u16();
        if !(200..300).contains(&status) {
            let body = resp.text().await.unwrap_or_default();
            return Err(PipelineError::from_http_status("crm_token_refresh", status, body));
        }

        let parsed: TokenResponse = resp
            .json()
            .await
            .map_err(|err| PipelineError::transient("crm_token_refresh", err.to_string(), None))?;

        // refresh 30s early so a request started just before expiry still
        // completes with a token the CRM accepts.
        let expires_at = OffsetDateTime::now_utc() + Duration::seconds((parsed.expires_in - 30).max(1));
        Ok(TokenCache {
            access_token: parsed.access_token,
            expires_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Clone)]
    struct MockTransport {
        result: Arc<Mutex<Result<TokenCache, PipelineError>>>,
        calls: Arc<Mutex<u32>>,
    }

    impl MockTransport {
        fn new(result: Result<TokenCache, PipelineError>) -> Self {
            Self {
                result: Arc::new(Mutex::new(result)),
                calls: Arc::new(Mutex::new(0)),
            }
        }
    }

    #[async_trait]
    impl TokenTransport for MockTransport {
        async fn refresh(&self) -> Result<TokenCache, PipelineError> {
            *self.calls.lock().unwrap() += 1;
            self.result.lock().unwrap().clone()
        }
    }

    #[tokio::test]
    async fn mock_transport_surfaces_transient_error_on_failure() {
        let transport = MockTransport::new(Err(PipelineError::transient("crm_token_refresh", "timeout", None)));
        let err = transport.refresh().await.unwrap_err();
        assert!(err.is_transient());
        assert_eq!(*transport.calls.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn mock_transport_returns_cache_on_success() {
        let cache = TokenCache {
            access_token: "abc".into(),
            expires_at: OffsetDateTime::now_utc() + Duration::seconds(3600),
        };
        let transport = MockTransport::new(Ok(cache.clone()));
        let result = transport.refresh().await.unwrap();
        assert_eq!(result.access_token, "abc");
    }
}
