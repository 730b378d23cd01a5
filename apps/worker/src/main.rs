//! Background Job Runner: pulls staged jobs off the Queue and executes
//! them against the Handler Set, one worker task per concurrent job up
//! to `WORKER_CONCURRENCY`.

mod enrichment;
mod runner;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_nats::jetstream;
use futures::StreamExt;
use lw_config::Config;
use lw_crm::{CrmClient, DryRunCrmClient, HttpCrmClient, HttpCrmConfig, ReqwestTokenTransport, TokenRequest};
use lw_dlq::DlqPublisher;
use lw_events::{EventStore, EventStoreConfig};
use lw_handlers::{Clients, CompanyDirectory, ContactEnrichment, FollowUpStaging, LogoFetcher, WebsiteScraper};
use lw_idempotency::{IdempotencyConfig, IdempotencyGuard};
use lw_kv::{NatsKvStore, SharedKvStore};
use lw_llm::{Extractor, LlmClient, LlmConfig, ReqwestLlmTransport};
use lw_notifier::Notifier;
use lw_queue::{Queue, RetryPolicy};
use tokio::sync::Semaphore;

use crate::enrichment::{HttpCompanyDirectory, HttpContactEnrichment, HttpLogoFetcher, HttpWebsiteScraper, QueueFollowUpStaging};
use crate::runner::{RunnerCtx, ack_kind, process_job};

const KV_BUCKET: &str = "lw_store";
const CONSUMER_NAME: &str = "lw-worker";

#[tokio::main]
async fn main() -> Result<()> {
    let config = match Config::load() {
        Ok(cfg) => Arc::new(cfg),
        Err(err) => {
            eprintln!("configuration error: {err:#}");
            std::process::exit(1);
        }
    };
    lw_telemetry::init("lw-worker")?;

    let nats = async_nats::connect(&config.nats_url)
        .await
        .with_context(|| format!("connect to NATS at {}", config.nats_url))?;
    let js = jetstream::new(nats.clone());

    let kv: SharedKvStore = Arc::new(
        NatsKvStore::new(&js, KV_BUCKET, config.idempotency_ttl_secs.max(config.event_ttl_secs))
            .await
            .context("initialize K/V bucket")?,
    );

    let event_store = EventStore::new(kv.clone(), EventStoreConfig { ttl_secs: config.event_ttl_secs });
    let idempotency = Arc::new(IdempotencyGuard::new(kv.clone(), IdempotencyConfig { ttl_secs: config.idempotency_ttl_secs }));
    let queue = Arc::new(Queue::connect(nats.clone(), kv.clone()).await.context("connect job queue")?);
    let dlq = DlqPublisher::new(nats.clone()).await.context("connect failure sink")?;

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(config.request_timeout_secs))
        .build()
        .context("build HTTP client")?;

    let crm: Arc<dyn CrmClient> = if config.dry_run {
        Arc::new(DryRunCrmClient)
    } else {
        let transport = ReqwestTokenTransport::new(
            http.clone(),
            TokenRequest {
                token_endpoint: config.crm_token_endpoint.clone().unwrap_or_default(),
                client_id: config.crm_client_id.clone().unwrap_or_default(),
                client_secret: config.crm_client_secret.clone().unwrap_or_default(),
                refresh_token: config.crm_refresh_token.clone().unwrap_or_default(),
            },
        );
        Arc::new(
            HttpCrmClient::with_transport(http.clone(), HttpCrmConfig { api_base: config.crm_api_base.clone() }, transport)
                .with_kv_cache(kv.clone()),
        )
    };

    let llm: Arc<dyn Extractor> = Arc::new(LlmClient::new(ReqwestLlmTransport::new(
        http.clone(),
        LlmConfig {
            api_base: config.llm_api_base.clone(),
            api_key: config.llm_api_key.clone(),
            model: config.llm_model.clone(),
        },
    )));

    let notifier = Arc::new(Notifier::new(http.clone(), config.notifier_webhook_url.clone()));

    let contact_enrichment: Option<Arc<dyn ContactEnrichment>> =
        match (&config.contact_enrichment_base_url, &config.contact_enrichment_api_key) {
            (Some(base), Some(key)) => Some(Arc::new(HttpContactEnrichment::new(http.clone(), base.clone(), key.clone()))),
            _ => None,
        };
    let scraper: Option<Arc<dyn WebsiteScraper>> = Some(Arc::new(HttpWebsiteScraper::new(http.clone())));
    let logo_fetcher: Option<Arc<dyn LogoFetcher>> = Some(Arc::new(HttpLogoFetcher::new(http.clone())));
    let company_directory: Option<Arc<dyn CompanyDirectory>> =
        match (&config.company_directory_base_url, &config.company_directory_api_key) {
            (Some(base), Some(key)) => Some(Arc::new(HttpCompanyDirectory::new(http.clone(), base.clone(), key.clone()))),
            _ => None,
        };
    let staging: Option<Arc<dyn FollowUpStaging>> =
        Some(Arc::new(QueueFollowUpStaging::new(event_store.clone(), idempotency.clone(), queue.clone())));

    let clients = Clients {
        crm,
        llm,
        notifier,
        config: config.clone(),
        contact_enrichment,
        scraper,
        logo_fetcher,
        company_directory,
        staging,
    };

    let retry_policy = RetryPolicy {
        max_retries: config.max_retries,
        intervals: config.retry_intervals_secs.iter().map(|s| Duration::from_secs(*s)).collect(),
    };

    let ctx = Arc::new(RunnerCtx { event_store, idempotency, queue: queue.clone(), dlq, clients, retry_policy });

    let mut messages = queue.subscribe(CONSUMER_NAME).await.context("subscribe to job queue")?;
    let permits = Arc::new(Semaphore::new(config.worker_concurrency.max(1)));
    tracing::info!(concurrency = config.worker_concurrency, "worker ready");

    loop {
        tokio::select! {
            next = messages.next() => {
                let Some(next) = next else { break };
                let msg = match next {
                    Ok(msg) => msg,
                    Err(err) => {
                        tracing::error!("jetstream message error: {err}");
                        continue;
                    }
                };
                let envelope: lw_queue::JobEnvelope = match serde_json::from_slice(&msg.payload) {
                    Ok(env) => env,
                    Err(err) => {
                        tracing::error!(error = %err, "malformed job envelope, acking to drop it");
                        if let Err(ack_err) = msg.ack().await {
                            tracing::error!(error = %ack_err, "ack failed");
                        }
                        continue;
                    }
                };
                let ctx = ctx.clone();
                let permits = permits.clone();
                tokio::spawn(async move {
                    let _permit = permits.acquire_owned().await.expect("semaphore never closes");
                    let decision = process_job(&ctx, &envelope).await;
                    let result = match ack_kind(decision) {
                        None => msg.ack().await,
                        Some(kind) => msg.ack_with(kind).await,
                    };
                    if let Err(err) = result {
                        tracing::error!(error = %err, "failed to ack/nak job message");
                    }
                });
            }
            _ = shutdown_signal() => {
                tracing::info!("shutdown signal received, stopping job intake");
                break;
            }
        }
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("install ctrl_c handler");
    };
    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("install sigterm handler")
            .recv()
            .await;
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
