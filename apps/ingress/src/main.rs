//! HTTP ingress: verifies each source's signature, recognizes its event
//! types, and hands recognized events to the Staging Pipeline. Nothing in
//! this binary performs an outbound side effect beyond the K/V store and
//! the queue; all CRM/LLM/notifier work happens in the worker.

mod routes;
mod staging;
mod verify;

use std::sync::Arc;

use anyhow::{Context, Result};
use async_nats::jetstream;
use axum::Router;
use lw_config::Config;
use lw_dlq::DlqPublisher;
use lw_events::{EventStore, EventStoreConfig};
use lw_idempotency::{IdempotencyConfig, IdempotencyGuard};
use lw_kv::{NatsKvStore, SharedKvStore};
use lw_queue::Queue;
use tower_http::trace::TraceLayer;

use crate::verify::SourceVerifiers;

const KV_BUCKET: &str = "lw_store";

pub struct AppState {
    pub config: Arc<Config>,
    pub event_store: EventStore,
    pub idempotency: IdempotencyGuard,
    pub queue: Queue,
    pub dlq: DlqPublisher,
    pub nats: async_nats::Client,
    pub verifiers: SourceVerifiers,
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = match Config::load() {
        Ok(cfg) => Arc::new(cfg),
        Err(err) => {
            eprintln!("configuration error: {err:#}");
            std::process::exit(1);
        }
    };
    lw_telemetry::init("lw-ingress")?;

    let nats = async_nats::connect(&config.nats_url)
        .await
        .with_context(|| format!("connect to NATS at {}", config.nats_url))?;
    let js = jetstream::new(nats.clone());

    let kv: SharedKvStore = Arc::new(
        NatsKvStore::new(&js, KV_BUCKET, config.idempotency_ttl_secs.max(config.event_ttl_secs))
            .await
            .context("initialize K/V bucket")?,
    );

    let event_store = EventStore::new(
        kv.clone(),
        EventStoreConfig { ttl_secs: config.event_ttl_secs },
    );
    let idempotency = IdempotencyGuard::new(
        kv.clone(),
        IdempotencyConfig { ttl_secs: config.idempotency_ttl_secs },
    );
    let queue = Queue::connect(nats.clone(), kv.clone()).await.context("connect job queue")?;
    let dlq = DlqPublisher::new(nats.clone()).await.context("connect failure sink")?;
    let verifiers = SourceVerifiers::from_config(&config);

    let state = Arc::new(AppState {
        config: config.clone(),
        event_store,
        idempotency,
        queue,
        dlq,
        nats,
        verifiers,
    });

    let app: Router = routes::router(state).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("bind {}", config.bind_addr))?;
    tracing::info!(addr = %config.bind_addr, "ingress listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serve ingress")?;

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
    tracing::info!("shutdown signal received, draining in-flight requests");
}
