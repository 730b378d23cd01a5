//! Structured logging bootstrap. `init()` wires a `tracing-subscriber`
//! JSON or plain-text formatter with an `EnvFilter`, matching the
//! `LOG_FORMAT`/`RUST_LOG` convention used throughout this core. No
//! distributed-tracing exporter is wired (see DESIGN.md for why); this
//! core emits logs and `metrics` counters/gauges, not spans shipped to a
//! collector.

use std::sync::OnceLock;

use anyhow::Result;
use tracing_subscriber::{EnvFilter, Layer, layer::SubscriberExt, util::SubscriberInitExt};

static INIT: OnceLock<()> = OnceLock::new();

pub fn init(service_name: &str) -> Result<()> {
    if INIT.get().is_some() {
        return Ok(());
    }

    let json_logs = std::env::var("LOG_FORMAT").map(|v| v != "text").unwrap_or(true);
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string())))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = if json_logs {
        tracing_subscriber::fmt::layer().json().flatten_event(true).boxed()
    } else {
        tracing_subscriber::fmt::layer().boxed()
    };

    tracing_subscriber::registry().with(env_filter).with(fmt_layer).try_init().ok();

    INIT.set(()).ok();
    tracing::info!(service = service_name, "telemetry initialized");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_is_idempotent() {
        init("test-service").unwrap();
        init("test-service").unwrap();
    }
}
