//! OpenSASE Alert Daemon - Main Entry Point
//!
//! Reads newline-delimited JSON security events from stdin and runs them
//! through the alert pipeline until EOF or Ctrl-C.

use anyhow::Context;
use sase_alerting::{AlertPipeline, AlertingConfig, InMemoryAlertRepository, StaticRuleEngine};
use sase_common::SystemClock;
use std::sync::Arc;
use tokio::io::BufReader;
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Events processed concurrently from stdin
const INGEST_CONCURRENCY: usize = 64;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("OpenSASE Alert Daemon v{}", env!("CARGO_PKG_VERSION"));

    let config = AlertingConfig::from_env().context("invalid alerting configuration")?;

    let pipeline = Arc::new(AlertPipeline::new(
        config,
        Arc::new(StaticRuleEngine::with_default_rules()),
        Arc::new(InMemoryAlertRepository::new()),
        SystemClock::shared(),
    )
    .context("failed to build alert pipeline")?);

    let handles = pipeline.start().await.context("startup recovery failed")?;

    let mut notifications = pipeline.subscribe();
    let logger = tokio::spawn(async move {
        loop {
            match notifications.recv().await {
                Ok(event) => match serde_json::to_string(&event) {
                    Ok(json) => tracing::info!(event = event.name(), %json, "alert event"),
                    Err(e) => tracing::warn!(error = %e, "unserializable alert event"),
                },
                Err(RecvError::Lagged(missed)) => tracing::warn!(missed, "event log fell behind"),
                Err(RecvError::Closed) => break,
            }
        }
    });

    tokio::select! {
        summary = pipeline.ingest_ndjson(BufReader::new(tokio::io::stdin()), INGEST_CONCURRENCY) => {
            let summary = summary.context("failed to read stdin")?;
            tracing::info!(lines = summary.lines, events = summary.events, malformed = summary.malformed, "input closed");
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupt received");
        }
    }

    handles.shutdown().await;
    let stats = pipeline.statistics(None).await?;
    tracing::info!(summary = %serde_json::to_string(&stats)?, "final statistics");
    logger.abort();

    Ok(())
}
