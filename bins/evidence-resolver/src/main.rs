//! Evidence Resolver - dispute MetaEvidence URI service
//!
//! # Usage
//!
//! ```bash
//! # Serve both networks, backfilling in-process into a local SQLite cache
//! PRIVATE_RPC_ENDPOINT_MAINNET=https://... PRIVATE_RPC_ENDPOINT_GNOSIS=https://... evidence-resolver
//!
//! # Hand backfills to another deployment
//! evidence-resolver --notice-url https://resolver.example/notice-metaevidence
//! ```

mod config;

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use clap::Parser;
use config::Config;
use evidence_resolver::{CacheConfig, ResolverServerConfig};
use metrics_exporter_prometheus::PrometheusBuilder;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(true)
        .init();

    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .context("failed to install Prometheus recorder")?;
    evidence_resolver::metrics::describe();
    let metrics_routes = Router::new().route(
        "/metrics",
        get(move || {
            let prometheus = prometheus.clone();
            async move { prometheus.render() }
        }),
    );

    tracing::info!(target: "evidence_resolver::main", "Starting evidence resolver");
    if let Some(url) = &config.notice_url {
        tracing::info!(target: "evidence_resolver::main", "Notice endpoint: {}", url);
    }

    let server_config = ResolverServerConfig::builder()
        .host(config.host.clone())
        .port(config.port)
        .networks(config.network_registry())
        .cache(CacheConfig {
            database_url: config.database_url.clone(),
            ..CacheConfig::default()
        })
        .search(config.search_config())
        .backfill_mode(config.backfill_mode())
        .claim_ttl(Duration::from_secs(config.claim_ttl))
        .backfill_workers(config.backfill_workers)
        .backfill_queue_size(config.backfill_queue_size)
        .index_timeout(Duration::from_secs(config.index_timeout))
        .rpc_timeout(Duration::from_secs(config.window_timeout))
        .with_routes(metrics_routes)
        .shutdown_timeout(config.shutdown_timeout)
        .build();

    evidence_resolver::run(server_config).await
}
