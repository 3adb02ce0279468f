//! Configuration for the evidence resolver

use clap::Parser;
use evidence_resolver::network::{Network, NetworkConfig, NetworkRegistry};
use evidence_resolver::scan::{RetryPolicy, SearchConfig, SelectionPolicy};
use evidence_resolver::BackfillMode;
use std::time::Duration;
use url::Url;

/// Dispute evidence URI resolver
///
/// Serves MetaEvidence URIs from the dispute subgraphs, falling back to a
/// resolution cache and historical log scans.
#[derive(Parser, Debug)]
#[command(name = "evidence-resolver")]
#[command(about = "Resolve dispute MetaEvidence URIs", long_about = None)]
pub struct Config {
    /// Host to bind the HTTP API to
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    pub host: String,

    /// Port for the HTTP API
    #[arg(long, env = "PORT", default_value = "8080")]
    pub port: u16,

    /// Networks to serve (comma-separated chain ids or names)
    #[arg(long, value_delimiter = ',', default_value = "mainnet,gnosis")]
    pub networks: Vec<Network>,

    /// Mainnet JSON-RPC endpoint used for historical scans
    #[arg(long, env = "PRIVATE_RPC_ENDPOINT_MAINNET")]
    pub rpc_mainnet: Option<Url>,

    /// Gnosis JSON-RPC endpoint used for historical scans
    #[arg(long, env = "PRIVATE_RPC_ENDPOINT_GNOSIS")]
    pub rpc_gnosis: Option<Url>,

    /// Override the mainnet dispute subgraph
    #[arg(long, env = "SUBGRAPH_URL_MAINNET")]
    pub subgraph_mainnet: Option<Url>,

    /// Override the gnosis dispute subgraph
    #[arg(long, env = "SUBGRAPH_URL_GNOSIS")]
    pub subgraph_gnosis: Option<Url>,

    /// Override the first mainnet block scanned for MetaEvidence
    #[arg(long)]
    pub mainnet_start_block: Option<u64>,

    /// Override the first gnosis block scanned for MetaEvidence
    #[arg(long)]
    pub gnosis_start_block: Option<u64>,

    /// Resolution cache database (`postgres://...`, `sqlite:...` or a file path)
    #[arg(long, env = "DATABASE_URL", default_value = "./evidence-resolver.db")]
    pub database_url: String,

    /// Send backfills to this notice endpoint instead of running them in-process
    #[arg(long, env = "NOTICE_METAEVIDENCE_URL")]
    pub notice_url: Option<Url>,

    /// Blocks per log query
    #[arg(long, default_value = "50000")]
    pub window_size: u64,

    /// Log queries in flight per backfill
    #[arg(long, default_value = "4")]
    pub max_concurrent_windows: usize,

    /// Timeout for one log query, in seconds
    #[arg(long, default_value = "600")]
    pub window_timeout: u64,

    /// Retries for a log query that failed transiently
    #[arg(long, default_value = "3")]
    pub max_retries: u32,

    /// Which registration wins when several match (`earliest` or `latest`)
    #[arg(long, default_value = "earliest")]
    pub selection: SelectionPolicy,

    /// Backfills running at once in-process
    #[arg(long, default_value = "4")]
    pub backfill_workers: usize,

    /// Backfill requests waiting in the in-process queue
    #[arg(long, default_value = "1024")]
    pub backfill_queue_size: usize,

    /// How long a running backfill claims its key, in seconds
    #[arg(long, default_value = "1800")]
    pub claim_ttl: u64,

    /// Subgraph request timeout, in seconds
    #[arg(long, default_value = "30")]
    pub index_timeout: u64,

    /// Graceful shutdown timeout, in seconds
    #[arg(long, default_value = "30")]
    pub shutdown_timeout: u64,
}

impl Config {
    /// Builds the registry of served networks with CLI overrides applied.
    pub fn network_registry(&self) -> NetworkRegistry {
        let mut registry = NetworkRegistry::new();
        for &network in &self.networks {
            let (rpc, subgraph, start_block) = match network {
                Network::Mainnet => (
                    &self.rpc_mainnet,
                    &self.subgraph_mainnet,
                    self.mainnet_start_block,
                ),
                Network::Gnosis => (
                    &self.rpc_gnosis,
                    &self.subgraph_gnosis,
                    self.gnosis_start_block,
                ),
            };

            let mut config = NetworkConfig::defaults(network);
            if let Some(url) = rpc {
                config = config.with_rpc_url(url.clone());
            }
            if let Some(url) = subgraph {
                config = config.with_subgraph_url(url.clone());
            }
            if let Some(block) = start_block {
                config = config.with_start_block(block);
            }
            registry.insert(config);
        }
        registry
    }

    pub fn search_config(&self) -> SearchConfig {
        SearchConfig::default()
            .with_window_size(self.window_size)
            .with_max_concurrent_windows(self.max_concurrent_windows)
            .with_window_timeout(Duration::from_secs(self.window_timeout))
            .with_retry(RetryPolicy {
                max_retries: self.max_retries,
                ..RetryPolicy::default()
            })
            .with_selection(self.selection)
    }

    pub fn backfill_mode(&self) -> BackfillMode {
        match &self.notice_url {
            Some(url) => BackfillMode::Http(url.clone()),
            None => BackfillMode::InProcess,
        }
    }
}
