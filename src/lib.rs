//! Dispute evidence URI resolver.
//!
//! Resolves the MetaEvidence URI of an arbitration dispute by asking a fast
//! index first, then a persistent resolution cache, and finally scheduling an
//! out-of-band backfill that scans historical logs in bounded windows.

pub mod backfill;
pub mod cache;
pub mod http;
pub mod index;
pub mod metrics;
pub mod network;
pub mod resolver;
pub mod scan;
pub mod validate;

pub use async_trait::async_trait;
pub use axum;
pub use tokio;

pub use backfill::{
    BackfillDispatcher, BackfillError, BackfillJob, BackfillRequest, BackfillSender,
    BackfillService, HttpBackfillDispatcher,
};
pub use cache::{CacheConfig, CacheError, EvidenceKey, EvidenceRecord, ResolutionCache};
pub use index::{DisputeIndex, IndexError, IndexedDispute, SubgraphIndex};
pub use network::{Network, NetworkConfig, NetworkRegistry};
pub use resolver::{Resolution, ResolveError, Resolver};
pub use scan::{
    BatchedHistoricalSearch, LedgerScanner, RangeScanner, ScanError, SearchConfig, SelectionPolicy,
};

use anyhow::{bail, Context};
use axum::Router as AxumRouter;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any as CorsAny, CorsLayer};
use url::Url;

use http::{create_http_router, HttpState};

/// Where backfill requests go once the resolver misses on both tiers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackfillMode {
    /// Queue on a bounded channel served by a worker task in this process.
    InProcess,
    /// POST to a `notice-metaevidence` endpoint of another deployment.
    Http(Url),
}

/// Configuration for the resolver server.
pub struct ResolverServerConfig {
    /// Port to listen on.
    pub port: u16,

    /// Host to bind to.
    pub host: String,

    /// Supported networks and their endpoints.
    pub networks: NetworkRegistry,

    pub cache: CacheConfig,

    pub search: SearchConfig,

    pub backfill_mode: BackfillMode,

    /// How long a running backfill keeps others from starting the same key.
    pub claim_ttl: Duration,

    /// Capacity of the in-process backfill queue.
    pub backfill_queue_size: usize,

    /// Maximum number of backfills running at once in-process.
    pub backfill_workers: usize,

    /// Request timeout for subgraph queries.
    pub index_timeout: Duration,

    /// Request timeout for RPC log reads.
    pub rpc_timeout: Duration,

    /// Scanner override. When `None`, one HTTP provider per configured RPC endpoint is used.
    pub scanner: Option<Arc<dyn RangeScanner>>,

    /// Index override. When `None`, the configured subgraphs are queried.
    pub index: Option<Arc<dyn DisputeIndex>>,

    /// Extra routes merged into the HTTP router (e.g. `/metrics`).
    pub routes: Option<AxumRouter>,

    /// Graceful shutdown timeout in seconds (default: 30).
    ///
    /// After the server stops, running in-process backfills get this long to finish.
    pub shutdown_timeout: u64,
}

impl ResolverServerConfig {
    pub fn builder() -> ResolverServerConfigBuilder {
        ResolverServerConfigBuilder::default()
    }
}

/// Builder for ResolverServerConfig.
#[derive(Default)]
pub struct ResolverServerConfigBuilder {
    port: Option<u16>,
    host: Option<String>,
    networks: Option<NetworkRegistry>,
    cache: Option<CacheConfig>,
    search: Option<SearchConfig>,
    backfill_mode: Option<BackfillMode>,
    claim_ttl: Option<Duration>,
    backfill_queue_size: Option<usize>,
    backfill_workers: Option<usize>,
    index_timeout: Option<Duration>,
    rpc_timeout: Option<Duration>,
    scanner: Option<Arc<dyn RangeScanner>>,
    index: Option<Arc<dyn DisputeIndex>>,
    routes: Option<AxumRouter>,
    shutdown_timeout: Option<u64>,
}

impl ResolverServerConfigBuilder {
    pub fn port(mut self, port: u16) -> Self {
        self.port = Some(port);
        self
    }

    pub fn host(mut self, host: String) -> Self {
        self.host = Some(host);
        self
    }

    /// Replaces the default network registry (mainnet and gnosis).
    pub fn networks(mut self, networks: NetworkRegistry) -> Self {
        self.networks = Some(networks);
        self
    }

    pub fn database_url(mut self, database_url: impl Into<String>) -> Self {
        self.cache.get_or_insert_with(CacheConfig::default).database_url = database_url.into();
        self
    }

    pub fn cache(mut self, cache: CacheConfig) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn search(mut self, search: SearchConfig) -> Self {
        self.search = Some(search);
        self
    }

    pub fn backfill_mode(mut self, mode: BackfillMode) -> Self {
        self.backfill_mode = Some(mode);
        self
    }

    pub fn claim_ttl(mut self, ttl: Duration) -> Self {
        self.claim_ttl = Some(ttl);
        self
    }

    pub fn backfill_queue_size(mut self, size: usize) -> Self {
        self.backfill_queue_size = Some(size);
        self
    }

    pub fn backfill_workers(mut self, workers: usize) -> Self {
        self.backfill_workers = Some(workers);
        self
    }

    pub fn index_timeout(mut self, timeout: Duration) -> Self {
        self.index_timeout = Some(timeout);
        self
    }

    pub fn rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = Some(timeout);
        self
    }

    pub fn with_scanner(mut self, scanner: Arc<dyn RangeScanner>) -> Self {
        self.scanner = Some(scanner);
        self
    }

    pub fn with_index(mut self, index: Arc<dyn DisputeIndex>) -> Self {
        self.index = Some(index);
        self
    }

    /// Merges extra routes into the HTTP router.
    pub fn with_routes(mut self, routes: AxumRouter) -> Self {
        self.routes = Some(match self.routes.take() {
            Some(existing) => existing.merge(routes),
            None => routes,
        });
        self
    }

    pub fn shutdown_timeout(mut self, seconds: u64) -> Self {
        self.shutdown_timeout = Some(seconds);
        self
    }

    pub fn build(self) -> ResolverServerConfig {
        ResolverServerConfig {
            port: self.port.unwrap_or(8080),
            host: self.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            networks: self.networks.unwrap_or_else(NetworkRegistry::with_defaults),
            cache: self.cache.unwrap_or_default(),
            search: self.search.unwrap_or_default(),
            backfill_mode: self.backfill_mode.unwrap_or(BackfillMode::InProcess),
            claim_ttl: self.claim_ttl.unwrap_or(backfill::DEFAULT_CLAIM_TTL),
            backfill_queue_size: self.backfill_queue_size.unwrap_or(1024),
            backfill_workers: self.backfill_workers.unwrap_or(4),
            index_timeout: self.index_timeout.unwrap_or(Duration::from_secs(30)),
            rpc_timeout: self.rpc_timeout.unwrap_or(Duration::from_secs(600)),
            scanner: self.scanner,
            index: self.index,
            routes: self.routes,
            shutdown_timeout: self.shutdown_timeout.unwrap_or(30),
        }
    }
}

/// Starts the resolver HTTP server and the backfill worker, and runs until
/// SIGINT or SIGTERM.
pub async fn run(config: ResolverServerConfig) -> anyhow::Result<()> {
    if config.networks.is_empty() {
        bail!("no networks configured");
    }

    let networks = Arc::new(config.networks);
    for network in networks.iter() {
        tracing::info!(
            target: "evidence_resolver::main",
            network = %network.network,
            chain_id = network.network.chain_id(),
            arbitrator = %network.arbitrator,
            start_block = network.start_block,
            rpc = network.rpc_url.is_some(),
            subgraph = network.subgraph_url.is_some(),
            "Network configured"
        );
    }

    let cache = ResolutionCache::connect(config.cache)
        .await
        .context("failed to open resolution cache")?;

    let scanner: Arc<dyn RangeScanner> = match config.scanner {
        Some(scanner) => scanner,
        None => Arc::new(
            LedgerScanner::from_registry(&networks, config.rpc_timeout)
                .context("failed to build RPC providers")?,
        ),
    };
    let index: Arc<dyn DisputeIndex> = match config.index {
        Some(index) => index,
        None => Arc::new(
            SubgraphIndex::from_registry(&networks, config.index_timeout)
                .context("failed to build subgraph client")?,
        ),
    };

    tracing::info!(
        target: "evidence_resolver::main",
        window_size = config.search.window_size,
        max_concurrent_windows = config.search.max_concurrent_windows,
        selection = %config.search.selection,
        "Historical search configured"
    );
    let search = BatchedHistoricalSearch::new(scanner, config.search);
    let job = Arc::new(
        BackfillJob::new(networks.clone(), cache.clone(), search).with_claim_ttl(config.claim_ttl),
    );

    let mut http_dispatcher = None;
    let (dispatcher, backfill_service): (Arc<dyn BackfillDispatcher>, Option<BackfillService>) =
        match config.backfill_mode {
            BackfillMode::InProcess => {
                let (sender, service) = BackfillService::spawn(
                    job.clone(),
                    config.backfill_queue_size,
                    config.backfill_workers,
                );
                tracing::info!(
                    target: "evidence_resolver::main",
                    queue_size = config.backfill_queue_size,
                    workers = config.backfill_workers,
                    "Backfills run in-process"
                );
                (Arc::new(sender), Some(service))
            }
            BackfillMode::Http(url) => {
                // The notice endpoint answers only after its scan, so only
                // connecting is time-bounded.
                let client = reqwest::Client::builder()
                    .connect_timeout(config.index_timeout)
                    .build()
                    .context("failed to build backfill HTTP client")?;
                tracing::info!(
                    target: "evidence_resolver::main",
                    url = %url,
                    "Backfills dispatched over HTTP"
                );
                let dispatcher = HttpBackfillDispatcher::new(client, url);
                http_dispatcher = Some(dispatcher.clone());
                (Arc::new(dispatcher), None)
            }
        };

    let resolver = Resolver::new(networks, index, cache.clone(), dispatcher);
    let state = HttpState::new(resolver, job, cache.clone());

    let mut http_router = create_http_router(state);
    if let Some(routes) = config.routes {
        http_router = http_router.merge(routes);
    }

    let cors = CorsLayer::new()
        .allow_origin(CorsAny)
        .allow_methods(CorsAny)
        .allow_headers(CorsAny);

    let app = AxumRouter::new().merge(http_router).layer(cors);

    let addr: SocketAddr = format!("{}:{}", config.host, config.port)
        .parse()
        .context("invalid listen address")?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    tracing::info!(target: "evidence_resolver::main", "Server listening on {}", addr);

    let shutdown_token = CancellationToken::new();
    let server_shutdown_token = shutdown_token.clone();
    let shutdown_timeout = config.shutdown_timeout;

    let server = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(server_shutdown_token));

    // Let in-flight requests finish, but do not wait on them forever.
    const SERVER_SHUTDOWN_TIMEOUT_SECS: u64 = 15;
    tokio::select! {
        result = server => {
            if let Err(e) = result {
                tracing::error!(target: "evidence_resolver::main", "Server error: {}", e);
            }
        }
        _ = async {
            shutdown_token.cancelled().await;
            tokio::time::sleep(Duration::from_secs(SERVER_SHUTDOWN_TIMEOUT_SECS)).await;
        } => {
            tracing::warn!(
                target: "evidence_resolver::main",
                "Server connections did not close within {}s, forcing shutdown",
                SERVER_SHUTDOWN_TIMEOUT_SECS
            );
        }
    }

    // The router held the last senders; the worker now drains its queue.
    if let Some(service) = backfill_service {
        tracing::info!(
            target: "evidence_resolver::main",
            "HTTP server stopped, waiting for running backfills..."
        );
        match tokio::time::timeout(Duration::from_secs(shutdown_timeout), service.join()).await {
            Ok(()) => {
                tracing::info!(target: "evidence_resolver::main", "Backfill service stopped");
            }
            Err(_) => {
                tracing::warn!(
                    target: "evidence_resolver::main",
                    "Backfills did not complete within {}s timeout, forcing shutdown",
                    shutdown_timeout
                );
            }
        }
    }

    if let Some(dispatcher) = http_dispatcher {
        let pending = dispatcher.pending();
        if pending > 0 {
            tracing::info!(
                target: "evidence_resolver::main",
                pending,
                "Waiting for backfill notices to be delivered..."
            );
        }
        if tokio::time::timeout(Duration::from_secs(shutdown_timeout), dispatcher.join())
            .await
            .is_err()
        {
            tracing::warn!(
                target: "evidence_resolver::main",
                "Backfill notices still pending after {}s, dropping them",
                shutdown_timeout
            );
        }
    }

    cache.close().await;
    tracing::info!(target: "evidence_resolver::main", "Resolver shutdown complete");

    Ok(())
}

async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(target: "evidence_resolver::main", "Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(
                    target: "evidence_resolver::main",
                    "Failed to install SIGTERM handler: {}",
                    e
                );
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!(target: "evidence_resolver::main", "Received SIGINT (Ctrl+C), initiating graceful shutdown...");
        }
        () = terminate => {
            tracing::info!(target: "evidence_resolver::main", "Received SIGTERM, initiating graceful shutdown...");
        }
    }

    token.cancel();
}
