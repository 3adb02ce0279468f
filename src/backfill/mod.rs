//! Out-of-band historical backfill.
//!
//! When neither the index nor the cache knows a dispute's MetaEvidence URI,
//! the resolver hands a [`BackfillRequest`] to a [`BackfillDispatcher`]. The
//! request eventually reaches [`BackfillJob::run`], which scans history and
//! writes the answer into the resolution cache for the next lookup.

pub mod http;
pub mod service;

use alloy::primitives::{Address, U256};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::cache::{CacheError, EvidenceKey, EvidenceRecord, InsertOutcome, ResolutionCache};
use crate::metrics;
use crate::network::{Network, NetworkConfig, NetworkRegistry, UnsupportedNetwork};
use crate::scan::{BatchedHistoricalSearch, ScanError};
use crate::validate::{validate_address, validate_network, validate_number, validate_u256, ValidationError};

pub use http::HttpBackfillDispatcher;
pub use service::{BackfillSender, BackfillService};

/// How long a running backfill holds its claim before others may retry.
pub const DEFAULT_CLAIM_TTL: Duration = Duration::from_secs(30 * 60);

/// One unit of backfill work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BackfillRequest {
    pub network: Network,
    pub emitter: Address,
    pub reference_id: U256,
    /// Last block worth scanning, typically the dispute creation block.
    pub end_block: u64,
}

impl BackfillRequest {
    pub fn key(&self) -> EvidenceKey {
        EvidenceKey::new(self.network, self.emitter, self.reference_id)
    }
}

/// JSON body of a backfill notice.
///
/// Fields accept strings or numbers so callers can post chain ids and block
/// numbers either way.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoticeRequest {
    pub chain_id: Option<Value>,
    pub arbitrable: Option<Value>,
    pub meta_evidence_id: Option<Value>,
    pub end_block: Option<Value>,
}

fn param(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

impl NoticeRequest {
    pub fn validate(&self, registry: &NetworkRegistry) -> Result<BackfillRequest, ValidationError> {
        let chain_id = param(self.chain_id.as_ref());
        let arbitrable = param(self.arbitrable.as_ref());
        let meta_evidence_id = param(self.meta_evidence_id.as_ref());
        let end_block = param(self.end_block.as_ref());

        Ok(BackfillRequest {
            network: validate_network(chain_id.as_deref(), registry)?.network,
            emitter: validate_address(arbitrable.as_deref(), "arbitrable")?,
            reference_id: validate_u256(meta_evidence_id.as_deref(), "metaEvidenceId")?,
            end_block: validate_number(end_block.as_deref(), "endBlock")?,
        })
    }
}

impl From<&BackfillRequest> for NoticeRequest {
    fn from(request: &BackfillRequest) -> Self {
        Self {
            chain_id: Some(Value::from(request.network.chain_id())),
            arbitrable: Some(Value::from(format!("{:#x}", request.emitter))),
            meta_evidence_id: Some(Value::from(request.reference_id.to_string())),
            end_block: Some(Value::from(request.end_block)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackfillReport {
    pub key: EvidenceKey,
    pub uri: String,
    pub outcome: InsertOutcome,
    pub from_block: u64,
    pub to_block: u64,
    pub elapsed: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum BackfillError {
    #[error(transparent)]
    UnsupportedNetwork(#[from] UnsupportedNetwork),
    #[error("{key} is already resolved to {uri}")]
    AlreadyResolved { key: EvidenceKey, uri: String },
    #[error("a backfill for {0} is already running")]
    AlreadyClaimed(EvidenceKey),
    #[error("no MetaEvidence for {key} in blocks {from_block}-{to_block}")]
    NotFoundInHistory {
        key: EvidenceKey,
        from_block: u64,
        to_block: u64,
    },
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl BackfillError {
    fn outcome(&self) -> &'static str {
        match self {
            BackfillError::UnsupportedNetwork(_) => "unsupported_network",
            BackfillError::AlreadyResolved { .. } => "already_resolved",
            BackfillError::AlreadyClaimed(_) => "already_claimed",
            BackfillError::NotFoundInHistory { .. } => "not_found",
            BackfillError::Scan(_) => "scan_error",
            BackfillError::Cache(CacheError::Conflict { .. }) => "conflict",
            BackfillError::Cache(_) => "cache_error",
        }
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum DispatchError {
    #[error("backfill queue is closed")]
    QueueClosed,
    #[error("backfill queue is full")]
    QueueFull,
    #[error("backfill dispatch unavailable: {0}")]
    Unavailable(String),
}

/// Hands a request off without waiting for it to run.
pub trait BackfillDispatcher: Send + Sync {
    fn dispatch(&self, request: BackfillRequest) -> Result<(), DispatchError>;
}

/// Scans history for one request and stores the result.
#[derive(Clone)]
pub struct BackfillJob {
    networks: Arc<NetworkRegistry>,
    cache: ResolutionCache,
    search: BatchedHistoricalSearch,
    claim_ttl: Duration,
}

impl BackfillJob {
    pub fn new(
        networks: Arc<NetworkRegistry>,
        cache: ResolutionCache,
        search: BatchedHistoricalSearch,
    ) -> Self {
        Self {
            networks,
            cache,
            search,
            claim_ttl: DEFAULT_CLAIM_TTL,
        }
    }

    pub fn with_claim_ttl(mut self, claim_ttl: Duration) -> Self {
        self.claim_ttl = claim_ttl;
        self
    }

    pub fn networks(&self) -> &NetworkRegistry {
        &self.networks
    }

    pub async fn run(&self, request: BackfillRequest) -> Result<BackfillReport, BackfillError> {
        let result = self.guarded_run(&request).await;
        let outcome = match &result {
            Ok(_) => "resolved",
            Err(e) => e.outcome(),
        };
        metrics::record_backfill(request.network, outcome);
        result
    }

    async fn guarded_run(&self, request: &BackfillRequest) -> Result<BackfillReport, BackfillError> {
        let config = self.networks.get(request.network)?;
        let key = request.key();

        if let Some(existing) = self.cache.lookup(&key).await? {
            tracing::warn!(
                target: "evidence_resolver::backfill",
                key = %key,
                uri = %existing.uri,
                "Backfill triggered for an already resolved key (duplicate or unauthorized trigger)"
            );
            return Err(BackfillError::AlreadyResolved {
                key,
                uri: existing.uri,
            });
        }

        if !self.cache.try_claim(&key, self.claim_ttl).await? {
            tracing::debug!(
                target: "evidence_resolver::backfill",
                key = %key,
                "Backfill already running elsewhere"
            );
            return Err(BackfillError::AlreadyClaimed(key));
        }

        let result = self.claimed_run(request, config).await;

        if let Err(e) = self.cache.release_claim(&key).await {
            tracing::warn!(
                target: "evidence_resolver::backfill",
                key = %key,
                error = %e,
                "Failed to release backfill claim, it will expire on its own"
            );
        }

        result
    }

    /// Runs while holding the claim. A job that finished between the first
    /// lookup and the claim has already written the answer.
    async fn claimed_run(
        &self,
        request: &BackfillRequest,
        config: &NetworkConfig,
    ) -> Result<BackfillReport, BackfillError> {
        let key = request.key();
        if let Some(existing) = self.cache.lookup(&key).await? {
            tracing::debug!(
                target: "evidence_resolver::backfill",
                key = %key,
                "Key resolved while waiting for the claim"
            );
            return Err(BackfillError::AlreadyResolved {
                key,
                uri: existing.uri,
            });
        }

        self.scan_and_store(request, config).await
    }

    async fn scan_and_store(
        &self,
        request: &BackfillRequest,
        config: &NetworkConfig,
    ) -> Result<BackfillReport, BackfillError> {
        let key = request.key();
        let head = self.search.latest_block(request.network).await?;
        let from_block = config.start_block;
        let to_block = request.end_block.min(head);

        if from_block > to_block {
            return Err(BackfillError::NotFoundInHistory {
                key,
                from_block,
                to_block,
            });
        }

        tracing::info!(
            target: "evidence_resolver::backfill",
            key = %key,
            from_block,
            to_block,
            "Starting MetaEvidence backfill"
        );

        let started = Instant::now();
        let found = self
            .search
            .find_evidence_uri(
                request.network,
                request.emitter,
                request.reference_id,
                from_block,
                to_block,
            )
            .await;
        let elapsed = started.elapsed();
        metrics::record_scan_duration(request.network, elapsed);

        let Some(uri) = found? else {
            tracing::warn!(
                target: "evidence_resolver::backfill",
                key = %key,
                from_block,
                to_block,
                elapsed_ms = elapsed.as_millis() as u64,
                "No MetaEvidence found in history"
            );
            return Err(BackfillError::NotFoundInHistory {
                key,
                from_block,
                to_block,
            });
        };

        let record = EvidenceRecord {
            key,
            uri,
            end_block: Some(to_block),
        };
        let outcome = self.cache.insert(&record).await?;

        tracing::info!(
            target: "evidence_resolver::backfill",
            key = %key,
            uri = %record.uri,
            outcome = ?outcome,
            elapsed_ms = elapsed.as_millis() as u64,
            "Backfill complete"
        );

        Ok(BackfillReport {
            key,
            uri: record.uri,
            outcome,
            from_block,
            to_block,
            elapsed,
        })
    }
}
