//! Fast dispute index.
//!
//! The index (a subgraph per network) knows every dispute, the arbitrable
//! contract that created it and, usually, its MetaEvidence URI. When the URI
//! is missing the resolver falls back to the cache and historical scans.

pub mod sample;
pub mod subgraph;

use alloy::primitives::{Address, U256};
use async_trait::async_trait;

use crate::network::Network;

pub use sample::SampleIndex;
pub use subgraph::SubgraphIndex;

/// What the index knows about one dispute.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexedDispute {
    pub dispute_id: u64,
    /// Arbitrable contract that raised the dispute and emitted its MetaEvidence.
    pub arbitrable: Address,
    pub meta_evidence_id: U256,
    /// Block the dispute was created in; MetaEvidence is always registered at or before it.
    pub created_at_block: u64,
    pub meta_evidence_uri: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum IndexError {
    #[error("index request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("index returned errors: {0}")]
    Graphql(String),
    #[error("index response carried no data")]
    MissingData,
    #[error("malformed index response: {0}")]
    Malformed(String),
    #[error("no index endpoint configured for {0}")]
    NotConfigured(Network),
}

#[async_trait]
pub trait DisputeIndex: Send + Sync {
    /// Looks up a dispute. `Ok(None)` means the index does not know it.
    async fn dispute(
        &self,
        network: Network,
        dispute_id: u64,
    ) -> Result<Option<IndexedDispute>, IndexError>;
}
