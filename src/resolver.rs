//! Tiered MetaEvidence resolution: index, then cache, then backfill.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::backfill::{BackfillDispatcher, BackfillRequest};
use crate::cache::{EvidenceKey, ResolutionCache};
use crate::index::{DisputeIndex, IndexError};
use crate::metrics;
use crate::network::{Network, NetworkRegistry, UnsupportedNetwork};
use crate::validate::ValidationError;

/// Outcome of a resolve call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Resolution {
    Resolved {
        #[serde(rename = "metaEvidenceUri")]
        uri: String,
    },
    /// A backfill was requested; ask again later.
    Pending,
}

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    #[error(transparent)]
    UnsupportedNetwork(#[from] UnsupportedNetwork),
    #[error("dispute {dispute_id} not found on {network}")]
    NotFound { network: Network, dispute_id: u64 },
    #[error("{0}")]
    InvalidInput(String),
    #[error(transparent)]
    Index(#[from] IndexError),
}

impl From<ValidationError> for ResolveError {
    fn from(err: ValidationError) -> Self {
        match err {
            ValidationError::UnsupportedNetwork(e) => ResolveError::UnsupportedNetwork(e),
            other => ResolveError::InvalidInput(other.to_string()),
        }
    }
}

#[derive(Clone)]
pub struct Resolver {
    networks: Arc<NetworkRegistry>,
    index: Arc<dyn DisputeIndex>,
    cache: ResolutionCache,
    dispatcher: Arc<dyn BackfillDispatcher>,
}

impl Resolver {
    pub fn new(
        networks: Arc<NetworkRegistry>,
        index: Arc<dyn DisputeIndex>,
        cache: ResolutionCache,
        dispatcher: Arc<dyn BackfillDispatcher>,
    ) -> Self {
        Self {
            networks,
            index,
            cache,
            dispatcher,
        }
    }

    pub fn networks(&self) -> &NetworkRegistry {
        &self.networks
    }

    /// Resolves a dispute on a network given by chain id or name.
    pub async fn resolve(&self, network: &str, dispute_id: u64) -> Result<Resolution, ResolveError> {
        let network = self.networks.resolve(network)?.network;
        self.resolve_on(network, dispute_id).await
    }

    /// Never waits for a backfill. A miss on both tiers returns
    /// [`Resolution::Pending`] once the backfill has been handed off.
    pub async fn resolve_on(
        &self,
        network: Network,
        dispute_id: u64,
    ) -> Result<Resolution, ResolveError> {
        self.networks.get(network)?;

        let dispute = self
            .index
            .dispute(network, dispute_id)
            .await?
            .ok_or(ResolveError::NotFound {
                network,
                dispute_id,
            })?;

        if let Some(uri) = dispute.meta_evidence_uri {
            metrics::record_resolution(network, "index");
            return Ok(Resolution::Resolved { uri });
        }

        let key = EvidenceKey::new(network, dispute.arbitrable, dispute.meta_evidence_id);
        match self.cache.lookup(&key).await {
            Ok(Some(record)) => {
                metrics::record_resolution(network, "cache");
                return Ok(Resolution::Resolved { uri: record.uri });
            }
            Ok(None) => {}
            Err(e) => tracing::warn!(
                target: "evidence_resolver::resolver",
                key = %key,
                error = %e,
                "Cache lookup failed, falling back to backfill"
            ),
        }

        let request = BackfillRequest {
            network,
            emitter: dispute.arbitrable,
            reference_id: dispute.meta_evidence_id,
            end_block: dispute.created_at_block,
        };
        match self.dispatcher.dispatch(request) {
            Ok(()) => tracing::debug!(
                target: "evidence_resolver::resolver",
                key = %key,
                dispute_id,
                end_block = request.end_block,
                "Dispatched MetaEvidence backfill"
            ),
            Err(e) => {
                metrics::record_dispatch_failure(network);
                tracing::warn!(
                    target: "evidence_resolver::resolver",
                    key = %key,
                    dispute_id,
                    error = %e,
                    "Failed to dispatch MetaEvidence backfill"
                );
            }
        }

        metrics::record_resolution(network, "pending");
        Ok(Resolution::Pending)
    }
}
