//! In-memory dispute index for tests and local runs.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use crate::network::Network;

use super::{DisputeIndex, IndexError, IndexedDispute};

#[derive(Debug, Default)]
pub struct SampleIndex {
    disputes: HashMap<(Network, u64), IndexedDispute>,
    unavailable: AtomicBool,
    queries: AtomicUsize,
}

impl SampleIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dispute(mut self, network: Network, dispute: IndexedDispute) -> Self {
        self.disputes.insert((network, dispute.dispute_id), dispute);
        self
    }

    /// Simulates an index outage until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn query_count(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DisputeIndex for SampleIndex {
    async fn dispute(
        &self,
        network: Network,
        dispute_id: u64,
    ) -> Result<Option<IndexedDispute>, IndexError> {
        self.queries.fetch_add(1, Ordering::SeqCst);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(IndexError::Graphql("index unavailable".to_string()));
        }
        Ok(self.disputes.get(&(network, dispute_id)).cloned())
    }
}
