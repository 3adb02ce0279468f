//! Historical MetaEvidence log scanning.
//!
//! A [`RangeScanner`] performs one bounded log read; [`BatchedHistoricalSearch`]
//! splits a large block range into windows and drives the scanner over them.

pub mod batched;
pub mod ledger;
pub mod retry;
pub mod sample;

use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use std::time::Duration;

use crate::network::Network;

pub use batched::{
    plan_windows, BatchedHistoricalSearch, SearchConfig, SelectionPolicy, DEFAULT_WINDOW_SIZE,
};
pub use ledger::{LedgerScanner, MetaEvidence};
pub use retry::RetryPolicy;
pub use sample::SampleScanner;

/// One bounded sub-range of a search, scanned in a single RPC call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanWindow {
    pub network: Network,
    pub emitter: Address,
    pub reference_id: U256,
    pub from_block: u64,
    pub to_block: u64,
}

impl ScanWindow {
    pub fn new(
        network: Network,
        emitter: Address,
        reference_id: U256,
        from_block: u64,
        to_block: u64,
    ) -> Result<Self, ScanError> {
        if from_block > to_block {
            return Err(ScanError::InvalidRange {
                from_block,
                to_block,
            });
        }
        Ok(Self {
            network,
            emitter,
            reference_id,
            from_block,
            to_block,
        })
    }

    /// Number of blocks covered (inclusive bounds).
    pub fn block_count(&self) -> u64 {
        self.to_block - self.from_block + 1
    }

    pub fn contains(&self, block_number: u64) -> bool {
        (self.from_block..=self.to_block).contains(&block_number)
    }
}

/// A decoded MetaEvidence registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEvent {
    pub block_number: u64,
    pub log_index: u64,
    pub reference_id: U256,
    pub uri: String,
}

impl RawEvent {
    /// Ordering key: block first, then emission order within the block.
    pub fn position(&self) -> (u64, u64) {
        (self.block_number, self.log_index)
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum ScanError {
    #[error("transient network error scanning {network} blocks {from_block}-{to_block}: {message}")]
    Transient {
        network: Network,
        from_block: u64,
        to_block: u64,
        message: String,
    },
    #[error("scan of {network} blocks {from_block}-{to_block} timed out after {timeout:?}")]
    Timeout {
        network: Network,
        from_block: u64,
        to_block: u64,
        timeout: Duration,
    },
    #[error("transient network error reading {network} chain head: {message}")]
    ChainHead { network: Network, message: String },
    #[error("invalid block range {from_block}-{to_block}")]
    InvalidRange { from_block: u64, to_block: u64 },
    #[error("window size must be at least one block")]
    InvalidWindowSize,
    #[error("no RPC provider configured for {0}")]
    NoProvider(Network),
    #[error("failed to decode MetaEvidence log: {0}")]
    Decode(String),
}

impl ScanError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ScanError::Transient { .. } | ScanError::Timeout { .. } | ScanError::ChainHead { .. }
        )
    }
}

/// Bounded read of MetaEvidence events from the ledger.
#[async_trait]
pub trait RangeScanner: Send + Sync {
    /// Returns every event emitted by `window.emitter` for `window.reference_id`
    /// within `[from_block, to_block]`, in ascending `(block, log index)` order.
    ///
    /// An empty vector means no match. RPC failures are reported as
    /// [`ScanError::Transient`] and never folded into an empty result.
    async fn scan(&self, window: &ScanWindow) -> Result<Vec<RawEvent>, ScanError>;

    /// Current chain head, used by callers to clamp `to_block`.
    async fn latest_block(&self, network: Network) -> Result<u64, ScanError>;
}
