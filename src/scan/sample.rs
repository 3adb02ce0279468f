//! In-memory scanner over a fixed set of events
//!
//! Used by tests and local demos. Supports injected failures and per-window
//! latency so ordering and retry behavior can be exercised without an RPC node.

use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use crate::network::Network;

use super::{RangeScanner, RawEvent, ScanError, ScanWindow};

#[derive(Debug, Clone)]
struct StoredEvent {
    network: Network,
    emitter: Address,
    event: RawEvent,
}

/// Scanner backed by a predefined event list
#[derive(Debug, Default)]
pub struct SampleScanner {
    events: Vec<StoredEvent>,
    heads: HashMap<Network, u64>,
    /// Extra latency keyed by a window's `from_block`
    delays: HashMap<u64, Duration>,
    /// Windows (by `from_block`) that always fail transiently
    broken_windows: HashSet<u64>,
    /// Number of leading `scan` calls that fail with a transient error
    failures_remaining: AtomicU32,
    calls: Mutex<Vec<ScanWindow>>,
}

impl SampleScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a MetaEvidence emission at `block_number`.
    pub fn with_event(
        mut self,
        network: Network,
        emitter: Address,
        reference_id: U256,
        block_number: u64,
        uri: impl Into<String>,
    ) -> Self {
        let log_index = self
            .events
            .iter()
            .filter(|e| e.network == network && e.event.block_number == block_number)
            .count() as u64;
        self.events.push(StoredEvent {
            network,
            emitter,
            event: RawEvent {
                block_number,
                log_index,
                reference_id,
                uri: uri.into(),
            },
        });
        self
    }

    pub fn with_head(mut self, network: Network, block: u64) -> Self {
        self.heads.insert(network, block);
        self
    }

    /// Delays any window starting at `from_block`.
    pub fn with_delay(mut self, from_block: u64, delay: Duration) -> Self {
        self.delays.insert(from_block, delay);
        self
    }

    /// Makes every scan of the window starting at `from_block` fail.
    pub fn with_broken_window(mut self, from_block: u64) -> Self {
        self.broken_windows.insert(from_block);
        self
    }

    /// Makes the next `count` scans fail transiently.
    pub fn failing(self, count: u32) -> Self {
        self.failures_remaining.store(count, Ordering::SeqCst);
        self
    }

    /// Number of `scan` calls made so far, including failed ones.
    pub fn call_count(&self) -> usize {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Windows requested so far, in call order.
    pub fn calls(&self) -> Vec<ScanWindow> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl RangeScanner for SampleScanner {
    async fn scan(&self, window: &ScanWindow) -> Result<Vec<RawEvent>, ScanError> {
        self.calls
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(window.clone());

        if let Some(delay) = self.delays.get(&window.from_block) {
            tokio::time::sleep(*delay).await;
        }

        let should_fail = self.broken_windows.contains(&window.from_block)
            || self
                .failures_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
        if should_fail {
            return Err(ScanError::Transient {
                network: window.network,
                from_block: window.from_block,
                to_block: window.to_block,
                message: "injected failure".to_string(),
            });
        }

        let mut matches: Vec<RawEvent> = self
            .events
            .iter()
            .filter(|e| {
                e.network == window.network
                    && e.emitter == window.emitter
                    && e.event.reference_id == window.reference_id
                    && window.contains(e.event.block_number)
            })
            .map(|e| e.event.clone())
            .collect();
        matches.sort_by_key(RawEvent::position);

        tracing::debug!(
            target: "evidence_resolver::scan::sample",
            "Scanned {} blocks {}-{}: {} match(es)",
            window.network,
            window.from_block,
            window.to_block,
            matches.len()
        );

        Ok(matches)
    }

    async fn latest_block(&self, network: Network) -> Result<u64, ScanError> {
        Ok(self.heads.get(&network).copied().unwrap_or(u64::MAX))
    }
}
