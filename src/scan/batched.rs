//! Windowed historical search over a large block range.
//!
//! RPC providers reject or throttle unbounded `eth_getLogs` ranges, so the
//! search splits `[search_start, search_end]` into fixed-size windows and scans
//! them with bounded fan-out. Results are consumed in selection order, so the
//! answer never depends on which window happens to finish first.

use alloy::primitives::{Address, U256};
use futures::stream::{self, StreamExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::network::Network;

use super::{RangeScanner, RawEvent, RetryPolicy, ScanError, ScanWindow};

/// Blocks per `eth_getLogs` call, sized for common provider limits.
pub const DEFAULT_WINDOW_SIZE: u64 = 50_000;

pub const DEFAULT_MAX_CONCURRENT_WINDOWS: usize = 4;

/// Matches the RPC transport timeout.
pub const DEFAULT_WINDOW_TIMEOUT: Duration = Duration::from_secs(600);

/// Splits `[start, end]` into contiguous inclusive windows of at most `window_size` blocks.
pub fn plan_windows(start: u64, end: u64, window_size: u64) -> Result<Vec<(u64, u64)>, ScanError> {
    if window_size == 0 {
        return Err(ScanError::InvalidWindowSize);
    }
    if start > end {
        return Err(ScanError::InvalidRange {
            from_block: start,
            to_block: end,
        });
    }

    let count = (end - start) / window_size + 1;
    let mut windows = Vec::with_capacity(count.min(1024) as usize);
    let mut from = start;
    loop {
        let to = from.saturating_add(window_size - 1).min(end);
        windows.push((from, to));
        if to == end {
            break;
        }
        from = to + 1;
    }
    Ok(windows)
}

/// Which matching event is authoritative when several exist.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionPolicy {
    /// First registration wins.
    #[default]
    Earliest,
    /// Most recent registration wins. Only meaningful for emitters that
    /// re-emit the same reference id to overwrite it.
    Latest,
}

impl SelectionPolicy {
    fn pick(self, events: Vec<RawEvent>) -> Option<RawEvent> {
        match self {
            SelectionPolicy::Earliest => events.into_iter().min_by_key(RawEvent::position),
            SelectionPolicy::Latest => events.into_iter().max_by_key(RawEvent::position),
        }
    }
}

impl fmt::Display for SelectionPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectionPolicy::Earliest => f.write_str("earliest"),
            SelectionPolicy::Latest => f.write_str("latest"),
        }
    }
}

impl FromStr for SelectionPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "earliest" => Ok(SelectionPolicy::Earliest),
            "latest" => Ok(SelectionPolicy::Latest),
            other => Err(format!("unknown selection policy: {other}")),
        }
    }
}

/// Search tuning shared by every backfill of a deployment.
#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub window_size: u64,
    pub max_concurrent_windows: usize,
    pub window_timeout: Duration,
    pub retry: RetryPolicy,
    pub selection: SelectionPolicy,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            window_size: DEFAULT_WINDOW_SIZE,
            max_concurrent_windows: DEFAULT_MAX_CONCURRENT_WINDOWS,
            window_timeout: DEFAULT_WINDOW_TIMEOUT,
            retry: RetryPolicy::default(),
            selection: SelectionPolicy::default(),
        }
    }
}

impl SearchConfig {
    pub fn with_window_size(mut self, window_size: u64) -> Self {
        self.window_size = window_size;
        self
    }

    pub fn with_max_concurrent_windows(mut self, max: usize) -> Self {
        self.max_concurrent_windows = max;
        self
    }

    pub fn with_window_timeout(mut self, timeout: Duration) -> Self {
        self.window_timeout = timeout;
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_selection(mut self, selection: SelectionPolicy) -> Self {
        self.selection = selection;
        self
    }
}

/// Drives a [`RangeScanner`] over a windowed block range.
#[derive(Clone)]
pub struct BatchedHistoricalSearch {
    scanner: Arc<dyn RangeScanner>,
    config: SearchConfig,
}

impl BatchedHistoricalSearch {
    pub fn new(scanner: Arc<dyn RangeScanner>, config: SearchConfig) -> Self {
        Self { scanner, config }
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    pub async fn latest_block(&self, network: Network) -> Result<u64, ScanError> {
        self.config
            .retry
            .execute(|| self.scanner.latest_block(network))
            .await
    }

    /// Returns the URI of the selected MetaEvidence event, or `None` if the
    /// range holds no registration for `reference_id`.
    pub async fn find_evidence_uri(
        &self,
        network: Network,
        emitter: Address,
        reference_id: U256,
        search_start: u64,
        search_end: u64,
    ) -> Result<Option<String>, ScanError> {
        Ok(self
            .find_evidence(network, emitter, reference_id, search_start, search_end)
            .await?
            .map(|event| event.uri))
    }

    /// Like [`Self::find_evidence_uri`] but returns the whole event.
    pub async fn find_evidence(
        &self,
        network: Network,
        emitter: Address,
        reference_id: U256,
        search_start: u64,
        search_end: u64,
    ) -> Result<Option<RawEvent>, ScanError> {
        let mut ranges = plan_windows(search_start, search_end, self.config.window_size)?;
        if self.config.selection == SelectionPolicy::Latest {
            ranges.reverse();
        }
        let window_count = ranges.len();

        tracing::debug!(
            target: "evidence_resolver::scan::batched",
            network = %network,
            emitter = %format!("{:#x}", emitter),
            reference_id = %reference_id,
            search_start,
            search_end,
            windows = window_count,
            selection = %self.config.selection,
            "Starting windowed search"
        );

        let started = Instant::now();
        let mut results = stream::iter(ranges)
            .map(|(from_block, to_block)| {
                let window = ScanWindow {
                    network,
                    emitter,
                    reference_id,
                    from_block,
                    to_block,
                };
                async move { self.scan_window(window).await }
            })
            .buffered(self.config.max_concurrent_windows.max(1));

        let mut scanned = 0usize;
        while let Some(result) = results.next().await {
            let events = result?;
            scanned += 1;

            if let Some(event) = self.config.selection.pick(events) {
                tracing::debug!(
                    target: "evidence_resolver::scan::batched",
                    network = %network,
                    block = event.block_number,
                    windows_scanned = scanned,
                    windows_total = window_count,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Found MetaEvidence"
                );
                return Ok(Some(event));
            }
        }

        tracing::debug!(
            target: "evidence_resolver::scan::batched",
            network = %network,
            windows = window_count,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "No MetaEvidence in range"
        );
        Ok(None)
    }

    async fn scan_window(&self, window: ScanWindow) -> Result<Vec<RawEvent>, ScanError> {
        let timeout = self.config.window_timeout;
        self.config
            .retry
            .execute(|| {
                let w = &window;
                async move {
                    match tokio::time::timeout(timeout, self.scanner.scan(w)).await {
                        Ok(result) => result,
                        Err(_) => Err(ScanError::Timeout {
                            network: w.network,
                            from_block: w.from_block,
                            to_block: w.to_block,
                            timeout,
                        }),
                    }
                }
            })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scan::SampleScanner;
    use alloy::primitives::address;

    const EMITTER: Address = address!("0x2222222222222222222222222222222222222222");

    fn fast_retry(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(
            max_retries,
            Duration::from_millis(1),
            Duration::from_millis(5),
            2.0,
        )
    }

    fn search(scanner: Arc<SampleScanner>, config: SearchConfig) -> BatchedHistoricalSearch {
        BatchedHistoricalSearch::new(scanner, config)
    }

    #[test]
    fn test_plan_windows_reference_layout() {
        assert_eq!(
            plan_windows(0, 250, 100).unwrap(),
            vec![(0, 99), (100, 199), (200, 250)]
        );
        assert_eq!(plan_windows(0, 99, 100).unwrap(), vec![(0, 99)]);
        assert_eq!(plan_windows(42, 42, 100).unwrap(), vec![(42, 42)]);
        assert_eq!(plan_windows(10, 20, 1_000_000).unwrap(), vec![(10, 20)]);
    }

    #[test]
    fn test_plan_windows_partitions_range() {
        for start in [0u64, 1, 7, 7_303_699] {
            for len in [0u64, 1, 2, 99, 100, 101, 1_234] {
                for size in [1u64, 2, 3, 50, 100, 5_000] {
                    let end = start + len;
                    let windows = plan_windows(start, end, size).unwrap();

                    assert_eq!(windows.len() as u64, (len + 1).div_ceil(size));
                    assert_eq!(windows[0].0, start);
                    assert_eq!(windows.last().unwrap().1, end);
                    for (from, to) in &windows {
                        assert!(from <= to);
                        assert!(to - from < size);
                    }
                    for pair in windows.windows(2) {
                        assert_eq!(pair[0].1 + 1, pair[1].0);
                    }
                }
            }
        }
    }

    #[test]
    fn test_plan_windows_near_u64_max() {
        let windows = plan_windows(u64::MAX - 5, u64::MAX, 4).unwrap();
        assert_eq!(windows, vec![(u64::MAX - 5, u64::MAX - 2), (u64::MAX - 1, u64::MAX)]);
    }

    #[test]
    fn test_plan_windows_rejects_bad_input() {
        assert!(matches!(
            plan_windows(0, 10, 0),
            Err(ScanError::InvalidWindowSize)
        ));
        assert!(matches!(
            plan_windows(11, 10, 5),
            Err(ScanError::InvalidRange { .. })
        ));
    }

    #[test]
    fn test_selection_policy_parse() {
        assert_eq!(
            "Earliest".parse::<SelectionPolicy>(),
            Ok(SelectionPolicy::Earliest)
        );
        assert_eq!("latest".parse::<SelectionPolicy>(), Ok(SelectionPolicy::Latest));
        assert!("newest".parse::<SelectionPolicy>().is_err());
        assert_eq!(SelectionPolicy::default(), SelectionPolicy::Earliest);
    }

    #[tokio::test]
    async fn test_match_found_regardless_of_completion_order() {
        // Window [0,99] is the slowest; [100,199] holds the only match.
        let scanner = Arc::new(
            SampleScanner::new()
                .with_event(Network::Gnosis, EMITTER, U256::from(3), 150, "/ipfs/Qm150")
                .with_delay(0, Duration::from_millis(50)),
        );
        let search = search(
            scanner.clone(),
            SearchConfig::default().with_window_size(100),
        );

        let uri = search
            .find_evidence_uri(Network::Gnosis, EMITTER, U256::from(3), 0, 250)
            .await
            .unwrap();

        assert_eq!(uri.as_deref(), Some("/ipfs/Qm150"));
    }

    #[tokio::test]
    async fn test_earliest_and_latest_selection() {
        let scanner = Arc::new(
            SampleScanner::new()
                .with_event(Network::Gnosis, EMITTER, U256::from(3), 150, "/ipfs/first")
                .with_event(Network::Gnosis, EMITTER, U256::from(3), 160, "/ipfs/second")
                .with_event(Network::Gnosis, EMITTER, U256::from(3), 220, "/ipfs/third")
                .with_delay(100, Duration::from_millis(30)),
        );

        let earliest = search(
            scanner.clone(),
            SearchConfig::default().with_window_size(100),
        )
        .find_evidence(Network::Gnosis, EMITTER, U256::from(3), 0, 250)
        .await
        .unwrap()
        .unwrap();
        assert_eq!(earliest.uri, "/ipfs/first");
        assert_eq!(earliest.block_number, 150);

        let latest = search(
            scanner,
            SearchConfig::default()
                .with_window_size(100)
                .with_selection(SelectionPolicy::Latest),
        )
        .find_evidence_uri(Network::Gnosis, EMITTER, U256::from(3), 0, 250)
        .await
        .unwrap();
        assert_eq!(latest.as_deref(), Some("/ipfs/third"));
    }

    #[tokio::test]
    async fn test_no_match_returns_none() {
        let scanner = Arc::new(SampleScanner::new().with_event(
            Network::Gnosis,
            EMITTER,
            U256::from(4),
            150,
            "/ipfs/other",
        ));
        let uri = search(scanner.clone(), SearchConfig::default().with_window_size(100))
            .find_evidence_uri(Network::Gnosis, EMITTER, U256::from(3), 0, 250)
            .await
            .unwrap();

        assert!(uri.is_none());
        assert_eq!(scanner.call_count(), 3);
    }

    #[tokio::test]
    async fn test_single_block_range_is_one_direct_call() {
        let scanner = Arc::new(SampleScanner::new().with_event(
            Network::Mainnet,
            EMITTER,
            U256::ZERO,
            7_303_699,
            "/ipfs/genesis",
        ));
        let uri = search(scanner.clone(), SearchConfig::default())
            .find_evidence_uri(Network::Mainnet, EMITTER, U256::ZERO, 7_303_699, 7_303_699)
            .await
            .unwrap();

        assert_eq!(uri.as_deref(), Some("/ipfs/genesis"));
        assert_eq!(
            scanner.calls(),
            vec![ScanWindow::new(Network::Mainnet, EMITTER, U256::ZERO, 7_303_699, 7_303_699).unwrap()]
        );
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let scanner = Arc::new(
            SampleScanner::new()
                .with_event(Network::Gnosis, EMITTER, U256::from(1), 10, "/ipfs/ok")
                .failing(2),
        );
        let uri = search(
            scanner.clone(),
            SearchConfig::default().with_retry(fast_retry(3)),
        )
        .find_evidence_uri(Network::Gnosis, EMITTER, U256::from(1), 0, 100)
        .await
        .unwrap();

        assert_eq!(uri.as_deref(), Some("/ipfs/ok"));
        assert_eq!(scanner.call_count(), 3);
    }

    #[tokio::test]
    async fn test_failed_window_aborts_search() {
        let scanner = Arc::new(
            SampleScanner::new()
                .with_event(Network::Gnosis, EMITTER, U256::from(1), 220, "/ipfs/late")
                .with_broken_window(100),
        );
        let err = search(
            scanner,
            SearchConfig::default()
                .with_window_size(100)
                .with_retry(fast_retry(1)),
        )
        .find_evidence_uri(Network::Gnosis, EMITTER, U256::from(1), 0, 250)
        .await
        .unwrap_err();

        assert!(matches!(err, ScanError::Transient { from_block: 100, .. }));
    }

    #[tokio::test]
    async fn test_earlier_answer_wins_over_later_failure() {
        let scanner = Arc::new(
            SampleScanner::new()
                .with_event(Network::Gnosis, EMITTER, U256::from(1), 50, "/ipfs/early")
                .with_broken_window(200),
        );
        let uri = search(
            scanner,
            SearchConfig::default()
                .with_window_size(100)
                .with_retry(RetryPolicy::no_retry()),
        )
        .find_evidence_uri(Network::Gnosis, EMITTER, U256::from(1), 0, 250)
        .await
        .unwrap();

        assert_eq!(uri.as_deref(), Some("/ipfs/early"));
    }

    #[tokio::test]
    async fn test_stalled_window_times_out() {
        let scanner = Arc::new(SampleScanner::new().with_delay(0, Duration::from_secs(5)));
        let err = search(
            scanner,
            SearchConfig::default()
                .with_window_timeout(Duration::from_millis(20))
                .with_retry(RetryPolicy::no_retry()),
        )
        .find_evidence_uri(Network::Gnosis, EMITTER, U256::from(1), 0, 10)
        .await
        .unwrap_err();

        assert!(matches!(err, ScanError::Timeout { from_block: 0, .. }));
    }
}
