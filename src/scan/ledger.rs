//! JSON-RPC backed scanner using `eth_getLogs`.

use alloy::primitives::B256;
use alloy::providers::{DynProvider, Provider, ProviderBuilder};
use alloy::rpc::types::Filter;
use alloy::sol;
use alloy::sol_types::SolEvent;
use async_trait::async_trait;
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

use crate::network::{Network, NetworkRegistry};

use super::{RangeScanner, RawEvent, ScanError, ScanWindow};

const RPC_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

sol! {
    /// ERC-1497 evidence standard registration.
    #[derive(Debug)]
    event MetaEvidence(uint256 indexed _metaEvidenceID, string _evidence);
}

/// Builds a type-erased HTTP provider with bounded connect and request times.
pub fn connect_http(url: &Url, request_timeout: Duration) -> Result<DynProvider, reqwest::Error> {
    let client = reqwest::Client::builder()
        .connect_timeout(RPC_CONNECT_TIMEOUT)
        .timeout(request_timeout)
        .build()?;
    Ok(ProviderBuilder::new()
        .connect_reqwest(client, url.clone())
        .erased())
}

/// Scanner holding one provider per network.
#[derive(Clone, Default)]
pub struct LedgerScanner {
    providers: HashMap<Network, DynProvider>,
}

impl LedgerScanner {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_provider(mut self, network: Network, provider: DynProvider) -> Self {
        self.providers.insert(network, provider);
        self
    }

    /// Connects to every network in the registry that has an RPC endpoint.
    pub fn from_registry(
        registry: &NetworkRegistry,
        request_timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let mut scanner = Self::new();
        for config in registry.iter() {
            match &config.rpc_url {
                Some(url) => {
                    scanner = scanner
                        .with_provider(config.network, connect_http(url, request_timeout)?);
                }
                None => tracing::warn!(
                    target: "evidence_resolver::scan::ledger",
                    network = %config.network,
                    "No RPC endpoint configured, historical backfill disabled for this network"
                ),
            }
        }
        Ok(scanner)
    }

    pub fn networks(&self) -> impl Iterator<Item = Network> + '_ {
        self.providers.keys().copied()
    }

    fn provider(&self, network: Network) -> Result<&DynProvider, ScanError> {
        self.providers
            .get(&network)
            .ok_or(ScanError::NoProvider(network))
    }
}

impl std::fmt::Debug for LedgerScanner {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LedgerScanner")
            .field("networks", &self.providers.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[async_trait]
impl RangeScanner for LedgerScanner {
    async fn scan(&self, window: &ScanWindow) -> Result<Vec<RawEvent>, ScanError> {
        let provider = self.provider(window.network)?;

        let filter = Filter::new()
            .address(window.emitter)
            .event_signature(MetaEvidence::SIGNATURE_HASH)
            .topic1(B256::from(window.reference_id.to_be_bytes::<32>()))
            .from_block(window.from_block)
            .to_block(window.to_block);

        let logs = provider
            .get_logs(&filter)
            .await
            .map_err(|e| ScanError::Transient {
                network: window.network,
                from_block: window.from_block,
                to_block: window.to_block,
                message: e.to_string(),
            })?;

        let mut events = Vec::with_capacity(logs.len());
        for log in logs {
            if log.removed {
                continue;
            }
            let block_number = log
                .block_number
                .ok_or_else(|| ScanError::Decode("log without block number".to_string()))?;
            let log_index = log.log_index.unwrap_or_default();
            let decoded = log
                .log_decode::<MetaEvidence>()
                .map_err(|e| ScanError::Decode(e.to_string()))?;
            let data = decoded.data();

            events.push(RawEvent {
                block_number,
                log_index,
                reference_id: data._metaEvidenceID,
                uri: data._evidence.clone(),
            });
        }
        events.sort_by_key(RawEvent::position);

        tracing::trace!(
            target: "evidence_resolver::scan::ledger",
            network = %window.network,
            from_block = window.from_block,
            to_block = window.to_block,
            matches = events.len(),
            "Scanned window"
        );

        Ok(events)
    }

    async fn latest_block(&self, network: Network) -> Result<u64, ScanError> {
        self.provider(network)?
            .get_block_number()
            .await
            .map_err(|e| ScanError::ChainHead {
                network,
                message: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloy::primitives::{address, fixed_bytes, IntoLogData, U256};
    use alloy::providers::mock::Asserter;
    use alloy::rpc::types::Log;

    fn mocked(asserter: Asserter) -> LedgerScanner {
        let provider = ProviderBuilder::new()
            .connect_mocked_client(asserter)
            .erased();
        LedgerScanner::new().with_provider(Network::Gnosis, provider)
    }

    fn window() -> ScanWindow {
        ScanWindow::new(
            Network::Gnosis,
            address!("0x1111111111111111111111111111111111111111"),
            U256::from(7),
            100,
            199,
        )
        .unwrap()
    }

    fn meta_evidence_log(block_number: u64, log_index: u64, uri: &str) -> Log {
        let event = MetaEvidence {
            _metaEvidenceID: U256::from(7),
            _evidence: uri.to_string(),
        };
        Log {
            inner: alloy::primitives::Log {
                address: address!("0x1111111111111111111111111111111111111111"),
                data: event.to_log_data(),
            },
            block_hash: None,
            block_number: Some(block_number),
            block_timestamp: None,
            transaction_hash: Some(fixed_bytes!(
                "0xbeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeeee"
            )),
            transaction_index: None,
            log_index: Some(log_index),
            removed: false,
        }
    }

    #[tokio::test]
    async fn test_scan_decodes_meta_evidence_logs() {
        let asserter = Asserter::new();
        asserter.push_success(&serde_json::json!([
            meta_evidence_log(180, 3, "/ipfs/Qmlate/metaEvidence.json"),
            meta_evidence_log(150, 0, "/ipfs/Qmearly/metaEvidence.json"),
        ]));

        let events = mocked(asserter).scan(&window()).await.unwrap();

        assert_eq!(events.len(), 2);
        assert_eq!(events[0].block_number, 150);
        assert_eq!(events[0].uri, "/ipfs/Qmearly/metaEvidence.json");
        assert_eq!(events[0].reference_id, U256::from(7));
        assert_eq!(events[1].position(), (180, 3));
    }

    #[tokio::test]
    async fn test_scan_empty_result() {
        let asserter = Asserter::new();
        asserter.push_success(&serde_json::json!([]));

        let events = mocked(asserter).scan(&window()).await.unwrap();
        assert!(events.is_empty());
    }

    #[tokio::test]
    async fn test_rpc_failure_is_transient_not_empty() {
        let asserter = Asserter::new();
        asserter.push_failure_msg("header not found");

        let err = mocked(asserter).scan(&window()).await.unwrap_err();
        assert!(err.is_transient());
        assert!(matches!(
            err,
            ScanError::Transient {
                from_block: 100,
                to_block: 199,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn test_latest_block() {
        let asserter = Asserter::new();
        asserter.push_success(&serde_json::Value::from(4_200_000u64));

        let head = mocked(asserter).latest_block(Network::Gnosis).await.unwrap();
        assert_eq!(head, 4_200_000);
    }

    #[tokio::test]
    async fn test_unconfigured_network() {
        let scanner = LedgerScanner::new();
        let err = scanner.latest_block(Network::Mainnet).await.unwrap_err();
        assert!(matches!(err, ScanError::NoProvider(Network::Mainnet)));
        assert!(!err.is_transient());
    }

    #[test]
    fn test_from_registry_skips_networks_without_rpc() {
        let registry = NetworkRegistry::with_defaults().with(
            crate::network::NetworkConfig::defaults(Network::Gnosis)
                .with_rpc_url(Url::parse("http://localhost:8545").unwrap()),
        );
        let scanner = LedgerScanner::from_registry(&registry, Duration::from_secs(5)).unwrap();
        assert_eq!(scanner.networks().collect::<Vec<_>>(), vec![Network::Gnosis]);
    }
}
