//! Supported networks and their per-deployment constants.
//!
//! Every chain-specific value (arbitrator address, registry genesis block,
//! RPC and subgraph endpoints) lives in a [`NetworkConfig`]. The resolver and
//! backfill job receive a [`NetworkRegistry`] instead of reading globals, so
//! tests can build a registry with whatever fixtures they need.

use alloy::primitives::{address, Address};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use url::Url;

/// Kleros arbitrator, deployed at the same address on every supported chain.
pub const KLEROS_ARBITRATOR: Address = address!("0x9c1da9a04925bdfdedf0f6421bc7eea8305f9002");

/// Block the arbitrator was deployed at on Ethereum mainnet.
pub const MAINNET_START_BLOCK: u64 = 7_303_699;

/// Block the arbitrator was deployed at on Gnosis chain.
pub const GNOSIS_START_BLOCK: u64 = 16_895_601;

const MAINNET_SUBGRAPH: &str =
    "https://api.thegraph.com/subgraphs/name/andreimvp/kleros-display-mainnet";
const GNOSIS_SUBGRAPH: &str = "https://api.thegraph.com/subgraphs/name/andreimvp/kleros-display";

/// A chain the resolver knows how to serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    Mainnet,
    Gnosis,
}

impl Network {
    pub const ALL: [Network; 2] = [Network::Mainnet, Network::Gnosis];

    /// EIP-155 chain id.
    pub const fn chain_id(self) -> u64 {
        match self {
            Network::Mainnet => 1,
            Network::Gnosis => 100,
        }
    }

    /// Canonical lowercase name, also used as the cache key component.
    pub const fn name(self) -> &'static str {
        match self {
            Network::Mainnet => "mainnet",
            Network::Gnosis => "gnosis",
        }
    }

    pub fn from_chain_id(chain_id: u64) -> Option<Self> {
        Self::ALL.into_iter().find(|n| n.chain_id() == chain_id)
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Raised for any network identifier outside the supported set.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unsupported network: {0}")]
pub struct UnsupportedNetwork(pub String);

impl FromStr for Network {
    type Err = UnsupportedNetwork;

    /// Accepts a decimal chain id (`1`, `100`) or a chain name.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if let Ok(chain_id) = trimmed.parse::<u64>() {
            return Self::from_chain_id(chain_id).ok_or_else(|| UnsupportedNetwork(s.to_string()));
        }

        match trimmed.to_ascii_lowercase().as_str() {
            "mainnet" | "ethereum" => Ok(Network::Mainnet),
            "gnosis" | "gnosischain" | "xdai" => Ok(Network::Gnosis),
            _ => Err(UnsupportedNetwork(s.to_string())),
        }
    }
}

/// Per-network deployment constants and endpoints.
#[derive(Debug, Clone)]
pub struct NetworkConfig {
    pub network: Network,

    /// Arbitrator contract (the dispute registry).
    pub arbitrator: Address,

    /// First block worth scanning for evidence registrations.
    pub start_block: u64,

    /// JSON-RPC endpoint used for historical log scans.
    pub rpc_url: Option<Url>,

    /// Subgraph endpoint used as the fast index.
    pub subgraph_url: Option<Url>,
}

impl NetworkConfig {
    /// Production defaults for a network. RPC endpoints are private and must be supplied.
    pub fn defaults(network: Network) -> Self {
        let (start_block, subgraph) = match network {
            Network::Mainnet => (MAINNET_START_BLOCK, MAINNET_SUBGRAPH),
            Network::Gnosis => (GNOSIS_START_BLOCK, GNOSIS_SUBGRAPH),
        };

        Self {
            network,
            arbitrator: KLEROS_ARBITRATOR,
            start_block,
            rpc_url: None,
            subgraph_url: Url::parse(subgraph).ok(),
        }
    }

    pub fn with_rpc_url(mut self, url: Url) -> Self {
        self.rpc_url = Some(url);
        self
    }

    pub fn with_subgraph_url(mut self, url: Url) -> Self {
        self.subgraph_url = Some(url);
        self
    }

    pub fn with_start_block(mut self, start_block: u64) -> Self {
        self.start_block = start_block;
        self
    }
}

/// The set of networks a deployment serves.
#[derive(Debug, Clone, Default)]
pub struct NetworkRegistry {
    networks: HashMap<Network, NetworkConfig>,
}

impl NetworkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with production defaults for every supported network.
    pub fn with_defaults() -> Self {
        Network::ALL
            .into_iter()
            .fold(Self::new(), |registry, n| registry.with(NetworkConfig::defaults(n)))
    }

    /// Adds or replaces a network configuration.
    pub fn with(mut self, config: NetworkConfig) -> Self {
        self.insert(config);
        self
    }

    pub fn insert(&mut self, config: NetworkConfig) {
        self.networks.insert(config.network, config);
    }

    pub fn get(&self, network: Network) -> Result<&NetworkConfig, UnsupportedNetwork> {
        self.networks
            .get(&network)
            .ok_or_else(|| UnsupportedNetwork(network.to_string()))
    }

    /// Parses a caller-supplied identifier and returns its configuration.
    ///
    /// Fails for identifiers that are unknown or known but not configured here.
    pub fn resolve(&self, identifier: &str) -> Result<&NetworkConfig, UnsupportedNetwork> {
        let network: Network = identifier.parse()?;
        self.networks
            .get(&network)
            .ok_or_else(|| UnsupportedNetwork(identifier.to_string()))
    }

    /// Configured networks, ordered by chain id.
    pub fn iter(&self) -> impl Iterator<Item = &NetworkConfig> {
        let mut configs: Vec<_> = self.networks.values().collect();
        configs.sort_by_key(|c| c.network);
        configs.into_iter()
    }

    pub fn is_empty(&self) -> bool {
        self.networks.is_empty()
    }
}
