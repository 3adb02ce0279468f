use alloy::primitives::{Address, U256};
use async_trait::async_trait;
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::Duration;
use url::Url;

use crate::network::{Network, NetworkRegistry};

use super::{DisputeIndex, IndexError, IndexedDispute};

pub(crate) const DISPUTE_QUERY: &str = r"
query Dispute($id: ID!) {
  dispute(id: $id) {
    id
    arbitrated
    createdAtBlock
    metaEvidenceId
    arbitrableHistory {
      metaEvidence
    }
  }
}
";

/// GraphQL client for the per-network dispute subgraphs.
#[derive(Debug, Clone)]
pub struct SubgraphIndex {
    client: Client,
    endpoints: HashMap<Network, Url>,
}

impl SubgraphIndex {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            endpoints: HashMap::new(),
        }
    }

    pub fn with_endpoint(mut self, network: Network, endpoint: Url) -> Self {
        self.endpoints.insert(network, endpoint);
        self
    }

    /// Uses the subgraph URL of every configured network.
    pub fn from_registry(
        registry: &NetworkRegistry,
        timeout: Duration,
    ) -> Result<Self, reqwest::Error> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(registry
            .iter()
            .filter_map(|c| c.subgraph_url.clone().map(|url| (c.network, url)))
            .fold(Self::new(client), |index, (network, url)| {
                index.with_endpoint(network, url)
            }))
    }

    async fn post_graph<T: DeserializeOwned>(
        &self,
        endpoint: &Url,
        query: &str,
        id: String,
    ) -> Result<GraphResponse<T>, IndexError> {
        let request = GraphRequest {
            query,
            variables: GraphVariables { id },
        };

        let response = self
            .client
            .post(endpoint.clone())
            .json(&request)
            .send()
            .await?
            .error_for_status()?;

        Ok(response.json::<GraphResponse<T>>().await?)
    }
}

#[async_trait]
impl DisputeIndex for SubgraphIndex {
    async fn dispute(
        &self,
        network: Network,
        dispute_id: u64,
    ) -> Result<Option<IndexedDispute>, IndexError> {
        let endpoint = self
            .endpoints
            .get(&network)
            .ok_or(IndexError::NotConfigured(network))?;

        let response: GraphResponse<DisputeData> = self
            .post_graph(endpoint, DISPUTE_QUERY, dispute_id.to_string())
            .await?;

        parse_dispute(response)
    }
}

fn parse_dispute(
    response: GraphResponse<DisputeData>,
) -> Result<Option<IndexedDispute>, IndexError> {
    if let Some(errors) = response.errors {
        let message = errors
            .into_iter()
            .map(|error| error.message)
            .collect::<Vec<_>>()
            .join("; ");
        return Err(IndexError::Graphql(message));
    }

    let data = response.data.ok_or(IndexError::MissingData)?;
    data.dispute.map(DisputeNode::into_indexed).transpose()
}

#[derive(Debug, Serialize)]
struct GraphRequest<'a> {
    query: &'a str,
    variables: GraphVariables,
}

#[derive(Debug, Serialize)]
struct GraphVariables {
    id: String,
}

#[derive(Debug, Deserialize)]
struct GraphResponse<T> {
    data: Option<T>,
    errors: Option<Vec<GraphError>>,
}

#[derive(Debug, Deserialize)]
struct GraphError {
    message: String,
}

#[derive(Debug, Deserialize)]
struct DisputeData {
    dispute: Option<DisputeNode>,
}

// Subgraph BigInt and Bytes scalars arrive as strings.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DisputeNode {
    id: String,
    arbitrated: String,
    created_at_block: String,
    meta_evidence_id: String,
    arbitrable_history: Option<ArbitrableHistory>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ArbitrableHistory {
    meta_evidence: Option<String>,
}

impl DisputeNode {
    fn into_indexed(self) -> Result<IndexedDispute, IndexError> {
        let dispute_id = self
            .id
            .parse()
            .map_err(|_| IndexError::Malformed(format!("dispute id {:?}", self.id)))?;
        let arbitrable: Address = self
            .arbitrated
            .parse()
            .map_err(|_| IndexError::Malformed(format!("arbitrated {:?}", self.arbitrated)))?;
        let created_at_block = self.created_at_block.parse().map_err(|_| {
            IndexError::Malformed(format!("createdAtBlock {:?}", self.created_at_block))
        })?;
        let meta_evidence_id = U256::from_str_radix(&self.meta_evidence_id, 10).map_err(|_| {
            IndexError::Malformed(format!("metaEvidenceId {:?}", self.meta_evidence_id))
        })?;
        let meta_evidence_uri = self
            .arbitrable_history
            .and_then(|h| h.meta_evidence)
            .filter(|uri| !uri.is_empty());

        Ok(IndexedDispute {
            dispute_id,
            arbitrable,
            meta_evidence_id,
            created_at_block,
            meta_evidence_uri,
        })
    }
}
