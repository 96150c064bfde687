use anyhow::Context;
use anyhow::Result;
use async_trait::async_trait;
use overlay_node::ArtifactId;
use serde::Deserialize;
use serde_json::json;

const TX_APP_NAME: &str = "Haven";
const TX_APP_VERSION: &str = "0.0.1";
const TX_TYPE_PAYMENT: &str = "payment";
const TX_TYPE_SET_PRICE: &str = "set-price";
const TX_PRICE_TAG: &str = "Price";
const TX_POST_PRIVACY_PRIVATE: &str = "PRIVATE";

/// A payment transaction on the public ledger.
#[derive(Debug, Clone, Copy)]
pub struct PaymentTx {
    pub quantity: u64,
    pub timestamp: i64,
}

/// A set-price transaction on the public ledger.
#[derive(Debug, Clone, Copy)]
pub struct PriceTx {
    pub price: u64,
    pub timestamp: i64,
}

/// The external public ledger, reduced to the three queries the access gate
/// needs. A black box; any failure means the answer is unknown, not "no".
#[async_trait]
pub trait LedgerOracle: Send + Sync + 'static {
    /// Payment transactions from `payer` targeting `target_tx`.
    async fn payments(&self, payer: &str, target_tx: &str) -> Result<Vec<PaymentTx>>;

    /// Set-price transactions by `uploader` for `post_id`.
    async fn prices(&self, uploader: &str, post_id: &str) -> Result<Vec<PriceTx>>;

    /// Whether the post at `tx` marks `id` as private. `None` when the post
    /// does not reference the artifact at all.
    async fn is_private(&self, id: &ArtifactId, tx: &str) -> Result<Option<bool>>;
}

/// [`LedgerOracle`] against a ledger HTTP gateway.
pub struct GatewayClient {
    client: reqwest::Client,
    base_url: String,
}

impl GatewayClient {
    pub fn new(base_url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url,
        }
    }

    async fn graphql(&self, query: String) -> Result<Vec<TxNode>> {
        let response = self
            .client
            .post(format!("{}/graphql", self.base_url))
            .json(&json!({ "query": query }))
            .send()
            .await
            .context("Ledger query failed")?
            .error_for_status()
            .context("Ledger query rejected")?;

        let result = response
            .json::<QueryResult>()
            .await
            .context("Failed to parse ledger response")?;

        Ok(result
            .data
            .transactions
            .edges
            .into_iter()
            .map(|edge| edge.node)
            .collect())
    }
}

#[async_trait]
impl LedgerOracle for GatewayClient {
    async fn payments(&self, payer: &str, target_tx: &str) -> Result<Vec<PaymentTx>> {
        let query = format!(
            r#"{{
  transactions(
    owners: ["{payer}"],
    tags: [
      {{ name: "App-Name", values: ["{TX_APP_NAME}"] }},
      {{ name: "Version", values: ["{TX_APP_VERSION}"] }},
      {{ name: "Type", values: ["{TX_TYPE_PAYMENT}"] }},
      {{ name: "Target", values: ["{target_tx}"] }}
    ]
  ) {{
    edges {{ node {{ id quantity {{ winston }} block {{ timestamp }} }} }}
  }}
}}"#
        );

        let nodes = self.graphql(query).await?;

        let payments = nodes
            .into_iter()
            .filter_map(|node| {
                let quantity = node.quantity?.winston.parse().ok()?;
                let timestamp = node.block?.timestamp;
                Some(PaymentTx {
                    quantity,
                    timestamp,
                })
            })
            .collect();

        Ok(payments)
    }

    async fn prices(&self, uploader: &str, post_id: &str) -> Result<Vec<PriceTx>> {
        let query = format!(
            r#"{{
  transactions(
    owners: ["{uploader}"],
    tags: [
      {{ name: "App-Name", values: ["{TX_APP_NAME}"] }},
      {{ name: "Version", values: ["{TX_APP_VERSION}"] }},
      {{ name: "Type", values: ["{TX_TYPE_SET_PRICE}"] }},
      {{ name: "Target", values: ["{post_id}"] }}
    ]
  ) {{
    edges {{ node {{ id tags {{ name value }} block {{ timestamp }} }} }}
  }}
}}"#
        );

        let nodes = self.graphql(query).await?;

        let prices = nodes
            .into_iter()
            .filter_map(|node| {
                let price = node
                    .tags?
                    .into_iter()
                    .find(|tag| tag.name == TX_PRICE_TAG)?
                    .value
                    .parse()
                    .ok()?;
                let timestamp = node.block?.timestamp;
                Some(PriceTx { price, timestamp })
            })
            .collect();

        Ok(prices)
    }

    async fn is_private(&self, id: &ArtifactId, tx: &str) -> Result<Option<bool>> {
        let post = self
            .client
            .get(format!("{}/{tx}", self.base_url))
            .send()
            .await
            .context("Ledger fetch failed")?
            .error_for_status()
            .context("Ledger fetch rejected")?
            .json::<Post>()
            .await
            .context("Failed to parse post")?;

        let full_id = id.to_string();
        let private = post
            .content
            .into_iter()
            .find(|content| content.data == full_id)
            .map(|content| content.privacy == TX_POST_PRIVACY_PRIVATE);

        Ok(private)
    }
}

#[derive(Debug, Deserialize)]
struct QueryResult {
    data: QueryData,
}

#[derive(Debug, Deserialize)]
struct QueryData {
    transactions: Transactions,
}

#[derive(Debug, Deserialize)]
struct Transactions {
    edges: Vec<Edge>,
}

#[derive(Debug, Deserialize)]
struct Edge {
    node: TxNode,
}

#[derive(Debug, Deserialize)]
struct TxNode {
    #[allow(dead_code)]
    id: String,
    quantity: Option<Quantity>,
    block: Option<Block>,
    tags: Option<Vec<Tag>>,
}

#[derive(Debug, Deserialize)]
struct Quantity {
    winston: String,
}

#[derive(Debug, Deserialize)]
struct Block {
    timestamp: i64,
}

#[derive(Debug, Deserialize)]
struct Tag {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
struct Post {
    #[serde(default)]
    content: Vec<PostContent>,
}

#[derive(Debug, Deserialize)]
struct PostContent {
    data: String,
    privacy: String,
}
