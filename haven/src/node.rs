use crate::db::Store;
use anyhow::Context;
use anyhow::Result;
use overlay_node::content::ContentResolver;
use overlay_node::group_key::GroupKeyResolver;
use overlay_node::inbox::InboxTransport;
use overlay_node::node::OverlayConfig;
use overlay_node::node::OverlayNode;
use std::sync::Arc;

mod storage;

pub use storage::NodeStorage;

/// The process-wide distributed context: the overlay node and the three
/// request/reply services running on top of it, all backed by the same
/// local store.
pub struct Node {
    pub overlay: Arc<OverlayNode>,
    pub content: Arc<ContentResolver<NodeStorage>>,
    pub group_keys: Arc<GroupKeyResolver>,
    pub inbox: Arc<InboxTransport>,
}

impl Node {
    pub async fn start(config: OverlayConfig, store: Arc<Store>, group_topic: String) -> Result<Node> {
        let overlay = Arc::new(
            OverlayNode::spawn(config)
                .await
                .context("Failed to start overlay node")?,
        );

        let storage = Arc::new(NodeStorage::new(store));

        let content = Arc::new(
            ContentResolver::spawn(overlay.clone(), storage.clone())
                .await
                .context("Failed to start content resolver")?,
        );
        let group_keys = Arc::new(
            GroupKeyResolver::spawn(overlay.clone(), storage.clone(), group_topic)
                .await
                .context("Failed to start group key resolver")?,
        );
        let inbox = Arc::new(
            InboxTransport::spawn(overlay.clone(), storage)
                .await
                .context("Failed to start inbox transport")?,
        );

        Ok(Node {
            overlay,
            content,
            group_keys,
            inbox,
        })
    }
}
