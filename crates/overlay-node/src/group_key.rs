use crate::correlator::Correlator;
use crate::node::OverlayNode;
use crate::node::Subscription;
use crate::node::TopicMessage;
use crate::storage::KeyDirectory;
use crate::wire;
use crate::wire::KeyTransfer;
use crate::KEY_TRANSFER_PROTOCOL;
use anyhow::Context;
use anyhow::Result;
use futures::future::RemoteHandle;
use futures::FutureExt;
use futures::StreamExt;
use libp2p_stream::IncomingStreams;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::spawn_blocking;

/// How long a lookup waits for a group member to answer. Half of the content
/// timeout; keys are small and the group is assumed to be close.
pub const GROUP_KEY_TIMEOUT: Duration = Duration::from_millis(2_500);

#[derive(Debug, thiserror::Error)]
pub enum ResolveError {
    /// No group member produced the key in time.
    #[error("no key for wallet")]
    NotFound,
    #[error("storage error: {0:#}")]
    Store(#[source] anyhow::Error),
}

/// First-contact public key lookup over an ad-hoc group topic.
///
/// The same request/reply shape as content resolution, but keyed by wallet
/// address: the wallet's home node is presumed to sit on the same
/// `group-<hash>` topic and answers over a `key-transfer` stream.
pub struct GroupKeyResolver {
    node: Arc<OverlayNode>,
    topic: String,
    pending: Correlator<String>,
    timeout: Duration,
    _serve_loop_handle: RemoteHandle<()>,
    _transfer_loop_handle: RemoteHandle<()>,
}

impl GroupKeyResolver {
    pub async fn spawn<S: KeyDirectory>(
        node: Arc<OverlayNode>,
        keys: Arc<S>,
        topic: String,
    ) -> Result<Self> {
        Self::spawn_with_timeout(node, keys, topic, GROUP_KEY_TIMEOUT).await
    }

    pub async fn spawn_with_timeout<S: KeyDirectory>(
        node: Arc<OverlayNode>,
        keys: Arc<S>,
        topic: String,
        timeout: Duration,
    ) -> Result<Self> {
        let subscription = node
            .join(&topic)
            .await
            .with_context(|| format!("Failed to join group topic {topic}"))?;
        let incoming = node
            .accept(KEY_TRANSFER_PROTOCOL)
            .context("Failed to register key-transfer handler")?;

        let pending = Correlator::new();

        let (serve_loop, serve_loop_handle) =
            serve_loop(node.clone(), keys, subscription).remote_handle();
        tokio::spawn(serve_loop);

        let (transfer_loop, transfer_loop_handle) =
            transfer_loop(incoming, pending.clone()).remote_handle();
        tokio::spawn(transfer_loop);

        Ok(Self {
            node,
            topic,
            pending,
            timeout,
            _serve_loop_handle: serve_loop_handle,
            _transfer_loop_handle: transfer_loop_handle,
        })
    }

    /// The group topic this resolver is attached to.
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Asks the group for `wallet`'s public key (JWK). The caller is
    /// expected to persist the key before using it.
    pub async fn resolve(&self, wallet: &str) -> Result<String, ResolveError> {
        let waiter = self.pending.register(wallet);

        if let Err(e) = self
            .node
            .publish(&self.topic, wallet.as_bytes().to_vec())
            .await
        {
            tracing::debug!(wallet, "Failed to publish key lookup: {e:#}");
        }

        match waiter.wait(self.timeout).await {
            Some(key) => Ok(key),
            None => Err(ResolveError::NotFound),
        }
    }
}

/// Answers key lookups for wallets registered with this node.
async fn serve_loop<S: KeyDirectory>(
    node: Arc<OverlayNode>,
    keys: Arc<S>,
    mut subscription: Subscription,
) {
    while let Some(message) = subscription.recv().await {
        if let Err(e) = serve_lookup(&node, &keys, &message).await {
            tracing::debug!("Not answering key lookup: {e:#}");
        }
    }

    tracing::debug!("Group topic subscription ended");
}

async fn serve_lookup<S: KeyDirectory>(
    node: &OverlayNode,
    keys: &Arc<S>,
    message: &TopicMessage,
) -> Result<()> {
    let wallet = std::str::from_utf8(&message.data)
        .context("Lookup is not UTF-8")?
        .to_string();

    let keys = keys.clone();
    let lookup = wallet.clone();
    let key = spawn_blocking(move || keys.public_key(&lookup))
        .await
        .context("Lookup task failed")??;

    let Some(key) = key else {
        return Ok(());
    };

    tracing::debug!(%wallet, peer = %message.source, "Answering key lookup");

    let mut stream = node
        .open_stream(message.source, KEY_TRANSFER_PROTOCOL)
        .await?;
    wire::write_message(&mut stream, &KeyTransfer { id: wallet, key }).await?;

    Ok(())
}

async fn transfer_loop(mut incoming: IncomingStreams, pending: Correlator<String>) {
    while let Some((peer, mut stream)) = incoming.next().await {
        let pending = pending.clone();
        tokio::spawn(async move {
            match wire::read_message::<KeyTransfer, _>(&mut stream, wire::MAX_TRANSFER_BYTES).await
            {
                Ok(transfer) => {
                    pending.deliver(&transfer.id, transfer.key);
                }
                Err(e) => {
                    tracing::warn!(%peer, "Dropping bad key-transfer stream: {e:#}");
                }
            }
        });
    }
}
