use crate::correlator::Correlator;
use crate::node::OverlayNode;
use crate::node::Subscription;
use crate::node::TopicMessage;
use crate::storage::ContentStore;
use crate::wire;
use crate::wire::ImageTransfer;
use crate::ArtifactId;
use crate::CONTENT_NEED_TOPIC;
use crate::IMAGE_TRANSFER_PROTOCOL;
use anyhow::Context;
use anyhow::Result;
use futures::future::RemoteHandle;
use futures::FutureExt;
use futures::StreamExt;
use libp2p_stream::IncomingStreams;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::spawn_blocking;

/// How long a fetch waits for the overlay after publishing its need.
pub const CONTENT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The artifact exists locally but serving it has been disabled.
    #[error("artifact is disabled")]
    Disabled,
    /// Neither the local store nor the overlay produced the artifact in time.
    #[error("artifact not found")]
    NotFound,
    #[error("storage error: {0:#}")]
    Store(#[source] anyhow::Error),
}

/// Resolves artifact identifiers to bytes: local store first, then the
/// overlay via a `content-need` broadcast answered over `image-transfer`
/// streams.
///
/// Also answers the broadcasts of other nodes from the local store. Both
/// background loops stop when the resolver is dropped.
pub struct ContentResolver<S> {
    node: Arc<OverlayNode>,
    store: Arc<S>,
    pending: Correlator<Vec<u8>>,
    timeout: Duration,
    _serve_loop_handle: RemoteHandle<()>,
    _transfer_loop_handle: RemoteHandle<()>,
}

impl<S: ContentStore> ContentResolver<S> {
    /// Joins `content-need`, registers the `image-transfer` handler and
    /// spawns the two background loops.
    pub async fn spawn(node: Arc<OverlayNode>, store: Arc<S>) -> Result<Self> {
        Self::spawn_with_timeout(node, store, CONTENT_TIMEOUT).await
    }

    pub async fn spawn_with_timeout(
        node: Arc<OverlayNode>,
        store: Arc<S>,
        timeout: Duration,
    ) -> Result<Self> {
        let subscription = node
            .join(CONTENT_NEED_TOPIC)
            .await
            .context("Failed to join content-need topic")?;
        let incoming = node
            .accept(IMAGE_TRANSFER_PROTOCOL)
            .context("Failed to register image-transfer handler")?;

        let pending = Correlator::new();

        let (serve_loop, serve_loop_handle) =
            serve_loop(node.clone(), store.clone(), subscription).remote_handle();
        tokio::spawn(serve_loop);

        let (transfer_loop, transfer_loop_handle) =
            transfer_loop(incoming, pending.clone()).remote_handle();
        tokio::spawn(transfer_loop);

        Ok(Self {
            node,
            store,
            pending,
            timeout,
            _serve_loop_handle: serve_loop_handle,
            _transfer_loop_handle: transfer_loop_handle,
        })
    }

    /// Resolves `id` to its bytes.
    ///
    /// Tries the local store first; on a miss, broadcasts the identifier and
    /// waits for the first peer to answer. Concurrent fetches for the same
    /// identifier all complete with the one reply.
    pub async fn fetch(&self, id: &ArtifactId) -> Result<Vec<u8>, FetchError> {
        let store = self.store.clone();
        let lookup = id.clone();
        let local = spawn_blocking(move || store.artifact(&lookup))
            .await
            .map_err(|e| FetchError::Store(e.into()))?
            .map_err(FetchError::Store)?;

        match local {
            Some(artifact) if artifact.active => return Ok(artifact.data),
            Some(_) => return Err(FetchError::Disabled),
            None => {}
        }

        let key = id.to_string();
        let waiter = self.pending.register(&key);

        if let Err(e) = self
            .node
            .publish(CONTENT_NEED_TOPIC, key.clone().into_bytes())
            .await
        {
            // Without peers the publish fails outright; the waiter below
            // times out either way.
            tracing::debug!(id = %key, "Failed to publish content need: {e:#}");
        }

        match waiter.wait(self.timeout).await {
            Some(data) => Ok(data),
            None => Err(FetchError::NotFound),
        }
    }
}

/// Answers `content-need` broadcasts from the local store.
async fn serve_loop<S: ContentStore>(
    node: Arc<OverlayNode>,
    store: Arc<S>,
    mut subscription: Subscription,
) {
    while let Some(message) = subscription.recv().await {
        if let Err(e) = serve_need(&node, &store, &message).await {
            tracing::debug!("Not answering content need: {e:#}");
        }
    }

    tracing::debug!("content-need subscription ended");
}

async fn serve_need<S: ContentStore>(
    node: &OverlayNode,
    store: &Arc<S>,
    message: &TopicMessage,
) -> Result<()> {
    let id = std::str::from_utf8(&message.data)
        .context("Need is not UTF-8")?
        .parse::<ArtifactId>()
        .context("Need is not an artifact id")?;

    let store = store.clone();
    let lookup = id.clone();
    let artifact = spawn_blocking(move || store.artifact(&lookup))
        .await
        .context("Lookup task failed")??;

    let Some(artifact) = artifact else {
        // Not ours; some other node may answer.
        return Ok(());
    };
    if !artifact.active {
        return Ok(());
    }

    tracing::debug!(%id, peer = %message.source, "Answering content need");

    let mut stream = node
        .open_stream(message.source, IMAGE_TRANSFER_PROTOCOL)
        .await?;
    wire::write_message(
        &mut stream,
        &ImageTransfer {
            id: id.to_string(),
            data: artifact.data,
        },
    )
    .await?;

    Ok(())
}

/// Reads inbound `image-transfer` streams and completes pending fetches.
async fn transfer_loop(mut incoming: IncomingStreams, pending: Correlator<Vec<u8>>) {
    while let Some((peer, mut stream)) = incoming.next().await {
        let pending = pending.clone();
        tokio::spawn(async move {
            match wire::read_message::<ImageTransfer, _>(&mut stream, wire::MAX_TRANSFER_BYTES)
                .await
            {
                Ok(transfer) => {
                    let delivered = pending.deliver(&transfer.id, transfer.data);
                    tracing::debug!(
                        id = %transfer.id,
                        %peer,
                        delivered,
                        "Received artifact from overlay"
                    );
                }
                Err(e) => {
                    tracing::warn!(%peer, "Dropping bad image-transfer stream: {e:#}");
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::Artifact;
    use parking_lot::Mutex;
    use std::collections::HashMap;

    #[derive(Default)]
    struct MemoryStore {
        artifacts: Mutex<HashMap<String, Artifact>>,
    }

    impl ContentStore for MemoryStore {
        fn artifact(&self, id: &ArtifactId) -> Result<Option<Artifact>> {
            Ok(self.artifacts.lock().get(&id.to_string()).cloned())
        }
    }

    #[tokio::test]
    async fn fetch_prefers_the_local_store() {
        let node = Arc::new(
            OverlayNode::spawn(crate::node::OverlayConfig {
                tcp_port: 0,
                udp_port: 0,
                bootstrap: None,
            })
            .await
            .unwrap(),
        );

        let store = Arc::new(MemoryStore::default());
        store.artifacts.lock().insert(
            "w:p:1".to_string(),
            Artifact {
                data: b"local bytes".to_vec(),
                active: true,
            },
        );
        store.artifacts.lock().insert(
            "w:p:2".to_string(),
            Artifact {
                data: b"hidden".to_vec(),
                active: false,
            },
        );

        let resolver = ContentResolver::spawn_with_timeout(
            node,
            store,
            Duration::from_millis(200),
        )
        .await
        .unwrap();

        let data = resolver.fetch(&"w:p:1".parse().unwrap()).await.unwrap();
        assert_eq!(data, b"local bytes");

        let disabled = resolver.fetch(&"w:p:2".parse().unwrap()).await;
        assert!(matches!(disabled, Err(FetchError::Disabled)));

        let missing = resolver.fetch(&"w:p:3".parse().unwrap()).await;
        assert!(matches!(missing, Err(FetchError::NotFound)));
    }
}
