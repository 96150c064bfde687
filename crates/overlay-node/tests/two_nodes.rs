//! End-to-end tests running two overlay nodes in one process: a seed node
//! and a second node bootstrapped against it.

use anyhow::Result;
use overlay_node::content::ContentResolver;
use overlay_node::content::FetchError;
use overlay_node::group_key::GroupKeyResolver;
use overlay_node::group_key::ResolveError;
use overlay_node::inbox::DeliveryStatus;
use overlay_node::inbox::InboxTransport;
use overlay_node::node::OverlayConfig;
use overlay_node::node::OverlayNode;
use overlay_node::storage::Artifact;
use overlay_node::storage::ContentStore;
use overlay_node::storage::InboxRecord;
use overlay_node::storage::InboxStore;
use overlay_node::storage::KeyDirectory;
use overlay_node::ArtifactId;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct TestStore {
    artifacts: Mutex<HashMap<String, Artifact>>,
    keys: Mutex<HashMap<String, String>>,
    users: Mutex<Vec<String>>,
    inbox: Mutex<Vec<InboxRecord>>,
}

impl TestStore {
    fn with_artifact(self, id: &str, data: &[u8]) -> Self {
        self.artifacts.lock().insert(
            id.to_string(),
            Artifact {
                data: data.to_vec(),
                active: true,
            },
        );
        self
    }

    fn with_key(self, wallet: &str, key: &str) -> Self {
        self.keys.lock().insert(wallet.to_string(), key.to_string());
        self
    }

    fn with_user(self, wallet: &str) -> Self {
        self.users.lock().push(wallet.to_string());
        self
    }
}

impl ContentStore for TestStore {
    fn artifact(&self, id: &ArtifactId) -> Result<Option<Artifact>> {
        Ok(self.artifacts.lock().get(&id.to_string()).cloned())
    }
}

impl KeyDirectory for TestStore {
    fn public_key(&self, wallet: &str) -> Result<Option<String>> {
        Ok(self.keys.lock().get(wallet).cloned())
    }
}

impl InboxStore for TestStore {
    fn recipient_known(&self, wallet: &str) -> Result<bool> {
        Ok(self.users.lock().iter().any(|user| user == wallet))
    }

    fn persist(&self, message: &InboxRecord) -> Result<()> {
        self.inbox.lock().push(message.clone());
        Ok(())
    }
}

/// Spawns a seed node and a second node bootstrapped against it.
async fn spawn_pair() -> (Arc<OverlayNode>, Arc<OverlayNode>) {
    let seed = Arc::new(
        OverlayNode::spawn(OverlayConfig {
            tcp_port: 0,
            udp_port: 0,
            bootstrap: None,
        })
        .await
        .expect("seed node to start"),
    );

    let tcp_addr = seed
        .listen_addrs()
        .await
        .expect("seed to report addresses")
        .into_iter()
        .find(|addr| addr.to_string().contains("/tcp/"))
        .expect("seed to listen on TCP");
    let bootstrap: overlay_node::Multiaddr = format!("{tcp_addr}/p2p/{}", seed.peer_id())
        .parse()
        .expect("valid bootstrap multiaddr");

    let node = Arc::new(
        OverlayNode::spawn(OverlayConfig {
            tcp_port: 0,
            udp_port: 0,
            bootstrap: Some(bootstrap),
        })
        .await
        .expect("second node to start"),
    );

    (seed, node)
}

/// Gossipsub needs a moment to exchange subscriptions before a broadcast
/// reaches the peer; retry instead of sleeping a fixed amount.
async fn with_retries<T, E, F, Fut>(attempts: usize, mut operation: F) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
{
    let mut last_err = None;
    for _ in 0..attempts {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) => last_err = Some(e),
        }
        tokio::time::sleep(Duration::from_millis(250)).await;
    }

    Err(last_err.expect("at least one attempt"))
}

#[tokio::test(flavor = "multi_thread")]
async fn fetches_artifact_over_the_overlay() {
    let (seed, node) = spawn_pair().await;

    let seed_store = Arc::new(TestStore::default().with_artifact("w1:p1:7", b"overlay bytes"));
    let node_store = Arc::new(TestStore::default());

    let _seed_resolver = ContentResolver::spawn(seed, seed_store).await.unwrap();
    let resolver = ContentResolver::spawn_with_timeout(node, node_store, Duration::from_secs(2))
        .await
        .unwrap();

    let id: ArtifactId = "w1:p1:7".parse().unwrap();
    let data = with_retries(10, || resolver.fetch(&id)).await.unwrap();
    assert_eq!(data, b"overlay bytes");

    // An identifier nobody holds times out on every attempt.
    let missing: ArtifactId = "w1:p1:999".parse().unwrap();
    let result = resolver.fetch(&missing).await;
    assert!(matches!(result, Err(FetchError::NotFound)));
}

#[tokio::test(flavor = "multi_thread")]
async fn resolves_public_key_from_the_group() {
    let (seed, node) = spawn_pair().await;

    let seed_store = Arc::new(TestStore::default().with_key("wallet-1", "{\"kty\":\"RSA\"}"));
    let node_store = Arc::new(TestStore::default());

    let _seed_resolver = GroupKeyResolver::spawn(seed, seed_store, "group-test".to_string())
        .await
        .unwrap();
    let resolver = GroupKeyResolver::spawn_with_timeout(
        node,
        node_store,
        "group-test".to_string(),
        Duration::from_secs(2),
    )
    .await
    .unwrap();

    let key = with_retries(10, || resolver.resolve("wallet-1"))
        .await
        .unwrap();
    assert_eq!(key, "{\"kty\":\"RSA\"}");

    let unknown = resolver.resolve("wallet-2").await;
    assert!(matches!(unknown, Err(ResolveError::NotFound)));
}

#[tokio::test(flavor = "multi_thread")]
async fn inbox_message_is_persisted_exactly_once_and_acknowledged() {
    let (seed, node) = spawn_pair().await;

    let receiver_store = Arc::new(TestStore::default().with_user("w2"));
    let sender_store = Arc::new(TestStore::default());

    let _receiver = InboxTransport::spawn(seed, receiver_store.clone())
        .await
        .unwrap();
    let sender = InboxTransport::spawn_with_timeout(node, sender_store, Duration::from_secs(2))
        .await
        .unwrap();

    // Warm up the mesh until a send goes through.
    with_retries(10, || async {
        match sender.send("w2", "w1", "warmup").await.unwrap() {
            DeliveryStatus::Delivered => Ok(()),
            DeliveryStatus::Undelivered => Err(anyhow::anyhow!("not yet delivered")),
        }
    })
    .await
    .unwrap();

    // A single tracked send is persisted exactly once.
    let status = sender.send("w2", "w1", "the real message").await.unwrap();
    assert_eq!(status, DeliveryStatus::Delivered);

    let delivered_count = receiver_store
        .inbox
        .lock()
        .iter()
        .filter(|record| record.user == "w2" && record.message == "the real message")
        .count();
    assert_eq!(delivered_count, 1);

    // A recipient nobody knows is never acknowledged.
    let status = sender.send("w-unknown", "w1", "hi").await.unwrap();
    assert_eq!(status, DeliveryStatus::Undelivered);
}
