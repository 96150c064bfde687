use crate::ArtifactId;
use anyhow::Result;

/// A stored artifact as the overlay sees it.
#[derive(Debug, Clone)]
pub struct Artifact {
    pub data: Vec<u8>,
    /// Disabled artifacts exist but are never served, locally or remotely.
    pub active: bool,
}

/// An inbox message as handed to the store by the receive loop.
#[derive(Debug, Clone)]
pub struct InboxRecord {
    pub user: String,
    pub sender: String,
    pub message: String,
    pub timestamp: i64,
}

/// Artifact lookup interface.
///
/// It exists so that consumers of this crate can define their own storage;
/// the overlay only ever reads.
pub trait ContentStore: Send + Sync + 'static {
    fn artifact(&self, id: &ArtifactId) -> Result<Option<Artifact>>;
}

/// Public key lookup interface used to answer `key-transfer` requests for
/// wallets this node knows.
pub trait KeyDirectory: Send + Sync + 'static {
    fn public_key(&self, wallet: &str) -> Result<Option<String>>;
}

/// Inbox persistence interface used by the `inbox` receive loop.
pub trait InboxStore: Send + Sync + 'static {
    /// Whether `wallet` is a user of this node. Messages for unknown users
    /// are ignored without an acknowledgement.
    fn recipient_known(&self, wallet: &str) -> Result<bool>;

    fn persist(&self, message: &InboxRecord) -> Result<()>;
}
