use crate::db;
use crate::db::Store;
use anyhow::Result;
use overlay_node::storage::Artifact;
use overlay_node::storage::ContentStore;
use overlay_node::storage::InboxRecord;
use overlay_node::storage::InboxStore;
use overlay_node::storage::KeyDirectory;
use overlay_node::ArtifactId;
use std::sync::Arc;

/// Implementation of the overlay storage traits on top of the local store.
#[derive(Clone)]
pub struct NodeStorage {
    store: Arc<Store>,
}

impl NodeStorage {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }
}

impl ContentStore for NodeStorage {
    fn artifact(&self, id: &ArtifactId) -> Result<Option<Artifact>> {
        let conn = self.store.conn();
        let image = db::images::get(&conn, id)?;

        Ok(image.map(|image| Artifact {
            data: image.data,
            active: image.active,
        }))
    }
}

impl KeyDirectory for NodeStorage {
    fn public_key(&self, wallet: &str) -> Result<Option<String>> {
        let conn = self.store.conn();
        let user = db::keys::get(&conn, wallet)?;

        Ok(user.map(|user| user.key))
    }
}

impl InboxStore for NodeStorage {
    fn recipient_known(&self, wallet: &str) -> Result<bool> {
        let conn = self.store.conn();

        Ok(db::keys::get(&conn, wallet)?.is_some())
    }

    fn persist(&self, message: &InboxRecord) -> Result<()> {
        let conn = self.store.conn();
        db::inbox::insert(
            &conn,
            &message.user,
            &message.sender,
            &message.message,
            message.timestamp,
        )?;

        Ok(())
    }
}
