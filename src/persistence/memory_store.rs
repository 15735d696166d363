use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use tokio::sync::RwLock;

use super::snapshot::{migrate, LedgerSnapshot};
use super::PersistenceError;
use crate::domain::repositories::snapshot_store::SnapshotStore;

/// Snapshot store kept in process memory. Documents are stored as raw JSON
/// and go through the same migration path as the SQLite store.
pub struct InMemorySnapshotStore {
    documents: RwLock<HashMap<String, Value>>,
    settlement_asset: String,
}

impl InMemorySnapshotStore {
    pub fn new(settlement_asset: impl Into<String>) -> Self {
        Self {
            documents: RwLock::new(HashMap::new()),
            settlement_asset: settlement_asset.into(),
        }
    }

    /// Seeds a raw document, e.g. one written by an older version.
    pub async fn insert_raw(&self, identity: impl Into<String>, document: Value) {
        self.documents.write().await.insert(identity.into(), document);
    }

    pub async fn raw(&self, identity: &str) -> Option<Value> {
        self.documents.read().await.get(identity).cloned()
    }
}

impl Default for InMemorySnapshotStore {
    fn default() -> Self {
        Self::new("USDT")
    }
}

#[async_trait]
impl SnapshotStore for InMemorySnapshotStore {
    async fn load(&self, identity: &str) -> Result<Option<LedgerSnapshot>, PersistenceError> {
        match self.documents.read().await.get(identity) {
            Some(document) => migrate(document.clone(), &self.settlement_asset).map(Some),
            None => Ok(None),
        }
    }

    async fn save(&self, snapshot: &LedgerSnapshot) -> Result<(), PersistenceError> {
        let document = serde_json::to_value(snapshot)?;
        self.documents
            .write()
            .await
            .insert(snapshot.identity.clone(), document);
        Ok(())
    }
}
