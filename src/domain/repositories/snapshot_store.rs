use async_trait::async_trait;

use crate::persistence::{LedgerSnapshot, PersistenceError};

/// Storage of one ledger document per identity.
#[async_trait]
pub trait SnapshotStore: Send + Sync {
    /// Loads and migrates the stored document, if any.
    async fn load(&self, identity: &str) -> Result<Option<LedgerSnapshot>, PersistenceError>;

    /// Replaces the stored document for `snapshot.identity`.
    async fn save(&self, snapshot: &LedgerSnapshot) -> Result<(), PersistenceError>;
}
