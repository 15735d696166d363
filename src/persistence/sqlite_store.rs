//! SQLite-backed snapshot store.

use async_trait::async_trait;
use chrono::Utc;
use sqlx::Row;
use tracing::{debug, error};

use super::snapshot::{migrate, LedgerSnapshot};
use super::{DbPool, PersistenceError};
use crate::domain::repositories::snapshot_store::SnapshotStore;

pub struct SqliteSnapshotStore {
    pool: DbPool,
    settlement_asset: String,
}

impl SqliteSnapshotStore {
    pub fn new(pool: DbPool, settlement_asset: impl Into<String>) -> Self {
        Self {
            pool,
            settlement_asset: settlement_asset.into(),
        }
    }
}

#[async_trait]
impl SnapshotStore for SqliteSnapshotStore {
    async fn load(&self, identity: &str) -> Result<Option<LedgerSnapshot>, PersistenceError> {
        let row = sqlx::query("SELECT document FROM ledger_snapshots WHERE identity = ?1")
            .bind(identity)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| {
                error!("Failed to load snapshot for {}: {}", identity, e);
                PersistenceError::QueryError(format!("Failed to load snapshot: {}", e))
            })?;

        let Some(row) = row else {
            debug!("No stored snapshot for {}", identity);
            return Ok(None);
        };
        let document: String = row
            .try_get("document")
            .map_err(|e| PersistenceError::QueryError(e.to_string()))?;
        let value: serde_json::Value = serde_json::from_str(&document)?;
        migrate(value, &self.settlement_asset).map(Some)
    }

    async fn save(&self, snapshot: &LedgerSnapshot) -> Result<(), PersistenceError> {
        let document = serde_json::to_string(snapshot)?;
        sqlx::query(
            r#"
            INSERT INTO ledger_snapshots (identity, version, document, updated_at)
            VALUES (?1, ?2, ?3, ?4)
            ON CONFLICT(identity) DO UPDATE SET
                version = excluded.version,
                document = excluded.document,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&snapshot.identity)
        .bind(snapshot.version as i64)
        .bind(document)
        .bind(Utc::now())
        .execute(&self.pool)
        .await
        .map_err(|e| {
            error!("Failed to save snapshot for {}: {}", snapshot.identity, e);
            PersistenceError::QueryError(format!("Failed to save snapshot: {}", e))
        })?;

        debug!("Saved snapshot for {}", snapshot.identity);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::init_database;

    async fn store() -> SqliteSnapshotStore {
        let pool = init_database("sqlite::memory:").await.unwrap();
        SqliteSnapshotStore::new(pool, "USDT")
    }

    #[tokio::test]
    async fn test_load_unknown_identity_returns_none() {
        let store = store().await;
        assert!(store.load("nobody").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_save_overwrites_previous_document() {
        let store = store().await;
        let mut snapshot = LedgerSnapshot {
            identity: "alice".to_string(),
            ..LedgerSnapshot::default()
        };
        store.save(&snapshot).await.unwrap();
        snapshot.next_order_id = 9;
        store.save(&snapshot).await.unwrap();

        let loaded = store.load("alice").await.unwrap().unwrap();
        assert_eq!(loaded.next_order_id, 9);
    }

    #[tokio::test]
    async fn test_v1_row_is_migrated_on_load() {
        let store = store().await;
        sqlx::query("INSERT INTO ledger_snapshots (identity, version, document) VALUES (?1, 1, ?2)")
            .bind("legacy")
            .bind(r#"{"identity":"legacy","account_info":{"balance":500.0}}"#)
            .execute(&store.pool)
            .await
            .unwrap();

        let loaded = store.load("legacy").await.unwrap().unwrap();
        assert_eq!(loaded.balances[0].total, 500.0);
        assert_eq!(loaded.version, 2);
    }
}
