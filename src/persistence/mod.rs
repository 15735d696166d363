//! Persistence layer
//!
//! Ledger state is stored as one versioned JSON document per identity in a
//! SQLite table managed through sqlx.
//!
//! # Database Schema
//!
//! ## ledger_snapshots
//! - identity: account identity (primary key)
//! - version: schema version of `document`
//! - document: JSON ledger snapshot
//! - updated_at: timestamp of the last write

pub mod memory_store;
pub mod snapshot;
pub mod sqlite_store;

use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::ConnectOptions;
use std::path::Path;
use std::str::FromStr;
use tracing::info;

pub use memory_store::InMemorySnapshotStore;
pub use snapshot::{migrate, LedgerSnapshot, CURRENT_SCHEMA_VERSION};
pub use sqlite_store::SqliteSnapshotStore;

/// Database connection pool
pub type DbPool = SqlitePool;

#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    #[error("Database connection error: {0}")]
    ConnectionError(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    MigrationError(String),

    #[error("Query error: {0}")]
    QueryError(String),

    #[error("Snapshot document error: {0}")]
    Serialization(String),

    #[error("Snapshot schema version {found} is newer than supported version {supported}")]
    UnsupportedVersion { found: u32, supported: u32 },
}

impl From<serde_json::Error> for PersistenceError {
    fn from(e: serde_json::Error) -> Self {
        PersistenceError::Serialization(e.to_string())
    }
}

/// Initialize the database connection pool and run migrations.
///
/// `database_url` is a sqlx SQLite URL such as `sqlite://data/ledger.db` or
/// `sqlite::memory:`.
pub async fn init_database(database_url: &str) -> Result<DbPool, PersistenceError> {
    info!("Initializing database: {}", database_url);

    if let Some(db_path) = database_url.strip_prefix("sqlite://") {
        if let Some(parent) = Path::new(db_path).parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                PersistenceError::ConnectionError(sqlx::Error::Configuration(Box::new(e)))
            })?;
        }
    }

    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .log_statements(tracing::log::LevelFilter::Debug);

    // Every connection to an in-memory database sees its own empty database.
    let max_connections = if database_url.contains(":memory:") { 1 } else { 5 };
    let pool = SqlitePoolOptions::new()
        .max_connections(max_connections)
        .connect_with(options)
        .await?;

    run_migrations(&pool).await?;

    info!("✓ Database initialized successfully");
    Ok(pool)
}

async fn run_migrations(pool: &DbPool) -> Result<(), PersistenceError> {
    info!("Running database migrations...");

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS ledger_snapshots (
            identity TEXT PRIMARY KEY,
            version INTEGER NOT NULL,
            document TEXT NOT NULL,
            updated_at DATETIME NOT NULL DEFAULT CURRENT_TIMESTAMP
        )
        "#,
    )
    .execute(pool)
    .await
    .map_err(|e| {
        PersistenceError::MigrationError(format!(
            "Failed to create ledger_snapshots table: {}",
            e
        ))
    })?;

    info!("✓ Database migrations completed");
    Ok(())
}
