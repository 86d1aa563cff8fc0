//! Database connection management

use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use std::path::Path;
use std::time::Duration;

use rpc_core::ChainType;

use crate::config::DatabaseConfig;
use crate::database::schema::{self, ChainTables};
use crate::error::Result;

#[derive(Clone)]
pub struct Database {
    pool: sqlx::SqlitePool,
}

impl Database {
    pub async fn new(database_path: &Path) -> Result<Self> {
        Self::connect(&DatabaseConfig {
            path: database_path.to_path_buf(),
            max_connections: 20,
            busy_timeout_ms: 30_000,
        })
        .await
    }

    pub async fn connect(config: &DatabaseConfig) -> Result<Self> {
        // Ensure the database directory exists
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_millis(config.busy_timeout_ms));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .acquire_timeout(Duration::from_secs(30))
            .connect_with(options)
            .await?;

        Ok(Self { pool })
    }

    pub fn pool(&self) -> &sqlx::SqlitePool {
        &self.pool
    }

    /// Creates the shared state table and the tables of `chain`.
    pub async fn migrate(&self, chain: ChainType) -> Result<()> {
        sqlx::query(schema::CREATE_STATE_TABLE).execute(&self.pool).await?;

        let tables = ChainTables::new(chain);
        let mut statements = schema::create_block_table(&tables.block);
        for table in &tables.transactions {
            statements.extend(schema::create_transactions_table(table));
        }
        for statement in &statements {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    pub async fn table_exists(&self, table: &str) -> Result<bool> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sqlite_master WHERE type = 'table' AND name = ?")
            .bind(table)
            .fetch_one(&self.pool)
            .await?;
        Ok(count > 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_database_creation() {
        let temp_dir = tempdir().unwrap();
        let db_path = temp_dir.path().join("test.db");

        let db = Database::new(&db_path).await.unwrap();
        assert!(db_path.exists());

        db.migrate(ChainType::Btc).await.unwrap();
        // Idempotent on restart
        db.migrate(ChainType::Btc).await.unwrap();

        for table in ["state", "btc_block", "btc_transactions0", "btc_transactions1"] {
            assert!(db.table_exists(table).await.unwrap(), "{table} missing");
        }
        let result: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM btc_block")
            .fetch_one(db.pool())
            .await
            .unwrap();
        assert_eq!(result.0, 0);
    }

    #[tokio::test]
    async fn test_connect_creates_parent_directories() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("chains").join("xrp").join("indexer.db");

        let db = Database::connect(&DatabaseConfig {
            path: path.clone(),
            max_connections: 2,
            busy_timeout_ms: 1_000,
        })
        .await
        .unwrap();

        assert!(path.exists());
        assert!(!db.table_exists("xrp_block").await.unwrap());
    }
}
