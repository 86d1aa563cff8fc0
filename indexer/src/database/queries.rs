//! Read-only query surface for downstream verifiers
//!
//! Absence is an ordinary `None`/empty result, never an error.

use std::sync::Arc;

use crate::database::Persistence;
use crate::error::Result;
use crate::models::{state_names, BlockRecord, StateRecord, TransactionRecord, EMPTY_BLOCK_INDICATOR};
use crate::retention::RetentionManager;

pub struct IndexedQueries {
    persistence: Arc<Persistence>,
    retention: Arc<RetentionManager>,
}

impl IndexedQueries {
    pub fn new(persistence: Arc<Persistence>, retention: Arc<RetentionManager>) -> Self {
        Self { persistence, retention }
    }

    pub async fn get_confirmed_block_by_hash(&self, hash: &str) -> Result<Option<BlockRecord>> {
        let sql = format!(
            "SELECT * FROM {} WHERE block_hash = ? AND confirmed = 1",
            self.persistence.tables().block
        );
        let block = sqlx::query_as::<_, BlockRecord>(&sql)
            .bind(normalize_hex(hash))
            .fetch_optional(self.persistence.database().pool())
            .await?;
        Ok(block)
    }

    pub async fn get_confirmed_block_by_number(&self, number: u64) -> Result<Option<BlockRecord>> {
        self.persistence.get_confirmed_block(number).await
    }

    pub async fn get_transaction_by_id(&self, transaction_id: &str) -> Result<Option<TransactionRecord>> {
        let found = self
            .select_transactions("transaction_id = ?", &[normalize_hex(transaction_id)], Some(1))
            .await?;
        Ok(found.into_iter().next())
    }

    pub async fn get_transactions_by_payment_reference(&self, reference: &str) -> Result<Vec<TransactionRecord>> {
        self.select_transactions("payment_reference = ?", &[normalize_hex(reference)], None)
            .await
    }

    /// Transactions with `from <= block_number <= to`; empty-block placeholders are skipped.
    pub async fn get_transactions_in_block_range(&self, from: u64, to: u64) -> Result<Vec<TransactionRecord>> {
        let guard = self.retention.tables().await;
        let mut found = Vec::new();
        for table in guard.both() {
            let sql = format!(
                "SELECT * FROM {table} WHERE block_number >= ? AND block_number <= ? AND transaction_type != ? \
                 ORDER BY block_number, id"
            );
            let rows = sqlx::query_as::<_, TransactionRecord>(&sql)
                .bind(from as i64)
                .bind(to as i64)
                .bind(EMPTY_BLOCK_INDICATOR)
                .fetch_all(self.persistence.database().pool())
                .await?;
            found.extend(rows);
        }
        found.sort_by_key(|tx| tx.block_number);
        Ok(found)
    }

    pub async fn get_indexed_height(&self) -> Result<u64> {
        self.persistence.get_indexed_height().await
    }

    /// Lowest block guaranteed to be present, if recorded.
    pub async fn get_bottom_block_number(&self) -> Result<Option<u64>> {
        Ok(self
            .persistence
            .get_state(state_names::BOTTOM_NUMBER)
            .await?
            .map(|state| state.value_number.max(0) as u64))
    }

    pub async fn get_state_rows(&self) -> Result<Vec<StateRecord>> {
        let pattern = format!("{}\\_%", self.persistence.chain().name());
        let rows = sqlx::query_as::<_, StateRecord>("SELECT * FROM state WHERE name LIKE ? ESCAPE '\\' ORDER BY name")
            .bind(pattern)
            .fetch_all(self.persistence.database().pool())
            .await?;
        Ok(rows)
    }

    async fn select_transactions(
        &self,
        predicate: &str,
        params: &[String],
        limit: Option<usize>,
    ) -> Result<Vec<TransactionRecord>> {
        let guard = self.retention.tables().await;
        let mut found = Vec::new();
        for table in guard.both() {
            let sql = format!("SELECT * FROM {table} WHERE {predicate} ORDER BY block_number, id");
            let mut query = sqlx::query_as::<_, TransactionRecord>(&sql);
            for param in params {
                query = query.bind(param);
            }
            found.extend(query.fetch_all(self.persistence.database().pool()).await?);
            if limit.map_or(false, |limit| found.len() >= limit) {
                break;
            }
        }
        if let Some(limit) = limit {
            found.truncate(limit);
        }
        Ok(found)
    }
}

fn normalize_hex(value: &str) -> String {
    value.trim_start_matches("0x").to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::database::Database;
    use rpc_core::ChainType;
    use tempfile::TempDir;

    async fn setup() -> (TempDir, Arc<Persistence>, IndexedQueries) {
        let temp_dir = tempfile::tempdir().unwrap();
        let db = Database::new(&temp_dir.path().join("indexer.db")).await.unwrap();
        db.migrate(ChainType::Btc).await.unwrap();
        let persistence = Arc::new(Persistence::new(db, ChainType::Btc, Arc::new(ManualClock::new(0))));
        let retention = Arc::new(RetentionManager::with_ranges(persistence.clone(), 86_400, 1_000));
        retention.initialize().await.unwrap();
        let queries = IndexedQueries::new(persistence.clone(), retention);
        (temp_dir, persistence, queries)
    }

    fn tx(number: u64, id: &str, reference: &str) -> TransactionRecord {
        TransactionRecord {
            chain_type: ChainType::Btc.code(),
            transaction_id: id.to_string(),
            block_number: number,
            timestamp: number * 10,
            payment_reference: reference.to_string(),
            is_native_payment: true,
            transaction_type: "payment".to_string(),
            response: vec![1, 2, 3],
        }
    }

    #[tokio::test]
    async fn test_lookups_across_both_tables() {
        let (_dir, persistence, queries) = setup().await;
        let [t0, t1] = persistence.tables().transactions.clone();
        let reference = "ab".repeat(32);

        let b1 = BlockRecord::observed(1, "aa01");
        let b2 = BlockRecord::observed(2, "aa02");
        persistence
            .save_confirmed_block(&t1, &b1, &[tx(1, "0a", &reference)], 5)
            .await
            .unwrap();
        persistence
            .save_confirmed_block(&t0, &b2, &[tx(2, "0b", &reference), tx(2, "0c", "")], 5)
            .await
            .unwrap();
        persistence
            .save_confirmed_block(&t0, &BlockRecord::observed(3, "aa03"), &[], 5)
            .await
            .unwrap();

        assert_eq!(queries.get_indexed_height().await.unwrap(), 3);
        assert!(queries.get_confirmed_block_by_hash("0xAA02").await.unwrap().is_some());
        assert!(queries.get_confirmed_block_by_hash("ffff").await.unwrap().is_none());
        assert_eq!(queries.get_confirmed_block_by_number(1).await.unwrap().unwrap().block_hash, "aa01");

        let found = queries.get_transaction_by_id("0x0A").await.unwrap().unwrap();
        assert_eq!(found.block_number, 1);
        assert!(queries.get_transaction_by_id("dead").await.unwrap().is_none());

        let by_reference = queries.get_transactions_by_payment_reference(&reference).await.unwrap();
        assert_eq!(by_reference.len(), 2);

        let range = queries.get_transactions_in_block_range(1, 3).await.unwrap();
        assert_eq!(range.len(), 3);
        assert!(range.iter().all(|tx| !tx.is_empty_block_indicator()));

        let names: Vec<String> = queries
            .get_state_rows()
            .await
            .unwrap()
            .into_iter()
            .map(|state| state.name)
            .collect();
        assert_eq!(names, vec!["BTC_N".to_string(), "BTC_T".to_string()]);
    }
}
