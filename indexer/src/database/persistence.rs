//! Chain-scoped reads and writes of state rows, blocks and transaction tables

use std::sync::Arc;

use parking_lot::RwLock;
use sqlx::SqliteConnection;
use tracing::{debug, info, warn};

use rpc_core::ChainType;

use crate::clock::Clock;
use crate::database::schema::{self, ChainTables, STATE_TABLE};
use crate::database::Database;
use crate::error::Result;
use crate::models::{state_key, state_names, BlockRecord, StateRecord, TransactionRecord};

pub struct Persistence {
    db: Database,
    chain: ChainType,
    tables: ChainTables,
    clock: Arc<dyn Clock>,
    /// Timestamp of the retained-history lower bound once known.
    bottom_block_time: RwLock<Option<u64>>,
}

impl Persistence {
    pub fn new(db: Database, chain: ChainType, clock: Arc<dyn Clock>) -> Self {
        Self {
            db,
            chain,
            tables: ChainTables::new(chain),
            clock,
            bottom_block_time: RwLock::new(None),
        }
    }

    pub fn chain(&self) -> ChainType {
        self.chain
    }

    pub fn tables(&self) -> &ChainTables {
        &self.tables
    }

    pub fn database(&self) -> &Database {
        &self.db
    }

    pub fn now(&self) -> u64 {
        self.clock.now_unix()
    }

    // State rows

    pub async fn get_state(&self, name: &str) -> Result<Option<StateRecord>> {
        let row = sqlx::query_as::<_, StateRecord>("SELECT * FROM state WHERE name = ?")
            .bind(state_key(self.chain, name))
            .fetch_optional(self.db.pool())
            .await?;
        Ok(row)
    }

    /// Last confirmed height, 0 on a fresh database.
    pub async fn get_indexed_height(&self) -> Result<u64> {
        Ok(self
            .get_state(state_names::INDEXED_HEIGHT)
            .await?
            .map(|state| state.value_number.max(0) as u64)
            .unwrap_or(0))
    }

    pub async fn write_state(&self, record: &StateRecord) -> Result<()> {
        let mut conn = self.db.pool().acquire().await?;
        upsert_state(&mut conn, record).await
    }

    pub async fn write_indexed_height(&self, n: u64) -> Result<()> {
        self.write_state(&StateRecord::number(self.chain, state_names::INDEXED_HEIGHT, n as i64, self.now()))
            .await
    }

    pub async fn write_tip_height(&self, t: u64) -> Result<()> {
        self.write_state(&StateRecord::number(self.chain, state_names::TIP_HEIGHT, t as i64, self.now()))
            .await
    }

    /// Human-readable status row (`sync`, `running`, `running-sync`, `waiting`).
    pub async fn write_status(&self, status: &str, value_number: i64, comment: &str) -> Result<()> {
        self.write_state(&StateRecord::text(
            self.chain,
            state_names::STATUS,
            status,
            value_number,
            comment,
            self.now(),
        ))
        .await
    }

    pub async fn drop_all_state_info(&self) -> Result<()> {
        let pattern = format!("{}\\_%", self.chain.name());
        let removed = sqlx::query("DELETE FROM state WHERE name LIKE ? ESCAPE '\\'")
            .bind(pattern)
            .execute(self.db.pool())
            .await?
            .rows_affected();
        *self.bottom_block_time.write() = None;
        info!(chain = %self.chain, removed, "dropped chain state");
        Ok(())
    }

    // Blocks

    /// Persists one confirmed block as a single atomic unit.
    ///
    /// Writes the transaction rows (or the empty-block placeholder) into
    /// `transactions_table`, the confirmed block row and the `N`/`T` state rows.
    pub async fn save_confirmed_block(
        &self,
        transactions_table: &str,
        block: &BlockRecord,
        transactions: &[TransactionRecord],
        tip_height: u64,
    ) -> Result<()> {
        let now = self.now();
        let mut tx = self.db.pool().begin().await?;

        if transactions.is_empty() {
            let marker = TransactionRecord::empty_block(self.chain, block.block_number, block.timestamp);
            insert_transaction(&mut tx, transactions_table, &marker).await?;
        } else {
            for record in transactions {
                insert_transaction(&mut tx, transactions_table, record).await?;
            }
        }

        let mut confirmed = block.clone();
        confirmed.confirmed = true;
        confirmed.transactions = transactions.len() as u64;
        let sql = format!(
            "INSERT INTO {} (block_hash, block_number, timestamp, previous_block_hash, confirmed, number_of_confirmations, transactions) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(block_hash) DO UPDATE SET \
                block_number = excluded.block_number, \
                timestamp = excluded.timestamp, \
                previous_block_hash = excluded.previous_block_hash, \
                confirmed = excluded.confirmed, \
                number_of_confirmations = excluded.number_of_confirmations, \
                transactions = excluded.transactions",
            self.tables.block
        );
        bind_block(sqlx::query(&sql), &confirmed).execute(&mut *tx).await?;

        upsert_state(
            &mut tx,
            &StateRecord::number(self.chain, state_names::INDEXED_HEIGHT, block.block_number as i64, now),
        )
        .await?;
        upsert_state(
            &mut tx,
            &StateRecord::number(self.chain, state_names::TIP_HEIGHT, tip_height as i64, now),
        )
        .await?;

        tx.commit().await?;
        Ok(())
    }

    /// Upserts provisional header rows; confirmed rows are never touched.
    pub async fn upsert_unconfirmed_blocks(&self, blocks: &[BlockRecord]) -> Result<()> {
        if blocks.is_empty() {
            return Ok(());
        }
        let table = &self.tables.block;
        let sql = format!(
            "INSERT INTO {table} (block_hash, block_number, timestamp, previous_block_hash, confirmed, number_of_confirmations, transactions) \
             VALUES (?, ?, ?, ?, ?, ?, ?) \
             ON CONFLICT(block_hash) DO UPDATE SET \
                number_of_confirmations = excluded.number_of_confirmations, \
                timestamp = CASE WHEN excluded.timestamp > 0 THEN excluded.timestamp ELSE {table}.timestamp END, \
                previous_block_hash = CASE WHEN excluded.previous_block_hash != '' \
                    THEN excluded.previous_block_hash ELSE {table}.previous_block_hash END \
             WHERE {table}.confirmed = 0"
        );
        let mut tx = self.db.pool().begin().await?;
        for block in blocks {
            bind_block(sqlx::query(&sql), block).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        debug!(chain = %self.chain, count = blocks.len(), "saved unconfirmed headers");
        Ok(())
    }

    /// Block rows above `n`, the working set of header collection.
    pub async fn load_blocks_above(&self, n: u64) -> Result<Vec<BlockRecord>> {
        let sql = format!("SELECT * FROM {} WHERE block_number > ? ORDER BY block_number", self.tables.block);
        let rows = sqlx::query_as::<_, BlockRecord>(&sql)
            .bind(n as i64)
            .fetch_all(self.db.pool())
            .await?;
        Ok(rows)
    }

    pub async fn get_confirmed_block(&self, number: u64) -> Result<Option<BlockRecord>> {
        let sql = format!(
            "SELECT * FROM {} WHERE block_number = ? AND confirmed = 1 LIMIT 1",
            self.tables.block
        );
        let row = sqlx::query_as::<_, BlockRecord>(&sql)
            .bind(number as i64)
            .fetch_optional(self.db.pool())
            .await?;
        Ok(row)
    }

    // Retained-history lower bound

    /// Lowest block number present in either transaction table.
    pub async fn get_bottom_block_number(&self) -> Result<Option<u64>> {
        let mut bottom: Option<u64> = None;
        for table in &self.tables.transactions {
            let sql = format!("SELECT MIN(block_number) FROM {table}");
            let min: Option<i64> = sqlx::query_scalar(&sql).fetch_one(self.db.pool()).await?;
            if let Some(min) = min {
                let min = min.max(0) as u64;
                bottom = Some(bottom.map_or(min, |b| b.min(min)));
            }
        }
        Ok(bottom)
    }

    /// Recomputes and stores `Nbottom`/`NbottomTime`; returns the new bound.
    pub async fn save_bottom_state(&self) -> Result<Option<u64>> {
        let Some(bottom) = self.get_bottom_block_number().await? else {
            debug!(chain = %self.chain, "no transactions stored yet, bottom state unchanged");
            return Ok(None);
        };

        let Some(block) = self.get_confirmed_block(bottom).await? else {
            warn!(chain = %self.chain, bottom, "bottom block row missing");
            return Ok(None);
        };

        *self.bottom_block_time.write() = Some(block.timestamp);
        let now = self.now();
        self.write_state(&StateRecord::number(self.chain, state_names::BOTTOM_NUMBER, bottom as i64, now))
            .await?;
        self.write_state(&StateRecord::number(
            self.chain,
            state_names::BOTTOM_TIME,
            block.timestamp as i64,
            now,
        ))
        .await?;
        info!(chain = %self.chain, bottom, bottom_time = block.timestamp, "retained history lower bound");
        Ok(Some(bottom))
    }

    pub fn bottom_block_time(&self) -> Option<u64> {
        *self.bottom_block_time.read()
    }

    // Table maintenance

    /// Oldest row of a transaction table as `(timestamp, block_number)`.
    pub async fn oldest_transaction(&self, table: &str) -> Result<Option<(u64, u64)>> {
        let sql = format!("SELECT timestamp, block_number FROM {table} ORDER BY block_number ASC LIMIT 1");
        let row: Option<(i64, i64)> = sqlx::query_as(&sql).fetch_optional(self.db.pool()).await?;
        Ok(row.map(|(ts, number)| (ts.max(0) as u64, number.max(0) as u64)))
    }

    /// `max - min + 1 - count(distinct)` of block numbers at or above `bottom`.
    pub async fn missing_block_numbers(&self, table: &str, bottom: u64) -> Result<i64> {
        let sql = format!(
            "SELECT MAX(block_number) - MIN(block_number) + 1 - COUNT(DISTINCT block_number) \
             FROM {table} WHERE block_number >= ?"
        );
        let missing: Option<i64> = sqlx::query_scalar(&sql)
            .bind(bottom as i64)
            .fetch_one(self.db.pool())
            .await?;
        Ok(missing.unwrap_or(0))
    }

    pub async fn count_rows(&self, table: &str) -> Result<i64> {
        let sql = format!("SELECT COUNT(*) FROM {table}");
        Ok(sqlx::query_scalar(&sql).fetch_one(self.db.pool()).await?)
    }

    /// Drops `table` and creates it empty again.
    pub async fn recreate_transactions_table(&self, table: &str) -> Result<()> {
        let mut tx = self.db.pool().begin().await?;
        sqlx::query(&schema::drop_table(table)).execute(&mut *tx).await?;
        for statement in schema::create_transactions_table(table) {
            sqlx::query(&statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        Ok(())
    }

    pub async fn drop_chain_tables(&self) -> Result<()> {
        drop_tables(&self.db, &self.tables).await
    }

    /// Drops the state table and the tables of every supported chain.
    pub async fn drop_all_chains(db: &Database) -> Result<()> {
        sqlx::query(&schema::drop_table(STATE_TABLE)).execute(db.pool()).await?;
        for chain in ChainType::ALL {
            drop_tables(db, &ChainTables::new(chain)).await?;
        }
        Ok(())
    }
}

async fn drop_tables(db: &Database, tables: &ChainTables) -> Result<()> {
    for table in tables.all() {
        sqlx::query(&schema::drop_table(table)).execute(db.pool()).await?;
        info!(table, "dropped table");
    }
    Ok(())
}

async fn upsert_state(conn: &mut SqliteConnection, record: &StateRecord) -> Result<()> {
    sqlx::query(
        "INSERT INTO state (name, value_string, value_number, timestamp, comment) VALUES (?, ?, ?, ?, ?) \
         ON CONFLICT(name) DO UPDATE SET \
            value_string = excluded.value_string, \
            value_number = excluded.value_number, \
            timestamp = excluded.timestamp, \
            comment = excluded.comment",
    )
    .bind(&record.name)
    .bind(&record.value_string)
    .bind(record.value_number)
    .bind(record.timestamp)
    .bind(&record.comment)
    .execute(conn)
    .await?;
    Ok(())
}

async fn insert_transaction(conn: &mut SqliteConnection, table: &str, record: &TransactionRecord) -> Result<()> {
    let sql = format!(
        "INSERT INTO {table} (chain_type, transaction_id, block_number, timestamp, payment_reference, is_native_payment, transaction_type, response) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?)"
    );
    sqlx::query(&sql)
        .bind(record.chain_type)
        .bind(&record.transaction_id)
        .bind(record.block_number as i64)
        .bind(record.timestamp as i64)
        .bind(&record.payment_reference)
        .bind(record.is_native_payment)
        .bind(&record.transaction_type)
        .bind(&record.response)
        .execute(conn)
        .await?;
    Ok(())
}

fn bind_block<'q>(
    query: sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    block: &'q BlockRecord,
) -> sqlx::query::Query<'q, sqlx::Sqlite, sqlx::sqlite::SqliteArguments<'q>> {
    query
        .bind(&block.block_hash)
        .bind(block.block_number as i64)
        .bind(block.timestamp as i64)
        .bind(&block.previous_block_hash)
        .bind(block.confirmed)
        .bind(block.number_of_confirmations as i64)
        .bind(block.transactions as i64)
}
