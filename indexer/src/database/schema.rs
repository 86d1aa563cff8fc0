//! Database schema definitions
//!
//! Every chain gets its own block table and a pair of transaction tables;
//! the `state` table is shared and keyed by chain-prefixed names.

use rpc_core::ChainType;

pub const STATE_TABLE: &str = "state";

pub const CREATE_STATE_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS state (
    name TEXT PRIMARY KEY,
    value_string TEXT NOT NULL DEFAULT '',
    value_number BIGINT NOT NULL DEFAULT 0,
    timestamp BIGINT NOT NULL DEFAULT 0,
    comment TEXT NOT NULL DEFAULT ''
)
"#;

/// Physical table names of one chain.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainTables {
    pub block: String,
    pub transactions: [String; 2],
}

impl ChainTables {
    pub fn new(chain: ChainType) -> Self {
        let prefix = chain.name().to_lowercase();
        Self {
            block: format!("{prefix}_block"),
            transactions: [
                format!("{prefix}_transactions0"),
                format!("{prefix}_transactions1"),
            ],
        }
    }

    pub fn all(&self) -> [&str; 3] {
        [&self.block, &self.transactions[0], &self.transactions[1]]
    }
}

pub fn create_block_table(table: &str) -> Vec<String> {
    vec![
        format!(
            r#"
CREATE TABLE IF NOT EXISTS {table} (
    block_hash TEXT PRIMARY KEY,
    block_number BIGINT NOT NULL,
    timestamp BIGINT NOT NULL DEFAULT 0,
    previous_block_hash TEXT NOT NULL DEFAULT '',
    confirmed BOOLEAN NOT NULL DEFAULT 0,
    number_of_confirmations INTEGER NOT NULL DEFAULT 0,
    transactions BIGINT NOT NULL DEFAULT 0
)
"#
        ),
        format!("CREATE INDEX IF NOT EXISTS idx_{table}_number ON {table}(block_number)"),
        format!("CREATE INDEX IF NOT EXISTS idx_{table}_confirmed ON {table}(confirmed, block_number)"),
    ]
}

pub fn create_transactions_table(table: &str) -> Vec<String> {
    vec![
        format!(
            r#"
CREATE TABLE IF NOT EXISTS {table} (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    chain_type INTEGER NOT NULL,
    transaction_id TEXT NOT NULL DEFAULT '',
    block_number BIGINT NOT NULL,
    timestamp BIGINT NOT NULL DEFAULT 0,
    payment_reference TEXT NOT NULL DEFAULT '',
    is_native_payment BOOLEAN NOT NULL DEFAULT 0,
    transaction_type TEXT NOT NULL DEFAULT '',
    response BLOB
)
"#
        ),
        format!("CREATE INDEX IF NOT EXISTS idx_{table}_txid ON {table}(transaction_id)"),
        format!("CREATE INDEX IF NOT EXISTS idx_{table}_number ON {table}(block_number)"),
        format!("CREATE INDEX IF NOT EXISTS idx_{table}_reference ON {table}(payment_reference)"),
    ]
}

pub fn drop_table(table: &str) -> String {
    format!("DROP TABLE IF EXISTS {table}")
}
