//! Row models for the indexed store

use serde::{Deserialize, Serialize};
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, Row};

use rpc_core::{Block, BlockHeader, ChainType};

/// Transaction type tag of the placeholder row written for blocks without transactions.
pub const EMPTY_BLOCK_INDICATOR: &str = "EMPTY_BLOCK_INDICATOR";

/// Payment reference stored for transactions that carry none.
pub const ZERO_PAYMENT_REFERENCE: &str =
    "0000000000000000000000000000000000000000000000000000000000000000";

/// Block row, provisional until `confirmed` is set by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRecord {
    pub block_number: u64,
    pub block_hash: String,
    pub timestamp: u64,
    pub previous_block_hash: String,
    pub confirmed: bool,
    pub number_of_confirmations: u32,
    pub transactions: u64,
}

impl BlockRecord {
    /// Unconfirmed row for a freshly observed tip.
    pub fn observed(number: u64, hash: &str) -> Self {
        Self {
            block_number: number,
            block_hash: hash.to_string(),
            timestamp: 0,
            previous_block_hash: String::new(),
            confirmed: false,
            number_of_confirmations: 1,
            transactions: 0,
        }
    }

    pub fn from_header(header: &BlockHeader) -> Self {
        Self {
            timestamp: header.timestamp,
            previous_block_hash: header.previous_block_hash.clone(),
            ..Self::observed(header.number, &header.hash)
        }
    }

    pub fn from_block(block: &Block) -> Self {
        Self {
            transactions: block.transaction_count() as u64,
            ..Self::from_header(&block.header())
        }
    }
}

impl<'r> FromRow<'r, SqliteRow> for BlockRecord {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            block_number: row.try_get::<i64, _>("block_number")? as u64,
            block_hash: row.try_get("block_hash")?,
            timestamp: row.try_get::<i64, _>("timestamp")? as u64,
            previous_block_hash: row.try_get("previous_block_hash")?,
            confirmed: row.try_get("confirmed")?,
            number_of_confirmations: row.try_get::<i64, _>("number_of_confirmations")? as u32,
            transactions: row.try_get::<i64, _>("transactions")? as u64,
        })
    }
}

/// Transaction row, immutable once written.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub chain_type: i64,
    pub transaction_id: String,
    pub block_number: u64,
    pub timestamp: u64,
    pub payment_reference: String,
    pub is_native_payment: bool,
    pub transaction_type: String,
    /// Snappy-compressed JSON of the node response.
    pub response: Vec<u8>,
}

impl TransactionRecord {
    /// Placeholder that keeps block numbers contiguous in the transaction table.
    pub fn empty_block(chain: ChainType, block_number: u64, timestamp: u64) -> Self {
        Self {
            chain_type: chain.code(),
            transaction_id: String::new(),
            block_number,
            timestamp,
            payment_reference: ZERO_PAYMENT_REFERENCE.to_string(),
            is_native_payment: false,
            transaction_type: EMPTY_BLOCK_INDICATOR.to_string(),
            response: Vec::new(),
        }
    }

    pub fn is_empty_block_indicator(&self) -> bool {
        self.transaction_type == EMPTY_BLOCK_INDICATOR
    }
}

impl<'r> FromRow<'r, SqliteRow> for TransactionRecord {
    fn from_row(row: &'r SqliteRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            chain_type: row.try_get("chain_type")?,
            transaction_id: row.try_get("transaction_id")?,
            block_number: row.try_get::<i64, _>("block_number")? as u64,
            timestamp: row.try_get::<i64, _>("timestamp")? as u64,
            payment_reference: row.try_get("payment_reference")?,
            is_native_payment: row.try_get("is_native_payment")?,
            transaction_type: row.try_get("transaction_type")?,
            response: row.try_get::<Option<Vec<u8>>, _>("response")?.unwrap_or_default(),
        })
    }
}

/// Chain-scoped key/value row in the shared `state` table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct StateRecord {
    pub name: String,
    pub value_string: String,
    pub value_number: i64,
    pub timestamp: i64,
    pub comment: String,
}

impl StateRecord {
    pub fn number(chain: ChainType, name: &str, value: i64, now: u64) -> Self {
        Self {
            name: state_key(chain, name),
            value_string: String::new(),
            value_number: value,
            timestamp: now as i64,
            comment: String::new(),
        }
    }

    pub fn text(chain: ChainType, name: &str, value: &str, value_number: i64, comment: &str, now: u64) -> Self {
        Self {
            name: state_key(chain, name),
            value_string: value.to_string(),
            value_number,
            timestamp: now as i64,
            comment: comment.to_string(),
        }
    }
}

/// `XRP_N` style key.
pub fn state_key(chain: ChainType, name: &str) -> String {
    format!("{}_{}", chain.name(), name)
}

pub mod state_names {
    pub const INDEXED_HEIGHT: &str = "N";
    pub const TIP_HEIGHT: &str = "T";
    pub const BOTTOM_NUMBER: &str = "Nbottom";
    pub const BOTTOM_TIME: &str = "NbottomTime";
    pub const STATUS: &str = "state";
}
