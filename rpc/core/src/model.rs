//! Chain RPC data models and types

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// RPC error type
#[derive(Error, Debug, Clone, Serialize, Deserialize)]
pub enum RpcError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("RPC error {code}: {message}")]
    Rpc { code: i32, message: String },

    #[error("Malformed response: {0}")]
    Decode(String),
}

/// Supported source chains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChainType {
    Btc,
    Ltc,
    Doge,
    Xrp,
    Algo,
}

impl ChainType {
    pub const ALL: [ChainType; 5] = [
        ChainType::Btc,
        ChainType::Ltc,
        ChainType::Doge,
        ChainType::Xrp,
        ChainType::Algo,
    ];

    /// Upper-case name used as the prefix of state rows (`XRP_N`).
    pub fn name(&self) -> &'static str {
        match self {
            ChainType::Btc => "BTC",
            ChainType::Ltc => "LTC",
            ChainType::Doge => "DOGE",
            ChainType::Xrp => "XRP",
            ChainType::Algo => "ALGO",
        }
    }

    /// Numeric tag stored in transaction rows.
    pub fn code(&self) -> i64 {
        match self {
            ChainType::Btc => 0,
            ChainType::Ltc => 1,
            ChainType::Doge => 2,
            ChainType::Xrp => 3,
            ChainType::Algo => 4,
        }
    }

    pub fn is_utxo(&self) -> bool {
        matches!(self, ChainType::Btc | ChainType::Ltc | ChainType::Doge)
    }
}

impl fmt::Display for ChainType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl std::str::FromStr for ChainType {
    type Err = RpcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ChainType::ALL
            .into_iter()
            .find(|chain| chain.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| RpcError::Internal(format!("unknown chain type '{s}'")))
    }
}

/// Block lookup key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BlockKey {
    Number(u64),
    Hash(String),
}

impl fmt::Display for BlockKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockKey::Number(number) => write!(f, "#{number}"),
            BlockKey::Hash(hash) => f.write_str(hash),
        }
    }
}

impl From<u64> for BlockKey {
    fn from(number: u64) -> Self {
        BlockKey::Number(number)
    }
}

impl From<&str> for BlockKey {
    fn from(hash: &str) -> Self {
        BlockKey::Hash(hash.to_string())
    }
}

/// Lightweight block header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockHeader {
    pub number: u64,
    pub hash: String,
    pub previous_block_hash: String,
    pub timestamp: u64,
}

/// Branch status of a tip reported by a forkable node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TipStatus {
    Active,
    ValidFork,
    ValidHeaders,
    HeadersOnly,
    Invalid,
}

/// Tip candidate returned by `getTopTips`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockTip {
    pub number: u64,
    pub hash: String,
    pub chain_tip_status: TipStatus,
}

/// Transaction input
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxInput {
    /// Spent transaction, absent for coinbase inputs.
    pub txid: Option<String>,
    pub vout: Option<u32>,
}

/// Transaction output
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TxOutput {
    pub value: u64,
    pub address: Option<String>,
}

/// Chain transaction as produced by the node adapter
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Transaction {
    pub txid: String,
    /// Chain-specific type tag (`coinbase`, `payment`, `full_payment`, ...).
    #[serde(rename = "type")]
    pub tx_type: String,
    #[serde(default)]
    pub payment_reference: Option<String>,
    #[serde(default)]
    pub is_native_payment: bool,
    #[serde(default)]
    pub inputs: Vec<TxInput>,
    #[serde(default)]
    pub outputs: Vec<TxOutput>,
    /// Raw node response, kept opaque.
    #[serde(default)]
    pub data: serde_json::Value,
}

impl Transaction {
    pub fn is_coinbase(&self) -> bool {
        self.tx_type == "coinbase"
    }

    pub fn has_payment_reference(&self) -> bool {
        self.payment_reference
            .as_deref()
            .map(|reference| !reference.is_empty())
            .unwrap_or(false)
    }
}

/// Block with its transaction set
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub number: u64,
    pub hash: String,
    pub previous_block_hash: String,
    pub timestamp: u64,
    /// Ledger chains may return data that is not final yet.
    #[serde(default = "default_true")]
    pub is_valid: bool,
    #[serde(default)]
    pub transaction_ids: Vec<String>,
    /// Inline transaction bodies; empty when the node only lists ids.
    #[serde(default)]
    pub transactions: Vec<Transaction>,
}

fn default_true() -> bool {
    true
}

impl Block {
    pub fn header(&self) -> BlockHeader {
        BlockHeader {
            number: self.number,
            hash: self.hash.clone(),
            previous_block_hash: self.previous_block_hash.clone(),
            timestamp: self.timestamp,
        }
    }

    pub fn transaction_count(&self) -> usize {
        self.transaction_ids.len().max(self.transactions.len())
    }
}

/// Node health
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeStatus {
    pub is_synced: bool,
    #[serde(default)]
    pub version: String,
}

/// Request-rate instrumentation exposed by every client
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ClientStats {
    /// Requests currently on the wire.
    pub in_processing: usize,
    /// Requests waiting for a free connection slot.
    pub in_queue: usize,
    pub requests_per_sec: f64,
}
