//! Error types for the indexer

use thiserror::Error;

#[derive(Error, Debug)]
pub enum IndexerError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("RPC error: {0}")]
    Rpc(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Compression error: {0}")]
    Compression(#[from] snap::Error),

    #[error("{label}: retries exhausted ({reason})")]
    RetryExhausted { label: String, reason: String },

    #[error("Expected block {expected} to be saved next, got {got}")]
    UnexpectedBlockNumber { expected: u64, got: u64 },

    #[error("Database discontinuity in {table}: {missing} block numbers missing above {bottom}")]
    Discontinuity { table: String, bottom: u64, missing: i64 },

    #[error("Indexer halted: {0}")]
    Halted(String),

    #[error("Fetch job cancelled")]
    Cancelled,

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, IndexerError>;

impl From<rpc_core::RpcError> for IndexerError {
    fn from(err: rpc_core::RpcError) -> Self {
        IndexerError::Rpc(err.to_string())
    }
}

impl IndexerError {
    /// Errors that end the process; everything else is a local outcome.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, IndexerError::Cancelled)
    }
}
