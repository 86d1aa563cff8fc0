//! Confirmed-history indexer
//!
//! Follows one chain node, keeps a rolling window of confirmed blocks and
//! transactions in SQLite and records the unconfirmed tip for consumers
//! that need to reason about forks.

pub mod admin;
pub mod cli;
pub mod client;
pub mod clock;
pub mod config;
pub mod continuity;
pub mod database;
pub mod engine;
pub mod error;
pub mod models;
pub mod processor;
pub mod retention;
pub mod retry;
pub mod tips;

pub use config::IndexerConfig;
pub use engine::{EngineState, IndexingEngine};
pub use error::{IndexerError, Result};
