//! Double-buffered transaction tables bounding storage growth
//!
//! Transactions go to the active table of a pair. Once the active table
//! covers the configured time or block range, the pair flips: the table
//! holding the oldest history is truncated and becomes the write target,
//! while the previously active table keeps the most recent history.

use std::sync::Arc;

use tokio::sync::{RwLock, RwLockReadGuard};
use tracing::info;

use crate::config::ChainConfig;
use crate::database::Persistence;
use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionState {
    pub active_index: usize,
    /// `None` until the first block is seen on an empty store.
    pub end_block_time: Option<u64>,
    pub end_block_number: u64,
}

impl Default for RetentionState {
    fn default() -> Self {
        Self {
            active_index: 0,
            end_block_time: None,
            end_block_number: 0,
        }
    }
}

pub struct RetentionManager {
    persistence: Arc<Persistence>,
    time_range: u64,
    block_range: u64,
    /// Held for writing while a rotation is in flight.
    state: RwLock<RetentionState>,
}

/// Read access to the table pair; rotations wait until it is dropped.
pub struct TablesGuard<'a> {
    tables: &'a [String; 2],
    state: RwLockReadGuard<'a, RetentionState>,
}

impl<'a> TablesGuard<'a> {
    pub fn active(&self) -> &str {
        &self.tables[self.state.active_index]
    }

    pub fn both(&self) -> &[String; 2] {
        self.tables
    }
}

impl RetentionManager {
    pub fn new(persistence: Arc<Persistence>, chain: &ChainConfig) -> Self {
        Self::with_ranges(
            persistence,
            chain.retention_time_secs(),
            chain.minimal_storage_history_blocks,
        )
    }

    pub fn with_ranges(persistence: Arc<Persistence>, time_range: u64, block_range: u64) -> Self {
        Self {
            persistence,
            time_range,
            block_range,
            state: RwLock::new(RetentionState::default()),
        }
    }

    /// Recovers the active table and thresholds from the stored rows.
    pub async fn initialize(&self) -> Result<()> {
        let tables = &self.persistence.tables().transactions;
        let oldest0 = self.persistence.oldest_transaction(&tables[0]).await?;
        let oldest1 = self.persistence.oldest_transaction(&tables[1]).await?;

        // The table whose oldest row is newer is the one still being filled.
        let (active_index, oldest) = match (oldest0, oldest1) {
            (None, None) => (0, None),
            (Some(first), Some(second)) if first.0 < second.0 => (1, Some(second)),
            (Some(first), _) => (0, Some(first)),
            (None, Some(second)) => (1, Some(second)),
        };

        let mut state = self.state.write().await;
        *state = RetentionState {
            active_index,
            end_block_time: oldest.map(|(time, _)| time + self.time_range),
            end_block_number: oldest.map(|(_, number)| number + self.block_range).unwrap_or(0),
        };
        info!(
            chain = %self.persistence.chain(),
            active = %tables[active_index],
            end_block_time = ?state.end_block_time,
            end_block_number = state.end_block_number,
            "retention initialized"
        );
        Ok(())
    }

    pub async fn state(&self) -> RetentionState {
        *self.state.read().await
    }

    pub async fn tables(&self) -> TablesGuard<'_> {
        TablesGuard {
            tables: &self.persistence.tables().transactions,
            state: self.state.read().await,
        }
    }

    pub async fn active_table(&self) -> String {
        self.tables().await.active().to_string()
    }

    /// Called after every confirmed write; returns `true` when the tables rotated.
    pub async fn update(&self, block_time: u64, block_number: u64) -> Result<bool> {
        let mut state = self.state.write().await;

        let Some(end_block_time) = state.end_block_time else {
            state.end_block_time = Some(block_time + self.time_range);
            state.end_block_number = block_number + self.block_range;
            return Ok(false);
        };

        if block_time < end_block_time && block_number < state.end_block_number {
            return Ok(false);
        }

        let next = state.active_index ^ 1;
        let table = self.persistence.tables().transactions[next].clone();
        self.persistence.recreate_transactions_table(&table).await?;

        *state = RetentionState {
            active_index: next,
            end_block_time: Some(block_time + self.time_range),
            end_block_number: block_number + self.block_range,
        };
        info!(
            chain = %self.persistence.chain(),
            table = %table,
            block_number,
            "rotated transaction tables"
        );
        Ok(true)
    }

    /// Truncates both tables and starts over from table 0.
    pub async fn reset_all(&self) -> Result<()> {
        let mut state = self.state.write().await;
        for table in &self.persistence.tables().transactions {
            self.persistence.recreate_transactions_table(table).await?;
        }
        *state = RetentionState::default();
        Ok(())
    }
}
