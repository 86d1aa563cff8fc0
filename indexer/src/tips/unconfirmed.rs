//! Confirmation counting for block rows above the indexed height

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use crate::database::Persistence;
use crate::error::Result;
use crate::models::BlockRecord;

/// Working set of unconfirmed block rows for one header save.
///
/// Every newly observed block adds one confirmation to each ancestor it
/// can reach through `previous_block_hash`.
pub struct UnconfirmedBlockManager {
    persistence: Arc<Persistence>,
    indexed_height: u64,
    blocks: HashMap<String, BlockRecord>,
    changed: HashSet<String>,
}

impl UnconfirmedBlockManager {
    pub fn new(persistence: Arc<Persistence>, indexed_height: u64) -> Self {
        Self {
            persistence,
            indexed_height,
            blocks: HashMap::new(),
            changed: HashSet::new(),
        }
    }

    /// Loads the stored rows above the indexed height.
    pub async fn initialize(&mut self) -> Result<()> {
        let rows = self.persistence.load_blocks_above(self.indexed_height).await?;
        self.blocks = rows
            .into_iter()
            .map(|row| (row.block_hash.clone(), row))
            .collect();
        self.changed.clear();
        Ok(())
    }

    /// Adds `block` unless its hash is already known.
    pub fn add_new_block(&mut self, block: BlockRecord) {
        if self.blocks.contains_key(&block.block_hash) {
            return;
        }

        let mut number = block.block_number;
        let mut parent = block.previous_block_hash.clone();
        self.changed.insert(block.block_hash.clone());
        self.blocks.insert(block.block_hash.clone(), block);

        while let Some(entry) = self.blocks.get_mut(&parent) {
            // Parents must lie strictly below their children.
            if entry.block_number >= number {
                break;
            }
            entry.number_of_confirmations += 1;
            self.changed.insert(parent.clone());
            number = entry.block_number;
            parent = entry.previous_block_hash.clone();
        }
    }

    /// Rows touched since [`initialize`](Self::initialize), lowest number first.
    pub fn get_changed_blocks(&self) -> Vec<BlockRecord> {
        let mut blocks: Vec<BlockRecord> = self
            .changed
            .iter()
            .filter_map(|hash| self.blocks.get(hash).cloned())
            .collect();
        blocks.sort_by_key(|block| block.block_number);
        blocks
    }

    /// Rows held in memory, loaded and added.
    pub fn tracked(&self) -> usize {
        self.blocks.len()
    }

    pub fn get(&self, hash: &str) -> Option<&BlockRecord> {
        self.blocks.get(hash)
    }
}
