//! Steady-state advancement one confirmed block at a time

use rpc_core::{Block, BlockKey};
use tracing::{debug, info};

use crate::engine::status::realtime_status;
use crate::engine::IndexingEngine;
use crate::error::Result;
use crate::processor::ProcessOutcome;

/// What one realtime iteration did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Nothing changed at `N + 1`; the caller should wait before polling again.
    Idle,
    /// `N + 1` was (re)scheduled without a save.
    Scheduled,
    /// `N + 1` was saved.
    Saved,
}

impl IndexingEngine {
    pub(super) async fn run_realtime(&mut self) -> Result<()> {
        loop {
            if self.realtime_step().await? == StepOutcome::Idle {
                tokio::time::sleep(self.settings.block_collect_interval).await;
            }
        }
    }

    /// One iteration of the realtime loop.
    pub async fn realtime_step(&mut self) -> Result<StepOutcome> {
        self.tip_height = self.access.get_height().await?;
        self.drain_events().await?;

        let n = self.indexed_height();
        if n + 1 > self.tip_height {
            return Ok(StepOutcome::Idle);
        }
        let next = self.caching.get_block(BlockKey::Number(n + 1)).await?;

        let confirmed = n + self.settings.chain.number_of_confirmations <= self.tip_height;
        let hash_changed = !self.next_block_hash.eq_ignore_ascii_case(&next.hash);

        self.update_status(&next).await?;

        if !confirmed && !hash_changed {
            debug!(number = n + 1, "next block unconfirmed and unchanged");
            return Ok(StepOutcome::Idle);
        }

        info!(t = self.tip_height, n, hash_changed, "new block");
        self.next_block_hash = next.hash.to_lowercase();

        let mut candidate = next;
        let mut saved = false;
        if confirmed {
            saved = self.try_save_next_block().await?;

            // Saved or not, N + 1 is refreshed before scheduling.
            let n = self.indexed_height();
            if n + 1 > self.tip_height {
                return Ok(if saved { StepOutcome::Saved } else { StepOutcome::Scheduled });
            }
            candidate = self.caching.get_block(BlockKey::Number(n + 1)).await?;
            self.next_block_hash = candidate.hash.to_lowercase();
        }

        let number = candidate.number;
        let hash = candidate.hash.clone();
        if self.scheduler.process(candidate) == ProcessOutcome::AlreadyCompleted {
            info!(number, "already completed");
            if self.is_next_block(number, &hash) {
                self.read_ahead().await?;
            }
        }

        Ok(if saved { StepOutcome::Saved } else { StepOutcome::Scheduled })
    }

    /// Starts on `N + 2` as soon as `N + 1` is ready, if the node has it.
    pub(super) async fn read_ahead(&mut self) -> Result<()> {
        let number = self.indexed_height() + 2;
        if number > self.tip_height {
            return Ok(());
        }
        let block = self.caching.get_block(BlockKey::Number(number)).await?;
        debug!(number, "read ahead");
        self.scheduler.process(block);
        Ok(())
    }

    async fn update_status(&mut self, next: &Block) -> Result<()> {
        let status = realtime_status(
            self.indexed_height(),
            self.tip_height,
            self.settings.chain.number_of_confirmations,
            next.timestamp,
            self.persistence.bottom_block_time(),
            self.settings.sync_window_secs,
        );
        self.persistence
            .write_status(status.name(), self.processed_blocks as i64, &status.comment())
            .await?;
        self.processed_blocks += 1;
        Ok(())
    }
}
