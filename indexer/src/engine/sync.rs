//! Historical backfill and its start point

use async_trait::async_trait;
use rpc_core::BlockKey;
use tracing::{debug, info, warn};

use crate::client::ChainAccessFacade;
use crate::config::BlockCollecting;
use crate::engine::{EngineState, IndexingEngine};
use crate::error::{IndexerError, Result};
use crate::tips::TipCandidate;

/// Timestamp lookups the start-point search needs.
#[async_trait]
pub trait ChainProbe: Send + Sync {
    async fn timestamp_at(&self, number: u64) -> Result<u64>;
    async fn bottom_height(&self) -> Result<u64>;
}

#[async_trait]
impl ChainProbe for ChainAccessFacade {
    async fn timestamp_at(&self, number: u64) -> Result<u64> {
        self.get_timestamp_at(number).await
    }

    async fn bottom_height(&self) -> Result<u64> {
        self.get_bottom_height().await
    }
}

/// Height from which the backfill starts; sync saves the block after it.
///
/// `top` is the confirmed tip. The result is the latest block older than
/// `sync_start_time`, stepped back by one when the node still has its parent.
pub async fn find_sync_start(probe: &dyn ChainProbe, top: u64, sync_start_time: u64) -> Result<u64> {
    if probe.timestamp_at(top).await? <= sync_start_time {
        debug!(top, "no blocks after the sync start time");
        return Ok(top);
    }

    let node_bottom = probe.bottom_height().await?;
    if probe.timestamp_at(node_bottom).await? >= sync_start_time {
        warn!(node_bottom, "sync start limited by node bottom block");
        return Ok(node_bottom);
    }
    if node_bottom > top {
        return Err(IndexerError::Internal(format!(
            "node bottom block {node_bottom} is above the confirmed tip {top}"
        )));
    }

    // ts(low) < sync_start_time <= ts(high)
    let (mut low, mut high) = (node_bottom, top);
    let mut probes = 2;
    while high > low + 1 {
        let mid = low + (high - low) / 2;
        probes += 1;
        if probe.timestamp_at(mid).await? < sync_start_time {
            low = mid;
        } else {
            high = mid;
        }
    }

    if low > node_bottom {
        low -= 1;
    }
    debug!(start = low, sync_start_time, probes, "sync start found");
    Ok(low)
}

impl IndexingEngine {
    /// Start height for the configured history window.
    pub async fn sync_start_block_number(&self) -> Result<u64> {
        let height = self.access.get_height().await?;
        let top = height.saturating_sub(self.settings.chain.number_of_confirmations);
        if self.settings.chain.block_collecting == BlockCollecting::LatestBlock {
            return Ok(top);
        }
        let sync_start_time = self.persistence.now().saturating_sub(self.settings.sync_window_secs);
        find_sync_start(self.access.as_ref(), top, sync_start_time).await
    }

    /// `SYNCING`: backfills from `max(stored N, sync start)` to the confirmed tip.
    pub async fn sync(&mut self, stored_n: u64) -> Result<()> {
        if !self.settings.sync_enabled {
            return Ok(());
        }

        let start = self.sync_start_block_number().await?;
        if stored_n > 0 && stored_n < start {
            return self
                .reset_database_and_stop(format!(
                    "stored N={stored_n} is below the sync start {start}, the history cannot be continued"
                ))
                .await;
        }
        self.set_indexed_height(stored_n.max(start));
        self.state = EngineState::Syncing;
        info!(
            chain = %self.settings.chain.name,
            n = self.indexed_height(),
            window_secs = self.settings.sync_window_secs,
            "sync started"
        );

        match self.settings.chain.block_collecting {
            BlockCollecting::Raw | BlockCollecting::RawUnforkable => self.run_sync_raw().await,
            BlockCollecting::Tips => self.run_sync_tips().await,
            BlockCollecting::LatestBlock => {
                let height = self.access.get_height().await?;
                self.set_indexed_height(height);
                self.run_sync_raw().await
            }
        }
    }

    async fn run_sync_raw(&mut self) -> Result<()> {
        let confirmations = self.settings.chain.number_of_confirmations;
        self.tip_height = self.access.get_height().await?;
        self.syncing = true;

        let mut stats_n = self.indexed_height();
        let mut stats_time = tokio::time::Instant::now();
        let mut blocks_per_sec = 0.0;

        loop {
            let n = self.indexed_height();
            if stats_time.elapsed() > self.settings.sync_update_interval {
                blocks_per_sec = (n - stats_n) as f64 / stats_time.elapsed().as_secs_f64();
                stats_n = n;
                stats_time = tokio::time::Instant::now();
                self.tip_height = self.access.get_height().await?;
            }

            let confirmed_tip = self.tip_height.saturating_sub(confirmations);
            let eta = if blocks_per_sec > 0.0 {
                (self.tip_height.saturating_sub(n) as f64 / blocks_per_sec) as i64
            } else {
                -1
            };
            self.persistence
                .write_status("sync", eta, &format!("{blocks_per_sec:.2} bps"))
                .await?;
            debug!(
                n,
                t = self.tip_height,
                left = confirmed_tip.saturating_sub(n),
                eta,
                rps = self.caching.stats().requests_per_sec,
                "sync"
            );

            if n >= confirmed_tip {
                self.syncing = false;
                self.scheduler.on_sync_completed();
                info!(chain = %self.settings.chain.name, n, "sync completed");
                return Ok(());
            }

            let last = confirmed_tip.min(n + self.settings.chain.sync_read_ahead.max(1));
            self.scheduler.process_sync_block_numbers(n + 1..=last).await?;

            let next = self.caching.get_block(BlockKey::Number(n + 1)).await?;
            self.next_block_hash = next.hash.to_lowercase();

            while !self.try_save_next_block().await? {
                tokio::time::sleep(self.settings.save_poll).await;
                debug!(n, t = self.tip_height, "sync waiting for N+1");
            }
        }
    }

    /// Raw sync, then headers of every alternative tip above the start height.
    async fn run_sync_tips(&mut self) -> Result<()> {
        let start_n = self.indexed_height();
        self.run_sync_raw().await?;

        self.persistence.write_status("waiting", 0, "collecting tips").await?;
        let depth = self.tip_height.saturating_sub(start_n);
        let tips = self.access.get_top_tips(depth).await?;
        info!(count = tips.len(), depth, "collected top blocks");
        self.tracker
            .save_headers_on_new_tips(tips.into_iter().map(TipCandidate::Tip).collect())
            .await?;
        Ok(())
    }
}
