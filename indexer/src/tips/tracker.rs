//! Tip discovery and provisional header storage

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::try_join_all;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info};

use rpc_core::{BlockHeader, BlockTip, TipStatus};

use crate::client::ChainAccessFacade;
use crate::config::BlockCollecting;
use crate::database::Persistence;
use crate::error::{IndexerError, Result};
use crate::models::BlockRecord;
use crate::tips::unconfirmed::UnconfirmedBlockManager;

#[derive(Debug, Clone, Copy)]
pub struct TipTrackerSettings {
    pub collecting: BlockCollecting,
    pub confirmations: u64,
    pub collect_interval: Duration,
    pub prune_yield_every: usize,
}

/// A block seen near the tip, either with its full header or as a bare tip.
#[derive(Debug, Clone)]
pub enum TipCandidate {
    Header(BlockHeader),
    Tip(BlockTip),
}

impl TipCandidate {
    pub fn number(&self) -> u64 {
        match self {
            TipCandidate::Header(header) => header.number,
            TipCandidate::Tip(tip) => tip.number,
        }
    }

    pub fn hash(&self) -> &str {
        match self {
            TipCandidate::Header(header) => &header.hash,
            TipCandidate::Tip(tip) => &tip.hash,
        }
    }
}

/// Blocks whose headers were already handed to the store.
#[derive(Default)]
struct KnownHeaders {
    hashes: HashSet<String>,
    by_number: HashMap<u64, Vec<String>>,
}

impl KnownHeaders {
    fn contains(&self, number: u64, hash: &str) -> bool {
        self.hashes.contains(hash) && self.by_number.contains_key(&number)
    }

    fn insert(&mut self, number: u64, hash: &str) {
        self.hashes.insert(hash.to_string());
        self.by_number.entry(number).or_default().push(hash.to_string());
    }

    /// Forgets `number`; false once the walk reaches already-pruned heights.
    fn remove(&mut self, number: u64) -> bool {
        match self.by_number.remove(&number) {
            Some(hashes) if !hashes.is_empty() => {
                for hash in hashes {
                    self.hashes.remove(&hash);
                }
                true
            }
            _ => false,
        }
    }
}

pub struct TipTracker {
    access: Arc<ChainAccessFacade>,
    persistence: Arc<Persistence>,
    settings: TipTrackerSettings,
    /// Shared with the engine, which advances it on every save.
    indexed_height: Arc<AtomicU64>,
    tip_height: AtomicU64,
    known: Mutex<KnownHeaders>,
    /// Serializes header saves so confirmation counts are computed on a stable set.
    save_lock: tokio::sync::Mutex<()>,
}

impl TipTracker {
    pub fn new(
        access: Arc<ChainAccessFacade>,
        persistence: Arc<Persistence>,
        settings: TipTrackerSettings,
        indexed_height: Arc<AtomicU64>,
    ) -> Self {
        Self {
            access,
            persistence,
            settings,
            indexed_height,
            tip_height: AtomicU64::new(0),
            known: Mutex::new(KnownHeaders::default()),
            save_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub fn indexed_height(&self) -> u64 {
        self.indexed_height.load(Ordering::SeqCst)
    }

    /// Last tip height written to the store.
    pub fn tip_height(&self) -> u64 {
        self.tip_height.load(Ordering::SeqCst)
    }

    pub fn is_known(&self, number: u64, hash: &str) -> bool {
        self.known.lock().contains(number, hash)
    }

    pub fn known_count(&self) -> usize {
        self.known.lock().hashes.len()
    }

    /// Collection loop; only returns on error.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        info!(
            chain = %self.persistence.chain(),
            mode = ?self.settings.collecting,
            "header collection started"
        );
        loop {
            self.poll_once().await?;
            tokio::time::sleep(self.settings.collect_interval).await;
        }
    }

    /// One collection round: refresh `T` and, in tips mode, the top tips.
    pub async fn poll_once(&self) -> Result<()> {
        let height = self.access.get_height().await?;
        if self.tip_height.swap(height, Ordering::SeqCst) != height {
            self.persistence.write_tip_height(height).await?;
        }

        if self.settings.collecting == BlockCollecting::Tips {
            let tips = self.access.get_top_tips(self.settings.confirmations).await?;
            self.save_headers_on_new_tips(tips.into_iter().map(TipCandidate::Tip).collect())
                .await?;
        }
        Ok(())
    }

    /// Stores provisional rows for candidates above `N`; returns the rows written.
    ///
    /// Bare tips off the active branch may be headers-only on the node, so
    /// their timestamp and parent are left empty instead of being fetched.
    pub async fn save_headers_on_new_tips(&self, candidates: Vec<TipCandidate>) -> Result<usize> {
        let _guard = self.save_lock.lock().await;

        let mut manager = UnconfirmedBlockManager::new(self.persistence.clone(), self.indexed_height());
        manager.initialize().await?;

        let mut added = Vec::new();
        for candidate in candidates {
            // N may have advanced while the rows were loading.
            if candidate.hash().is_empty() || candidate.number() <= self.indexed_height() {
                continue;
            }
            if self.is_known(candidate.number(), candidate.hash()) {
                continue;
            }
            self.known.lock().insert(candidate.number(), candidate.hash());

            let record = match candidate {
                TipCandidate::Header(header) => BlockRecord::from_header(&header),
                TipCandidate::Tip(tip) if tip.chain_tip_status == TipStatus::Active => {
                    let header = self.access.get_block_header_by_hash(&tip.hash).await?;
                    BlockRecord {
                        timestamp: header.timestamp,
                        previous_block_hash: header.previous_block_hash,
                        ..BlockRecord::observed(tip.number, &tip.hash)
                    }
                }
                TipCandidate::Tip(tip) => BlockRecord::observed(tip.number, &tip.hash),
            };
            added.push(record.block_number);
            manager.add_new_block(record);
        }

        let indexed_height = self.indexed_height();
        let rows: Vec<BlockRecord> = manager
            .get_changed_blocks()
            .into_iter()
            .filter(|block| block.block_number > indexed_height)
            .collect();
        if rows.is_empty() {
            return Ok(0);
        }

        debug!(
            chain = %self.persistence.chain(),
            new = ?added,
            rows = rows.len(),
            tracked = manager.tracked(),
            "write block headers"
        );
        self.persistence.upsert_unconfirmed_blocks(&rows).await?;
        Ok(rows.len())
    }

    /// Saves headers for `from..=to`, which must lie above `N`.
    pub async fn read_and_save_blocks_headers(&self, from: u64, to: u64) -> Result<usize> {
        let indexed_height = self.indexed_height();
        if from <= indexed_height {
            return Err(IndexerError::Internal(format!(
                "header range starts at {from}, at or below N={indexed_height}"
            )));
        }

        let headers = try_join_all((from..=to).map(|number| self.access.get_block_header(number))).await?;
        let candidates = headers
            .into_iter()
            .filter(|header| !self.is_known(header.number, &header.hash))
            .map(TipCandidate::Header)
            .collect();
        self.save_headers_on_new_tips(candidates).await
    }

    /// Forgets cached headers below the new retained-history bound in the background.
    pub fn on_bottom_block_number(self: &Arc<Self>, bottom: u64) -> JoinHandle<usize> {
        let tracker = self.clone();
        tokio::spawn(async move { tracker.prune_below(bottom).await })
    }

    /// Walks down from `bottom - 1` until a height that is not cached; returns heights removed.
    pub async fn prune_below(&self, bottom: u64) -> usize {
        let yield_every = self.settings.prune_yield_every.max(1);
        let mut removed = 0;
        let mut number = bottom;
        while number > 0 {
            number -= 1;
            if !self.known.lock().remove(number) {
                break;
            }
            removed += 1;
            if removed % yield_every == 0 {
                tokio::task::yield_now().await;
            }
        }
        if removed > 0 {
            debug!(chain = %self.persistence.chain(), bottom, removed, "pruned header cache");
        }
        removed
    }
}
