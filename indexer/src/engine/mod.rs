//! Top-level indexing state machine
//!
//! `INIT` resolves the starting height and verifies the stored history,
//! `SYNCING` backfills confirmed blocks up to the tip and `REALTIME`
//! follows the tip one confirmed block at a time. A broken history moves
//! the engine to `HALTED`.

mod realtime;
mod status;
mod sync;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use rpc_core::ChainClient;

use crate::client::{CachingClient, ChainAccessFacade};
use crate::clock::Clock;
use crate::config::{ChainConfig, IndexerConfig};
use crate::continuity::{check_database_continuous, spawn_continuity_checks};
use crate::database::{Database, IndexedQueries, Persistence};
use crate::error::{IndexerError, Result};
use crate::processor::{
    strategy_for, BlockValidation, CompressionStats, ContentFetchScheduler, JobContext, JobEvent, PreparedBlock,
};
use crate::retention::RetentionManager;
use crate::retry::RetryPolicy;
use crate::tips::{TipTracker, TipTrackerSettings};

pub use realtime::StepOutcome;
pub use status::{realtime_status, RealtimeStatus};
pub use sync::{find_sync_start, ChainProbe};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Init,
    Syncing,
    Realtime,
    Halted,
}

/// Engine timing and mode, resolved from [`IndexerConfig`].
#[derive(Debug, Clone)]
pub struct EngineSettings {
    pub chain: ChainConfig,
    pub sync_enabled: bool,
    pub sync_window_secs: u64,
    pub block_collect_interval: Duration,
    pub sync_update_interval: Duration,
    pub continuity_interval: Duration,
    pub node_status_poll: Duration,
    pub save_poll: Duration,
    pub prune_yield_every: usize,
}

impl EngineSettings {
    pub fn from_config(config: &IndexerConfig) -> Result<Self> {
        let chain = config.chain_config()?;
        Ok(Self {
            sync_enabled: config.indexer.sync_enabled,
            sync_window_secs: config.sync_window_secs(&chain),
            block_collect_interval: Duration::from_millis(config.indexer.block_collect_time_ms),
            sync_update_interval: Duration::from_millis(config.indexer.sync_update_time_ms),
            continuity_interval: Duration::from_millis(config.indexer.continuity_check_interval_ms),
            node_status_poll: Duration::from_millis(config.indexer.node_status_poll_ms),
            save_poll: Duration::from_millis(config.indexer.save_poll_ms),
            prune_yield_every: config.indexer.prune_yield_every,
            chain,
        })
    }
}

pub struct IndexingEngine {
    settings: EngineSettings,
    retry: RetryPolicy,
    access: Arc<ChainAccessFacade>,
    caching: Arc<CachingClient>,
    persistence: Arc<Persistence>,
    retention: Arc<RetentionManager>,
    tracker: Arc<TipTracker>,
    scheduler: ContentFetchScheduler,
    events: mpsc::UnboundedReceiver<JobEvent>,
    /// `N`, shared with the tip tracker.
    indexed_height: Arc<AtomicU64>,
    /// `T` as last seen by the engine.
    tip_height: u64,
    /// Hash of the block currently expected at `N + 1`.
    next_block_hash: String,
    /// Completed jobs not yet saved, by block number.
    prepared: HashMap<u64, Vec<PreparedBlock>>,
    state: EngineState,
    syncing: bool,
    processed_blocks: u64,
}

impl IndexingEngine {
    pub fn new(
        config: &IndexerConfig,
        client: Arc<dyn ChainClient>,
        db: Database,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        let settings = EngineSettings::from_config(config)?;
        let chain = settings.chain.name;
        if client.chain_type() != chain {
            return Err(IndexerError::Config(format!(
                "client serves {} but the indexer is configured for {}",
                client.chain_type(),
                chain
            )));
        }

        let retry = RetryPolicy::from(&config.retry);
        let access = Arc::new(ChainAccessFacade::new(client.clone(), retry));
        let caching = Arc::new(CachingClient::new(client, config.cache.clone(), retry));
        let persistence = Arc::new(Persistence::new(db, chain, clock));
        let retention = Arc::new(RetentionManager::new(persistence.clone(), &settings.chain));
        let indexed_height = Arc::new(AtomicU64::new(0));

        let tracker = Arc::new(TipTracker::new(
            access.clone(),
            persistence.clone(),
            TipTrackerSettings {
                collecting: settings.chain.block_collecting,
                confirmations: settings.chain.number_of_confirmations,
                collect_interval: settings.block_collect_interval,
                prune_yield_every: settings.prune_yield_every,
            },
            indexed_height.clone(),
        ));

        let ctx = Arc::new(JobContext {
            chain,
            caching: caching.clone(),
            strategy: strategy_for(chain),
            validation: BlockValidation {
                enabled: settings.chain.validate_block_before_process,
                wait: settings.chain.validate_wait(),
                max_retry: settings.chain.validate_block_max_retry,
            },
            compression: CompressionStats::default(),
            limiter_poll: Duration::from_millis(config.cache.limiter_poll_ms),
        });
        let (scheduler, events) = ContentFetchScheduler::new(ctx);

        Ok(Self {
            settings,
            retry,
            access,
            caching,
            persistence,
            retention,
            tracker,
            scheduler,
            events,
            indexed_height,
            tip_height: 0,
            next_block_hash: String::new(),
            prepared: HashMap::new(),
            state: EngineState::Init,
            syncing: false,
            processed_blocks: 0,
        })
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn indexed_height(&self) -> u64 {
        self.indexed_height.load(Ordering::SeqCst)
    }

    pub fn tip_height(&self) -> u64 {
        self.tip_height
    }

    pub fn processed_blocks(&self) -> u64 {
        self.processed_blocks
    }

    pub fn persistence(&self) -> &Arc<Persistence> {
        &self.persistence
    }

    pub fn retention(&self) -> &Arc<RetentionManager> {
        &self.retention
    }

    pub fn tracker(&self) -> &Arc<TipTracker> {
        &self.tracker
    }

    pub fn scheduler(&self) -> &ContentFetchScheduler {
        &self.scheduler
    }

    pub fn caching(&self) -> &Arc<CachingClient> {
        &self.caching
    }

    /// Read-only view for downstream verifiers.
    pub fn queries(&self) -> IndexedQueries {
        IndexedQueries::new(self.persistence.clone(), self.retention.clone())
    }

    fn set_indexed_height(&self, n: u64) {
        self.indexed_height.store(n, Ordering::SeqCst);
    }

    /// Runs until a fatal error; a broken history leaves the engine `HALTED`.
    pub async fn run(&mut self) -> Result<()> {
        let result = self.run_phases().await;
        if let Err(err) = &result {
            if matches!(err, IndexerError::Discontinuity { .. } | IndexerError::Halted(_)) {
                self.state = EngineState::Halted;
                error!(chain = %self.settings.chain.name, error = %err, "indexer halted, manual restart required");
            }
        }
        result
    }

    async fn run_phases(&mut self) -> Result<()> {
        let stored_n = self.initialize().await?;
        self.sync(stored_n).await?;

        let tracker = tokio::spawn(self.tracker.clone().run());
        let continuity = spawn_continuity_checks(
            self.persistence.clone(),
            self.retention.clone(),
            self.settings.continuity_interval,
        );
        let background = [tracker.abort_handle(), continuity.abort_handle()];

        self.state = EngineState::Realtime;
        info!(chain = %self.settings.chain.name, n = self.indexed_height(), "realtime indexing started");

        let result = tokio::select! {
            result = self.run_realtime() => result,
            result = join_task("header collection", tracker) => result,
            result = join_task("continuity check", continuity) => result,
        };
        for handle in background {
            handle.abort();
        }
        result
    }

    /// `INIT`: schema, node readiness, stored `N`, retention and a continuity check.
    ///
    /// Returns the `N` stored in the database, 0 on a fresh store.
    pub async fn initialize(&mut self) -> Result<u64> {
        self.state = EngineState::Init;
        let chain = self.settings.chain.name;
        self.persistence.database().migrate(chain).await?;

        self.wait_for_node_synced().await?;

        if let Some(bottom) = self.persistence.save_bottom_state().await? {
            self.tracker.on_bottom_block_number(bottom);
        }

        let height = self.access.get_height().await?;
        self.tip_height = height;
        let start = height.saturating_sub(self.settings.chain.number_of_confirmations);
        warn!(%chain, t = start, "confirmed tip");
        self.set_indexed_height(start);

        let stored_n = self.persistence.get_indexed_height().await?;
        if stored_n > 0 {
            self.set_indexed_height(stored_n);
        }

        self.retention.initialize().await?;
        check_database_continuous(&self.persistence, &self.retention).await?;
        Ok(stored_n)
    }

    /// Polls node status until the node reports itself synced; true if it had to wait.
    pub async fn wait_for_node_synced(&self) -> Result<bool> {
        let mut waiting = false;
        loop {
            let status = self.access.get_node_status().await?;
            if status.is_synced {
                if waiting {
                    info!(chain = %self.settings.chain.name, "node is now synced");
                }
                return Ok(waiting);
            }
            if !waiting {
                self.persistence
                    .write_status("waiting", 0, "waiting for node to be synced")
                    .await?;
            }
            waiting = true;
            info!(chain = %self.settings.chain.name, version = %status.version, "waiting for node to be synced");
            tokio::time::sleep(self.settings.node_status_poll).await;
        }
    }

    /// Clears all indexed data of the chain and stops with [`IndexerError::Halted`].
    async fn reset_database_and_stop(&mut self, reason: String) -> Result<()> {
        error!(chain = %self.settings.chain.name, reason = %reason, "resetting chain data");
        self.retention.reset_all().await?;
        self.persistence.drop_all_state_info().await?;
        self.state = EngineState::Halted;
        Err(IndexerError::Halted(reason))
    }

    /// Routes a job report; completed blocks wait in `prepared` until saved.
    async fn handle_event(&mut self, event: JobEvent) -> Result<()> {
        match event {
            JobEvent::Completed(prepared) => {
                let number = prepared.block.block_number;
                let n = self.indexed_height();
                if number <= n {
                    return Ok(());
                }
                info!(
                    number,
                    ahead = number - n,
                    transactions = prepared.transactions.len(),
                    "block completed"
                );
                let is_next = self.is_next_block(number, &prepared.block.block_hash);
                self.prepared.entry(number).or_default().push(prepared);
                if is_next && !self.syncing {
                    self.read_ahead().await?;
                }
                Ok(())
            }
            JobEvent::Failed { number, error } => {
                if !error.is_fatal() {
                    debug!(number, "fetch job dropped");
                    return Ok(());
                }
                error!(number, error = %error, "block processing failed");
                Err(error)
            }
        }
    }

    /// Handles every report already queued without waiting for more.
    async fn drain_events(&mut self) -> Result<()> {
        while let Ok(event) = self.events.try_recv() {
            self.handle_event(event).await?;
        }
        Ok(())
    }

    fn is_next_block(&self, number: u64, hash: &str) -> bool {
        number == self.indexed_height() + 1 && hash.eq_ignore_ascii_case(&self.next_block_hash)
    }

    /// Removes and returns the prepared `N + 1` matching the expected hash.
    fn take_prepared_next(&mut self) -> Option<PreparedBlock> {
        let next = self.indexed_height() + 1;
        let candidates = self.prepared.get_mut(&next)?;
        let position = candidates
            .iter()
            .position(|p| p.block.block_hash.eq_ignore_ascii_case(&self.next_block_hash))?;
        let prepared = candidates.swap_remove(position);
        // Other variants of N + 1 are orphaned.
        self.prepared.remove(&next);
        Some(prepared)
    }

    /// Saves `N + 1` if it is ready, or waits for its job if one is running.
    ///
    /// Returns false when no job holds the expected block.
    pub async fn try_save_next_block(&mut self) -> Result<bool> {
        self.drain_events().await?;
        if let Some(prepared) = self.take_prepared_next() {
            self.block_save(prepared).await?;
            return Ok(true);
        }

        let next = self.indexed_height() + 1;
        // Catch-up jobs keep running side by side; only steady state narrows to N + 1.
        let scheduled = if self.syncing {
            self.scheduler.resume(next, &self.next_block_hash)
        } else {
            self.scheduler.prioritize(next, &self.next_block_hash)
        };
        if !scheduled {
            warn!(number = next, hash = %self.next_block_hash, "N+1 block not in processing");
            return Ok(false);
        }

        let mut waited = Duration::ZERO;
        loop {
            match tokio::time::timeout(self.settings.save_poll, self.events.recv()).await {
                Ok(Some(event)) => {
                    self.handle_event(event).await?;
                    if let Some(prepared) = self.take_prepared_next() {
                        self.block_save(prepared).await?;
                        return Ok(true);
                    }
                }
                Ok(None) => return Err(IndexerError::Internal("fetch job channel closed".to_string())),
                Err(_) => {
                    waited += self.settings.save_poll;
                    if waited >= Duration::from_secs(5) {
                        warn!(number = next, "still waiting for block N+1");
                        waited = Duration::ZERO;
                    }
                }
            }
        }
    }

    /// Persists `N + 1` and advances `N`.
    pub async fn block_save(&mut self, prepared: PreparedBlock) -> Result<()> {
        let expected = self.indexed_height() + 1;
        let PreparedBlock { block, transactions } = prepared;
        if block.block_number != expected {
            return Err(IndexerError::UnexpectedBlockNumber {
                expected,
                got: block.block_number,
            });
        }

        let started = tokio::time::Instant::now();
        {
            let tables = self.retention.tables().await;
            let table = tables.active();
            let persistence = &self.persistence;
            let (block, transactions, tip) = (&block, &transactions, self.tip_height);
            self.retry
                .run(&format!("blockSave N={expected}"), || {
                    persistence.save_confirmed_block(table, block, transactions, tip)
                })
                .await?;
        }

        self.set_indexed_height(expected);
        self.prepared.retain(|number, _| *number > expected);

        if self.persistence.bottom_block_time().is_none() {
            self.refresh_bottom_state().await?;
        }

        self.scheduler.clear_processors_up_to_block_number(expected);

        let compression = &self.scheduler.context().compression;
        let (uncompressed, compressed) = compression.totals();
        info!(
            n = expected,
            transactions = transactions.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "save completed"
        );
        debug!(uncompressed, compressed, ratio = compression.ratio(), "response compression");

        if self.retention.update(block.timestamp, block.block_number).await? {
            self.refresh_bottom_state().await?;
            check_database_continuous(&self.persistence, &self.retention).await?;
        }
        Ok(())
    }

    async fn refresh_bottom_state(&self) -> Result<()> {
        if let Some(bottom) = self.persistence.save_bottom_state().await? {
            self.tracker.on_bottom_block_number(bottom);
        }
        Ok(())
    }
}

async fn join_task(name: &str, handle: JoinHandle<Result<()>>) -> Result<()> {
    match handle.await {
        Ok(result) => result,
        Err(err) => Err(IndexerError::Internal(format!("{name} task failed: {err}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::RetrySettings;
    use crate::processor::JobState;
    use rpc_core::{ChainType, MockChainClient, Transaction};
    use tempfile::TempDir;

    async fn started_engine(mock: MockChainClient, chain: &str) -> (TempDir, IndexingEngine) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(&dir.path().join("indexer.db")).await.unwrap();
        let mut config = IndexerConfig::default();
        config.chain = chain.to_string();
        config.indexer.save_poll_ms = 10;
        config.cache.active_limit = 0;
        config.retry = RetrySettings {
            timeout_ms: 5_000,
            retries: 1,
            backoff_ms: 1,
        };
        let mut engine =
            IndexingEngine::new(&config, Arc::new(mock), db, Arc::new(ManualClock::new(10_000))).unwrap();
        engine.initialize().await.unwrap();
        (dir, engine)
    }

    fn transfer(number: u64) -> Transaction {
        Transaction {
            txid: format!("{number:02x}").repeat(32),
            tx_type: "payment".to_string(),
            payment_reference: None,
            is_native_payment: true,
            inputs: vec![],
            outputs: vec![],
            data: serde_json::Value::Null,
        }
    }

    #[tokio::test]
    async fn test_sync_save_keeps_catch_up_jobs_running() {
        let mock = MockChainClient::with_chain(ChainType::Doge, 12, 1_000, 60)
            .with_latency(Duration::from_millis(400));
        for number in 12..=14 {
            mock.push_block(number, 1_000 + number * 60, vec![transfer(number)]);
        }
        let (_dir, mut engine) = started_engine(mock, "DOGE").await;
        engine.set_indexed_height(10);
        engine.tip_height = 14;
        engine.syncing = true;
        engine.next_block_hash = MockChainClient::block_hash(11, 0);

        engine.scheduler.process_sync_block_numbers(11..=14).await.unwrap();
        assert!(engine.try_save_next_block().await.unwrap());

        assert_eq!(engine.indexed_height(), 11);
        // Block 11 is empty; the others are still fetching their transactions.
        for number in 12..=14 {
            let hash = MockChainClient::block_hash(number, 0);
            assert_eq!(engine.scheduler.job_state(&hash), Some(JobState::Active), "block {number}");
        }
    }

    #[tokio::test]
    async fn test_realtime_completion_reads_ahead() {
        let mock = MockChainClient::with_chain(ChainType::Xrp, 21, 1_000, 4);
        let block11 = Arc::new(mock.canonical_block(11).unwrap());
        let (_dir, mut engine) = started_engine(mock, "XRP").await;
        engine.set_indexed_height(10);
        engine.tip_height = 20;
        engine.next_block_hash = block11.hash.clone();

        engine.scheduler.process(block11);
        assert!(engine.try_save_next_block().await.unwrap());

        assert_eq!(engine.indexed_height(), 11);
        assert!(engine.scheduler.has_job(12, &MockChainClient::block_hash(12, 0)));
        assert!(!engine.scheduler.has_job(13, &MockChainClient::block_hash(13, 0)));
    }

    #[tokio::test]
    async fn test_read_ahead_stops_at_tip() {
        let mock = MockChainClient::with_chain(ChainType::Xrp, 21, 1_000, 4);
        let block19 = Arc::new(mock.canonical_block(19).unwrap());
        let (_dir, mut engine) = started_engine(mock, "XRP").await;
        engine.set_indexed_height(18);
        engine.tip_height = 19;
        engine.next_block_hash = block19.hash.clone();

        engine.scheduler.process(block19);
        assert!(engine.try_save_next_block().await.unwrap());

        assert_eq!(engine.indexed_height(), 19);
        assert_eq!(engine.scheduler.job_count(), 0);
    }

    #[tokio::test]
    async fn test_cancelled_job_is_not_fatal() {
        let mock = MockChainClient::with_chain(ChainType::Xrp, 21, 1_000, 4);
        let (_dir, mut engine) = started_engine(mock, "XRP").await;

        let dropped = JobEvent::Failed {
            number: 30,
            error: IndexerError::Cancelled,
        };
        engine.handle_event(dropped).await.unwrap();

        let failed = JobEvent::Failed {
            number: 31,
            error: IndexerError::Internal("decode".to_string()),
        };
        assert!(engine.handle_event(failed).await.is_err());
    }
}
