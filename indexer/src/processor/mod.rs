//! Content fetch scheduling for candidate blocks
//!
//! During catch-up every requested block gets its own job and they all run
//! at once, throttled only by the caching client. In steady state only the
//! job for the block needed next is left running; the rest are paused.

pub mod augment;
pub mod job;
pub mod strategy;

use std::collections::HashSet;
use std::sync::Arc;

use futures_util::future::try_join_all;
use tokio::sync::mpsc;
use tracing::debug;

use rpc_core::{Block, BlockKey};

use crate::error::Result;

pub use augment::CompressionStats;
pub use job::{BlockValidation, FetchJob, JobContext, JobEvent, JobState, PreparedBlock};
pub use strategy::{strategy_for, BlockStrategy};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    /// A completed job already holds this exact block.
    AlreadyCompleted,
    Resumed,
    Started,
}

pub struct ContentFetchScheduler {
    ctx: Arc<JobContext>,
    jobs: Vec<FetchJob>,
    numbers_in_processing: HashSet<u64>,
    events: mpsc::UnboundedSender<JobEvent>,
}

impl ContentFetchScheduler {
    /// Returns the scheduler and the channel on which jobs report.
    pub fn new(ctx: Arc<JobContext>) -> (Self, mpsc::UnboundedReceiver<JobEvent>) {
        let (events, receiver) = mpsc::unbounded_channel();
        let scheduler = Self {
            ctx,
            jobs: Vec::new(),
            numbers_in_processing: HashSet::new(),
            events,
        };
        (scheduler, receiver)
    }

    pub fn context(&self) -> &Arc<JobContext> {
        &self.ctx
    }

    /// Catch-up entry point by height; each height is requested once.
    pub async fn process_sync_block_number(&mut self, number: u64) -> Result<()> {
        if !self.numbers_in_processing.insert(number) {
            return Ok(());
        }
        let block = self.ctx.caching.get_block(BlockKey::Number(number)).await?;
        self.process_sync(block);
        Ok(())
    }

    /// Starts a job for `block` unless one exists already.
    pub fn process_sync(&mut self, block: Arc<Block>) {
        if self.find(&block.hash).is_some() {
            return;
        }
        self.start(block);
    }

    /// Steady-state entry point: makes `block` the only running job.
    pub fn process(&mut self, block: Arc<Block>) -> ProcessOutcome {
        if let Some(job) = self.find(&block.hash) {
            if job.state() == JobState::Completed {
                return ProcessOutcome::AlreadyCompleted;
            }
        }

        for job in self.jobs.iter().filter(|job| !job.hash().eq_ignore_ascii_case(&block.hash)) {
            job.pause();
        }

        match self.find(&block.hash) {
            Some(job) => {
                job.resume();
                ProcessOutcome::Resumed
            }
            None => {
                self.start(block);
                ProcessOutcome::Started
            }
        }
    }

    /// Drops every job for blocks at or below `number`.
    pub fn clear_processors_up_to_block_number(&mut self, number: u64) {
        let before = self.jobs.len();
        self.jobs.retain(|job| job.number() > number);
        self.numbers_in_processing.retain(|n| *n > number);
        if before != self.jobs.len() {
            debug!(number, removed = before - self.jobs.len(), "cleared fetch jobs");
        }
    }

    /// Catch-up entry point for a window of heights, fetched concurrently.
    pub async fn process_sync_block_numbers(&mut self, numbers: impl IntoIterator<Item = u64>) -> Result<()> {
        let fresh: Vec<u64> = numbers
            .into_iter()
            .filter(|number| self.numbers_in_processing.insert(*number))
            .collect();
        let caching = &self.ctx.caching;
        let blocks = try_join_all(fresh.iter().map(|number| caching.get_block(BlockKey::Number(*number)))).await?;
        for block in blocks {
            self.process_sync(block);
        }
        Ok(())
    }

    /// Lets only the job for `hash` run; false when there is no such job.
    pub fn prioritize(&self, number: u64, hash: &str) -> bool {
        if !self.has_job(number, hash) {
            return false;
        }
        for job in &self.jobs {
            if job.hash().eq_ignore_ascii_case(hash) {
                job.resume();
            } else {
                job.pause();
            }
        }
        true
    }

    /// Resumes the job for `hash` without touching the others; false when there is no such job.
    pub fn resume(&self, number: u64, hash: &str) -> bool {
        match self
            .jobs
            .iter()
            .find(|job| job.number() == number && job.hash().eq_ignore_ascii_case(hash))
        {
            Some(job) => {
                job.resume();
                true
            }
            None => false,
        }
    }

    pub fn on_sync_completed(&mut self) {
        self.numbers_in_processing.clear();
    }

    pub fn has_job(&self, number: u64, hash: &str) -> bool {
        self.jobs
            .iter()
            .any(|job| job.number() == number && job.hash().eq_ignore_ascii_case(hash))
    }

    pub fn job_state(&self, hash: &str) -> Option<JobState> {
        self.find(hash).map(FetchJob::state)
    }

    pub fn active_job_count(&self) -> usize {
        self.jobs.iter().filter(|job| job.state() == JobState::Active).count()
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }

    fn find(&self, hash: &str) -> Option<&FetchJob> {
        self.jobs.iter().find(|job| job.hash().eq_ignore_ascii_case(hash))
    }

    fn start(&mut self, block: Arc<Block>) {
        self.jobs.push(FetchJob::start(self.ctx.clone(), block, self.events.clone()));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::CachingClient;
    use crate::config::CacheSettings;
    use crate::error::IndexerError;
    use crate::models::EMPTY_BLOCK_INDICATOR;
    use crate::retry::RetryPolicy;
    use rpc_core::{ChainClient, ChainType, MockChainClient, Transaction, TxInput, TxOutput};
    use std::time::Duration;

    fn context(mock: Arc<MockChainClient>, validation: BlockValidation) -> Arc<JobContext> {
        let chain = mock.chain_type();
        let caching = Arc::new(CachingClient::new(
            mock,
            CacheSettings {
                transaction_cache_size: 1_000,
                block_cache_size: 1_000,
                cleanup_chunk_size: 10,
                active_limit: 0,
                limiter_poll_ms: 5,
            },
            RetryPolicy {
                timeout: Duration::from_secs(1),
                retries: 1,
                backoff: Duration::from_millis(1),
            },
        ));
        Arc::new(JobContext {
            chain,
            caching,
            strategy: strategy_for(chain),
            validation,
            compression: CompressionStats::default(),
            limiter_poll: Duration::from_millis(5),
        })
    }

    fn no_validation() -> BlockValidation {
        BlockValidation {
            enabled: false,
            wait: Duration::from_millis(1),
            max_retry: 1,
        }
    }

    async fn next_completed(events: &mut mpsc::UnboundedReceiver<JobEvent>) -> PreparedBlock {
        match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
            Ok(Some(JobEvent::Completed(prepared))) => prepared,
            other => panic!("unexpected job event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_steady_state_hand_off() {
        let mock = Arc::new(MockChainClient::with_chain(ChainType::Xrp, 102, 1_000, 4));
        let (mut scheduler, mut events) = ContentFetchScheduler::new(context(mock.clone(), no_validation()));

        let block100 = Arc::new(mock.canonical_block(100).unwrap());
        assert_eq!(scheduler.process(block100.clone()), ProcessOutcome::Started);
        let prepared = next_completed(&mut events).await;
        assert_eq!(prepared.block.block_number, 100);
        assert_eq!(scheduler.job_state(&block100.hash), Some(JobState::Completed));

        let block101 = Arc::new(mock.reorg(101, 2));
        assert_eq!(scheduler.process(block101.clone()), ProcessOutcome::Started);

        assert_eq!(scheduler.job_state(&block100.hash), Some(JobState::Completed));
        assert_eq!(scheduler.job_state(&block101.hash), Some(JobState::Active));
        assert_eq!(scheduler.active_job_count(), 1);
        assert_eq!(scheduler.job_count(), 2);

        // Same block again is answered from the completed job.
        assert_eq!(scheduler.process(block100), ProcessOutcome::AlreadyCompleted);
    }

    #[tokio::test]
    async fn test_process_pauses_competing_fork() {
        let mock = Arc::new(
            MockChainClient::with_chain(ChainType::Doge, 11, 1_000, 60).with_latency(Duration::from_millis(20)),
        );
        let first = Arc::new(mock.canonical_block(10).unwrap());
        let txid = "aa".repeat(32);
        mock.add_transaction(Transaction {
            txid: txid.clone(),
            tx_type: "payment".to_string(),
            payment_reference: None,
            is_native_payment: true,
            inputs: vec![],
            outputs: vec![],
            data: serde_json::Value::Null,
        });
        let fork = Arc::new(Block {
            transaction_ids: vec![txid],
            ..mock.reorg(10, 1)
        });

        let (mut scheduler, _events) = ContentFetchScheduler::new(context(mock.clone(), no_validation()));
        scheduler.process(fork.clone());
        assert_eq!(scheduler.process(first.clone()), ProcessOutcome::Started);
        assert_eq!(scheduler.job_state(&fork.hash), Some(JobState::Paused));

        assert_eq!(scheduler.process(fork.clone()), ProcessOutcome::Resumed);
        assert_eq!(scheduler.job_state(&first.hash).map(|s| s == JobState::Active), Some(false));
        assert_eq!(scheduler.active_job_count(), 1);

        scheduler.clear_processors_up_to_block_number(10);
        assert_eq!(scheduler.job_count(), 0);
    }

    #[tokio::test]
    async fn test_sync_jobs_run_concurrently_and_dedupe() {
        let mock = Arc::new(MockChainClient::with_chain(ChainType::Algo, 20, 1_000, 4));
        let (mut scheduler, mut events) = ContentFetchScheduler::new(context(mock.clone(), no_validation()));

        for number in 5..10 {
            scheduler.process_sync_block_number(number).await.unwrap();
        }
        scheduler.process_sync_block_number(5).await.unwrap();
        assert_eq!(scheduler.job_count(), 5);
        assert_eq!(mock.calls("getBlock"), 5);

        let mut numbers = Vec::new();
        for _ in 0..5 {
            numbers.push(next_completed(&mut events).await.block.block_number);
        }
        numbers.sort();
        assert_eq!(numbers, vec![5, 6, 7, 8, 9]);
    }

    #[tokio::test]
    async fn test_resume_leaves_other_sync_jobs_running() {
        let mock = Arc::new(
            MockChainClient::with_chain(ChainType::Doge, 1, 1_000, 60).with_latency(Duration::from_millis(300)),
        );
        for number in 1..=6u64 {
            let tx = Transaction {
                txid: format!("{number:02x}").repeat(32),
                tx_type: "payment".to_string(),
                payment_reference: None,
                is_native_payment: true,
                inputs: vec![],
                outputs: vec![],
                data: serde_json::Value::Null,
            };
            mock.push_block(number, 1_000 + number * 60, vec![tx]);
        }
        let (mut scheduler, _events) = ContentFetchScheduler::new(context(mock.clone(), no_validation()));
        scheduler.process_sync_block_numbers(1..=6).await.unwrap();
        assert_eq!(scheduler.active_job_count(), 6);

        let first = MockChainClient::block_hash(1, 0);
        assert!(scheduler.resume(1, &first.to_uppercase()));
        assert_eq!(scheduler.active_job_count(), 6);
        assert!(!scheduler.resume(7, &MockChainClient::block_hash(7, 0)));

        assert!(scheduler.prioritize(1, &first));
        assert_eq!(scheduler.active_job_count(), 1);
        assert_eq!(scheduler.job_state(&first), Some(JobState::Active));
    }

    #[tokio::test]
    async fn test_utxo_reference_resolves_inputs() {
        let mock = Arc::new(MockChainClient::with_chain(ChainType::Btc, 3, 1_000, 600));
        let funding = "11".repeat(32);
        mock.add_transaction(Transaction {
            txid: funding.clone(),
            tx_type: "payment".to_string(),
            payment_reference: None,
            is_native_payment: true,
            inputs: vec![],
            outputs: vec![TxOutput {
                value: 5_000,
                address: Some("bc1qfunding".to_string()),
            }],
            data: serde_json::Value::Null,
        });
        let payment = Transaction {
            txid: "22".repeat(32),
            tx_type: "payment".to_string(),
            payment_reference: Some("33".repeat(32)),
            is_native_payment: true,
            inputs: vec![TxInput {
                txid: Some(funding.clone()),
                vout: Some(0),
            }],
            outputs: vec![],
            data: serde_json::json!({"hex": "00"}),
        };
        let plain = Transaction {
            txid: "44".repeat(32),
            payment_reference: None,
            ..payment.clone()
        };
        let block = Arc::new(mock.push_block(3, 2_800, vec![payment, plain]));

        let (mut scheduler, mut events) = ContentFetchScheduler::new(context(mock.clone(), no_validation()));
        scheduler.process(block);
        let prepared = next_completed(&mut events).await;

        assert_eq!(prepared.transactions.len(), 2);
        assert_eq!(prepared.block.transactions, 2);
        assert_eq!(mock.calls("getTransaction"), 1);
        let response = augment::decode_response(&prepared.transactions[0].response).unwrap();
        assert_eq!(response["additionalData"]["vinOutputs"][0]["value"], 5_000);
        assert!(prepared
            .transactions
            .iter()
            .all(|tx| tx.transaction_type != EMPTY_BLOCK_INDICATOR));
    }

    #[tokio::test]
    async fn test_invalid_block_exhausts_validation() {
        let mock = Arc::new(MockChainClient::with_chain(ChainType::Xrp, 5, 1_000, 4));
        mock.set_block_valid(4, false);
        let validation = BlockValidation {
            enabled: true,
            wait: Duration::from_millis(1),
            max_retry: 2,
        };
        let (mut scheduler, mut events) = ContentFetchScheduler::new(context(mock.clone(), validation));

        scheduler.process(Arc::new(mock.canonical_block(4).unwrap()));
        match tokio::time::timeout(Duration::from_secs(5), events.recv()).await {
            Ok(Some(JobEvent::Failed { number, error })) => {
                assert_eq!(number, 4);
                assert!(matches!(error, IndexerError::RetryExhausted { .. }));
            }
            other => panic!("unexpected job event: {other:?}"),
        }
        assert_eq!(mock.calls("getBlock"), 2);
    }
}
