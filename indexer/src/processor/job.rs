//! Per-block fetch jobs and their pausable request queue

use std::collections::VecDeque;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use rpc_core::{Block, BlockKey, ChainType};

use crate::client::CachingClient;
use crate::error::{IndexerError, Result};
use crate::models::{BlockRecord, TransactionRecord};
use crate::processor::augment::CompressionStats;
use crate::processor::strategy::BlockStrategy;

/// Re-poll policy for ledgers that can return blocks that are not final yet.
#[derive(Debug, Clone, Copy)]
pub struct BlockValidation {
    pub enabled: bool,
    pub wait: Duration,
    pub max_retry: usize,
}

/// Collaborators shared by every job of one chain.
pub struct JobContext {
    pub chain: ChainType,
    pub caching: Arc<CachingClient>,
    pub strategy: Arc<dyn BlockStrategy>,
    pub validation: BlockValidation,
    pub compression: CompressionStats,
    pub limiter_poll: Duration,
}

/// Block content ready to be saved.
#[derive(Debug, Clone)]
pub struct PreparedBlock {
    pub block: BlockRecord,
    pub transactions: Vec<TransactionRecord>,
}

#[derive(Debug)]
pub enum JobEvent {
    Completed(PreparedBlock),
    Failed { number: u64, error: IndexerError },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Active,
    Paused,
    Completed,
}

/// Queue of pending node requests belonging to one job.
///
/// Requests are released one at a time while the job is active and the
/// caching client has spare capacity.
pub struct Limiter {
    caching: Arc<CachingClient>,
    queue: Mutex<VecDeque<oneshot::Sender<()>>>,
    active: AtomicBool,
    completed: AtomicBool,
    wake: Notify,
    poll: Duration,
}

impl Limiter {
    pub fn new(caching: Arc<CachingClient>, poll: Duration) -> Arc<Self> {
        Arc::new(Self {
            caching,
            queue: Mutex::new(VecDeque::new()),
            active: AtomicBool::new(true),
            completed: AtomicBool::new(false),
            wake: Notify::new(),
            poll,
        })
    }

    /// Runs `request` once the queue releases it; `prepend` jumps the queue.
    pub async fn call<T, F>(&self, prepend: bool, request: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let (release, released) = oneshot::channel();
        {
            let mut queue = self.queue.lock();
            if prepend {
                queue.push_front(release);
            } else {
                queue.push_back(release);
            }
        }
        self.wake.notify_one();
        released.await.map_err(|_| IndexerError::Cancelled)?;
        request.await
    }

    pub fn pause(&self) {
        self.active.store(false, Ordering::SeqCst);
    }

    pub fn resume(&self) {
        if !self.completed.load(Ordering::SeqCst) {
            self.active.store(true, Ordering::SeqCst);
            self.wake.notify_one();
        }
    }

    pub fn stop(&self) {
        self.completed.store(true, Ordering::SeqCst);
        self.active.store(false, Ordering::SeqCst);
        self.wake.notify_one();
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    async fn drive(self: Arc<Self>) {
        loop {
            if self.completed.load(Ordering::SeqCst) {
                return;
            }
            if self.is_active() && self.caching.can_accept() {
                let next = self.queue.lock().pop_front();
                if let Some(release) = next {
                    // A dropped receiver belongs to an abandoned request.
                    let _ = release.send(());
                    tokio::task::yield_now().await;
                    continue;
                }
            }
            tokio::select! {
                _ = self.wake.notified() => {}
                _ = tokio::time::sleep(self.poll) => {}
            }
        }
    }
}

/// Fetch job for one candidate block; aborted when dropped.
pub struct FetchJob {
    number: u64,
    hash: String,
    limiter: Arc<Limiter>,
    completed: Arc<AtomicBool>,
    worker: JoinHandle<()>,
    driver: JoinHandle<()>,
}

impl FetchJob {
    pub fn start(ctx: Arc<JobContext>, block: Arc<Block>, events: mpsc::UnboundedSender<JobEvent>) -> Self {
        let limiter = Limiter::new(ctx.caching.clone(), ctx.limiter_poll);
        let completed = Arc::new(AtomicBool::new(false));
        let number = block.number;
        let hash = block.hash.clone();

        let driver = tokio::spawn(limiter.clone().drive());
        let worker = {
            let limiter = limiter.clone();
            let completed = completed.clone();
            tokio::spawn(async move {
                let outcome = run_job(&ctx, &limiter, block).await;
                limiter.stop();
                match outcome {
                    Ok(prepared) => {
                        completed.store(true, Ordering::SeqCst);
                        let _ = events.send(JobEvent::Completed(prepared));
                    }
                    Err(IndexerError::Cancelled) => {}
                    Err(error) => {
                        let _ = events.send(JobEvent::Failed { number, error });
                    }
                }
            })
        };

        debug!(number, hash = %hash, "fetch job started");
        Self {
            number,
            hash,
            limiter,
            completed,
            worker,
            driver,
        }
    }

    pub fn number(&self) -> u64 {
        self.number
    }

    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn state(&self) -> JobState {
        if self.completed.load(Ordering::SeqCst) {
            JobState::Completed
        } else if self.limiter.is_active() {
            JobState::Active
        } else {
            JobState::Paused
        }
    }

    pub fn pause(&self) {
        self.limiter.pause();
    }

    pub fn resume(&self) {
        self.limiter.resume();
    }
}

impl Drop for FetchJob {
    fn drop(&mut self) {
        self.worker.abort();
        self.driver.abort();
    }
}

async fn run_job(ctx: &JobContext, limiter: &Limiter, block: Arc<Block>) -> Result<PreparedBlock> {
    let block = wait_until_block_is_valid(ctx, block).await?;
    let transactions = ctx.strategy.process(ctx, limiter, &block).await?;
    let mut record = BlockRecord::from_block(&block);
    record.transactions = transactions.len() as u64;
    Ok(PreparedBlock {
        block: record,
        transactions,
    })
}

async fn wait_until_block_is_valid(ctx: &JobContext, block: Arc<Block>) -> Result<Arc<Block>> {
    if !ctx.validation.enabled {
        return Ok(block);
    }
    let mut current = block;
    let mut attempts = 0;
    while !current.is_valid {
        attempts += 1;
        if attempts > ctx.validation.max_retry {
            return Err(IndexerError::RetryExhausted {
                label: format!("validate block {}", current.number),
                reason: format!("still not valid after {} attempts", ctx.validation.max_retry),
            });
        }
        warn!(number = current.number, attempts, "block not valid yet");
        tokio::time::sleep(ctx.validation.wait).await;
        current = ctx.caching.get_block(BlockKey::Number(current.number)).await?;
    }
    Ok(current)
}
