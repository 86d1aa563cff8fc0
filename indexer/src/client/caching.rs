//! De-duplicating, size-bounded cache in front of the chain client

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use tracing::debug;

use rpc_core::{Block, BlockKey, ChainClient, ClientStats, Transaction};

use crate::config::CacheSettings;
use crate::error::{IndexerError, Result};
use crate::retry::RetryPolicy;

/// Cloneable failure carried by shared in-flight fetches.
#[derive(Debug, Clone)]
pub struct FetchFailure {
    label: String,
    reason: String,
}

impl From<IndexerError> for FetchFailure {
    fn from(err: IndexerError) -> Self {
        match err {
            IndexerError::RetryExhausted { label, reason } => Self { label, reason },
            other => Self {
                label: "fetch".to_string(),
                reason: other.to_string(),
            },
        }
    }
}

impl From<FetchFailure> for IndexerError {
    fn from(failure: FetchFailure) -> Self {
        IndexerError::RetryExhausted {
            label: failure.label,
            reason: failure.reason,
        }
    }
}

type SharedFetch<T> = Shared<BoxFuture<'static, std::result::Result<Arc<T>, FetchFailure>>>;

/// Map with an insertion-ordered key index for FIFO eviction.
struct FifoCache<V> {
    entries: HashMap<String, V>,
    order: VecDeque<String>,
    capacity: usize,
}

impl<V> FifoCache<V> {
    fn new(capacity: usize) -> Self {
        Self {
            entries: HashMap::new(),
            order: VecDeque::new(),
            capacity,
        }
    }

    fn get(&self, key: &str) -> Option<&V> {
        self.entries.get(key)
    }

    fn insert(&mut self, key: String, value: V) {
        if self.entries.insert(key.clone(), value).is_none() {
            self.order.push_back(key);
        }
    }

    /// Drops the oldest keys until the configured size is respected.
    fn trim(&mut self) -> usize {
        let mut removed = 0;
        while self.order.len() > self.capacity {
            if let Some(key) = self.order.pop_front() {
                self.entries.remove(&key);
                removed += 1;
            }
        }
        removed
    }

    fn len(&self) -> usize {
        self.entries.len()
    }
}

struct Caches {
    transactions: FifoCache<SharedFetch<Transaction>>,
    blocks: FifoCache<SharedFetch<Block>>,
    insertions: usize,
}

impl Caches {
    fn record_insertion(&mut self, cleanup_chunk_size: usize) {
        self.insertions += 1;
        if self.insertions < cleanup_chunk_size {
            return;
        }
        self.insertions = 0;
        let removed = self.transactions.trim() + self.blocks.trim();
        if removed > 0 {
            debug!(
                removed,
                transactions = self.transactions.len(),
                blocks = self.blocks.len(),
                "cache cleanup"
            );
        }
    }
}

pub struct CachingClient {
    client: Arc<dyn ChainClient>,
    retry: RetryPolicy,
    settings: CacheSettings,
    caches: Mutex<Caches>,
}

impl CachingClient {
    pub fn new(client: Arc<dyn ChainClient>, settings: CacheSettings, retry: RetryPolicy) -> Self {
        let caches = Caches {
            transactions: FifoCache::new(settings.transaction_cache_size),
            blocks: FifoCache::new(settings.block_cache_size),
            insertions: 0,
        };
        Self {
            client,
            retry,
            settings,
            caches: Mutex::new(caches),
        }
    }

    pub fn client(&self) -> &Arc<dyn ChainClient> {
        &self.client
    }

    pub fn stats(&self) -> ClientStats {
        self.client.stats()
    }

    /// Cooperative backpressure: callers poll this before issuing a fetch.
    pub fn can_accept(&self) -> bool {
        if self.settings.active_limit == 0 {
            return true;
        }
        let stats = self.client.stats();
        stats.in_processing + stats.in_queue <= self.settings.active_limit
    }

    /// Transaction by id; concurrent callers share one request.
    pub async fn get_transaction(&self, txid: &str) -> Result<Arc<Transaction>> {
        let fetch = {
            let mut caches = self.caches.lock();
            match caches.transactions.get(txid) {
                Some(fetch) => fetch.clone(),
                None => {
                    let fetch = self.fetch_transaction(txid.to_string());
                    caches.transactions.insert(txid.to_string(), fetch.clone());
                    caches.record_insertion(self.settings.cleanup_chunk_size);
                    fetch
                }
            }
        };
        Ok(fetch.await?)
    }

    /// Block by hash (memoized) or by number (always fetched, memoized under its hash).
    pub async fn get_block(&self, key: BlockKey) -> Result<Arc<Block>> {
        match key {
            BlockKey::Hash(hash) => {
                let fetch = {
                    let mut caches = self.caches.lock();
                    match caches.blocks.get(&hash) {
                        Some(fetch) => fetch.clone(),
                        None => {
                            let fetch = self.fetch_block(BlockKey::Hash(hash.clone()));
                            caches.blocks.insert(hash, fetch.clone());
                            caches.record_insertion(self.settings.cleanup_chunk_size);
                            fetch
                        }
                    }
                };
                Ok(fetch.await?)
            }
            BlockKey::Number(number) => {
                let block = self.fetch_block(BlockKey::Number(number)).await?;
                let mut caches = self.caches.lock();
                if caches.blocks.get(&block.hash).is_none() {
                    let ready = futures_util::future::ready(Ok(block.clone())).boxed().shared();
                    caches.blocks.insert(block.hash.clone(), ready);
                    caches.record_insertion(self.settings.cleanup_chunk_size);
                }
                Ok(block)
            }
        }
    }

    /// `(transactions, blocks)` entries currently held.
    pub fn cache_sizes(&self) -> (usize, usize) {
        let caches = self.caches.lock();
        (caches.transactions.len(), caches.blocks.len())
    }

    fn fetch_transaction(&self, txid: String) -> SharedFetch<Transaction> {
        let client = self.client.clone();
        let retry = self.retry;
        async move {
            let label = format!("getTransaction({txid})");
            let tx = retry
                .run_some(&label, || client.get_transaction(&txid))
                .await?;
            Ok::<_, IndexerError>(Arc::new(tx))
        }
        .map(|result: Result<Arc<Transaction>>| result.map_err(FetchFailure::from))
        .boxed()
        .shared()
    }

    fn fetch_block(&self, key: BlockKey) -> SharedFetch<Block> {
        let client = self.client.clone();
        let retry = self.retry;
        async move {
            let label = format!("getBlock({key})");
            let block = retry
                .run_some(&label, || client.get_block(key.clone()))
                .await?;
            Ok::<_, IndexerError>(Arc::new(block))
        }
        .map(|result: Result<Arc<Block>>| result.map_err(FetchFailure::from))
        .boxed()
        .shared()
    }
}
