//! In-memory chain used by tests and dry runs

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::api::ChainClient;
use crate::model::*;

#[derive(Default)]
struct MockChain {
    /// Canonical branch by number.
    canonical: BTreeMap<u64, Block>,
    /// Every block ever announced, including replaced fork blocks.
    by_hash: HashMap<String, Block>,
    transactions: HashMap<String, Transaction>,
    fork_tips: Vec<BlockTip>,
    bottom: u64,
    synced: bool,
    failures_left: usize,
}

/// Synthetic chain implementing [`ChainClient`].
///
/// Counts calls per method so tests can assert on RPC traffic.
pub struct MockChainClient {
    chain_type: ChainType,
    chain: Mutex<MockChain>,
    calls: Mutex<HashMap<&'static str, usize>>,
    stats: Mutex<ClientStats>,
    latency: Duration,
}

impl MockChainClient {
    pub fn new(chain_type: ChainType) -> Self {
        Self {
            chain_type,
            chain: Mutex::new(MockChain {
                synced: true,
                ..Default::default()
            }),
            calls: Mutex::new(HashMap::new()),
            stats: Mutex::new(ClientStats::default()),
            latency: Duration::ZERO,
        }
    }

    /// Chain of `count` empty blocks starting at height 0, `spacing` seconds apart.
    pub fn with_chain(chain_type: ChainType, count: u64, start_time: u64, spacing: u64) -> Self {
        let client = Self::new(chain_type);
        for number in 0..count {
            client.push_block(number, start_time + number * spacing, Vec::new());
        }
        client
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Deterministic block hash for `number` on branch `fork`.
    pub fn block_hash(number: u64, fork: u8) -> String {
        format!("{fork:02x}{number:062x}")
    }

    /// Appends or replaces the canonical block at `number`.
    pub fn push_block(&self, number: u64, timestamp: u64, transactions: Vec<Transaction>) -> Block {
        self.push_block_on_fork(number, 0, timestamp, transactions)
    }

    pub fn push_block_on_fork(
        &self,
        number: u64,
        fork: u8,
        timestamp: u64,
        transactions: Vec<Transaction>,
    ) -> Block {
        let mut chain = self.chain.lock();
        let previous_block_hash = number
            .checked_sub(1)
            .and_then(|parent| chain.canonical.get(&parent))
            .map(|parent| parent.hash.clone())
            .unwrap_or_default();
        let block = Block {
            number,
            hash: Self::block_hash(number, fork),
            previous_block_hash,
            timestamp,
            is_valid: true,
            transaction_ids: transactions.iter().map(|tx| tx.txid.clone()).collect(),
            transactions,
        };
        for tx in &block.transactions {
            chain.transactions.insert(tx.txid.clone(), tx.clone());
        }
        chain.by_hash.insert(block.hash.clone(), block.clone());
        chain.canonical.insert(number, block.clone());
        block
    }

    /// Replaces the canonical block at `number` with one on branch `fork`.
    pub fn reorg(&self, number: u64, fork: u8) -> Block {
        let timestamp = self
            .chain
            .lock()
            .canonical
            .get(&number)
            .map(|block| block.timestamp)
            .unwrap_or_default();
        self.push_block_on_fork(number, fork, timestamp, Vec::new())
    }

    /// Makes the canonical block at `number` report itself as not yet final.
    pub fn set_block_valid(&self, number: u64, valid: bool) {
        let mut chain = self.chain.lock();
        if let Some(block) = chain.canonical.get_mut(&number) {
            block.is_valid = valid;
            let block = block.clone();
            chain.by_hash.insert(block.hash.clone(), block);
        }
    }

    /// Registers a transaction that is not part of any block (spent outputs).
    pub fn add_transaction(&self, tx: Transaction) {
        self.chain.lock().transactions.insert(tx.txid.clone(), tx);
    }

    pub fn add_fork_tip(&self, tip: BlockTip) {
        self.chain.lock().fork_tips.push(tip);
    }

    pub fn set_bottom(&self, bottom: u64) {
        self.chain.lock().bottom = bottom;
    }

    pub fn set_synced(&self, synced: bool) {
        self.chain.lock().synced = synced;
    }

    pub fn set_stats(&self, stats: ClientStats) {
        *self.stats.lock() = stats;
    }

    /// The next `count` calls fail with a network error.
    pub fn fail_next(&self, count: usize) {
        self.chain.lock().failures_left = count;
    }

    pub fn height(&self) -> u64 {
        self.chain
            .lock()
            .canonical
            .keys()
            .next_back()
            .copied()
            .unwrap_or_default()
    }

    pub fn canonical_block(&self, number: u64) -> Option<Block> {
        self.chain.lock().canonical.get(&number).cloned()
    }

    /// Number of calls made to `method` so far.
    pub fn calls(&self, method: &str) -> usize {
        self.calls.lock().get(method).copied().unwrap_or_default()
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }

    async fn enter(&self, method: &'static str) -> Result<(), RpcError> {
        *self.calls.lock().entry(method).or_default() += 1;
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let mut chain = self.chain.lock();
        if chain.failures_left > 0 {
            chain.failures_left -= 1;
            return Err(RpcError::Network(format!("{method}: connection reset")));
        }
        Ok(())
    }

    fn lookup(&self, key: &BlockKey) -> Option<Block> {
        let chain = self.chain.lock();
        match key {
            BlockKey::Number(number) => chain.canonical.get(number).cloned(),
            BlockKey::Hash(hash) => chain.by_hash.get(hash).cloned(),
        }
    }
}

#[async_trait]
impl ChainClient for MockChainClient {
    fn chain_type(&self) -> ChainType {
        self.chain_type
    }

    async fn get_block(&self, key: BlockKey) -> Result<Option<Block>, RpcError> {
        self.enter("getBlock").await?;
        Ok(self.lookup(&key))
    }

    async fn get_block_header(&self, key: BlockKey) -> Result<Option<BlockHeader>, RpcError> {
        self.enter("getBlockHeader").await?;
        Ok(self.lookup(&key).map(|block| block.header()))
    }

    async fn get_full_block(&self, number: u64) -> Result<Option<Block>, RpcError> {
        self.enter("getFullBlock").await?;
        Ok(self.lookup(&BlockKey::Number(number)))
    }

    async fn get_block_height(&self) -> Result<u64, RpcError> {
        self.enter("getBlockHeight").await?;
        Ok(self.height())
    }

    async fn get_bottom_block_height(&self) -> Result<u64, RpcError> {
        self.enter("getBottomBlockHeight").await?;
        Ok(self.chain.lock().bottom)
    }

    async fn get_top_tips(&self, depth: u64) -> Result<Vec<BlockTip>, RpcError> {
        self.enter("getTopTips").await?;
        let chain = self.chain.lock();
        let height = chain.canonical.keys().next_back().copied().unwrap_or_default();
        let from = height.saturating_sub(depth);
        let mut tips: Vec<BlockTip> = chain
            .canonical
            .range(from..=height)
            .map(|(number, block)| BlockTip {
                number: *number,
                hash: block.hash.clone(),
                chain_tip_status: TipStatus::Active,
            })
            .collect();
        tips.extend(chain.fork_tips.iter().filter(|tip| tip.number >= from).cloned());
        Ok(tips)
    }

    async fn get_node_status(&self) -> Result<NodeStatus, RpcError> {
        self.enter("getNodeStatus").await?;
        Ok(NodeStatus {
            is_synced: self.chain.lock().synced,
            version: "mock".to_string(),
        })
    }

    async fn get_transaction(&self, txid: &str) -> Result<Option<Transaction>, RpcError> {
        self.enter("getTransaction").await?;
        Ok(self.chain.lock().transactions.get(txid).cloned())
    }

    fn stats(&self) -> ClientStats {
        *self.stats.lock()
    }
}
