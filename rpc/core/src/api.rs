//! Chain RPC trait definitions

use async_trait::async_trait;

use crate::model::*;

/// Per-chain RPC surface consumed by the indexer.
///
/// Lookups return `Ok(None)` when the node does not know the requested
/// object; transport failures are reported as `RpcError`.
#[async_trait]
pub trait ChainClient: Send + Sync {
    fn chain_type(&self) -> ChainType;

    // Block methods
    async fn get_block(&self, key: BlockKey) -> Result<Option<Block>, RpcError>;
    async fn get_block_header(&self, key: BlockKey) -> Result<Option<BlockHeader>, RpcError>;
    async fn get_full_block(&self, number: u64) -> Result<Option<Block>, RpcError>;

    // Chain methods
    async fn get_block_height(&self) -> Result<u64, RpcError>;
    async fn get_bottom_block_height(&self) -> Result<u64, RpcError>;
    async fn get_top_tips(&self, depth: u64) -> Result<Vec<BlockTip>, RpcError>;
    async fn get_node_status(&self) -> Result<NodeStatus, RpcError>;

    // Transaction methods
    async fn get_transaction(&self, txid: &str) -> Result<Option<Transaction>, RpcError>;

    /// Current request-rate counters.
    fn stats(&self) -> ClientStats;
}
