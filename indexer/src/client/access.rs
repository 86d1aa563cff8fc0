//! Fetch-or-fatal access to the chain client

use std::sync::Arc;

use rpc_core::{Block, BlockHeader, BlockKey, BlockTip, ChainClient, ChainType, NodeStatus};

use crate::error::Result;
use crate::retry::RetryPolicy;

/// Every call is retried with timeout and backoff; an empty answer after the
/// last attempt, or running out of attempts, is returned as
/// [`IndexerError::RetryExhausted`](crate::error::IndexerError::RetryExhausted).
pub struct ChainAccessFacade {
    client: Arc<dyn ChainClient>,
    retry: RetryPolicy,
}

impl ChainAccessFacade {
    pub fn new(client: Arc<dyn ChainClient>, retry: RetryPolicy) -> Self {
        Self { client, retry }
    }

    pub fn chain_type(&self) -> ChainType {
        self.client.chain_type()
    }

    pub fn client(&self) -> &Arc<dyn ChainClient> {
        &self.client
    }

    pub async fn get_block(&self, number: u64) -> Result<Block> {
        self.retry
            .run_some(&format!("getFullBlock({number})"), || self.client.get_full_block(number))
            .await
    }

    pub async fn get_block_by_hash(&self, hash: &str) -> Result<Block> {
        self.retry
            .run_some(&format!("getBlock({hash})"), || {
                self.client.get_block(BlockKey::Hash(hash.to_string()))
            })
            .await
    }

    pub async fn get_block_header(&self, number: u64) -> Result<BlockHeader> {
        self.retry
            .run_some(&format!("getBlockHeader({number})"), || {
                self.client.get_block_header(BlockKey::Number(number))
            })
            .await
    }

    pub async fn get_block_header_by_hash(&self, hash: &str) -> Result<BlockHeader> {
        self.retry
            .run_some(&format!("getBlockHeader({hash})"), || {
                self.client.get_block_header(BlockKey::Hash(hash.to_string()))
            })
            .await
    }

    pub async fn get_height(&self) -> Result<u64> {
        self.retry.run("getBlockHeight", || self.client.get_block_height()).await
    }

    pub async fn get_bottom_height(&self) -> Result<u64> {
        self.retry
            .run("getBottomBlockHeight", || self.client.get_bottom_block_height())
            .await
    }

    /// Block timestamp through the header, without fetching the body.
    pub async fn get_timestamp_at(&self, number: u64) -> Result<u64> {
        Ok(self.get_block_header(number).await?.timestamp)
    }

    pub async fn get_top_tips(&self, depth: u64) -> Result<Vec<BlockTip>> {
        self.retry
            .run(&format!("getTopTips({depth})"), || self.client.get_top_tips(depth))
            .await
    }

    pub async fn get_node_status(&self) -> Result<NodeStatus> {
        self.retry.run("getNodeStatus", || self.client.get_node_status()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IndexerError;
    use rpc_core::MockChainClient;
    use std::time::Duration;

    fn facade(mock: Arc<MockChainClient>) -> ChainAccessFacade {
        ChainAccessFacade::new(
            mock,
            RetryPolicy {
                timeout: Duration::from_secs(1),
                retries: 3,
                backoff: Duration::from_millis(1),
            },
        )
    }

    #[tokio::test]
    async fn test_transient_failures_are_retried() {
        let mock = Arc::new(MockChainClient::with_chain(ChainType::Algo, 10, 5_000, 5));
        mock.fail_next(2);
        let access = facade(mock.clone());

        assert_eq!(access.get_height().await.unwrap(), 9);
        assert_eq!(mock.calls("getBlockHeight"), 3);
        assert_eq!(access.get_timestamp_at(4).await.unwrap(), 5_020);
        assert_eq!(mock.calls("getFullBlock"), 0);
    }

    #[tokio::test]
    async fn test_missing_block_is_fatal() {
        let mock = Arc::new(MockChainClient::with_chain(ChainType::Xrp, 3, 0, 4));
        let access = facade(mock.clone());

        let result = access.get_block(50).await;
        assert!(matches!(result, Err(IndexerError::RetryExhausted { .. })));
        assert_eq!(mock.calls("getFullBlock"), 4);
    }
}
