//! JSON-RPC websocket adapter for an indexer-facing chain node

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Instant;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::debug;

use rpc_core::{
    Block, BlockHeader, BlockKey, BlockTip, ChainClient, ChainType, ClientStats, NodeStatus, RpcError,
    Transaction,
};

#[derive(Debug, Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    id: u64,
    method: &'a str,
    params: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    id: u64,
    #[serde(default)]
    result: serde_json::Value,
    #[serde(default)]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcError {
    code: i32,
    message: String,
}

/// Holds one unit of a stats counter until dropped, including when the request future is cancelled.
struct Counted<'a>(&'a AtomicUsize);

impl<'a> Counted<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for Counted<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Requests-per-second sampling window.
struct RateWindow {
    started: Instant,
    requests: u64,
    last_rate: f64,
}

pub struct NodeClient {
    chain_type: ChainType,
    url: String,
    next_id: AtomicU64,
    slots: Semaphore,
    in_queue: AtomicUsize,
    in_processing: AtomicUsize,
    rate: Mutex<RateWindow>,
}

impl NodeClient {
    /// `max_concurrent` of 0 leaves requests uncapped.
    pub fn new(chain_type: ChainType, url: &str, max_concurrent: usize) -> Result<Self, RpcError> {
        url::Url::parse(url).map_err(|e| RpcError::Internal(format!("Invalid node url {url}: {e}")))?;
        Ok(Self {
            chain_type,
            url: url.to_string(),
            next_id: AtomicU64::new(1),
            slots: Semaphore::new(if max_concurrent == 0 {
                Semaphore::MAX_PERMITS
            } else {
                max_concurrent
            }),
            in_queue: AtomicUsize::new(0),
            in_processing: AtomicUsize::new(0),
            rate: Mutex::new(RateWindow {
                started: Instant::now(),
                requests: 0,
                last_rate: 0.0,
            }),
        })
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: serde_json::Value) -> Result<T, RpcError> {
        let permit = {
            let _queued = Counted::enter(&self.in_queue);
            self.slots.acquire().await
        };
        let _permit = permit.map_err(|_| RpcError::Internal("client closed".to_string()))?;

        let processing = Counted::enter(&self.in_processing);
        self.record_request();
        let value = self.call_method(method, params).await?;
        drop(processing);

        serde_json::from_value(value).map_err(|e| RpcError::Decode(format!("{method}: {e}")))
    }

    async fn call_method(&self, method: &str, params: serde_json::Value) -> Result<serde_json::Value, RpcError> {
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| RpcError::Network(format!("WebSocket connection failed: {}", e)))?;

        let (mut write, mut read) = ws_stream.split();
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);

        let request = JsonRpcRequest {
            jsonrpc: "2.0",
            id,
            method,
            params,
        };
        let request_json = serde_json::to_string(&request)
            .map_err(|e| RpcError::Internal(format!("Request serialization failed: {}", e)))?;

        write
            .send(Message::Text(request_json))
            .await
            .map_err(|e| RpcError::Network(format!("Send failed: {}", e)))?;

        while let Some(message) = read.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    let response: JsonRpcResponse = serde_json::from_str(&text)
                        .map_err(|e| RpcError::Decode(format!("Response parsing failed: {}", e)))?;

                    if response.id != id {
                        continue;
                    }

                    if let Some(error) = response.error {
                        return Err(RpcError::Rpc {
                            code: error.code,
                            message: error.message,
                        });
                    }

                    debug!(method, id, "rpc response");
                    return Ok(response.result);
                }
                Ok(Message::Close(_)) => break,
                Err(e) => return Err(RpcError::Network(format!("WebSocket error: {}", e))),
                _ => continue,
            }
        }

        Err(RpcError::Network("Connection closed without response".to_string()))
    }

    fn record_request(&self) {
        let mut rate = self.rate.lock();
        rate.requests += 1;
        let elapsed = rate.started.elapsed().as_secs_f64();
        if elapsed >= 1.0 {
            rate.last_rate = rate.requests as f64 / elapsed;
            rate.requests = 0;
            rate.started = Instant::now();
        }
    }
}

fn key_param(key: &BlockKey) -> serde_json::Value {
    match key {
        BlockKey::Number(number) => serde_json::json!(number),
        BlockKey::Hash(hash) => serde_json::json!(hash),
    }
}

#[async_trait]
impl ChainClient for NodeClient {
    fn chain_type(&self) -> ChainType {
        self.chain_type
    }

    async fn get_block(&self, key: BlockKey) -> Result<Option<Block>, RpcError> {
        self.call("getBlock", serde_json::json!([key_param(&key)])).await
    }

    async fn get_block_header(&self, key: BlockKey) -> Result<Option<BlockHeader>, RpcError> {
        self.call("getBlockHeader", serde_json::json!([key_param(&key)])).await
    }

    async fn get_full_block(&self, number: u64) -> Result<Option<Block>, RpcError> {
        self.call("getFullBlock", serde_json::json!([number])).await
    }

    async fn get_block_height(&self) -> Result<u64, RpcError> {
        self.call("getBlockHeight", serde_json::json!([])).await
    }

    async fn get_bottom_block_height(&self) -> Result<u64, RpcError> {
        self.call("getBottomBlockHeight", serde_json::json!([])).await
    }

    async fn get_top_tips(&self, depth: u64) -> Result<Vec<BlockTip>, RpcError> {
        self.call("getTopTips", serde_json::json!([depth])).await
    }

    async fn get_node_status(&self) -> Result<NodeStatus, RpcError> {
        self.call("getNodeStatus", serde_json::json!([])).await
    }

    async fn get_transaction(&self, txid: &str) -> Result<Option<Transaction>, RpcError> {
        self.call("getTransaction", serde_json::json!([txid])).await
    }

    fn stats(&self) -> ClientStats {
        ClientStats {
            in_processing: self.in_processing.load(Ordering::SeqCst),
            in_queue: self.in_queue.load(Ordering::SeqCst),
            requests_per_sec: self.rate.lock().last_rate,
        }
    }
}
