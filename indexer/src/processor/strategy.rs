//! Per-chain block content policies

use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::try_join_all;
use serde_json::json;

use rpc_core::{Block, ChainType, Transaction};

use crate::error::{IndexerError, Result};
use crate::models::TransactionRecord;
use crate::processor::augment::augment_transaction;
use crate::processor::job::{JobContext, Limiter};

#[async_trait]
pub trait BlockStrategy: Send + Sync {
    /// Fetches whatever the block is missing and returns its transaction rows.
    async fn process(&self, ctx: &JobContext, limiter: &Limiter, block: &Block) -> Result<Vec<TransactionRecord>>;
}

/// Strategy table keyed by chain type.
pub fn strategy_for(chain: ChainType) -> Arc<dyn BlockStrategy> {
    match chain {
        ChainType::Btc | ChainType::Ltc => Arc::new(UtxoStrategy),
        ChainType::Doge => Arc::new(DogeStrategy),
        ChainType::Xrp | ChainType::Algo => Arc::new(InlineStrategy),
    }
}

/// UTXO chains whose blocks carry full transaction bodies.
pub struct UtxoStrategy;

/// UTXO chain whose blocks only list transaction ids.
pub struct DogeStrategy;

/// Ledger and account chains; block bodies are complete as returned.
pub struct InlineStrategy;

#[async_trait]
impl BlockStrategy for UtxoStrategy {
    async fn process(&self, ctx: &JobContext, limiter: &Limiter, block: &Block) -> Result<Vec<TransactionRecord>> {
        let rows = block
            .transactions
            .iter()
            .map(|tx| limiter.call(false, full_utxo_transaction(ctx, limiter, block, tx)));
        try_join_all(rows).await
    }
}

#[async_trait]
impl BlockStrategy for DogeStrategy {
    async fn process(&self, ctx: &JobContext, limiter: &Limiter, block: &Block) -> Result<Vec<TransactionRecord>> {
        let rows = block.transaction_ids.iter().map(|txid| async move {
            let tx = limiter.call(true, ctx.caching.get_transaction(txid)).await?;
            full_utxo_transaction(ctx, limiter, block, &tx).await
        });
        try_join_all(rows).await
    }
}

#[async_trait]
impl BlockStrategy for InlineStrategy {
    async fn process(&self, ctx: &JobContext, _limiter: &Limiter, block: &Block) -> Result<Vec<TransactionRecord>> {
        block
            .transactions
            .iter()
            .map(|tx| augment_transaction(ctx.chain, block, tx, None, &ctx.compression))
            .collect()
    }
}

/// Resolves spent outputs of transactions that carry a payment reference.
async fn full_utxo_transaction(
    ctx: &JobContext,
    limiter: &Limiter,
    block: &Block,
    tx: &Transaction,
) -> Result<TransactionRecord> {
    let additional_data = if tx.has_payment_reference() && !tx.is_coinbase() {
        let inputs = tx.inputs.iter().enumerate().filter_map(|(index, input)| {
            let txid = input.txid.clone()?;
            let vout = input.vout;
            Some(async move {
                let previous = limiter.call(true, ctx.caching.get_transaction(&txid)).await?;
                let output = vout.and_then(|vout| previous.outputs.get(vout as usize));
                Ok::<_, IndexerError>(json!({
                    "index": index,
                    "txid": txid,
                    "vout": vout,
                    "value": output.map(|o| o.value),
                    "address": output.and_then(|o| o.address.clone()),
                }))
            })
        });
        Some(json!({ "vinOutputs": try_join_all(inputs).await? }))
    } else {
        None
    };
    augment_transaction(ctx.chain, block, tx, additional_data, &ctx.compression)
}
