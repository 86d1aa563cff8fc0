//! Turning chain transactions into stored rows

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::json;

use rpc_core::{Block, ChainType, Transaction};

use crate::error::Result;
use crate::models::{TransactionRecord, ZERO_PAYMENT_REFERENCE};

/// Running totals of response bytes before and after compression.
#[derive(Debug, Default)]
pub struct CompressionStats {
    uncompressed: AtomicU64,
    compressed: AtomicU64,
}

impl CompressionStats {
    pub fn record(&self, uncompressed: usize, compressed: usize) {
        self.uncompressed.fetch_add(uncompressed as u64, Ordering::Relaxed);
        self.compressed.fetch_add(compressed as u64, Ordering::Relaxed);
    }

    pub fn totals(&self) -> (u64, u64) {
        (
            self.uncompressed.load(Ordering::Relaxed),
            self.compressed.load(Ordering::Relaxed),
        )
    }

    /// Compressed size as a fraction of the original; 0 before any data.
    pub fn ratio(&self) -> f64 {
        let (uncompressed, compressed) = self.totals();
        if uncompressed == 0 {
            0.0
        } else {
            compressed as f64 / uncompressed as f64
        }
    }
}

/// Truncates `text` to at most `max_len` characters.
pub fn prepare_string(text: &str, max_len: usize) -> String {
    text.chars().take(max_len).collect()
}

pub fn unprefix_0x(value: &str) -> &str {
    value
        .strip_prefix("0x")
        .or_else(|| value.strip_prefix("0X"))
        .unwrap_or(value)
}

/// 64 lowercase hex characters; zero-filled when the transaction carries no reference.
pub fn standard_payment_reference(reference: Option<&str>) -> String {
    let raw = match reference.map(unprefix_0x) {
        Some(raw) if !raw.is_empty() => raw,
        _ => return ZERO_PAYMENT_REFERENCE.to_string(),
    };
    let prepared = prepare_string(raw, 64).to_lowercase();
    let is_hex = prepared.len() % 2 == 0 && hex::decode(&prepared).is_ok();
    if is_hex {
        format!("{prepared:0>64}")
    } else {
        prepared
    }
}

/// Builds the stored row for `tx`; `additional_data` carries resolved inputs.
pub fn augment_transaction(
    chain: ChainType,
    block: &Block,
    tx: &Transaction,
    additional_data: Option<serde_json::Value>,
    stats: &CompressionStats,
) -> Result<TransactionRecord> {
    let response = serde_json::to_vec(&json!({
        "data": tx.data,
        "additionalData": additional_data,
    }))?;
    let compressed = snap::raw::Encoder::new().compress_vec(&response)?;
    stats.record(response.len(), compressed.len());

    Ok(TransactionRecord {
        chain_type: chain.code(),
        transaction_id: prepare_string(unprefix_0x(&tx.txid), 64).to_lowercase(),
        block_number: block.number,
        timestamp: block.timestamp,
        payment_reference: standard_payment_reference(tx.payment_reference.as_deref()),
        is_native_payment: tx.is_native_payment,
        transaction_type: tx.tx_type.clone(),
        response: compressed,
    })
}

/// Inverse of the response encoding used by [`augment_transaction`].
pub fn decode_response(response: &[u8]) -> Result<serde_json::Value> {
    let bytes = snap::raw::Decoder::new().decompress_vec(response)?;
    Ok(serde_json::from_slice(&bytes)?)
}
