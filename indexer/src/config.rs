use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rpc_core::ChainType;

use crate::error::{IndexerError, Result};

/// How a chain's tip is followed and how far back sync starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BlockCollecting {
    Raw,
    RawUnforkable,
    Tips,
    LatestBlock,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IndexerConfig {
    pub chain: String,
    pub database: DatabaseConfig,
    pub indexer: IndexerSettings,
    pub cache: CacheSettings,
    pub retry: RetrySettings,
    pub chains: Vec<ChainConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    pub max_connections: u32,
    pub busy_timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexerSettings {
    pub sync_enabled: bool,
    /// Fallback history window when the chain entry has none.
    pub sync_time_days: f64,
    pub block_collect_time_ms: u64,
    pub sync_update_time_ms: u64,
    pub continuity_check_interval_ms: u64,
    pub node_status_poll_ms: u64,
    pub save_poll_ms: u64,
    /// Membership-cache deletions between cooperative yields.
    pub prune_yield_every: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSettings {
    pub transaction_cache_size: usize,
    pub block_cache_size: usize,
    pub cleanup_chunk_size: usize,
    /// Cap on queued plus in-flight node requests, also the node client's concurrency.
    /// Zero means unlimited: no backpressure and no connection cap.
    pub active_limit: usize,
    pub limiter_poll_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetrySettings {
    pub timeout_ms: u64,
    pub retries: usize,
    pub backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChainConfig {
    pub name: ChainType,
    pub node_url: String,
    pub number_of_confirmations: u64,
    pub sync_read_ahead: u64,
    pub block_collecting: BlockCollecting,
    pub minimal_storage_history_days: f64,
    pub minimal_storage_history_blocks: u64,
    pub sync_time_days: Option<f64>,
    pub validate_block_before_process: bool,
    pub validate_block_wait_ms: u64,
    pub validate_block_max_retry: usize,
}

impl IndexerConfig {
    /// Load configuration from file if it exists, otherwise use defaults
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = fs::read_to_string(path)?;
            toml::from_str(&content)
                .map_err(|e| IndexerError::Config(format!("Failed to parse config: {}", e)))
        } else {
            Ok(IndexerConfig::default())
        }
    }

    /// Override config with CLI arguments
    pub fn apply_cli_overrides(&mut self, args: &crate::cli::Args) {
        if let Some(chain) = &args.chain {
            self.chain = chain.to_uppercase();
        }

        if let Some(database) = &args.database {
            self.database.path = database.clone();
        }

        if args.no_sync {
            self.indexer.sync_enabled = false;
        }

        if let Some(url) = &args.node_url {
            if let Ok(chain) = self.chain_config() {
                let name = chain.name;
                if let Some(entry) = self.chains.iter_mut().find(|c| c.name == name) {
                    entry.node_url = url.clone();
                }
            }
        }
    }

    pub fn chain_type(&self) -> Result<ChainType> {
        self.chain
            .parse()
            .map_err(|_| IndexerError::Config(format!("Unknown chain '{}'", self.chain)))
    }

    /// Settings of the chain selected by `chain`.
    pub fn chain_config(&self) -> Result<ChainConfig> {
        let chain_type = self.chain_type()?;
        self.chains
            .iter()
            .find(|c| c.name == chain_type)
            .cloned()
            .ok_or_else(|| IndexerError::Config(format!("No [[chains]] entry for {}", chain_type)))
    }

    /// History window for the selected chain in seconds.
    pub fn sync_window_secs(&self, chain: &ChainConfig) -> u64 {
        days_to_secs(chain.sync_time_days.unwrap_or(self.indexer.sync_time_days))
    }

    /// Rejects settings the indexer cannot run with.
    pub fn validate(&self) -> Result<()> {
        let chain = self.chain_config()?;

        if chain.number_of_confirmations == 0 {
            return Err(IndexerError::Config(format!(
                "{}: number_of_confirmations must be at least 1",
                chain.name
            )));
        }
        if chain.sync_read_ahead == 0 {
            return Err(IndexerError::Config(format!("{}: sync_read_ahead must be at least 1", chain.name)));
        }
        if chain.minimal_storage_history_days <= 0.0 || chain.minimal_storage_history_blocks == 0 {
            return Err(IndexerError::Config(format!("{}: retention window must be positive", chain.name)));
        }
        if chain.validate_block_before_process && chain.validate_block_max_retry == 0 {
            return Err(IndexerError::Config(format!(
                "{}: validate_block_max_retry must be at least 1",
                chain.name
            )));
        }
        if !chain.node_url.is_empty() {
            url::Url::parse(&chain.node_url)
                .map_err(|e| IndexerError::Config(format!("{}: invalid node_url: {}", chain.name, e)))?;
        }
        // cache.active_limit is valid at any value; 0 means unlimited.
        if self.cache.cleanup_chunk_size == 0 {
            return Err(IndexerError::Config("cache.cleanup_chunk_size must be at least 1".to_string()));
        }
        if self.retry.timeout_ms == 0 {
            return Err(IndexerError::Config("retry.timeout_ms must be positive".to_string()));
        }
        if self.indexer.sync_time_days < 0.0 || chain.sync_time_days.map_or(false, |d| d < 0.0) {
            return Err(IndexerError::Config("sync_time_days must not be negative".to_string()));
        }
        Ok(())
    }
}

impl ChainConfig {
    pub fn for_chain(name: ChainType) -> Self {
        let block_collecting = if name.is_utxo() {
            BlockCollecting::Tips
        } else {
            BlockCollecting::Raw
        };
        ChainConfig {
            name,
            block_collecting,
            ..ChainConfig::default()
        }
    }

    pub fn retention_time_secs(&self) -> u64 {
        days_to_secs(self.minimal_storage_history_days)
    }

    pub fn validate_wait(&self) -> Duration {
        Duration::from_millis(self.validate_block_wait_ms)
    }
}

impl RetrySettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

pub fn days_to_secs(days: f64) -> u64 {
    (days * 86_400.0).round().max(0.0) as u64
}

impl Default for ChainConfig {
    fn default() -> Self {
        Self {
            name: ChainType::Xrp,
            node_url: String::new(),
            number_of_confirmations: 6,
            sync_read_ahead: 30,
            block_collecting: BlockCollecting::Raw,
            minimal_storage_history_days: 1.0,
            minimal_storage_history_blocks: 1000,
            sync_time_days: None,
            validate_block_before_process: false,
            validate_block_wait_ms: 500,
            validate_block_max_retry: 10,
        }
    }
}

impl Default for IndexerConfig {
    fn default() -> Self {
        Self {
            chain: "XRP".to_string(),
            database: DatabaseConfig {
                path: PathBuf::from("./data/indexer.db"),
                max_connections: 20,
                busy_timeout_ms: 30_000,
            },
            indexer: IndexerSettings {
                sync_enabled: true,
                sync_time_days: 2.0,
                block_collect_time_ms: 1_000,
                sync_update_time_ms: 10_000,
                continuity_check_interval_ms: 60_000,
                node_status_poll_ms: 5_000,
                save_poll_ms: 100,
                prune_yield_every: 100,
            },
            cache: CacheSettings {
                transaction_cache_size: 100_000,
                block_cache_size: 100_000,
                cleanup_chunk_size: 100,
                active_limit: 20,
                limiter_poll_ms: 100,
            },
            retry: RetrySettings {
                timeout_ms: 20_000,
                retries: 3,
                backoff_ms: 1_000,
            },
            chains: ChainType::ALL.into_iter().map(ChainConfig::for_chain).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = IndexerConfig::default();
        config.validate().unwrap();
        assert_eq!(config.chain_config().unwrap().number_of_confirmations, 6);
        assert_eq!(config.sync_window_secs(&config.chain_config().unwrap()), 2 * 86_400);
    }

    #[test]
    fn test_load_from_toml() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("indexer.toml");
        let mut config = IndexerConfig::default();
        config.chain = "BTC".to_string();
        config.chains = vec![ChainConfig {
            name: ChainType::Btc,
            node_url: "ws://127.0.0.1:8332".to_string(),
            sync_time_days: Some(0.5),
            ..ChainConfig::for_chain(ChainType::Btc)
        }];
        fs::write(&path, toml::to_string(&config).unwrap()).unwrap();

        let loaded = IndexerConfig::load(&path).unwrap();
        let chain = loaded.chain_config().unwrap();
        assert_eq!(chain.block_collecting, BlockCollecting::Tips);
        assert_eq!(loaded.sync_window_secs(&chain), 43_200);
        loaded.validate().unwrap();
    }

    #[test]
    fn test_missing_file_uses_defaults() {
        let config = IndexerConfig::load(Path::new("/nonexistent/indexer.toml")).unwrap();
        assert_eq!(config.chain, "XRP");
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let mut config = IndexerConfig::default();
        config.chains[3].number_of_confirmations = 0;
        assert!(config.validate().is_err());

        let mut config = IndexerConfig::default();
        config.chain = "ETH".to_string();
        assert!(config.validate().is_err());

        let mut config = IndexerConfig::default();
        config.chains[3].node_url = "not a url".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_active_limit_is_unlimited() {
        let mut config = IndexerConfig::default();
        config.cache.active_limit = 0;
        config.validate().unwrap();
    }
}
