use clap::{Parser, ValueEnum};
use std::path::PathBuf;

#[derive(Parser, Debug, Default)]
#[command(name = "chain-indexer")]
#[command(about = "Confirmed-history indexer for UTXO, account and ledger chains", long_about = None)]
pub struct Args {
    /// Path to configuration file (optional, uses defaults if not provided)
    #[arg(short, long = "config")]
    pub config_path: Option<PathBuf>,

    /// Chain to index (BTC, LTC, DOGE, XRP, ALGO)
    #[arg(long)]
    pub chain: Option<String>,

    /// SQLite database file
    #[arg(short, long)]
    pub database: Option<PathBuf>,

    /// Node JSON-RPC websocket endpoint
    #[arg(long)]
    pub node_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Emit logs as JSON lines
    #[arg(long)]
    pub log_json: bool,

    /// Skip historical sync and start from the confirmed tip
    #[arg(long)]
    pub no_sync: bool,

    /// Force the indexed height and exit; negative values count back from the tip
    #[arg(long, allow_hyphen_values = true)]
    pub set_n: Option<i64>,

    /// Drop indexed data and exit
    #[arg(long, value_enum)]
    pub reset: Option<ResetMode>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ResetMode {
    /// Drop the state table and every chain's tables
    Complete,
    /// Drop the selected chain's state rows and tables
    Active,
}

pub fn parse_args() -> Args {
    Args::parse()
}
