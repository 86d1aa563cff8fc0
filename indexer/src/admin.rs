//! One-shot maintenance commands run instead of the indexer

use tracing::{info, warn};

use crate::client::ChainAccessFacade;
use crate::database::{Database, Persistence};
use crate::error::{IndexerError, Result};

/// Overwrites `N`; a negative `n` counts back from the current tip.
pub async fn force_set_n(access: &ChainAccessFacade, persistence: &Persistence, n: i64) -> Result<u64> {
    let value = if n < 0 {
        let tip = access.get_height().await?;
        tip.checked_sub(n.unsigned_abs())
            .ok_or_else(|| IndexerError::Config(format!("cannot set N to T{n}, tip is {tip}")))?
    } else {
        n as u64
    };
    warn!(chain = %persistence.chain(), n = value, "force set N");
    persistence.write_indexed_height(value).await?;
    Ok(value)
}

/// Drops the state table and the tables of every supported chain.
pub async fn reset_complete(db: &Database) -> Result<()> {
    warn!("reset complete: dropping every chain");
    Persistence::drop_all_chains(db).await?;
    info!("reset completed");
    Ok(())
}

/// Drops this chain's state rows and tables.
pub async fn reset_active(persistence: &Persistence) -> Result<()> {
    warn!(chain = %persistence.chain(), "reset active chain");
    persistence.drop_all_state_info().await?;
    persistence.drop_chain_tables().await?;
    info!(chain = %persistence.chain(), "reset completed");
    Ok(())
}
