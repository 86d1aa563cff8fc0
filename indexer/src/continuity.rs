//! Gap detection over the retained transaction tables

use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use crate::database::Persistence;
use crate::error::{IndexerError, Result};
use crate::models::state_names;
use crate::retention::RetentionManager;

/// Checks both transaction tables for missing block numbers above `Nbottom`.
///
/// A gap means the stored history can no longer be trusted: both tables
/// and the chain's state rows are dropped and a
/// [`IndexerError::Discontinuity`] is returned.
pub async fn check_database_continuous(persistence: &Persistence, retention: &RetentionManager) -> Result<()> {
    let chain = persistence.chain();
    let bottom = match persistence.get_state(state_names::BOTTOM_NUMBER).await? {
        Some(state) if state.value_number > 0 => state.value_number as u64,
        _ => {
            warn!(%chain, "continuity check skipped, no bottom block number stored");
            return Ok(());
        }
    };

    let gap = {
        let tables = retention.tables().await;
        let mut gap = None;
        for table in tables.both() {
            let missing = persistence.missing_block_numbers(table, bottom).await?;
            if missing != 0 {
                gap = Some((table.clone(), missing));
                break;
            }
            debug!(%chain, table = %table, "continuity ok");
        }
        gap
    };

    let Some((table, missing)) = gap else {
        return Ok(());
    };

    error!(%chain, table = %table, missing, bottom, "discontinuity detected, resetting chain data");
    retention.reset_all().await?;
    persistence.drop_all_state_info().await?;
    Err(IndexerError::Discontinuity { table, bottom, missing })
}

/// Runs the check every `interval`; resolves only with the first failure.
pub fn spawn_continuity_checks(
    persistence: Arc<Persistence>,
    retention: Arc<RetentionManager>,
    interval: Duration,
) -> JoinHandle<Result<()>> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        // The first tick completes immediately; startup already ran a check.
        ticker.tick().await;
        loop {
            ticker.tick().await;
            check_database_continuous(&persistence, &retention).await?;
        }
    })
}
