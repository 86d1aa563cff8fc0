use std::process;
use std::sync::Arc;

use anyhow::Context;
use chain_indexer::cli::{self, Args, ResetMode};
use chain_indexer::client::{ChainAccessFacade, NodeClient};
use chain_indexer::clock::SystemClock;
use chain_indexer::database::{Database, Persistence};
use chain_indexer::retry::RetryPolicy;
use chain_indexer::{admin, IndexerConfig, IndexerError, IndexingEngine};
use rpc_core::ChainClient;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() {
    let args = cli::parse_args();
    init_logging(&args);

    match run(&args).await {
        Ok(()) => info!("chain indexer stopped"),
        Err(e) => match e.downcast_ref::<IndexerError>() {
            // Stay up so the halted status row is what monitoring sees.
            Some(IndexerError::Halted(_)) | Some(IndexerError::Discontinuity { .. }) => {
                error!("indexer halted: {:#}", e);
                std::future::pending::<()>().await;
            }
            _ => {
                error!("fatal error: {:#}", e);
                process::exit(2);
            }
        },
    }
}

async fn run(args: &Args) -> anyhow::Result<()> {
    let mut config = match &args.config_path {
        Some(path) => IndexerConfig::load(path).with_context(|| format!("loading {}", path.display()))?,
        None => IndexerConfig::default(),
    };
    config.apply_cli_overrides(args);
    config.validate()?;

    let chain = config.chain_config()?;
    info!(chain = %chain.name, node = %chain.node_url, db = ?config.database.path, "starting chain indexer");

    let db = Database::connect(&config.database).await.context("opening database")?;

    if let Some(mode) = args.reset {
        match mode {
            ResetMode::Complete => admin::reset_complete(&db).await?,
            ResetMode::Active => {
                db.migrate(chain.name).await?;
                let persistence = Persistence::new(db.clone(), chain.name, Arc::new(SystemClock));
                admin::reset_active(&persistence).await?;
            }
        }
        return Ok(());
    }

    let client: Arc<dyn ChainClient> = Arc::new(
        NodeClient::new(chain.name, &chain.node_url, config.cache.active_limit)
            .map_err(IndexerError::from)?,
    );

    if let Some(n) = args.set_n {
        db.migrate(chain.name).await?;
        let persistence = Persistence::new(db.clone(), chain.name, Arc::new(SystemClock));
        let access = ChainAccessFacade::new(client, RetryPolicy::from(&config.retry));
        let value = admin::force_set_n(&access, &persistence, n).await?;
        warn!(n = value, "indexed height overwritten");
        return Ok(());
    }

    let mut engine = IndexingEngine::new(&config, client, db, Arc::new(SystemClock))?;
    engine.run().await?;
    Ok(())
}

fn init_logging(args: &Args) {
    use tracing_subscriber::{fmt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    if args.log_json {
        fmt().json().with_env_filter(filter).with_target(true).init();
    } else {
        fmt().with_env_filter(filter).with_target(true).with_thread_ids(true).init();
    }
}
