use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;

use chain_indexer::clock::ManualClock;
use chain_indexer::config::{BlockCollecting, IndexerConfig, RetrySettings};
use chain_indexer::continuity::check_database_continuous;
use chain_indexer::database::Database;
use chain_indexer::engine::StepOutcome;
use chain_indexer::models::{state_names, BlockRecord, EMPTY_BLOCK_INDICATOR};
use chain_indexer::processor::PreparedBlock;
use chain_indexer::{EngineState, IndexerError, IndexingEngine};
use rpc_core::{BlockTip, ChainType, MockChainClient, TipStatus, Transaction};

const GENESIS_TIME: u64 = 1_000_000;
const SPACING: u64 = 10;
const TIP: u64 = 200;

fn ts(number: u64) -> u64 {
    GENESIS_TIME + number * SPACING
}

/// XRP chain 0..=200 with a 500 second history window and 6 confirmations.
///
/// Sync starts at N=148 and saves 149..=194.
struct Harness {
    _dir: TempDir,
    db: Database,
    mock: Arc<MockChainClient>,
    clock: Arc<ManualClock>,
}

impl Harness {
    async fn new() -> Self {
        Self::for_chain(ChainType::Xrp).await
    }

    async fn for_chain(chain: ChainType) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::new(&dir.path().join("indexer.db")).await.unwrap();
        let mock = Arc::new(MockChainClient::with_chain(chain, TIP + 1, GENESIS_TIME, SPACING));
        let clock = Arc::new(ManualClock::new(ts(TIP)));
        Self {
            _dir: dir,
            db,
            mock,
            clock,
        }
    }

    fn engine(&self, config: &IndexerConfig) -> IndexingEngine {
        IndexingEngine::new(config, self.mock.clone(), self.db.clone(), self.clock.clone()).unwrap()
    }

    /// Appends empty blocks up to `height` and moves the clock to the new tip.
    fn extend_chain(&self, height: u64) {
        for number in self.mock.height() + 1..=height {
            self.mock.push_block(number, ts(number), Vec::new());
        }
        self.clock.set(ts(height));
    }
}

fn config(history_blocks: u64) -> IndexerConfig {
    config_for(ChainType::Xrp, history_blocks)
}

fn config_for(chain_type: ChainType, history_blocks: u64) -> IndexerConfig {
    let mut config = IndexerConfig::default();
    config.chain = chain_type.name().to_string();
    config.indexer.sync_time_days = 500.0 / 86_400.0;
    config.indexer.block_collect_time_ms = 10;
    config.indexer.sync_update_time_ms = 60_000;
    config.indexer.node_status_poll_ms = 10;
    config.indexer.save_poll_ms = 10;
    config.cache.active_limit = 0;
    config.retry = RetrySettings {
        timeout_ms: 1_000,
        retries: 1,
        backoff_ms: 1,
    };
    for chain in config.chains.iter_mut().filter(|c| c.name == chain_type) {
        chain.minimal_storage_history_blocks = history_blocks;
        chain.sync_read_ahead = 10;
    }
    config
}

fn payment(txid: &str, reference: &str) -> Transaction {
    Transaction {
        txid: txid.to_string(),
        tx_type: "Payment".to_string(),
        payment_reference: Some(reference.to_string()),
        is_native_payment: true,
        inputs: vec![],
        outputs: vec![],
        data: serde_json::json!({"Account": "rSender", "Destination": "rReceiver"}),
    }
}

async fn initialize_and_sync(engine: &mut IndexingEngine) {
    let stored_n = engine.initialize().await.unwrap();
    engine.sync(stored_n).await.unwrap();
}

async fn advance_to(engine: &mut IndexingEngine, target: u64) {
    for _ in 0..50 {
        if engine.indexed_height() >= target {
            return;
        }
        if engine.realtime_step().await.unwrap() == StepOutcome::Idle {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
    panic!("N stuck at {} waiting for {}", engine.indexed_height(), target);
}

#[tokio::test]
async fn test_sync_saves_history_window_without_gaps() {
    let harness = Harness::new().await;
    let reference = "ab".repeat(32);
    let txid = "cd".repeat(32);
    harness.mock.push_block(160, ts(160), vec![payment(&txid, &reference)]);

    let mut engine = harness.engine(&config(1_000));
    initialize_and_sync(&mut engine).await;

    assert_eq!(engine.state(), EngineState::Syncing);
    assert_eq!(engine.indexed_height(), TIP - 6);
    let persistence = engine.persistence().clone();
    assert_eq!(persistence.get_indexed_height().await.unwrap(), 194);
    assert!(persistence.get_confirmed_block(148).await.unwrap().is_none());
    for number in 149..=194 {
        let block = persistence.get_confirmed_block(number).await.unwrap().unwrap();
        assert_eq!(block.block_hash, MockChainClient::block_hash(number, 0));
        assert!(block.confirmed);
    }

    // One placeholder per empty block plus the single payment.
    assert_eq!(persistence.count_rows("xrp_transactions0").await.unwrap(), 46);
    assert_eq!(persistence.count_rows("xrp_transactions1").await.unwrap(), 0);

    let queries = engine.queries();
    assert_eq!(queries.get_bottom_block_number().await.unwrap(), Some(149));
    let found = queries.get_transactions_in_block_range(149, 194).await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].block_number, 160);
    assert_ne!(found[0].transaction_type, EMPTY_BLOCK_INDICATOR);

    let by_reference = queries.get_transactions_by_payment_reference(&reference).await.unwrap();
    assert_eq!(by_reference.len(), 1);
    assert_eq!(by_reference[0].transaction_id, txid);
    assert!(queries.get_transaction_by_id(&txid).await.unwrap().is_some());
    assert!(queries.get_transaction_by_id(&"ef".repeat(32)).await.unwrap().is_none());

    let status = persistence.get_state(state_names::STATUS).await.unwrap().unwrap();
    assert_eq!(status.value_string, "sync");
    check_database_continuous(&persistence, engine.retention()).await.unwrap();
}

#[tokio::test]
async fn test_sync_rotates_transaction_tables() {
    let harness = Harness::new().await;
    let mut engine = harness.engine(&config(20));
    initialize_and_sync(&mut engine).await;

    // Rotations at 169 and 189: 149..=169 are gone, 170..=189 kept, 190..=194 active.
    let persistence = engine.persistence().clone();
    assert_eq!(engine.retention().active_table().await, "xrp_transactions0");
    assert_eq!(persistence.count_rows("xrp_transactions1").await.unwrap(), 20);
    assert_eq!(persistence.count_rows("xrp_transactions0").await.unwrap(), 5);
    assert_eq!(engine.queries().get_bottom_block_number().await.unwrap(), Some(170));
    assert_eq!(persistence.bottom_block_time(), Some(ts(170)));
    check_database_continuous(&persistence, engine.retention()).await.unwrap();
}

#[tokio::test]
async fn test_realtime_follows_reorganized_block() {
    let harness = Harness::new().await;
    let mut engine = harness.engine(&config(1_000));
    initialize_and_sync(&mut engine).await;

    advance_to(&mut engine, 195).await;
    assert_eq!(engine.indexed_height(), 195);

    // 196 is replaced before it is confirmed and saved.
    harness.mock.reorg(196, 1);
    harness.extend_chain(TIP + 1);
    advance_to(&mut engine, 196).await;

    let persistence = engine.persistence().clone();
    let saved = persistence.get_confirmed_block(196).await.unwrap().unwrap();
    assert_eq!(saved.block_hash, MockChainClient::block_hash(196, 1));
    assert!(engine
        .queries()
        .get_confirmed_block_by_hash(&MockChainClient::block_hash(196, 0))
        .await
        .unwrap()
        .is_none());

    let status = persistence.get_state(state_names::STATUS).await.unwrap().unwrap();
    assert!(status.value_string.starts_with("running"), "{}", status.value_string);
    assert!(engine.processed_blocks() > 0);
    check_database_continuous(&persistence, engine.retention()).await.unwrap();
}

#[tokio::test]
async fn test_saves_only_the_next_block() {
    let harness = Harness::new().await;
    let mut engine = harness.engine(&config(1_000));
    initialize_and_sync(&mut engine).await;

    let out_of_order = PreparedBlock {
        block: BlockRecord::observed(300, &"aa".repeat(32)),
        transactions: vec![],
    };
    let err = engine.block_save(out_of_order).await.unwrap_err();
    assert!(matches!(
        err,
        IndexerError::UnexpectedBlockNumber {
            expected: 195,
            got: 300
        }
    ));
    assert_eq!(engine.indexed_height(), 194);
    assert_eq!(engine.persistence().get_indexed_height().await.unwrap(), 194);
}

#[tokio::test]
async fn test_restart_continues_from_stored_height() {
    let harness = Harness::new().await;
    {
        let mut engine = harness.engine(&config(1_000));
        initialize_and_sync(&mut engine).await;
    }

    harness.extend_chain(210);
    let mut engine = harness.engine(&config(1_000));
    let stored_n = engine.initialize().await.unwrap();
    assert_eq!(stored_n, 194);
    engine.sync(stored_n).await.unwrap();

    assert_eq!(engine.indexed_height(), 204);
    for number in 149..=204 {
        assert!(engine.persistence().get_confirmed_block(number).await.unwrap().is_some());
    }
    check_database_continuous(engine.persistence(), engine.retention()).await.unwrap();
}

#[tokio::test]
async fn test_stale_history_resets_and_halts() {
    let harness = Harness::new().await;
    {
        let mut engine = harness.engine(&config(1_000));
        initialize_and_sync(&mut engine).await;
    }

    // The stored N is now far behind the start of the history window.
    harness.extend_chain(400);
    let mut engine = harness.engine(&config(1_000));
    let err = engine.run().await.unwrap_err();

    assert!(matches!(err, IndexerError::Halted(_)), "{err}");
    assert_eq!(engine.state(), EngineState::Halted);
    let persistence = engine.persistence();
    assert_eq!(persistence.get_indexed_height().await.unwrap(), 0);
    assert_eq!(persistence.count_rows("xrp_transactions0").await.unwrap(), 0);
    assert_eq!(persistence.count_rows("xrp_transactions1").await.unwrap(), 0);
}

#[tokio::test]
async fn test_gap_in_history_halts_on_startup() {
    let harness = Harness::new().await;
    {
        let mut engine = harness.engine(&config(1_000));
        initialize_and_sync(&mut engine).await;
    }

    sqlx::query("DELETE FROM xrp_transactions0 WHERE block_number = 170")
        .execute(harness.db.pool())
        .await
        .unwrap();

    let mut engine = harness.engine(&config(1_000));
    let err = engine.run().await.unwrap_err();

    assert!(
        matches!(err, IndexerError::Discontinuity { missing: 1, bottom: 149, .. }),
        "{err}"
    );
    assert_eq!(engine.state(), EngineState::Halted);
    let persistence = engine.persistence();
    assert_eq!(persistence.count_rows("xrp_transactions0").await.unwrap(), 0);
    assert!(persistence.get_state(state_names::BOTTOM_NUMBER).await.unwrap().is_none());
}

#[tokio::test]
async fn test_waits_for_node_to_sync() {
    let harness = Harness::new().await;
    harness.mock.set_synced(false);
    harness.db.migrate(ChainType::Xrp).await.unwrap();
    let engine = harness.engine(&config(1_000));

    let mock = harness.mock.clone();
    let release = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        mock.set_synced(true);
    });

    assert!(engine.wait_for_node_synced().await.unwrap());
    release.await.unwrap();
    let status = engine.persistence().get_state(state_names::STATUS).await.unwrap().unwrap();
    assert_eq!(status.value_string, "waiting");
}

#[tokio::test]
async fn test_tips_sync_collects_unconfirmed_headers() {
    let harness = Harness::for_chain(ChainType::Btc).await;
    let fork = MockChainClient::block_hash(199, 7);
    harness.mock.add_fork_tip(BlockTip {
        number: 199,
        hash: fork.clone(),
        chain_tip_status: TipStatus::ValidFork,
    });

    let mut config = config_for(ChainType::Btc, 1_000);
    for chain in config.chains.iter_mut().filter(|c| c.name == ChainType::Btc) {
        chain.block_collecting = BlockCollecting::Tips;
    }
    let mut engine = harness.engine(&config);
    initialize_and_sync(&mut engine).await;

    assert_eq!(engine.indexed_height(), 194);
    let persistence = engine.persistence().clone();
    let status = persistence.get_state(state_names::STATUS).await.unwrap().unwrap();
    assert_eq!(status.value_string, "waiting");
    assert_eq!(status.comment, "collecting tips");

    let unconfirmed = persistence.load_blocks_above(194).await.unwrap();
    assert!(unconfirmed.iter().all(|block| !block.confirmed));
    for number in 195..=TIP {
        let hash = MockChainClient::block_hash(number, 0);
        assert!(
            unconfirmed.iter().any(|block| block.block_number == number && block.block_hash == hash),
            "missing header {number}"
        );
    }
    assert!(unconfirmed.iter().any(|block| block.block_hash == fork));
    assert_eq!(unconfirmed.len(), 7);
}

#[tokio::test]
async fn test_latest_block_mode_skips_history() {
    let harness = Harness::new().await;
    let mut config = config(1_000);
    for chain in config.chains.iter_mut().filter(|c| c.name == ChainType::Xrp) {
        chain.block_collecting = BlockCollecting::LatestBlock;
    }
    let mut engine = harness.engine(&config);
    initialize_and_sync(&mut engine).await;

    assert_eq!(engine.indexed_height(), TIP);
    let persistence = engine.persistence().clone();
    assert!(persistence.get_confirmed_block(194).await.unwrap().is_none());
    assert_eq!(persistence.count_rows("xrp_transactions0").await.unwrap(), 0);

    // Indexing resumes with the first block confirmed after the tip.
    harness.extend_chain(TIP + 7);
    advance_to(&mut engine, TIP + 1).await;
    let saved = persistence.get_confirmed_block(TIP + 1).await.unwrap().unwrap();
    assert_eq!(saved.block_hash, MockChainClient::block_hash(TIP + 1, 0));
    assert!(persistence.get_confirmed_block(TIP).await.unwrap().is_none());
}
