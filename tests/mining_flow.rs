//! Miner lifecycle against scripted and embedded backends

use assert_matches::assert_matches;
use async_trait::async_trait;
use hybrid_node_miner::currency::CurrencyParameters;
use hybrid_node_miner::miner::{Miner, MinerConfig, MinerState, MinerStatus};
use hybrid_node_miner::node::embedded::EmbeddedNodeConfig;
use hybrid_node_miner::node::{
    BlockTemplateData, EmbeddedNode, EventSink, MiningBackend, Node, StakeRequirement,
};
use hybrid_node_miner::wallet::RegtestWallet;
use hybrid_node_miner::{AccountAddress, Amount, Block, BlockHeader, Difficulty, Error, Result};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::oneshot;

const BASE_STAKE: Amount = 1_000;
const REWARD: Amount = 50;

/// Backend with a fixed template that can be told to fail
struct ScriptedBackend {
    difficulty: Difficulty,
    failing: AtomicBool,
    rejecting_address: AtomicBool,
    templates: AtomicUsize,
    submitted: AtomicUsize,
}

impl ScriptedBackend {
    fn new(difficulty: Difficulty) -> Arc<Self> {
        Arc::new(Self {
            difficulty,
            failing: AtomicBool::new(false),
            rejecting_address: AtomicBool::new(false),
            templates: AtomicUsize::new(0),
            submitted: AtomicUsize::new(0),
        })
    }
}

#[async_trait]
impl MiningBackend for ScriptedBackend {
    async fn prepare_block_template(&self, _address: &AccountAddress) -> Result<BlockTemplateData> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(Error::no_connection("daemon went away"));
        }
        if self.rejecting_address.load(Ordering::SeqCst) {
            return Err(Error::invalid_address("daemon does not accept this address"));
        }
        self.templates.fetch_add(1, Ordering::SeqCst);
        Ok(BlockTemplateData {
            block: Block {
                header: BlockHeader {
                    major_version: 5,
                    timestamp: 1_700_000_000,
                    ..Default::default()
                },
                ..Default::default()
            },
            difficulty: self.difficulty,
            height: 10,
            ..Default::default()
        })
    }

    async fn get_stake(
        &self,
        _major_version: u8,
        fee: Amount,
        _median_size: usize,
        _already_generated_coins: Amount,
        _txs_size: usize,
    ) -> Result<StakeRequirement> {
        Ok(StakeRequirement {
            stake: BASE_STAKE,
            reward: REWARD + fee,
        })
    }

    async fn submit_block(&self, _block: Block) -> Result<()> {
        self.submitted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn currency() -> CurrencyParameters {
    CurrencyParameters {
        regtest_difficulty: 1,
        ..Default::default()
    }
}

fn address(currency: &CurrencyParameters) -> String {
    currency.format_address(&AccountAddress {
        spend_public_key: [1u8; 32],
        view_public_key: [2u8; 32],
    })
}

fn fast_config() -> MinerConfig {
    MinerConfig {
        wallet_settle_interval: Duration::ZERO,
        idle_sleep: Duration::from_millis(10),
        pause_sleep: Duration::from_millis(10),
        ..Default::default()
    }
}

/// Miner on a backend whose template is practically unsolvable
fn idle_miner(config: MinerConfig) -> (Miner, Arc<ScriptedBackend>, Arc<RegtestWallet>) {
    let backend = ScriptedBackend::new(Difficulty::MAX);
    let wallet = Arc::new(RegtestWallet::new(currency(), BASE_STAKE * 100));
    let miner = Miner::new(config, currency(), backend.clone(), wallet.clone()).unwrap();
    (miner, backend, wallet)
}

async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    for _ in 0..400 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("timed out waiting for {}", what);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_solved_blocks_are_submitted() {
    let backend = ScriptedBackend::new(1);
    let wallet = Arc::new(RegtestWallet::new(currency(), BASE_STAKE * 100));
    let miner = Miner::new(fast_config(), currency(), backend.clone(), wallet).unwrap();

    miner.start(&address(&currency()), 2).await.unwrap();
    assert!(miner.is_mining());
    assert_eq!(miner.status(), MinerStatus::Mining);
    assert_eq!(miner.thread_count(), 2);

    eventually("a submitted block", || {
        backend.submitted.load(Ordering::SeqCst) > 0
    })
    .await;
    eventually("an accepted block", || miner.blocks_found() > 0).await;
    // Each accepted block rebuilds the template
    eventually("a refreshed template", || miner.template_version() > 1).await;

    miner.stop();
    assert_eq!(miner.state(), MinerState::Stopped);
    assert_eq!(miner.thread_count(), 0);
    assert_eq!(miner.speed().value(), 0.0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_insufficient_balance_leaves_no_threads() {
    let backend = ScriptedBackend::new(1);
    let wallet = Arc::new(RegtestWallet::new(currency(), 10));
    let miner = Miner::new(fast_config(), currency(), backend, wallet).unwrap();

    let err = miner.start(&address(&currency()), 4).await.unwrap_err();
    assert_matches!(
        err,
        Error::InsufficientStake {
            required: BASE_STAKE,
            available: 10
        }
    );
    assert_eq!(miner.state(), MinerState::Stopped);
    assert_eq!(miner.thread_count(), 0);
    assert_eq!(
        miner.status(),
        MinerStatus::StakeUnaffordable {
            required: BASE_STAKE,
            available: 10
        }
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_chosen_stake_must_be_affordable() {
    let (miner, _backend, wallet) = idle_miner(fast_config());
    wallet.set_balance(BASE_STAKE * 2);
    miner.set_stake_amount(Some(BASE_STAKE * 5));

    assert_matches!(
        miner.start(&address(&currency()), 1).await,
        Err(Error::InsufficientStake { required, .. }) if required == BASE_STAKE * 5
    );

    miner.set_stake_amount(None);
    miner.start(&address(&currency()), 1).await.unwrap();
    miner.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_start_rejects_bad_arguments() {
    let (miner, backend, _wallet) = idle_miner(fast_config());

    assert_matches!(
        miner.start(&address(&currency()), 0).await,
        Err(Error::Config { .. })
    );
    assert_matches!(
        miner.start("not-an-address", 1).await,
        Err(Error::InvalidAddress { .. })
    );
    assert_eq!(miner.state(), MinerState::Stopped);
    assert_eq!(backend.templates.load(Ordering::SeqCst), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_start_twice_and_stop_twice() {
    let (miner, _backend, _wallet) = idle_miner(fast_config());

    miner.start(&address(&currency()), 2).await.unwrap();
    assert_matches!(
        miner.start(&address(&currency()), 2).await,
        Err(Error::AlreadyRunning { .. })
    );
    assert_eq!(miner.thread_count(), 2);

    miner.stop();
    miner.stop();
    assert_eq!(miner.state(), MinerState::Stopped);
    assert_eq!(miner.status(), MinerStatus::Idle);
    assert_eq!(miner.thread_count(), 0);

    // A stopped miner starts again
    miner.start(&address(&currency()), 1).await.unwrap();
    assert_eq!(miner.thread_count(), 1);
    miner.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_pause_and_resume_are_balanced() {
    let (miner, _backend, _wallet) = idle_miner(fast_config());
    miner.start(&address(&currency()), 2).await.unwrap();

    miner.pause();
    miner.pause();
    assert_eq!(miner.state(), MinerState::Paused);
    assert_eq!(miner.pause_count(), 2);

    miner.resume();
    assert_eq!(miner.state(), MinerState::Paused);
    miner.resume();
    assert_eq!(miner.state(), MinerState::Running);
    assert_eq!(miner.pause_count(), 0);

    // Unbalanced resume is ignored
    miner.resume();
    assert_eq!(miner.pause_count(), 0);
    assert!(miner.is_mining());

    miner.stop();
    assert_eq!(miner.pause_count(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_start_waits_for_synchronization() {
    let (miner, _backend, _wallet) = idle_miner(fast_config());

    miner.on_synchronization_lost().await;
    miner.start(&address(&currency()), 1).await.unwrap();
    assert!(!miner.is_mining());
    assert_eq!(miner.status(), MinerStatus::WaitingForSync);

    miner.on_synchronized().await;
    assert!(miner.is_mining());

    miner.on_synchronization_lost().await;
    assert_eq!(miner.state(), MinerState::Stopped);
    assert_eq!(miner.status(), MinerStatus::WaitingForSync);

    miner.on_synchronized().await;
    assert!(miner.is_mining());
    miner.stop();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_lost_stake_stops_mining() {
    let (miner, _backend, wallet) = idle_miner(fast_config());
    miner.start(&address(&currency()), 1).await.unwrap();

    wallet.set_balance(0);
    miner.on_block_chain_update().await;

    assert_eq!(miner.state(), MinerState::Stopped);
    assert_eq!(miner.thread_count(), 0);
    assert_eq!(
        miner.status(),
        MinerStatus::StakeUnaffordable {
            required: BASE_STAKE,
            available: 0
        }
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_repeated_template_failures_stop_mining() {
    let config = MinerConfig {
        max_template_failures: 2,
        ..fast_config()
    };
    let (miner, backend, _wallet) = idle_miner(config);
    miner.start(&address(&currency()), 1).await.unwrap();
    let version = miner.template_version();

    backend.failing.store(true, Ordering::SeqCst);
    miner.on_block_chain_update().await;
    assert!(miner.is_mining());
    assert_matches!(miner.status(), MinerStatus::TemplateUnavailable { .. });
    // Mining continues on the previous template
    assert_eq!(miner.template_version(), version);

    miner.on_block_chain_update().await;
    assert_eq!(miner.state(), MinerState::Stopped);
    assert_matches!(miner.status(), MinerStatus::TemplateUnavailable { .. });
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_unrecoverable_template_error_stops_at_once() {
    let (miner, backend, _wallet) = idle_miner(fast_config());
    miner.start(&address(&currency()), 1).await.unwrap();

    backend.rejecting_address.store(true, Ordering::SeqCst);
    miner.on_block_chain_update().await;

    assert_eq!(miner.state(), MinerState::Stopped);
    assert_eq!(miner.thread_count(), 0);
    assert_matches!(miner.status(), MinerStatus::TemplateUnavailable { .. });
}

#[tokio::test]
async fn test_stop_async_on_current_thread_runtime() {
    let (miner, _backend, _wallet) = idle_miner(fast_config());
    miner.start(&address(&currency()), 2).await.unwrap();

    miner.stop_async().await;
    assert_eq!(miner.state(), MinerState::Stopped);
    assert_eq!(miner.thread_count(), 0);

    // Repeated stop is a no-op
    miner.stop_async().await;
    assert_eq!(miner.status(), MinerStatus::Idle);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_template_recovers_after_failure() {
    let (miner, backend, _wallet) = idle_miner(fast_config());
    miner.start(&address(&currency()), 1).await.unwrap();

    backend.failing.store(true, Ordering::SeqCst);
    miner.on_block_chain_update().await;
    backend.failing.store(false, Ordering::SeqCst);
    miner.on_block_chain_update().await;

    assert!(miner.is_mining());
    assert_eq!(miner.status(), MinerStatus::Mining);
    assert_eq!(miner.template_version(), 2);
    miner.stop();
}

async fn init(node: &EmbeddedNode) {
    let (tx, rx) = oneshot::channel();
    node.init(Box::new(move |result| {
        let _ = tx.send(result);
    }));
    rx.await.unwrap().unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_mining_on_embedded_node() {
    let dir = TempDir::new().unwrap();
    let currency = currency();
    let (events, _stream) = EventSink::channel();
    let node = Arc::new(
        EmbeddedNode::regtest(
            EmbeddedNodeConfig {
                data_dir: dir.path().join("chain"),
                p2p_bind: SocketAddr::from(([127, 0, 0, 1], 0)),
                ..Default::default()
            },
            currency.clone(),
            events,
        )
        .unwrap(),
    );
    init(&node).await;

    let wallet = Arc::new(RegtestWallet::new(
        currency.clone(),
        currency.regtest_base_stake * 10,
    ));
    let miner = Miner::new(fast_config(), currency.clone(), node.clone(), wallet).unwrap();
    miner.start(&address(&currency), 2).await.unwrap();

    for _ in 0..400 {
        if node.last_local_block_height().await >= 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert!(node.last_local_block_height().await >= 2);

    miner.stop();
    assert_eq!(miner.thread_count(), 0);
    node.deinit();
}
