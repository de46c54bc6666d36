//! Embedded node bring-up, queries and teardown

use assert_matches::assert_matches;
use hybrid_node_miner::currency::CurrencyParameters;
use hybrid_node_miner::error::StorageFailure;
use hybrid_node_miner::node::embedded::storage::{RocksStorage, CF_BLOCKS, CF_METADATA};
use hybrid_node_miner::node::embedded::{
    BlockchainEngine, ChainStorage, EmbeddedBackend, EmbeddedNodeConfig, PeerServer,
    ProtocolHandler, RegtestBackend, StoredBlock,
};
use hybrid_node_miner::node::{
    EmbeddedNode, EventSink, EventStream, MiningBackend, Node, NodeEvent,
};
use hybrid_node_miner::{AccountAddress, Error, Result};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::oneshot;

fn easy_currency() -> CurrencyParameters {
    CurrencyParameters {
        regtest_difficulty: 1,
        ..Default::default()
    }
}

fn config(dir: &Path) -> EmbeddedNodeConfig {
    EmbeddedNodeConfig {
        data_dir: dir.join("chain"),
        p2p_bind: SocketAddr::from(([127, 0, 0, 1], 0)),
        ..Default::default()
    }
}

fn regtest(config: EmbeddedNodeConfig) -> Result<(EmbeddedNode, EventStream)> {
    let (events, stream) = EventSink::channel();
    let node = EmbeddedNode::regtest(config, easy_currency(), events)?;
    Ok((node, stream))
}

async fn init(node: &EmbeddedNode) -> Result<()> {
    let (tx, rx) = oneshot::channel();
    node.init(Box::new(move |result| {
        let _ = tx.send(result);
    }));
    tokio::time::timeout(Duration::from_secs(10), rx)
        .await
        .expect("init callback timeout")
        .expect("init callback dropped")
}

/// Wait until the data directory can be opened by someone else
async fn wait_for_release(dir: &Path) {
    for _ in 0..200 {
        let storage = RocksStorage::new(dir);
        if storage.init().is_ok() {
            storage.shutdown();
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("storage at {} was never released", dir.display());
}

async fn mine_block(node: &EmbeddedNode) {
    let template = node
        .prepare_block_template(&AccountAddress::default())
        .await
        .unwrap();
    node.submit_block(template.block).await.unwrap();
}

#[tokio::test]
async fn test_bring_up_and_queries() {
    let dir = TempDir::new().unwrap();
    let (node, mut stream) = regtest(config(dir.path())).unwrap();

    init(&node).await.unwrap();
    assert_eq!(stream.recv().await, Some(NodeEvent::LocalHeightChanged(0)));
    assert_eq!(stream.recv().await, Some(NodeEvent::KnownHeightChanged(0)));

    assert_eq!(node.last_local_block_height().await, 0);
    assert_eq!(node.last_known_block_height().await, 0);
    assert_eq!(node.difficulty().await, 1);
    assert_eq!(node.tx_count().await, 1);
    assert_eq!(node.peer_count().await, 0);
    assert_eq!(node.fee_address().await, "");
    assert_eq!(node.fee_amount().await, 0);
    assert_eq!(
        node.minimal_fee().await,
        CurrencyParameters::default().minimal_fee
    );
    assert_eq!(
        node.current_block_major_version().await,
        CurrencyParameters::default().regtest_block_major_version
    );
    assert!(node.p2p_local_addr().is_some());
    assert_eq!(node.speed(), 0);
    assert_matches!(
        node.start_mining("address", 1).await,
        Err(Error::Unsupported { .. })
    );
    assert_matches!(node.stop_mining().await, Err(Error::Unsupported { .. }));

    node.deinit();
    node.deinit();
    wait_for_release(&dir.path().join("chain")).await;
}

#[tokio::test]
async fn test_submitted_block_raises_height() {
    let dir = TempDir::new().unwrap();
    let (node, mut stream) = regtest(config(dir.path())).unwrap();
    init(&node).await.unwrap();
    assert_eq!(stream.recv().await, Some(NodeEvent::LocalHeightChanged(0)));
    assert_eq!(stream.recv().await, Some(NodeEvent::KnownHeightChanged(0)));

    let currency = easy_currency();
    let stake = node
        .get_stake(currency.regtest_block_major_version, 0, 0, 0, 0)
        .await
        .unwrap();
    assert_eq!(stake.stake, currency.regtest_base_stake);

    mine_block(&node).await;
    assert_eq!(stream.recv().await, Some(NodeEvent::LocalHeightChanged(1)));
    assert_eq!(stream.recv().await, Some(NodeEvent::KnownHeightChanged(1)));
    assert_eq!(node.last_local_block_height().await, 1);
    assert_eq!(node.already_generated_coins().await, currency.regtest_block_reward);

    node.deinit();
}

#[tokio::test]
async fn test_chain_persists_and_rewinds() {
    let dir = TempDir::new().unwrap();
    let data_dir = dir.path().join("chain");

    {
        let (node, _stream) = regtest(config(dir.path())).unwrap();
        init(&node).await.unwrap();
        for _ in 0..3 {
            mine_block(&node).await;
        }
        assert_eq!(node.last_local_block_height().await, 3);
        node.deinit();
    }
    wait_for_release(&data_dir).await;

    let (node, _stream) = regtest(config(dir.path())).unwrap();
    assert_eq!(node.last_local_block_height().await, 3);
    node.deinit();
    drop(node);
    wait_for_release(&data_dir).await;

    let rewinding = EmbeddedNodeConfig {
        rewind_to_height: Some(1),
        ..config(dir.path())
    };
    let (node, _stream) = regtest(rewinding).unwrap();
    init(&node).await.unwrap();
    assert_eq!(node.last_local_block_height().await, 1);
    node.deinit();
}

#[tokio::test]
async fn test_schema_mismatch_reinitializes_storage() {
    let dir = TempDir::new().unwrap();
    let data_dir = dir.path().join("chain");
    {
        // Older schema with a block this build cannot read
        let mut opts = rocksdb::Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        let db = rocksdb::DB::open_cf(&opts, &data_dir, [CF_BLOCKS, CF_METADATA]).unwrap();
        let blocks = db.cf_handle(CF_BLOCKS).unwrap();
        db.put_cf(blocks, 0u64.to_be_bytes(), b"not json").unwrap();
        let metadata = db.cf_handle(CF_METADATA).unwrap();
        db.put_cf(metadata, b"schema_version", 0u32.to_le_bytes()).unwrap();
    }

    let (node, _stream) = regtest(config(dir.path())).unwrap();
    assert_eq!(node.last_local_block_height().await, 0);
    node.deinit();
}

#[tokio::test]
async fn test_leftover_lock_file_after_crash() {
    let dir = TempDir::new().unwrap();
    {
        let (node, _stream) = regtest(config(dir.path())).unwrap();
        init(&node).await.unwrap();
        mine_block(&node).await;
        node.deinit();
    }
    wait_for_release(&dir.path().join("chain")).await;
    // A killed node leaves its LOCK file on disk
    std::fs::write(dir.path().join("chain").join("LOCK"), b"31337\n").unwrap();

    let (node, _stream) = regtest(config(dir.path())).unwrap();
    init(&node).await.unwrap();
    assert_eq!(node.last_local_block_height().await, 1);
    node.deinit();
}

#[tokio::test]
async fn test_storage_in_use_is_fatal() {
    let dir = TempDir::new().unwrap();
    let holder = RocksStorage::new(dir.path().join("chain"));
    holder.init().unwrap();

    assert_matches!(
        regtest(config(dir.path())),
        Err(Error::Storage {
            kind: StorageFailure::InUse
        })
    );
}

#[tokio::test]
async fn test_storage_io_error_is_fatal() {
    let dir = TempDir::new().unwrap();
    // A plain file where the data directory should be
    std::fs::write(dir.path().join("chain"), b"").unwrap();

    assert_matches!(
        regtest(config(dir.path())),
        Err(Error::Storage {
            kind: StorageFailure::Io
        })
    );
}

#[derive(Clone, Copy)]
enum Fault {
    StaleSchema,
    BrokenInit,
}

struct FaultyStorage {
    fault: Fault,
    destroyed: AtomicUsize,
    shut_down: AtomicUsize,
}

impl FaultyStorage {
    fn new(fault: Fault) -> Self {
        Self {
            fault,
            destroyed: AtomicUsize::new(0),
            shut_down: AtomicUsize::new(0),
        }
    }
}

impl ChainStorage for FaultyStorage {
    fn init(&self) -> Result<()> {
        match self.fault {
            Fault::StaleSchema => Ok(()),
            Fault::BrokenInit => Err(Error::invalid_state("corrupted database")),
        }
    }

    fn schema_matches(&self) -> Result<bool> {
        Ok(false)
    }

    fn shutdown(&self) {
        self.shut_down.fetch_add(1, Ordering::SeqCst);
    }

    fn destroy(&self) -> Result<()> {
        self.destroyed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn load_blocks(&self) -> Result<Vec<StoredBlock>> {
        Ok(Vec::new())
    }

    fn append_block(&self, _block: &StoredBlock) -> Result<()> {
        Ok(())
    }

    fn truncate(&self, _count: usize) -> Result<()> {
        Ok(())
    }
}

struct FaultyBackend {
    storage: Arc<FaultyStorage>,
}

impl EmbeddedBackend for FaultyBackend {
    fn storage(&self, _config: &EmbeddedNodeConfig) -> Result<Arc<dyn ChainStorage>> {
        Ok(self.storage.clone())
    }

    fn engine(
        &self,
        storage: Arc<dyn ChainStorage>,
        currency: &CurrencyParameters,
    ) -> Result<Arc<dyn BlockchainEngine>> {
        RegtestBackend.engine(storage, currency)
    }

    fn protocol(&self, engine: Arc<dyn BlockchainEngine>) -> Arc<dyn ProtocolHandler> {
        RegtestBackend.protocol(engine)
    }

    fn peer_server(
        &self,
        protocol: Arc<dyn ProtocolHandler>,
        config: &EmbeddedNodeConfig,
    ) -> Arc<dyn PeerServer> {
        RegtestBackend.peer_server(protocol, config)
    }
}

#[tokio::test]
async fn test_persistent_schema_mismatch_is_fatal() {
    let dir = TempDir::new().unwrap();
    let storage = Arc::new(FaultyStorage::new(Fault::StaleSchema));
    let backend = FaultyBackend {
        storage: storage.clone(),
    };
    let (events, _stream) = EventSink::channel();

    let result = EmbeddedNode::bootstrap(config(dir.path()), easy_currency(), events, &backend);
    assert_matches!(
        result,
        Err(Error::Storage {
            kind: StorageFailure::SchemaMismatch
        })
    );
    assert_eq!(storage.destroyed.load(Ordering::SeqCst), 1);
    assert_eq!(storage.shut_down.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_unclassified_storage_failure() {
    let dir = TempDir::new().unwrap();
    let backend = FaultyBackend {
        storage: Arc::new(FaultyStorage::new(Fault::BrokenInit)),
    };
    let (events, _stream) = EventSink::channel();

    assert_matches!(
        EmbeddedNode::bootstrap(config(dir.path()), easy_currency(), events, &backend),
        Err(Error::Storage {
            kind: StorageFailure::Initialization
        })
    );
}

#[tokio::test]
async fn test_deinit_before_init_releases_storage() {
    let dir = TempDir::new().unwrap();
    let (node, _stream) = regtest(config(dir.path())).unwrap();

    node.deinit();
    wait_for_release(&dir.path().join("chain")).await;

    assert_matches!(init(&node).await, Err(Error::NotInitialized { .. }));
}

#[tokio::test]
async fn test_init_callback_fires_once() {
    let dir = TempDir::new().unwrap();
    let (node, _stream) = regtest(config(dir.path())).unwrap();
    let calls = Arc::new(AtomicUsize::new(0));

    let (tx, rx) = oneshot::channel();
    let counter = calls.clone();
    node.init(Box::new(move |result| {
        counter.fetch_add(1, Ordering::SeqCst);
        let _ = tx.send(result);
    }));
    rx.await.unwrap().unwrap();

    node.deinit();
    wait_for_release(&dir.path().join("chain")).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_second_init_callback_is_not_inline() {
    let dir = TempDir::new().unwrap();
    let (node, _stream) = regtest(config(dir.path())).unwrap();
    init(&node).await.unwrap();

    let fired = Arc::new(AtomicBool::new(false));
    let (tx, rx) = oneshot::channel();
    let flag = fired.clone();
    node.init(Box::new(move |result| {
        flag.store(true, Ordering::SeqCst);
        let _ = tx.send(result);
    }));
    assert!(!fired.load(Ordering::SeqCst));

    assert_matches!(rx.await.unwrap(), Err(Error::InvalidState { .. }));
    assert!(fired.load(Ordering::SeqCst));
    node.deinit();
}

#[tokio::test]
async fn test_peer_server_bind_failure() {
    let dir = TempDir::new().unwrap();
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let occupied = EmbeddedNodeConfig {
        p2p_bind: taken.local_addr().unwrap(),
        ..config(dir.path())
    };

    let (node, _stream) = regtest(occupied).unwrap();
    assert_matches!(init(&node).await, Err(Error::NotInitialized { .. }));
    wait_for_release(&dir.path().join("chain")).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_nodes_exchange_heights() {
    let first_dir = TempDir::new().unwrap();
    let (first, _first_stream) = regtest(config(first_dir.path())).unwrap();
    init(&first).await.unwrap();
    for _ in 0..2 {
        mine_block(&first).await;
    }
    let first_addr: SocketAddr = first.p2p_local_addr().unwrap();

    let second_dir = TempDir::new().unwrap();
    let seeded = EmbeddedNodeConfig {
        seed_peers: vec![first_addr],
        ..config(second_dir.path())
    };
    let (second, _second_stream) = regtest(seeded).unwrap();
    init(&second).await.unwrap();

    for _ in 0..200 {
        if second.connections_count().await == 1 && second.last_known_block_height().await == 2 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }

    assert_eq!(second.last_local_block_height().await, 0);
    assert_eq!(second.last_known_block_height().await, 2);
    assert_eq!(second.outgoing_connections_count().await, 1);
    assert_eq!(second.white_peerlist_size().await, 1);

    let connections = second.get_connections().await;
    assert_eq!(connections.len(), 1);
    assert_eq!(connections[0].address, first_addr.to_string());
    assert!(!connections[0].is_incoming);

    first.deinit();
    second.deinit();
}
