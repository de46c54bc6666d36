//! In-process node
//!
//! [`EmbeddedNode`] owns its storage, blockchain engine, protocol handler
//! and peer server, built in that order by an [`EmbeddedBackend`] and torn
//! down in reverse. The crate ships [`RegtestBackend`], a single-node
//! regtest chain with a plain TCP peer listener.

pub mod chain;
pub mod p2p;
pub mod protocol;
pub mod storage;

use super::events::{EventSink, NodeEvent};
use super::{
    BlockTemplateData, ConnectionInfo, InitCallback, MiningBackend, Node, StakeRequirement,
};
use crate::currency::CurrencyParameters;
use crate::error::StorageFailure;
use crate::wallet::WalletHandle;
use crate::{AccountAddress, Amount, Block, Difficulty, Error, Hash, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Persisted summary of one main-chain block
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct StoredBlock {
    pub index: u64,
    pub hash: Hash,
    pub previous_hash: Hash,
    pub timestamp: u64,
    pub major_version: u8,
    pub difficulty: Difficulty,
    pub reward: Amount,
    pub already_generated_coins: Amount,
    pub tx_count: u64,
}

/// Chain database
pub trait ChainStorage: Send + Sync {
    /// Open the database. I/O failures surface as [`Error::Io`], a database
    /// owned by someone else as [`StorageFailure::InUse`].
    fn init(&self) -> Result<()>;

    /// Whether the opened database uses the current schema
    fn schema_matches(&self) -> Result<bool>;

    /// Close the database; idempotent
    fn shutdown(&self);

    /// Delete all data of a closed database
    fn destroy(&self) -> Result<()>;

    fn load_blocks(&self) -> Result<Vec<StoredBlock>>;
    fn append_block(&self, block: &StoredBlock) -> Result<()>;

    /// Keep only the first `count` blocks
    fn truncate(&self, count: usize) -> Result<()>;
}

/// Blockchain engine bound to a storage
pub trait BlockchainEngine: Send + Sync {
    /// Load chain state from storage
    fn load(&self) -> Result<()>;

    /// Drop main-chain blocks above `height`
    fn rewind(&self, height: u64) -> Result<()>;

    /// Release engine resources before storage shuts down
    fn shutdown(&self);

    /// Register the observer that receives local height changes
    fn subscribe(&self, events: EventSink);

    fn top_height(&self) -> u64;
    fn top_timestamp(&self) -> u64;
    fn difficulty_for_next_block(&self) -> Difficulty;
    fn tx_count(&self) -> u64;
    fn tx_pool_size(&self) -> u64;
    fn alt_blocks_count(&self) -> u64;
    fn minimal_fee(&self) -> Amount;
    fn already_generated_coins(&self) -> Amount;
    fn current_block_major_version(&self) -> u8;

    /// Coinbase-less block skeleton on top of the current tip
    fn block_template(&self, address: &AccountAddress) -> Result<BlockTemplateData>;

    fn stake_requirement(
        &self,
        major_version: u8,
        fee: Amount,
        median_size: usize,
        already_generated_coins: Amount,
        txs_size: usize,
    ) -> Result<StakeRequirement>;

    /// Validate and append a block, returning its height
    fn submit_block(&self, block: &Block) -> Result<u64>;
}

/// Peer protocol bound to an engine
pub trait ProtocolHandler: Send + Sync {
    fn set_peer_server(&self, server: Weak<dyn PeerServer>);
    fn subscribe(&self, events: EventSink);
    fn unsubscribe(&self);
    fn local_height(&self) -> u64;
    /// Best height known from peers or the local chain
    fn known_height(&self) -> u64;
    fn on_peer_height(&self, height: u64);
    fn on_peer_count_changed(&self, count: usize);
    /// Announce a new local block
    fn relay_block(&self, height: u64);
}

/// Network server bound to a protocol handler
#[async_trait]
pub trait PeerServer: Send + Sync {
    /// Bind listening sockets
    async fn init(&self) -> Result<()>;

    /// Serve until [`PeerServer::send_stop_signal`]
    async fn run(&self) -> Result<()>;

    fn send_stop_signal(&self);

    /// Drop all connections and sockets
    async fn deinit(&self);

    fn broadcast_height(&self, height: u64);
    fn connections(&self) -> Vec<ConnectionInfo>;
    fn connections_count(&self) -> u64;
    fn outgoing_connections_count(&self) -> u64;
    fn white_peers_count(&self) -> u64;
    fn grey_peers_count(&self) -> u64;
    fn local_addr(&self) -> Option<SocketAddr>;
}

/// Factory for the components of an [`EmbeddedNode`]
pub trait EmbeddedBackend: Send + Sync {
    fn storage(&self, config: &EmbeddedNodeConfig) -> Result<Arc<dyn ChainStorage>>;

    fn engine(
        &self,
        storage: Arc<dyn ChainStorage>,
        currency: &CurrencyParameters,
    ) -> Result<Arc<dyn BlockchainEngine>>;

    fn protocol(&self, engine: Arc<dyn BlockchainEngine>) -> Arc<dyn ProtocolHandler>;

    fn peer_server(
        &self,
        protocol: Arc<dyn ProtocolHandler>,
        config: &EmbeddedNodeConfig,
    ) -> Arc<dyn PeerServer>;
}

/// Regtest chain on file storage with a TCP peer listener
#[derive(Debug, Clone, Copy, Default)]
pub struct RegtestBackend;

impl EmbeddedBackend for RegtestBackend {
    fn storage(&self, config: &EmbeddedNodeConfig) -> Result<Arc<dyn ChainStorage>> {
        Ok(Arc::new(storage::RocksStorage::new(config.data_dir.clone())))
    }

    fn engine(
        &self,
        storage: Arc<dyn ChainStorage>,
        currency: &CurrencyParameters,
    ) -> Result<Arc<dyn BlockchainEngine>> {
        Ok(Arc::new(chain::RegtestChain::new(storage, currency.clone())))
    }

    fn protocol(&self, engine: Arc<dyn BlockchainEngine>) -> Arc<dyn ProtocolHandler> {
        Arc::new(protocol::RegtestProtocol::new(engine))
    }

    fn peer_server(
        &self,
        protocol: Arc<dyn ProtocolHandler>,
        config: &EmbeddedNodeConfig,
    ) -> Arc<dyn PeerServer> {
        Arc::new(p2p::TcpPeerServer::new(
            config.p2p_bind,
            config.seed_peers.clone(),
            protocol,
        ))
    }
}

/// Settings of an [`EmbeddedNode`]
#[derive(Debug, Clone, PartialEq)]
pub struct EmbeddedNodeConfig {
    pub data_dir: PathBuf,
    pub p2p_bind: SocketAddr,
    pub seed_peers: Vec<SocketAddr>,
    pub rewind_to_height: Option<u32>,
}

impl Default for EmbeddedNodeConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            p2p_bind: SocketAddr::from(([127, 0, 0, 1], 32347)),
            seed_peers: Vec::new(),
            rewind_to_height: None,
        }
    }
}

/// Map a storage open failure to its fatal bring-up error
fn classify_storage_error(e: Error) -> Error {
    match e {
        Error::Io(io) => {
            error!("Storage I/O failure: {}", io);
            Error::storage(StorageFailure::Io)
        }
        Error::Storage { kind } => Error::Storage { kind },
        other => {
            error!("Storage initialization failure: {}", other);
            Error::storage(StorageFailure::Initialization)
        }
    }
}

fn open_storage_once(storage: &dyn ChainStorage) -> Result<bool> {
    storage.init().map_err(classify_storage_error)?;
    storage.schema_matches().map_err(classify_storage_error)
}

/// Open storage, wiping and re-creating it once on a schema mismatch
fn open_storage(storage: &dyn ChainStorage) -> Result<()> {
    if open_storage_once(storage)? {
        return Ok(());
    }

    warn!("Database schema version mismatch, reinitializing storage");
    storage.shutdown();
    storage.destroy().map_err(classify_storage_error)?;

    if open_storage_once(storage)? {
        return Ok(());
    }

    storage.shutdown();
    Err(Error::storage(StorageFailure::SchemaMismatch))
}

struct Inner {
    config: EmbeddedNodeConfig,
    events: EventSink,
    runtime: Handle,
    // Reverse construction order for teardown: server, protocol, engine, storage
    server: Arc<dyn PeerServer>,
    protocol: Arc<dyn ProtocolHandler>,
    engine: Arc<dyn BlockchainEngine>,
    storage: Arc<dyn ChainStorage>,
    shutdown: CancellationToken,
    init_started: AtomicBool,
    released: AtomicBool,
}

impl Inner {
    /// Release engine and storage; runs once
    fn release(&self) {
        if self.released.swap(true, Ordering::SeqCst) {
            return;
        }
        self.protocol.unsubscribe();
        self.engine.shutdown();
        self.storage.shutdown();
        info!("Embedded node shut down");
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.release();
    }
}

/// Node running inside this process
#[derive(Clone)]
pub struct EmbeddedNode {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for EmbeddedNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EmbeddedNode")
            .field("config", &self.inner.config)
            .finish_non_exhaustive()
    }
}

impl EmbeddedNode {
    /// Build storage, engine, protocol handler and peer server, then load
    /// the chain
    ///
    /// Storage failures are fatal and returned as [`Error::Storage`]. Must be
    /// called from within a tokio runtime.
    pub fn bootstrap(
        config: EmbeddedNodeConfig,
        currency: CurrencyParameters,
        events: EventSink,
        backend: &dyn EmbeddedBackend,
    ) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| Error::invalid_state(format!("No tokio runtime: {}", e)))?;

        let storage = backend.storage(&config)?;
        open_storage(storage.as_ref())?;

        let built = (|| {
            let engine = backend.engine(storage.clone(), &currency)?;
            let protocol = backend.protocol(engine.clone());
            let server = backend.peer_server(protocol.clone(), &config);
            protocol.set_peer_server(Arc::downgrade(&server));
            engine.load()?;
            Ok::<_, Error>((engine, protocol, server))
        })();

        let (engine, protocol, server) = match built {
            Ok(parts) => parts,
            Err(e) => {
                storage.shutdown();
                return Err(e);
            }
        };

        info!(
            "Embedded node ready at height {} ({})",
            engine.top_height(),
            config.data_dir.display()
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                events,
                runtime,
                server,
                protocol,
                engine,
                storage,
                shutdown: CancellationToken::new(),
                init_started: AtomicBool::new(false),
                released: AtomicBool::new(false),
            }),
        })
    }

    /// Bootstrap on the built-in regtest backend
    pub fn regtest(
        config: EmbeddedNodeConfig,
        currency: CurrencyParameters,
        events: EventSink,
    ) -> Result<Self> {
        Self::bootstrap(config, currency, events, &RegtestBackend)
    }

    /// Address the peer server listens on, once initialized
    pub fn p2p_local_addr(&self) -> Option<SocketAddr> {
        self.inner.server.local_addr()
    }

    async fn run(self, on_complete: InitCallback) {
        let inner = &self.inner;

        if inner.shutdown.is_cancelled() {
            on_complete(Err(Error::not_initialized(
                "node was deinitialized before init",
            )));
            inner.release();
            return;
        }

        if let Err(e) = inner.server.init().await {
            error!("Failed to initialize peer server: {}", e);
            on_complete(Err(Error::not_initialized(format!(
                "Failed to initialize peer server: {}",
                e
            ))));
            inner.release();
            return;
        }

        if let Some(height) = inner.config.rewind_to_height {
            if let Err(e) = inner.engine.rewind(u64::from(height)) {
                warn!("Failed to rewind to height {}: {}", height, e);
            }
        }

        inner.engine.subscribe(inner.events.clone());
        inner.protocol.subscribe(inner.events.clone());
        inner
            .events
            .emit(NodeEvent::LocalHeightChanged(inner.engine.top_height()));
        inner
            .events
            .emit(NodeEvent::KnownHeightChanged(inner.protocol.known_height()));

        on_complete(Ok(()));

        if let Err(e) = inner.server.run().await {
            error!("Peer server stopped with error: {}", e);
        }

        inner.server.deinit().await;
        inner.release();
    }
}

#[async_trait]
impl Node for EmbeddedNode {
    fn name(&self) -> &'static str {
        "embedded"
    }

    fn runtime(&self) -> &Handle {
        &self.inner.runtime
    }

    fn init(&self, on_complete: InitCallback) {
        if self.inner.init_started.swap(true, Ordering::SeqCst) {
            // Callbacks always run on the node runtime, never inline
            self.inner.runtime.spawn(async move {
                on_complete(Err(Error::invalid_state("node is already initialized")));
            });
            return;
        }
        self.inner.runtime.spawn(self.clone().run(on_complete));
    }

    fn deinit(&self) {
        if self.inner.shutdown.is_cancelled() {
            return;
        }
        debug!("Embedded node deinit requested");
        self.inner.shutdown.cancel();
        self.inner.server.send_stop_signal();
        if !self.inner.init_started.load(Ordering::SeqCst) {
            self.inner.release();
        }
    }

    async fn last_known_block_height(&self) -> u64 {
        self.inner.protocol.known_height()
    }

    async fn last_local_block_height(&self) -> u64 {
        self.inner.engine.top_height()
    }

    async fn last_local_block_timestamp(&self) -> u64 {
        self.inner.engine.top_timestamp()
    }

    async fn peer_count(&self) -> u64 {
        self.inner.server.connections_count()
    }

    async fn difficulty(&self) -> Difficulty {
        self.inner.engine.difficulty_for_next_block()
    }

    async fn tx_count(&self) -> u64 {
        self.inner.engine.tx_count()
    }

    async fn tx_pool_size(&self) -> u64 {
        self.inner.engine.tx_pool_size()
    }

    async fn alt_blocks_count(&self) -> u64 {
        self.inner.engine.alt_blocks_count()
    }

    async fn connections_count(&self) -> u64 {
        self.inner.server.connections_count()
    }

    async fn outgoing_connections_count(&self) -> u64 {
        self.inner.server.outgoing_connections_count()
    }

    async fn incoming_connections_count(&self) -> u64 {
        let server = &self.inner.server;
        server
            .connections_count()
            .saturating_sub(server.outgoing_connections_count())
    }

    async fn white_peerlist_size(&self) -> u64 {
        self.inner.server.white_peers_count()
    }

    async fn grey_peerlist_size(&self) -> u64 {
        self.inner.server.grey_peers_count()
    }

    async fn minimal_fee(&self) -> Amount {
        self.inner.engine.minimal_fee()
    }

    async fn fee_address(&self) -> String {
        // No remote node operator to pay
        String::new()
    }

    async fn fee_amount(&self) -> Amount {
        0
    }

    async fn already_generated_coins(&self) -> Amount {
        self.inner.engine.already_generated_coins()
    }

    async fn current_block_major_version(&self) -> u8 {
        self.inner.engine.current_block_major_version()
    }

    async fn get_connections(&self) -> Vec<ConnectionInfo> {
        self.inner.server.connections()
    }

    fn create_wallet(self: Arc<Self>) -> WalletHandle {
        WalletHandle::new(self)
    }

    async fn start_mining(&self, _address: &str, _threads: usize) -> Result<()> {
        Err(Error::unsupported(
            "start_mining on the embedded node, use the local miner",
        ))
    }

    async fn stop_mining(&self) -> Result<()> {
        Err(Error::unsupported(
            "stop_mining on the embedded node, use the local miner",
        ))
    }

    fn speed(&self) -> u64 {
        0
    }
}

#[async_trait]
impl MiningBackend for EmbeddedNode {
    async fn prepare_block_template(&self, address: &AccountAddress) -> Result<BlockTemplateData> {
        self.inner.engine.block_template(address)
    }

    async fn get_stake(
        &self,
        major_version: u8,
        fee: Amount,
        median_size: usize,
        already_generated_coins: Amount,
        txs_size: usize,
    ) -> Result<StakeRequirement> {
        self.inner.engine.stake_requirement(
            major_version,
            fee,
            median_size,
            already_generated_coins,
            txs_size,
        )
    }

    async fn submit_block(&self, block: Block) -> Result<()> {
        let height = self.inner.engine.submit_block(&block)?;
        self.inner.protocol.relay_block(height);
        Ok(())
    }
}
