//! Node access layer
//!
//! [`Node`] is the single interface the wallet and the miner talk to. Two
//! implementations exist: [`RemoteNode`] proxies a daemon over JSON/HTTP and
//! [`EmbeddedNode`] runs storage, engine and peer server in process.
//!
//! Queries never fail across this boundary. A backend that cannot answer
//! yields the type's default and the condition is logged.

pub mod embedded;
pub mod events;
pub mod remote;
pub mod rpc;

pub use embedded::{EmbeddedBackend, EmbeddedNode, EmbeddedNodeConfig};
pub use events::{EventSink, EventStream, NodeEvent};
pub use remote::{RemoteNode, RemoteNodeConfig};

use crate::wallet::WalletHandle;
use crate::{extra, AccountAddress, Amount, Block, Difficulty, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::runtime::{Handle, RuntimeFlavor};
use tokio::task::block_in_place;
use tracing::error;

/// Completion callback of [`Node::init`], invoked exactly once
pub type InitCallback = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// One peer connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionInfo {
    pub id: String,
    pub address: String,
    pub is_incoming: bool,
}

/// Common node contract
#[async_trait]
pub trait Node: Send + Sync {
    /// Short backend name for logs
    fn name(&self) -> &'static str;

    /// Runtime the node spawns its tasks on
    fn runtime(&self) -> &Handle;

    /// Begin bring-up; `on_complete` fires exactly once
    fn init(&self, on_complete: InitCallback);

    /// Request shutdown. Idempotent and safe before `init`.
    fn deinit(&self);

    async fn last_known_block_height(&self) -> u64;
    async fn last_local_block_height(&self) -> u64;
    async fn last_local_block_timestamp(&self) -> u64;
    async fn peer_count(&self) -> u64;
    async fn difficulty(&self) -> Difficulty;
    async fn tx_count(&self) -> u64;
    async fn tx_pool_size(&self) -> u64;
    async fn alt_blocks_count(&self) -> u64;
    async fn connections_count(&self) -> u64;
    async fn outgoing_connections_count(&self) -> u64;
    async fn incoming_connections_count(&self) -> u64;
    async fn white_peerlist_size(&self) -> u64;
    async fn grey_peerlist_size(&self) -> u64;
    async fn minimal_fee(&self) -> Amount;
    async fn fee_address(&self) -> String;
    async fn fee_amount(&self) -> Amount;
    async fn already_generated_coins(&self) -> Amount;
    async fn current_block_major_version(&self) -> u8;

    /// Current peer connections
    async fn get_connections(&self) -> Vec<ConnectionInfo>;

    /// Blocking variant of [`Node::get_connections`]
    ///
    /// Works from plain threads, `spawn_blocking` tasks and multi-threaded
    /// runtime tasks. A current-thread runtime cannot block in place, so any
    /// thread of such a runtime gets an empty list instead of a deadlock.
    fn get_connections_blocking(&self) -> Vec<ConnectionInfo> {
        match Handle::try_current() {
            Err(_) => self.runtime().block_on(self.get_connections()),
            Ok(current) if current.runtime_flavor() == RuntimeFlavor::CurrentThread => {
                error!(
                    node = self.name(),
                    "get_connections_blocking called inside a current-thread runtime"
                );
                Vec::new()
            }
            Ok(_) => block_in_place(|| self.runtime().block_on(self.get_connections())),
        }
    }

    /// New wallet handle bound to this node's query surface
    fn create_wallet(self: Arc<Self>) -> WalletHandle;

    /// Payment id string to transaction extra bytes
    fn convert_payment_id(&self, payment_id: &str) -> Result<Vec<u8>> {
        extra::convert_payment_id(payment_id)
    }

    /// Payment id (uppercase hex) carried by transaction extra bytes
    fn extract_payment_id(&self, extra: &[u8]) -> Result<String> {
        extra::extract_payment_id(extra)
    }

    /// Ask the backend to mine to `address`
    async fn start_mining(&self, address: &str, threads: usize) -> Result<()>;

    /// Ask the backend to stop mining
    async fn stop_mining(&self) -> Result<()>;

    /// Backend-side hash rate
    fn speed(&self) -> u64;
}

/// Coinbase-less block skeleton and the chain state it was built on
#[derive(Debug, Clone, Default)]
pub struct BlockTemplateData {
    pub block: Block,
    pub difficulty: Difficulty,
    pub height: u32,
    pub fee: Amount,
    pub median_size: usize,
    pub txs_size: usize,
    pub already_generated_coins: Amount,
}

/// Stake required by the next block and the reward it pays
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StakeRequirement {
    pub stake: Amount,
    pub reward: Amount,
}

/// Backend operations the miner needs beyond plain queries
#[async_trait]
pub trait MiningBackend: Send + Sync {
    /// Block skeleton without a base transaction
    async fn prepare_block_template(&self, address: &AccountAddress) -> Result<BlockTemplateData>;

    /// Stake requirement for a block assembled from the given values
    async fn get_stake(
        &self,
        major_version: u8,
        fee: Amount,
        median_size: usize,
        already_generated_coins: Amount,
        txs_size: usize,
    ) -> Result<StakeRequirement>;

    /// Hand a solved block to the chain
    async fn submit_block(&self, block: Block) -> Result<()>;
}
