//! Daemon JSON wire types
//!
//! Every response carries a `status` string. Missing fields deserialize to
//! their defaults so older daemons stay readable.

use serde::{Deserialize, Serialize};

/// Status reported by a daemon that handled the request
pub const CORE_RPC_STATUS_OK: &str = "OK";
/// Status reported by a daemon that is still busy synchronizing
pub const CORE_RPC_STATUS_BUSY: &str = "BUSY";

/// Daemon RPC paths
pub mod paths {
    pub const GET_INFO: &str = "/getinfo";
    pub const GET_PEERS: &str = "/getpeers";
    pub const FEE_ADDRESS: &str = "/feeaddress";
    pub const START_MINING: &str = "/start_mining";
    pub const STOP_MINING: &str = "/stop_mining";
}

/// Map a transport result and daemon status to an error message
///
/// `ok` is false when the request never produced a response.
pub fn interpret_rpc_response(ok: bool, status: &str) -> Option<String> {
    if !ok {
        return Some("possible lost connection to daemon".to_string());
    }
    match status {
        CORE_RPC_STATUS_OK => None,
        CORE_RPC_STATUS_BUSY => Some("daemon is busy. Please try later".to_string()),
        other => Some(other.to_string()),
    }
}

/// Request without parameters
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmptyRequest {}

/// Response of `/getinfo`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GetInfoResponse {
    pub status: String,
    pub height: u64,
    pub last_known_block_index: u64,
    pub last_block_timestamp: u64,
    pub difficulty: u64,
    pub tx_count: u64,
    pub tx_pool_size: u64,
    pub alt_blocks_count: u64,
    pub outgoing_connections_count: u64,
    pub incoming_connections_count: u64,
    pub white_peerlist_size: u64,
    pub grey_peerlist_size: u64,
    pub min_fee: u64,
    pub already_generated_coins: u64,
    pub block_major_version: u8,
}

impl GetInfoResponse {
    /// Total connected peers
    pub fn peer_count(&self) -> u64 {
        self.outgoing_connections_count + self.incoming_connections_count
    }
}

/// Response of `/getpeers`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct GetPeersResponse {
    pub status: String,
    pub peers: Vec<String>,
}

/// Response of `/feeaddress`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FeeAddressResponse {
    pub status: String,
    pub fee_address: String,
    pub fee_amount: u64,
}

/// Request of `/start_mining`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartMiningRequest {
    pub miner_address: String,
    pub threads_count: u64,
}

/// Response carrying only a status
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StatusResponse {
    pub status: String,
}

/// Responses that carry a daemon status
pub trait RpcStatus {
    fn status(&self) -> &str;
}

macro_rules! impl_rpc_status {
    ($($ty:ty),*) => {
        $(impl RpcStatus for $ty {
            fn status(&self) -> &str {
                &self.status
            }
        })*
    };
}

impl_rpc_status!(GetInfoResponse, GetPeersResponse, FeeAddressResponse, StatusResponse);
