//! Remote daemon node
//!
//! Thin JSON-over-HTTP(S) client. Every call goes through [`RemoteNode::call`],
//! which maps transport failures and daemon statuses with
//! [`interpret_rpc_response`]. Queries swallow those errors, log them and
//! return defaults.

use super::events::{EventSink, NodeEvent};
use super::rpc::{
    interpret_rpc_response, paths, EmptyRequest, FeeAddressResponse, GetInfoResponse,
    GetPeersResponse, RpcStatus, StartMiningRequest, StatusResponse,
};
use super::{ConnectionInfo, InitCallback, Node};
use crate::currency::CurrencyParameters;
use crate::wallet::WalletHandle;
use crate::{Amount, Difficulty, Error, Result};
use async_trait::async_trait;
use reqwest::{Client, ClientBuilder};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Handle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use url::Url;

/// Connection settings of a [`RemoteNode`]
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteNodeConfig {
    pub host: String,
    pub port: u16,
    pub tls: bool,
    /// Accept self-signed certificates
    pub insecure: bool,
    pub request_timeout: Duration,
    pub poll_interval: Duration,
}

impl Default for RemoteNodeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 32348,
            tls: false,
            insecure: false,
            request_timeout: Duration::from_secs(10),
            poll_interval: Duration::from_secs(5),
        }
    }
}

impl RemoteNodeConfig {
    /// Daemon base URL
    pub fn base_url(&self) -> String {
        let scheme = if self.tls { "https" } else { "http" };
        format!("{}://{}:{}", scheme, self.host, self.port)
    }
}

struct Inner {
    client: Client,
    base_url: Url,
    config: RemoteNodeConfig,
    currency: CurrencyParameters,
    events: EventSink,
    runtime: Handle,
    shutdown: CancellationToken,
    init_started: AtomicBool,
}

/// Node backed by an external daemon
#[derive(Clone)]
pub struct RemoteNode {
    inner: Arc<Inner>,
}

impl RemoteNode {
    /// Create a client for the daemon described by `config`
    ///
    /// Must be called from within a tokio runtime; the node keeps a handle
    /// to it for its polling task.
    pub fn new(
        config: RemoteNodeConfig,
        currency: CurrencyParameters,
        events: EventSink,
    ) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| Error::invalid_state(format!("No tokio runtime: {}", e)))?;

        let base_url = Url::parse(&config.base_url())
            .map_err(|e| Error::config(format!("Invalid daemon URL: {}", e)))?;

        let client = ClientBuilder::new()
            .timeout(config.request_timeout)
            .danger_accept_invalid_certs(config.insecure)
            .build()
            .map_err(Error::from)?;

        Ok(Self {
            inner: Arc::new(Inner {
                client,
                base_url,
                config,
                currency,
                events,
                runtime,
                shutdown: CancellationToken::new(),
                init_started: AtomicBool::new(false),
            }),
        })
    }

    /// Daemon base URL
    pub fn base_url(&self) -> &Url {
        &self.inner.base_url
    }

    /// POST a JSON request and check the daemon status
    #[instrument(skip(self, request), fields(url = %self.inner.base_url))]
    pub async fn call<Req, Res>(&self, path: &str, request: &Req) -> Result<Res>
    where
        Req: Serialize + ?Sized + Sync,
        Res: DeserializeOwned + RpcStatus,
    {
        let url = self
            .inner
            .base_url
            .join(path)
            .map_err(|e| Error::config(format!("Failed to build {} URL: {}", path, e)))?;

        let response = match self.inner.client.post(url).json(request).send().await {
            Ok(response) => response,
            Err(e) => {
                debug!("Request to {} failed: {}", path, e);
                return Err(Error::no_connection(lost_connection()));
            }
        };

        let response: Res = match response.error_for_status() {
            Ok(response) => response.json().await.map_err(|e| {
                debug!("Malformed {} response: {}", path, e);
                Error::daemon(format!("Malformed response from {}", path))
            })?,
            Err(e) => {
                debug!("Daemon rejected {}: {}", path, e);
                return Err(Error::no_connection(lost_connection()));
            }
        };

        match interpret_rpc_response(true, response.status()) {
            None => Ok(response),
            Some(message) => Err(Error::daemon(message)),
        }
    }

    /// Run a call and project its response, logging failures and falling
    /// back to the default value
    async fn query<Res, T, F>(&self, path: &str, what: &str, project: F) -> T
    where
        Res: DeserializeOwned + RpcStatus,
        T: Default,
        F: FnOnce(Res) -> T,
    {
        match self.call::<_, Res>(path, &EmptyRequest {}).await {
            Ok(response) => project(response),
            Err(e) => {
                warn!("Failed to query {}: {}", what, e);
                T::default()
            }
        }
    }

    async fn get_info<T: Default>(
        &self,
        what: &str,
        project: impl FnOnce(GetInfoResponse) -> T,
    ) -> T {
        self.query(paths::GET_INFO, what, project).await
    }

    /// Poll `/getinfo` once and forward changes to the event sink
    async fn poll_once(&self) -> Result<()> {
        let events = &self.inner.events;
        match self
            .call::<_, GetInfoResponse>(paths::GET_INFO, &EmptyRequest {})
            .await
        {
            Ok(info) => {
                events.emit(NodeEvent::ConnectivityChanged(true));
                events.emit(NodeEvent::LocalHeightChanged(info.height));
                events.emit(NodeEvent::KnownHeightChanged(
                    info.last_known_block_index.max(info.height),
                ));
                events.emit(NodeEvent::PeerCountChanged(info.peer_count() as usize));
                Ok(())
            }
            Err(e) => {
                if matches!(e, Error::NoConnection { .. }) {
                    events.emit(NodeEvent::ConnectivityChanged(false));
                }
                warn!("Daemon poll failed: {}", e);
                Err(e)
            }
        }
    }

    async fn poll_loop(self, on_complete: InitCallback) {
        let token = self.inner.shutdown.clone();
        let mut on_complete = Some(on_complete);
        let mut interval = tokio::time::interval(self.inner.config.poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = token.cancelled() => break,
                _ = interval.tick() => {}
            }

            let result = self.poll_once().await;
            if let Some(callback) = on_complete.take() {
                callback(result);
            }
        }

        if let Some(callback) = on_complete.take() {
            callback(Err(Error::not_initialized(
                "node was deinitialized before the first poll",
            )));
        }
        debug!("Remote node polling stopped");
    }
}

fn lost_connection() -> String {
    interpret_rpc_response(false, "").unwrap_or_default()
}

#[async_trait]
impl Node for RemoteNode {
    fn name(&self) -> &'static str {
        "remote"
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
        info!("Connecting to daemon at {}", self.inner.base_url);
        self.inner.runtime.spawn(self.clone().poll_loop(on_complete));
    }

    fn deinit(&self) {
        if !self.inner.shutdown.is_cancelled() {
            debug!("Remote node deinit requested");
            self.inner.shutdown.cancel();
        }
    }

    async fn last_known_block_height(&self) -> u64 {
        self.get_info("last known block height", |info| {
            info.last_known_block_index.max(info.height)
        })
        .await
    }

    async fn last_local_block_height(&self) -> u64 {
        self.get_info("last local block height", |info| info.height).await
    }

    async fn last_local_block_timestamp(&self) -> u64 {
        self.get_info("last block timestamp", |info| info.last_block_timestamp)
            .await
    }

    async fn peer_count(&self) -> u64 {
        self.get_info("peer count", |info| info.peer_count()).await
    }

    async fn difficulty(&self) -> Difficulty {
        self.get_info("difficulty", |info| info.difficulty).await
    }

    async fn tx_count(&self) -> u64 {
        self.get_info("transaction count", |info| info.tx_count).await
    }

    async fn tx_pool_size(&self) -> u64 {
        self.get_info("transaction pool size", |info| info.tx_pool_size)
            .await
    }

    async fn alt_blocks_count(&self) -> u64 {
        self.get_info("alternative blocks count", |info| info.alt_blocks_count)
            .await
    }

    async fn connections_count(&self) -> u64 {
        self.get_info("connections count", |info| info.peer_count()).await
    }

    async fn outgoing_connections_count(&self) -> u64 {
        self.get_info("outgoing connections count", |info| {
            info.outgoing_connections_count
        })
        .await
    }

    async fn incoming_connections_count(&self) -> u64 {
        self.get_info("incoming connections count", |info| {
            info.incoming_connections_count
        })
        .await
    }

    async fn white_peerlist_size(&self) -> u64 {
        self.get_info("white peerlist size", |info| info.white_peerlist_size)
            .await
    }

    async fn grey_peerlist_size(&self) -> u64 {
        self.get_info("grey peerlist size", |info| info.grey_peerlist_size)
            .await
    }

    async fn minimal_fee(&self) -> Amount {
        let fallback = self.inner.currency.minimal_fee;
        self.get_info("minimal fee", |info| {
            if info.min_fee == 0 {
                fallback
            } else {
                info.min_fee
            }
        })
        .await
    }

    async fn fee_address(&self) -> String {
        self.query(paths::FEE_ADDRESS, "fee address", |res: FeeAddressResponse| {
            res.fee_address
        })
        .await
    }

    async fn fee_amount(&self) -> Amount {
        self.query(paths::FEE_ADDRESS, "fee amount", |res: FeeAddressResponse| {
            res.fee_amount
        })
        .await
    }

    async fn already_generated_coins(&self) -> Amount {
        self.get_info("already generated coins", |info| {
            info.already_generated_coins
        })
        .await
    }

    async fn current_block_major_version(&self) -> u8 {
        self.get_info("block major version", |info| info.block_major_version)
            .await
    }

    async fn get_connections(&self) -> Vec<ConnectionInfo> {
        self.query(paths::GET_PEERS, "connections", |res: GetPeersResponse| {
            res.peers
                .into_iter()
                .map(|address| ConnectionInfo {
                    id: address.clone(),
                    address,
                    is_incoming: false,
                })
                .collect()
        })
        .await
    }

    fn create_wallet(self: Arc<Self>) -> WalletHandle {
        WalletHandle::new(self)
    }

    async fn start_mining(&self, address: &str, threads: usize) -> Result<()> {
        let request = StartMiningRequest {
            miner_address: address.to_string(),
            threads_count: threads as u64,
        };
        match self
            .call::<_, StatusResponse>(paths::START_MINING, &request)
            .await
        {
            Ok(_) => {
                info!("Mining started in daemon");
                Ok(())
            }
            Err(e) => {
                warn!("Mining has NOT been started: {}", e);
                Err(e)
            }
        }
    }

    async fn stop_mining(&self) -> Result<()> {
        match self
            .call::<_, StatusResponse>(paths::STOP_MINING, &EmptyRequest {})
            .await
        {
            Ok(_) => {
                info!("Mining stopped in daemon");
                Ok(())
            }
            Err(e) => {
                warn!("Mining has NOT been stopped: {}", e);
                Err(e)
            }
        }
    }

    fn speed(&self) -> u64 {
        // The daemon owns its hash rate
        0
    }
}
