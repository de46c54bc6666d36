//! Hybrid proof-of-stake / proof-of-work miner
//!
//! The [`Miner`] binds a wallet stake transaction into each block template
//! and lets a pool of OS threads search for a nonce. Solved blocks go back
//! to the [`MiningBackend`] from a task on the async runtime.
//!
//! States: `Stopped → Starting → Running ⇄ Paused → Stopping → Stopped`.

pub mod hashrate;
pub mod stake;
pub mod template;
pub mod worker;

pub use hashrate::HashrateTracker;
pub use stake::StakeParameters;
pub use template::{request_block_template, TemplateRequest, TemplateSnapshot, TemplateStore};
pub use worker::{MiningSession, WorkerState};

use crate::currency::CurrencyParameters;
use crate::node::MiningBackend;
use crate::utils::{ExponentialBackoff, INITIAL_RETRY_DELAY};
use crate::wallet::StakeWallet;
use crate::{AccountAddress, Amount, Block, Error, HashRate, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::runtime::Handle;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use worker::WorkerContext;

/// Miner settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MinerConfig {
    /// Ring size of stake transaction inputs
    pub stake_mixin: u32,
    /// Stake to commit; `None` uses the chain's base stake
    pub stake_amount: Option<Amount>,
    /// How often the template is rebuilt while mining
    pub template_refresh_interval: Duration,
    /// How often worker hash counts are merged into the rate window
    pub hashrate_interval: Duration,
    /// Delay before rebuilding the template after a chain update
    pub wallet_settle_interval: Duration,
    /// Bounded wait for worker threads on stop
    pub stop_timeout: Duration,
    /// Consecutive template failures before mining stops
    pub max_template_failures: u32,
    /// Samples kept in the hash rate window
    pub hashrate_window: usize,
    /// Worker sleep while paused
    pub pause_sleep: Duration,
    /// Worker sleep while no template is available
    pub idle_sleep: Duration,
}

impl Default for MinerConfig {
    fn default() -> Self {
        Self {
            stake_mixin: 3,
            stake_amount: None,
            template_refresh_interval: Duration::from_secs(30),
            hashrate_interval: Duration::from_secs(2),
            wallet_settle_interval: Duration::from_secs(5),
            stop_timeout: Duration::from_secs(2),
            max_template_failures: 5,
            hashrate_window: hashrate::DEFAULT_HASHRATE_WINDOW,
            pause_sleep: Duration::from_millis(100),
            idle_sleep: Duration::from_secs(1),
        }
    }
}

/// Lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MinerState {
    Stopped,
    Starting,
    Running,
    Paused,
    Stopping,
}

impl fmt::Display for MinerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            MinerState::Stopped => "stopped",
            MinerState::Starting => "starting",
            MinerState::Running => "running",
            MinerState::Paused => "paused",
            MinerState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Outcome of the last mining attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MinerStatus {
    Idle,
    Mining,
    /// Start was requested while the node is still synchronizing
    WaitingForSync,
    /// The wallet cannot cover the stake
    StakeUnaffordable { required: Amount, available: Amount },
    /// Templates kept failing
    TemplateUnavailable { reason: String },
}

#[derive(Debug, Clone)]
struct MiningTarget {
    address: String,
    account: AccountAddress,
    threads: usize,
}

#[derive(Debug, Clone, Copy)]
struct StakeSettings {
    mixin: u32,
    amount: Option<Amount>,
}

#[derive(Debug)]
struct Maintenance {
    last_refresh: Instant,
    last_hashrate: Instant,
    failures: u32,
    backoff: ExponentialBackoff,
    retry_at: Option<Instant>,
}

impl Maintenance {
    fn new(config: &MinerConfig) -> Self {
        Self {
            last_refresh: Instant::now(),
            last_hashrate: Instant::now(),
            failures: 0,
            backoff: ExponentialBackoff::new(
                INITIAL_RETRY_DELAY,
                config.template_refresh_interval,
            ),
            retry_at: None,
        }
    }
}

struct Inner {
    config: MinerConfig,
    currency: CurrencyParameters,
    backend: Arc<dyn MiningBackend>,
    wallet: Arc<dyn StakeWallet>,
    runtime: Handle,
    templates: Arc<TemplateStore>,
    stake: Mutex<StakeSettings>,
    state: Mutex<MinerState>,
    status: Mutex<MinerStatus>,
    target: Mutex<Option<MiningTarget>>,
    session: Mutex<Option<Arc<MiningSession>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
    hashrate: Mutex<HashrateTracker>,
    maintenance: Mutex<Maintenance>,
    synchronized: AtomicBool,
    pending_start: Mutex<Option<(String, usize)>>,
    blocks_found: AtomicU64,
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(session) = self.session.lock().take() {
            session.stop();
        }
    }
}

/// Local stake miner
#[derive(Clone)]
pub struct Miner {
    inner: Arc<Inner>,
}

impl Miner {
    /// Create a stopped miner; must be called from within a tokio runtime
    pub fn new(
        config: MinerConfig,
        currency: CurrencyParameters,
        backend: Arc<dyn MiningBackend>,
        wallet: Arc<dyn StakeWallet>,
    ) -> Result<Self> {
        let runtime = Handle::try_current()
            .map_err(|e| Error::invalid_state(format!("No tokio runtime: {}", e)))?;

        Ok(Self {
            inner: Arc::new(Inner {
                templates: Arc::new(TemplateStore::new(currency.clone())),
                stake: Mutex::new(StakeSettings {
                    mixin: config.stake_mixin,
                    amount: config.stake_amount,
                }),
                state: Mutex::new(MinerState::Stopped),
                status: Mutex::new(MinerStatus::Idle),
                target: Mutex::new(None),
                session: Mutex::new(None),
                workers: Mutex::new(Vec::new()),
                hashrate: Mutex::new(HashrateTracker::new(config.hashrate_window)),
                maintenance: Mutex::new(Maintenance::new(&config)),
                synchronized: AtomicBool::new(true),
                pending_start: Mutex::new(None),
                blocks_found: AtomicU64::new(0),
                config,
                currency,
                backend,
                wallet,
                runtime,
            }),
        })
    }

    /// Start mining to `address` with `threads` workers
    ///
    /// Fails when already running, when threads of an earlier session are
    /// still alive, or when the first template cannot be built. On failure
    /// no thread is left behind.
    pub async fn start(&self, address: &str, threads: usize) -> Result<()> {
        if threads == 0 {
            return Err(Error::config("thread count must be greater than 0"));
        }

        if !self.inner.synchronized.load(Ordering::SeqCst) {
            info!("Node is synchronizing, mining will start once it is done");
            *self.inner.pending_start.lock() = Some((address.to_string(), threads));
            *self.inner.status.lock() = MinerStatus::WaitingForSync;
            return Ok(());
        }

        {
            let mut state = self.inner.state.lock();
            if *state != MinerState::Stopped {
                return Err(Error::already_running(format!("miner is {}", *state)));
            }
            let residual = self.reap_workers();
            if residual > 0 {
                return Err(Error::already_running(format!(
                    "{} worker threads of the previous session are still running",
                    residual
                )));
            }
            *state = MinerState::Starting;
        }

        let account = match self.inner.currency.parse_address(address) {
            Ok(account) => account,
            Err(e) => {
                *self.inner.state.lock() = MinerState::Stopped;
                return Err(e);
            }
        };
        *self.inner.target.lock() = Some(MiningTarget {
            address: address.to_string(),
            account,
            threads,
        });

        if let Err(e) = self.refresh_template(false).await {
            error!("Failed to start mining: {}", e);
            self.record_failure(&e);
            *self.inner.target.lock() = None;
            *self.inner.state.lock() = MinerState::Stopped;
            return Err(e);
        }

        self.launch(threads)
    }

    fn launch(&self, threads: usize) -> Result<()> {
        let mut state = self.inner.state.lock();
        if *state != MinerState::Starting {
            return Err(Error::invalid_state("mining was stopped while starting"));
        }

        let session = Arc::new(MiningSession::new(threads));
        let (found, found_rx) = mpsc::unbounded_channel();
        let context = WorkerContext {
            span: worker::session_span(&session),
            session: session.clone(),
            templates: self.inner.templates.clone(),
            found,
            pause_sleep: self.inner.config.pause_sleep,
            idle_sleep: self.inner.config.idle_sleep,
        };

        let handles = match worker::spawn_workers(&context) {
            Ok(handles) => handles,
            Err(e) => {
                *state = MinerState::Stopped;
                return Err(e);
            }
        };
        drop(context);

        self.inner.runtime.spawn(submit_blocks(
            Arc::downgrade(&self.inner),
            self.inner.backend.clone(),
            found_rx,
        ));

        self.inner.workers.lock().extend(handles);
        self.inner.hashrate.lock().reset();
        self.inner.session.lock().replace(session.clone());
        *self.inner.maintenance.lock() = Maintenance::new(&self.inner.config);
        *self.inner.status.lock() = MinerStatus::Mining;
        *state = MinerState::Running;

        info!(session = %session.id(), threads, "Mining started");
        Ok(())
    }

    /// Stop mining; idempotent
    ///
    /// Waits up to `stop_timeout` for the workers. Threads still alive after
    /// that are logged and kept, and `start` refuses until they exit.
    pub fn stop(&self) {
        {
            let mut state = self.inner.state.lock();
            match *state {
                MinerState::Stopped | MinerState::Stopping => return,
                MinerState::Starting => {
                    *state = MinerState::Stopped;
                    return;
                }
                MinerState::Running | MinerState::Paused => *state = MinerState::Stopping,
            }
        }

        if let Some(session) = self.inner.session.lock().take() {
            session.stop();
            debug!(session = %session.id(), "Stop requested");
        }

        let handles = std::mem::take(&mut *self.inner.workers.lock());
        let stragglers = worker::join_with_timeout(handles, self.inner.config.stop_timeout);
        if !stragglers.is_empty() {
            warn!(
                "{} worker threads did not stop within {:?}",
                stragglers.len(),
                self.inner.config.stop_timeout
            );
            self.inner.workers.lock().extend(stragglers);
        }

        self.inner.hashrate.lock().reset();
        {
            let mut status = self.inner.status.lock();
            if *status == MinerStatus::Mining {
                *status = MinerStatus::Idle;
            }
        }
        *self.inner.state.lock() = MinerState::Stopped;
        info!("Mining stopped");
    }

    /// [`Miner::stop`] for async callers; the worker join runs on the
    /// blocking pool so no runtime thread is held
    pub async fn stop_async(&self) {
        let miner = self.clone();
        if let Err(e) = tokio::task::spawn_blocking(move || miner.stop()).await {
            warn!("Stop task failed: {}", e);
        }
    }

    /// Suspend hashing; balanced by [`Miner::resume`]
    pub fn pause(&self) {
        let Some(session) = self.session() else {
            debug!("Pause ignored, miner is not running");
            return;
        };
        let mut state = self.inner.state.lock();
        if session.pause() > 0 && *state == MinerState::Running {
            *state = MinerState::Paused;
        }
    }

    pub fn resume(&self) {
        let Some(session) = self.session() else {
            debug!("Resume ignored, miner is not running");
            return;
        };
        let mut state = self.inner.state.lock();
        if session.resume() == 0 && *state == MinerState::Paused {
            *state = MinerState::Running;
        }
    }

    /// Periodic maintenance: template refresh and hash rate merge
    pub async fn on_idle(&self) {
        if !self.is_mining() {
            return;
        }

        let now = Instant::now();
        let (merge_rate, refresh) = {
            let maintenance = self.inner.maintenance.lock();
            let merge_rate = now.duration_since(maintenance.last_hashrate)
                >= self.inner.config.hashrate_interval;
            let refresh = match maintenance.retry_at {
                Some(retry_at) => now >= retry_at,
                None => {
                    now.duration_since(maintenance.last_refresh)
                        >= self.inner.config.template_refresh_interval
                }
            };
            (merge_rate, refresh)
        };

        if merge_rate {
            self.merge_hashrate();
        }
        if refresh {
            self.maintain_template(false).await;
        }
    }

    /// The main chain moved; rebuild the template once the wallet settled
    pub async fn on_block_chain_update(&self) {
        if self.is_mining() {
            self.maintain_template(true).await;
        }
    }

    /// Node finished synchronizing; start a mining request made meanwhile
    pub async fn on_synchronized(&self) {
        self.inner.synchronized.store(true, Ordering::SeqCst);
        let pending = self.inner.pending_start.lock().take();
        if let Some((address, threads)) = pending {
            info!("Node synchronized, starting requested mining");
            if let Err(e) = self.start(&address, threads).await {
                warn!("Deferred mining start failed: {}", e);
            }
        }
    }

    /// Node fell behind the network; mining resumes on [`Miner::on_synchronized`]
    pub async fn on_synchronization_lost(&self) {
        if !self.inner.synchronized.swap(false, Ordering::SeqCst) {
            return;
        }
        let target = self.inner.target.lock().clone();
        if self.is_mining() {
            if let Some(target) = target {
                info!("Node is synchronizing, suspending mining");
                *self.inner.pending_start.lock() = Some((target.address, target.threads));
            }
            self.stop_async().await;
            *self.inner.status.lock() = MinerStatus::WaitingForSync;
        }
    }

    pub fn set_stake_mixin(&self, mixin: u32) {
        self.inner.stake.lock().mixin = mixin;
    }

    /// Stake used by the next template; `None` commits the base stake
    pub fn set_stake_amount(&self, amount: Option<Amount>) {
        self.inner.stake.lock().amount = amount;
    }

    /// Rolling hash rate, 0 when not mining
    pub fn speed(&self) -> HashRate {
        if !self.is_mining() {
            return HashRate::new(0.0);
        }
        HashRate::new(self.inner.hashrate.lock().rate())
    }

    pub fn state(&self) -> MinerState {
        *self.inner.state.lock()
    }

    pub fn status(&self) -> MinerStatus {
        self.inner.status.lock().clone()
    }

    pub fn is_mining(&self) -> bool {
        matches!(self.state(), MinerState::Running | MinerState::Paused)
    }

    /// Current value of the session's pause counter
    pub fn pause_count(&self) -> u32 {
        self.session().map(|s| s.pause_count()).unwrap_or(0)
    }

    /// Worker threads still registered, including stragglers
    pub fn thread_count(&self) -> usize {
        self.inner.workers.lock().len()
    }

    pub fn template_version(&self) -> u64 {
        self.inner.templates.version()
    }

    pub fn blocks_found(&self) -> u64 {
        self.inner.blocks_found.load(Ordering::Relaxed)
    }

    fn session(&self) -> Option<Arc<MiningSession>> {
        self.inner.session.lock().clone()
    }

    /// Join finished workers, returning how many are still alive
    fn reap_workers(&self) -> usize {
        let mut workers = self.inner.workers.lock();
        let remaining = worker::join_with_timeout(std::mem::take(&mut *workers), Duration::ZERO);
        *workers = remaining;
        workers.len()
    }

    fn merge_hashrate(&self) {
        let Some(session) = self.session() else {
            return;
        };
        let rate = self.inner.hashrate.lock().tick(session.take_hashes());
        self.inner.maintenance.lock().last_hashrate = Instant::now();
        debug!(rate, "Hash rate sample");
    }

    async fn refresh_template(&self, wait_for_wallet_refresh: bool) -> Result<u64> {
        let target = self
            .inner
            .target
            .lock()
            .clone()
            .ok_or_else(|| Error::invalid_state("no mining address"))?;
        let stake = *self.inner.stake.lock();

        let request = TemplateRequest {
            backend: self.inner.backend.as_ref(),
            wallet: self.inner.wallet.as_ref(),
            currency: &self.inner.currency,
            address: &target.address,
            account: &target.account,
            stake_amount: stake.amount,
            mixin: stake.mixin,
        };

        let version = request_block_template(
            &request,
            &self.inner.templates,
            wait_for_wallet_refresh,
            self.inner.config.wallet_settle_interval,
        )
        .await?;

        if let Some(session) = self.session() {
            session.wake();
        }
        Ok(version)
    }

    /// Refresh while mining, applying the failure policy
    async fn maintain_template(&self, wait_for_wallet_refresh: bool) {
        self.inner.maintenance.lock().last_refresh = Instant::now();

        match self.refresh_template(wait_for_wallet_refresh).await {
            Ok(_) => {
                if self.is_mining() {
                    *self.inner.status.lock() = MinerStatus::Mining;
                }
                let mut maintenance = self.inner.maintenance.lock();
                maintenance.failures = 0;
                maintenance.backoff.reset();
                maintenance.retry_at = None;
            }
            Err(e) => {
                self.record_failure(&e);
                if matches!(e, Error::InsufficientStake { .. }) {
                    error!("Stopping mining: {}", e);
                    self.stop_async().await;
                    return;
                }
                if !e.is_retryable() {
                    error!(
                        category = e.category(),
                        "Stopping mining, block template cannot be built: {}", e
                    );
                    self.stop_async().await;
                    return;
                }

                let give_up = {
                    let mut maintenance = self.inner.maintenance.lock();
                    maintenance.failures += 1;
                    if maintenance.failures >= self.inner.config.max_template_failures {
                        true
                    } else {
                        let delay = maintenance.backoff.next_delay();
                        maintenance.retry_at = Some(Instant::now() + delay);
                        warn!(
                            attempt = maintenance.failures,
                            category = e.category(),
                            "Block template refresh failed, retrying in {:?}: {}",
                            delay,
                            e
                        );
                        false
                    }
                };

                if give_up {
                    error!("Stopping mining after repeated template failures: {}", e);
                    self.stop_async().await;
                }
            }
        }
    }

    fn record_failure(&self, e: &Error) {
        let status = match e {
            Error::InsufficientStake {
                required,
                available,
            } => MinerStatus::StakeUnaffordable {
                required: *required,
                available: *available,
            },
            other => MinerStatus::TemplateUnavailable {
                reason: other.to_string(),
            },
        };
        *self.inner.status.lock() = status;
    }
}

/// Hand solved blocks to the backend until all workers are gone
async fn submit_blocks(
    miner: Weak<Inner>,
    backend: Arc<dyn MiningBackend>,
    mut found: mpsc::UnboundedReceiver<Block>,
) {
    while let Some(block) = found.recv().await {
        match backend.submit_block(block).await {
            Ok(()) => {
                let Some(inner) = miner.upgrade() else {
                    break;
                };
                let total = inner.blocks_found.fetch_add(1, Ordering::Relaxed) + 1;
                info!(total, "Block accepted");

                let miner = Miner { inner };
                if miner.is_mining() {
                    miner.maintain_template(false).await;
                }
            }
            Err(e) => warn!("Block submission failed: {}", e),
        }
    }
    debug!("Block submitter finished");
}
