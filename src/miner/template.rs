//! Block template management
//!
//! [`TemplateStore`] holds the one current template behind a lock. Every
//! successful [`TemplateStore::set_block_template`] bumps the version and
//! draws a fresh starter nonce; workers compare versions and copy a
//! [`TemplateSnapshot`] when it changes.
//!
//! [`request_block_template`] assembles a new template from the backend and
//! the wallet. It does not retry; the miner decides what a failure means.

use super::stake::StakeParameters;
use crate::crypto::aux_header_hash;
use crate::currency::CurrencyParameters;
use crate::extra::{append_merge_mining_tag, MergeMiningTag};
use crate::node::MiningBackend;
use crate::wallet::StakeWallet;
use crate::{AccountAddress, Amount, Block, Difficulty, Error, Result};
use parking_lot::Mutex;
use rand::Rng;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::{debug, info};

/// Copy of the current template taken by a worker
#[derive(Debug, Clone)]
pub struct TemplateSnapshot {
    pub block: Block,
    pub difficulty: Difficulty,
    pub version: u64,
    pub starter_nonce: u32,
    pub merge_mined: bool,
}

#[derive(Debug, Default)]
struct TemplateState {
    block: Option<Block>,
    difficulty: Difficulty,
    version: u64,
    starter_nonce: u32,
}

/// The current block template
#[derive(Debug)]
pub struct TemplateStore {
    currency: CurrencyParameters,
    state: Mutex<TemplateState>,
    // Mirrors `state.version`, written under the lock
    version: AtomicU64,
}

impl TemplateStore {
    pub fn new(currency: CurrencyParameters) -> Self {
        Self {
            currency,
            state: Mutex::new(TemplateState::default()),
            version: AtomicU64::new(0),
        }
    }

    /// Publish a new template
    ///
    /// Merge-mined versions get their parent block's base transaction extra
    /// replaced by a merge-mining tag committing to the block. On error
    /// nothing is published. Returns the new version.
    pub fn set_block_template(&self, mut block: Block, difficulty: Difficulty) -> Result<u64> {
        let mut state = self.state.lock();

        if self.currency.is_merge_mined(block.header.major_version) {
            let tag = MergeMiningTag {
                depth: 0,
                merkle_root: aux_header_hash(&block),
            };
            let mut extra = Vec::with_capacity(35);
            append_merge_mining_tag(&mut extra, &tag)?;
            block.parent_block.base_transaction.extra = extra;
        }

        state.block = Some(block);
        state.difficulty = difficulty;
        state.version += 1;
        state.starter_nonce = rand::rng().random();
        self.version.store(state.version, Ordering::Release);

        debug!(
            version = state.version,
            difficulty,
            starter_nonce = state.starter_nonce,
            "Block template updated"
        );
        Ok(state.version)
    }

    /// Number of templates published so far
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Copy of the current template, if any
    pub fn snapshot(&self) -> Option<TemplateSnapshot> {
        let state = self.state.lock();
        let block = state.block.clone()?;
        Some(TemplateSnapshot {
            merge_mined: self.currency.is_merge_mined(block.header.major_version),
            block,
            difficulty: state.difficulty,
            version: state.version,
            starter_nonce: state.starter_nonce,
        })
    }

    pub fn difficulty(&self) -> Difficulty {
        self.state.lock().difficulty
    }
}

/// Everything needed to assemble a template for one mining address
pub struct TemplateRequest<'a> {
    pub backend: &'a dyn MiningBackend,
    pub wallet: &'a dyn StakeWallet,
    pub currency: &'a CurrencyParameters,
    pub address: &'a str,
    pub account: &'a AccountAddress,
    pub stake_amount: Option<Amount>,
    pub mixin: u32,
}

/// Build and publish a new template
///
/// With `wait_for_wallet_refresh` the call first sleeps `settle` so the
/// wallet can observe the latest block before it picks stake outputs.
pub async fn request_block_template(
    request: &TemplateRequest<'_>,
    store: &TemplateStore,
    wait_for_wallet_refresh: bool,
    settle: Duration,
) -> Result<u64> {
    if wait_for_wallet_refresh {
        tokio::time::sleep(settle).await;
    }

    let template = request
        .backend
        .prepare_block_template(request.account)
        .await?;
    let mut block = template.block;

    let requirement = request
        .backend
        .get_stake(
            block.header.major_version,
            template.fee,
            template.median_size,
            template.already_generated_coins,
            template.txs_size,
        )
        .await?;

    let stake = StakeParameters::new(
        request.currency,
        requirement.stake,
        request.stake_amount,
        request.mixin,
    );

    let available = request.wallet.spendable_balance().await;
    if available < stake.chosen_stake {
        return Err(Error::InsufficientStake {
            required: stake.chosen_stake,
            available,
        });
    }

    let (transaction, _key) = request
        .wallet
        .stake_transaction(
            request.address,
            stake.chosen_stake,
            requirement.reward,
            stake.mixin,
            request.currency.unlock_height(template.height),
        )
        .await?;
    block.base_transaction = transaction;

    let difficulty = stake.difficulty(request.currency, template.difficulty);
    let version = store.set_block_template(block, difficulty)?;

    info!(
        height = template.height,
        stake = stake.chosen_stake,
        reward = requirement.reward,
        difficulty,
        version,
        "New block template"
    );
    Ok(version)
}
