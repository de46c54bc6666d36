//! Single-node regtest chain
//!
//! Append-only chain with a fixed base difficulty and stake, persisted
//! through a [`ChainStorage`]. It checks that a submitted block extends the
//! tip and meets the lowest stake-weighted difficulty; it does not validate
//! transactions.

use super::{BlockchainEngine, ChainStorage, StoredBlock};
use crate::crypto::{aux_header_hash, check_hash, fast_hash, pow_hash};
use crate::currency::CurrencyParameters;
use crate::extra::merge_mining_tag;
use crate::node::events::{EventSink, NodeEvent};
use crate::node::{BlockTemplateData, StakeRequirement};
use crate::{
    AccountAddress, Amount, Block, BlockHeader, Difficulty, Error, Hash, ParentBlock, Result,
};
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use tracing::{debug, info};

/// Regtest blockchain engine
pub struct RegtestChain {
    currency: CurrencyParameters,
    storage: Arc<dyn ChainStorage>,
    blocks: RwLock<Vec<StoredBlock>>,
    observer: Mutex<Option<EventSink>>,
}

impl RegtestChain {
    pub fn new(storage: Arc<dyn ChainStorage>, currency: CurrencyParameters) -> Self {
        Self {
            currency,
            storage,
            blocks: RwLock::new(Vec::new()),
            observer: Mutex::new(None),
        }
    }

    fn genesis(&self) -> StoredBlock {
        let header = BlockHeader {
            major_version: self.currency.regtest_block_major_version,
            ..Default::default()
        };
        let mut blob = Vec::new();
        header.write_blob(&mut blob);

        StoredBlock {
            index: 0,
            hash: fast_hash(&blob),
            previous_hash: Hash::ZERO,
            timestamp: 0,
            major_version: header.major_version,
            difficulty: 1,
            reward: 0,
            already_generated_coins: 0,
            tx_count: 1,
        }
    }

    fn notify(&self, event: NodeEvent) {
        if let Some(observer) = self.observer.lock().as_ref() {
            observer.emit(event);
        }
    }

    fn top(&self) -> Option<StoredBlock> {
        self.blocks.read().last().cloned()
    }
}

impl BlockchainEngine for RegtestChain {
    fn load(&self) -> Result<()> {
        let mut loaded = self.storage.load_blocks()?;
        if loaded.is_empty() {
            let genesis = self.genesis();
            self.storage.append_block(&genesis)?;
            loaded.push(genesis);
        }
        info!("Loaded regtest chain with {} blocks", loaded.len());
        *self.blocks.write() = loaded;
        Ok(())
    }

    fn rewind(&self, height: u64) -> Result<()> {
        let mut blocks = self.blocks.write();
        let keep = usize::try_from(height.saturating_add(1)).unwrap_or(usize::MAX);
        if keep >= blocks.len() {
            debug!("Rewind to {} is a no-op at height {}", height, blocks.len());
            return Ok(());
        }
        self.storage.truncate(keep)?;
        blocks.truncate(keep);
        drop(blocks);

        info!("Rewound chain to height {}", height);
        self.notify(NodeEvent::LocalHeightChanged(height));
        Ok(())
    }

    fn shutdown(&self) {
        *self.observer.lock() = None;
        debug!("Regtest engine released");
    }

    fn subscribe(&self, events: EventSink) {
        *self.observer.lock() = Some(events);
    }

    fn top_height(&self) -> u64 {
        self.top().map(|block| block.index).unwrap_or_default()
    }

    fn top_timestamp(&self) -> u64 {
        self.top().map(|block| block.timestamp).unwrap_or_default()
    }

    fn difficulty_for_next_block(&self) -> Difficulty {
        self.currency.regtest_difficulty
    }

    fn tx_count(&self) -> u64 {
        self.blocks.read().iter().map(|block| block.tx_count).sum()
    }

    fn tx_pool_size(&self) -> u64 {
        0
    }

    fn alt_blocks_count(&self) -> u64 {
        0
    }

    fn minimal_fee(&self) -> Amount {
        self.currency.minimal_fee
    }

    fn already_generated_coins(&self) -> Amount {
        self.top()
            .map(|block| block.already_generated_coins)
            .unwrap_or_default()
    }

    fn current_block_major_version(&self) -> u8 {
        self.currency.regtest_block_major_version
    }

    fn block_template(&self, address: &AccountAddress) -> Result<BlockTemplateData> {
        let top = self
            .top()
            .ok_or_else(|| Error::template("chain is not loaded"))?;

        let major_version = self.current_block_major_version();
        let timestamp = (chrono::Utc::now().timestamp().max(0) as u64).max(top.timestamp + 1);

        debug!(
            spend_key = %hex::encode(address.spend_public_key),
            height = top.index + 1,
            "Preparing block template"
        );

        let block = Block {
            header: BlockHeader {
                major_version,
                minor_version: 0,
                timestamp,
                previous_block_hash: top.hash,
                nonce: 0,
            },
            parent_block: ParentBlock {
                major_version: 1,
                minor_version: 0,
                previous_block_hash: top.hash,
                transaction_count: 1,
                ..Default::default()
            },
            ..Default::default()
        };

        Ok(BlockTemplateData {
            block,
            difficulty: self.difficulty_for_next_block(),
            height: u32::try_from(top.index + 1)
                .map_err(|_| Error::template("chain height exceeds u32"))?,
            fee: 0,
            median_size: 0,
            txs_size: 0,
            already_generated_coins: top.already_generated_coins,
        })
    }

    fn stake_requirement(
        &self,
        major_version: u8,
        fee: Amount,
        _median_size: usize,
        _already_generated_coins: Amount,
        _txs_size: usize,
    ) -> Result<StakeRequirement> {
        if major_version != self.current_block_major_version() {
            return Err(Error::template(format!(
                "Unexpected block major version {}",
                major_version
            )));
        }
        Ok(StakeRequirement {
            stake: self.currency.regtest_base_stake,
            reward: self.currency.regtest_block_reward.saturating_add(fee),
        })
    }

    fn submit_block(&self, block: &Block) -> Result<u64> {
        let merge_mined = self.currency.is_merge_mined(block.header.major_version);

        if merge_mined {
            let tag = merge_mining_tag(&block.parent_block.base_transaction.extra)?
                .ok_or_else(|| Error::block_rejected("missing merge-mining tag"))?;
            if tag.merkle_root != aux_header_hash(block) {
                return Err(Error::block_rejected("merge-mining tag does not commit to block"));
            }
        }

        let difficulty = self.currency.min_stake_difficulty(
            self.difficulty_for_next_block(),
            self.currency.regtest_base_stake,
        );
        if !check_hash(&pow_hash(block, merge_mined), difficulty) {
            return Err(Error::block_rejected("insufficient proof of work"));
        }

        let mut blocks = self.blocks.write();
        let top = blocks
            .last()
            .cloned()
            .ok_or_else(|| Error::invalid_state("chain is not loaded"))?;
        if block.header.previous_block_hash != top.hash {
            return Err(Error::block_rejected("block does not extend the main chain"));
        }

        let reward = self.currency.regtest_block_reward;
        let stored = StoredBlock {
            index: top.index + 1,
            hash: fast_hash(&block.to_blob()),
            previous_hash: top.hash,
            timestamp: block.header.timestamp,
            major_version: block.header.major_version,
            difficulty: self.difficulty_for_next_block(),
            reward,
            already_generated_coins: top.already_generated_coins.saturating_add(reward),
            tx_count: 1 + block.transaction_hashes.len() as u64,
        };
        self.storage.append_block(&stored)?;
        blocks.push(stored.clone());
        drop(blocks);

        info!(height = stored.index, hash = %stored.hash, "Block added to regtest chain");
        self.notify(NodeEvent::LocalHeightChanged(stored.index));
        Ok(stored.index)
    }
}
