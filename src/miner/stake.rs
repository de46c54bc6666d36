//! Stake selection

use crate::currency::CurrencyParameters;
use crate::{Amount, Difficulty};

/// Stake committed by one block template
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StakeParameters {
    /// Stake required by the chain for the next block
    pub base_stake: Amount,
    /// Stake actually locked, within `[base_stake, base_stake * max_stake_multiplier]`
    pub chosen_stake: Amount,
    /// Ring size of the stake transaction inputs
    pub mixin: u32,
    /// Blocks the stake stays locked
    pub deposit_term: u32,
}

impl StakeParameters {
    /// Resolve the stake a miner commits
    ///
    /// Without an explicit amount the base stake is used.
    pub fn new(
        currency: &CurrencyParameters,
        base_stake: Amount,
        requested: Option<Amount>,
        mixin: u32,
    ) -> Self {
        let chosen_stake = currency.effective_stake(base_stake, requested.unwrap_or(base_stake));
        Self {
            base_stake,
            chosen_stake,
            mixin,
            deposit_term: currency.stake_deposit_term(base_stake, chosen_stake),
        }
    }

    /// Difficulty the template must meet for this stake
    pub fn difficulty(
        &self,
        currency: &CurrencyParameters,
        base_difficulty: Difficulty,
    ) -> Difficulty {
        currency.stake_difficulty(base_difficulty, self.base_stake, self.chosen_stake)
    }
}
