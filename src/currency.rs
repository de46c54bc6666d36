//! Currency parameters
//!
//! Network constants injected into nodes and the miner. Nothing in the crate
//! reads these from a global; callers build one value and pass it down.

use crate::extra::{read_varint, write_varint};
use crate::{AccountAddress, Amount, Difficulty, Error, Result};
use blake2::{Blake2s256, Digest};
use serde::{Deserialize, Serialize};

/// Block major versions whose blocks are merge-mined through a parent block
pub const MERGE_MINING_MAJOR_VERSIONS: [u8; 2] = [2, 3];

/// Network constants
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CurrencyParameters {
    /// Ticker shown in logs
    pub ticker: String,

    /// Public address base prefix
    pub address_prefix: u64,

    /// Blocks a mined output stays locked
    pub mined_money_unlock_window: u32,

    /// Default ring size for stake transactions
    pub default_mixin: u32,

    /// Upper bound of the chosen stake relative to the base stake
    pub max_stake_multiplier: u64,

    /// Shortest stake deposit term, in blocks
    pub min_stake_term: u32,

    /// Longest stake deposit term, in blocks
    pub max_stake_term: u32,

    /// Minimal transaction fee
    pub minimal_fee: Amount,

    /// Block major version produced by the regtest engine
    pub regtest_block_major_version: u8,

    /// Fixed difficulty of the regtest engine
    pub regtest_difficulty: Difficulty,

    /// Base stake required by the regtest engine
    pub regtest_base_stake: Amount,

    /// Block reward paid by the regtest engine
    pub regtest_block_reward: Amount,
}

impl Default for CurrencyParameters {
    fn default() -> Self {
        Self {
            ticker: "krb".to_string(),
            address_prefix: 111,
            mined_money_unlock_window: 10,
            default_mixin: 3,
            max_stake_multiplier: 10,
            min_stake_term: 10,
            max_stake_term: 10 * 24 * 30,
            minimal_fee: 100_000_000,
            regtest_block_major_version: 5,
            regtest_difficulty: 1_000,
            regtest_base_stake: 1_000_000_000_000,
            regtest_block_reward: 10_000_000_000_000,
        }
    }
}

fn address_checksum(body: &[u8]) -> [u8; 4] {
    let digest = Blake2s256::digest(body);
    let mut checksum = [0u8; 4];
    checksum.copy_from_slice(&digest[..4]);
    checksum
}

impl CurrencyParameters {
    /// Unlock height for an output mined at `height`
    pub fn unlock_height(&self, height: u32) -> u64 {
        u64::from(height) + u64::from(self.mined_money_unlock_window)
    }

    /// Whether blocks of this major version carry a merge-mining tag
    pub fn is_merge_mined(&self, major_version: u8) -> bool {
        MERGE_MINING_MAJOR_VERSIONS.contains(&major_version)
    }

    /// Largest stake the miner may commit for the given base stake
    pub fn max_stake(&self, base_stake: Amount) -> Amount {
        base_stake.saturating_mul(self.max_stake_multiplier.max(1))
    }

    /// Chosen stake clamped to `[base_stake, max_stake(base_stake)]`
    pub fn effective_stake(&self, base_stake: Amount, chosen_stake: Amount) -> Amount {
        chosen_stake.clamp(base_stake, self.max_stake(base_stake))
    }

    /// Difficulty a miner committing `chosen_stake` has to meet
    ///
    /// `base_difficulty * base_stake / effective_stake`, never below 1.
    pub fn stake_difficulty(
        &self,
        base_difficulty: Difficulty,
        base_stake: Amount,
        chosen_stake: Amount,
    ) -> Difficulty {
        if base_stake == 0 {
            return base_difficulty.max(1);
        }
        let effective = self.effective_stake(base_stake, chosen_stake);
        let scaled = u128::from(base_difficulty) * u128::from(base_stake) / u128::from(effective);
        (scaled as u64).max(1)
    }

    /// Lowest difficulty any admissible stake can reach
    pub fn min_stake_difficulty(
        &self,
        base_difficulty: Difficulty,
        base_stake: Amount,
    ) -> Difficulty {
        self.stake_difficulty(base_difficulty, base_stake, self.max_stake(base_stake))
    }

    /// Deposit term, in blocks, of a stake of `amount`
    ///
    /// Smaller stakes lock for longer, within `[min_stake_term, max_stake_term]`.
    pub fn stake_deposit_term(&self, base_stake: Amount, amount: Amount) -> u32 {
        if amount == 0 {
            return self.max_stake_term;
        }
        let term = u128::from(self.min_stake_term) * u128::from(base_stake) / u128::from(amount);
        let term = u32::try_from(term).unwrap_or(u32::MAX);
        term.clamp(self.min_stake_term, self.max_stake_term.max(self.min_stake_term))
    }

    /// Encode an address as hex of prefix, keys and checksum
    pub fn format_address(&self, address: &AccountAddress) -> String {
        let mut body = Vec::with_capacity(72);
        write_varint(&mut body, self.address_prefix);
        body.extend_from_slice(&address.spend_public_key);
        body.extend_from_slice(&address.view_public_key);
        let checksum = address_checksum(&body);
        body.extend_from_slice(&checksum);
        hex::encode(body)
    }

    /// Parse an address produced by [`CurrencyParameters::format_address`]
    pub fn parse_address(&self, address: &str) -> Result<AccountAddress> {
        let bytes = hex::decode(address.trim())
            .map_err(|e| Error::invalid_address(format!("Invalid hex in address: {}", e)))?;

        if bytes.len() < 4 {
            return Err(Error::invalid_address("Address too short"));
        }
        let (body, checksum) = bytes.split_at(bytes.len() - 4);
        if address_checksum(body) != checksum {
            return Err(Error::invalid_address("Address checksum mismatch"));
        }

        let mut pos = 0;
        let prefix = read_varint(body, &mut pos)
            .map_err(|_| Error::invalid_address("Malformed address prefix"))?;
        if prefix != self.address_prefix {
            return Err(Error::invalid_address(format!(
                "Wrong address prefix: expected {}, got {}",
                self.address_prefix, prefix
            )));
        }

        let keys = &body[pos..];
        if keys.len() != 64 {
            return Err(Error::invalid_address(format!(
                "Invalid key length: expected 64 bytes, got {}",
                keys.len()
            )));
        }

        let mut result = AccountAddress::default();
        result.spend_public_key.copy_from_slice(&keys[..32]);
        result.view_public_key.copy_from_slice(&keys[32..]);
        Ok(result)
    }
}
