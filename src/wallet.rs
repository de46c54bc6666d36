//! Wallet collaborators
//!
//! The miner only needs two things from a wallet: how much it can spend and
//! a stake transaction to use as the block's base transaction.
//! [`RegtestWallet`] supplies both for the embedded regtest chain.

use crate::crypto::fast_hash;
use crate::currency::CurrencyParameters;
use crate::extra::add_public_key;
use crate::node::Node;
use crate::{Amount, Error, Result, SecretKey, Transaction};
use async_trait::async_trait;
use byteorder::{LittleEndian, WriteBytesExt};
use rand::RngCore;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Wallet operations used by the miner
#[async_trait]
pub trait StakeWallet: Send + Sync {
    /// Balance that can be spent right now
    async fn spendable_balance(&self) -> Amount;

    /// Build a stake transaction locking `stake` until `unlock_height`
    async fn stake_transaction(
        &self,
        address: &str,
        stake: Amount,
        reward: Amount,
        mixin: u32,
        unlock_height: u64,
    ) -> Result<(Transaction, SecretKey)>;
}

/// Wallet-side view of a node
///
/// Created by [`Node::create_wallet`]. The handle keeps the node alive; the
/// node keeps no reference back.
#[derive(Clone)]
pub struct WalletHandle {
    id: Uuid,
    node: Arc<dyn Node>,
}

impl fmt::Debug for WalletHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalletHandle")
            .field("id", &self.id)
            .field("node", &self.node.name())
            .finish()
    }
}

impl WalletHandle {
    pub fn new(node: Arc<dyn Node>) -> Self {
        let id = Uuid::new_v4();
        debug!(%id, node = node.name(), "Wallet handle created");
        Self { id, node }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Node this handle queries
    pub fn node(&self) -> &Arc<dyn Node> {
        &self.node
    }

    /// Height the wallet can synchronize to
    pub async fn sync_height(&self) -> u64 {
        self.node.last_known_block_height().await
    }

    /// Fee the wallet should attach to transfers
    pub async fn minimal_fee(&self) -> Amount {
        self.node.minimal_fee().await
    }

    /// Transaction extra for a payment id
    pub fn payment_id_extra(&self, payment_id: &str) -> Result<Vec<u8>> {
        self.node.convert_payment_id(payment_id)
    }
}

/// Wallet with a configured balance, producing stake transactions for the
/// regtest chain
#[derive(Debug)]
pub struct RegtestWallet {
    currency: CurrencyParameters,
    balance: AtomicU64,
}

impl RegtestWallet {
    pub fn new(currency: CurrencyParameters, balance: Amount) -> Self {
        Self {
            currency,
            balance: AtomicU64::new(balance),
        }
    }

    /// Replace the spendable balance
    pub fn set_balance(&self, balance: Amount) {
        self.balance.store(balance, Ordering::SeqCst);
    }
}

#[async_trait]
impl StakeWallet for RegtestWallet {
    async fn spendable_balance(&self) -> Amount {
        self.balance.load(Ordering::SeqCst)
    }

    async fn stake_transaction(
        &self,
        address: &str,
        stake: Amount,
        reward: Amount,
        mixin: u32,
        unlock_height: u64,
    ) -> Result<(Transaction, SecretKey)> {
        let available = self.balance.load(Ordering::SeqCst);
        if available < stake {
            return Err(Error::InsufficientStake {
                required: stake,
                available,
            });
        }
        self.currency
            .parse_address(address)
            .map_err(|e| Error::wallet(format!("Cannot stake to {}: {}", address, e)))?;

        let mut rng = rand::rng();
        let mut secret = [0u8; 32];
        rng.fill_bytes(&mut secret);
        let public = fast_hash(&secret);

        let mut extra = Vec::with_capacity(33);
        add_public_key(&mut extra, public.as_bytes());

        let mut payload = Vec::with_capacity(52);
        payload.write_u64::<LittleEndian>(stake)?;
        payload.write_u64::<LittleEndian>(reward)?;
        payload.write_u32::<LittleEndian>(mixin)?;
        payload.extend_from_slice(fast_hash(address.as_bytes()).as_bytes());

        debug!(stake, reward, mixin, unlock_height, "Built stake transaction");

        Ok((
            Transaction {
                version: 1,
                unlock_time: unlock_height,
                extra,
                payload,
            },
            SecretKey(secret),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extra::{parse_extra, ExtraField};
    use crate::AccountAddress;

    fn address(currency: &CurrencyParameters) -> String {
        currency.format_address(&AccountAddress {
            spend_public_key: [5u8; 32],
            view_public_key: [6u8; 32],
        })
    }

    #[tokio::test]
    async fn test_stake_transaction() {
        let currency = CurrencyParameters::default();
        let wallet = RegtestWallet::new(currency.clone(), 1_000);

        let (tx, key) = wallet
            .stake_transaction(&address(&currency), 600, 50, 3, 110)
            .await
            .unwrap();

        assert_eq!(tx.unlock_time, 110);
        assert_eq!(&tx.payload[..8], &600u64.to_le_bytes());
        assert!(matches!(
            parse_extra(&tx.extra).unwrap().as_slice(),
            [ExtraField::PublicKey(_)]
        ));
        assert_ne!(key.0, [0u8; 32]);
    }

    #[tokio::test]
    async fn test_stake_transaction_insufficient_balance() {
        let currency = CurrencyParameters::default();
        let wallet = RegtestWallet::new(currency.clone(), 10);
        assert_eq!(wallet.spendable_balance().await, 10);

        let err = wallet
            .stake_transaction(&address(&currency), 600, 50, 3, 110)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::InsufficientStake {
                required: 600,
                available: 10
            }
        ));

        wallet.set_balance(600);
        assert!(wallet
            .stake_transaction(&address(&currency), 600, 50, 3, 110)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_stake_transaction_bad_address() {
        let wallet = RegtestWallet::new(CurrencyParameters::default(), 1_000);
        let err = wallet
            .stake_transaction("deadbeef", 1, 1, 3, 10)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Wallet { .. }));
    }
}
