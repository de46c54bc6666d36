//! Core chain types
//!
//! Blocks, transactions and keys exchanged between the node layer, the
//! wallet collaborator and the miner, with their binary blob encoding.

use crate::extra::write_varint;
use crate::{Error, Result};
use byteorder::{LittleEndian, WriteBytesExt};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Block difficulty
pub type Difficulty = u64;

/// Amount in atomic units
pub type Amount = u64;

/// 32-byte hash
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    /// All-zero hash
    pub const ZERO: Hash = Hash([0u8; 32]);

    /// Get the raw bytes
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Create from a byte slice of exactly 32 bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != 32 {
            return Err(Error::invalid_state(format!(
                "Invalid hash length: expected 32 bytes, got {}",
                bytes.len()
            )));
        }
        let mut array = [0u8; 32];
        array.copy_from_slice(bytes);
        Ok(Self(array))
    }

    /// Convert to lowercase hexadecimal string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl FromStr for Hash {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != 64 {
            return Err(Error::invalid_state(format!(
                "Invalid hash hex length: expected 64 chars, got {}",
                s.len()
            )));
        }
        let bytes = hex::decode(s)
            .map_err(|e| Error::invalid_state(format!("Invalid hex in hash: {}", e)))?;
        Self::from_slice(&bytes)
    }
}

impl fmt::Display for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({})", self.to_hex())
    }
}

impl Serialize for Hash {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Hash {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Hash::from_str(&s).map_err(serde::de::Error::custom)
    }
}

/// Block header fields covered by proof-of-work
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BlockHeader {
    pub major_version: u8,
    pub minor_version: u8,
    pub timestamp: u64,
    pub previous_block_hash: Hash,
    pub nonce: u32,
}

impl BlockHeader {
    /// Append the header blob
    pub fn write_blob(&self, out: &mut Vec<u8>) {
        write_varint(out, u64::from(self.major_version));
        write_varint(out, u64::from(self.minor_version));
        write_varint(out, self.timestamp);
        out.extend_from_slice(self.previous_block_hash.as_bytes());
        // Writing into a Vec cannot fail
        let _ = out.write_u32::<LittleEndian>(self.nonce);
    }
}

/// Transaction as far as the miner needs to see it
///
/// Inputs, outputs and signatures are carried opaquely in `payload`; only the
/// `extra` field is ever rewritten by this crate.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Transaction {
    pub version: u8,
    pub unlock_time: u64,
    pub extra: Vec<u8>,
    pub payload: Vec<u8>,
}

impl Transaction {
    /// Serialize the transaction blob
    pub fn to_blob(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16 + self.extra.len() + self.payload.len());
        write_varint(&mut out, u64::from(self.version));
        write_varint(&mut out, self.unlock_time);
        write_varint(&mut out, self.extra.len() as u64);
        out.extend_from_slice(&self.extra);
        out.extend_from_slice(&self.payload);
        out
    }
}

/// Parent block of a merge-mined block
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ParentBlock {
    pub major_version: u8,
    pub minor_version: u8,
    pub previous_block_hash: Hash,
    pub transaction_count: u16,
    pub base_transaction: Transaction,
}

impl ParentBlock {
    /// Append the parent block blob
    pub fn write_blob(&self, out: &mut Vec<u8>) {
        write_varint(out, u64::from(self.major_version));
        write_varint(out, u64::from(self.minor_version));
        out.extend_from_slice(self.previous_block_hash.as_bytes());
        write_varint(out, u64::from(self.transaction_count));
        out.extend_from_slice(&self.base_transaction.to_blob());
    }
}

/// Full block: header, parent block, base transaction and included tx hashes
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub parent_block: ParentBlock,
    pub base_transaction: Transaction,
    pub transaction_hashes: Vec<Hash>,
}

impl Block {
    /// Serialize the block blob
    pub fn to_blob(&self) -> Vec<u8> {
        let mut out = Vec::new();
        self.header.write_blob(&mut out);
        self.parent_block.write_blob(&mut out);
        out.extend_from_slice(&self.base_transaction.to_blob());
        write_varint(&mut out, self.transaction_hashes.len() as u64);
        for hash in &self.transaction_hashes {
            out.extend_from_slice(hash.as_bytes());
        }
        out
    }
}

/// Public account address: spend and view public keys
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct AccountAddress {
    pub spend_public_key: [u8; 32],
    pub view_public_key: [u8; 32],
}

/// Transaction secret key returned with a stake transaction
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKey(pub [u8; 32]);

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SecretKey(<redacted>)")
    }
}

/// Hash rate in hashes per second
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Default, Serialize, Deserialize)]
pub struct HashRate(pub f64);

impl HashRate {
    /// Create new hash rate
    pub fn new(rate: f64) -> Self {
        Self(rate)
    }

    /// Get the rate value
    pub fn value(&self) -> f64 {
        self.0
    }
}

impl fmt::Display for HashRate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 1_000_000_000.0 {
            write!(f, "{:.2}G H/s", self.0 / 1_000_000_000.0)
        } else if self.0 >= 1_000_000.0 {
            write!(f, "{:.2}M H/s", self.0 / 1_000_000.0)
        } else if self.0 >= 1_000.0 {
            write!(f, "{:.2}K H/s", self.0 / 1_000.0)
        } else {
            write!(f, "{:.2} H/s", self.0)
        }
    }
}
