//! Core protocol types shared by the pure components and the coordinator

use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Serialize, Serializer};
use sha3::{Digest, Keccak256};
use std::fmt;

/// Ledger identifier
pub type ChainId = u64;

/// 32-byte hash value (keccak256 output, ids, roots)
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Hash32(pub [u8; 32]);

impl Hash32 {
    pub const ZERO: Hash32 = Hash32([0u8; 32]);

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse a 0x-prefixed or bare hex string of exactly 32 bytes
    pub fn from_hex(input: &str) -> Option<Self> {
        let bytes = hex::decode(input.trim_start_matches("0x")).ok()?;
        let arr: [u8; 32] = bytes.try_into().ok()?;
        Some(Hash32(arr))
    }
}

impl fmt::Display for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

impl fmt::Debug for Hash32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(&self.0[..6]))
    }
}

impl Serialize for Hash32 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

/// keccak256 over a canonical byte encoding
pub fn keccak256(data: &[u8]) -> Hash32 {
    let mut out = [0u8; 32];
    out.copy_from_slice(&Keccak256::digest(data));
    Hash32(out)
}

/// Account on either ledger, left-padded to 32 bytes
pub type Address = Hash32;

/// Order identifier assigned by the source ledger
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize)]
pub struct OrderId(pub Hash32);

impl fmt::Display for OrderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.0)
    }
}

/// Escrow instance identity (derived address)
pub type EscrowAddress = Hash32;

/// Transaction hash on a ledger
pub type TxHash = Hash32;

/// keccak256 of a secret preimage
pub type SecretHash = Hash32;

/// 32-byte secret preimage. Debug output never shows the bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(pub [u8; 32]);

impl Secret {
    /// Fresh secret from the OS random source
    pub fn random() -> Self {
        let mut bytes = [0u8; 32];
        OsRng.fill_bytes(&mut bytes);
        Secret(bytes)
    }

    pub fn hash(&self) -> SecretHash {
        keccak256(&self.0)
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Secret(..)")
    }
}

/// Which leg of the swap an escrow belongs to
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Src,
    Dst,
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Side::Src => f.write_str("src"),
            Side::Dst => f.write_str("dst"),
        }
    }
}

/// Order-level hash commitment
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HashLockCommitment {
    Single { hash: SecretHash },
    Multi { merkle_root: Hash32, leaf_count: u32 },
}

/// Escrow-level hash lock: a single hash, or the Merkle root plus the
/// disclosure index accepted for this fill
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HashLock {
    Single(SecretHash),
    Merkle { root: Hash32, index: u32 },
}

impl HashLock {
    /// 64-byte canonical encoding (hash word ‖ index word)
    pub fn encode(&self) -> [u8; 64] {
        let mut out = [0u8; 64];
        match self {
            HashLock::Single(hash) => {
                out[..32].copy_from_slice(hash.as_bytes());
            }
            HashLock::Merkle { root, index } => {
                out[..32].copy_from_slice(root.as_bytes());
                out[60..].copy_from_slice(&index.to_be_bytes());
                // Distinguish a Merkle lock at index 0 from a single hash
                out[32] = 1;
            }
        }
        out
    }
}

/// An announced order
#[derive(Clone, Debug)]
pub struct Order {
    pub order_id: OrderId,
    pub maker: Address,
    pub total_amount: u64,
    pub start_price: u64,
    pub reserve_price: u64,
    /// Auction duration in seconds
    pub auction_duration: u64,
    /// Source-chain block timestamp of the announcement
    pub created_at: u64,
    pub parts_count: u32,
    pub commitment: HashLockCommitment,
}

/// An accepted fill
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct FillRecord {
    pub order_id: OrderId,
    pub fill_amount: u64,
    pub cumulative_filled: u64,
    pub disclosed_index: u32,
}
