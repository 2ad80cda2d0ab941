//! Hash primitives: double SHA-256, HASH160, transaction/block ids and Merkle roots

use crate::serialization::{serialize, Encodable};
use crate::types::*;
use bitcoin_hashes::{sha256d, Hash as BitcoinHash, HashEngine};
use ripemd::Ripemd160;
use sha2::{Digest, Sha256};

/// SHA256(SHA256(data))
pub fn double_sha256(data: &[u8]) -> Hash {
    let mut hasher = sha256d::Hash::engine();
    hasher.input(data);
    let result = sha256d::Hash::from_engine(hasher);
    let mut hash = [0u8; 32];
    hash.copy_from_slice(&result);
    hash
}

/// Double SHA-256 over the canonical encoding of `value`
pub fn hash_encodable<T: Encodable + ?Sized>(value: &T) -> Hash {
    double_sha256(&serialize(value))
}

/// RIPEMD160(SHA256(data)), the fingerprint used for owner lookups
pub fn hash160(data: &[u8]) -> [u8; 20] {
    let sha = Sha256::digest(data);
    let ripemd = Ripemd160::digest(sha);
    let mut out = [0u8; 20];
    out.copy_from_slice(&ripemd);
    out
}

/// CalculateTxId: hash of the canonical transaction encoding
pub fn calculate_tx_id(tx: &Transaction) -> Hash {
    hash_encodable(tx)
}

/// CalculateBlockHash: hash of the 80-byte header
pub fn calculate_block_hash(header: &BlockHeader) -> Hash {
    hash_encodable(header)
}

/// CalculateMerkleRoot: 𝒯𝒳* → ℍ
///
/// 1. Leaves are the transaction ids in block order
/// 2. Each level pairs adjacent hashes and double-hashes their concatenation
/// 3. A level with an odd count pairs its last hash with itself
/// 4. The single remaining hash is the root; an empty list yields zero
pub fn calculate_merkle_root(leaves: &[Hash]) -> Hash {
    if leaves.is_empty() {
        return [0u8; 32];
    }
    let mut level: Vec<Hash> = leaves.to_vec();
    while level.len() > 1 {
        let mut next = Vec::with_capacity((level.len() + 1) / 2);
        for pair in level.chunks(2) {
            let right = if pair.len() == 2 { &pair[1] } else { &pair[0] };
            let mut buf = [0u8; 64];
            buf[..32].copy_from_slice(&pair[0]);
            buf[32..].copy_from_slice(right);
            next.push(double_sha256(&buf));
        }
        level = next;
    }
    level[0]
}

/// Merkle root over a block's transactions
pub fn block_merkle_root(transactions: &[Transaction]) -> Hash {
    let ids: Vec<Hash> = transactions.iter().map(calculate_tx_id).collect();
    calculate_merkle_root(&ids)
}

/// Conventional display form: byte-reversed hex
pub fn hash_to_hex(hash: &Hash) -> String {
    let mut reversed = *hash;
    reversed.reverse();
    hex::encode(reversed)
}

/// Parse the display form produced by `hash_to_hex`
pub fn hash_from_hex(s: &str) -> std::result::Result<Hash, hex::FromHexError> {
    let mut hash = [0u8; 32];
    hex::decode_to_slice(s, &mut hash)?;
    hash.reverse();
    Ok(hash)
}

/// Serde adapter storing a `Hash` in display hex
pub mod serde_hex {
    use super::*;
    use serde::{de::Error, Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(hash: &Hash, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&hash_to_hex(hash))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Hash, D::Error> {
        let s = String::deserialize(deserializer)?;
        hash_from_hex(&s).map_err(D::Error::custom)
    }
}
