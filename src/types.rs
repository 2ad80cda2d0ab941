//! Core ledger types: transactions, blocks and the records persisted about them

use serde::{Deserialize, Serialize};

/// Hash type: 256-bit hash, stored in internal (little-endian) byte order
pub type Hash = [u8; 32];

/// Byte string type
pub type ByteString = Vec<u8>;

/// Monetary amount in minimal units
pub type Amount = i64;

/// OutPoint: reference to output `index` of transaction `hash`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OutPoint {
    pub hash: Hash,
    pub index: u32,
}

impl OutPoint {
    /// The null outpoint carried by a coinbase input
    pub fn null() -> Self {
        OutPoint {
            hash: [0u8; 32],
            index: u32::MAX,
        }
    }

    pub fn is_null(&self) -> bool {
        self.hash == [0u8; 32] && self.index == u32::MAX
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionInput {
    pub prevout: OutPoint,
    pub script_sig: ByteString,
    pub sequence: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransactionOutput {
    pub value: Amount,
    pub script_pubkey: ByteString,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub version: i32,
    pub inputs: Vec<TransactionInput>,
    pub outputs: Vec<TransactionOutput>,
    pub lock_time: u32,
}

/// Block header, 80 bytes on the wire
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockHeader {
    pub version: i32,
    pub prev_block_hash: Hash,
    pub merkle_root: Hash,
    pub timestamp: u32,
    pub bits: u32,
    pub nonce: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    pub transactions: Vec<Transaction>,
}

/// Location of a block body inside the block files
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DiskBlockPos {
    pub file: u32,
    pub pos: u32,
}

/// Location of a transaction: its block plus the byte offset of the
/// transaction inside the block file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DiskTxPos {
    pub file: u32,
    pub block_pos: u32,
    pub tx_pos: u32,
}

impl DiskTxPos {
    pub fn block(&self) -> DiskBlockPos {
        DiskBlockPos {
            file: self.file,
            pos: self.block_pos,
        }
    }
}

/// Transaction index record: where a confirmed transaction lives and which
/// of its outputs have been consumed (by the transaction at the recorded
/// position)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxIndex {
    pub pos: DiskTxPos,
    pub height: u32,
    pub spent: Vec<Option<DiskTxPos>>,
}

impl TxIndex {
    pub fn new(pos: DiskTxPos, height: u32, outputs: usize) -> Self {
        TxIndex {
            pos,
            height,
            spent: vec![None; outputs],
        }
    }

    pub fn is_fully_spent(&self) -> bool {
        self.spent.iter().all(Option::is_some)
    }
}

/// Validation state of a block index entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum BlockStatus {
    /// Known by hash only
    Unvalidated = 0,
    /// Header accepted, body not yet seen or checked
    ValidHeader = 1,
    /// Body accepted and stored
    ValidFull = 2,
    /// Failed validation; never re-attempted
    Invalid = 3,
}

impl BlockStatus {
    pub fn from_u8(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(BlockStatus::Unvalidated),
            1 => Some(BlockStatus::ValidHeader),
            2 => Some(BlockStatus::ValidFull),
            3 => Some(BlockStatus::Invalid),
            _ => None,
        }
    }
}

/// Persisted form of a block index entry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskBlockIndex {
    pub client_version: i32,
    pub header: BlockHeader,
    pub hash_next: Option<Hash>,
    pub pos: Option<DiskBlockPos>,
    pub height: u32,
    pub status: BlockStatus,
}

/// Manual debit/credit record tied to an account label
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountingEntry {
    pub account: String,
    pub entry_no: u64,
    pub credit_debit: Amount,
    pub time: i64,
    pub other_account: String,
    pub comment: String,
}

/// Peer address record
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerAddress {
    pub services: u64,
    pub ip: [u8; 16],
    pub port: u16,
    pub time: u32,
}

impl PeerAddress {
    /// Store key component: address bytes followed by the port
    pub fn key(&self) -> Vec<u8> {
        let mut key = self.ip.to_vec();
        key.extend_from_slice(&self.port.to_be_bytes());
        key
    }
}
