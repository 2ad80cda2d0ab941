//! Chain database: transaction index, owner index and block-index records
//!
//! Everything the active chain depends on lives in one namespace so a
//! reorganization commits in a single store transaction. Keys are a tag
//! string followed by the encoded key fields:
//!
//! - `("tx", txid)` → `TxIndex`
//! - `("owner", hash160, DiskTxPos)` → height
//! - `("blockindex", hash)` → `DiskBlockIndex`
//! - `"hashBestChain"` → hash
//! - `"bnBestInvalidWork"` → 256-bit work

use crate::blockstore::BlockFiles;
use crate::error::{LedgerError, Result};
use crate::hash::calculate_tx_id;
use crate::pow::U256;
use crate::script::extract_owner;
use crate::serialization::{deserialize, serialize};
use crate::storage::{Database, Environment, OpenMode};
use crate::types::*;
use std::sync::Arc;
use tracing::{debug, warn};

/// Namespace holding the chain state
pub const CHAIN_NAMESPACE: &str = "blkindex";

const TX_TAG: &str = "tx";
const OWNER_TAG: &str = "owner";
const BLOCK_INDEX_TAG: &str = "blockindex";
const BEST_CHAIN_KEY: &str = "hashBestChain";
const BEST_INVALID_WORK_KEY: &str = "bnBestInvalidWork";

/// Handle on the chain namespace
///
/// Handles are short-lived: open one per operation so the background
/// flusher sees the namespace idle between operations.
#[derive(Debug)]
pub struct ChainDb {
    db: Database,
}

impl ChainDb {
    pub fn open(env: &Arc<Environment>, mode: OpenMode) -> Result<Self> {
        Ok(ChainDb {
            db: env.open_database(CHAIN_NAMESPACE, mode)?,
        })
    }

    pub fn txn_begin(&mut self) -> Result<()> {
        Ok(self.db.txn_begin()?)
    }

    pub fn txn_commit(&mut self) -> Result<()> {
        Ok(self.db.txn_commit()?)
    }

    pub fn txn_abort(&mut self) -> Result<()> {
        Ok(self.db.txn_abort()?)
    }

    pub fn in_txn(&self) -> bool {
        self.db.in_txn()
    }

    // ------------------------------------------------------------------
    // Transaction index
    // ------------------------------------------------------------------

    pub fn read_tx_index(&self, txid: &Hash) -> Result<Option<TxIndex>> {
        Ok(self.db.read(&(TX_TAG, txid))?)
    }

    pub fn update_tx_index(&mut self, txid: &Hash, index: &TxIndex) -> Result<()> {
        Ok(self.db.write(&(TX_TAG, txid), index)?)
    }

    pub fn contains_tx(&self, txid: &Hash) -> Result<bool> {
        Ok(self.db.exists(&(TX_TAG, txid))?)
    }

    /// Index a transaction confirmed at `pos`, with every output unspent,
    /// and record an owner entry for each output paying a recognizable key
    pub fn add_tx_index(&mut self, tx: &Transaction, pos: DiskTxPos, height: u32) -> Result<()> {
        let txid = calculate_tx_id(tx);
        self.update_tx_index(&txid, &TxIndex::new(pos, height, tx.outputs.len()))?;
        for output in &tx.outputs {
            if let Some(owner) = extract_owner(&output.script_pubkey) {
                self.db.write(&(OWNER_TAG, owner, pos), &height)?;
            }
        }
        Ok(())
    }

    /// Remove a transaction's index record and its owner entries
    pub fn erase_tx_index(&mut self, tx: &Transaction) -> Result<()> {
        let txid = calculate_tx_id(tx);
        if let Some(index) = self.read_tx_index(&txid)? {
            for output in &tx.outputs {
                if let Some(owner) = extract_owner(&output.script_pubkey) {
                    self.db.erase(&(OWNER_TAG, owner, index.pos))?;
                }
            }
        }
        Ok(self.db.erase(&(TX_TAG, txid))?)
    }

    /// Undo a block's transaction records without its body
    ///
    /// Scans the whole index: records of transactions stored in `block`
    /// and their owner entries are erased, outputs they spent are marked
    /// unspent again. Returns the number of erased transactions.
    pub fn erase_block_records(&mut self, block: DiskBlockPos) -> Result<usize> {
        let mut erased = Vec::new();
        let mut respent = Vec::new();
        for item in self.db.cursor_prefix(&serialize(TX_TAG)) {
            let (key, value) = item?;
            let (_, txid): (String, Hash) = deserialize(&key)?;
            let mut index: TxIndex = deserialize(&value)?;
            if index.pos.block() == block {
                erased.push(key);
                continue;
            }
            let mut changed = false;
            for slot in index.spent.iter_mut() {
                if slot.is_some_and(|spender| spender.block() == block) {
                    *slot = None;
                    changed = true;
                }
            }
            if changed {
                respent.push((txid, index));
            }
        }
        let mut owners = Vec::new();
        for item in self.db.cursor_prefix(&serialize(OWNER_TAG)) {
            let (key, _) = item?;
            let (_, _, pos): (String, [u8; 20], DiskTxPos) = deserialize(&key)?;
            if pos.block() == block {
                owners.push(key);
            }
        }

        let count = erased.len();
        for key in erased.into_iter().chain(owners) {
            self.db.erase_raw(key)?;
        }
        for (txid, index) in respent {
            self.update_tx_index(&txid, &index)?;
        }
        debug!("Erased {} transaction records of block file {} offset {}", count, block.file, block.pos);
        Ok(count)
    }

    /// Load a confirmed transaction with its index record
    pub fn read_disk_tx(&self, txid: &Hash, files: &BlockFiles) -> Result<Option<(Transaction, TxIndex)>> {
        match self.read_tx_index(txid)? {
            None => Ok(None),
            Some(index) => {
                let tx = files.read_transaction(index.pos)?;
                Ok(Some((tx, index)))
            }
        }
    }

    /// ReadTransactionsByOwner: every confirmed transaction paying `owner`
    /// at or above `min_height`, in on-disk order
    pub fn read_owner_txes(&self, owner: &[u8; 20], min_height: u32, files: &BlockFiles) -> Result<Vec<Transaction>> {
        let prefix = serialize(&(OWNER_TAG, owner));
        let mut txes = Vec::new();
        for item in self.db.cursor_prefix(&prefix) {
            let (key, value) = item?;
            let (_, _, pos): (String, [u8; 20], DiskTxPos) = deserialize(&key)?;
            let height: u32 = deserialize(&value)?;
            if height >= min_height {
                txes.push(files.read_transaction(pos)?);
            }
        }
        debug!("Owner scan found {} transactions", txes.len());
        Ok(txes)
    }

    // ------------------------------------------------------------------
    // Block index records
    // ------------------------------------------------------------------

    pub fn write_block_index(&mut self, hash: &Hash, record: &DiskBlockIndex) -> Result<()> {
        Ok(self.db.write(&(BLOCK_INDEX_TAG, hash), record)?)
    }

    pub fn read_block_index(&self, hash: &Hash) -> Result<Option<DiskBlockIndex>> {
        Ok(self.db.read(&(BLOCK_INDEX_TAG, hash))?)
    }

    pub fn erase_block_index(&mut self, hash: &Hash) -> Result<()> {
        Ok(self.db.erase(&(BLOCK_INDEX_TAG, hash))?)
    }

    /// Every persisted block-index record
    ///
    /// Records that fail to decode are logged and skipped; the caller
    /// rebuilds what it can from the rest.
    pub fn read_all_block_index(&self) -> Result<Vec<(Hash, DiskBlockIndex)>> {
        let prefix = serialize(BLOCK_INDEX_TAG);
        let mut records = Vec::new();
        for item in self.db.cursor_prefix(&prefix) {
            let (key, value) = item?;
            let hash = match deserialize::<(String, Hash)>(&key) {
                Ok((_, hash)) => hash,
                Err(e) => {
                    warn!("Skipping block index record with bad key: {}", e);
                    continue;
                }
            };
            match deserialize::<DiskBlockIndex>(&value) {
                Ok(record) => records.push((hash, record)),
                Err(e) => warn!("Skipping corrupt block index record {}: {}", hex::encode(hash), e),
            }
        }
        Ok(records)
    }

    // ------------------------------------------------------------------
    // Chain pointers
    // ------------------------------------------------------------------

    pub fn read_best_chain(&self) -> Result<Option<Hash>> {
        Ok(self.db.read(BEST_CHAIN_KEY)?)
    }

    pub fn write_best_chain(&mut self, hash: &Hash) -> Result<()> {
        Ok(self.db.write(BEST_CHAIN_KEY, hash)?)
    }

    pub fn read_best_invalid_work(&self) -> Result<U256> {
        let bytes: Option<[u8; 32]> = self.db.read(BEST_INVALID_WORK_KEY)?;
        Ok(bytes.map(|b| U256::from_le_bytes(&b)).unwrap_or_default())
    }

    pub fn write_best_invalid_work(&mut self, work: &U256) -> Result<()> {
        Ok(self.db.write(BEST_INVALID_WORK_KEY, &work.to_le_bytes())?)
    }
}

/// Mark output `index` of `txid` spent by the transaction at `spender`
pub fn mark_spent(db: &mut ChainDb, prevout: &OutPoint, spender: DiskTxPos) -> Result<()> {
    let mut index = db.read_tx_index(&prevout.hash)?.ok_or_else(|| {
        LedgerError::StorageCorrupt(format!("missing index for {}", hex::encode(prevout.hash)))
    })?;
    let slot = index
        .spent
        .get_mut(prevout.index as usize)
        .ok_or_else(|| LedgerError::StorageCorrupt(format!("output {} out of range", prevout.index)))?;
    *slot = Some(spender);
    db.update_tx_index(&prevout.hash, &index)
}
