//! Memory pool: unconfirmed transactions waiting for a block

use crate::block::{fetch_prevout, missing_input};
use crate::blockstore::BlockFiles;
use crate::config::ChainParams;
use crate::error::{LedgerError, Result, ValidationError, ValidationKind};
use crate::hash::calculate_tx_id;
use crate::transaction::{check_transaction, check_tx_inputs, is_coinbase, is_final, SpentOutput};
use crate::txdb::ChainDb;
use crate::types::*;
use std::collections::HashMap;
use tracing::debug;

/// Result of offering a transaction to the pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitTxOutcome {
    Accepted,
    Rejected(ValidationError),
    DuplicateKnown,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct PoolEntry {
    tx: Transaction,
    fee: Amount,
}

#[derive(Debug, Default)]
pub struct MemPool {
    txs: HashMap<Hash, PoolEntry>,
    /// Outpoint → id of the pool transaction spending it
    spends: HashMap<OutPoint, Hash>,
    max_txs: usize,
    /// Bumped on every insert or removal
    updated: u64,
}

impl MemPool {
    pub fn new(max_txs: usize) -> Self {
        MemPool {
            txs: HashMap::new(),
            spends: HashMap::new(),
            max_txs,
            updated: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.txs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txs.is_empty()
    }

    pub fn contains(&self, txid: &Hash) -> bool {
        self.txs.contains_key(txid)
    }

    pub fn get(&self, txid: &Hash) -> Option<&Transaction> {
        self.txs.get(txid).map(|entry| &entry.tx)
    }

    pub fn fee(&self, txid: &Hash) -> Option<Amount> {
        self.txs.get(txid).map(|entry| entry.fee)
    }

    pub fn transactions_updated(&self) -> u64 {
        self.updated
    }

    pub fn is_spent(&self, outpoint: &OutPoint) -> bool {
        self.spends.contains_key(outpoint)
    }

    /// Transactions with every unconfirmed parent listed before its children
    pub fn ordered_transactions(&self) -> Vec<(Hash, &Transaction, Amount)> {
        let mut ordered = Vec::with_capacity(self.txs.len());
        let mut placed = std::collections::HashSet::new();
        let mut ids: Vec<&Hash> = self.txs.keys().collect();
        ids.sort();
        for id in ids {
            self.place(id, &mut placed, &mut ordered);
        }
        ordered
    }

    fn place<'a>(
        &'a self,
        id: &Hash,
        placed: &mut std::collections::HashSet<Hash>,
        ordered: &mut Vec<(Hash, &'a Transaction, Amount)>,
    ) {
        if placed.contains(id) {
            return;
        }
        let Some(entry) = self.txs.get(id) else {
            return;
        };
        placed.insert(*id);
        for input in &entry.tx.inputs {
            if self.txs.contains_key(&input.prevout.hash) {
                self.place(&input.prevout.hash, placed, ordered);
            }
        }
        ordered.push((*id, &entry.tx, entry.fee));
    }

    /// AcceptToMemoryPool: 𝒯𝒳 × TxIndex × 𝒫 → {accepted, rejected}
    ///
    /// For transaction tx offered at chain height h:
    /// 1. Check if tx is already pooled or confirmed
    /// 2. Validate transaction structure; coinbases are never pooled
    /// 3. Must be final for the next block
    /// 4. No input may be spent by another pool transaction
    /// 5. Resolve inputs from the index or from pool transactions
    /// 6. CheckTxInputs, scripts included
    pub fn accept(
        &mut self,
        tx: Transaction,
        db: &ChainDb,
        files: &BlockFiles,
        height: u32,
        block_time: u32,
        params: &ChainParams,
    ) -> Result<SubmitTxOutcome> {
        // 1. Duplicates
        let txid = calculate_tx_id(&tx);
        if self.contains(&txid) || db.contains_tx(&txid)? {
            return Ok(SubmitTxOutcome::DuplicateKnown);
        }

        // 2. Structure
        if let Err(e) = check_transaction(&tx, params) {
            return Ok(SubmitTxOutcome::Rejected(e));
        }
        if is_coinbase(&tx) {
            return Ok(SubmitTxOutcome::Rejected(ValidationError::new(
                ValidationKind::Structure,
                "coinbase",
                "coinbase transactions only appear in blocks",
            )));
        }

        // 3. Finality
        let next_height = height + 1;
        if !is_final(&tx, next_height, block_time) {
            return Ok(SubmitTxOutcome::Rejected(ValidationError::new(
                ValidationKind::Context,
                "non-final",
                "transaction is not final",
            )));
        }

        // 4. Conflicts
        if let Some(input) = tx.inputs.iter().find(|input| self.is_spent(&input.prevout)) {
            return Ok(SubmitTxOutcome::Rejected(ValidationError::new(
                ValidationKind::DoubleSpend,
                "txn-mempool-conflict",
                format!("input {}:{} already spent in pool", hex::encode(input.prevout.hash), input.prevout.index),
            )));
        }
        if self.txs.len() >= self.max_txs {
            return Ok(SubmitTxOutcome::Rejected(ValidationError::new(
                ValidationKind::Context,
                "mempool-full",
                format!("pool holds {} transactions", self.txs.len()),
            )));
        }

        // 5. Inputs
        let prevouts = match self.resolve_inputs(&tx, db, files) {
            Ok(prevouts) => prevouts,
            Err(LedgerError::Validation(e)) => return Ok(SubmitTxOutcome::Rejected(e)),
            Err(other) => return Err(other),
        };

        // 6. Input checks
        let fee = match check_tx_inputs(&tx, &prevouts, next_height, params, true) {
            Ok(fee) => fee,
            Err(e) => return Ok(SubmitTxOutcome::Rejected(e)),
        };

        self.insert(txid, tx, fee);
        debug!("Accepted {} to pool ({} transactions)", hex::encode(txid), self.txs.len());
        Ok(SubmitTxOutcome::Accepted)
    }

    fn resolve_inputs(&self, tx: &Transaction, db: &ChainDb, files: &BlockFiles) -> Result<Vec<SpentOutput>> {
        let mut prevouts = Vec::with_capacity(tx.inputs.len());
        for input in &tx.inputs {
            if let Some(parent) = self.txs.get(&input.prevout.hash) {
                let output = parent
                    .tx
                    .outputs
                    .get(input.prevout.index as usize)
                    .cloned()
                    .ok_or_else(|| missing_input(&input.prevout))?;
                prevouts.push(SpentOutput {
                    output,
                    height: None,
                    from_coinbase: false,
                    spent: false,
                });
                continue;
            }
            let prev = fetch_prevout(db, files, &input.prevout)?.ok_or_else(|| missing_input(&input.prevout))?;
            prevouts.push(prev);
        }
        Ok(prevouts)
    }

    fn insert(&mut self, txid: Hash, tx: Transaction, fee: Amount) {
        for input in &tx.inputs {
            self.spends.insert(input.prevout, txid);
        }
        self.txs.insert(txid, PoolEntry { tx, fee });
        self.updated += 1;
    }

    /// Drop a transaction; with `with_descendants`, also every pool
    /// transaction spending its outputs
    pub fn remove(&mut self, txid: &Hash, with_descendants: bool) -> usize {
        let Some(entry) = self.txs.remove(txid) else {
            return 0;
        };
        for input in &entry.tx.inputs {
            if self.spends.get(&input.prevout) == Some(txid) {
                self.spends.remove(&input.prevout);
            }
        }
        self.updated += 1;
        let mut removed = 1;
        if with_descendants {
            for index in 0..entry.tx.outputs.len() {
                let outpoint = OutPoint { hash: *txid, index: index as u32 };
                if let Some(child) = self.spends.get(&outpoint).copied() {
                    removed += self.remove(&child, true);
                }
            }
        }
        removed
    }

    /// Forget transactions confirmed by `block`, and evict pool
    /// transactions that now conflict with it
    pub fn remove_for_block(&mut self, block: &Block) {
        for tx in &block.transactions {
            let txid = calculate_tx_id(tx);
            self.remove(&txid, false);
            if is_coinbase(tx) {
                continue;
            }
            for input in &tx.inputs {
                if let Some(conflict) = self.spends.get(&input.prevout).copied() {
                    self.remove(&conflict, true);
                }
            }
        }
    }

    pub fn clear(&mut self) {
        self.txs.clear();
        self.spends.clear();
        self.updated += 1;
    }
}
