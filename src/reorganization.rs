//! Chain reorganization: switching the active chain to a new tip

use crate::block::{compute_merkle_root, connect_block, disconnect_block};
use crate::block_index::{BlockId, BlockIndex};
use crate::blockstore::BlockFiles;
use crate::config::ChainParams;
use crate::error::LedgerError;
use crate::hash::{calculate_block_hash, hash_to_hex};
use crate::txdb::ChainDb;
use crate::types::*;
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ReorgError {
    /// A block on the new branch failed validation; nothing was changed
    #[error("block {} failed to connect: {source}", hash_to_hex(hash))]
    ConnectFailed {
        block: BlockId,
        hash: Hash,
        source: LedgerError,
    },

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl From<ReorgError> for LedgerError {
    fn from(err: ReorgError) -> Self {
        match err {
            ReorgError::ConnectFailed { .. } => LedgerError::ReorgFailure(err.to_string()),
            ReorgError::Ledger(inner) => inner,
        }
    }
}

/// Blocks to leave and join when moving the active chain to a new tip
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReorganizationPlan {
    pub fork: BlockId,
    /// Current tip first, down to just above the fork
    pub disconnect: Vec<BlockId>,
    /// Just above the fork first, up to the new tip
    pub connect: Vec<BlockId>,
}

/// Reorganization result
#[derive(Debug, Clone)]
pub struct ReorganizationResult {
    pub fork_height: u32,
    pub new_height: u32,
    pub disconnected_blocks: Vec<Block>,
    pub connected_blocks: Vec<Block>,
}

impl ReorganizationResult {
    pub fn reorganization_depth(&self) -> usize {
        self.disconnected_blocks.len()
    }
}

/// FindFork + path: walk parent links of the new tip until the active
/// chain is reached, then collect both sides of the fork
pub fn plan_reorganization(index: &BlockIndex, new_tip: BlockId) -> Result<ReorganizationPlan, ReorgError> {
    let fork = index.find_fork(new_tip).ok_or_else(|| {
        LedgerError::ReorgFailure(format!(
            "no common ancestor with {}",
            hash_to_hex(&index.get(new_tip).hash)
        ))
    })?;
    let fork_height = index.get(fork).height;

    let mut disconnect = Vec::new();
    if let Some(best) = index.best() {
        let best_height = index.get(best).height;
        for height in (fork_height + 1..=best_height).rev() {
            if let Some(id) = index.at_height(height) {
                disconnect.push(id);
            }
        }
    }

    let mut connect = Vec::new();
    let mut cursor = new_tip;
    while cursor != fork {
        connect.push(cursor);
        cursor = index.get(cursor).parent.ok_or_else(|| {
            LedgerError::ReorgFailure("new branch does not reach the fork".to_string())
        })?;
    }
    connect.reverse();

    Ok(ReorganizationPlan {
        fork,
        disconnect,
        connect,
    })
}

/// Reorganize: make `new_tip` the active tip, all or nothing
///
/// 1. Plan the fork point and both branches
/// 2. Disconnect the current branch, tip first
/// 3. Connect the new branch in ascending height, fully validating each
///    block against the index as it stands after the previous step
/// 4. Persist the changed next links, then the best-chain pointer
/// 5. Commit everything as one store transaction
///
/// Any failure aborts the store transaction, leaving the index, spent
/// markers and best pointer as they were.
pub fn reorganize_chain(
    index: &mut BlockIndex,
    db: &mut ChainDb,
    files: &BlockFiles,
    new_tip: BlockId,
    params: &ChainParams,
) -> Result<ReorganizationResult, ReorgError> {
    // 1. Plan
    let plan = plan_reorganization(index, new_tip)?;
    let old_tip = index.best();

    db.txn_begin()?;
    let applied = apply_plan(index, db, files, &plan, params);
    let (disconnected_blocks, connected_blocks) = match applied {
        Ok(blocks) => blocks,
        Err(err) => {
            db.txn_abort()?;
            return Err(err);
        }
    };

    // 4. Next links and best pointer, pointer last
    let touched = index.set_best(new_tip);
    let persisted = persist_links(index, db, &touched, new_tip).and_then(|_| db.txn_commit());
    if let Err(err) = persisted {
        if db.in_txn() {
            db.txn_abort()?;
        }
        if let Some(old) = old_tip {
            index.set_best(old);
        }
        return Err(err.into());
    }

    let result = ReorganizationResult {
        fork_height: index.get(plan.fork).height,
        new_height: index.get(new_tip).height,
        disconnected_blocks,
        connected_blocks,
    };
    if result.reorganization_depth() > 0 {
        info!(
            "REORGANIZE: disconnected {} blocks, connected {} blocks, fork at height {}",
            result.disconnected_blocks.len(),
            result.connected_blocks.len(),
            result.fork_height
        );
    }
    Ok(result)
}

fn apply_plan(
    index: &BlockIndex,
    db: &mut ChainDb,
    files: &BlockFiles,
    plan: &ReorganizationPlan,
    params: &ChainParams,
) -> Result<(Vec<Block>, Vec<Block>), ReorgError> {
    // 2. Disconnect
    let mut disconnected = Vec::with_capacity(plan.disconnect.len());
    for &id in &plan.disconnect {
        match read_indexed_block(index, files, id).and_then(|block| matching_body(index, id, block)) {
            Ok(block) => {
                disconnect_block(&block, db)?;
                disconnected.push(block);
            }
            Err(LedgerError::StorageCorrupt(msg)) => {
                let entry = index.get(id);
                warn!(
                    "Disconnecting block {} at height {} without its body: {}",
                    hash_to_hex(&entry.hash),
                    entry.height,
                    msg
                );
                if let Some(pos) = entry.pos {
                    db.erase_block_records(pos)?;
                }
            }
            Err(err) => return Err(err.into()),
        }
    }

    // 3. Connect
    let mut connected = Vec::with_capacity(plan.connect.len());
    for &id in &plan.connect {
        let entry = index.get(id);
        let block = read_indexed_block(index, files, id)?;
        let pos = entry
            .pos
            .ok_or_else(|| LedgerError::StorageCorrupt("connect: block body missing".to_string()))?;
        if let Err(source) = connect_block(&block, pos, entry.height, db, files, params) {
            if source.as_validation().is_none() {
                return Err(source.into());
            }
            warn!(
                "Block {} at height {} failed to connect: {}",
                hash_to_hex(&entry.hash),
                entry.height,
                source
            );
            return Err(ReorgError::ConnectFailed {
                block: id,
                hash: entry.hash,
                source,
            });
        }
        connected.push(block);
    }
    Ok((disconnected, connected))
}

fn read_indexed_block(index: &BlockIndex, files: &BlockFiles, id: BlockId) -> Result<Block, LedgerError> {
    let entry = index.get(id);
    let pos = entry.pos.ok_or_else(|| {
        LedgerError::StorageCorrupt(format!("block {} has no stored body", hash_to_hex(&entry.hash)))
    })?;
    files.read_block(pos)
}

/// A stored body must be the block its entry was indexed under
fn matching_body(index: &BlockIndex, id: BlockId, block: Block) -> Result<Block, LedgerError> {
    let entry = index.get(id);
    if calculate_block_hash(&block.header) != entry.hash || compute_merkle_root(&block) != block.header.merkle_root {
        return Err(LedgerError::StorageCorrupt(format!(
            "stored body of {} does not match its header",
            hash_to_hex(&entry.hash)
        )));
    }
    Ok(block)
}

fn persist_links(index: &BlockIndex, db: &mut ChainDb, touched: &[BlockId], new_tip: BlockId) -> crate::error::Result<()> {
    for &id in touched {
        if let Some(record) = index.to_disk(id) {
            db.write_block_index(&index.get(id).hash, &record)?;
        }
    }
    db.write_best_chain(&index.get(new_tip).hash)
}
