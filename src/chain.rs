//! Chain selector: block acceptance, orphan handling, best-chain
//! activation and startup reconciliation
//!
//! `ChainState` owns everything the main lock protects: the block index,
//! the orphan pool, the mempool and the block files. Every method assumes
//! the caller holds that lock for the whole call.

use crate::block::{check_block, check_block_header, contextual_check_block, contextual_check_header};
use crate::block_index::{BlockId, BlockIndex};
use crate::blockstore::BlockFiles;
use crate::config::{ChainParams, NodeConfig};
use crate::error::{LedgerError, Result, ValidationError, ValidationKind};
use crate::hash::{calculate_block_hash, hash_to_hex};
use crate::mempool::{MemPool, SubmitTxOutcome};
use crate::pow::{block_work, PowHash, U256};
use crate::reorganization::{reorganize_chain, ReorgError, ReorganizationResult};
use crate::storage::{Environment, OpenMode};
use crate::transaction::is_coinbase;
use crate::txdb::ChainDb;
use crate::types::*;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Result of offering a block (or header) to the chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitBlockOutcome {
    Accepted,
    /// Held until the named ancestor arrives
    AcceptedOrphan { missing_parent: Hash },
    Rejected(ValidationError),
    DuplicateKnown,
}

/// Current time in seconds, saturated into the header's range
pub fn unix_time() -> u32 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs().min(u32::MAX as u64) as u32)
        .unwrap_or(0)
}

// ============================================================================
// Orphan blocks
// ============================================================================

/// Blocks whose parent is not yet known, bounded in count
#[derive(Debug, Default)]
struct OrphanBlocks {
    blocks: HashMap<Hash, Block>,
    by_prev: HashMap<Hash, Vec<Hash>>,
    /// Arrival order, oldest first
    order: VecDeque<Hash>,
    max: usize,
}

impl OrphanBlocks {
    fn new(max: usize) -> Self {
        OrphanBlocks {
            max,
            ..OrphanBlocks::default()
        }
    }

    fn contains(&self, hash: &Hash) -> bool {
        self.blocks.contains_key(hash)
    }

    fn len(&self) -> usize {
        self.blocks.len()
    }

    fn insert(&mut self, hash: Hash, block: Block) {
        while self.blocks.len() >= self.max.max(1) {
            let Some(oldest) = self.order.pop_front() else {
                break;
            };
            self.remove(&oldest);
            debug!("Evicted orphan {}", hash_to_hex(&oldest));
        }
        self.by_prev
            .entry(block.header.prev_block_hash)
            .or_default()
            .push(hash);
        self.order.push_back(hash);
        self.blocks.insert(hash, block);
    }

    fn remove(&mut self, hash: &Hash) -> Option<Block> {
        let block = self.blocks.remove(hash)?;
        let prev = block.header.prev_block_hash;
        if let Some(siblings) = self.by_prev.get_mut(&prev) {
            siblings.retain(|h| h != hash);
            if siblings.is_empty() {
                self.by_prev.remove(&prev);
            }
        }
        self.order.retain(|h| h != hash);
        Some(block)
    }

    /// Remove and return every orphan whose parent is `prev`
    fn take_children(&mut self, prev: &Hash) -> Vec<(Hash, Block)> {
        let hashes = self.by_prev.get(prev).cloned().unwrap_or_default();
        hashes
            .into_iter()
            .filter_map(|hash| self.remove(&hash).map(|block| (hash, block)))
            .collect()
    }

    /// Parent hash of the oldest orphan ancestor of `hash`
    fn missing_root(&self, hash: &Hash) -> Hash {
        let mut cursor = *hash;
        while let Some(block) = self.blocks.get(&cursor) {
            let prev = block.header.prev_block_hash;
            if !self.blocks.contains_key(&prev) {
                return prev;
            }
            cursor = prev;
        }
        cursor
    }
}

// ============================================================================
// Chain state
// ============================================================================

pub struct ChainState {
    env: Arc<Environment>,
    params: ChainParams,
    pow: Box<dyn PowHash>,
    files: BlockFiles,
    index: BlockIndex,
    orphans: OrphanBlocks,
    mempool: MemPool,
    best_invalid_work: U256,
}

impl std::fmt::Debug for ChainState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainState")
            .field("network", &self.params.name)
            .field("height", &self.height())
            .field("best", &hash_to_hex(&self.best_hash()))
            .field("orphans", &self.orphans.len())
            .field("mempool", &self.mempool.len())
            .finish()
    }
}

impl ChainState {
    /// Open the store and block files under `config.data_dir` and bring
    /// the chain up to date
    ///
    /// 1. Check the configured genesis block hashes to the expected value
    /// 2. Empty store: write, index and activate genesis
    /// 3. Otherwise load the block index and restore the best chain
    /// 4. Verify recent blocks, rolling the best chain back past bad ones
    /// 5. Activate the most-work candidate
    pub fn open(config: &NodeConfig, pow: Box<dyn PowHash>) -> Result<Self> {
        config
            .validate()
            .map_err(|e| LedgerError::Config(format!("{e:#}")))?;
        let params = config.params.clone();

        // 1. Genesis
        let genesis_hash = calculate_block_hash(&params.genesis_block().header);
        if genesis_hash != params.genesis_hash {
            return Err(LedgerError::Config(format!(
                "genesis block hashes to {}, expected {}",
                hash_to_hex(&genesis_hash),
                hash_to_hex(&params.genesis_hash)
            )));
        }

        let env = Environment::open(&config.data_dir, config.cache_capacity, config.sync_on_commit)?;
        let files = BlockFiles::open(&config.data_dir.join("blocks"), params.message_start)?
            .with_max_block_size(params.max_block_size);
        let mut chain = ChainState {
            env,
            params,
            pow,
            files,
            index: BlockIndex::new(),
            orphans: OrphanBlocks::new(config.max_orphan_blocks),
            mempool: MemPool::new(config.max_mempool_txs),
            best_invalid_work: U256::zero(),
        };

        let mut db = ChainDb::open(&chain.env, OpenMode::Create)?;
        let records = db.read_all_block_index()?;
        if records.is_empty() {
            // 2. Fresh store
            chain.init_genesis(&mut db)?;
        } else {
            // 3. Existing store
            chain.load_block_index(&db, records)?;
        }
        drop(db);

        // 4. Startup verification
        let depth = if config.check_all_blocks {
            None
        } else {
            Some(config.check_blocks)
        };
        chain.verify_chain(depth)?;

        // 5. Anything left over from an interrupted activation
        chain.activate_best_chain()?;
        info!(
            "Chain ready: height={} best={}",
            chain.height(),
            hash_to_hex(&chain.best_hash())
        );
        Ok(chain)
    }

    fn init_genesis(&mut self, db: &mut ChainDb) -> Result<()> {
        let genesis = self.params.genesis_block();
        let hash = calculate_block_hash(&genesis.header);
        let (pos, _) = self.files.write_block(&genesis)?;
        let id = self.index.insert_header(&genesis.header);
        self.index.set_pos(id, pos);
        self.index.set_status(id, BlockStatus::ValidFull);
        self.index.set_best(id);

        // The genesis coinbase is never connected; its output is unspendable.
        db.txn_begin()?;
        self.persist_entries(db, &[id])?;
        db.write_best_chain(&hash)?;
        db.txn_commit()?;
        info!("Initialized chain with genesis {}", hash_to_hex(&hash));
        Ok(())
    }

    fn load_block_index(&mut self, db: &ChainDb, records: Vec<(Hash, DiskBlockIndex)>) -> Result<()> {
        let count = records.len();
        let (index, rejected) = BlockIndex::load(records, &self.params.genesis_hash);
        self.index = index;

        let best_hash = db
            .read_best_chain()?
            .ok_or_else(|| LedgerError::StorageCorrupt("hashBestChain not loaded".to_string()))?;
        let tip = self
            .index
            .lookup(&best_hash)
            .filter(|&id| self.index.get(id).header.is_some())
            .ok_or_else(|| {
                LedgerError::StorageCorrupt(format!(
                    "hashBestChain {} not found in the block index",
                    hash_to_hex(&best_hash)
                ))
            })?;
        self.index.restore_active(tip);
        self.best_invalid_work = db.read_best_invalid_work()?;

        info!(
            "Loaded {} block index records ({} rejected), best={} height={}",
            count,
            rejected.len(),
            hash_to_hex(&best_hash),
            self.height()
        );
        Ok(())
    }

    /// Walk back from the tip checking each stored body, up to `depth`
    /// blocks (all when `None`). If bad blocks turn up, the best chain
    /// moves back to the parent of the deepest. Blocks that break a rule
    /// are marked invalid with their descendants; damaged bodies are
    /// dropped so the block can be submitted again.
    fn verify_chain(&mut self, depth: Option<u32>) -> Result<()> {
        let Some(best) = self.index.best() else {
            return Ok(());
        };
        let mut invalid_blocks = Vec::new();
        let mut damaged_blocks = Vec::new();
        let mut fork = None;
        let mut checked = 0u32;
        let mut cursor = best;

        while let Some(parent) = self.index.get(cursor).parent {
            if depth.is_some_and(|d| checked >= d) {
                break;
            }
            let entry = self.index.get(cursor);
            let fault = if entry.is_invalid() {
                Some(StoredFault::Invalid("marked invalid".to_string()))
            } else {
                match entry.pos.map(|pos| self.files.read_block(pos)) {
                    None => Some(StoredFault::Damaged("no stored body".to_string())),
                    Some(Ok(block)) => stored_block_fault(&entry.hash, &block, &self.params, self.pow.as_ref()),
                    Some(Err(LedgerError::StorageCorrupt(msg))) => Some(StoredFault::Damaged(msg)),
                    Some(Err(other)) => return Err(other),
                }
            };
            if let Some(fault) = fault {
                warn!(
                    "Found bad block at height {} ({}): {}",
                    entry.height,
                    hash_to_hex(&entry.hash),
                    fault
                );
                match fault {
                    StoredFault::Invalid(_) => invalid_blocks.push(cursor),
                    StoredFault::Damaged(_) => damaged_blocks.push(cursor),
                }
                fork = Some(parent);
            }
            checked += 1;
            cursor = parent;
        }
        debug!("Verified {} blocks back from the tip", checked);

        let Some(fork) = fork else {
            return Ok(());
        };
        warn!(
            "Moving best chain pointer back to block {} at height {}",
            hash_to_hex(&self.index.get(fork).hash),
            self.index.get(fork).height
        );
        let mut db = self.chain_db()?;
        reorganize_chain(&mut self.index, &mut db, &self.files, fork, &self.params)?;

        db.txn_begin()?;
        for id in damaged_blocks {
            self.index.clear_body(id);
            self.persist_entries(&mut db, &[id])?;
        }
        for id in invalid_blocks {
            let changed = self.index.mark_invalid(id);
            self.persist_entries(&mut db, &changed)?;
        }
        db.txn_commit()?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Accessors
    // ------------------------------------------------------------------

    pub fn params(&self) -> &ChainParams {
        &self.params
    }

    pub fn environment(&self) -> &Arc<Environment> {
        &self.env
    }

    pub fn index(&self) -> &BlockIndex {
        &self.index
    }

    pub fn mempool(&self) -> &MemPool {
        &self.mempool
    }

    pub fn orphan_count(&self) -> usize {
        self.orphans.len()
    }

    pub fn best_invalid_work(&self) -> U256 {
        self.best_invalid_work
    }

    pub(crate) fn chain_db(&self) -> Result<ChainDb> {
        ChainDb::open(&self.env, OpenMode::ReadWrite)
    }

    pub(crate) fn chain_db_read(&self) -> Result<ChainDb> {
        ChainDb::open(&self.env, OpenMode::ReadOnly)
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// GetBestChainHash
    pub fn best_hash(&self) -> Hash {
        self.index
            .best()
            .map(|id| self.index.get(id).hash)
            .unwrap_or(self.params.genesis_hash)
    }

    /// GetHeight
    pub fn height(&self) -> u32 {
        self.index.height().unwrap_or(0)
    }

    pub fn best_work(&self) -> U256 {
        self.index
            .best()
            .map(|id| self.index.get(id).chain_work)
            .unwrap_or_default()
    }

    /// GetBlockByHash: any stored block, on the active chain or not
    pub fn block_by_hash(&self, hash: &Hash) -> Result<Block> {
        let pos = self
            .index
            .get_by_hash(hash)
            .and_then(|entry| entry.pos)
            .ok_or_else(|| LedgerError::NotFound(format!("block {}", hash_to_hex(hash))))?;
        self.files.read_block(pos)
    }

    /// GetBlockHashAtHeight on the active chain
    pub fn hash_at_height(&self, height: u32) -> Result<Hash> {
        self.index
            .at_height(height)
            .map(|id| self.index.get(id).hash)
            .ok_or_else(|| LedgerError::OutOfRange(format!("height {} above best {}", height, self.height())))
    }

    /// GetTransaction: a confirmed transaction with its block, or a pooled
    /// one without
    pub fn transaction(&self, txid: &Hash) -> Result<(Transaction, Option<Hash>)> {
        let db = self.chain_db_read()?;
        if let Some((tx, index)) = db.read_disk_tx(txid, &self.files)? {
            let block_hash = match self.index.at_height(index.height) {
                Some(id) => self.index.get(id).hash,
                None => {
                    let block = self.files.read_block(index.pos.block())?;
                    calculate_block_hash(&block.header)
                }
            };
            return Ok((tx, Some(block_hash)));
        }
        if let Some(tx) = self.mempool.get(txid) {
            return Ok((tx.clone(), None));
        }
        Err(LedgerError::NotFound(format!("transaction {}", hash_to_hex(txid))))
    }

    /// Confirmed transactions paying `owner` at or above `min_height`
    pub fn owner_transactions(&self, owner: &[u8; 20], min_height: u32) -> Result<Vec<Transaction>> {
        self.chain_db_read()?.read_owner_txes(owner, min_height, &self.files)
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    /// Offer an unconfirmed transaction to the mempool
    pub fn process_transaction(&mut self, tx: Transaction) -> Result<SubmitTxOutcome> {
        let db = self.chain_db_read()?;
        let height = self.height();
        let outcome = self
            .mempool
            .accept(tx, &db, &self.files, height, unix_time(), &self.params)?;
        if let SubmitTxOutcome::Rejected(reason) = &outcome {
            debug!("Transaction rejected: {}", reason);
        }
        Ok(outcome)
    }

    // ------------------------------------------------------------------
    // Headers and blocks
    // ------------------------------------------------------------------

    /// ProcessHeader: header-first acceptance
    ///
    /// The parent's header must already be known. On success the entry
    /// is `ValidHeader`; the body can follow through `process_block`.
    pub fn process_header(&mut self, header: BlockHeader) -> Result<SubmitBlockOutcome> {
        let hash = calculate_block_hash(&header);
        if let Some(entry) = self.index.get_by_hash(&hash) {
            if entry.is_invalid() {
                return Ok(SubmitBlockOutcome::Rejected(duplicate_invalid(&hash)));
            }
            if entry.header.is_some() {
                return Ok(SubmitBlockOutcome::DuplicateKnown);
            }
        }

        if let Err(reason) = check_block_header(&header, &self.params, self.pow.as_ref(), unix_time()) {
            return Ok(SubmitBlockOutcome::Rejected(reason));
        }
        let parent = self
            .index
            .lookup(&header.prev_block_hash)
            .filter(|&id| self.index.get(id).header.is_some());
        let Some(parent) = parent else {
            return Ok(SubmitBlockOutcome::Rejected(ValidationError::new(
                ValidationKind::Context,
                "prev-blk-not-found",
                format!("parent {} unknown", hash_to_hex(&header.prev_block_hash)),
            )));
        };
        if self.index.has_invalid_ancestry(parent) {
            self.remember_invalid(&header)?;
            return Ok(SubmitBlockOutcome::Rejected(bad_prevblk(&header)));
        }
        let ctx = self.index.context_for(Some(parent), &self.params);
        if let Err(reason) = contextual_check_header(&header, &ctx) {
            self.remember_invalid(&header)?;
            return Ok(SubmitBlockOutcome::Rejected(reason));
        }

        let id = self.index.insert_header(&header);
        self.index.set_status(id, BlockStatus::ValidHeader);
        let mut db = self.chain_db()?;
        self.persist_entries(&mut db, &[id])?;
        debug!("Accepted header {} at height {}", hash_to_hex(&hash), ctx.height);
        Ok(SubmitBlockOutcome::Accepted)
    }

    /// ProcessBlock: 𝔹 → outcome
    ///
    /// 1. Known invalid hashes are rejected, stored ones are duplicates
    /// 2. CheckBlock; failures other than proof of work, future time or
    ///    possible body mutation mark the hash invalid
    /// 3. Unknown parent: hold as an orphan
    /// 4. AcceptBlock, then every orphan that was waiting on it
    /// 5. Activate the most-work chain
    pub fn process_block(&mut self, block: Block) -> Result<SubmitBlockOutcome> {
        // 1. Duplicates
        let hash = calculate_block_hash(&block.header);
        if let Some(entry) = self.index.get_by_hash(&hash) {
            if entry.is_invalid() {
                return Ok(SubmitBlockOutcome::Rejected(duplicate_invalid(&hash)));
            }
            if entry.has_body() {
                return Ok(SubmitBlockOutcome::DuplicateKnown);
            }
        }
        if self.orphans.contains(&hash) {
            return Ok(SubmitBlockOutcome::DuplicateKnown);
        }

        // 2. Context-free checks
        if let Err(reason) = check_block(&block, &self.params, self.pow.as_ref(), unix_time()) {
            warn!("ProcessBlock: CheckBlock failed for {}: {}", hash_to_hex(&hash), reason);
            let transient = reason.kind == ValidationKind::ProofOfWork
                || reason.code == "time-too-new"
                || reason.is_possible_mutation();
            if !transient {
                self.remember_invalid(&block.header)?;
            }
            return Ok(SubmitBlockOutcome::Rejected(reason));
        }

        // 3. Orphans
        let parent_stored = self
            .index
            .get_by_hash(&block.header.prev_block_hash)
            .is_some_and(|entry| entry.has_body());
        if !parent_stored {
            self.orphans.insert(hash, block);
            let missing_parent = self.orphans.missing_root(&hash);
            info!(
                "ProcessBlock: ORPHAN BLOCK {}, missing {}",
                hash_to_hex(&hash),
                hash_to_hex(&missing_parent)
            );
            return Ok(SubmitBlockOutcome::AcceptedOrphan { missing_parent });
        }

        // 4. Store, then orphans that depend on it
        if let Err(reason) = into_outcome(self.accept_block(&block, hash))? {
            return Ok(SubmitBlockOutcome::Rejected(reason));
        }
        let mut queue = vec![hash];
        while let Some(parent) = queue.pop() {
            for (orphan_hash, orphan) in self.orphans.take_children(&parent) {
                match into_outcome(self.accept_block(&orphan, orphan_hash))? {
                    Ok(()) => queue.push(orphan_hash),
                    Err(reason) => debug!("Orphan {} rejected: {}", hash_to_hex(&orphan_hash), reason),
                }
            }
        }

        // 5. Best chain
        let failures = self.activate_best_chain()?;
        let invalid = self.index.get_by_hash(&hash).is_some_and(|entry| entry.is_invalid());
        if invalid {
            let reason = failures
                .into_iter()
                .find(|(failed, _)| *failed == hash)
                .map(|(_, reason)| reason)
                .unwrap_or_else(|| bad_prevblk(&block.header));
            return Ok(SubmitBlockOutcome::Rejected(reason));
        }
        Ok(SubmitBlockOutcome::Accepted)
    }

    /// AcceptBlock: contextual checks, then store the body and mark the
    /// entry `ValidFull`. The parent's body must already be stored.
    fn accept_block(&mut self, block: &Block, hash: Hash) -> Result<()> {
        let parent = self.index.lookup(&block.header.prev_block_hash).ok_or_else(|| {
            LedgerError::validation(
                ValidationKind::Context,
                "prev-blk-not-found",
                format!("parent {} unknown", hash_to_hex(&block.header.prev_block_hash)),
            )
        })?;
        if self.index.has_invalid_ancestry(parent) {
            self.remember_invalid(&block.header)?;
            return Err(bad_prevblk(&block.header).into());
        }

        let ctx = self.index.context_for(Some(parent), &self.params);
        let checked = contextual_check_header(&block.header, &ctx).and_then(|_| contextual_check_block(block, &ctx));
        if let Err(reason) = checked {
            warn!("AcceptBlock: {} rejected: {}", hash_to_hex(&hash), reason);
            self.remember_invalid(&block.header)?;
            return Err(reason.into());
        }

        let (pos, _) = self.files.write_block(block)?;
        let id = self.index.insert_header(&block.header);
        self.index.set_pos(id, pos);
        self.index.set_status(id, BlockStatus::ValidFull);
        let mut db = self.chain_db()?;
        self.persist_entries(&mut db, &[id])?;
        debug!("AcceptBlock: stored {} at height {}", hash_to_hex(&hash), ctx.height);
        Ok(())
    }

    /// Switch to the most-work candidate while one beats the current tip
    /// by strictly more work. A block that fails to connect is marked
    /// invalid with its descendants and the search continues.
    fn activate_best_chain(&mut self) -> Result<Vec<(Hash, ValidationError)>> {
        let mut failures = Vec::new();
        while let Some(candidate) = self.index.best_candidate() {
            if self.index.get(candidate).chain_work <= self.best_work() {
                break;
            }
            let mut db = self.chain_db()?;
            match reorganize_chain(&mut self.index, &mut db, &self.files, candidate, &self.params) {
                Ok(result) => {
                    drop(db);
                    self.after_switch(result)?;
                }
                Err(ReorgError::ConnectFailed { block, hash, source }) => {
                    warn!("SetBestChain: reorganization to {} abandoned", hash_to_hex(&self.index.get(candidate).hash));
                    let reason = match source {
                        LedgerError::Validation(reason) => reason,
                        other => return Err(other),
                    };
                    self.invalid_chain_found(&mut db, block)?;
                    failures.push((hash, reason));
                }
                Err(ReorgError::Ledger(err)) => return Err(err),
            }
        }
        Ok(failures)
    }

    /// Mempool upkeep after the active chain moved
    fn after_switch(&mut self, result: ReorganizationResult) -> Result<()> {
        for block in &result.connected_blocks {
            self.mempool.remove_for_block(block);
        }
        if !result.disconnected_blocks.is_empty() {
            let db = self.chain_db_read()?;
            let height = self.height();
            let now = unix_time();
            for block in result.disconnected_blocks.iter().rev() {
                for tx in block.transactions.iter().filter(|tx| !is_coinbase(tx)) {
                    let outcome = self
                        .mempool
                        .accept(tx.clone(), &db, &self.files, height, now, &self.params)?;
                    if let SubmitTxOutcome::Rejected(reason) = outcome {
                        debug!("Disconnected transaction not resurrected: {}", reason);
                    }
                }
            }
        }
        info!(
            "SetBestChain: new best={} height={} work={}",
            hash_to_hex(&self.best_hash()),
            self.height(),
            self.best_work()
        );
        Ok(())
    }

    /// InvalidChainFound: mark `id` and its descendants invalid and track
    /// the most work seen on an invalid chain
    fn invalid_chain_found(&mut self, db: &mut ChainDb, id: BlockId) -> Result<()> {
        let work = self.index.get(id).chain_work;
        let changed = self.index.mark_invalid(id);
        db.txn_begin()?;
        self.persist_entries(db, &changed)?;
        if work > self.best_invalid_work {
            self.best_invalid_work = work;
            db.write_best_invalid_work(&work)?;
        }
        db.txn_commit()?;

        let entry = self.index.get(id);
        warn!(
            "InvalidChainFound: invalid block={} height={} work={}",
            hash_to_hex(&entry.hash),
            entry.height,
            entry.chain_work
        );
        if let Some(best) = self.index.best() {
            let best = self.index.get(best);
            let margin = block_work(best.bits()).mul_u64(6);
            if self.best_invalid_work > best.chain_work.add(&margin) {
                warn!("InvalidChainFound: an invalid chain leads by more than 6 blocks of work; this node or its peers may need an upgrade");
            }
        }
        Ok(())
    }

    /// Index and persist a header as invalid, when its parent is known
    fn remember_invalid(&mut self, header: &BlockHeader) -> Result<()> {
        let parent_known = self
            .index
            .get_by_hash(&header.prev_block_hash)
            .is_some_and(|entry| entry.header.is_some());
        if !parent_known {
            return Ok(());
        }
        let id = self.index.insert_header(header);
        let changed = self.index.mark_invalid(id);
        let mut db = self.chain_db()?;
        db.txn_begin()?;
        self.persist_entries(&mut db, &changed)?;
        db.txn_commit()
    }

    fn persist_entries(&self, db: &mut ChainDb, ids: &[BlockId]) -> Result<()> {
        for &id in ids {
            if let Some(record) = self.index.to_disk(id) {
                db.write_block_index(&self.index.get(id).hash, &record)?;
            }
        }
        Ok(())
    }
}

/// What the startup check found wrong with a stored block
#[derive(Debug, Clone, PartialEq, Eq)]
enum StoredFault {
    /// The bytes on disk are not the block that was indexed
    Damaged(String),
    /// The block breaks a consensus rule
    Invalid(String),
}

impl std::fmt::Display for StoredFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoredFault::Damaged(msg) => write!(f, "damaged: {msg}"),
            StoredFault::Invalid(msg) => write!(f, "invalid: {msg}"),
        }
    }
}

/// Recheck a stored body against the hash it was indexed under
///
/// The clock is not consulted: a block accepted earlier never becomes too
/// new. Failures a damaged copy could cause leave the block itself valid.
fn stored_block_fault(hash: &Hash, block: &Block, params: &ChainParams, pow: &dyn PowHash) -> Option<StoredFault> {
    if calculate_block_hash(&block.header) != *hash {
        return Some(StoredFault::Damaged("stored header does not hash to its key".to_string()));
    }
    let reason = check_block(block, params, pow, u32::MAX).err()?;
    if reason.kind == ValidationKind::ProofOfWork || reason.is_possible_mutation() {
        Some(StoredFault::Damaged(reason.to_string()))
    } else {
        Some(StoredFault::Invalid(reason.to_string()))
    }
}

fn duplicate_invalid(hash: &Hash) -> ValidationError {
    ValidationError::new(
        ValidationKind::Duplicate,
        "duplicate-invalid",
        format!("block {} is known invalid", hash_to_hex(hash)),
    )
}

fn bad_prevblk(header: &BlockHeader) -> ValidationError {
    ValidationError::new(
        ValidationKind::Context,
        "bad-prevblk",
        format!("parent {} is invalid", hash_to_hex(&header.prev_block_hash)),
    )
}

/// Split validation failures out of a result; other errors propagate
fn into_outcome<T>(result: Result<T>) -> Result<std::result::Result<T, ValidationError>> {
    match result {
        Ok(value) => Ok(Ok(value)),
        Err(LedgerError::Validation(reason)) => Ok(Err(reason)),
        Err(other) => Err(other),
    }
}
