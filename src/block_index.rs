//! In-memory block index: an arena of entries forming a forest rooted at
//! genesis
//!
//! Entries are addressed by `BlockId` (an arena slot) and looked up by
//! hash. Parent and next links are ids, never references. The active
//! chain is kept as a height-indexed vector of ids so height lookups are
//! constant time.

use crate::block::BlockContext;
use crate::config::ChainParams;
use crate::constants::CLIENT_VERSION;
use crate::hash::{calculate_block_hash, hash_to_hex};
use crate::pow::{block_work, calculate_next_work_required, U256};
use crate::types::*;
use std::collections::{HashMap, HashSet};
use tracing::{debug, warn};

pub type BlockId = usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockIndexEntry {
    pub hash: Hash,
    /// `None` while the block is known by hash only
    pub header: Option<BlockHeader>,
    pub parent: Option<BlockId>,
    /// Successor on the active chain
    pub next: Option<BlockId>,
    pub children: Vec<BlockId>,
    pub height: u32,
    pub chain_work: U256,
    pub pos: Option<DiskBlockPos>,
    pub status: BlockStatus,
    /// Order in which the entry first reached its status; lower wins ties
    pub sequence: u64,
}

impl BlockIndexEntry {
    fn placeholder(hash: Hash) -> Self {
        BlockIndexEntry {
            hash,
            header: None,
            parent: None,
            next: None,
            children: Vec::new(),
            height: 0,
            chain_work: U256::zero(),
            pos: None,
            status: BlockStatus::Unvalidated,
            sequence: u64::MAX,
        }
    }

    pub fn timestamp(&self) -> u32 {
        self.header.as_ref().map_or(0, |h| h.timestamp)
    }

    pub fn bits(&self) -> u32 {
        self.header.as_ref().map_or(0, |h| h.bits)
    }

    pub fn is_invalid(&self) -> bool {
        self.status == BlockStatus::Invalid
    }

    pub fn has_body(&self) -> bool {
        self.pos.is_some()
    }
}

#[derive(Debug, Default)]
pub struct BlockIndex {
    entries: Vec<BlockIndexEntry>,
    by_hash: HashMap<Hash, BlockId>,
    /// Active chain, `active[h]` is the block at height h
    active: Vec<BlockId>,
    /// Fully accepted blocks that may become the best tip
    candidates: HashSet<BlockId>,
    next_sequence: u64,
}

impl BlockIndex {
    pub fn new() -> Self {
        BlockIndex::default()
    }

    pub fn len(&self) -> usize {
        self.by_hash.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_hash.is_empty()
    }

    pub fn lookup(&self, hash: &Hash) -> Option<BlockId> {
        self.by_hash.get(hash).copied()
    }

    pub fn contains(&self, hash: &Hash) -> bool {
        self.by_hash.contains_key(hash)
    }

    pub fn get(&self, id: BlockId) -> &BlockIndexEntry {
        &self.entries[id]
    }

    pub fn get_by_hash(&self, hash: &Hash) -> Option<&BlockIndexEntry> {
        self.lookup(hash).map(|id| &self.entries[id])
    }

    /// InsertOrGet: the entry for `hash`, creating an empty one if unseen
    pub fn insert_or_get(&mut self, hash: Hash) -> BlockId {
        if let Some(id) = self.lookup(&hash) {
            return id;
        }
        let id = self.entries.len();
        self.entries.push(BlockIndexEntry::placeholder(hash));
        self.by_hash.insert(hash, id);
        id
    }

    /// Attach a header to its entry, linking it under its parent
    ///
    /// Height and chain work derive from the parent, which must already
    /// carry a header (or the header must be genesis, with a null parent).
    pub fn insert_header(&mut self, header: &BlockHeader) -> BlockId {
        let hash = calculate_block_hash(header);
        let id = self.insert_or_get(hash);
        if self.entries[id].header.is_some() {
            return id;
        }
        let parent = if header.prev_block_hash == [0u8; 32] {
            None
        } else {
            Some(self.insert_or_get(header.prev_block_hash))
        };
        let (height, parent_work) = match parent {
            Some(p) => (self.entries[p].height + 1, self.entries[p].chain_work),
            None => (0, U256::zero()),
        };

        let sequence = self.bump_sequence();
        let entry = &mut self.entries[id];
        entry.header = Some(header.clone());
        entry.parent = parent;
        entry.height = height;
        entry.chain_work = parent_work.add(&block_work(header.bits));
        entry.sequence = sequence;
        if let Some(p) = parent {
            self.entries[p].children.push(id);
        }
        id
    }

    fn bump_sequence(&mut self) -> u64 {
        let seq = self.next_sequence;
        self.next_sequence += 1;
        seq
    }

    /// Raise an entry's status, re-stamping its first-seen order
    pub fn set_status(&mut self, id: BlockId, status: BlockStatus) {
        if self.entries[id].status == status {
            return;
        }
        let sequence = self.bump_sequence();
        let entry = &mut self.entries[id];
        entry.status = status;
        if status == BlockStatus::ValidFull {
            entry.sequence = sequence;
            self.candidates.insert(id);
        }
    }

    pub fn set_pos(&mut self, id: BlockId, pos: DiskBlockPos) {
        self.entries[id].pos = Some(pos);
    }

    /// Mark `id` and every descendant invalid, returning what changed
    pub fn mark_invalid(&mut self, id: BlockId) -> Vec<BlockId> {
        let mut changed = Vec::new();
        let mut stack = vec![id];
        while let Some(current) = stack.pop() {
            let entry = &mut self.entries[current];
            if entry.status != BlockStatus::Invalid {
                entry.status = BlockStatus::Invalid;
                changed.push(current);
            }
            self.candidates.remove(&current);
            stack.extend(self.entries[current].children.iter().copied());
        }
        changed
    }

    /// Forget a stored body, leaving the entry a known header
    pub fn clear_body(&mut self, id: BlockId) {
        let entry = &mut self.entries[id];
        entry.pos = None;
        if entry.status == BlockStatus::ValidFull {
            entry.status = BlockStatus::ValidHeader;
        }
        self.candidates.remove(&id);
    }

    /// True if the entry or one of its ancestors is invalid
    pub fn has_invalid_ancestry(&self, id: BlockId) -> bool {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            let entry = &self.entries[current];
            if entry.is_invalid() {
                return true;
            }
            // Ancestors on the active chain were connected successfully.
            if self.is_active(current) {
                return false;
            }
            cursor = entry.parent;
        }
        false
    }

    // ------------------------------------------------------------------
    // Active chain
    // ------------------------------------------------------------------

    pub fn best(&self) -> Option<BlockId> {
        self.active.last().copied()
    }

    pub fn genesis(&self) -> Option<BlockId> {
        self.active.first().copied()
    }

    pub fn height(&self) -> Option<u32> {
        self.best().map(|id| self.entries[id].height)
    }

    pub fn at_height(&self, height: u32) -> Option<BlockId> {
        self.active.get(height as usize).copied()
    }

    pub fn is_active(&self, id: BlockId) -> bool {
        let height = self.entries[id].height as usize;
        self.active.get(height) == Some(&id)
    }

    /// Make `tip` the end of the active chain, rewriting next links
    ///
    /// Returns the ids whose next link changed.
    pub fn set_best(&mut self, tip: BlockId) -> Vec<BlockId> {
        let mut path = Vec::new();
        let mut cursor = Some(tip);
        while let Some(id) = cursor {
            if self.is_active(id) {
                break;
            }
            path.push(id);
            cursor = self.entries[id].parent;
        }
        let fork_height = cursor.map(|id| self.entries[id].height as usize + 1).unwrap_or(0);

        let mut touched = Vec::new();
        for &id in &self.active[fork_height.min(self.active.len())..] {
            self.entries[id].next = None;
            if self.entries[id].status == BlockStatus::ValidFull {
                self.candidates.insert(id);
            }
            touched.push(id);
        }
        self.active.truncate(fork_height);
        if let Some(fork) = cursor {
            self.entries[fork].next = None;
            touched.push(fork);
        }
        for id in path.into_iter().rev() {
            if let Some(&prev) = self.active.last() {
                self.entries[prev].next = Some(id);
                touched.push(prev);
            }
            self.active.push(id);
        }
        touched.push(tip);
        touched.sort_unstable();
        touched.dedup();

        self.drop_active_candidates();
        touched
    }

    fn drop_active_candidates(&mut self) {
        let (entries, active) = (&self.entries, &self.active);
        self.candidates
            .retain(|&id| active.get(entries[id].height as usize) != Some(&id));
    }

    /// FindFork: the active-chain ancestor of `id`
    pub fn find_fork(&self, id: BlockId) -> Option<BlockId> {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if self.is_active(current) {
                return Some(current);
            }
            cursor = self.entries[current].parent;
        }
        None
    }

    /// Most-work candidate tip, earliest-seen first among equals
    pub fn best_candidate(&self) -> Option<BlockId> {
        self.candidates
            .iter()
            .copied()
            .filter(|&id| self.is_connectable(id))
            .max_by(|&a, &b| {
                let (ea, eb) = (&self.entries[a], &self.entries[b]);
                ea.chain_work.cmp(&eb.chain_work).then(eb.sequence.cmp(&ea.sequence))
            })
    }

    /// True if every block from `id` back to the active chain is valid
    /// and has its body stored
    fn is_connectable(&self, id: BlockId) -> bool {
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if self.is_active(current) {
                return true;
            }
            let entry = &self.entries[current];
            if entry.is_invalid() || !entry.has_body() {
                return false;
            }
            cursor = entry.parent;
        }
        false
    }

    // ------------------------------------------------------------------
    // Chain context
    // ------------------------------------------------------------------

    /// Ancestor of `id` at `height`
    pub fn ancestor(&self, id: BlockId, height: u32) -> Option<BlockId> {
        if height > self.entries[id].height {
            return None;
        }
        if self.is_active(id) {
            return self.at_height(height);
        }
        let mut cursor = id;
        while self.entries[cursor].height > height {
            cursor = self.entries[cursor].parent?;
        }
        Some(cursor)
    }

    /// Median timestamp of `id` and up to `span - 1` ancestors
    pub fn median_time_past(&self, id: BlockId, span: usize) -> u32 {
        let mut times = Vec::with_capacity(span);
        let mut cursor = Some(id);
        while let Some(current) = cursor {
            if times.len() == span {
                break;
            }
            times.push(self.entries[current].timestamp());
            cursor = self.entries[current].parent;
        }
        times.sort_unstable();
        times.get(times.len() / 2).copied().unwrap_or(0)
    }

    /// GetNextWorkRequired: compact difficulty for the child of `parent`
    ///
    /// 1. Off a retarget boundary, or without retargeting, keep the parent's bits
    /// 2. On a boundary, measure the time of the last full interval; the
    ///    first retarget looks back one block less for lack of history
    pub fn next_work_required(&self, parent: Option<BlockId>, params: &ChainParams) -> u32 {
        let Some(parent) = parent else {
            return params.pow_limit_bits;
        };
        let last = &self.entries[parent];
        let interval = params.retarget_interval();
        if params.no_retargeting || (last.height + 1) % interval != 0 {
            return last.bits();
        }

        let go_back = if last.height + 1 == interval { interval - 1 } else { interval };
        let first_height = last.height.saturating_sub(go_back);
        let first_time = self
            .ancestor(parent, first_height)
            .map(|id| self.entries[id].timestamp())
            .unwrap_or_else(|| last.timestamp());
        let bits = calculate_next_work_required(last.bits(), last.timestamp(), first_time, params);
        debug!(
            "Retarget at height {}: {:#010x} -> {:#010x}",
            last.height + 1,
            last.bits(),
            bits
        );
        bits
    }

    /// Context a child of `parent` is checked against
    pub fn context_for(&self, parent: Option<BlockId>, params: &ChainParams) -> BlockContext {
        BlockContext {
            height: parent.map_or(0, |p| self.entries[p].height + 1),
            median_time_past: parent.map_or(0, |p| self.median_time_past(p, params.median_time_span)),
            required_bits: self.next_work_required(parent, params),
        }
    }

    // ------------------------------------------------------------------
    // Persistence
    // ------------------------------------------------------------------

    /// Persisted form of an entry; `None` for hash-only placeholders
    pub fn to_disk(&self, id: BlockId) -> Option<DiskBlockIndex> {
        let entry = &self.entries[id];
        Some(DiskBlockIndex {
            client_version: CLIENT_VERSION,
            header: entry.header.clone()?,
            hash_next: entry.next.map(|n| self.entries[n].hash),
            pos: entry.pos,
            height: entry.height,
            status: entry.status,
        })
    }

    /// Load: rebuild the index from persisted records
    ///
    /// 1. Create an entry per record and link it to its parent
    /// 2. CheckIndex each entry: its hash matches its header, and its height
    ///    is the parent's plus one (zero for `genesis_hash`); failures are
    ///    logged and excluded together with their descendants
    /// 3. Recompute chain work in ascending height order
    ///
    /// The active chain is left empty; the caller restores it from the
    /// best-chain pointer. Returns the index and the excluded hashes.
    pub fn load(records: Vec<(Hash, DiskBlockIndex)>, genesis_hash: &Hash) -> (BlockIndex, Vec<Hash>) {
        let mut index = BlockIndex::new();
        let mut next_links = Vec::new();
        let mut loaded = Vec::with_capacity(records.len());

        // 1. Entries and parent links
        for (hash, record) in records {
            let id = index.insert_or_get(hash);
            let parent = if record.header.prev_block_hash == [0u8; 32] {
                None
            } else {
                Some(index.insert_or_get(record.header.prev_block_hash))
            };
            if let Some(next) = record.hash_next {
                next_links.push((id, next));
            }
            let entry = &mut index.entries[id];
            entry.header = Some(record.header);
            entry.parent = parent;
            entry.height = record.height;
            entry.pos = record.pos;
            entry.status = record.status;
            if let Some(p) = parent {
                index.entries[p].children.push(id);
            }
            loaded.push(id);
        }
        for (id, next) in next_links {
            index.entries[id].next = index.lookup(&next);
        }

        // 2. CheckIndex
        let mut rejected = Vec::new();
        for &id in &loaded {
            if let Err(reason) = index.check_entry(id, genesis_hash) {
                let entry = &index.entries[id];
                warn!("CheckIndex failed at height {} ({}): {}", entry.height, hash_to_hex(&entry.hash), reason);
                for bad in index.mark_invalid(id) {
                    rejected.push(index.entries[bad].hash);
                }
            }
        }

        // 3. Chain work and first-seen order by height
        let mut by_height: Vec<BlockId> = loaded;
        by_height.sort_by_key(|&id| index.entries[id].height);
        for id in by_height {
            let parent_work = index.entries[id]
                .parent
                .map(|p| index.entries[p].chain_work)
                .unwrap_or_else(U256::zero);
            let sequence = index.bump_sequence();
            let entry = &mut index.entries[id];
            entry.chain_work = parent_work.add(&block_work(entry.bits()));
            entry.sequence = sequence;
            if entry.status == BlockStatus::ValidFull {
                index.candidates.insert(id);
            }
        }

        debug!("Loaded {} block index entries, {} rejected", index.len(), rejected.len());
        (index, rejected)
    }

    fn check_entry(&self, id: BlockId, genesis_hash: &Hash) -> std::result::Result<(), String> {
        let entry = &self.entries[id];
        let header = entry.header.as_ref().ok_or("no header")?;
        if calculate_block_hash(header) != entry.hash {
            return Err("stored header does not hash to its key".to_string());
        }
        match entry.parent {
            None => {
                if entry.height != 0 || entry.hash != *genesis_hash {
                    return Err("parentless entry is not genesis".to_string());
                }
            }
            Some(p) => {
                let parent = &self.entries[p];
                if parent.header.is_none() {
                    return Err("parent record missing".to_string());
                }
                if entry.height != parent.height + 1 {
                    return Err(format!("height {} but parent height {}", entry.height, parent.height));
                }
            }
        }
        Ok(())
    }

    /// Rebuild the active chain ending at `tip` without touching next links
    pub fn restore_active(&mut self, tip: BlockId) {
        let mut path = Vec::new();
        let mut cursor = Some(tip);
        while let Some(id) = cursor {
            path.push(id);
            cursor = self.entries[id].parent;
        }
        path.reverse();
        self.active = path;
        self.drop_active_candidates();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(prev: Hash, nonce: u32, time: u32) -> BlockHeader {
        BlockHeader {
            version: 1,
            prev_block_hash: prev,
            merkle_root: [0; 32],
            timestamp: time,
            bits: 0x207fffff,
            nonce,
        }
    }

    /// Record a body for `id` and raise it to `ValidFull`
    fn store(index: &mut BlockIndex, id: BlockId) {
        index.set_pos(id, DiskBlockPos { file: 0, pos: id as u32 * 1000 });
        index.set_status(id, BlockStatus::ValidFull);
    }

    /// Genesis plus `len` blocks on top of it, all active
    fn chain(len: u32) -> (BlockIndex, Vec<BlockId>) {
        let mut index = BlockIndex::new();
        let mut ids = vec![index.insert_header(&header([0; 32], 0, 100))];
        for i in 1..=len {
            let prev = index.get(*ids.last().unwrap()).hash;
            ids.push(index.insert_header(&header(prev, i, 100 + i * 10)));
        }
        for &id in &ids {
            store(&mut index, id);
        }
        index.set_best(*ids.last().unwrap());
        (index, ids)
    }

    #[test]
    fn test_insert_or_get_is_idempotent() {
        let mut index = BlockIndex::new();
        let a = index.insert_or_get([1; 32]);
        let b = index.insert_or_get([1; 32]);
        assert_eq!(a, b);
        assert_eq!(index.len(), 1);
        assert!(index.get(a).header.is_none());
    }

    #[test]
    fn test_heights_and_work_accumulate() {
        let (index, ids) = chain(3);
        for (h, &id) in ids.iter().enumerate() {
            assert_eq!(index.get(id).height, h as u32);
        }
        // Regtest work is 2 per block.
        assert_eq!(index.get(ids[3]).chain_work, U256::from_u64(8));
        for pair in ids.windows(2) {
            assert!(index.get(pair[1]).chain_work > index.get(pair[0]).chain_work);
        }
    }

    #[test]
    fn test_active_chain_and_next_links() {
        let (index, ids) = chain(3);
        assert_eq!(index.best(), Some(ids[3]));
        assert_eq!(index.height(), Some(3));
        assert_eq!(index.at_height(2), Some(ids[2]));
        assert_eq!(index.get(ids[1]).next, Some(ids[2]));
        assert_eq!(index.get(ids[3]).next, None);
    }

    #[test]
    fn test_set_best_switches_branch() {
        let (mut index, ids) = chain(3);
        let fork_prev = index.get(ids[1]).hash;
        let side1 = index.insert_header(&header(fork_prev, 99, 500));
        let side2 = index.insert_header(&header(index.get(side1).hash, 98, 510));
        let side3 = index.insert_header(&header(index.get(side2).hash, 97, 520));

        assert_eq!(index.find_fork(side3), Some(ids[1]));
        index.set_best(side3);
        assert_eq!(index.height(), Some(4));
        assert_eq!(index.at_height(2), Some(side1));
        assert_eq!(index.get(ids[1]).next, Some(side1));
        assert_eq!(index.get(ids[2]).next, None);
        assert!(!index.is_active(ids[3]));
    }

    #[test]
    fn test_best_candidate_prefers_first_seen() {
        let (mut index, ids) = chain(1);
        let tip_hash = index.get(ids[1]).hash;
        let first = index.insert_header(&header(tip_hash, 77, 200));
        let second = index.insert_header(&header(tip_hash, 78, 200));
        store(&mut index, second);
        store(&mut index, first);
        // Equal work: whichever reached ValidFull first wins.
        assert_eq!(index.get(first).chain_work, index.get(second).chain_work);
        assert_eq!(index.best_candidate(), Some(second));
    }

    #[test]
    fn test_best_candidate_skips_invalid_branch() {
        let (mut index, ids) = chain(1);
        let tip_hash = index.get(ids[1]).hash;
        let bad = index.insert_header(&header(tip_hash, 80, 200));
        let child = index.insert_header(&header(index.get(bad).hash, 81, 210));
        store(&mut index, bad);
        store(&mut index, child);
        assert_eq!(index.best_candidate(), Some(child));
        index.mark_invalid(bad);
        assert_eq!(index.best_candidate(), None);
    }

    #[test]
    fn test_mark_invalid_propagates_to_descendants() {
        let (mut index, ids) = chain(3);
        let changed = index.mark_invalid(ids[2]);
        assert_eq!(changed.len(), 2);
        assert!(index.get(ids[3]).is_invalid());
        assert!(!index.get(ids[1]).is_invalid());
    }

    #[test]
    fn test_median_time_past() {
        let (index, ids) = chain(12);
        // Timestamps 100, 110, ..., 220; the last eleven are 120..=220.
        assert_eq!(index.median_time_past(ids[12], 11), 170);
        assert_eq!(index.median_time_past(ids[0], 11), 100);
    }

    #[test]
    fn test_next_work_required_without_retarget() {
        let (index, ids) = chain(2);
        let params = ChainParams::regtest();
        assert_eq!(index.next_work_required(Some(ids[2]), &params), 0x207fffff);
        assert_eq!(index.next_work_required(None, &params), params.pow_limit_bits);
    }

    #[test]
    fn test_next_work_required_at_boundary() {
        let mut params = ChainParams::regtest();
        params.no_retargeting = false;
        params.pow_limit_bits = 0x207fffff;
        params.target_timespan = 40;
        params.target_spacing = 10;
        // Interval of 4: a retarget happens for height 4.
        let (index, ids) = chain(3);
        let bits = index.next_work_required(Some(ids[3]), &params);
        // The first retarget sees three 10s gaps against a 40s timespan,
        // so the target tightens by a quarter.
        let limit = crate::pow::decode_compact(params.pow_limit_bits).target;
        let target = crate::pow::decode_compact(bits).target;
        assert!(target < limit);
        assert!(target > limit.shr(1));
        assert_eq!(index.next_work_required(Some(ids[2]), &params), 0x207fffff);
    }

    #[test]
    fn test_load_rebuilds_and_excludes_bad_heights() {
        let (index, ids) = chain(3);
        let genesis_hash = index.get(ids[0]).hash;
        let mut records: Vec<(Hash, DiskBlockIndex)> =
            ids.iter().map(|&id| (index.get(id).hash, index.to_disk(id).unwrap())).collect();
        // Corrupt the height of block 2; block 3 goes with it.
        records[2].1.height = 7;

        let (loaded, rejected) = BlockIndex::load(records, &genesis_hash);
        assert_eq!(rejected.len(), 2);
        let tip = loaded.lookup(&index.get(ids[1]).hash).unwrap();
        assert_eq!(loaded.get(tip).chain_work, U256::from_u64(4));
        assert_eq!(loaded.get(tip).next, loaded.lookup(&index.get(ids[2]).hash));
        assert!(loaded.get_by_hash(&index.get(ids[3]).hash).unwrap().is_invalid());
    }

    #[test]
    fn test_restore_active_from_tip() {
        let (index, ids) = chain(2);
        let genesis_hash = index.get(ids[0]).hash;
        let records = ids.iter().map(|&id| (index.get(id).hash, index.to_disk(id).unwrap())).collect();
        let (mut loaded, rejected) = BlockIndex::load(records, &genesis_hash);
        assert!(rejected.is_empty());
        let tip = loaded.lookup(&index.get(ids[2]).hash).unwrap();
        loaded.restore_active(tip);
        assert_eq!(loaded.height(), Some(2));
        assert_eq!(loaded.genesis(), loaded.lookup(&genesis_hash));
    }

    #[test]
    fn test_rollback_keeps_heavier_side_branch() {
        // Main G-1-2-3-4, side G-1-2'-3'
        let (mut index, ids) = chain(4);
        let side2 = index.insert_header(&header(index.get(ids[1]).hash, 60, 500));
        let side3 = index.insert_header(&header(index.get(side2).hash, 61, 510));
        store(&mut index, side2);
        store(&mut index, side3);
        assert_eq!(index.best_candidate(), Some(side3));

        // Back to block 2: both tips outweigh the active chain again.
        index.set_best(ids[2]);
        assert_eq!(index.best_candidate(), Some(ids[4]));
        index.mark_invalid(ids[3]);
        assert_eq!(index.best_candidate(), Some(side3));
        assert!(index.get(side3).chain_work > index.get(ids[2]).chain_work);
    }

    #[test]
    fn test_missing_body_blocks_descendants() {
        let (mut index, ids) = chain(3);
        index.set_best(ids[1]);
        assert_eq!(index.best_candidate(), Some(ids[3]));

        index.clear_body(ids[2]);
        assert_eq!(index.get(ids[2]).status, BlockStatus::ValidHeader);
        assert_eq!(index.best_candidate(), None);

        store(&mut index, ids[2]);
        assert_eq!(index.best_candidate(), Some(ids[3]));
    }

    #[test]
    fn test_load_keeps_side_branch_candidates() {
        let (mut index, ids) = chain(2);
        let side = index.insert_header(&header(index.get(ids[0]).hash, 50, 300));
        store(&mut index, side);
        let genesis_hash = index.get(ids[0]).hash;
        let records = [ids[0], ids[1], ids[2], side]
            .iter()
            .map(|&id| (index.get(id).hash, index.to_disk(id).unwrap()))
            .collect();
        let (mut loaded, _) = BlockIndex::load(records, &genesis_hash);
        let tip = loaded.lookup(&index.get(ids[2]).hash).unwrap();
        loaded.restore_active(tip);
        assert_eq!(loaded.best_candidate(), loaded.lookup(&index.get(side).hash));
    }
}
