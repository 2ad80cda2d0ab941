//! Ledger store: transactional key-value namespaces over sled
//!
//! One `Environment` owns the on-disk database. Each logical file is a
//! namespace (a sled tree) opened through a `Database` handle. The
//! environment counts open handles per namespace so background work can
//! tell when a namespace is quiescent:
//!
//! - `flush(false)` checkpoints only namespaces with no open handles
//! - `flush(true)` checkpoints everything and is used at shutdown
//! - `rewrite` waits for zero handles before compacting a namespace
//!
//! Writes outside an explicit transaction apply immediately. Inside a
//! transaction they accumulate in an overlay that reads and cursors see,
//! and `txn_commit` applies the overlay as one atomic sled batch. Dropping a
//! handle with an open transaction aborts it.

use crate::constants::CLIENT_VERSION;
use crate::serialization::{deserialize, serialize, Decodable, Encodable};
use parking_lot::Mutex;
use std::collections::btree_map;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::iter::Peekable;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum StorageError {
    /// Environment could not be opened
    #[error("Database open failed: {0}")]
    OpenFailed(String),

    /// Underlying engine failure
    #[error("Storage backend failure: {0}")]
    Backend(String),

    /// A stored record failed to decode
    #[error("Corrupt record: {0}")]
    Corrupt(String),

    #[error("Namespace not found: {0}")]
    NamespaceNotFound(String),

    #[error("Transaction already active")]
    TxnActive,

    #[error("No active transaction")]
    NoTxn,

    #[error("Database opened read-only")]
    ReadOnly,

    #[error("Environment shutting down")]
    ShuttingDown,
}

impl From<sled::Error> for StorageError {
    fn from(err: sled::Error) -> Self {
        match err {
            sled::Error::Corruption { .. } => StorageError::Corrupt(err.to_string()),
            other => StorageError::Backend(other.to_string()),
        }
    }
}

pub type StorageResult<T> = std::result::Result<T, StorageError>;

/// Interval between checks while waiting for a namespace to go idle
const REWRITE_POLL: Duration = Duration::from_millis(100);

/// Suffix of the scratch namespace used by `rewrite`
const REWRITE_SUFFIX: &str = ".rewrite";

/// Key of the per-namespace version record
pub fn version_key() -> Vec<u8> {
    serialize("version")
}

// ============================================================================
// Environment
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    /// Existing namespace, reads only
    ReadOnly,
    /// Existing namespace, reads and writes
    ReadWrite,
    /// Create the namespace if missing
    Create,
}

#[derive(Debug, Default)]
struct UseTracking {
    counts: HashMap<String, usize>,
    dirty: HashSet<String>,
}

/// Shared storage environment
#[derive(Debug)]
pub struct Environment {
    db: sled::Db,
    path: PathBuf,
    tracking: Mutex<UseTracking>,
    updates: AtomicU64,
    shutting_down: AtomicBool,
    sync_on_commit: bool,
}

impl Environment {
    /// Open (or create) the environment rooted at `path`
    ///
    /// Failure here is fatal for the node: nothing can proceed without
    /// durable storage.
    pub fn open(path: &Path, cache_capacity: u64, sync_on_commit: bool) -> StorageResult<Arc<Self>> {
        std::fs::create_dir_all(path)
            .map_err(|e| StorageError::OpenFailed(format!("creating {}: {}", path.display(), e)))?;
        let db = sled::Config::new()
            .path(path.join("store"))
            .cache_capacity(cache_capacity)
            .flush_every_ms(None)
            .open()
            .map_err(|e| StorageError::OpenFailed(format!("{}: {}", path.display(), e)))?;

        info!(
            "Opened ledger store at {:?} with {}MB cache",
            path,
            cache_capacity / (1024 * 1024)
        );
        Ok(Arc::new(Environment {
            db,
            path: path.to_path_buf(),
            tracking: Mutex::new(UseTracking::default()),
            updates: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
            sync_on_commit,
        }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a handle on namespace `name`
    pub fn open_database(self: &Arc<Self>, name: &str, mode: OpenMode) -> StorageResult<Database> {
        if self.is_shutting_down() {
            return Err(StorageError::ShuttingDown);
        }
        validate_namespace(name)?;

        let mut tracking = self.tracking.lock();
        let exists = self.namespace_exists(name);
        if !exists && mode != OpenMode::Create {
            return Err(StorageError::NamespaceNotFound(name.to_string()));
        }
        let tree = self.db.open_tree(name)?;
        if !exists {
            tree.insert(version_key(), serialize(&CLIENT_VERSION))?;
            tracking.dirty.insert(name.to_string());
            debug!("Created namespace {}", name);
        }
        *tracking.counts.entry(name.to_string()).or_insert(0) += 1;

        Ok(Database {
            env: Arc::clone(self),
            name: name.to_string(),
            tree,
            read_only: mode == OpenMode::ReadOnly,
            txn: None,
        })
    }

    pub fn namespace_exists(&self, name: &str) -> bool {
        self.db.tree_names().iter().any(|n| &n[..] == name.as_bytes())
    }

    /// Number of open handles on `name`
    pub fn use_count(&self, name: &str) -> usize {
        self.tracking.lock().counts.get(name).copied().unwrap_or(0)
    }

    /// Monotonic count of applied writes and commits
    pub fn update_counter(&self) -> u64 {
        self.updates.load(Ordering::SeqCst)
    }

    pub fn begin_shutdown(&self) {
        self.shutting_down.store(true, Ordering::SeqCst);
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    fn release(&self, name: &str) {
        let mut tracking = self.tracking.lock();
        if let Some(count) = tracking.counts.get_mut(name) {
            *count = count.saturating_sub(1);
        }
    }

    fn mark_dirty(&self, name: &str) {
        self.updates.fetch_add(1, Ordering::SeqCst);
        self.tracking.lock().dirty.insert(name.to_string());
    }

    /// Checkpoint pending writes to disk
    ///
    /// Without `shutdown`, only namespaces with zero open handles are
    /// checkpointed; busy ones stay pending for the next pass. With
    /// `shutdown`, everything is checkpointed regardless of handles.
    /// Returns the number of namespaces checkpointed.
    pub fn flush(&self, shutdown: bool) -> StorageResult<usize> {
        let mut tracking = self.tracking.lock();
        let ready: Vec<String> = tracking
            .dirty
            .iter()
            .filter(|name| shutdown || tracking.counts.get(*name).copied().unwrap_or(0) == 0)
            .cloned()
            .collect();

        if ready.is_empty() && !shutdown {
            return Ok(0);
        }
        self.db.flush()?;
        for name in &ready {
            tracking.dirty.remove(name);
            debug!("Flushed namespace {}", name);
        }
        if shutdown {
            info!("Store checkpointed for shutdown ({} namespaces)", ready.len());
        }
        Ok(ready.len())
    }

    /// Compact namespace `name` by copying every entry whose key does not
    /// start with `skip_prefix` into a scratch namespace, then replacing the
    /// original contents in one atomic batch. Waits while other handles hold
    /// the namespace open.
    pub fn rewrite(&self, name: &str, skip_prefix: Option<&[u8]>) -> StorageResult<()> {
        validate_namespace(name)?;
        loop {
            if self.is_shutting_down() {
                return Err(StorageError::ShuttingDown);
            }
            {
                let mut tracking = self.tracking.lock();
                if tracking.counts.get(name).copied().unwrap_or(0) == 0 {
                    info!("Rewriting namespace {}", name);
                    let copied = self.rewrite_locked(name, skip_prefix)?;
                    tracking.dirty.remove(name);
                    info!("Rewrote namespace {} ({} records kept)", name, copied);
                    return Ok(());
                }
            }
            debug!("Namespace {} busy, waiting to rewrite", name);
            std::thread::sleep(REWRITE_POLL);
        }
    }

    fn rewrite_locked(&self, name: &str, skip_prefix: Option<&[u8]>) -> StorageResult<usize> {
        if !self.namespace_exists(name) {
            return Err(StorageError::NamespaceNotFound(name.to_string()));
        }
        let source = self.db.open_tree(name)?;
        let scratch_name = format!("{name}{REWRITE_SUFFIX}");
        let scratch = self.db.open_tree(&scratch_name)?;
        scratch.clear()?;

        let version = version_key();
        for item in source.iter() {
            let (key, value) = item?;
            if let Some(prefix) = skip_prefix {
                if key.starts_with(prefix) {
                    continue;
                }
            }
            if key.as_ref() == version.as_slice() {
                scratch.insert(key, serialize(&CLIENT_VERSION))?;
            } else {
                scratch.insert(key, value)?;
            }
        }
        if scratch.get(&version)?.is_none() {
            scratch.insert(version.as_slice(), serialize(&CLIENT_VERSION))?;
        }
        scratch.flush()?;

        let mut batch = sled::Batch::default();
        for item in source.iter().keys() {
            batch.remove(item?);
        }
        let mut copied = 0;
        for item in scratch.iter() {
            let (key, value) = item?;
            batch.insert(key, value);
            copied += 1;
        }
        source.apply_batch(batch)?;
        source.flush()?;

        if !self.db.drop_tree(scratch_name.as_bytes())? {
            warn!("Scratch namespace {} was already gone", scratch_name);
        }
        self.updates.fetch_add(1, Ordering::SeqCst);
        Ok(copied)
    }
}

fn validate_namespace(name: &str) -> StorageResult<()> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && !name.ends_with(REWRITE_SUFFIX)
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-' || c == '.');
    if valid {
        Ok(())
    } else {
        Err(StorageError::Backend(format!("invalid namespace name {name:?}")))
    }
}

// ============================================================================
// Database handle
// ============================================================================

type Overlay = BTreeMap<Vec<u8>, Option<Vec<u8>>>;

/// Handle on one namespace; counts as a user of it until dropped
pub struct Database {
    env: Arc<Environment>,
    name: String,
    tree: sled::Tree,
    read_only: bool,
    txn: Option<Overlay>,
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.name)
            .field("read_only", &self.read_only)
            .field("in_txn", &self.txn.is_some())
            .finish()
    }
}

impl Database {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn environment(&self) -> &Arc<Environment> {
        &self.env
    }

    pub fn in_txn(&self) -> bool {
        self.txn.is_some()
    }

    // ------------------------------------------------------------------
    // Raw access
    // ------------------------------------------------------------------

    pub fn read_raw(&self, key: &[u8]) -> StorageResult<Option<Vec<u8>>> {
        if let Some(overlay) = &self.txn {
            if let Some(pending) = overlay.get(key) {
                return Ok(pending.clone());
            }
        }
        Ok(self.tree.get(key)?.map(|v| v.to_vec()))
    }

    pub fn write_raw(&mut self, key: Vec<u8>, value: Vec<u8>) -> StorageResult<()> {
        self.check_writable()?;
        match &mut self.txn {
            Some(overlay) => {
                overlay.insert(key, Some(value));
            }
            None => {
                self.tree.insert(key, value)?;
                self.env.mark_dirty(&self.name);
            }
        }
        Ok(())
    }

    pub fn erase_raw(&mut self, key: Vec<u8>) -> StorageResult<()> {
        self.check_writable()?;
        match &mut self.txn {
            Some(overlay) => {
                overlay.insert(key, None);
            }
            None => {
                self.tree.remove(key)?;
                self.env.mark_dirty(&self.name);
            }
        }
        Ok(())
    }

    fn check_writable(&self) -> StorageResult<()> {
        if self.read_only {
            return Err(StorageError::ReadOnly);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Typed records
    // ------------------------------------------------------------------

    /// Read and decode the record at `key`
    pub fn read<K, V>(&self, key: &K) -> StorageResult<Option<V>>
    where
        K: Encodable + ?Sized,
        V: Decodable,
    {
        match self.read_raw(&serialize(key))? {
            None => Ok(None),
            Some(bytes) => deserialize(&bytes)
                .map(Some)
                .map_err(|e| StorageError::Corrupt(format!("{} record: {}", self.name, e))),
        }
    }

    pub fn write<K, V>(&mut self, key: &K, value: &V) -> StorageResult<()>
    where
        K: Encodable + ?Sized,
        V: Encodable + ?Sized,
    {
        self.write_raw(serialize(key), serialize(value))
    }

    pub fn erase<K: Encodable + ?Sized>(&mut self, key: &K) -> StorageResult<()> {
        self.erase_raw(serialize(key))
    }

    pub fn exists<K: Encodable + ?Sized>(&self, key: &K) -> StorageResult<bool> {
        Ok(self.read_raw(&serialize(key))?.is_some())
    }

    /// Version recorded when the namespace was created or last rewritten
    pub fn read_version(&self) -> StorageResult<Option<i32>> {
        self.read("version")
    }

    pub fn write_version(&mut self, version: i32) -> StorageResult<()> {
        self.write("version", &version)
    }

    // ------------------------------------------------------------------
    // Transactions
    // ------------------------------------------------------------------

    pub fn txn_begin(&mut self) -> StorageResult<()> {
        self.check_writable()?;
        if self.txn.is_some() {
            return Err(StorageError::TxnActive);
        }
        self.txn = Some(Overlay::new());
        Ok(())
    }

    /// Apply every write of the transaction atomically
    pub fn txn_commit(&mut self) -> StorageResult<()> {
        let overlay = self.txn.take().ok_or(StorageError::NoTxn)?;
        if overlay.is_empty() {
            return Ok(());
        }
        let mut batch = sled::Batch::default();
        let writes = overlay.len();
        for (key, value) in overlay {
            match value {
                Some(v) => batch.insert(key, v),
                None => batch.remove(key),
            }
        }
        self.tree.apply_batch(batch)?;
        if self.env.sync_on_commit {
            self.tree.flush()?;
        }
        self.env.mark_dirty(&self.name);
        debug!("Committed {} writes to {}", writes, self.name);
        Ok(())
    }

    /// Discard every write of the transaction
    pub fn txn_abort(&mut self) -> StorageResult<()> {
        self.txn.take().ok_or(StorageError::NoTxn)?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Cursors
    // ------------------------------------------------------------------

    /// Iterate entries in key order starting at `start`
    ///
    /// Pending writes of an open transaction are merged in, so a cursor
    /// sees the same state as `read`.
    pub fn cursor_from(&self, start: &[u8]) -> Cursor<'_> {
        let pending = match &self.txn {
            Some(overlay) => overlay.range(start.to_vec()..).peekable(),
            None => EMPTY_OVERLAY.range(start.to_vec()..).peekable(),
        };
        Cursor {
            stored: self.tree.range(start.to_vec()..).peekable(),
            pending,
            prefix: None,
            done: false,
        }
    }

    /// Iterate entries whose key starts with `prefix`
    pub fn cursor_prefix(&self, prefix: &[u8]) -> Cursor<'_> {
        let mut cursor = self.cursor_from(prefix);
        cursor.prefix = Some(prefix.to_vec());
        cursor
    }

    /// Iterate every entry of the namespace
    pub fn cursor(&self) -> Cursor<'_> {
        self.cursor_from(&[])
    }
}

static EMPTY_OVERLAY: Overlay = BTreeMap::new();

impl Drop for Database {
    fn drop(&mut self) {
        if self.txn.take().is_some() {
            debug!("Aborting open transaction on {} at close", self.name);
        }
        self.env.release(&self.name);
    }
}

/// Ordered iterator over a namespace merged with pending transaction writes
pub struct Cursor<'a> {
    stored: Peekable<sled::Iter>,
    pending: Peekable<btree_map::Range<'a, Vec<u8>, Option<Vec<u8>>>>,
    prefix: Option<Vec<u8>>,
    done: bool,
}

impl<'a> Cursor<'a> {
    fn next_merged(&mut self) -> Option<StorageResult<(Vec<u8>, Vec<u8>)>> {
        loop {
            let stored_key = match self.stored.peek() {
                Some(Ok((k, _))) => Some(k.to_vec()),
                Some(Err(_)) => {
                    return match self.stored.next() {
                        Some(Err(e)) => Some(Err(e.into())),
                        _ => None,
                    };
                }
                None => None,
            };
            let pending_key = self.pending.peek().map(|(k, _)| (*k).clone());

            let take_pending = match (&stored_key, &pending_key) {
                (None, None) => return None,
                (Some(_), None) => false,
                (None, Some(_)) => true,
                (Some(s), Some(p)) => {
                    if p == s {
                        // Pending write shadows the stored value.
                        self.stored.next();
                        true
                    } else {
                        p < s
                    }
                }
            };

            if take_pending {
                if let Some((key, value)) = self.pending.next() {
                    match value {
                        Some(v) => return Some(Ok((key.clone(), v.clone()))),
                        None => continue,
                    }
                }
            } else if let Some(item) = self.stored.next() {
                return Some(
                    item.map(|(k, v)| (k.to_vec(), v.to_vec()))
                        .map_err(StorageError::from),
                );
            }
        }
    }
}

impl<'a> Iterator for Cursor<'a> {
    type Item = StorageResult<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let item = self.next_merged();
        match (&self.prefix, &item) {
            (_, None) => self.done = true,
            (Some(prefix), Some(Ok((key, _)))) if !key.starts_with(prefix) => {
                self.done = true;
                return None;
            }
            _ => {}
        }
        item
    }
}
