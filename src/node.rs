//! External interface of the ledger core
//!
//! `Node` serializes every chain operation behind one reentrant main lock.
//! External callers wait at most `lock_timeout_ms` for it and get
//! `ConcurrencyTimeout` otherwise; a thread that already holds the lock
//! (see [`Node::lock`]) re-enters without waiting.
//!
//! A background thread checkpoints idle store namespaces every
//! `flush_interval_ms`. `shutdown` stops new work, waits for the operation
//! in flight, then forces a checkpoint of everything.

use crate::addrdb::{load_addresses, AddrDb};
use crate::chain::{ChainState, SubmitBlockOutcome};
use crate::config::NodeConfig;
use crate::error::{LedgerError, Result, ValidationError, ValidationKind};
use crate::mempool::SubmitTxOutcome;
use crate::mining::{BlockTemplate, TemplateCache};
use crate::pow::{PowHash, Sha256dPow};
use crate::serialization::deserialize;
use crate::storage::{Environment, OpenMode};
use crate::types::*;
use crate::walletdb::WalletDb;
use parking_lot::{Mutex, ReentrantMutex, ReentrantMutexGuard};
use std::cell::RefCell;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{error, info, warn};

type MainLock = ReentrantMutex<RefCell<ChainState>>;

/// Held main lock; chain calls made on this thread while it lives
/// re-enter instead of waiting
pub struct MainLockGuard<'a> {
    _guard: ReentrantMutexGuard<'a, RefCell<ChainState>>,
}

struct Flusher {
    stop: mpsc::Sender<()>,
    handle: JoinHandle<()>,
}

pub struct Node {
    chain: MainLock,
    env: Arc<Environment>,
    lock_timeout: Duration,
    flusher: Mutex<Option<Flusher>>,
    shutting_down: AtomicBool,
}

impl std::fmt::Debug for Node {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Node")
            .field("path", &self.env.path())
            .field("lock_timeout", &self.lock_timeout)
            .field("shutting_down", &self.shutting_down.load(Ordering::SeqCst))
            .finish()
    }
}

impl Node {
    /// Open with the double SHA-256 proof-of-work hash
    pub fn open(config: &NodeConfig) -> Result<Self> {
        Node::open_with_pow(config, Box::new(Sha256dPow))
    }

    pub fn open_with_pow(config: &NodeConfig, pow: Box<dyn PowHash>) -> Result<Self> {
        let chain = ChainState::open(config, pow)?;
        let env = Arc::clone(chain.environment());
        let flusher = spawn_flusher(Arc::clone(&env), Duration::from_millis(config.flush_interval_ms))?;
        Ok(Node {
            chain: ReentrantMutex::new(RefCell::new(chain)),
            env,
            lock_timeout: Duration::from_millis(config.lock_timeout_ms),
            flusher: Mutex::new(Some(flusher)),
            shutting_down: AtomicBool::new(false),
        })
    }

    /// Take the main lock for a sequence of calls on this thread
    pub fn lock(&self) -> Result<MainLockGuard<'_>> {
        let guard = self.acquire()?;
        Ok(MainLockGuard { _guard: guard })
    }

    fn acquire(&self) -> Result<ReentrantMutexGuard<'_, RefCell<ChainState>>> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(LedgerError::ShuttingDown);
        }
        self.chain
            .try_lock_for(self.lock_timeout)
            .ok_or_else(|| LedgerError::ConcurrencyTimeout(format!("main lock after {:?}", self.lock_timeout)))
    }

    fn with_chain<T>(&self, f: impl FnOnce(&mut ChainState) -> Result<T>) -> Result<T> {
        let guard = self.acquire()?;
        let mut chain = guard
            .try_borrow_mut()
            .map_err(|_| LedgerError::ConcurrencyTimeout("chain state busy on this thread".to_string()))?;
        f(&mut chain)
    }

    fn read_chain<T>(&self, f: impl FnOnce(&ChainState) -> Result<T>) -> Result<T> {
        let guard = self.acquire()?;
        let chain = guard
            .try_borrow()
            .map_err(|_| LedgerError::ConcurrencyTimeout("chain state busy on this thread".to_string()))?;
        f(&chain)
    }

    // ------------------------------------------------------------------
    // Submission
    // ------------------------------------------------------------------

    /// SubmitBlock
    pub fn submit_block(&self, bytes: &[u8]) -> Result<SubmitBlockOutcome> {
        let block: Block = match deserialize(bytes) {
            Ok(block) => block,
            Err(e) => return Ok(SubmitBlockOutcome::Rejected(encoding_error("bad-blk-encoding", e))),
        };
        self.with_chain(|chain| chain.process_block(block))
    }

    /// SubmitHeader: header-first acceptance of an 80-byte header
    pub fn submit_header(&self, bytes: &[u8]) -> Result<SubmitBlockOutcome> {
        let header: BlockHeader = match deserialize(bytes) {
            Ok(header) => header,
            Err(e) => return Ok(SubmitBlockOutcome::Rejected(encoding_error("bad-header-encoding", e))),
        };
        self.with_chain(|chain| chain.process_header(header))
    }

    /// SubmitTransaction: mempool acceptance only
    pub fn submit_transaction(&self, bytes: &[u8]) -> Result<SubmitTxOutcome> {
        let tx: Transaction = match deserialize(bytes) {
            Ok(tx) => tx,
            Err(e) => return Ok(SubmitTxOutcome::Rejected(encoding_error("bad-txns-encoding", e))),
        };
        self.with_chain(|chain| chain.process_transaction(tx))
    }

    // ------------------------------------------------------------------
    // Queries
    // ------------------------------------------------------------------

    /// GetBestChainHash
    pub fn best_chain_hash(&self) -> Result<Hash> {
        self.read_chain(|chain| Ok(chain.best_hash()))
    }

    /// GetHeight
    pub fn height(&self) -> Result<u32> {
        self.read_chain(|chain| Ok(chain.height()))
    }

    /// GetBlockByHash
    pub fn block_by_hash(&self, hash: &Hash) -> Result<Block> {
        self.read_chain(|chain| chain.block_by_hash(hash))
    }

    /// GetBlockHashAtHeight
    pub fn block_hash_at_height(&self, height: u32) -> Result<Hash> {
        self.read_chain(|chain| chain.hash_at_height(height))
    }

    /// GetTransaction: the transaction and, once confirmed, its block
    pub fn transaction(&self, txid: &Hash) -> Result<(Transaction, Option<Hash>)> {
        self.read_chain(|chain| chain.transaction(txid))
    }

    /// ReadTransactionsByOwner
    pub fn owner_transactions(&self, owner: &[u8; 20], min_height: u32) -> Result<Vec<Transaction>> {
        self.read_chain(|chain| chain.owner_transactions(owner, min_height))
    }

    pub fn mempool_size(&self) -> Result<usize> {
        self.read_chain(|chain| Ok(chain.mempool().len()))
    }

    pub fn orphan_count(&self) -> Result<usize> {
        self.read_chain(|chain| Ok(chain.orphan_count()))
    }

    /// Current template from a collaborator-owned cache
    pub fn block_template(&self, cache: &mut TemplateCache, payout_script: &[u8]) -> Result<BlockTemplate> {
        self.read_chain(|chain| cache.get(chain, payout_script).cloned())
    }

    // ------------------------------------------------------------------
    // Other namespaces
    // ------------------------------------------------------------------

    pub fn wallet(&self) -> Result<WalletDb> {
        self.check_running()?;
        WalletDb::open(&self.env, OpenMode::Create)
    }

    pub fn addresses(&self) -> Result<AddrDb> {
        self.check_running()?;
        AddrDb::open(&self.env, OpenMode::Create)
    }

    /// LoadAddresses, rewriting away obsolete records
    pub fn load_addresses(&self) -> Result<Vec<PeerAddress>> {
        self.check_running()?;
        load_addresses(&self.env)
    }

    fn check_running(&self) -> Result<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(LedgerError::ShuttingDown);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------

    /// Stop accepting work, finish the operation in flight, then force a
    /// checkpoint of every namespace. Later calls do nothing.
    pub fn shutdown(&self) -> Result<()> {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        info!("Shutdown requested");

        if let Some(flusher) = self.flusher.lock().take() {
            flusher.stop.send(()).ok();
            if flusher.handle.join().is_err() {
                warn!("Flush thread panicked");
            }
        }

        // Wait for the chain operation in flight.
        let _guard = self.chain.lock();
        self.env.begin_shutdown();
        self.env.flush(true)?;
        info!("Shutdown complete");
        Ok(())
    }
}

impl Drop for Node {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            error!("Shutdown failed: {}", e);
        }
    }
}

fn spawn_flusher(env: Arc<Environment>, interval: Duration) -> Result<Flusher> {
    let (stop, requests) = mpsc::channel();
    let handle = thread::Builder::new()
        .name("ledger-flush".to_string())
        .spawn(move || loop {
            match requests.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {
                    if let Err(e) = env.flush(false) {
                        warn!("Background flush failed: {}", e);
                    }
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        })?;
    Ok(Flusher { stop, handle })
}

fn encoding_error(code: &'static str, err: impl std::fmt::Display) -> ValidationError {
    ValidationError::new(ValidationKind::Structure, code, err.to_string())
}
