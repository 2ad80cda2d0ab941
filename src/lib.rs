//! # Ledger-Core
//!
//! Chain state machine, transaction index and crash-safe ledger store for a
//! peer-validated, append-only block chain.
//!
//! ## Architecture
//!
//! The crate is layered bottom-up:
//! - Codec and hashing (`serialization`, `hash`, `pow`)
//! - Ledger store (`storage`): transactional namespaces with handle counting
//! - Indexes (`txdb`, `block_index`) and block files (`blockstore`)
//! - Validation (`script`, `transaction`, `block`)
//! - Chain selection (`reorganization`, `chain`) and the `mempool`
//! - External interface (`node`) behind a single reentrant main lock
//!
//! ## Design Principles
//!
//! 1. **Single writer**: every chain decision runs under the main lock
//! 2. **All-or-nothing switches**: a reorganization commits in one store transaction
//! 3. **Typed rejections**: every rejected block or transaction carries a stable reason code
//! 4. **Exact Version Pinning**: consensus-critical cryptography pinned to exact versions
//!
//! ## Usage
//!
//! ```rust
//! use ledger_core::{ChainParams, Node, NodeConfig};
//!
//! let dir = tempfile::tempdir()?;
//! let node = Node::open(&NodeConfig::new(dir.path(), ChainParams::regtest()))?;
//! assert_eq!(node.height()?, 0);
//! assert_eq!(node.best_chain_hash()?, ChainParams::regtest().genesis_hash);
//! node.shutdown()?;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! ```

pub mod types;
pub mod constants;
pub mod error;
pub mod config;
pub mod serialization;
pub mod hash;
pub mod pow;
pub mod economic;
pub mod script;
pub mod transaction;
pub mod block;
pub mod storage;
pub mod blockstore;
pub mod txdb;
pub mod block_index;
pub mod reorganization;
pub mod chain;
pub mod mempool;
pub mod mining;
pub mod walletdb;
pub mod addrdb;
pub mod node;

// Re-export commonly used types
pub use types::*;
pub use constants::*;
pub use error::{LedgerError, Result, ValidationError, ValidationKind};
pub use config::{ChainParams, NodeConfig};
pub use chain::{ChainState, SubmitBlockOutcome};
pub use mempool::SubmitTxOutcome;
pub use node::Node;
pub use pow::{PowHash, Sha256dPow};
