//! Error types for ledger validation and storage

use crate::serialization::CodecError;
use crate::storage::StorageError;
use std::fmt;
use thiserror::Error;

/// Category of a consensus rule failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ValidationKind {
    Structure,
    ProofOfWork,
    Timestamp,
    DoubleSpend,
    Script,
    ValueConservation,
    /// Rule that depends on chain position (difficulty, maturity, invalid ancestry)
    Context,
    Duplicate,
}

impl fmt::Display for ValidationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValidationKind::Structure => "structure",
            ValidationKind::ProofOfWork => "proof-of-work",
            ValidationKind::Timestamp => "timestamp",
            ValidationKind::DoubleSpend => "double-spend",
            ValidationKind::Script => "script",
            ValidationKind::ValueConservation => "value-conservation",
            ValidationKind::Context => "context",
            ValidationKind::Duplicate => "duplicate",
        };
        f.write_str(name)
    }
}

/// A rejected block or transaction, with a stable reason code
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    pub kind: ValidationKind,
    pub code: &'static str,
    pub detail: String,
}

impl ValidationError {
    pub fn new(kind: ValidationKind, code: &'static str, detail: impl Into<String>) -> Self {
        ValidationError {
            kind,
            code,
            detail: detail.into(),
        }
    }

    /// Failures a third party can produce by mutating a valid block's body
    /// without changing its hash; such blocks are rejected but not
    /// remembered as invalid.
    pub fn is_possible_mutation(&self) -> bool {
        matches!(
            self.code,
            "bad-txnmrklroot" | "bad-txns-duplicate" | "bad-blk-length" | "bad-blk-sigops"
        )
    }
}

impl fmt::Display for ValidationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({}): {}", self.code, self.kind, self.detail)
    }
}

impl std::error::Error for ValidationError {}

#[derive(Error, Debug)]
pub enum LedgerError {
    #[error("Storage unavailable: {0}")]
    StorageFatal(String),

    #[error("Storage corrupt: {0}")]
    StorageCorrupt(String),

    #[error("Validation failed: {0}")]
    Validation(ValidationError),

    #[error("Reorganization failed: {0}")]
    ReorgFailure(String),

    #[error("Timed out waiting for {0}")]
    ConcurrencyTimeout(String),

    #[error("Out of range: {0}")]
    OutOfRange(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Shutting down")]
    ShuttingDown,

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl LedgerError {
    pub fn validation(kind: ValidationKind, code: &'static str, detail: impl Into<String>) -> Self {
        LedgerError::Validation(ValidationError::new(kind, code, detail))
    }

    pub fn as_validation(&self) -> Option<&ValidationError> {
        match self {
            LedgerError::Validation(err) => Some(err),
            _ => None,
        }
    }
}

impl From<ValidationError> for LedgerError {
    fn from(err: ValidationError) -> Self {
        LedgerError::Validation(err)
    }
}

impl From<CodecError> for LedgerError {
    fn from(err: CodecError) -> Self {
        LedgerError::StorageCorrupt(err.to_string())
    }
}

impl From<StorageError> for LedgerError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::OpenFailed(msg) => LedgerError::StorageFatal(msg),
            StorageError::Corrupt(msg) => LedgerError::StorageCorrupt(msg),
            StorageError::ShuttingDown => LedgerError::ShuttingDown,
            other => LedgerError::StorageFatal(other.to_string()),
        }
    }
}

pub type Result<T> = std::result::Result<T, LedgerError>;
