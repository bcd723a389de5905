use vault_ledger::LedgerError;
use vault_types::{Digest, RefDelta};

/// Errors from blob store operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Staging write, directory creation, rename, or stream read failed.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// No ledger row exists for the digest.
    #[error("blob not found: {0}")]
    NotFound(Digest),

    /// A reference adjustment would take the count below zero.
    #[error("reference count invariant violated for {digest}: count {current} cannot take {delta}")]
    InvariantViolation {
        digest: Digest,
        current: u64,
        delta: RefDelta,
    },

    /// Any other ledger failure.
    #[error("ledger error: {0}")]
    Ledger(LedgerError),

    /// The usage source could not answer.
    #[error("usage query failed: {0}")]
    Usage(String),
}

impl From<LedgerError> for StoreError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::NotFound(digest) => Self::NotFound(digest),
            LedgerError::InvariantViolation {
                digest,
                current,
                delta,
            } => Self::InvariantViolation {
                digest,
                current,
                delta,
            },
            LedgerError::Io(e) => Self::Io(e),
            other => Self::Ledger(other),
        }
    }
}

/// Result alias for store operations.
pub type StoreResult<T> = Result<T, StoreError>;
