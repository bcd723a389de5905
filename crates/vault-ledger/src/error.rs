use vault_types::{Digest, RefDelta};

/// Errors produced by ledger operations.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// No row exists for the digest.
    #[error("blob not found: {0}")]
    NotFound(Digest),

    /// Applying the delta would take the reference count below zero. This is
    /// a bookkeeping bug in the caller (double release).
    #[error("reference count invariant violated for {digest}: count {current} cannot take {delta}")]
    InvariantViolation {
        digest: Digest,
        current: u64,
        delta: RefDelta,
    },

    /// I/O error from the journal.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization or deserialization failure.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A persisted row could not be decoded.
    #[error("corrupt ledger row {digest}: {reason}")]
    CorruptRecord { digest: String, reason: String },

    #[error("ledger lock poisoned")]
    LockPoisoned,

    #[cfg(feature = "postgres")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Result alias for ledger operations.
pub type LedgerResult<T> = Result<T, LedgerError>;
