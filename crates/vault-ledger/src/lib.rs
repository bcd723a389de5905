//! Blob ledger for Vault.
//!
//! The ledger is the durable authority for "does this content already
//! exist" and "how many logical files own it". Every backend implements
//! [`BlobLedger`]:
//!
//! - [`InMemoryBlobLedger`]: sharded maps, for tests and embedding
//! - [`WalBlobLedger`]: the same table journaled to a crash-recoverable
//!   write-ahead log
//! - `PgBlobLedger`: a `blobs` table in PostgreSQL (feature `postgres`)
//!
//! # Rules
//!
//! 1. `record_new` is idempotent: a second record of the same digest is a
//!    no-op, so racing first writers converge on one row.
//! 2. Reference adjustments are atomic per digest and never lose updates.
//! 3. A count is never allowed below zero; the attempt is an
//!    [`LedgerError::InvariantViolation`], never clamped.
//! 4. Rows are only removed through `remove_if_unreferenced`, which re-checks
//!    the count in the same atomic step.

pub mod error;
pub mod memory;
#[cfg(feature = "postgres")]
pub mod postgres;
pub mod traits;
pub mod wal;
pub mod wal_ledger;

pub use error::{LedgerError, LedgerResult};
pub use memory::InMemoryBlobLedger;
#[cfg(feature = "postgres")]
pub use postgres::PgBlobLedger;
pub use traits::{BlobLedger, LedgerStats};
pub use wal::{LedgerEvent, SyncMode, WalConfig, WriteAheadLog};
pub use wal_ledger::WalBlobLedger;
