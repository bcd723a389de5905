//! Content-addressed, deduplicating blob store for Vault.
//!
//! Uploads are identified by the SHA-256 of their bytes. Identical content
//! is stored once no matter how many logical files point at it, and the
//! ledger counts those logical references so space can be reclaimed once
//! nothing uses a blob any more.
//!
//! # Write path
//!
//! 1. [`HashingWriter`] streams the upload into `<root>/.staging/`, hashing
//!    as it goes.
//! 2. [`AtomicCommitter`] moves the staged file to
//!    `<root>/<aa>/<bb>/<digest>` ([`ShardLayout`]) without ever replacing
//!    an existing file.
//! 3. The [`BlobLedger`](vault_ledger::BlobLedger) records the blob with no
//!    references.
//!
//! # Lifecycle
//!
//! [`ReferenceLifecycle`] is the only path to the reference count. A blob
//! whose count drops to zero is merely marked; the sweep reclaims it later,
//! after a grace period, and only if it is still unreferenced at that point.
//!
//! # Concurrency
//!
//! There is no store-wide lock. Work on one digest is serialized through
//! [`DigestLocks`]; different digests proceed independently.

pub mod commit;
pub mod config;
pub mod error;
pub mod layout;
pub mod lifecycle;
pub mod locks;
pub mod staging;
pub mod store;
pub mod sweep;
pub mod usage;
pub mod verify;

pub use commit::{AtomicCommitter, CommitOutcome};
pub use config::StoreConfig;
pub use error::{StoreError, StoreResult};
pub use layout::{ShardLayout, STAGING_DIR};
pub use lifecycle::ReferenceLifecycle;
pub use locks::{DigestGuard, DigestLocks};
pub use staging::{HashingWriter, StagedBlob};
pub use store::{BlobStore, PutReceipt};
pub use sweep::{sweep_staging, StagingReport, SweepPolicy, SweepReport};
pub use usage::{InMemoryUsage, NoUsage, UsageSource};
pub use verify::VerifyOutcome;
