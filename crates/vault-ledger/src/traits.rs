use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use vault_types::{BlobRecord, Digest, NewBlob, RefDelta};

use crate::error::LedgerResult;

/// Durable blob ledger keyed by digest.
///
/// All implementations must satisfy these invariants:
/// - `record_new` inserts a row with a zero count when absent and is a no-op
///   when present. Racing first writers converge on one row without error.
/// - `record_new` and `adjust_reference_count` serialize per digest: the
///   final count equals the number of applied deltas regardless of
///   interleaving.
/// - Operations on different digests do not contend on a shared lock.
/// - A count never goes negative and is never clamped.
#[async_trait]
pub trait BlobLedger: Send + Sync {
    /// Look up a blob by digest.
    ///
    /// Returns `Ok(None)` if the digest has never been recorded (or has been
    /// reclaimed).
    async fn lookup(&self, digest: &Digest) -> LedgerResult<Option<BlobRecord>>;

    /// Record a freshly committed blob with a zero reference count.
    ///
    /// Returns `true` if a row was inserted, `false` if one already existed.
    async fn record_new(&self, blob: NewBlob) -> LedgerResult<bool>;

    /// Atomically apply `delta` and return the updated row.
    ///
    /// Fails with `NotFound` if no row exists and with `InvariantViolation`
    /// if the count would go negative.
    async fn adjust_reference_count(
        &self,
        digest: &Digest,
        delta: RefDelta,
    ) -> LedgerResult<BlobRecord>;

    /// Restart the grace period of an unreferenced row: set its release
    /// time to now. Returns the updated row, or `None` when the row is absent
    /// or referenced.
    async fn renew_release(&self, digest: &Digest) -> LedgerResult<Option<BlobRecord>>;

    /// Unreferenced rows released at or before `released_before`, oldest
    /// release first, at most `limit` of them.
    async fn unreferenced(
        &self,
        released_before: DateTime<Utc>,
        limit: usize,
    ) -> LedgerResult<Vec<BlobRecord>>;

    /// Remove the row only if it is still unreferenced and was released at
    /// or before `released_before`. The check and the removal are one atomic
    /// step. Returns the removed row.
    async fn remove_if_unreferenced(
        &self,
        digest: &Digest,
        released_before: DateTime<Utc>,
    ) -> LedgerResult<Option<BlobRecord>>;

    /// Aggregate counters across the whole ledger.
    async fn stats(&self) -> LedgerResult<LedgerStats>;
}

/// Aggregate ledger counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerStats {
    /// Number of distinct blobs.
    pub blobs: u64,
    /// Physical bytes across all blobs.
    pub bytes: u64,
    pub unreferenced_blobs: u64,
    pub unreferenced_bytes: u64,
    /// Sum of all reference counts (live logical files).
    pub references: u64,
}

impl LedgerStats {
    /// Fold one row into the counters.
    pub fn observe(&mut self, record: &BlobRecord) {
        self.blobs += 1;
        self.bytes += record.size_bytes;
        self.references += record.reference_count;
        if record.is_unreferenced() {
            self.unreferenced_blobs += 1;
            self.unreferenced_bytes += record.size_bytes;
        }
    }
}
