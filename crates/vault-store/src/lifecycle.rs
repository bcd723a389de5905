use std::sync::Arc;

use tracing::{debug, error, info, warn};
use vault_ledger::{BlobLedger, LedgerError};
use vault_types::{BlobRecord, Digest, NewBlob, RefDelta};

use crate::error::{StoreError, StoreResult};
use crate::layout::ShardLayout;
use crate::locks::DigestLocks;
use crate::store::PutReceipt;

/// Owns every reference count change and the referenced/unreferenced state
/// machine. All adjustments for a digest run under that digest's lock, the
/// same lock the commit path and the sweep take.
pub struct ReferenceLifecycle<L> {
    pub(crate) ledger: Arc<L>,
    pub(crate) locks: Arc<DigestLocks>,
    pub(crate) layout: ShardLayout,
}

impl<L: BlobLedger> ReferenceLifecycle<L> {
    pub fn new(ledger: Arc<L>, locks: Arc<DigestLocks>, layout: ShardLayout) -> Self {
        Self {
            ledger,
            locks,
            layout,
        }
    }

    /// First reference to a freshly put blob.
    ///
    /// Re-establishes the ledger row if it was reclaimed between `put` and
    /// this call, but only while the physical file is still present; a count
    /// is never recorded against content that is gone.
    pub async fn acquire_new(&self, receipt: &PutReceipt) -> StoreResult<BlobRecord> {
        let _guard = self.locks.lock(receipt.digest).await;
        let path = self.layout.blob_path(&receipt.digest);
        if !tokio::fs::try_exists(&path).await? {
            warn!(digest = %receipt.digest, path = %path.display(), "blob file vanished before first reference");
            return Err(StoreError::NotFound(receipt.digest));
        }
        let inserted = self
            .ledger
            .record_new(NewBlob {
                digest: receipt.digest,
                size_bytes: receipt.size_bytes,
                declared_media_type: receipt.declared_media_type.clone(),
                physical_path: path,
            })
            .await?;
        if inserted {
            debug!(digest = %receipt.digest, "ledger row re-established before first reference");
        }
        self.adjust_locked(&receipt.digest, RefDelta::Acquire).await
    }

    /// A new logical file now points at `digest`.
    pub async fn acquire(&self, digest: &Digest) -> StoreResult<BlobRecord> {
        let _guard = self.locks.lock(*digest).await;
        self.adjust_locked(digest, RefDelta::Acquire).await
    }

    /// A logical file pointing at `digest` was deleted.
    pub async fn release(&self, digest: &Digest) -> StoreResult<BlobRecord> {
        let _guard = self.locks.lock(*digest).await;
        self.adjust_locked(digest, RefDelta::Release).await
    }

    async fn adjust_locked(&self, digest: &Digest, delta: RefDelta) -> StoreResult<BlobRecord> {
        match self.ledger.adjust_reference_count(digest, delta).await {
            Ok(record) => {
                match (delta, record.reference_count) {
                    (RefDelta::Release, 0) => {
                        info!(digest = %digest, size = record.size_bytes, "blob unreferenced")
                    }
                    (RefDelta::Acquire, 1) => info!(digest = %digest, "blob referenced"),
                    _ => debug!(digest = %digest, delta = %delta, count = record.reference_count, "reference adjusted"),
                }
                Ok(record)
            }
            Err(err @ LedgerError::InvariantViolation { .. }) => {
                error!(digest = %digest, delta = %delta, error = %err, "reference count invariant violated");
                Err(err.into())
            }
            Err(err) => Err(err.into()),
        }
    }
}

impl<L> std::fmt::Debug for ReferenceLifecycle<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReferenceLifecycle")
            .field("root", &self.layout.root())
            .field("locks", &self.locks)
            .finish()
    }
}
