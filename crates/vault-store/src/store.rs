use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::io::AsyncRead;
use tracing::{debug, info, warn};
use vault_ledger::{BlobLedger, LedgerStats};
use vault_types::{BlobRecord, Digest, MediaType, NewBlob, OwnerScope};

use crate::commit::AtomicCommitter;
use crate::config::StoreConfig;
use crate::error::{StoreError, StoreResult};
use crate::layout::ShardLayout;
use crate::lifecycle::ReferenceLifecycle;
use crate::locks::DigestLocks;
use crate::staging::HashingWriter;
use crate::sweep::{self, StagingReport, SweepPolicy, SweepReport};
use crate::usage::{NoUsage, UsageSource};
use crate::verify::{self, VerifyOutcome};

/// Outcome of storing one upload.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PutReceipt {
    pub digest: Digest,
    pub size_bytes: u64,
    /// The content was already stored before this upload.
    pub already_existed: bool,
    pub physical_path: PathBuf,
    /// Caller hint carried through to a first reference.
    pub declared_media_type: Option<MediaType>,
}

/// Content-addressed blob store.
///
/// `put` hashes a stream into staging, commits it under its digest, and
/// records it in the ledger with no references. Callers then bind logical
/// files to it with [`acquire_new`](Self::acquire_new) or
/// [`increment_reference`](Self::increment_reference), and unbind with
/// [`decrement_reference`](Self::decrement_reference). Space is returned by
/// [`sweep`](Self::sweep).
pub struct BlobStore<L> {
    config: StoreConfig,
    layout: ShardLayout,
    writer: HashingWriter,
    committer: AtomicCommitter,
    locks: Arc<DigestLocks>,
    ledger: Arc<L>,
    lifecycle: ReferenceLifecycle<L>,
    usage: Arc<dyn UsageSource>,
}

impl<L: BlobLedger> BlobStore<L> {
    pub fn new(config: StoreConfig, ledger: Arc<L>) -> Self {
        let layout = config.layout();
        let locks = Arc::new(DigestLocks::new());
        Self {
            writer: HashingWriter::new(layout.staging_dir(), config.fsync),
            committer: AtomicCommitter::new(layout.clone(), config.fsync),
            lifecycle: ReferenceLifecycle::new(ledger.clone(), locks.clone(), layout.clone()),
            usage: Arc::new(NoUsage),
            config,
            layout,
            locks,
            ledger,
        }
    }

    /// Answer `current_usage` from `source` instead of reporting zero.
    pub fn with_usage_source(mut self, source: Arc<dyn UsageSource>) -> Self {
        self.usage = source;
        self
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    pub fn layout(&self) -> &ShardLayout {
        &self.layout
    }

    pub fn ledger(&self) -> &Arc<L> {
        &self.ledger
    }

    /// Store the bytes of `reader`.
    ///
    /// Hashing runs without any lock, so identical uploads proceed in
    /// parallel. Commit and the ledger insert run under the digest lock.
    /// If this future is dropped before the commit, the staged file is
    /// removed and neither the shard tree nor the ledger changes.
    pub async fn put<R>(
        &self,
        reader: R,
        declared_media_type: Option<MediaType>,
    ) -> StoreResult<PutReceipt>
    where
        R: AsyncRead + Unpin,
    {
        let staged = self.writer.stage(reader).await?;
        let digest = *staged.digest();
        let size_bytes = staged.size_bytes();

        let _guard = self.locks.lock(digest).await;
        let outcome = self.committer.commit(staged).await?;
        let physical_path = outcome.path().to_path_buf();
        let inserted = self
            .ledger
            .record_new(NewBlob {
                digest,
                size_bytes,
                declared_media_type: declared_media_type.clone(),
                physical_path: physical_path.clone(),
            })
            .await?;
        if !inserted {
            // Content just reported as stored stays out of the next sweep.
            if let Some(record) = self.ledger.renew_release(&digest).await? {
                debug!(digest = %digest, released_at = ?record.released_at, "grace period restarted");
            }
        }

        if outcome.already_existed() {
            debug!(digest = %digest, size = size_bytes, "duplicate upload");
        } else {
            info!(digest = %digest, size = size_bytes, path = %physical_path.display(), "blob created");
        }
        if inserted && outcome.already_existed() {
            warn!(digest = %digest, "recorded a file that existed without a ledger row");
        }

        Ok(PutReceipt {
            digest,
            size_bytes,
            already_existed: outcome.already_existed(),
            physical_path,
            declared_media_type,
        })
    }

    /// Bind the first logical file to a fresh upload. Returns the new count.
    pub async fn acquire_new(&self, receipt: &PutReceipt) -> StoreResult<u64> {
        Ok(self.lifecycle.acquire_new(receipt).await?.reference_count)
    }

    /// A logical file was created over `digest`. Returns the new count.
    pub async fn increment_reference(&self, digest: &Digest) -> StoreResult<u64> {
        Ok(self.lifecycle.acquire(digest).await?.reference_count)
    }

    /// A logical file over `digest` was deleted. Returns the new count.
    ///
    /// Decrementing a zero count fails with
    /// [`StoreError::InvariantViolation`].
    pub async fn decrement_reference(&self, digest: &Digest) -> StoreResult<u64> {
        Ok(self.lifecycle.release(digest).await?.reference_count)
    }

    pub async fn lookup(&self, digest: &Digest) -> StoreResult<Option<BlobRecord>> {
        Ok(self.ledger.lookup(digest).await?)
    }

    /// Path of the stored bytes, if the blob is recorded and present.
    pub async fn resolve(&self, digest: &Digest) -> StoreResult<Option<PathBuf>> {
        if self.ledger.lookup(digest).await?.is_none() {
            return Ok(None);
        }
        let path = self.layout.blob_path(digest);
        if tokio::fs::try_exists(&path).await? {
            Ok(Some(path))
        } else {
            warn!(digest = %digest, path = %path.display(), "recorded blob has no file");
            Ok(None)
        }
    }

    /// Open the stored bytes for streaming.
    pub async fn open(&self, digest: &Digest) -> StoreResult<Option<tokio::fs::File>> {
        let Some(path) = self.resolve(digest).await? else {
            return Ok(None);
        };
        match tokio::fs::File::open(&path).await {
            Ok(file) => Ok(Some(file)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    pub async fn current_usage(&self, scope: &OwnerScope) -> StoreResult<u64> {
        self.usage.current_usage(scope).await
    }

    pub async fn sweep(&self, policy: &SweepPolicy) -> StoreResult<SweepReport> {
        self.lifecycle.sweep(policy).await
    }

    pub async fn sweep_staging(&self, older_than: Duration) -> StoreResult<StagingReport> {
        sweep::sweep_staging(&self.layout, older_than).await
    }

    /// Re-hash a recorded blob. Unknown digests are `NotFound`.
    pub async fn verify(&self, digest: &Digest) -> StoreResult<VerifyOutcome> {
        let record = self
            .ledger
            .lookup(digest)
            .await?
            .ok_or(StoreError::NotFound(*digest))?;
        let outcome = verify::verify_file(self.layout.blob_path(digest), &record).await?;
        if !outcome.is_intact() {
            warn!(digest = %digest, outcome = ?outcome, "blob failed verification");
        }
        Ok(outcome)
    }

    pub async fn stats(&self) -> StoreResult<LedgerStats> {
        Ok(self.ledger.stats().await?)
    }
}

impl<L> std::fmt::Debug for BlobStore<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlobStore")
            .field("root", &self.layout.root())
            .field("locks", &self.locks)
            .finish()
    }
}
