//! Deferred physical reclamation.
//!
//! Reaching a zero count only marks a blob. The sweep runs separately,
//! takes candidates that have stayed unreferenced for the grace period,
//! and for each one, under the digest lock, removes the ledger row with an
//! atomic re-check before it deletes the file. A blob re-referenced in the
//! meantime fails the re-check and is skipped. Running the sweep again is
//! harmless.

use std::io;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use vault_ledger::BlobLedger;
use vault_types::{BlobRecord, Digest};
use walkdir::{DirEntry, WalkDir};

use crate::config::StoreConfig;
use crate::error::StoreResult;
use crate::layout::ShardLayout;
use crate::lifecycle::ReferenceLifecycle;

/// What a sweep is allowed to reclaim.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepPolicy {
    /// Minimum time since a blob became unreferenced (or, for orphans,
    /// since the file was last modified).
    pub grace: Duration,
    /// Maximum ledger candidates examined per run.
    pub limit: usize,
    /// Also remove shard files that have no ledger row.
    pub reclaim_orphans: bool,
}

impl SweepPolicy {
    pub fn from_config(config: &StoreConfig) -> Self {
        Self {
            grace: config.sweep_grace(),
            limit: config.sweep_batch_limit,
            reclaim_orphans: true,
        }
    }
}

impl Default for SweepPolicy {
    fn default() -> Self {
        Self::from_config(&StoreConfig::default())
    }
}

/// Counters from one sweep run.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SweepReport {
    /// Unreferenced rows past the grace period at selection time.
    pub candidates: usize,
    /// Rows removed (their files deleted or already absent).
    pub reclaimed: usize,
    pub reclaimed_bytes: u64,
    /// Candidates that were re-referenced or already gone at re-check.
    pub skipped: usize,
    /// Reclaimed rows whose file was already missing.
    pub missing_files: usize,
    /// Rows removed whose file could not be deleted. The file is left for
    /// a later orphan pass.
    pub failed: usize,
    pub orphans_reclaimed: usize,
    pub orphan_bytes: u64,
}

/// Counters from a staging cleanup.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StagingReport {
    pub removed: usize,
    pub removed_bytes: u64,
}

impl<L: BlobLedger> ReferenceLifecycle<L> {
    /// Reclaim unreferenced blobs (and optionally orphan files) older than
    /// the policy's grace period.
    pub async fn sweep(&self, policy: &SweepPolicy) -> StoreResult<SweepReport> {
        let cutoff = cutoff(policy.grace);
        let mut report = SweepReport::default();

        let candidates = self.ledger.unreferenced(cutoff, policy.limit).await?;
        report.candidates = candidates.len();
        for candidate in &candidates {
            self.reclaim(candidate, cutoff, &mut report).await?;
        }

        if policy.reclaim_orphans {
            self.reclaim_orphans(policy.grace, &mut report).await?;
        }

        info!(
            candidates = report.candidates,
            reclaimed = report.reclaimed,
            bytes = report.reclaimed_bytes,
            skipped = report.skipped,
            orphans = report.orphans_reclaimed,
            "sweep complete"
        );
        Ok(report)
    }

    async fn reclaim(
        &self,
        candidate: &BlobRecord,
        cutoff: DateTime<Utc>,
        report: &mut SweepReport,
    ) -> StoreResult<()> {
        let digest = candidate.digest;
        let _guard = self.locks.lock(digest).await;

        let Some(removed) = self.ledger.remove_if_unreferenced(&digest, cutoff).await? else {
            debug!(digest = %digest, "candidate re-referenced or gone; skipping");
            report.skipped += 1;
            return Ok(());
        };

        let path = self.layout.blob_path(&digest);
        if removed.physical_path != path {
            warn!(
                digest = %digest,
                recorded = %removed.physical_path.display(),
                derived = %path.display(),
                "recorded path differs from layout; deleting derived path"
            );
        }

        report.reclaimed += 1;
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                report.reclaimed_bytes += removed.size_bytes;
                info!(digest = %digest, size = removed.size_bytes, "blob reclaimed");
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                report.missing_files += 1;
                warn!(digest = %digest, path = %path.display(), "blob file already missing");
            }
            Err(e) => {
                report.failed += 1;
                warn!(digest = %digest, path = %path.display(), error = %e, "failed to delete blob file");
            }
        }
        Ok(())
    }

    async fn reclaim_orphans(&self, grace: Duration, report: &mut SweepReport) -> StoreResult<()> {
        let layout = self.layout.clone();
        let files = tokio::task::spawn_blocking(move || shard_files_older_than(&layout, grace))
            .await
            .map_err(io::Error::other)??;

        for (digest, path) in files {
            if self.ledger.lookup(&digest).await?.is_some() {
                continue;
            }
            let _guard = self.locks.lock(digest).await;
            // A put may have recorded the row while we waited.
            if self.ledger.lookup(&digest).await?.is_some() {
                continue;
            }
            let size = tokio::fs::metadata(&path).await.map(|m| m.len()).unwrap_or(0);
            match tokio::fs::remove_file(&path).await {
                Ok(()) => {
                    report.orphans_reclaimed += 1;
                    report.orphan_bytes += size;
                    info!(digest = %digest, size, "orphan blob file reclaimed");
                }
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => {
                    warn!(digest = %digest, path = %path.display(), error = %e, "failed to delete orphan file")
                }
            }
        }
        Ok(())
    }
}

/// Delete staging files older than `older_than`. These are uploads whose
/// process died before the staging handle could clean up.
pub async fn sweep_staging(layout: &ShardLayout, older_than: Duration) -> StoreResult<StagingReport> {
    let dir = layout.staging_dir();
    let mut report = StagingReport::default();
    let mut entries = match tokio::fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(report),
        Err(e) => return Err(e.into()),
    };

    while let Some(entry) = entries.next_entry().await? {
        let meta = entry.metadata().await?;
        if !meta.is_file() || !older(&meta, older_than) {
            continue;
        }
        match tokio::fs::remove_file(entry.path()).await {
            Ok(()) => {
                report.removed += 1;
                report.removed_bytes += meta.len();
                debug!(path = %entry.path().display(), "stale staging file removed");
            }
            // Committed or cleaned up by its owner in the meantime.
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
    }

    if report.removed > 0 {
        info!(removed = report.removed, bytes = report.removed_bytes, "staging swept");
    }
    Ok(report)
}

fn cutoff(grace: Duration) -> DateTime<Utc> {
    let now = Utc::now();
    chrono::Duration::from_std(grace)
        .ok()
        .and_then(|g| now.checked_sub_signed(g))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

fn older(meta: &std::fs::Metadata, age: Duration) -> bool {
    meta.modified()
        .ok()
        .and_then(|m| SystemTime::now().duration_since(m).ok())
        .is_some_and(|elapsed| elapsed >= age)
}

fn is_hidden(entry: &DirEntry) -> bool {
    entry.depth() > 0 && entry.file_name().to_str().is_some_and(|s| s.starts_with('.'))
}

/// Files at `<root>/<aa>/<bb>/<hex>` whose name is a digest matching its
/// shard directories and whose mtime is at least `grace` old.
fn shard_files_older_than(layout: &ShardLayout, grace: Duration) -> io::Result<Vec<(Digest, PathBuf)>> {
    let root: &Path = layout.root();
    if !root.exists() {
        return Ok(Vec::new());
    }
    let mut found = Vec::new();
    for entry in WalkDir::new(root)
        .min_depth(3)
        .max_depth(3)
        .into_iter()
        .filter_entry(|e| !is_hidden(e))
    {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "skipping unreadable entry during orphan scan");
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(digest) = layout.digest_for(entry.path()) else {
            continue;
        };
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        if older(&meta, grace) {
            found.push((digest, entry.into_path()));
        }
    }
    Ok(found)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use vault_ledger::InMemoryBlobLedger;
    use vault_types::NewBlob;

    use crate::locks::DigestLocks;

    fn now_policy() -> SweepPolicy {
        SweepPolicy {
            grace: Duration::ZERO,
            limit: 100,
            reclaim_orphans: true,
        }
    }

    fn lifecycle(root: &Path) -> ReferenceLifecycle<InMemoryBlobLedger> {
        ReferenceLifecycle::new(
            Arc::new(InMemoryBlobLedger::new()),
            Arc::new(DigestLocks::new()),
            ShardLayout::new(root),
        )
    }

    /// Write a file at the digest's path and record a zero-count row.
    async fn stored(lc: &ReferenceLifecycle<InMemoryBlobLedger>, seed: u8) -> (Digest, PathBuf) {
        let digest = Digest::from_hash([seed; 32]);
        let path = lc.layout.blob_path(&digest);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, [seed; 10]).unwrap();
        lc.ledger
            .record_new(NewBlob {
                digest,
                size_bytes: 10,
                declared_media_type: None,
                physical_path: path.clone(),
            })
            .await
            .unwrap();
        (digest, path)
    }

    #[tokio::test]
    async fn referenced_blobs_survive() {
        let dir = tempfile::tempdir().unwrap();
        let lc = lifecycle(dir.path());
        let (digest, path) = stored(&lc, 1).await;
        lc.acquire(&digest).await.unwrap();

        let report = lc.sweep(&now_policy()).await.unwrap();
        assert_eq!(report.reclaimed, 0);
        assert_eq!(report.orphans_reclaimed, 0);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn unreferenced_blobs_are_reclaimed_once() {
        let dir = tempfile::tempdir().unwrap();
        let lc = lifecycle(dir.path());
        let (digest, path) = stored(&lc, 2).await;
        lc.acquire(&digest).await.unwrap();
        lc.release(&digest).await.unwrap();

        let report = lc.sweep(&now_policy()).await.unwrap();
        assert_eq!(report.candidates, 1);
        assert_eq!(report.reclaimed, 1);
        assert_eq!(report.reclaimed_bytes, 10);
        assert!(!path.exists());
        assert!(lc.ledger.lookup(&digest).await.unwrap().is_none());

        let again = lc.sweep(&now_policy()).await.unwrap();
        assert_eq!(again, SweepReport::default());
    }

    #[tokio::test]
    async fn grace_period_is_respected() {
        let dir = tempfile::tempdir().unwrap();
        let lc = lifecycle(dir.path());
        let (_, path) = stored(&lc, 3).await;

        let policy = SweepPolicy {
            grace: Duration::from_secs(3600),
            ..now_policy()
        };
        let report = lc.sweep(&policy).await.unwrap();
        assert_eq!(report.candidates, 0);
        assert!(path.exists());
    }

    #[tokio::test]
    async fn re_referenced_candidate_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let lc = lifecycle(dir.path());
        let (digest, path) = stored(&lc, 4).await;

        let cut = cutoff(Duration::ZERO);
        let candidates = lc.ledger.unreferenced(cut, 10).await.unwrap();
        assert_eq!(candidates.len(), 1);

        // Re-referenced between selection and reclamation.
        lc.acquire(&digest).await.unwrap();

        let mut report = SweepReport::default();
        lc.reclaim(&candidates[0], cut, &mut report).await.unwrap();
        assert_eq!(report.skipped, 1);
        assert_eq!(report.reclaimed, 0);
        assert!(path.exists());
        assert_eq!(lc.ledger.lookup(&digest).await.unwrap().unwrap().reference_count, 1);
    }

    #[tokio::test]
    async fn missing_file_still_removes_row() {
        let dir = tempfile::tempdir().unwrap();
        let lc = lifecycle(dir.path());
        let (digest, path) = stored(&lc, 5).await;
        std::fs::remove_file(&path).unwrap();

        let report = lc.sweep(&now_policy()).await.unwrap();
        assert_eq!(report.reclaimed, 1);
        assert_eq!(report.missing_files, 1);
        assert!(lc.ledger.lookup(&digest).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn orphan_files_are_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let lc = lifecycle(dir.path());
        let orphan = Digest::from_hash([6; 32]);
        let path = lc.layout.blob_path(&orphan);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(&path, b"no row").unwrap();

        // Unrelated files in the tree are left alone.
        let stray = dir.path().join("ab").join("cd").join("notes.txt");
        std::fs::create_dir_all(stray.parent().unwrap()).unwrap();
        std::fs::write(&stray, b"keep").unwrap();

        let without = SweepPolicy {
            reclaim_orphans: false,
            ..now_policy()
        };
        assert_eq!(lc.sweep(&without).await.unwrap().orphans_reclaimed, 0);
        assert!(path.exists());

        let report = lc.sweep(&now_policy()).await.unwrap();
        assert_eq!(report.orphans_reclaimed, 1);
        assert_eq!(report.orphan_bytes, 6);
        assert!(!path.exists());
        assert!(stray.exists());
    }

    #[tokio::test]
    async fn staging_sweep_removes_only_old_files() {
        let dir = tempfile::tempdir().unwrap();
        let layout = ShardLayout::new(dir.path());

        // Nothing to do before the staging directory exists.
        assert_eq!(
            sweep_staging(&layout, Duration::ZERO).await.unwrap(),
            StagingReport::default()
        );

        std::fs::create_dir_all(layout.staging_dir()).unwrap();
        std::fs::write(layout.staging_dir().join("upload-dead"), b"partial").unwrap();

        let kept = sweep_staging(&layout, Duration::from_secs(3600)).await.unwrap();
        assert_eq!(kept.removed, 0);

        let report = sweep_staging(&layout, Duration::ZERO).await.unwrap();
        assert_eq!(report.removed, 1);
        assert_eq!(report.removed_bytes, 7);
        assert_eq!(std::fs::read_dir(layout.staging_dir()).unwrap().count(), 0);
    }
}
