use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use vault_types::{BlobRecord, Digest, NewBlob, RefDelta};

use crate::error::{LedgerError, LedgerResult};
use crate::traits::{BlobLedger, LedgerStats};
use crate::wal::LedgerEvent;

/// Number of independently locked shards. Digests are uniformly
/// distributed, so the first digest byte picks the shard.
const SHARD_COUNT: usize = 64;

type Shard = HashMap<Digest, BlobRecord>;

/// Sink that makes a change durable before it becomes visible.
pub(crate) trait Journal {
    fn append(&self, event: &LedgerEvent) -> LedgerResult<()>;
}

/// Journal for the purely in-memory ledger.
pub(crate) struct NoJournal;

impl Journal for NoJournal {
    fn append(&self, _event: &LedgerEvent) -> LedgerResult<()> {
        Ok(())
    }
}

/// Digest-sharded record table shared by the in-memory and WAL ledgers.
///
/// Every mutation holds exactly one shard write lock while it checks the
/// current row, journals the change, and installs the new row. Mutations on
/// one digest are therefore linearizable, and digests in different shards
/// never contend.
pub(crate) struct RecordTable {
    shards: Vec<RwLock<Shard>>,
}

impl RecordTable {
    pub(crate) fn new() -> Self {
        Self {
            shards: (0..SHARD_COUNT).map(|_| RwLock::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, digest: &Digest) -> &RwLock<Shard> {
        &self.shards[digest.as_bytes()[0] as usize % SHARD_COUNT]
    }

    fn read_shard(&self, digest: &Digest) -> LedgerResult<RwLockReadGuard<'_, Shard>> {
        self.shard(digest)
            .read()
            .map_err(|_| LedgerError::LockPoisoned)
    }

    fn write_shard(&self, digest: &Digest) -> LedgerResult<RwLockWriteGuard<'_, Shard>> {
        self.shard(digest)
            .write()
            .map_err(|_| LedgerError::LockPoisoned)
    }

    pub(crate) fn get(&self, digest: &Digest) -> LedgerResult<Option<BlobRecord>> {
        Ok(self.read_shard(digest)?.get(digest).cloned())
    }

    pub(crate) fn insert_if_absent(
        &self,
        blob: NewBlob,
        now: DateTime<Utc>,
        journal: &dyn Journal,
    ) -> LedgerResult<bool> {
        let mut shard = self.write_shard(&blob.digest)?;
        if shard.contains_key(&blob.digest) {
            return Ok(false);
        }
        let record = blob.into_record(now);
        journal.append(&LedgerEvent::Upsert(record.clone()))?;
        shard.insert(record.digest, record);
        Ok(true)
    }

    pub(crate) fn adjust(
        &self,
        digest: &Digest,
        delta: RefDelta,
        now: DateTime<Utc>,
        journal: &dyn Journal,
    ) -> LedgerResult<BlobRecord> {
        let mut shard = self.write_shard(digest)?;
        let current = shard.get(digest).ok_or(LedgerError::NotFound(*digest))?;
        let updated =
            current
                .adjusted(delta, now)
                .ok_or(LedgerError::InvariantViolation {
                    digest: *digest,
                    current: current.reference_count,
                    delta,
                })?;
        journal.append(&LedgerEvent::Upsert(updated.clone()))?;
        shard.insert(*digest, updated.clone());
        Ok(updated)
    }

    pub(crate) fn renew_release(
        &self,
        digest: &Digest,
        now: DateTime<Utc>,
        journal: &dyn Journal,
    ) -> LedgerResult<Option<BlobRecord>> {
        let mut shard = self.write_shard(digest)?;
        let Some(renewed) = shard.get(digest).and_then(|r| r.renewed(now)) else {
            return Ok(None);
        };
        journal.append(&LedgerEvent::Upsert(renewed.clone()))?;
        shard.insert(*digest, renewed.clone());
        Ok(Some(renewed))
    }

    pub(crate) fn remove_if_unreferenced(
        &self,
        digest: &Digest,
        released_before: DateTime<Utc>,
        journal: &dyn Journal,
    ) -> LedgerResult<Option<BlobRecord>> {
        let mut shard = self.write_shard(digest)?;
        match shard.get(digest) {
            Some(record) if record.released_before(released_before) => {}
            _ => return Ok(None),
        }
        journal.append(&LedgerEvent::Remove(*digest))?;
        Ok(shard.remove(digest))
    }

    pub(crate) fn unreferenced(
        &self,
        released_before: DateTime<Utc>,
        limit: usize,
    ) -> LedgerResult<Vec<BlobRecord>> {
        let mut found = Vec::new();
        for shard in &self.shards {
            let shard = shard.read().map_err(|_| LedgerError::LockPoisoned)?;
            found.extend(
                shard
                    .values()
                    .filter(|r| r.released_before(released_before))
                    .cloned(),
            );
        }
        found.sort_by_key(|r| (r.released_at, r.digest));
        found.truncate(limit);
        Ok(found)
    }

    pub(crate) fn stats(&self) -> LedgerResult<LedgerStats> {
        let mut stats = LedgerStats::default();
        for shard in &self.shards {
            let shard = shard.read().map_err(|_| LedgerError::LockPoisoned)?;
            shard.values().for_each(|r| stats.observe(r));
        }
        Ok(stats)
    }

    pub(crate) fn len(&self) -> LedgerResult<usize> {
        let mut total = 0;
        for shard in &self.shards {
            total += shard.read().map_err(|_| LedgerError::LockPoisoned)?.len();
        }
        Ok(total)
    }

    /// Apply a recovered event without journaling it again.
    pub(crate) fn replay(&self, event: LedgerEvent) -> LedgerResult<()> {
        match event {
            LedgerEvent::Upsert(record) => {
                self.write_shard(&record.digest)?.insert(record.digest, record);
            }
            LedgerEvent::Remove(digest) => {
                self.write_shard(&digest)?.remove(&digest);
            }
        }
        Ok(())
    }

    /// Run `f` over a consistent snapshot of every row while all shards are
    /// write-locked, so no mutation can interleave with it.
    ///
    /// Shards are always locked in index order; single-digest mutations hold
    /// one shard at a time, so this cannot deadlock with them.
    pub(crate) fn with_exclusive<T>(
        &self,
        f: impl FnOnce(&[BlobRecord]) -> LedgerResult<T>,
    ) -> LedgerResult<T> {
        let guards = self
            .shards
            .iter()
            .map(|s| s.write().map_err(|_| LedgerError::LockPoisoned))
            .collect::<LedgerResult<Vec<_>>>()?;
        let mut records: Vec<BlobRecord> =
            guards.iter().flat_map(|g| g.values().cloned()).collect();
        records.sort_by_key(|r| r.digest);
        let result = f(&records);
        drop(guards);
        result
    }
}

/// In-memory blob ledger.
///
/// Intended for tests and embedding. Rows live in digest-sharded maps; see
/// [`WalBlobLedger`](crate::WalBlobLedger) for the durable variant.
pub struct InMemoryBlobLedger {
    table: RecordTable,
}

impl InMemoryBlobLedger {
    /// Create a new empty ledger.
    pub fn new() -> Self {
        Self {
            table: RecordTable::new(),
        }
    }

    /// Number of blob rows currently recorded.
    pub fn len(&self) -> LedgerResult<usize> {
        self.table.len()
    }

    /// Returns `true` if no rows are recorded.
    pub fn is_empty(&self) -> LedgerResult<bool> {
        Ok(self.table.len()? == 0)
    }
}

impl Default for InMemoryBlobLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for InMemoryBlobLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryBlobLedger")
            .field("blob_count", &self.table.len().ok())
            .finish()
    }
}

#[async_trait]
impl BlobLedger for InMemoryBlobLedger {
    async fn lookup(&self, digest: &Digest) -> LedgerResult<Option<BlobRecord>> {
        self.table.get(digest)
    }

    async fn record_new(&self, blob: NewBlob) -> LedgerResult<bool> {
        self.table.insert_if_absent(blob, Utc::now(), &NoJournal)
    }

    async fn adjust_reference_count(
        &self,
        digest: &Digest,
        delta: RefDelta,
    ) -> LedgerResult<BlobRecord> {
        self.table.adjust(digest, delta, Utc::now(), &NoJournal)
    }

    async fn renew_release(&self, digest: &Digest) -> LedgerResult<Option<BlobRecord>> {
        self.table.renew_release(digest, Utc::now(), &NoJournal)
    }

    async fn unreferenced(
        &self,
        released_before: DateTime<Utc>,
        limit: usize,
    ) -> LedgerResult<Vec<BlobRecord>> {
        self.table.unreferenced(released_before, limit)
    }

    async fn remove_if_unreferenced(
        &self,
        digest: &Digest,
        released_before: DateTime<Utc>,
    ) -> LedgerResult<Option<BlobRecord>> {
        self.table
            .remove_if_unreferenced(digest, released_before, &NoJournal)
    }

    async fn stats(&self) -> LedgerResult<LedgerStats> {
        self.table.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Arc;

    use chrono::Duration;
    use vault_types::MediaType;

    fn new_blob(seed: u8, size: u64) -> NewBlob {
        let digest = Digest::from_hash([seed; 32]);
        NewBlob {
            digest,
            size_bytes: size,
            declared_media_type: Some(MediaType::parse("text/plain").unwrap()),
            physical_path: PathBuf::from(format!("/data/{}", digest.to_hex())),
        }
    }

    // -----------------------------------------------------------------------
    // record_new / lookup
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn record_new_inserts_with_zero_count() {
        let ledger = InMemoryBlobLedger::new();
        let blob = new_blob(1, 5);
        assert!(ledger.record_new(blob.clone()).await.unwrap());

        let rec = ledger.lookup(&blob.digest).await.unwrap().expect("recorded");
        assert_eq!(rec.size_bytes, 5);
        assert_eq!(rec.reference_count, 0);
        assert_eq!(rec.physical_path, blob.physical_path);
    }

    #[tokio::test]
    async fn record_new_is_idempotent() {
        let ledger = InMemoryBlobLedger::new();
        let blob = new_blob(2, 10);
        assert!(ledger.record_new(blob.clone()).await.unwrap());
        ledger
            .adjust_reference_count(&blob.digest, RefDelta::Acquire)
            .await
            .unwrap();

        // A second record must not reset the count or the metadata.
        let mut again = blob.clone();
        again.declared_media_type = None;
        assert!(!ledger.record_new(again).await.unwrap());

        let rec = ledger.lookup(&blob.digest).await.unwrap().unwrap();
        assert_eq!(rec.reference_count, 1);
        assert!(rec.declared_media_type.is_some());
        assert_eq!(ledger.len().unwrap(), 1);
    }

    #[tokio::test]
    async fn lookup_missing_returns_none() {
        let ledger = InMemoryBlobLedger::new();
        let missing = Digest::from_hash([9; 32]);
        assert!(ledger.lookup(&missing).await.unwrap().is_none());
    }

    // -----------------------------------------------------------------------
    // Reference counting
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn adjust_applies_deltas() {
        let ledger = InMemoryBlobLedger::new();
        let blob = new_blob(3, 1);
        ledger.record_new(blob.clone()).await.unwrap();

        let rec = ledger
            .adjust_reference_count(&blob.digest, RefDelta::Acquire)
            .await
            .unwrap();
        assert_eq!(rec.reference_count, 1);
        assert!(rec.released_at.is_none());

        let rec = ledger
            .adjust_reference_count(&blob.digest, RefDelta::Release)
            .await
            .unwrap();
        assert_eq!(rec.reference_count, 0);
        assert!(rec.released_at.is_some());
    }

    #[tokio::test]
    async fn release_below_zero_is_invariant_violation() {
        let ledger = InMemoryBlobLedger::new();
        let blob = new_blob(4, 1);
        ledger.record_new(blob.clone()).await.unwrap();

        let err = ledger
            .adjust_reference_count(&blob.digest, RefDelta::Release)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InvariantViolation {
                current: 0,
                delta: RefDelta::Release,
                ..
            }
        ));
        // The row is untouched.
        let rec = ledger.lookup(&blob.digest).await.unwrap().unwrap();
        assert_eq!(rec.reference_count, 0);
    }

    #[tokio::test]
    async fn adjust_missing_is_not_found() {
        let ledger = InMemoryBlobLedger::new();
        let missing = Digest::from_hash([5; 32]);
        let err = ledger
            .adjust_reference_count(&missing, RefDelta::Acquire)
            .await
            .unwrap_err();
        assert!(matches!(err, LedgerError::NotFound(d) if d == missing));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_adjustments_do_not_lose_updates() {
        let ledger = Arc::new(InMemoryBlobLedger::new());
        let blob = new_blob(6, 1);

        let tasks: Vec<_> = (0..64)
            .map(|_| {
                let ledger = Arc::clone(&ledger);
                let blob = blob.clone();
                tokio::spawn(async move {
                    let inserted = ledger.record_new(blob.clone()).await.unwrap();
                    ledger
                        .adjust_reference_count(&blob.digest, RefDelta::Acquire)
                        .await
                        .unwrap();
                    inserted
                })
            })
            .collect();

        let mut inserted = 0;
        for task in tasks {
            if task.await.unwrap() {
                inserted += 1;
            }
        }
        assert_eq!(inserted, 1);
        let rec = ledger.lookup(&blob.digest).await.unwrap().unwrap();
        assert_eq!(rec.reference_count, 64);
    }

    // -----------------------------------------------------------------------
    // Sweep support
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn unreferenced_lists_only_released_rows() {
        let ledger = InMemoryBlobLedger::new();
        let held = new_blob(7, 1);
        let free = new_blob(8, 2);
        ledger.record_new(held.clone()).await.unwrap();
        ledger.record_new(free.clone()).await.unwrap();
        ledger
            .adjust_reference_count(&held.digest, RefDelta::Acquire)
            .await
            .unwrap();

        let now = Utc::now();
        let found = ledger.unreferenced(now, 10).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].digest, free.digest);

        let too_early = ledger
            .unreferenced(now - Duration::hours(1), 10)
            .await
            .unwrap();
        assert!(too_early.is_empty());
    }

    #[tokio::test]
    async fn unreferenced_respects_limit() {
        let ledger = InMemoryBlobLedger::new();
        for seed in 10..15 {
            ledger.record_new(new_blob(seed, 1)).await.unwrap();
        }
        let found = ledger.unreferenced(Utc::now(), 3).await.unwrap();
        assert_eq!(found.len(), 3);
    }

    #[tokio::test]
    async fn renew_release_restarts_grace_period() {
        let ledger = InMemoryBlobLedger::new();
        let blob = new_blob(21, 1);
        ledger.record_new(blob.clone()).await.unwrap();
        let first = ledger.lookup(&blob.digest).await.unwrap().unwrap();
        let released = first.released_at.unwrap();

        let later = released + Duration::minutes(10);
        let renewed = ledger
            .table
            .renew_release(&blob.digest, later, &NoJournal)
            .unwrap()
            .expect("unreferenced row is renewed");
        assert_eq!(renewed.released_at, Some(later));

        // A sweep cutoff between the two release times no longer matches.
        let cutoff = released + Duration::minutes(5);
        assert!(ledger.unreferenced(cutoff, 10).await.unwrap().is_empty());
        assert!(ledger
            .remove_if_unreferenced(&blob.digest, cutoff)
            .await
            .unwrap()
            .is_none());
        assert!(ledger.lookup(&blob.digest).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn renew_release_skips_referenced_and_missing_rows() {
        let ledger = InMemoryBlobLedger::new();
        let blob = new_blob(22, 1);
        ledger.record_new(blob.clone()).await.unwrap();
        ledger
            .adjust_reference_count(&blob.digest, RefDelta::Acquire)
            .await
            .unwrap();

        assert!(ledger.renew_release(&blob.digest).await.unwrap().is_none());
        let rec = ledger.lookup(&blob.digest).await.unwrap().unwrap();
        assert_eq!(rec.reference_count, 1);
        assert!(rec.released_at.is_none());

        let missing = Digest::from_hash([23; 32]);
        assert!(ledger.renew_release(&missing).await.unwrap().is_none());
        assert!(ledger.lookup(&missing).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn remove_if_unreferenced_rechecks_count() {
        let ledger = InMemoryBlobLedger::new();
        let blob = new_blob(20, 1);
        ledger.record_new(blob.clone()).await.unwrap();
        ledger
            .adjust_reference_count(&blob.digest, RefDelta::Acquire)
            .await
            .unwrap();

        let cutoff = Utc::now() + Duration::hours(1);
        assert!(ledger
            .remove_if_unreferenced(&blob.digest, cutoff)
            .await
            .unwrap()
            .is_none());
        assert!(ledger.lookup(&blob.digest).await.unwrap().is_some());

        ledger
            .adjust_reference_count(&blob.digest, RefDelta::Release)
            .await
            .unwrap();
        let removed = ledger
            .remove_if_unreferenced(&blob.digest, cutoff)
            .await
            .unwrap()
            .expect("removed");
        assert_eq!(removed.digest, blob.digest);
        assert!(ledger.lookup(&blob.digest).await.unwrap().is_none());

        // Idempotent: nothing left to remove.
        assert!(ledger
            .remove_if_unreferenced(&blob.digest, cutoff)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn stats_aggregate_rows() {
        let ledger = InMemoryBlobLedger::new();
        let a = new_blob(30, 100);
        let b = new_blob(31, 50);
        ledger.record_new(a.clone()).await.unwrap();
        ledger.record_new(b.clone()).await.unwrap();
        for _ in 0..3 {
            ledger
                .adjust_reference_count(&a.digest, RefDelta::Acquire)
                .await
                .unwrap();
        }

        let stats = ledger.stats().await.unwrap();
        assert_eq!(
            stats,
            LedgerStats {
                blobs: 2,
                bytes: 150,
                unreferenced_blobs: 1,
                unreferenced_bytes: 50,
                references: 3,
            }
        );
    }

    #[test]
    fn debug_format() {
        let ledger = InMemoryBlobLedger::default();
        let debug = format!("{ledger:?}");
        assert!(debug.contains("InMemoryBlobLedger"));
        assert!(debug.contains("blob_count"));
    }
}
