use std::path::Path;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tracing::info;
use vault_types::{BlobRecord, Digest, NewBlob, RefDelta};

use crate::error::LedgerResult;
use crate::memory::RecordTable;
use crate::traits::{BlobLedger, LedgerStats};
use crate::wal::{LedgerEvent, WalConfig, WriteAheadLog};

/// Durable single-process ledger: the sharded record table, with every
/// change appended to a [`WriteAheadLog`] before it becomes visible.
///
/// Opening the ledger replays the log. [`compact`](Self::compact) rewrites
/// the log to one `Upsert` per live row.
pub struct WalBlobLedger {
    table: RecordTable,
    wal: WriteAheadLog,
}

impl WalBlobLedger {
    pub fn open(path: &Path, config: WalConfig) -> LedgerResult<Self> {
        let (wal, events) = WriteAheadLog::open(path, config)?;
        let table = RecordTable::new();
        let replayed = events.len();
        for event in events {
            table.replay(event)?;
        }
        info!(
            path = %path.display(),
            replayed,
            blobs = table.len()?,
            "ledger opened"
        );
        Ok(Self { table, wal })
    }

    /// Rewrite the log so it holds exactly one entry per live row.
    ///
    /// Returns `(bytes_before, bytes_after)`.
    pub fn compact(&self) -> LedgerResult<(u64, u64)> {
        let before = self.wal.offset();
        self.table.with_exclusive(|records| {
            let events: Vec<LedgerEvent> =
                records.iter().cloned().map(LedgerEvent::Upsert).collect();
            self.wal.rewrite(&events)
        })?;
        let after = self.wal.offset();
        info!(before, after, "ledger compacted");
        Ok((before, after))
    }

    pub fn len(&self) -> LedgerResult<usize> {
        self.table.len()
    }

    pub fn is_empty(&self) -> LedgerResult<bool> {
        Ok(self.table.len()? == 0)
    }

    /// Path of the underlying log file.
    pub fn wal_path(&self) -> &Path {
        self.wal.path()
    }
}

impl std::fmt::Debug for WalBlobLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WalBlobLedger")
            .field("wal", &self.wal.path())
            .field("blob_count", &self.table.len().ok())
            .finish()
    }
}

#[async_trait]
impl BlobLedger for WalBlobLedger {
    async fn lookup(&self, digest: &Digest) -> LedgerResult<Option<BlobRecord>> {
        self.table.get(digest)
    }

    async fn record_new(&self, blob: NewBlob) -> LedgerResult<bool> {
        self.table.insert_if_absent(blob, Utc::now(), &self.wal)
    }

    async fn adjust_reference_count(
        &self,
        digest: &Digest,
        delta: RefDelta,
    ) -> LedgerResult<BlobRecord> {
        self.table.adjust(digest, delta, Utc::now(), &self.wal)
    }

    async fn renew_release(&self, digest: &Digest) -> LedgerResult<Option<BlobRecord>> {
        self.table.renew_release(digest, Utc::now(), &self.wal)
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
            .remove_if_unreferenced(digest, released_before, &self.wal)
    }

    async fn stats(&self) -> LedgerResult<LedgerStats> {
        self.table.stats()
    }
}
