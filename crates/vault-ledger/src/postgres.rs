//! PostgreSQL ledger backend.
//!
//! Rows live in the `blobs` table created by `migrations/0001_create_blobs.sql`.
//! Every mutation is a single statement, so per-digest atomicity comes from
//! Postgres row locking and different digests never contend.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use tracing::{debug, info};
use vault_types::{BlobRecord, Digest, MediaType, NewBlob, RefDelta};

use crate::error::{LedgerError, LedgerResult};
use crate::traits::{BlobLedger, LedgerStats};

const BLOB_COLUMNS: &str = "digest, size_bytes, declared_media_type, physical_path, \
                            reference_count, created_at, released_at";

/// Blob ledger backed by a PostgreSQL connection pool.
#[derive(Clone, Debug)]
pub struct PgBlobLedger {
    pool: PgPool,
}

impl PgBlobLedger {
    /// Connect to `url` and apply pending migrations.
    pub async fn connect(url: &str, max_connections: u32) -> LedgerResult<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .acquire_timeout(Duration::from_secs(5))
            .connect(url)
            .await?;
        info!(max_connections, "connected to PostgreSQL");

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(sqlx::Error::from)?;
        info!("ledger migrations applied");

        Ok(Self { pool })
    }

    /// Wrap an existing pool. Migrations are the caller's responsibility.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[derive(Debug, sqlx::FromRow)]
struct BlobRow {
    digest: String,
    size_bytes: i64,
    declared_media_type: Option<String>,
    physical_path: String,
    reference_count: i64,
    created_at: DateTime<Utc>,
    released_at: Option<DateTime<Utc>>,
}

impl BlobRow {
    fn into_record(self) -> LedgerResult<BlobRecord> {
        let corrupt = |reason: String| LedgerError::CorruptRecord {
            digest: self.digest.clone(),
            reason,
        };
        let digest = Digest::from_hex(&self.digest).map_err(|e| corrupt(e.to_string()))?;
        let size_bytes = u64::try_from(self.size_bytes)
            .map_err(|_| corrupt(format!("negative size {}", self.size_bytes)))?;
        let reference_count = u64::try_from(self.reference_count)
            .map_err(|_| corrupt(format!("negative reference count {}", self.reference_count)))?;
        let declared_media_type = self
            .declared_media_type
            .as_deref()
            .map(MediaType::parse)
            .transpose()
            .map_err(|e| corrupt(e.to_string()))?;

        Ok(BlobRecord {
            digest,
            size_bytes,
            declared_media_type,
            physical_path: PathBuf::from(&self.physical_path),
            reference_count,
            created_at: self.created_at,
            released_at: self.released_at,
        })
    }
}

fn to_i64(value: u64, what: &str) -> LedgerResult<i64> {
    i64::try_from(value).map_err(|_| LedgerError::Serialization(format!("{what} exceeds i64: {value}")))
}

fn to_limit(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

#[async_trait]
impl BlobLedger for PgBlobLedger {
    async fn lookup(&self, digest: &Digest) -> LedgerResult<Option<BlobRecord>> {
        let row = sqlx::query_as::<_, BlobRow>(&format!(
            "SELECT {BLOB_COLUMNS} FROM blobs WHERE digest = $1"
        ))
        .bind(digest.to_hex())
        .fetch_optional(&self.pool)
        .await?;

        row.map(BlobRow::into_record).transpose()
    }

    async fn record_new(&self, blob: NewBlob) -> LedgerResult<bool> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO blobs (digest, size_bytes, declared_media_type, physical_path,
             reference_count, created_at, released_at)
             VALUES ($1, $2, $3, $4, 0, $5, $5)
             ON CONFLICT (digest) DO NOTHING",
        )
        .bind(blob.digest.to_hex())
        .bind(to_i64(blob.size_bytes, "size_bytes")?)
        .bind(blob.declared_media_type.as_ref().map(MediaType::as_str))
        .bind(blob.physical_path.to_string_lossy().into_owned())
        .bind(now)
        .execute(&self.pool)
        .await?;

        let inserted = result.rows_affected() > 0;
        debug!(digest = %blob.digest, inserted, "record_new");
        Ok(inserted)
    }

    async fn adjust_reference_count(
        &self,
        digest: &Digest,
        delta: RefDelta,
    ) -> LedgerResult<BlobRecord> {
        let hex = digest.to_hex();
        let updated = sqlx::query_as::<_, BlobRow>(&format!(
            "UPDATE blobs
             SET reference_count = reference_count + $2,
                 released_at = CASE WHEN reference_count + $2 = 0 THEN $3 ELSE NULL END
             WHERE digest = $1 AND reference_count + $2 >= 0
             RETURNING {BLOB_COLUMNS}"
        ))
        .bind(&hex)
        .bind(delta.as_i64())
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;

        if let Some(row) = updated {
            return row.into_record();
        }

        // No row matched: either the digest is unknown or the count would
        // have gone negative.
        let current: Option<i64> =
            sqlx::query_scalar("SELECT reference_count FROM blobs WHERE digest = $1")
                .bind(&hex)
                .fetch_optional(&self.pool)
                .await?;
        match current {
            None => Err(LedgerError::NotFound(*digest)),
            Some(count) => Err(LedgerError::InvariantViolation {
                digest: *digest,
                current: u64::try_from(count).unwrap_or_default(),
                delta,
            }),
        }
    }

    async fn renew_release(&self, digest: &Digest) -> LedgerResult<Option<BlobRecord>> {
        let row = sqlx::query_as::<_, BlobRow>(&format!(
            "UPDATE blobs SET released_at = $2
             WHERE digest = $1 AND reference_count = 0
             RETURNING {BLOB_COLUMNS}"
        ))
        .bind(digest.to_hex())
        .bind(Utc::now())
        .fetch_optional(&self.pool)
        .await?;

        row.map(BlobRow::into_record).transpose()
    }

    async fn unreferenced(
        &self,
        released_before: DateTime<Utc>,
        limit: usize,
    ) -> LedgerResult<Vec<BlobRecord>> {
        let rows = sqlx::query_as::<_, BlobRow>(&format!(
            "SELECT {BLOB_COLUMNS} FROM blobs
             WHERE reference_count = 0 AND released_at <= $1
             ORDER BY released_at, digest
             LIMIT $2"
        ))
        .bind(released_before)
        .bind(to_limit(limit))
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(BlobRow::into_record).collect()
    }

    async fn remove_if_unreferenced(
        &self,
        digest: &Digest,
        released_before: DateTime<Utc>,
    ) -> LedgerResult<Option<BlobRecord>> {
        let row = sqlx::query_as::<_, BlobRow>(&format!(
            "DELETE FROM blobs
             WHERE digest = $1 AND reference_count = 0 AND released_at <= $2
             RETURNING {BLOB_COLUMNS}"
        ))
        .bind(digest.to_hex())
        .bind(released_before)
        .fetch_optional(&self.pool)
        .await?;

        row.map(BlobRow::into_record).transpose()
    }

    async fn stats(&self) -> LedgerResult<LedgerStats> {
        let (blobs, bytes, unreferenced_blobs, unreferenced_bytes, references): (
            i64,
            i64,
            i64,
            i64,
            i64,
        ) = sqlx::query_as(
            "SELECT COUNT(*)::BIGINT,
                    COALESCE(SUM(size_bytes), 0)::BIGINT,
                    (COUNT(*) FILTER (WHERE reference_count = 0))::BIGINT,
                    COALESCE(SUM(size_bytes) FILTER (WHERE reference_count = 0), 0)::BIGINT,
                    COALESCE(SUM(reference_count), 0)::BIGINT
             FROM blobs",
        )
        .fetch_one(&self.pool)
        .await?;

        let non_negative = |v: i64| u64::try_from(v).unwrap_or_default();
        Ok(LedgerStats {
            blobs: non_negative(blobs),
            bytes: non_negative(bytes),
            unreferenced_blobs: non_negative(unreferenced_blobs),
            unreferenced_bytes: non_negative(unreferenced_bytes),
            references: non_negative(references),
        })
    }
}
