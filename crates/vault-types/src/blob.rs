use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::digest::Digest;
use crate::media::MediaType;

/// Lifecycle state of a physical blob.
///
/// `Unreferenced` is a holding state. Reaching it never deletes anything;
/// physical reclamation is a separate sweep that re-checks the count.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BlobState {
    Referenced,
    Unreferenced,
}

impl fmt::Display for BlobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Referenced => write!(f, "referenced"),
            Self::Unreferenced => write!(f, "unreferenced"),
        }
    }
}

/// A single change to a blob's reference count.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RefDelta {
    /// A logical file was created over the digest (+1).
    Acquire,
    /// A logical file over the digest was deleted (-1).
    Release,
}

impl RefDelta {
    pub fn as_i64(self) -> i64 {
        match self {
            Self::Acquire => 1,
            Self::Release => -1,
        }
    }
}

impl fmt::Display for RefDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:+}", self.as_i64())
    }
}

/// Fields needed to record a freshly committed blob in the ledger.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewBlob {
    pub digest: Digest,
    pub size_bytes: u64,
    pub declared_media_type: Option<MediaType>,
    pub physical_path: PathBuf,
}

impl NewBlob {
    /// Build the initial ledger row: zero references, unreferenced since
    /// `now`.
    pub fn into_record(self, now: DateTime<Utc>) -> BlobRecord {
        BlobRecord {
            digest: self.digest,
            size_bytes: self.size_bytes,
            declared_media_type: self.declared_media_type,
            physical_path: self.physical_path,
            reference_count: 0,
            created_at: now,
            released_at: Some(now),
        }
    }
}

/// One blob ledger row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobRecord {
    /// Content hash; the primary key.
    pub digest: Digest,
    /// Exact byte length of the stored content.
    pub size_bytes: u64,
    /// Caller hint recorded on first sight of the digest.
    pub declared_media_type: Option<MediaType>,
    /// Durable location, derived from `digest` by the store layout.
    pub physical_path: PathBuf,
    /// Number of live logical files pointing at `digest`.
    pub reference_count: u64,
    pub created_at: DateTime<Utc>,
    /// When the count last dropped to zero. `None` while referenced.
    pub released_at: Option<DateTime<Utc>>,
}

impl BlobRecord {
    pub fn state(&self) -> BlobState {
        if self.reference_count == 0 {
            BlobState::Unreferenced
        } else {
            BlobState::Referenced
        }
    }

    pub fn is_unreferenced(&self) -> bool {
        self.reference_count == 0
    }

    /// Whether the blob has been unreferenced since at or before `cutoff`.
    pub fn released_before(&self, cutoff: DateTime<Utc>) -> bool {
        self.is_unreferenced() && self.released_at.is_some_and(|at| at <= cutoff)
    }

    /// Restart the grace period of an unreferenced row at `now`.
    ///
    /// Returns `None` while the row is referenced.
    pub fn renewed(&self, now: DateTime<Utc>) -> Option<Self> {
        self.is_unreferenced().then(|| Self {
            released_at: Some(now),
            ..self.clone()
        })
    }

    /// Apply `delta`, returning the updated row.
    ///
    /// Returns `None` when the count would go negative. Callers must surface
    /// that as an invariant violation; the count is never clamped.
    pub fn adjusted(&self, delta: RefDelta, now: DateTime<Utc>) -> Option<Self> {
        let reference_count = match delta {
            RefDelta::Acquire => self.reference_count.checked_add(1)?,
            RefDelta::Release => self.reference_count.checked_sub(1)?,
        };
        let released_at = (reference_count == 0).then_some(now);
        Some(Self {
            reference_count,
            released_at,
            ..self.clone()
        })
    }
}

/// Opaque owner key for usage queries answered by the metadata layer.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OwnerScope(String);

impl OwnerScope {
    pub fn new(scope: impl Into<String>) -> Self {
        Self(scope.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OwnerScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
