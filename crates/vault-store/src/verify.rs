use std::fs::File;
use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use vault_crypto::hash_reader;
use vault_types::{BlobRecord, Digest};

use crate::error::StoreResult;

/// Result of re-hashing a stored blob.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum VerifyOutcome {
    /// Bytes on disk hash to the recorded digest.
    Intact,
    /// Bytes on disk hash to something else.
    Corrupt { actual: Digest },
    /// The file length differs from the recorded size.
    SizeMismatch { expected: u64, actual: u64 },
    /// No file at the blob's path.
    Missing,
}

impl VerifyOutcome {
    pub fn is_intact(&self) -> bool {
        matches!(self, Self::Intact)
    }
}

/// Re-hash the file at `path` against `record`. Runs on the blocking pool.
pub(crate) async fn verify_file(path: PathBuf, record: &BlobRecord) -> StoreResult<VerifyOutcome> {
    let expected_digest = record.digest;
    let expected_size = record.size_bytes;

    let outcome = tokio::task::spawn_blocking(move || -> io::Result<VerifyOutcome> {
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(VerifyOutcome::Missing),
            Err(e) => return Err(e),
        };
        let actual_size = file.metadata()?.len();
        if actual_size != expected_size {
            return Ok(VerifyOutcome::SizeMismatch {
                expected: expected_size,
                actual: actual_size,
            });
        }
        let (actual, _) = hash_reader(file)?;
        Ok(if actual == expected_digest {
            VerifyOutcome::Intact
        } else {
            VerifyOutcome::Corrupt { actual }
        })
    })
    .await
    .map_err(io::Error::other)??;

    Ok(outcome)
}
