use std::path::{Path, PathBuf};

use tempfile::TempPath;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tracing::debug;
use vault_crypto::ContentHasher;
use vault_types::Digest;

use crate::error::StoreResult;

const CHUNK_SIZE: usize = 64 * 1024;

/// A fully written, hashed upload waiting to be committed.
///
/// The staging file is owned by this value: dropping it without committing
/// deletes the file. That also covers an upload future that is dropped
/// mid-flight.
#[derive(Debug)]
pub struct StagedBlob {
    digest: Digest,
    size_bytes: u64,
    path: TempPath,
}

impl StagedBlob {
    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    pub fn size_bytes(&self) -> u64 {
        self.size_bytes
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn into_temp_path(self) -> TempPath {
        self.path
    }
}

/// Streams bytes into a private staging file while hashing them.
#[derive(Clone, Debug)]
pub struct HashingWriter {
    staging_dir: PathBuf,
    fsync: bool,
}

impl HashingWriter {
    pub fn new(staging_dir: impl Into<PathBuf>, fsync: bool) -> Self {
        Self {
            staging_dir: staging_dir.into(),
            fsync,
        }
    }

    /// Consume `reader` to EOF. Every byte is hashed and written exactly once.
    ///
    /// On any read or write error the staging file is removed before the
    /// error is returned.
    pub async fn stage<R>(&self, mut reader: R) -> StoreResult<StagedBlob>
    where
        R: AsyncRead + Unpin,
    {
        tokio::fs::create_dir_all(&self.staging_dir).await?;
        let (file, path) = tempfile::Builder::new()
            .prefix("upload-")
            .tempfile_in(&self.staging_dir)?
            .into_parts();
        let mut file = tokio::fs::File::from_std(file);

        let mut hasher = ContentHasher::new();
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
            file.write_all(&buf[..n]).await?;
        }
        file.flush().await?;
        if self.fsync {
            file.sync_all().await?;
        }
        drop(file);

        let (digest, size_bytes) = hasher.finalize();
        debug!(digest = %digest, size = size_bytes, path = %path.display(), "upload staged");
        Ok(StagedBlob {
            digest,
            size_bytes,
            path,
        })
    }
}
