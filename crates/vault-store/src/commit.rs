use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::StoreResult;
use crate::layout::ShardLayout;
use crate::staging::StagedBlob;

/// Result of promoting a staged upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CommitOutcome {
    /// This upload produced the physical file.
    Created(PathBuf),
    /// The content was already stored; the staged copy was discarded.
    AlreadyExisted(PathBuf),
}

impl CommitOutcome {
    pub fn path(&self) -> &Path {
        match self {
            Self::Created(p) | Self::AlreadyExisted(p) => p,
        }
    }

    pub fn already_existed(&self) -> bool {
        matches!(self, Self::AlreadyExisted(_))
    }
}

/// Moves staged files into their content-addressed location.
///
/// The move never overwrites: of several writers racing on one digest,
/// exactly one sees `Created`. Readers never observe a partially written
/// file under the final name.
#[derive(Clone, Debug)]
pub struct AtomicCommitter {
    layout: ShardLayout,
    fsync: bool,
}

impl AtomicCommitter {
    pub fn new(layout: ShardLayout, fsync: bool) -> Self {
        Self { layout, fsync }
    }

    pub async fn commit(&self, staged: StagedBlob) -> StoreResult<CommitOutcome> {
        let digest = *staged.digest();
        let target = self.layout.blob_path(&digest);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        if tokio::fs::try_exists(&target).await? {
            debug!(digest = %digest, "content already stored; discarding staged copy");
            return Ok(CommitOutcome::AlreadyExisted(target));
        }

        match staged.into_temp_path().persist_noclobber(&target) {
            Ok(()) => {
                if self.fsync {
                    if let Some(parent) = target.parent() {
                        if let Err(e) = sync_dir(parent) {
                            warn!(path = %parent.display(), error = %e, "failed to sync shard directory");
                        }
                    }
                }
                debug!(digest = %digest, path = %target.display(), "blob committed");
                Ok(CommitOutcome::Created(target))
            }
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => {
                // Lost the race to another writer; dropping the returned
                // path removes our staged copy.
                drop(e.path);
                debug!(digest = %digest, "lost commit race; content already stored");
                Ok(CommitOutcome::AlreadyExisted(target))
            }
            Err(e) => Err(e.error.into()),
        }
    }
}

fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}
