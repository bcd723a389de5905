use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::layout::ShardLayout;

/// Storage-level settings.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Storage root. Shard directories, staging, and the default WAL live here.
    pub root: PathBuf,
    /// `fsync` staged files before they are committed.
    pub fsync: bool,
    /// Minimum time a blob must stay unreferenced before the sweep reclaims it.
    pub sweep_grace_secs: u64,
    /// Maximum number of candidates a single sweep examines.
    pub sweep_batch_limit: usize,
    /// Staging files older than this are treated as crash leftovers.
    pub staging_max_age_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("./vault-data"),
            fsync: true,
            sweep_grace_secs: 60 * 60,
            sweep_batch_limit: 1_000,
            staging_max_age_secs: 24 * 60 * 60,
        }
    }
}

impl StoreConfig {
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    pub fn layout(&self) -> ShardLayout {
        ShardLayout::new(&self.root)
    }

    pub fn sweep_grace(&self) -> Duration {
        Duration::from_secs(self.sweep_grace_secs)
    }

    pub fn staging_max_age(&self) -> Duration {
        Duration::from_secs(self.staging_max_age_secs)
    }
}
