use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OwnedMutexGuard;
use vault_types::Digest;

type Entry = Arc<tokio::sync::Mutex<()>>;

/// In-process keyed lock: one async mutex per digest currently in use.
///
/// Entries are created on demand and dropped when the last holder or waiter
/// releases them, so the table only ever holds digests with activity.
/// Unrelated digests never wait on each other; the outer std mutex is only
/// held for the map lookup.
#[derive(Default)]
pub struct DigestLocks {
    entries: Arc<Mutex<HashMap<Digest, Entry>>>,
}

/// Exclusive hold on one digest. Released on drop.
pub struct DigestGuard {
    digest: Digest,
    entry: Option<Entry>,
    guard: Option<OwnedMutexGuard<()>>,
    entries: Arc<Mutex<HashMap<Digest, Entry>>>,
}

impl DigestLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wait until no other task holds `digest`, then hold it.
    pub async fn lock(&self, digest: Digest) -> DigestGuard {
        let entry = {
            let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
            entries.entry(digest).or_default().clone()
        };
        let guard = entry.clone().lock_owned().await;
        DigestGuard {
            digest,
            entry: Some(entry),
            guard: Some(guard),
            entries: self.entries.clone(),
        }
    }

    /// Number of digests with a live entry.
    pub fn active(&self) -> usize {
        self.entries
            .lock()
            .map(|e| e.len())
            .unwrap_or_else(|p| p.into_inner().len())
    }
}

impl std::fmt::Debug for DigestLocks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DigestLocks")
            .field("active", &self.active())
            .finish()
    }
}

impl DigestGuard {
    pub fn digest(&self) -> &Digest {
        &self.digest
    }
}

impl Drop for DigestGuard {
    fn drop(&mut self) {
        drop(self.guard.take());
        let Some(entry) = self.entry.take() else {
            return;
        };
        let mut entries = self.entries.lock().unwrap_or_else(|p| p.into_inner());
        // The map holds one reference and `entry` another. Anything more is
        // a waiter that still needs the entry.
        if Arc::strong_count(&entry) == 2 {
            entries.remove(&self.digest);
        }
    }
}
