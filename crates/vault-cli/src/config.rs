use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use vault_ledger::SyncMode;
use vault_store::StoreConfig;

/// Log file name used when the WAL backend has no explicit path.
pub const DEFAULT_WAL_FILE: &str = "ledger.wal";

pub const ENV_STORAGE_DIR: &str = "VAULT_STORAGE_DIR";
pub const ENV_DATABASE_URL: &str = "DATABASE_URL";

/// Everything the `vault` binary needs to open a store.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    pub store: StoreConfig,
    pub ledger: LedgerBackend,
}

/// Where the blob ledger lives.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "snake_case")]
pub enum LedgerBackend {
    /// Write-ahead log on local disk.
    Wal {
        /// Defaults to `<root>/ledger.wal`.
        #[serde(default)]
        path: Option<PathBuf>,
        #[serde(default = "default_sync")]
        sync: SyncMode,
    },
    /// PostgreSQL `blobs` table.
    Postgres {
        url: String,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
    },
}

fn default_max_connections() -> u32 {
    10
}

fn default_sync() -> SyncMode {
    SyncMode::EveryWrite
}

impl Default for LedgerBackend {
    fn default() -> Self {
        Self::Wal {
            path: None,
            sync: default_sync(),
        }
    }
}

impl VaultConfig {
    /// Read `path` if given (defaults otherwise), then apply environment
    /// overrides.
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config {}", path.display()))?;
                Self::from_toml(&text)
                    .with_context(|| format!("failed to parse config {}", path.display()))?
            }
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_toml(text: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(text)?)
    }

    /// `VAULT_STORAGE_DIR` replaces the storage root. `DATABASE_URL`
    /// replaces the Postgres URL, and selects the Postgres backend when the
    /// binary was built with it.
    pub fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(root) = var(ENV_STORAGE_DIR).filter(|v| !v.is_empty()) {
            self.store.root = PathBuf::from(root);
        }
        if let Some(db_url) = var(ENV_DATABASE_URL).filter(|v| !v.is_empty()) {
            if let LedgerBackend::Postgres { url, .. } = &mut self.ledger {
                *url = db_url;
            } else if cfg!(feature = "postgres") {
                self.ledger = LedgerBackend::Postgres {
                    url: db_url,
                    max_connections: default_max_connections(),
                };
            }
        }
    }

    /// Log path for the WAL backend.
    pub fn wal_path(&self) -> Option<PathBuf> {
        match &self.ledger {
            LedgerBackend::Wal { path, .. } => Some(
                path.clone()
                    .unwrap_or_else(|| self.store.root.join(DEFAULT_WAL_FILE)),
            ),
            LedgerBackend::Postgres { .. } => None,
        }
    }
}
