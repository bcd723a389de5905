use std::path::{Path, PathBuf};

use vault_types::Digest;

/// Directory under the root that holds in-flight uploads.
pub const STAGING_DIR: &str = ".staging";

/// Maps digests to their place under the storage root.
///
/// A blob lives at `<root>/<hex[0..2]>/<hex[2..4]>/<hex>`. The path is a pure
/// function of the digest, so the sweep can rediscover a blob's file from
/// the digest alone.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ShardLayout {
    root: PathBuf,
}

impl ShardLayout {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Final location of the blob with this digest.
    pub fn blob_path(&self, digest: &Digest) -> PathBuf {
        let hex = digest.to_hex();
        self.root.join(&hex[0..2]).join(&hex[2..4]).join(hex)
    }

    /// Private staging directory. Lives on the same volume as the shard
    /// tree so the commit rename never crosses filesystems.
    pub fn staging_dir(&self) -> PathBuf {
        self.root.join(STAGING_DIR)
    }

    /// Recover the digest from a path inside the shard tree.
    ///
    /// Returns `None` for anything that is not `<root>/<aa>/<bb>/<hex>` with
    /// matching prefixes.
    pub fn digest_for(&self, path: &Path) -> Option<Digest> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<&str> = rel.iter().map(|c| c.to_str()).collect::<Option<_>>()?;
        let [first, second, name] = parts.as_slice() else {
            return None;
        };
        let digest = Digest::from_hex(name).ok()?;
        let hex = digest.to_hex();
        (hex[0..2] == **first && hex[2..4] == **second).then_some(digest)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    const HELLO: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[test]
    fn hello_path() {
        let layout = ShardLayout::new("/var/vault");
        let digest = Digest::from_hex(HELLO).unwrap();
        assert_eq!(
            layout.blob_path(&digest),
            PathBuf::from(format!("/var/vault/2c/f2/{HELLO}"))
        );
    }

    #[test]
    fn staging_is_under_root() {
        let layout = ShardLayout::new("/var/vault");
        assert_eq!(layout.staging_dir(), PathBuf::from("/var/vault/.staging"));
    }

    #[test]
    fn digest_for_rejects_foreign_paths() {
        let layout = ShardLayout::new("/var/vault");
        assert!(layout.digest_for(Path::new("/elsewhere/2c/f2/x")).is_none());
        assert!(layout
            .digest_for(Path::new(&format!("/var/vault/00/f2/{HELLO}")))
            .is_none());
        assert!(layout
            .digest_for(Path::new("/var/vault/.staging/upload-1"))
            .is_none());
        assert!(layout.digest_for(Path::new("/var/vault/ledger.wal")).is_none());
    }

    proptest! {
        #[test]
        fn path_roundtrips_through_digest(bytes in any::<[u8; 32]>()) {
            let layout = ShardLayout::new("/data");
            let digest = Digest::from_hash(bytes);
            let path = layout.blob_path(&digest);
            prop_assert_eq!(layout.digest_for(&path), Some(digest));
            prop_assert_eq!(path, layout.blob_path(&digest));
        }
    }
}
