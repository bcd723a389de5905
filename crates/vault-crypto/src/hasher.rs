use std::io::{self, Read};

use sha2::{Digest as _, Sha256};
use vault_types::Digest;

/// Read buffer used when hashing from a reader.
const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Incremental SHA-256 hasher that also counts the bytes it has seen.
///
/// Feeding the same bytes in any chunking produces the same [`Digest`], so a
/// stream can be hashed while it is being written elsewhere.
#[derive(Clone, Default)]
pub struct ContentHasher {
    inner: Sha256,
    bytes: u64,
}

impl ContentHasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed the next chunk of content.
    pub fn update(&mut self, chunk: &[u8]) {
        self.inner.update(chunk);
        self.bytes += chunk.len() as u64;
    }

    /// Number of bytes fed so far.
    pub fn bytes_hashed(&self) -> u64 {
        self.bytes
    }

    /// Consume the hasher, returning the digest and total byte count.
    pub fn finalize(self) -> (Digest, u64) {
        (to_digest(&self.inner.finalize()), self.bytes)
    }

    /// One-shot digest of an in-memory buffer.
    pub fn digest(data: &[u8]) -> Digest {
        to_digest(&Sha256::digest(data))
    }

    /// Verify that data produces the expected digest.
    pub fn verify(data: &[u8], expected: &Digest) -> bool {
        Self::digest(data) == *expected
    }
}

fn to_digest(hash: &[u8]) -> Digest {
    let mut out = [0u8; 32];
    out.copy_from_slice(hash);
    Digest::from_hash(out)
}

/// Hash everything `reader` yields, returning the digest and byte count.
pub fn hash_reader<R: Read>(mut reader: R) -> io::Result<(Digest, u64)> {
    let mut hasher = ContentHasher::new();
    let mut buf = vec![0u8; READ_BUFFER_SIZE];
    loop {
        let n = match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finalize())
}
