//! Content hashing for Vault.
//!
//! Blobs are identified by the SHA-256 of their exact bytes, with no framing
//! or domain tag, so a digest can be reproduced with any standard tool
//! (`sha256sum`). All hashing wraps the `sha2` crate.

pub mod hasher;

pub use hasher::{hash_reader, ContentHasher};
