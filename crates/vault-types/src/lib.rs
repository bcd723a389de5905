//! Foundation types for Vault.
//!
//! Vault is a content-addressed, deduplicating blob store. Every physical
//! blob is identified solely by the SHA-256 digest of its bytes, and the blob
//! ledger tracks how many logical files reference each digest.
//!
//! # Key Types
//!
//! - [`Digest`]: SHA-256 content identifier, hex-encoded on the wire
//! - [`MediaType`]: caller-declared `type/subtype` hint (never trusted)
//! - [`BlobRecord`]: one ledger row: size, media type, path, reference count
//! - [`NewBlob`]: the fields needed to record a freshly committed blob
//! - [`RefDelta`]: a single reference acquisition or release
//! - [`OwnerScope`]: opaque owner key used for usage queries

pub mod blob;
pub mod digest;
pub mod error;
pub mod media;

pub use blob::{BlobRecord, BlobState, NewBlob, OwnerScope, RefDelta};
pub use digest::Digest;
pub use error::TypeError;
pub use media::MediaType;
