//! Immutable, content-addressed manifest blob store.
//!
//! Blobs are keyed by the lowercase-hex SHA-256 digest of their
//! *uncompressed* contents. Writes are idempotent (re-uploading
//! identical content is a no-op, since the key is the content); reads
//! are by key; deletes are the caller's responsibility to gate on the
//! two-pass orphan mark — this crate only exposes the
//! primitive operations, not the GC policy, which lives in
//! `fleet-manager::gc` per the component→crate mapping.

pub mod hash;
pub mod store;

pub use hash::{compress, decompress, content_hash};
pub use store::{ContentStore, Error, K8sConfigMapStore};

/// Oversized trees are rejected at ingest time with a terminal
/// [`Error::TooLarge`], not truncated or
/// silently accepted.
pub const MAX_UNCOMPRESSED_CONTENT_BYTES: usize = 10 * 1024 * 1024;
