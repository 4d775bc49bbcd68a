//! Content hashing and gzip framing. Kept separate from [`crate::store`]
//! so `fleet-core::deployment_id` and the ingester can hash a manifest
//! tree before deciding whether a write is even necessary (write is
//! idempotent on the content store anyway, but hashing up front lets the
//! ingester skip re-walking the tree into a compressed buffer when
//! `status.commit` already matches).

use std::io::{Read, Write};

use flate2::{Compression, read::GzDecoder, write::GzEncoder};
use sha2::{Digest, Sha256};
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to gzip-compress manifest content"))]
    Compress { source: std::io::Error },

    #[snafu(display("failed to gzip-decompress manifest content"))]
    Decompress { source: std::io::Error },
}

/// The content key: lowercase-hex SHA-256 of `uncompressed`.
pub fn content_hash(uncompressed: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(uncompressed);
    hex::encode(hasher.finalize())
}

pub fn compress(uncompressed: &[u8]) -> Result<Vec<u8>, Error> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(uncompressed).context(CompressSnafu)?;
    encoder.finish().context(CompressSnafu)
}

pub fn decompress(compressed: &[u8]) -> Result<Vec<u8>, Error> {
    let mut decoder = GzDecoder::new(compressed);
    let mut out = Vec::new();
    decoder.read_to_end(&mut out).context(DecompressSnafu)?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_and_content_derived() {
        let a = content_hash(b"hello");
        let b = content_hash(b"hello");
        let c = content_hash(b"world");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn compress_roundtrips() {
        let original = b"apiVersion: v1\nkind: ConfigMap\n".repeat(50);
        let compressed = compress(&original).expect("compress");
        assert!(compressed.len() < original.len());
        let decompressed = decompress(&compressed).expect("decompress");
        assert_eq!(decompressed, original);
    }
}
