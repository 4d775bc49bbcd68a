//! The pluggable [`ContentStore`] trait and its one production
//! implementation, [`K8sConfigMapStore`] (named for upstream Fleet's
//! original ConfigMap-chunked backing; this port stores each blob in one
//! `Content` custom resource's binary field instead, treating Content as
//! a first-class custom-resource kind rather than an external
//! object-storage bucket (the name is kept for continuity with the
//! ported system's terminology).

use async_trait::async_trait;
use fleet_api::crd::content::{Content, ContentSpec};
use k8s_openapi::{ByteString, apimachinery::pkg::apis::meta::v1::ObjectMeta};
use kube::{Api, api::PostParams};
use snafu::{OptionExt, ResultExt, Snafu};

use crate::{MAX_UNCOMPRESSED_CONTENT_BYTES, hash};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("uncompressed content is {size} bytes, exceeding the {limit} byte cap"))]
    TooLarge { size: usize, limit: usize },

    #[snafu(display("failed to compress content"))]
    Compress { source: hash::Error },

    #[snafu(display("failed to decompress content {key}"))]
    Decompress { source: hash::Error, key: String },

    #[snafu(display("failed to write Content object {key}"))]
    Write {
        source: kube::Error,
        key: String,
    },

    #[snafu(display("failed to read Content object {key}"))]
    Read { source: kube::Error, key: String },

    #[snafu(display("failed to delete Content object {key}"))]
    Delete { source: kube::Error, key: String },

    #[snafu(display("failed to list Content objects"))]
    List { source: kube::Error },

    #[snafu(display("Content object {key} has no content payload"))]
    MissingPayload { key: String },
}

/// The store's public interface. Generic over the backing mechanism so
/// tests can swap in an in-memory fake without a live API server.
#[async_trait]
pub trait ContentStore: Send + Sync {
    /// Idempotently write `uncompressed` content, returning its key.
    /// Re-uploading identical bytes is a no-op.
    async fn write(&self, uncompressed: &[u8]) -> Result<String, Error>;

    /// Read and decompress the blob at `key`.
    async fn read(&self, key: &str) -> Result<Vec<u8>, Error>;

    /// List every content key currently stored, for the content GC's
    /// mark pass.
    async fn list_keys(&self) -> Result<Vec<String>, Error>;

    /// Delete the blob at `key`. Safe to call only after the caller has
    /// established, via its own two-pass mark, that nothing references
    /// it.
    async fn delete(&self, key: &str) -> Result<(), Error>;
}

/// The `Content`-CRD-backed implementation.
pub struct K8sConfigMapStore {
    api: Api<Content>,
}

impl K8sConfigMapStore {
    pub fn new(api: Api<Content>) -> Self {
        Self { api }
    }
}

#[async_trait]
impl ContentStore for K8sConfigMapStore {
    async fn write(&self, uncompressed: &[u8]) -> Result<String, Error> {
        if uncompressed.len() > MAX_UNCOMPRESSED_CONTENT_BYTES {
            return TooLargeSnafu {
                size: uncompressed.len(),
                limit: MAX_UNCOMPRESSED_CONTENT_BYTES,
            }
            .fail();
        }

        let key = hash::content_hash(uncompressed);
        if self.api.get_opt(&key).await.context(ReadSnafu { key: key.clone() })?.is_some() {
            // Idempotent: identical content already stored under this key.
            return Ok(key);
        }

        let compressed = hash::compress(uncompressed).context(CompressSnafu)?;
        let content = Content {
            metadata: ObjectMeta {
                name: Some(key.clone()),
                ..Default::default()
            },
            spec: ContentSpec {
                content_hash: key.clone(),
                content: ByteString(compressed),
                uncompressed_size: uncompressed.len() as i64,
            },
        };

        match self.api.create(&PostParams::default(), &content).await {
            Ok(_) => Ok(key),
            // A racing writer beat us to an identical key; idempotent by definition.
            Err(kube::Error::Api(response)) if response.code == 409 => Ok(key),
            Err(source) => Err(Error::Write { source, key }),
        }
    }

    async fn read(&self, key: &str) -> Result<Vec<u8>, Error> {
        let content = self.api.get(key).await.context(ReadSnafu { key: key.to_owned() })?;
        let compressed = &content.spec.content.0;
        hash::decompress(compressed).context(DecompressSnafu { key: key.to_owned() })
    }

    async fn list_keys(&self) -> Result<Vec<String>, Error> {
        let list = self
            .api
            .list(&Default::default())
            .await
            .context(ListSnafu)?;
        Ok(list
            .items
            .into_iter()
            .filter_map(|c| c.metadata.name)
            .collect())
    }

    async fn delete(&self, key: &str) -> Result<(), Error> {
        self.api
            .delete(key, &Default::default())
            .await
            .context(DeleteSnafu { key: key.to_owned() })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::HashMap, sync::Mutex};

    use super::*;

    /// An in-memory fake standing in for a live API server.
    #[derive(Default)]
    pub struct InMemoryStore {
        blobs: Mutex<HashMap<String, Vec<u8>>>,
    }

    #[async_trait]
    impl ContentStore for InMemoryStore {
        async fn write(&self, uncompressed: &[u8]) -> Result<String, Error> {
            if uncompressed.len() > MAX_UNCOMPRESSED_CONTENT_BYTES {
                return TooLargeSnafu {
                    size: uncompressed.len(),
                    limit: MAX_UNCOMPRESSED_CONTENT_BYTES,
                }
                .fail();
            }
            let key = hash::content_hash(uncompressed);
            #[expect(clippy::unwrap_used, reason = "poisoned only on a prior panic")]
            let mut blobs = self.blobs.lock().unwrap();
            blobs.entry(key.clone()).or_insert_with(|| uncompressed.to_vec());
            Ok(key)
        }

        async fn read(&self, key: &str) -> Result<Vec<u8>, Error> {
            #[expect(clippy::unwrap_used, reason = "poisoned only on a prior panic")]
            let blobs = self.blobs.lock().unwrap();
            blobs
                .get(key)
                .cloned()
                .context(MissingPayloadSnafu { key: key.to_owned() })
        }

        async fn list_keys(&self) -> Result<Vec<String>, Error> {
            #[expect(clippy::unwrap_used, reason = "poisoned only on a prior panic")]
            let blobs = self.blobs.lock().unwrap();
            Ok(blobs.keys().cloned().collect())
        }

        async fn delete(&self, key: &str) -> Result<(), Error> {
            #[expect(clippy::unwrap_used, reason = "poisoned only on a prior panic")]
            let mut blobs = self.blobs.lock().unwrap();
            blobs.remove(key);
            Ok(())
        }
    }

    #[tokio::test]
    async fn write_is_idempotent_and_content_addressed() {
        let store = InMemoryStore::default();
        let key1 = store.write(b"same content").await.expect("write 1");
        let key2 = store.write(b"same content").await.expect("write 2");
        assert_eq!(key1, key2);
        assert_eq!(store.list_keys().await.expect("list").len(), 1);
    }

    #[tokio::test]
    async fn oversized_content_is_rejected() {
        let store = InMemoryStore::default();
        let oversized = vec![0u8; MAX_UNCOMPRESSED_CONTENT_BYTES + 1];
        let result = store.write(&oversized).await;
        assert!(matches!(result, Err(Error::TooLarge { .. })));
    }

    #[tokio::test]
    async fn read_returns_written_bytes() {
        let store = InMemoryStore::default();
        let key = store.write(b"manifest bytes").await.expect("write");
        let read = store.read(&key).await.expect("read");
        assert_eq!(read, b"manifest bytes");
    }

    #[tokio::test]
    async fn delete_removes_the_blob() {
        let store = InMemoryStore::default();
        let key = store.write(b"to delete").await.expect("write");
        store.delete(&key).await.expect("delete");
        assert!(store.read(&key).await.is_err());
    }
}
