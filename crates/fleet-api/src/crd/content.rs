use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// An immutable, content-addressed blob holding a compressed manifest
/// stream. The object's name *is* the content key (a hex
/// SHA-256 digest), enforced by `fleet-content` at write time, not by the
/// API server.
#[derive(Clone, CustomResource, Debug, Deserialize, JsonSchema, PartialEq, Serialize)]
#[kube(
    group = "fleet.io",
    version = "v1alpha1",
    kind = "Content",
    namespaced,
    shortname = "cnt"
)]
#[serde(rename_all = "camelCase")]
pub struct ContentSpec {
    /// Hex-encoded SHA-256 of the uncompressed manifest stream. Always
    /// equal to `metadata.name`; kept as an explicit field so callers
    /// don't have to reconstruct it from the object's identity.
    pub content_hash: String,

    /// Gzip-compressed manifest stream, base64-encoded on the wire by
    /// `k8s_openapi::ByteString`.
    pub content: k8s_openapi::ByteString,

    /// Uncompressed size in bytes, checked against the resource-quota
    /// cap before the blob is ever written.
    pub uncompressed_size: i64,
}
