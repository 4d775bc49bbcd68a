//! Git source ingestion: `ls-remote` polling, credentialed
//! shallow clone, and bundle-root tree walking. `fleet-manager::ingest`
//! drives this crate end to end and turns its output into `Bundle`
//! objects; nothing here talks to the object store directly.

pub mod clone;
pub mod credentials;
pub mod github_app;
pub mod ls_remote;
pub mod walk;

pub use clone::{CloneRequest, clone_at_revision};
pub use credentials::CredentialSource;
pub use ls_remote::resolve_commit;
pub use walk::{BundleRoot, discover_bundle_roots};
