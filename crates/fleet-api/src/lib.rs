//! Custom resource definitions for Fleet's management-plane object model,
//! plus the `fleet.yaml` bundle manifest format parsed by the ingester.
//!
//! Every type here is pure data: no reconciliation logic lives in this
//! crate. `fleet-core` builds the targeting/merge/hashing logic on top of
//! these types; `fleet-manager` and `fleet-agent` own the state machines.

pub mod crd;
pub mod fleet_yaml;

pub use crd::{
    bundle::{Bundle, BundleSpec, BundleStatus, BundleTarget, PerClusterState},
    cluster::{Cluster, ClusterSpec, ClusterStatus},
    cluster_group::{ClusterGroup, ClusterGroupSpec},
    content::{Content, ContentSpec},
    deployment::{Deployment, DeploymentSpec, DeploymentStatus, NON_READY_STATUS_LIMIT, ScheduleSpec},
    registration::{Registration, RegistrationSpec, RegistrationStatus},
    source::{GitSourceSpec, HelmSourceSpec, Source, SourceSpec, SourceStatus},
};

/// Common label Fleet stamps on every object it owns, so downstream
/// lookups can avoid back-pointers and instead index by label, e.g.
/// `list(Deployment, labels: {"fleet.io/bundle-name": ..})`.
pub mod labels {
    pub const BUNDLE_NAME: &str = "fleet.io/bundle-name";
    pub const BUNDLE_NAMESPACE: &str = "fleet.io/bundle-namespace";
    pub const SOURCE_NAME: &str = "fleet.io/source-name";
    pub const CLUSTER_NAME: &str = "fleet.io/cluster-name";
    pub const MANAGED_BY: &str = "app.kubernetes.io/managed-by";
    pub const MANAGED_BY_VALUE: &str = "fleet";
}

/// Finalizers applied to objects with children that must be cleaned up
/// before the owner can be deleted.
pub mod finalizers {
    pub const SOURCE_CLEANUP: &str = "fleet.io/source-cleanup";
    pub const BUNDLE_CLEANUP: &str = "fleet.io/bundle-cleanup";
    /// Held by the owning agent so a `Deployment`'s Helm release is
    /// uninstalled before the object itself is allowed to disappear.
    pub const DEPLOYMENT_CLEANUP: &str = "fleet.io/deployment-cleanup";
}
