//! One module per custom resource kind, mirroring the upstream
//! `commons/` split of one file per concern.

pub mod bundle;
pub mod cluster;
pub mod cluster_group;
pub mod content;
pub mod deployment;
pub mod registration;
pub mod selector;
pub mod source;

use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to serialize CRD {kind} to YAML"))]
    Serialize {
        source: serde_yaml::Error,
        kind: &'static str,
    },
}

/// Mirrors `stackable_shared::crd::CustomResourceExt`: a thin helper
/// for dumping a generated `CustomResourceDefinition` as YAML, used by
/// each binary's `crd` subcommand.
pub trait CustomResourceExt: kube::CustomResourceExt {
    fn yaml_schema() -> Result<String, Error> {
        serde_yaml::to_string(&Self::crd()).context(SerializeSnafu { kind: Self::kind(&()) })
    }
}

impl<T> CustomResourceExt for T where T: kube::CustomResourceExt {}
