//! Helm chart version resolution and the
//! [`HelmBackend`] trait the deployer drives. The actual
//! chart-rendering engine is out of scope; this crate's
//! production backend shells out to the `helm` CLI.

pub mod backend;
pub mod chart;
pub mod error;

pub use backend::{CliHelmBackend, HelmBackend, InstallRequest, ModifiedObject, ObjectRef, Plan, ReleaseInfo};
pub use error::HelmError;
