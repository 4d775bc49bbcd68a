//! Cross-cutting pure logic shared by `fleet-manager` and `fleet-agent`:
//! option deep-merge, deployment-ID hashing, cluster/target selector
//! matching, a generic per-kind work queue with exponential back-off,
//! a shared error-kind taxonomy, and the agent RBAC builder used by
//! the registration service.

pub mod condition;
pub mod deployment_id;
pub mod error;
pub mod kubeconfig;
pub mod merge;
pub mod ratelimit;
pub mod rbac;
pub mod selector;
pub mod workqueue;

pub use condition::set_condition;
pub use deployment_id::deployment_id;
pub use error::ErrorKind;
pub use merge::merge_options;
