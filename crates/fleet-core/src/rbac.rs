//! Agent RBAC builder: the same service-account + role-binding shape
//! `commons::rbac::build_rbac_resources` uses upstream, adapted to grant
//! a `Role` scoped to the agent's own per-cluster namespace rather than
//! binding to a pre-existing cluster-wide `ClusterRole`, since each
//! cluster's agent is confined to one namespace it does not share with
//! any other cluster.

use k8s_openapi::{
    api::{
        core::v1::ServiceAccount,
        rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject},
    },
    apimachinery::pkg::apis::meta::v1::ObjectMeta,
};

/// Name of the service account, role, and role binding created for every
/// agent namespace. One fixed name suffices: each lives in its own
/// per-cluster namespace, so there is no cross-cluster collision.
pub const AGENT_SERVICE_ACCOUNT_NAME: &str = "fleet-agent";
pub const AGENT_ROLE_NAME: &str = "fleet-agent";
pub const AGENT_ROLE_BINDING_NAME: &str = "fleet-agent";

/// Build the `ServiceAccount` + `Role` + `RoleBinding` triple granted to
/// a newly registered agent: list/watch/get/update on
/// `Deployment`, read on `Content`.
pub fn build_agent_rbac(namespace: &str) -> (ServiceAccount, Role, RoleBinding) {
    let service_account = ServiceAccount {
        metadata: ObjectMeta {
            name: Some(AGENT_SERVICE_ACCOUNT_NAME.to_owned()),
            namespace: Some(namespace.to_owned()),
            ..Default::default()
        },
        ..Default::default()
    };

    let role = Role {
        metadata: ObjectMeta {
            name: Some(AGENT_ROLE_NAME.to_owned()),
            namespace: Some(namespace.to_owned()),
            ..Default::default()
        },
        rules: Some(vec![
            PolicyRule {
                api_groups: Some(vec!["fleet.io".to_owned()]),
                resources: Some(vec!["deployments".to_owned(), "deployments/status".to_owned()]),
                verbs: vec![
                    "list".to_owned(),
                    "watch".to_owned(),
                    "get".to_owned(),
                    "update".to_owned(),
                    "patch".to_owned(),
                ],
                ..Default::default()
            },
            PolicyRule {
                api_groups: Some(vec!["fleet.io".to_owned()]),
                resources: Some(vec!["contents".to_owned()]),
                verbs: vec!["list".to_owned(), "get".to_owned(), "watch".to_owned()],
                ..Default::default()
            },
        ]),
    };

    let role_binding = RoleBinding {
        metadata: ObjectMeta {
            name: Some(AGENT_ROLE_BINDING_NAME.to_owned()),
            namespace: Some(namespace.to_owned()),
            ..Default::default()
        },
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_owned(),
            kind: "Role".to_owned(),
            name: AGENT_ROLE_NAME.to_owned(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_owned(),
            name: AGENT_SERVICE_ACCOUNT_NAME.to_owned(),
            namespace: Some(namespace.to_owned()),
            ..Default::default()
        }]),
    };

    (service_account, role, role_binding)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rbac_is_scoped_to_the_agent_namespace() {
        let (sa, role, binding) = build_agent_rbac("c-abc123");
        assert_eq!(sa.metadata.namespace.as_deref(), Some("c-abc123"));
        assert_eq!(role.metadata.namespace.as_deref(), Some("c-abc123"));
        assert_eq!(binding.metadata.namespace.as_deref(), Some("c-abc123"));
        assert_eq!(binding.role_ref.name, AGENT_ROLE_NAME);
    }

    #[test]
    fn role_grants_deployment_and_content_access() {
        let (_, role, _) = build_agent_rbac("ns");
        let rules = role.rules.expect("rules present");
        assert!(rules.iter().any(|r| r
            .resources
            .as_ref()
            .is_some_and(|res| res.contains(&"deployments".to_owned()))));
        assert!(rules.iter().any(|r| r
            .resources
            .as_ref()
            .is_some_and(|res| res.contains(&"contents".to_owned()))));
    }
}
