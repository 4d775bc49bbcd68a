//! The targeting engine: matches a bundle against the
//! cluster population and produces one per-cluster deployment plan per
//! admitted, matched cluster.

use fleet_api::{
    crd::{bundle::BundleSpec, deployment::DeploymentSpec, selector::ClusterSelector},
    fleet_yaml::BundleOptions,
};
use fleet_core::selector::{ClusterContext, first_matching_target, is_admitted};
use snafu::{ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to merge target options for cluster {cluster}"))]
    Merge {
        source: fleet_core::merge::Error,
        cluster: String,
    },

    #[snafu(display("failed to compute deployment-id for cluster {cluster}"))]
    DeploymentId {
        source: fleet_core::deployment_id::Error,
        cluster: String,
    },
}

/// The desired `Deployment` spec for one (bundle, cluster) pair, plus
/// which namespace it belongs in.
#[derive(Clone, Debug, PartialEq)]
pub struct DeploymentPlan {
    pub cluster_name: String,
    pub cluster_namespace: String,
    pub spec: DeploymentSpec,
}

/// Compute every `DeploymentPlan` a bundle produces against the current
/// cluster population. Callers (the `Bundle` reconciler)
/// diff this list against the live `Deployment` objects in each
/// cluster's namespace: anything here gets upserted, anything live but
/// absent here gets deleted (a "non-matching former deployment").
pub fn compute_deployments<'c>(
    bundle_name: &str,
    bundle_namespace: &str,
    bundle: &BundleSpec,
    clusters: impl IntoIterator<Item = (&'c ClusterContext<'c>, &'c str)>,
) -> Result<Vec<DeploymentPlan>, Error> {
    let mut plans = Vec::new();

    for (cluster, cluster_namespace) in clusters {
        if !is_admitted(&bundle.target_restrictions, cluster) {
            continue;
        }
        let Some(target) = first_matching_target(&bundle.targets, |t| &t.selector, cluster) else {
            continue;
        };

        let merged_options = merge_target(&bundle.options, target).context(MergeSnafu {
            cluster: cluster.name.to_owned(),
        })?;

        let deployment_id = fleet_core::deployment_id(&bundle.content_keys, &merged_options).context(
            DeploymentIdSnafu {
                cluster: cluster.name.to_owned(),
            },
        )?;

        let spec = DeploymentSpec {
            bundle_name: bundle_name.to_owned(),
            bundle_namespace: bundle_namespace.to_owned(),
            content_keys: bundle.content_keys.clone(),
            options: merged_options,
            deployment_id,
            paused: bundle.paused,
            depends_on: bundle.depends_on.clone(),
        };

        plans.push(DeploymentPlan {
            cluster_name: cluster.name.to_owned(),
            cluster_namespace: cluster_namespace.to_owned(),
            spec,
        });
    }

    Ok(plans)
}

fn merge_target(
    base: &BundleOptions,
    target: &fleet_api::crd::bundle::BundleTarget,
) -> Result<BundleOptions, fleet_core::merge::Error> {
    fleet_core::merge_options(base, &target.custom)
}

/// Is `selector` an admission match for `cluster`? Exposed directly for
/// the restriction-whitelist property test without
/// needing a full bundle.
pub fn selector_admits(selectors: &[ClusterSelector], cluster: &ClusterContext<'_>) -> bool {
    is_admitted(selectors, cluster)
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use fleet_api::crd::bundle::BundleTarget;

    use super::*;

    fn cluster<'a>(name: &'a str, labels: &'a BTreeMap<String, String>, groups: &'a [(String, BTreeMap<String, String>)]) -> ClusterContext<'a> {
        ClusterContext { name, labels, groups }
    }

    fn prod_labels() -> BTreeMap<String, String> {
        [("env".to_owned(), "prod".to_owned())].into_iter().collect()
    }

    #[test]
    fn fan_out_to_1000_clusters_shares_one_deployment_id() {
        let bundle = BundleSpec {
            content_keys: vec!["abc".to_owned()],
            options: BundleOptions::default(),
            targets: vec![BundleTarget {
                name: None,
                selector: ClusterSelector {
                    cluster_selector: Some(k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector {
                        match_labels: Some(prod_labels()),
                        ..Default::default()
                    }),
                    ..Default::default()
                },
                custom: serde_json::Map::new(),
            }],
            target_restrictions: vec![],
            depends_on: vec![],
            paused: false,
        };

        let labels = prod_labels();
        let groups: Vec<(String, BTreeMap<String, String>)> = vec![];
        let clusters: Vec<(String, ClusterContext<'_>)> = (0..1000)
            .map(|i| {
                let name = format!("cluster-{i}");
                (name.clone(), cluster(Box::leak(name.into_boxed_str()), &labels, &groups))
            })
            .collect();

        let input: Vec<(&ClusterContext<'_>, &str)> = clusters.iter().map(|(name, ctx)| (ctx, name.as_str())).collect();
        let plans = compute_deployments("bundle", "fleet-default", &bundle, input).expect("compute");

        assert_eq!(plans.len(), 1000);
        let ids: std::collections::HashSet<_> = plans.iter().map(|p| p.spec.deployment_id.clone()).collect();
        assert_eq!(ids.len(), 1, "every matched cluster must share one deployment-id");
    }

    #[test]
    fn restriction_whitelist_admits_only_matching_clusters() {
        let labels = prod_labels();
        let groups: Vec<(String, BTreeMap<String, String>)> = vec![];
        let admitted = cluster("allowed", &labels, &groups);
        let restriction = ClusterSelector {
            cluster_name: Some("allowed".to_owned()),
            ..Default::default()
        };
        assert!(selector_admits(std::slice::from_ref(&restriction), &admitted));

        let denied = cluster("denied", &labels, &groups);
        assert!(!selector_admits(std::slice::from_ref(&restriction), &denied));
    }

    #[test]
    fn non_matching_cluster_produces_no_plan() {
        let bundle = BundleSpec {
            content_keys: vec!["abc".to_owned()],
            options: BundleOptions::default(),
            targets: vec![BundleTarget {
                name: None,
                selector: ClusterSelector {
                    cluster_name: Some("only-this-one".to_owned()),
                    ..Default::default()
                },
                custom: serde_json::Map::new(),
            }],
            target_restrictions: vec![],
            depends_on: vec![],
            paused: false,
        };
        let labels = BTreeMap::new();
        let groups: Vec<(String, BTreeMap<String, String>)> = vec![];
        let other = cluster("someone-else", &labels, &groups);
        let plans = compute_deployments("bundle", "ns", &bundle, [(&other, "ns-someone-else")]).expect("compute");
        assert!(plans.is_empty());
    }
}
