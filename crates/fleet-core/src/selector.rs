//! Cluster/target selector matching.
//!
//! A [`fleet_api::crd::selector::ClusterSelector`] matches a cluster if
//! *any* of its populated fields match: an exact `clusterName`, a
//! `clusterSelector` label match against the cluster's own labels, an
//! exact `clusterGroup` membership, or a `clusterGroupSelector` label
//! match against any group the cluster belongs to. An entry with every
//! field empty matches nothing (`ClusterSelector::is_empty`).

use std::collections::BTreeMap;

use fleet_api::crd::selector::ClusterSelector;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::LabelSelector;

/// Everything the matcher needs to know about one cluster: its own
/// identity/labels plus the names and labels of every `ClusterGroup` it
/// belongs to. Callers build this once per targeting pass from the
/// `Cluster`/`ClusterGroup` list rather than joining live, following the
/// "avoid back-pointers, index via labels" guidance applied throughout.
#[derive(Clone, Debug)]
pub struct ClusterContext<'a> {
    pub name: &'a str,
    pub labels: &'a BTreeMap<String, String>,
    /// `(group_name, group_labels)` for every group this cluster is a
    /// member of.
    pub groups: &'a [(String, BTreeMap<String, String>)],
}

/// Does `selector` match `cluster`?
pub fn selector_matches(selector: &ClusterSelector, cluster: &ClusterContext<'_>) -> bool {
    if let Some(name) = &selector.cluster_name
        && name == cluster.name
    {
        return true;
    }
    if let Some(label_selector) = &selector.cluster_selector
        && label_selector_matches(label_selector, cluster.labels)
    {
        return true;
    }
    if let Some(group_name) = &selector.cluster_group
        && cluster.groups.iter().any(|(name, _)| name == group_name)
    {
        return true;
    }
    if let Some(group_selector) = &selector.cluster_group_selector
        && cluster
            .groups
            .iter()
            .any(|(_, labels)| label_selector_matches(group_selector, labels))
    {
        return true;
    }
    false
}

/// Standard Kubernetes `matchLabels`/`matchExpressions` semantics
/// (conjunctive: every clause must hold).
pub fn label_selector_matches(selector: &LabelSelector, labels: &BTreeMap<String, String>) -> bool {
    if let Some(match_labels) = &selector.match_labels
        && !match_labels
            .iter()
            .all(|(key, value)| labels.get(key) == Some(value))
    {
        return false;
    }
    if let Some(expressions) = &selector.match_expressions {
        for expr in expressions {
            let matches = match expr.operator.as_str() {
                "In" => expr
                    .values
                    .as_ref()
                    .is_some_and(|values| labels.get(&expr.key).is_some_and(|v| values.contains(v))),
                "NotIn" => expr
                    .values
                    .as_ref()
                    .is_none_or(|values| !labels.get(&expr.key).is_some_and(|v| values.contains(v))),
                "Exists" => labels.contains_key(&expr.key),
                "DoesNotExist" => !labels.contains_key(&expr.key),
                _ => false,
            };
            if !matches {
                return false;
            }
        }
    }
    true
}

/// Is `cluster` admitted by a bundle's `targetRestrictions`? An empty restriction list admits everything.
pub fn is_admitted(restrictions: &[ClusterSelector], cluster: &ClusterContext<'_>) -> bool {
    restrictions.is_empty() || restrictions.iter().any(|r| selector_matches(r, cluster))
}

/// Find the first `targets[]` entry (in declaration order) that matches
/// `cluster`, "first matching target wins" rule.
pub fn first_matching_target<'t, T>(
    targets: &'t [T],
    selector_of: impl Fn(&'t T) -> &'t ClusterSelector,
    cluster: &ClusterContext<'_>,
) -> Option<&'t T> {
    targets
        .iter()
        .find(|t| selector_matches(selector_of(t), cluster))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn empty_selector_matches_nothing() {
        let selector = ClusterSelector::default();
        let groups = vec![];
        let cluster = ClusterContext {
            name: "prod-1",
            labels: &labels(&[("env", "prod")]),
            groups: &groups,
        };
        assert!(!selector_matches(&selector, &cluster));
    }

    #[test]
    fn cluster_name_matches_exactly() {
        let selector = ClusterSelector {
            cluster_name: Some("prod-1".to_owned()),
            ..Default::default()
        };
        let groups = vec![];
        let cluster = ClusterContext {
            name: "prod-1",
            labels: &BTreeMap::new(),
            groups: &groups,
        };
        assert!(selector_matches(&selector, &cluster));
    }

    #[test]
    fn empty_restriction_list_admits_everything() {
        let groups = vec![];
        let cluster = ClusterContext {
            name: "any",
            labels: &BTreeMap::new(),
            groups: &groups,
        };
        assert!(is_admitted(&[], &cluster));
    }

    #[test]
    fn restriction_list_is_a_whitelist() {
        let restriction = ClusterSelector {
            cluster_name: Some("allowed".to_owned()),
            ..Default::default()
        };
        let groups = vec![];
        let allowed = ClusterContext {
            name: "allowed",
            labels: &BTreeMap::new(),
            groups: &groups,
        };
        let denied = ClusterContext {
            name: "denied",
            labels: &BTreeMap::new(),
            groups: &groups,
        };
        assert!(is_admitted(std::slice::from_ref(&restriction), &allowed));
        assert!(!is_admitted(std::slice::from_ref(&restriction), &denied));
    }

    #[test]
    fn group_membership_matches() {
        let selector = ClusterSelector {
            cluster_group: Some("platform".to_owned()),
            ..Default::default()
        };
        let groups = vec![("platform".to_owned(), BTreeMap::new())];
        let cluster = ClusterContext {
            name: "c1",
            labels: &BTreeMap::new(),
            groups: &groups,
        };
        assert!(selector_matches(&selector, &cluster));
    }
}
