//! The Cleanup handler: when a
//! `Deployment` object disappears (its owning `Bundle` no longer
//! targets this cluster, or the cluster was de-targeted entirely), the
//! Helm release it installed must be uninstalled unless
//! `keepResources` says otherwise. A separate, lower-frequency sweep
//! catches releases whose `Deployment` object never got a finalizer
//! removal event delivered.

use std::collections::BTreeSet;

use fleet_helm::{HelmBackend, HelmError, ReleaseInfo};

/// What to do with a release whose owning [`fleet_api::crd::deployment::Deployment`]
/// object is gone.
#[derive(Debug, Eq, PartialEq)]
pub enum Decision {
    /// `keepResources` was set: leave the release installed, just
    /// forget about it.
    Keep,
    /// Uninstall the named release.
    Uninstall { release_name: String, namespace: String },
}

/// Decide what Cleanup should do for a single vanished `Deployment`.
pub fn decide(release_name: String, namespace: String, keep_resources: bool) -> Decision {
    if keep_resources {
        Decision::Keep
    } else {
        Decision::Uninstall { release_name, namespace }
    }
}

/// Uninstall `decision`'s release through `backend`, classifying the
/// result the way every other handler does.
pub async fn run(backend: &dyn HelmBackend, decision: Decision) -> Result<(), HelmError> {
    match decision {
        Decision::Keep => Ok(()),
        Decision::Uninstall { release_name, namespace } => backend.uninstall(&release_name, &namespace, false).await,
    }
}

/// Find releases `backend` knows about in `namespace` that are not
/// named in `known_deployment_releases` (the set of release names every
/// live `Deployment` object in this namespace currently claims) — the
/// periodic stray-release sweep.
pub fn find_stray_releases(known_releases: &[ReleaseInfo], known_deployment_releases: &BTreeSet<String>) -> Vec<String> {
    let mut names: Vec<String> = known_releases
        .iter()
        .map(|release| release.name.clone())
        .filter(|name| !known_deployment_releases.contains(name))
        .collect();
    names.sort_unstable();
    names.dedup();
    names
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keep_resources_skips_uninstall() {
        assert_eq!(decide("r".to_owned(), "ns".to_owned(), true), Decision::Keep);
    }

    #[test]
    fn default_uninstalls() {
        let decision = decide("r".to_owned(), "ns".to_owned(), false);
        assert_eq!(decision, Decision::Uninstall { release_name: "r".to_owned(), namespace: "ns".to_owned() });
    }

    #[test]
    fn stray_release_not_claimed_by_any_deployment_is_flagged() {
        let releases = vec![
            ReleaseInfo { name: "known".to_owned(), revision: 1, namespace: "ns".to_owned() },
            ReleaseInfo { name: "stray".to_owned(), revision: 1, namespace: "ns".to_owned() },
        ];
        let known_deployment_releases = BTreeSet::from(["known".to_owned()]);
        let stray = find_stray_releases(&releases, &known_deployment_releases);
        assert_eq!(stray, vec!["stray".to_owned()]);
    }

    #[test]
    fn no_strays_when_every_release_is_claimed() {
        let releases = vec![ReleaseInfo { name: "known".to_owned(), revision: 1, namespace: "ns".to_owned() }];
        let known_deployment_releases = BTreeSet::from(["known".to_owned()]);
        assert!(find_stray_releases(&releases, &known_deployment_releases).is_empty());
    }
}
