//! Bundle-root tree walking.
//!
//! A subdirectory is a bundle root iff it contains a `fleet.yaml`. The
//! source root is *additionally* a bundle root iff it contains YAML
//! resources and no descendant has a `fleet.yaml`. Per the Open
//! Question's instructed resolution: if a descendant has `fleet.yaml`
//! *and* the root also has loose YAML resource files, that is rejected
//! as [`Error::AmbiguousBundleRoot`] rather than silently dropping the
//! root files.

use std::path::{Path, PathBuf};

use snafu::{ResultExt, Snafu};
use walkdir::WalkDir;

pub const FLEET_YAML_FILENAME: &str = "fleet.yaml";

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to walk {root}"))]
    Walk {
        source: walkdir::Error,
        root: PathBuf,
    },

    #[snafu(display(
        "{root} has both loose YAML resources and a descendant fleet.yaml at {descendant}; \
         this is ambiguous and must be resolved by moving the root files into an explicit bundle"
    ))]
    AmbiguousBundleRoot { root: PathBuf, descendant: PathBuf },
}

/// One bundle root discovered by [`discover_bundle_roots`]: a directory
/// path relative to the walked root, and whether it carries an explicit
/// `fleet.yaml` (`false` only for the promoted source-root case).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BundleRoot {
    pub path: PathBuf,
    pub has_fleet_yaml: bool,
}

/// Walk `root` and return the deterministic, sorted list of bundle
/// roots.
#[tracing::instrument(skip(root), fields(root = %root.display()))]
pub fn discover_bundle_roots(root: &Path, restrict_to_paths: &[String]) -> Result<Vec<BundleRoot>, Error> {
    let search_roots: Vec<PathBuf> = if restrict_to_paths.is_empty() {
        vec![root.to_path_buf()]
    } else {
        restrict_to_paths.iter().map(|p| root.join(p)).collect()
    };

    let mut roots = Vec::new();
    for search_root in &search_roots {
        roots.extend(discover_under(root, search_root)?);
    }
    roots.sort_by(|a, b| a.path.cmp(&b.path));
    roots.dedup();
    Ok(roots)
}

fn discover_under(walk_root: &Path, search_root: &Path) -> Result<Vec<BundleRoot>, Error> {
    let mut roots = Vec::new();
    let mut descendant_fleet_yamls = Vec::new();

    for entry in WalkDir::new(search_root).min_depth(1) {
        let entry = entry.context(WalkSnafu {
            root: search_root.to_path_buf(),
        })?;
        if entry.file_type().is_file() && entry.file_name() == FLEET_YAML_FILENAME {
            let dir = entry.path().parent().unwrap_or(search_root).to_path_buf();
            roots.push(BundleRoot {
                path: relative(walk_root, &dir),
                has_fleet_yaml: true,
            });
            if dir != search_root {
                descendant_fleet_yamls.push(entry.path().to_path_buf());
            }
        }
    }

    let root_has_fleet_yaml = search_root.join(FLEET_YAML_FILENAME).is_file();
    if !root_has_fleet_yaml {
        let root_has_loose_yaml = has_loose_yaml_resources(search_root)?;
        if let Some(descendant) = descendant_fleet_yamls.first() {
            if root_has_loose_yaml {
                return AmbiguousBundleRootSnafu {
                    root: search_root.to_path_buf(),
                    descendant: descendant.clone(),
                }
                .fail();
            }
            // A descendant owns fleet.yaml and the root has no loose
            // resources of its own: the root is not promoted.
        } else if root_has_loose_yaml {
            roots.push(BundleRoot {
                path: relative(walk_root, search_root),
                has_fleet_yaml: false,
            });
        }
    }

    Ok(roots)
}

fn has_loose_yaml_resources(dir: &Path) -> Result<bool, Error> {
    for entry in std::fs::read_dir(dir).into_iter().flatten().flatten() {
        let path = entry.path();
        if path.is_file()
            && path
                .extension()
                .is_some_and(|ext| ext == "yaml" || ext == "yml")
        {
            return Ok(true);
        }
    }
    Ok(false)
}

fn relative(base: &Path, target: &Path) -> PathBuf {
    target.strip_prefix(base).unwrap_or(target).to_path_buf()
}

#[cfg(test)]
mod tests {
    use std::fs;

    use tempfile::tempdir;

    use super::*;

    #[test]
    fn fifty_fleet_yaml_subdirs_become_fifty_roots() {
        let dir = tempdir().expect("tempdir");
        for i in 0..50 {
            let sub = dir.path().join(format!("app-{i}"));
            fs::create_dir(&sub).expect("mkdir");
            fs::write(sub.join("fleet.yaml"), "defaultNamespace: default\n").expect("write");
        }
        let roots = discover_bundle_roots(dir.path(), &[]).expect("walk");
        assert_eq!(roots.len(), 50);
        assert!(roots.iter().all(|r| r.has_fleet_yaml));
    }

    #[test]
    fn root_promoted_when_it_has_loose_yaml_and_no_descendant_fleet_yaml() {
        let dir = tempdir().expect("tempdir");
        fs::write(dir.path().join("deployment.yaml"), "kind: Deployment\n").expect("write");
        let roots = discover_bundle_roots(dir.path(), &[]).expect("walk");
        assert_eq!(roots.len(), 1);
        assert!(!roots[0].has_fleet_yaml);
        assert_eq!(roots[0].path, PathBuf::from(""));
    }

    #[test]
    fn root_not_promoted_when_descendant_has_fleet_yaml_and_root_is_clean() {
        let dir = tempdir().expect("tempdir");
        let sub = dir.path().join("app");
        fs::create_dir(&sub).expect("mkdir");
        fs::write(sub.join("fleet.yaml"), "defaultNamespace: default\n").expect("write");
        let roots = discover_bundle_roots(dir.path(), &[]).expect("walk");
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].path, PathBuf::from("app"));
    }

    #[test]
    fn ambiguous_root_is_rejected() {
        let dir = tempdir().expect("tempdir");
        fs::write(dir.path().join("deployment.yaml"), "kind: Deployment\n").expect("write");
        let sub = dir.path().join("app");
        fs::create_dir(&sub).expect("mkdir");
        fs::write(sub.join("fleet.yaml"), "defaultNamespace: default\n").expect("write");

        let result = discover_bundle_roots(dir.path(), &[]);
        assert!(matches!(result, Err(Error::AmbiguousBundleRoot { .. })));
    }

    #[test]
    fn unchanged_walk_is_deterministic() {
        let dir = tempdir().expect("tempdir");
        for name in ["b", "a", "c"] {
            let sub = dir.path().join(name);
            fs::create_dir(&sub).expect("mkdir");
            fs::write(sub.join("fleet.yaml"), "").expect("write");
        }
        let first = discover_bundle_roots(dir.path(), &[]).expect("walk 1");
        let second = discover_bundle_roots(dir.path(), &[]).expect("walk 2");
        assert_eq!(first, second);
        assert_eq!(
            first.iter().map(|r| r.path.clone()).collect::<Vec<_>>(),
            vec![PathBuf::from("a"), PathBuf::from("b"), PathBuf::from("c")]
        );
    }
}
