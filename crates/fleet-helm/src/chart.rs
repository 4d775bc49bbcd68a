//! Chart version resolution: exact
//! version, a semver range, or the literal `"latest"`, resolved against
//! either a classic `index.yaml` (HTTPS) or an OCI registry's tag
//! listing.

use semver::{Version, VersionReq};
use serde::Deserialize;
use snafu::{OptionExt, ResultExt, Snafu};

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to fetch chart index from {url}"))]
    FetchIndex { source: reqwest::Error, url: String },

    #[snafu(display("failed to parse chart index from {url}"))]
    ParseIndex { source: serde_yaml::Error, url: String },

    #[snafu(display("chart {chart} not found in index {url}"))]
    ChartNotFound { chart: String, url: String },

    #[snafu(display("no version of chart {chart} satisfies {requirement}"))]
    NoMatchingVersion { chart: String, requirement: String },

    #[snafu(display("failed to list OCI tags for {reference}"))]
    FetchOciTags { source: reqwest::Error, reference: String },

    #[snafu(display("failed to parse version {raw}"))]
    ParseVersion { source: semver::Error, raw: String },
}

#[derive(Deserialize)]
struct IndexFile {
    entries: std::collections::BTreeMap<String, Vec<IndexEntry>>,
}

#[derive(Deserialize)]
struct IndexEntry {
    version: String,
}

#[derive(Deserialize)]
struct OciTagList {
    tags: Vec<String>,
}

/// Resolve `version_spec` (exact version, semver range, or `"latest"`)
/// against a classic HTTP chart repository's `index.yaml`.
pub async fn resolve_from_index(repo_url: &str, chart: &str, version_spec: &str) -> Result<String, Error> {
    let index_url = format!("{}/index.yaml", repo_url.trim_end_matches('/'));
    let body = reqwest::get(&index_url)
        .await
        .context(FetchIndexSnafu { url: index_url.clone() })?
        .text()
        .await
        .context(FetchIndexSnafu { url: index_url.clone() })?;
    let index: IndexFile = serde_yaml::from_str(&body).context(ParseIndexSnafu { url: index_url.clone() })?;
    let entries = index.entries.get(chart).context(ChartNotFoundSnafu {
        chart: chart.to_owned(),
        url: index_url.clone(),
    })?;
    let versions: Vec<String> = entries.iter().map(|e| e.version.clone()).collect();
    resolve_from_versions(chart, version_spec, &versions)
}

/// Resolve against an OCI registry's tag list (the "latest" / semver
/// range case for `oci: true` sources).
pub async fn resolve_from_oci_tags(reference: &str, version_spec: &str, tags_url: &str) -> Result<String, Error> {
    let body: OciTagList = reqwest::get(tags_url)
        .await
        .context(FetchOciTagsSnafu {
            reference: reference.to_owned(),
        })?
        .json()
        .await
        .context(FetchOciTagsSnafu {
            reference: reference.to_owned(),
        })?;
    resolve_from_versions(reference, version_spec, &body.tags)
}

/// Pick the best version in `candidates` for `version_spec`. Shared by
/// both resolution paths so "latest" and semver-range semantics are
/// identical regardless of where the candidate list came from.
fn resolve_from_versions(chart: &str, version_spec: &str, candidates: &[String]) -> Result<String, Error> {
    if version_spec != "latest" && Version::parse(version_spec).is_ok() {
        // An exact version pin: trust it outright if present in the
        // candidate list, otherwise fall through to range matching
        // (lets callers pass an exact version even when the index uses
        // a `v`-prefixed tag scheme OCI side).
        if candidates.iter().any(|c| c == version_spec) {
            return Ok(version_spec.to_owned());
        }
    }

    let mut parsed: Vec<Version> = candidates
        .iter()
        .filter_map(|raw| Version::parse(raw.trim_start_matches('v')).ok())
        .collect();
    parsed.sort();
    parsed.reverse();

    if version_spec == "latest" {
        return parsed
            .first()
            .map(std::string::ToString::to_string)
            .context(NoMatchingVersionSnafu {
                chart: chart.to_owned(),
                requirement: version_spec.to_owned(),
            });
    }

    let requirement = VersionReq::parse(version_spec).context(ParseVersionSnafu {
        raw: version_spec.to_owned(),
    })?;
    parsed
        .into_iter()
        .find(|v| requirement.matches(v))
        .map(|v| v.to_string())
        .context(NoMatchingVersionSnafu {
            chart: chart.to_owned(),
            requirement: version_spec.to_owned(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn latest_picks_highest_semver() {
        let candidates = vec!["1.0.0".to_owned(), "2.1.0".to_owned(), "1.9.9".to_owned()];
        let resolved = resolve_from_versions("chart", "latest", &candidates).expect("resolve");
        assert_eq!(resolved, "2.1.0");
    }

    #[test]
    fn range_picks_highest_matching() {
        let candidates = vec!["1.0.0".to_owned(), "1.5.0".to_owned(), "2.0.0".to_owned()];
        let resolved = resolve_from_versions("chart", "^1.0.0", &candidates).expect("resolve");
        assert_eq!(resolved, "1.5.0");
    }

    #[test]
    fn exact_version_passes_through() {
        let candidates = vec!["1.0.0".to_owned(), "1.5.0".to_owned()];
        let resolved = resolve_from_versions("chart", "1.0.0", &candidates).expect("resolve");
        assert_eq!(resolved, "1.0.0");
    }

    #[test]
    fn no_matching_version_is_an_error() {
        let candidates = vec!["1.0.0".to_owned()];
        let result = resolve_from_versions("chart", "^2.0.0", &candidates);
        assert!(matches!(result, Err(Error::NoMatchingVersion { .. })));
    }
}
