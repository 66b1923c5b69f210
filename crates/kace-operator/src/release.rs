//! Release naming
//!
//! Releases are tagged `vMAJOR.MINOR.PATCH` and live on a branch named
//! `stable_vMAJOR_MINOR_PATCH`. Each publish bumps the patch number of the
//! highest existing tag under semver precedence.

use semver::{BuildMetadata, Prerelease, Version};

/// Tag used when a repository has no valid release tags yet
pub const FIRST_RELEASE_TAG: &str = "v0.0.1";

/// Parse a release tag; the leading `v` is optional
pub fn parse_tag(tag: &str) -> Option<Version> {
    Version::parse(tag.strip_prefix('v').unwrap_or(tag)).ok()
}

/// Next patch release; pre-release and build parts are dropped
pub fn bump_patch(version: &Version) -> Version {
    Version {
        major: version.major,
        minor: version.minor,
        patch: version.patch + 1,
        pre: Prerelease::EMPTY,
        build: BuildMetadata::EMPTY,
    }
}

/// Next release tag given the existing tags of a repository
///
/// Tags that are not semver are ignored.
pub fn next_release_tag<I, S>(existing: I) -> String
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    existing
        .into_iter()
        .filter_map(|tag| parse_tag(tag.as_ref()))
        .max()
        .map(|latest| format!("v{}", bump_patch(&latest)))
        .unwrap_or_else(|| FIRST_RELEASE_TAG.to_string())
}

/// Branch holding the artifacts of a release tag
pub fn stable_branch_name(tag: &str) -> String {
    format!("stable_{}", tag.replace('.', "_"))
}
