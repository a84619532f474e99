use anyhow::Result;
use semver::{Version, VersionReq};

use crate::UpgradeError;

/// Parses `MAJOR.MINOR.PATCH[-prerelease][+build]` with no leading `v`,
/// no leading zeros and no missing components.
pub fn parse_strict_version(field: &str, value: &str) -> Result<Version> {
    let trimmed = value.trim();
    if trimmed != value {
        return Err(UpgradeError::validation(
            field,
            format!("'{value}' has surrounding whitespace"),
        )
        .into());
    }
    Version::parse(trimmed).map_err(|err| {
        UpgradeError::validation(field, format!("'{value}' is not a semantic version: {err}"))
            .into()
    })
}

pub fn parse_version_range(field: &str, value: &str) -> Result<VersionReq> {
    VersionReq::parse(value.trim()).map_err(|err| {
        UpgradeError::validation(field, format!("'{value}' is not a version range: {err}")).into()
    })
}

/// Upstream release tags are usually `v1.2.3`; anything else that does not
/// parse after stripping the prefix is not a release we can install.
pub fn normalize_release_tag(tag: &str) -> Option<Version> {
    let trimmed = tag.trim();
    let stripped = trimmed
        .strip_prefix('v')
        .or_else(|| trimmed.strip_prefix('V'))
        .unwrap_or(trimmed);
    Version::parse(stripped).ok()
}
