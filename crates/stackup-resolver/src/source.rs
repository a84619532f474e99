use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use reqwest::blocking::Client;
use reqwest::header::{ACCEPT, AUTHORIZATION, USER_AGENT};
use semver::Version;
use serde::{Deserialize, Serialize};
use stackup_core::{normalize_release_tag, UpgradeError};
use stackup_retry::{classify_http_status, classify_io_error, AttemptError, ErrorClass};
use tracing::debug;

const GITHUB_API: &str = "https://api.github.com";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Release {
    pub version: Version,
    pub prerelease: bool,
    pub lts: bool,
}

impl Release {
    pub fn new(version: Version, lts: bool) -> Self {
        Self {
            prerelease: !version.pre.is_empty(),
            version,
            lts,
        }
    }

    pub fn is_stable(&self) -> bool {
        !self.prerelease && self.version.pre.is_empty()
    }
}

/// Where a component's release list comes from, parsed from the `source`
/// field of the versions document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SourceLocation {
    GitHub { owner: String, repo: String },
    Feed(PathBuf),
}

impl SourceLocation {
    pub fn parse(component: &str, raw: &str) -> Result<Self> {
        let field = format!("components.{component}.source");
        if let Some(slug) = raw.strip_prefix("github:") {
            let (owner, repo) = slug.split_once('/').ok_or_else(|| {
                UpgradeError::validation(field.clone(), format!("'{raw}' must be github:<owner>/<repo>"))
            })?;
            for part in [owner, repo] {
                if !is_valid_repo_segment(part) {
                    return Err(UpgradeError::validation(
                        field.clone(),
                        format!("'{part}' is not a valid repository segment"),
                    )
                    .into());
                }
            }
            return Ok(Self::GitHub {
                owner: owner.to_string(),
                repo: repo.to_string(),
            });
        }
        if let Some(path) = raw.strip_prefix("feed:") {
            let path = PathBuf::from(path);
            if !path.is_absolute() {
                return Err(UpgradeError::validation(
                    field,
                    format!("feed path '{}' must be absolute", path.display()),
                )
                .into());
            }
            return Ok(Self::Feed(path));
        }
        Err(UpgradeError::validation(
            field,
            format!("'{raw}' must start with 'github:' or 'feed:'"),
        )
        .into())
    }

    /// Circuit-breaker resource name for this upstream.
    pub fn resource_name(&self) -> String {
        match self {
            Self::GitHub { owner, repo } => format!("github:{owner}/{repo}"),
            Self::Feed(path) => format!("feed:{}", path.display()),
        }
    }
}

fn is_valid_repo_segment(value: &str) -> bool {
    !value.is_empty()
        && value != "."
        && value != ".."
        && value.len() <= 100
        && value
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.'))
}

/// Upstream release listing. Implementations classify their own failures so
/// the retry layer knows what is worth another attempt.
pub trait ReleaseSource: Send + Sync {
    fn list_releases(
        &self,
        location: &SourceLocation,
        timeout: Option<Duration>,
    ) -> Result<Vec<Release>, AttemptError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedRelease {
    pub version: String,
    #[serde(default)]
    pub prerelease: bool,
    #[serde(default)]
    pub lts: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FeedDocument {
    #[serde(default)]
    pub releases: Vec<FeedRelease>,
}

impl FeedDocument {
    pub fn into_releases(self) -> Vec<Release> {
        self.releases
            .into_iter()
            .filter_map(|entry| {
                let version = normalize_release_tag(&entry.version)?;
                let mut release = Release::new(version, entry.lts);
                release.prerelease |= entry.prerelease;
                Some(release)
            })
            .collect()
    }
}

#[derive(Debug, Deserialize)]
struct GitHubRelease {
    tag_name: String,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    prerelease: bool,
    #[serde(default)]
    draft: bool,
}

impl GitHubRelease {
    fn into_release(self) -> Option<Release> {
        if self.draft {
            return None;
        }
        let version = normalize_release_tag(&self.tag_name)?;
        let lts = is_lts_label(&self.tag_name)
            || self.name.as_deref().is_some_and(is_lts_label);
        let mut release = Release::new(version, lts);
        release.prerelease |= self.prerelease;
        Some(release)
    }
}

fn is_lts_label(value: &str) -> bool {
    value
        .split(|c: char| !c.is_ascii_alphanumeric())
        .any(|word| word.eq_ignore_ascii_case("lts"))
}

/// Default upstreams: the GitHub releases API and local JSON feeds.
pub struct UpstreamSources {
    client: Client,
    api_base: String,
    token: Option<String>,
}

impl UpstreamSources {
    pub fn new() -> Result<Self> {
        Self::with_api_base(GITHUB_API)
    }

    pub fn with_api_base(api_base: &str) -> Result<Self> {
        let client = Client::builder()
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            client,
            api_base: api_base.trim_end_matches('/').to_string(),
            token: std::env::var("GITHUB_TOKEN").ok().filter(|token| !token.is_empty()),
        })
    }

    fn github_releases(
        &self,
        owner: &str,
        repo: &str,
        timeout: Option<Duration>,
    ) -> Result<Vec<Release>, AttemptError> {
        let url = format!("{}/repos/{owner}/{repo}/releases?per_page=100", self.api_base);
        debug!(url = %url, "querying release list");
        let mut request = self
            .client
            .get(&url)
            .header(ACCEPT, "application/vnd.github+json")
            .header(USER_AGENT, concat!("stackup/", env!("CARGO_PKG_VERSION")));
        if let Some(token) = &self.token {
            request = request.header(AUTHORIZATION, format!("Bearer {token}"));
        }
        if let Some(timeout) = timeout {
            request = request.timeout(timeout);
        }

        let response = request.send().map_err(|err| {
            let class = if err.is_builder() {
                ErrorClass::Permanent
            } else {
                ErrorClass::Transient
            };
            AttemptError::classified(class, anyhow!(err).context(format!("GET {url}")))
        })?;

        let status = response.status();
        if !status.is_success() {
            let rate_limited = status.as_u16() == 403
                && response
                    .headers()
                    .get("x-ratelimit-remaining")
                    .and_then(|value| value.to_str().ok())
                    == Some("0");
            let class = if rate_limited {
                ErrorClass::Transient
            } else {
                classify_http_status(status.as_u16())
            };
            return Err(AttemptError::classified(
                class,
                anyhow!("GET {url} returned {status}"),
            ));
        }

        let releases: Vec<GitHubRelease> = response.json().map_err(|err| {
            AttemptError::permanent(anyhow!(err).context(format!("invalid release list from {url}")))
        })?;
        Ok(releases
            .into_iter()
            .filter_map(GitHubRelease::into_release)
            .collect())
    }
}

impl ReleaseSource for UpstreamSources {
    fn list_releases(
        &self,
        location: &SourceLocation,
        timeout: Option<Duration>,
    ) -> Result<Vec<Release>, AttemptError> {
        match location {
            SourceLocation::GitHub { owner, repo } => self.github_releases(owner, repo, timeout),
            SourceLocation::Feed(path) => read_feed(path),
        }
    }
}

pub(crate) fn read_feed(path: &Path) -> Result<Vec<Release>, AttemptError> {
    let raw = fs::read_to_string(path).map_err(|err| {
        let class = classify_io_error(&err);
        AttemptError::classified(
            class,
            anyhow!(err).context(format!("failed reading release feed {}", path.display())),
        )
    })?;
    let document: FeedDocument = serde_json::from_str(&raw).map_err(|err| {
        AttemptError::permanent(
            anyhow!(err).context(format!("invalid release feed {}", path.display())),
        )
    })?;
    Ok(document.into_releases())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_source_locations() {
        assert_eq!(
            SourceLocation::parse("loki", "github:grafana/loki").expect("must parse"),
            SourceLocation::GitHub {
                owner: "grafana".to_string(),
                repo: "loki".to_string()
            }
        );
        assert_eq!(
            SourceLocation::parse("loki", "feed:/srv/feeds/loki.json").expect("must parse"),
            SourceLocation::Feed(PathBuf::from("/srv/feeds/loki.json"))
        );
        for bad in ["github:grafana", "github:../etc", "feed:relative.json", "s3://bucket"] {
            assert!(SourceLocation::parse("loki", bad).is_err(), "{bad} accepted");
        }
    }

    #[test]
    fn github_release_marks_drafts_prereleases_and_lts() {
        let draft = GitHubRelease {
            tag_name: "v2.0.0".to_string(),
            name: None,
            prerelease: false,
            draft: true,
        };
        assert!(draft.into_release().is_none());

        let flagged = GitHubRelease {
            tag_name: "v2.1.0".to_string(),
            name: Some("2.1.0 (LTS)".to_string()),
            prerelease: true,
            draft: false,
        };
        let release = flagged.into_release().expect("must convert");
        assert!(release.prerelease);
        assert!(release.lts);
        assert!(!release.is_stable());

        let plain = GitHubRelease {
            tag_name: "v2.2.0".to_string(),
            name: Some("Salts and fixes".to_string()),
            prerelease: false,
            draft: false,
        };
        assert!(!plain.into_release().expect("must convert").lts);
    }

    #[test]
    fn feed_skips_unparseable_versions() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("feed.json");
        fs::write(
            &path,
            r#"{"releases":[{"version":"v1.2.0","lts":true},{"version":"nightly"},{"version":"1.3.0-beta.1"}]}"#,
        )
        .expect("must write feed");

        let releases = read_feed(&path).expect("must read feed");
        assert_eq!(releases.len(), 2);
        assert!(releases[0].lts);
        assert!(releases[1].prerelease);
    }

    #[test]
    fn missing_feed_is_permanent() {
        let err = read_feed(Path::new("/nonexistent/stackup/feed.json")).expect_err("must fail");
        assert_eq!(err.class(), ErrorClass::Permanent);
    }
}
