//! GitHub releases of one organization.
//!
//! The release tarball is the asset named `{name}-{version}.tgz` (or the
//! occasional `{name}-v{version}.tgz`) attached to the release whose tag is
//! the version, with or without a leading `v`.

use std::path::Path;

use async_trait::async_trait;
use kiln_schema::{ComponentLock, ComponentSpec, ReleaseSourceConfig, SourceKind, VersionConstraint, parse_lenient};
use regex::Regex;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde::Deserialize;
use tracing::{debug, info, warn};

use super::{Local, ReleaseSource};
use crate::error::{Result, SourceError};
use crate::io::download::download_url;

/// Public GitHub REST API.
pub const DEFAULT_API_URL: &str = "https://api.github.com";

const PER_PAGE: usize = 100;

#[derive(Debug, Clone, Deserialize)]
struct GithubRelease {
    tag_name: String,
    #[serde(default)]
    draft: bool,
    #[serde(default)]
    assets: Vec<GithubAsset>,
}

#[derive(Debug, Clone, Deserialize)]
struct GithubAsset {
    name: String,
    browser_download_url: String,
}

/// Connector for GitHub releases.
#[derive(Debug, Clone)]
pub struct GithubReleaseSource {
    id: String,
    publishable: bool,
    org: String,
    token: String,
    api_url: String,
    client: Client,
}

impl GithubReleaseSource {
    /// Create a connector; `org` is required.
    pub fn new(config: &ReleaseSourceConfig) -> Result<Self> {
        if config.org.is_empty() {
            return Err(SourceError::Config(format!(
                "github release source {:?} requires an org",
                config.id()
            )));
        }
        Ok(Self {
            id: config.id(),
            publishable: config.publishable,
            org: config.org.clone(),
            token: config.github_token.clone(),
            api_url: DEFAULT_API_URL.to_string(),
            client: Client::new(),
        })
    }

    /// Point the connector at another API server (GitHub Enterprise and tests).
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into().trim_end_matches('/').to_string();
        self
    }

    /// Share an existing HTTP client.
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    fn get(&self, url: &str) -> RequestBuilder {
        let request = self
            .client
            .get(url)
            .header(reqwest::header::USER_AGENT, crate::USER_AGENT)
            .header(reqwest::header::ACCEPT, "application/vnd.github+json");
        if self.token.is_empty() {
            request
        } else {
            request.bearer_auth(&self.token)
        }
    }

    /// Owner and repository for a requirement, when it belongs to this org.
    fn repository(&self, spec: &ComponentSpec) -> Result<Option<(String, String)>> {
        let (owner, repo) = match spec.github_repository.as_deref() {
            Some(uri) => match owner_and_repo(uri)? {
                Some(parts) => parts,
                None => return Ok(None),
            },
            None => (self.org.clone(), spec.name.clone()),
        };
        if !owner.eq_ignore_ascii_case(&self.org) {
            return Ok(None);
        }
        Ok(Some((owner, repo)))
    }

    async fn release_by_tag(&self, owner: &str, repo: &str, version: &str) -> Result<Option<GithubRelease>> {
        for tag in [format!("v{version}"), version.to_string()] {
            let url = format!("{}/repos/{owner}/{repo}/releases/tags/{tag}", self.api_url);
            debug!(url = %url, "fetching GitHub release by tag");

            let response = self.get(&url).send().await?;
            match response.status() {
                StatusCode::OK => return Ok(Some(response.json().await?)),
                StatusCode::NOT_FOUND => {}
                other => {
                    return Err(SourceError::unexpected_status(
                        &Method::GET,
                        &url,
                        StatusCode::OK.as_u16(),
                        other.as_u16(),
                    ));
                }
            }
        }
        Ok(None)
    }

    async fn release_matching(
        &self,
        owner: &str,
        repo: &str,
        constraint: &VersionConstraint,
    ) -> Result<Option<GithubRelease>> {
        let mut best: Option<(semver::Version, GithubRelease)> = None;
        let mut pages_without_improvement = 0;
        let mut page = 1;

        while pages_without_improvement < 2 {
            let url = format!(
                "{}/repos/{owner}/{repo}/releases?per_page={PER_PAGE}&page={page}",
                self.api_url
            );
            debug!(url = %url, "listing GitHub releases");

            let response = self.get(&url).send().await?;
            let status = response.status();
            if status == StatusCode::NOT_FOUND {
                break;
            }
            if status != StatusCode::OK {
                return Err(SourceError::unexpected_status(
                    &Method::GET,
                    &url,
                    StatusCode::OK.as_u16(),
                    status.as_u16(),
                ));
            }

            let releases: Vec<GithubRelease> = response.json().await?;
            let count = releases.len();

            let mut improved = false;
            for release in releases {
                if release.draft {
                    continue;
                }
                let Ok(version) = parse_lenient(&release.tag_name) else {
                    continue;
                };
                if !constraint.matches(&version) {
                    continue;
                }
                if best.as_ref().is_none_or(|(current, _)| version > *current) {
                    best = Some((version, release));
                    improved = true;
                }
            }

            if count < PER_PAGE {
                break;
            }
            if improved {
                pages_without_improvement = 0;
            } else {
                pages_without_improvement += 1;
            }
            page += 1;
        }

        Ok(best.map(|(_, release)| release))
    }

    fn lock_from_release(&self, spec: &ComponentSpec, release: &GithubRelease) -> Result<ComponentLock> {
        let version = release.tag_name.trim_start_matches('v');
        let expected = format!("{}-{version}.tgz", spec.name);
        let malformed = format!("{}-v{version}.tgz", spec.name);

        let asset = release
            .assets
            .iter()
            .find(|a| a.name == expected || a.name == malformed)
            .ok_or_else(|| {
                SourceError::Other(format!(
                    "no matching GitHub release asset file name equal to {expected:?} on tag {:?}",
                    release.tag_name
                ))
            })?;

        Ok(ComponentLock {
            version: version.to_string(),
            ..spec.lock()
        }
        .with_remote(&self.id, &asset.browser_download_url))
    }
}

/// Split `https://github.com/owner/repo`, `github.com/owner/repo.git`, or
/// `owner/repo`.
fn owner_and_repo(uri: &str) -> Result<Option<(String, String)>> {
    let re = Regex::new(r"github\.com[/:]([^/]+)/([^/]+?)(?:\.git)?/?$").map_err(|e| SourceError::Other(e.to_string()))?;
    if let Some(caps) = re.captures(uri) {
        return Ok(Some((caps[1].to_string(), caps[2].to_string())));
    }

    let mut parts = uri.trim_matches('/').split('/');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(owner), Some(repo), None) if !owner.is_empty() && !repo.is_empty() && !owner.contains(':') => {
            Ok(Some((owner.to_string(), repo.trim_end_matches(".git").to_string())))
        }
        _ => {
            warn!(uri, "could not parse github_repository");
            Ok(None)
        }
    }
}

#[async_trait]
impl ReleaseSource for GithubReleaseSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::GitHub
    }

    fn publishable(&self) -> bool {
        self.publishable
    }

    async fn get_matched_release(&self, spec: &ComponentSpec) -> Result<ComponentLock> {
        // Only exact versions can be looked up by tag.
        parse_lenient(&spec.version)?;

        let Some((owner, repo)) = self.repository(spec)? else {
            return Err(SourceError::NotFound);
        };
        let release = self
            .release_by_tag(&owner, &repo, &spec.version)
            .await?
            .ok_or(SourceError::NotFound)?;
        self.lock_from_release(spec, &release)
    }

    async fn find_release_version(&self, spec: &ComponentSpec) -> Result<ComponentLock> {
        let constraint = VersionConstraint::parse(&spec.version)?;
        let Some((owner, repo)) = self.repository(spec)? else {
            return Err(SourceError::NotFound);
        };
        let release = self
            .release_matching(&owner, &repo, &constraint)
            .await?
            .ok_or(SourceError::NotFound)?;
        self.lock_from_release(spec, &release)
    }

    async fn download_release(&self, dir: &Path, lock: &ComponentLock) -> Result<Local> {
        info!(
            "downloading {} {} from {} release source {}",
            lock.name,
            lock.version,
            self.kind(),
            self.id
        );

        let (local_path, sha1) = download_url(
            &self.client,
            &lock.remote_path,
            Some(&self.token),
            dir,
            &lock.tarball_name(),
            Some(&lock.sha1),
        )
        .await?;

        Ok(Local {
            lock: lock.clone().with_sha1(sha1.to_string()),
            local_path,
        })
    }
}
