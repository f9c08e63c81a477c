//! bosh.io: the public index of open-source BOSH releases.
//!
//! bosh.io only serves built releases, so stemcell fields on a requirement
//! are dropped before lookup. A release is addressed by the GitHub
//! repository it was cut from; since the Kilnfile only names the release,
//! a fixed set of well-known organizations and repository suffixes is
//! probed in order.

use std::path::Path;

use async_trait::async_trait;
use kiln_schema::{ComponentLock, ComponentSpec, ReleaseSourceConfig, SourceKind, VersionConstraint, parse_lenient};
use reqwest::{Client, Method, StatusCode};
use serde::Deserialize;
use tracing::{debug, info};

use super::{Local, ReleaseSource};
use crate::error::{Result, SourceError};
use crate::io::download::download_url;

/// Public bosh.io endpoint.
pub const DEFAULT_SERVER: &str = "https://bosh.io";

const ORGANIZATIONS: &[&str] = &[
    "cloudfoundry",
    "pivotal-cf",
    "cloudfoundry-incubator",
    "pivotal-cf-experimental",
    "bosh-packages",
    "cppforlife",
    "vito",
    "flavorjones",
    "xoebus",
    "dpb587",
    "jamlo",
    "concourse",
    "cf-platform-eng",
    "starkandwayne",
    "cloudfoundry-community",
    "vmware",
    "DataDog",
    "Dynatrace",
    "SAP",
    "hybris",
    "minio",
    "rakutentech",
    "frodenas",
];

const SUFFIXES: &[&str] = &["-release", "-boshrelease", "-bosh-release", ""];

#[derive(Debug, Deserialize)]
struct BoshIoRelease {
    version: String,
    #[serde(default)]
    sha1: String,
}

/// Connector for bosh.io.
#[derive(Debug, Clone)]
pub struct BoshIoReleaseSource {
    id: String,
    publishable: bool,
    server: String,
    organizations: Vec<String>,
    client: Client,
}

impl BoshIoReleaseSource {
    /// Create a connector against the public server.
    pub fn new(config: &ReleaseSourceConfig) -> Self {
        Self {
            id: config.id(),
            publishable: config.publishable,
            server: DEFAULT_SERVER.to_string(),
            organizations: ORGANIZATIONS.iter().map(ToString::to_string).collect(),
            client: Client::new(),
        }
    }

    /// Point the connector at another server (mirrors and tests).
    pub fn with_server(mut self, server: impl Into<String>) -> Self {
        self.server = server.into().trim_end_matches('/').to_string();
        self
    }

    /// Replace the organizations that are probed for a release.
    pub fn with_organizations<I, S>(mut self, organizations: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.organizations = organizations.into_iter().map(Into::into).collect();
        self
    }

    /// Share an existing HTTP client.
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = client;
        self
    }

    fn candidate_repositories<'a>(&'a self, name: &'a str) -> impl Iterator<Item = String> + 'a {
        self.organizations.iter().flat_map(move |org| {
            SUFFIXES
                .iter()
                .map(move |suffix| format!("github.com/{org}/{name}{suffix}"))
        })
    }

    fn lock_for(&self, spec: &ComponentSpec, repository: &str, release: &BoshIoRelease) -> ComponentLock {
        let url = format!("{}/d/{repository}?v={}", self.server, release.version);
        ComponentLock {
            version: release.version.clone(),
            ..spec.lock()
        }
        .with_remote(&self.id, url)
        .with_sha1(&release.sha1)
    }

    async fn releases(&self, repository: &str) -> Result<Vec<BoshIoRelease>> {
        let url = format!("{}/api/v1/releases/{repository}", self.server);
        debug!(url = %url, "listing bosh.io releases");

        let response = self
            .client
            .get(&url)
            .header(reqwest::header::USER_AGENT, crate::USER_AGENT)
            .send()
            .await?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(Vec::new());
        }
        if !status.is_success() {
            return Err(SourceError::unexpected_status(
                &Method::GET,
                &url,
                StatusCode::OK.as_u16(),
                status.as_u16(),
            ));
        }

        let body = response.text().await?;
        if body.trim() == "null" {
            return Ok(Vec::new());
        }
        serde_json::from_str(&body)
            .map_err(|e| SourceError::Other(format!("bosh.io returned an unreadable release list for {repository}: {e}")))
    }
}

fn same_version(a: &str, b: &str) -> bool {
    if a == b {
        return true;
    }
    matches!((parse_lenient(a), parse_lenient(b)), (Ok(a), Ok(b)) if a == b)
}

#[async_trait]
impl ReleaseSource for BoshIoReleaseSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::BoshIo
    }

    fn publishable(&self) -> bool {
        self.publishable
    }

    async fn get_matched_release(&self, spec: &ComponentSpec) -> Result<ComponentLock> {
        let spec = spec.clone().unset_stemcell();
        for repository in self.candidate_repositories(&spec.name) {
            let releases = self.releases(&repository).await?;
            if let Some(release) = releases.iter().find(|r| same_version(&r.version, &spec.version)) {
                return Ok(self.lock_for(&spec, &repository, release));
            }
        }
        Err(SourceError::NotFound)
    }

    async fn find_release_version(&self, spec: &ComponentSpec) -> Result<ComponentLock> {
        let spec = spec.clone().unset_stemcell();
        let constraint = VersionConstraint::parse(&spec.version)?;

        for repository in self.candidate_repositories(&spec.name) {
            let releases = self.releases(&repository).await?;
            let Some(best) = constraint.best_match(releases.iter().map(|r| r.version.as_str())) else {
                continue;
            };
            if let Some(release) = releases.iter().find(|r| r.version == best) {
                return Ok(self.lock_for(&spec, &repository, release));
            }
        }
        Err(SourceError::NotFound)
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
            None,
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
