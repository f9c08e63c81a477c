//! Release sources: one connector per backend behind a shared trait.

pub mod bosh_io;
pub mod github;
pub mod s3;

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use kiln_schema::{ComponentLock, ComponentSpec, ReleaseSourceConfig, SourceKind};

use crate::error::{Result, SourceError};

pub use bosh_io::BoshIoReleaseSource;
pub use github::GithubReleaseSource;
pub use s3::{ObjectStore, S3ObjectStore, S3ReleaseSource};

/// A release tarball on local disk together with the lock that describes it.
///
/// `lock.sha1` is the SHA1 of the bytes at `local_path`, computed while they
/// were written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Local {
    /// Resolved record, with the locally computed checksum.
    pub lock: ComponentLock,
    /// Where the tarball lives.
    pub local_path: PathBuf,
}

/// The capability set every backend implements.
///
/// Implementations are stateless after construction and are shared across
/// worker tasks.
#[async_trait]
pub trait ReleaseSource: Send + Sync + std::fmt::Debug {
    /// Unique id of this source within a run.
    fn id(&self) -> &str;

    /// Backend kind, used in log lines and errors.
    fn kind(&self) -> SourceKind;

    /// Whether releases from this source may ship in a product.
    fn publishable(&self) -> bool;

    /// Exact lookup by name and version (and stemcell for compiled releases).
    ///
    /// Returns [`SourceError::NotFound`] when the backend has no such release.
    async fn get_matched_release(&self, spec: &ComponentSpec) -> Result<ComponentLock>;

    /// Highest version of `spec.name` satisfying `spec.version` as a constraint.
    async fn find_release_version(&self, spec: &ComponentSpec) -> Result<ComponentLock>;

    /// Stream the release into `dir`, hashing in the same pass.
    async fn download_release(&self, dir: &Path, lock: &ComponentLock) -> Result<Local>;

    /// Upload capability, when the backend has one.
    fn as_uploader(&self) -> Option<&dyn ReleaseUploader> {
        None
    }

    /// Parallelism for backends that split downloads into ranged reads.
    fn set_download_threads(&mut self, _threads: usize) {}
}

/// Backends that can store a release tarball.
#[async_trait]
pub trait ReleaseUploader: Send + Sync {
    /// Upload `file` as the release described by `spec`, returning its new lock.
    async fn upload_release(&self, spec: &ComponentSpec, file: &Path) -> Result<ComponentLock>;

    /// Remote path the release would be uploaded to.
    fn remote_path(&self, spec: &ComponentSpec) -> Result<String>;
}

/// Build one connector from its configuration.
///
/// Unknown kinds and missing required fields are reported here, before any
/// request is made.
pub async fn from_config(config: &ReleaseSourceConfig) -> Result<Box<dyn ReleaseSource>> {
    let kind: SourceKind = config.kind.parse().map_err(SourceError::Config)?;
    let source: Box<dyn ReleaseSource> = match kind {
        SourceKind::S3 => Box::new(S3ReleaseSource::from_config(config).await?),
        SourceKind::BoshIo => Box::new(BoshIoReleaseSource::new(config)),
        SourceKind::GitHub => Box::new(GithubReleaseSource::new(config)?),
    };
    Ok(source)
}

/// Build every configured connector, preserving declared order.
///
/// Duplicate ids are rejected, naming both positions.
pub async fn from_configs(configs: &[ReleaseSourceConfig]) -> Result<Vec<Box<dyn ReleaseSource>>> {
    check_unique_ids(configs)?;
    let mut sources = Vec::with_capacity(configs.len());
    for config in configs {
        sources.push(from_config(config).await?);
    }
    Ok(sources)
}

fn check_unique_ids(configs: &[ReleaseSourceConfig]) -> Result<()> {
    let mut seen: HashMap<String, usize> = HashMap::new();
    for (index, config) in configs.iter().enumerate() {
        let id = config.id();
        if id.is_empty() {
            // Unknown kinds have no default id; from_config reports them.
            continue;
        }
        if let Some(first) = seen.insert(id.clone(), index) {
            return Err(SourceError::Config(format!(
                "release sources {first} and {index} both have id {id:?}; ids must be unique"
            )));
        }
    }
    Ok(())
}
