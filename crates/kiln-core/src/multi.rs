//! Resolution across every configured release source.
//!
//! Declared order is precedence: [`ReleaseSources::get_matched_release`]
//! returns the first source's answer, and
//! [`ReleaseSources::find_release_version`] breaks version ties in favor of
//! the source declared first.

use std::cmp::Ordering;
use std::path::Path;

use futures::future::join_all;
use kiln_schema::{ComponentLock, ComponentSpec, ReleaseSourceConfig, compare_versions};
use tracing::debug;

use crate::error::{Result, SourceError};
use crate::sources::{self, Local, ReleaseSource, ReleaseUploader};

/// An ordered list of release sources.
#[derive(Debug, Default)]
pub struct ReleaseSources {
    sources: Vec<Box<dyn ReleaseSource>>,
}

impl ReleaseSources {
    /// Wrap already-built sources, keeping their order.
    pub fn new(sources: Vec<Box<dyn ReleaseSource>>) -> Self {
        Self { sources }
    }

    /// Build every configured source.
    pub async fn from_configs(configs: &[ReleaseSourceConfig]) -> Result<Self> {
        Ok(Self::new(sources::from_configs(configs).await?))
    }

    /// Ids in declared order.
    pub fn ids(&self) -> Vec<String> {
        self.sources.iter().map(|s| s.id().to_string()).collect()
    }

    /// Number of sources.
    pub fn len(&self) -> usize {
        self.sources.len()
    }

    /// Whether no sources are configured.
    pub fn is_empty(&self) -> bool {
        self.sources.is_empty()
    }

    /// Sources in declared order.
    pub fn iter(&self) -> std::slice::Iter<'_, Box<dyn ReleaseSource>> {
        self.sources.iter()
    }

    /// Keep only publishable sources when `publishable_only` is set.
    pub fn filter(self, publishable_only: bool) -> Self {
        if !publishable_only {
            return self;
        }
        Self {
            sources: self.sources.into_iter().filter(|s| s.publishable()).collect(),
        }
    }

    /// Parallelism handed to sources that split downloads.
    pub fn set_download_threads(&mut self, threads: usize) {
        for source in &mut self.sources {
            source.set_download_threads(threads);
        }
    }

    /// The source with this id.
    pub fn find_by_id(&self, id: &str) -> Result<&dyn ReleaseSource> {
        self.sources
            .iter()
            .find(|s| s.id() == id)
            .map(AsRef::as_ref)
            .ok_or_else(|| SourceError::UnknownSource {
                id: id.to_string(),
                available: self.ids(),
            })
    }

    /// The upload-capable source with this id.
    pub fn find_release_uploader(&self, id: &str) -> Result<&dyn ReleaseUploader> {
        let uploaders: Vec<(&str, &dyn ReleaseUploader)> = self
            .sources
            .iter()
            .filter_map(|s| s.as_uploader().map(|u| (s.id(), u)))
            .collect();

        if uploaders.is_empty() {
            return Err(SourceError::Config(
                "no upload-capable release sources were found in the Kilnfile".to_string(),
            ));
        }

        uploaders
            .iter()
            .find(|(source_id, _)| *source_id == id)
            .map(|(_, uploader)| *uploader)
            .ok_or_else(|| SourceError::UnknownSource {
                id: id.to_string(),
                available: uploaders.iter().map(|(source_id, _)| (*source_id).to_string()).collect(),
            })
    }

    /// Ask each source in order; the first match wins.
    ///
    /// A hard error from any source stops the search and is returned scoped
    /// to that source. [`SourceError::NotFound`] when no source has it.
    pub async fn get_matched_release(&self, spec: &ComponentSpec) -> Result<ComponentLock> {
        for source in &self.sources {
            debug!(source = source.id(), release = %spec, "looking up release");
            match source.get_matched_release(spec).await {
                Ok(lock) => return Ok(lock),
                Err(err) if err.is_not_found() => {}
                Err(err) => return Err(err.scoped(source.id())),
            }
        }
        Err(SourceError::NotFound)
    }

    /// Ask every source and keep the greatest version.
    ///
    /// Sources are queried concurrently; results are considered in declared
    /// order so that equal versions resolve to the earlier source and the
    /// reported error (if any) is the first declared failing source's.
    pub async fn find_release_version(&self, spec: &ComponentSpec) -> Result<ComponentLock> {
        let results = join_all(self.sources.iter().map(|s| s.find_release_version(spec))).await;

        let mut best: Option<ComponentLock> = None;
        for (source, result) in self.sources.iter().zip(results) {
            let lock = match result {
                Ok(lock) => lock,
                Err(err) if err.is_not_found() => continue,
                Err(err) => return Err(err.scoped(source.id())),
            };
            debug!(source = source.id(), version = %lock.version, "candidate release version");
            let is_better = best
                .as_ref()
                .is_none_or(|current| compare_versions(&lock.version, &current.version) == Ordering::Greater);
            if is_better {
                best = Some(lock);
            }
        }
        best.ok_or(SourceError::NotFound)
    }

    /// Download through the source named by `lock.remote_source`.
    ///
    /// The returned SHA1 is what the source computed; comparing it with
    /// `lock.sha1` is up to the caller.
    pub async fn download_release(&self, dir: &Path, lock: &ComponentLock) -> Result<Local> {
        let source = self.find_by_id(&lock.remote_source)?;
        source
            .download_release(dir, lock)
            .await
            .map_err(|err| err.scoped(source.id()))
    }
}

impl From<Vec<Box<dyn ReleaseSource>>> for ReleaseSources {
    fn from(sources: Vec<Box<dyn ReleaseSource>>) -> Self {
        Self::new(sources)
    }
}

impl<'a> IntoIterator for &'a ReleaseSources {
    type Item = &'a Box<dyn ReleaseSource>;
    type IntoIter = std::slice::Iter<'a, Box<dyn ReleaseSource>>;

    fn into_iter(self) -> Self::IntoIter {
        self.sources.iter()
    }
}
