//! S3 (and S3-compatible) buckets holding built or compiled release tarballs.
//!
//! Object keys come from the source's `path_template`. Listing, probing,
//! and ranged reads go through [`ObjectStore`] so the connector logic can be
//! exercised without a bucket.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_s3 as s3;
use bytes::Bytes;
use futures::{StreamExt, TryStreamExt};
use kiln_schema::{ComponentLock, ComponentSpec, ReleaseSourceConfig, Sha1Digest, SourceKind, VersionConstraint};
use regex::Regex;
use tracing::{debug, info};

use super::{Local, ReleaseSource, ReleaseUploader};
use crate::error::{Result, SourceError};
use crate::io::download::StagedFile;
use crate::path_template::PathTemplate;

/// Size of each ranged GET.
pub const PART_SIZE: u64 = 8 * 1024 * 1024;

/// Ranged reads in flight per download unless configured otherwise.
pub const DEFAULT_DOWNLOAD_THREADS: usize = 4;

const DEFAULT_REGION: &str = "us-east-1";

/// The handful of bucket operations the connector needs.
#[async_trait]
pub trait ObjectStore: Send + Sync + std::fmt::Debug {
    /// Size of the object, or `None` when it does not exist.
    async fn head(&self, key: &str) -> Result<Option<u64>>;

    /// Bytes `start..=end` of the object.
    async fn get_range(&self, key: &str, start: u64, end: u64) -> Result<Bytes>;

    /// Store the file at `key`.
    async fn put(&self, key: &str, file: &Path) -> Result<()>;

    /// Every key under `prefix`, across all pages.
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;
}

/// [`ObjectStore`] backed by the AWS SDK.
#[derive(Debug, Clone)]
pub struct S3ObjectStore {
    client: s3::Client,
    bucket: String,
}

impl S3ObjectStore {
    /// Build a client for the configured bucket.
    ///
    /// Static keys are used when both are set; otherwise credentials come
    /// from the default AWS provider chain. An endpoint override switches to
    /// path-style addressing for S3-compatible stores.
    pub async fn from_config(config: &ReleaseSourceConfig) -> Self {
        let region = if config.region.is_empty() {
            DEFAULT_REGION.to_string()
        } else {
            config.region.clone()
        };
        let region = s3::config::Region::new(region);

        let mut builder = if !config.access_key_id.is_empty() && !config.secret_access_key.is_empty() {
            let credentials = s3::config::Credentials::new(
                &config.access_key_id,
                &config.secret_access_key,
                None,
                None,
                "kiln-release-source",
            );
            s3::Config::builder()
                .behavior_version_latest()
                .region(region)
                .credentials_provider(credentials)
        } else {
            let shared = aws_config::defaults(aws_config::BehaviorVersion::latest())
                .region(region)
                .load()
                .await;
            s3::config::Builder::from(&shared)
        };

        if !config.endpoint.is_empty() {
            builder = builder.endpoint_url(&config.endpoint).force_path_style(true);
        }

        Self {
            client: s3::Client::from_conf(builder.build()),
            bucket: config.bucket.clone(),
        }
    }
}

fn sdk_error<E, R>(err: &s3::error::SdkError<E, R>) -> SourceError
where
    E: std::error::Error + 'static,
    R: std::fmt::Debug,
{
    SourceError::S3(s3::error::DisplayErrorContext(err).to_string())
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn head(&self, key: &str) -> Result<Option<u64>> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(output) => Ok(Some(output.content_length().unwrap_or(0).max(0) as u64)),
            Err(err) if err.as_service_error().is_some_and(|e| e.is_not_found()) => Ok(None),
            Err(err) => Err(sdk_error(&err)),
        }
    }

    async fn get_range(&self, key: &str, start: u64, end: u64) -> Result<Bytes> {
        let range = format!("bytes={start}-{end}");
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .range(&range)
            .send()
            .await;

        let output = match result {
            Ok(output) => output,
            Err(err) if err.as_service_error().is_some_and(|e| e.is_no_such_key()) => {
                return Err(SourceError::ObjectMissing { key: key.to_string() });
            }
            Err(err) if err.raw_response().is_some_and(|r| r.status().as_u16() == 416) => {
                return Err(SourceError::RangeNotSatisfiable {
                    key: key.to_string(),
                    range,
                });
            }
            Err(err) => return Err(sdk_error(&err)),
        };

        let body = output
            .body
            .collect()
            .await
            .map_err(|e| SourceError::S3(format!("reading {key:?} {range}: {e}")))?;
        Ok(body.into_bytes())
    }

    async fn put(&self, key: &str, file: &Path) -> Result<()> {
        let body = s3::primitives::ByteStream::from_path(file)
            .await
            .map_err(|e| SourceError::S3(format!("opening {}: {e}", file.display())))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .content_type("application/gzip")
            .send()
            .await
            .map_err(|e| sdk_error(&e))?;
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .prefix(prefix)
            .into_paginator()
            .send();

        let mut keys = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.map_err(|e| sdk_error(&e))?;
            keys.extend(page.contents().iter().filter_map(|o| o.key().map(str::to_string)));
        }
        Ok(keys)
    }
}

/// Connector for a bucket of release tarballs.
#[derive(Debug, Clone)]
pub struct S3ReleaseSource {
    id: String,
    publishable: bool,
    bucket: String,
    template: PathTemplate,
    store: Arc<dyn ObjectStore>,
    download_threads: usize,
    part_size: u64,
}

impl S3ReleaseSource {
    /// Validate the configuration and connect with the AWS SDK.
    pub async fn from_config(config: &ReleaseSourceConfig) -> Result<Self> {
        validate(config)?;
        let store = S3ObjectStore::from_config(config).await;
        Self::with_store(config, Arc::new(store))
    }

    /// Build the connector over an existing store.
    pub fn with_store(config: &ReleaseSourceConfig, store: Arc<dyn ObjectStore>) -> Result<Self> {
        let template = validate(config)?;
        Ok(Self {
            id: config.id(),
            publishable: config.publishable,
            bucket: config.bucket.clone(),
            template,
            store,
            download_threads: DEFAULT_DOWNLOAD_THREADS,
            part_size: PART_SIZE,
        })
    }

    /// Override the ranged-read size.
    pub fn with_part_size(mut self, part_size: u64) -> Self {
        self.part_size = part_size.max(1);
        self
    }

    /// Bucket name.
    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    /// Prefix under which every version of `name` is listed.
    ///
    /// Templates that start with a product line (`2.11/...`) keep it.
    fn list_prefix(&self, name: &str) -> Result<String> {
        let product_line = Regex::new(r"^\d+\.\d+").map_err(|e| SourceError::Other(e.to_string()))?;
        let mut prefix = product_line
            .find(self.template.literal_prefix())
            .map(|m| format!("{}/", m.as_str()))
            .unwrap_or_default();
        prefix.push_str(name);
        prefix.push('/');
        Ok(prefix)
    }
}

fn validate(config: &ReleaseSourceConfig) -> Result<PathTemplate> {
    if config.bucket.is_empty() {
        return Err(SourceError::Config(format!(
            "s3 release source {:?} requires a bucket",
            config.id()
        )));
    }
    if config.path_template.is_empty() {
        return Err(SourceError::Config(format!(
            "s3 release source {:?} requires a path_template",
            config.id()
        )));
    }
    PathTemplate::parse(&config.path_template).map_err(|e| SourceError::Config(e.to_string()))
}

/// Release and stemcell version embedded in an object key's file name.
///
/// The first `-`/`v`-prefixed dotted number is the release version; when
/// there is more than one, the last is the stemcell version.
fn key_versions(pattern: &Regex, key: &str) -> Option<(String, Option<String>)> {
    let file_name = key.rsplit('/').next().unwrap_or(key);
    let file_name = file_name.strip_suffix(".tgz").unwrap_or(file_name);
    let found: Vec<&str> = pattern
        .find_iter(file_name)
        .map(|m| &m.as_str()[1..])
        .collect();

    let (first, rest) = found.split_first()?;
    let stemcell = rest.last().map(ToString::to_string);
    Some(((*first).to_string(), stemcell))
}

#[async_trait]
impl ReleaseSource for S3ReleaseSource {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::S3
    }

    fn publishable(&self) -> bool {
        self.publishable
    }

    async fn get_matched_release(&self, spec: &ComponentSpec) -> Result<ComponentLock> {
        let key = self.template.render(spec)?;
        debug!(bucket = %self.bucket, key = %key, "HEAD");
        match self.store.head(&key).await? {
            Some(_) => Ok(spec.lock().with_remote(&self.id, key)),
            None => Err(SourceError::NotFound),
        }
    }

    async fn find_release_version(&self, spec: &ComponentSpec) -> Result<ComponentLock> {
        let constraint = VersionConstraint::parse(&spec.version)?;
        let prefix = self.list_prefix(&spec.name)?;
        let pattern = Regex::new(r"[-v]\d+(\.\d+)*").map_err(|e| SourceError::Other(e.to_string()))?;

        debug!(bucket = %self.bucket, prefix = %prefix, "listing release versions");
        let keys = self.store.list(&prefix).await?;

        let mut best: Option<(semver::Version, String, String)> = None;
        for key in keys {
            let Some((version, stemcell)) = key_versions(&pattern, &key) else {
                continue;
            };
            // Compiled keys only match a requirement for the same stemcell.
            if let Some(found) = &stemcell {
                if spec.stemcell_version.as_deref() != Some(found.as_str()) {
                    continue;
                }
            }
            let Ok(parsed) = kiln_schema::parse_lenient(&version) else {
                continue;
            };
            if !constraint.matches(&parsed) {
                continue;
            }
            if best.as_ref().is_none_or(|(current, ..)| parsed > *current) {
                best = Some((parsed, version, key));
            }
        }

        let (_, version, key) = best.ok_or(SourceError::NotFound)?;
        Ok(ComponentLock {
            version,
            ..spec.lock()
        }
        .with_remote(&self.id, key))
    }

    async fn download_release(&self, dir: &Path, lock: &ComponentLock) -> Result<Local> {
        info!(
            "downloading {} {} from {} release source {}",
            lock.name,
            lock.version,
            self.kind(),
            self.id
        );

        let key = lock.remote_path.as_str();
        let size = self
            .store
            .head(key)
            .await?
            .ok_or_else(|| SourceError::ObjectMissing { key: key.to_string() })?;

        let part_size = self.part_size;
        let ranges: Vec<(u64, u64)> = (0..size.div_ceil(part_size))
            .map(|i| {
                let start = i * part_size;
                (start, (start + part_size).min(size) - 1)
            })
            .collect();
        debug!(key, size, parts = ranges.len(), "ranged download");

        let file_name = lock.tarball_name();
        let mut staged = StagedFile::create(dir, &file_name)?;
        let store = &self.store;
        let mut parts = futures::stream::iter(ranges)
            .map(|(start, end)| async move { store.get_range(key, start, end).await })
            .buffered(self.download_threads.max(1));
        while let Some(part) = parts.try_next().await? {
            staged.write_chunk(&part).await?;
        }

        let (local_path, sha1) = staged.finish(&dir.join(&file_name), Some(&lock.sha1)).await?;
        Ok(Local {
            lock: lock.clone().with_sha1(sha1.to_string()),
            local_path,
        })
    }

    fn as_uploader(&self) -> Option<&dyn ReleaseUploader> {
        Some(self)
    }

    fn set_download_threads(&mut self, threads: usize) {
        if threads > 0 {
            self.download_threads = threads;
        }
    }
}

#[async_trait]
impl ReleaseUploader for S3ReleaseSource {
    async fn upload_release(&self, spec: &ComponentSpec, file: &Path) -> Result<ComponentLock> {
        if !self.publishable {
            return Err(SourceError::NotPublishable(self.id.clone()));
        }

        let key = self.remote_path(spec)?;
        let path = file.to_path_buf();
        let sha1 = tokio::task::spawn_blocking(move || Sha1Digest::compute_file(&path))
            .await
            .map_err(|e| SourceError::Other(format!("hashing task failed: {e}")))??;

        info!(bucket = %self.bucket, key = %key, "uploading {} {}", spec.name, spec.version);
        self.store.put(&key, file).await?;

        Ok(spec.lock().with_remote(&self.id, key).with_sha1(sha1.to_string()))
    }

    fn remote_path(&self, spec: &ComponentSpec) -> Result<String> {
        Ok(self.template.render(spec)?)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::BTreeMap;
    use std::sync::Mutex;

    use super::*;

    /// In-memory bucket.
    #[derive(Debug, Default)]
    pub(crate) struct MemoryStore {
        pub(crate) objects: Mutex<BTreeMap<String, Vec<u8>>>,
        pub(crate) range_requests: Mutex<Vec<(u64, u64)>>,
    }

    impl MemoryStore {
        /// A store whose objects contain their own key as the body.
        pub(crate) fn with_keys(keys: &[&str]) -> Arc<Self> {
            let store = Self::default();
            for key in keys {
                store.insert(key, key.as_bytes());
            }
            Arc::new(store)
        }

        pub(crate) fn insert(&self, key: &str, body: impl Into<Vec<u8>>) {
            self.objects.lock().unwrap().insert(key.to_string(), body.into());
        }
    }

    #[async_trait]
    impl ObjectStore for MemoryStore {
        async fn head(&self, key: &str) -> Result<Option<u64>> {
            Ok(self.objects.lock().unwrap().get(key).map(|b| b.len() as u64))
        }

        async fn get_range(&self, key: &str, start: u64, end: u64) -> Result<Bytes> {
            self.range_requests.lock().unwrap().push((start, end));
            let objects = self.objects.lock().unwrap();
            let body = objects
                .get(key)
                .ok_or_else(|| SourceError::ObjectMissing { key: key.to_string() })?;
            if start >= body.len() as u64 {
                return Err(SourceError::RangeNotSatisfiable {
                    key: key.to_string(),
                    range: format!("bytes={start}-{end}"),
                });
            }
            let end = end.min(body.len() as u64 - 1);
            Ok(Bytes::copy_from_slice(&body[start as usize..=end as usize]))
        }

        async fn put(&self, key: &str, file: &Path) -> Result<()> {
            let body = std::fs::read(file)?;
            self.objects.lock().unwrap().insert(key.to_string(), body);
            Ok(())
        }

        async fn list(&self, prefix: &str) -> Result<Vec<String>> {
            Ok(self
                .objects
                .lock()
                .unwrap()
                .keys()
                .filter(|k| k.starts_with(prefix))
                .cloned()
                .collect())
        }
    }

    const COMPILED: &str = "{{.Name}}/{{.Name}}-{{.Version}}-{{.StemcellOS}}-{{.StemcellVersion}}.tgz";

    fn config(template: &str, publishable: bool) -> ReleaseSourceConfig {
        ReleaseSourceConfig {
            kind: "s3".to_string(),
            bucket: "compiled-releases".to_string(),
            path_template: template.to_string(),
            publishable,
            ..ReleaseSourceConfig::default()
        }
    }

    fn compiled(name: &str, version: &str) -> ComponentSpec {
        ComponentSpec {
            stemcell_os: Some("ubuntu-jammy".to_string()),
            stemcell_version: Some("1.44".to_string()),
            ..ComponentSpec::new(name, version)
        }
    }

    #[tokio::test]
    async fn get_matched_release_heads_the_templated_key() {
        let store = MemoryStore::with_keys(&["bpm/bpm-1.1.21-ubuntu-jammy-1.44.tgz"]);
        let source = S3ReleaseSource::with_store(&config(COMPILED, false), store).unwrap();

        let lock = source.get_matched_release(&compiled("bpm", "1.1.21")).await.unwrap();
        assert_eq!(lock.remote_source, "compiled-releases");
        assert_eq!(lock.remote_path, "bpm/bpm-1.1.21-ubuntu-jammy-1.44.tgz");
        assert_eq!(lock.version, "1.1.21");

        let err = source.get_matched_release(&compiled("bpm", "1.1.22")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn built_spec_against_compiled_template_is_a_template_error() {
        let store = MemoryStore::with_keys(&[]);
        let source = S3ReleaseSource::with_store(&config(COMPILED, false), store).unwrap();

        let err = source
            .get_matched_release(&ComponentSpec::new("bpm", "1.1.21"))
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::Template(_)));
        assert!(err.to_string().contains("StemcellOS"));
    }

    #[tokio::test]
    async fn find_release_version_filters_stemcell_and_constraint() {
        let store = MemoryStore::with_keys(&[
            "bpm/bpm-1.1.19-ubuntu-jammy-1.44.tgz",
            "bpm/bpm-1.1.21-ubuntu-jammy-1.44.tgz",
            "bpm/bpm-1.1.22-ubuntu-jammy-1.50.tgz",
            "bpm/bpm-1.2.0-ubuntu-jammy-1.44.tgz",
            "bpm-extra/ignored-9.9.9.tgz",
        ]);
        let source = S3ReleaseSource::with_store(&config(COMPILED, false), store).unwrap();

        let lock = source.find_release_version(&compiled("bpm", "~1.1")).await.unwrap();
        assert_eq!(lock.version, "1.1.21");
        assert_eq!(lock.remote_path, "bpm/bpm-1.1.21-ubuntu-jammy-1.44.tgz");
        assert!(lock.sha1.is_empty());

        let err = source.find_release_version(&compiled("bpm", "~3")).await.unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn built_requirement_skips_compiled_keys() {
        let store = MemoryStore::with_keys(&[
            "bpm/bpm-1.1.21.tgz",
            "bpm/bpm-1.1.22-ubuntu-jammy-1.44.tgz",
        ]);
        let source =
            S3ReleaseSource::with_store(&config("{{.Name}}/{{.Name}}-{{.Version}}.tgz", false), store).unwrap();

        let lock = source.find_release_version(&ComponentSpec::new("bpm", "*")).await.unwrap();
        assert_eq!(lock.remote_path, "bpm/bpm-1.1.21.tgz");
        assert_eq!(lock.version, "1.1.21");

        let lock = source.find_release_version(&compiled("bpm", "*")).await.unwrap();
        assert_eq!(lock.remote_path, "bpm/bpm-1.1.22-ubuntu-jammy-1.44.tgz");
    }

    #[tokio::test]
    async fn list_prefix_keeps_product_line() {
        let store = MemoryStore::with_keys(&[]);
        let source = S3ReleaseSource::with_store(
            &config("2.11/{{.Name}}/{{.Name}}-{{.Version}}.tgz", false),
            store,
        )
        .unwrap();
        assert_eq!(source.list_prefix("bpm").unwrap(), "2.11/bpm/");
    }

    #[tokio::test]
    async fn download_reads_ranges_in_order() {
        let body: Vec<u8> = (0..100u8).collect();
        let store = MemoryStore::with_keys(&[]);
        store.insert("bpm/bpm-1.0.tgz", body.clone());
        let mut source = S3ReleaseSource::with_store(&config("{{.Name}}/{{.Name}}-{{.Version}}.tgz", false), store.clone())
            .unwrap()
            .with_part_size(30);
        source.set_download_threads(3);

        let dir = tempfile::tempdir().unwrap();
        let lock = ComponentLock {
            name: "bpm".to_string(),
            version: "1.0".to_string(),
            ..ComponentLock::default()
        }
        .with_remote("compiled-releases", "bpm/bpm-1.0.tgz");

        let local = source.download_release(dir.path(), &lock).await.unwrap();
        assert_eq!(std::fs::read(&local.local_path).unwrap(), body);
        assert_eq!(local.lock.sha1, Sha1Digest::compute(&body).as_str());

        let mut ranges = store.range_requests.lock().unwrap().clone();
        ranges.sort_unstable();
        assert_eq!(ranges, vec![(0, 29), (30, 59), (60, 89), (90, 99)]);
    }

    #[tokio::test]
    async fn download_of_vanished_object_is_object_missing() {
        let store = MemoryStore::with_keys(&[]);
        let source = S3ReleaseSource::with_store(&config(COMPILED, false), store).unwrap();
        let dir = tempfile::tempdir().unwrap();

        let lock = ComponentLock {
            name: "bpm".to_string(),
            version: "1.0".to_string(),
            ..ComponentLock::default()
        }
        .with_remote("compiled-releases", "bpm/bpm-1.0.tgz");
        let err = source.download_release(dir.path(), &lock).await.unwrap_err();
        assert!(matches!(err, SourceError::ObjectMissing { .. }));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn upload_requires_publishable() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("bpm-1.0.tgz");
        std::fs::write(&file, b"hello world").unwrap();
        let template = "{{.Name}}/{{.Name}}-{{.Version}}.tgz";

        let private = S3ReleaseSource::with_store(&config(template, false), MemoryStore::with_keys(&[])).unwrap();
        let err = private
            .upload_release(&ComponentSpec::new("bpm", "1.0"), &file)
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::NotPublishable(_)));

        let store = MemoryStore::with_keys(&[]);
        let public = S3ReleaseSource::with_store(&config(template, true), store.clone()).unwrap();
        let lock = public
            .upload_release(&ComponentSpec::new("bpm", "1.0"), &file)
            .await
            .unwrap();
        assert_eq!(lock.remote_path, "bpm/bpm-1.0.tgz");
        assert_eq!(lock.sha1, "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed");
        assert!(store.objects.lock().unwrap().contains_key("bpm/bpm-1.0.tgz"));
    }

    #[test]
    fn key_versions_splits_release_and_stemcell() {
        let pattern = Regex::new(r"[-v]\d+(\.\d+)*").unwrap();
        assert_eq!(
            key_versions(&pattern, "2.11/bpm/bpm-1.1.21-ubuntu-jammy-1.44.tgz"),
            Some(("1.1.21".to_string(), Some("1.44".to_string())))
        );
        assert_eq!(
            key_versions(&pattern, "uaa/uaa-v76.0.0.tgz"),
            Some(("76.0.0".to_string(), None))
        );
        assert_eq!(key_versions(&pattern, "bpm/README"), None);
    }
}
