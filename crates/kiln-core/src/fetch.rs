//! Drives the release sources over a whole Kilnfile: resolve requirements
//! into a lock, fetch what the lock names into the releases directory, and
//! re-pin a single release.
//!
//! Work runs on a `JoinSet` bounded by a semaphore of `download_threads`
//! permits. The whole call tree can be cut short by the cancellation token
//! or by the optional deadline; either way in-flight requests are dropped
//! and their staged files are removed.

use std::collections::HashSet;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use kiln_schema::{ComponentLock, ComponentSpec, Kilnfile, KilnfileLock, SchemaError};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::SourceError;
use crate::io::local::LocalReleaseDirectory;
use crate::multi::ReleaseSources;
use crate::reporter::{NullReporter, Reporter};
use crate::sources::Local;

/// Failures of whole-Kilnfile operations.
#[derive(Error, Debug)]
pub enum FetchError {
    /// One release failed; the source error says why.
    #[error("release {name} {version}: {source}")]
    Release {
        /// Release name.
        name: String,
        /// Requested or locked version.
        version: String,
        /// Underlying failure.
        #[source]
        source: SourceError,
    },

    /// No source has a release matching the requirement.
    #[error("couldn't find {name} {version} in any release source")]
    NotFound {
        /// Release name.
        name: String,
        /// Requested version or constraint.
        version: String,
    },

    /// `update-release` was asked about a release the lock does not have.
    #[error("no release named {0:?} exists in the Kilnfile.lock")]
    NotInLock(String),

    /// The deadline expired before the operation finished.
    #[error("operation did not finish within {0:?}")]
    DeadlineExceeded(Duration),

    /// The operation was cancelled.
    #[error("operation cancelled")]
    Cancelled,

    /// A worker task panicked or was aborted.
    #[error("worker task failed: {0}")]
    Join(#[from] tokio::task::JoinError),

    /// Failure not tied to one release.
    #[error(transparent)]
    Source(#[from] SourceError),

    /// Kilnfile or lock file problem.
    #[error(transparent)]
    Schema(#[from] SchemaError),
}

impl FetchError {
    fn release(name: &str, version: &str, source: SourceError) -> Self {
        if source.is_not_found() {
            return Self::NotFound {
                name: name.to_string(),
                version: version.to_string(),
            };
        }
        Self::Release {
            name: name.to_string(),
            version: version.to_string(),
            source,
        }
    }
}

/// Knobs for [`Fetcher`].
#[derive(Debug, Clone)]
pub struct FetchOptions {
    /// Where release tarballs live.
    pub releases_dir: PathBuf,
    /// Concurrent downloads (and ranged reads per S3 download).
    pub download_threads: usize,
    /// Delete releases that are not in the lock without asking.
    pub delete_extras: bool,
    /// Upper bound on the whole operation.
    pub deadline: Option<Duration>,
}

impl Default for FetchOptions {
    fn default() -> Self {
        Self {
            releases_dir: PathBuf::from("releases"),
            download_threads: crate::sources::s3::DEFAULT_DOWNLOAD_THREADS,
            delete_extras: false,
            deadline: None,
        }
    }
}

/// Result of [`Fetcher::fetch`].
#[derive(Debug, Clone, Default)]
pub struct FetchOutcome {
    /// Every locked release on disk, in lock order.
    pub locals: Vec<Local>,
    /// How many of those were downloaded by this call.
    pub downloaded: usize,
    /// Releases on disk that the lock does not mention (not yet deleted).
    pub extras: Vec<Local>,
}

/// How the lock compares with the releases directory.
#[derive(Debug, Clone, Default)]
pub struct FetchPlan {
    /// Lock entries already on disk with the right checksum, by lock index.
    pub satisfied: Vec<(usize, Local)>,
    /// Lock entries that must be downloaded, by lock index.
    pub missing: Vec<(usize, ComponentLock)>,
    /// Files on disk that no lock entry wants.
    pub extras: Vec<Local>,
}

fn satisfies(local: &Local, lock: &ComponentLock) -> bool {
    local.lock.name == lock.name
        && local.lock.version == lock.version
        && (lock.sha1.is_empty() || local.lock.sha1.eq_ignore_ascii_case(&lock.sha1))
}

/// Match lock entries against what is already on disk.
pub fn plan(lock: &KilnfileLock, releases_dir: &std::path::Path, locals: Vec<Local>) -> FetchPlan {
    let mut plan = FetchPlan::default();
    let mut used = vec![false; locals.len()];

    for (index, wanted) in lock.releases.iter().enumerate() {
        match locals.iter().position(|l| satisfies(l, wanted)) {
            Some(pos) => {
                used[pos] = true;
                plan.satisfied.push((index, locals[pos].clone()));
            }
            None => plan.missing.push((index, wanted.clone())),
        }
    }

    // A stale file at a path about to be downloaded is replaced, not deleted.
    let targets: HashSet<PathBuf> = plan
        .missing
        .iter()
        .map(|(_, l)| releases_dir.join(l.tarball_name()))
        .collect();
    plan.extras = locals
        .into_iter()
        .zip(used)
        .filter(|(local, used)| !used && !targets.contains(&local.local_path))
        .map(|(local, _)| local)
        .collect();
    plan
}

/// Runs resolve/fetch/update over a set of release sources.
pub struct Fetcher {
    sources: Arc<ReleaseSources>,
    local: LocalReleaseDirectory,
    options: FetchOptions,
    reporter: Arc<dyn Reporter>,
    cancel: CancellationToken,
}

impl std::fmt::Debug for Fetcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fetcher")
            .field("sources", &self.sources.ids())
            .field("options", &self.options)
            .finish_non_exhaustive()
    }
}

impl Fetcher {
    /// Create a fetcher; download threads are pushed down to the sources.
    pub fn new(mut sources: ReleaseSources, options: FetchOptions) -> Self {
        sources.set_download_threads(options.download_threads);
        Self {
            sources: Arc::new(sources),
            local: LocalReleaseDirectory::new(),
            options,
            reporter: Arc::new(NullReporter),
            cancel: CancellationToken::new(),
        }
    }

    /// Send progress events somewhere.
    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Token that aborts whatever the fetcher is doing when cancelled.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The sources this fetcher resolves against.
    pub fn sources(&self) -> &ReleaseSources {
        &self.sources
    }

    /// Make sure every locked release is in the releases directory.
    ///
    /// Each download is checked against the lock's SHA1; a mismatch removes
    /// the file and fails the fetch.
    pub async fn fetch(&self, lock: &KilnfileLock) -> Result<FetchOutcome, FetchError> {
        self.with_deadline(self.fetch_inner(lock)).await
    }

    async fn fetch_inner(&self, lock: &KilnfileLock) -> Result<FetchOutcome, FetchError> {
        let started = Instant::now();
        let dir = self.options.releases_dir.clone();
        tokio::fs::create_dir_all(&dir).await.map_err(SourceError::from)?;

        let local = self.local.clone();
        let scan_dir = dir.clone();
        let locals = tokio::task::spawn_blocking(move || local.get_local_releases(&scan_dir)).await??;
        let FetchPlan {
            satisfied,
            missing,
            mut extras,
        } = plan(lock, &dir, locals);
        info!(
            satisfied = satisfied.len(),
            missing = missing.len(),
            extra = extras.len(),
            "compared Kilnfile.lock with {}",
            dir.display()
        );

        if self.options.delete_extras && !extras.is_empty() {
            for extra in &extras {
                self.reporter.removing(extra);
            }
            self.local.delete_extra_releases(&extras)?;
            extras.clear();
        }

        self.reporter.section("Downloading");
        let downloaded = missing.len();
        let jobs = missing.into_iter().map(|(index, wanted)| {
            let sources = Arc::clone(&self.sources);
            let reporter = Arc::clone(&self.reporter);
            let dir = dir.clone();
            async move {
                reporter.downloading(&wanted);
                match download_verified(&sources, &dir, &wanted).await {
                    Ok(local) => {
                        reporter.done(&local);
                        Ok((index, local))
                    }
                    Err(err) => {
                        reporter.failed(&wanted.name, &wanted.version, &err.to_string());
                        Err(FetchError::release(&wanted.name, &wanted.version, err))
                    }
                }
            }
        });
        let fetched = self.run_bounded(jobs).await?;

        let mut locals: Vec<(usize, Local)> = satisfied.into_iter().chain(fetched).collect();
        locals.sort_by_key(|(index, _)| *index);

        self.reporter
            .summary(downloaded, "download", started.elapsed().as_secs_f64());
        Ok(FetchOutcome {
            locals: locals.into_iter().map(|(_, local)| local).collect(),
            downloaded,
            extras,
        })
    }

    /// Resolve every Kilnfile requirement into a lock, in requirement order.
    ///
    /// Releases whose source cannot report a checksum are downloaded into a
    /// scratch directory so one can be computed.
    pub async fn resolve(&self, kilnfile: &Kilnfile) -> Result<KilnfileLock, FetchError> {
        self.with_deadline(self.resolve_inner(kilnfile)).await
    }

    async fn resolve_inner(&self, kilnfile: &Kilnfile) -> Result<KilnfileLock, FetchError> {
        let started = Instant::now();
        let scratch = Arc::new(tempfile::tempdir().map_err(SourceError::from)?);
        self.reporter.section("Resolving");

        let specs = kilnfile.specs();
        let count = specs.len();
        let jobs = specs.into_iter().map(|spec| {
            let sources = Arc::clone(&self.sources);
            let reporter = Arc::clone(&self.reporter);
            let scratch = Arc::clone(&scratch);
            async move {
                let result = async {
                    let found = sources.find_release_version(&spec).await?;
                    debug!(release = %spec, version = %found.version, source = %found.remote_source, "resolved");
                    with_checksum(&sources, scratch.path(), found).await
                }
                .await;
                result.map_err(|err| {
                    reporter.failed(&spec.name, &spec.version, &err.to_string());
                    FetchError::release(&spec.name, &spec.version, err)
                })
            }
        });
        let releases = self.run_bounded(jobs).await?;

        self.reporter
            .summary(count, "resolve", started.elapsed().as_secs_f64());
        Ok(KilnfileLock {
            releases,
            stemcell: kilnfile.stemcell_criteria.clone(),
        })
    }

    /// Pin `name` to exactly `version`, download it, and update `lock`.
    pub async fn update_release(
        &self,
        lock: &mut KilnfileLock,
        name: &str,
        version: &str,
    ) -> Result<ComponentLock, FetchError> {
        if lock.find_release(name).is_none() {
            return Err(FetchError::NotInLock(name.to_string()));
        }
        let spec = ComponentSpec::new(name, version).with_stemcell(&lock.stemcell);
        let updated = self.with_deadline(self.update_inner(&spec)).await?;
        lock.upsert(updated.clone());
        Ok(updated)
    }

    async fn update_inner(&self, spec: &ComponentSpec) -> Result<ComponentLock, FetchError> {
        let wrap = |err: SourceError| FetchError::release(&spec.name, &spec.version, err);
        let dir = self.options.releases_dir.clone();
        tokio::fs::create_dir_all(&dir).await.map_err(SourceError::from)?;

        let found = self.cancellable(self.sources.get_matched_release(spec)).await?.map_err(wrap)?;
        self.reporter.downloading(&found);
        let local = self
            .cancellable(download_verified(&self.sources, &dir, &found))
            .await?
            .map_err(wrap)?;
        self.reporter.done(&local);

        info!(
            "updated {} to {} from release source {}",
            local.lock.name, local.lock.version, local.lock.remote_source
        );
        Ok(local.lock)
    }

    async fn cancellable<F: Future>(&self, fut: F) -> Result<F::Output, FetchError> {
        tokio::select! {
            biased;
            () = self.cancel.cancelled() => Err(FetchError::Cancelled),
            output = fut => Ok(output),
        }
    }

    async fn with_deadline<T, F>(&self, fut: F) -> Result<T, FetchError>
    where
        F: Future<Output = Result<T, FetchError>>,
    {
        match self.options.deadline {
            Some(deadline) => tokio::time::timeout(deadline, fut)
                .await
                .map_err(|_| FetchError::DeadlineExceeded(deadline))?,
            None => fut.await,
        }
    }

    /// Run jobs with at most `download_threads` in flight, returning their
    /// outputs in job order. The first failure aborts the rest.
    async fn run_bounded<T, I, F>(&self, jobs: I) -> Result<Vec<T>, FetchError>
    where
        T: Send + 'static,
        I: IntoIterator<Item = F>,
        F: Future<Output = Result<T, FetchError>> + Send + 'static,
    {
        let semaphore = Arc::new(Semaphore::new(self.options.download_threads.max(1)));
        let mut set: JoinSet<Result<(usize, T), FetchError>> = JoinSet::new();

        for (index, job) in jobs.into_iter().enumerate() {
            let semaphore = Arc::clone(&semaphore);
            let cancel = self.cancel.clone();
            set.spawn(async move {
                let _permit = semaphore.acquire_owned().await.map_err(|_| FetchError::Cancelled)?;
                tokio::select! {
                    biased;
                    () = cancel.cancelled() => Err(FetchError::Cancelled),
                    output = job => output.map(|value| (index, value)),
                }
            });
        }

        let mut slots: Vec<Option<T>> = std::iter::repeat_with(|| None).take(set.len()).collect();
        while let Some(joined) = set.join_next().await {
            match joined? {
                Ok((index, value)) => slots[index] = Some(value),
                Err(err) => {
                    set.shutdown().await;
                    return Err(err);
                }
            }
        }
        Ok(slots.into_iter().flatten().collect())
    }
}

/// Download through the aggregator and check the result against the lock.
async fn download_verified(
    sources: &ReleaseSources,
    dir: &std::path::Path,
    wanted: &ComponentLock,
) -> Result<Local, SourceError> {
    let local = sources.download_release(dir, wanted).await?;
    if !wanted.sha1.is_empty() && !local.lock.sha1.eq_ignore_ascii_case(&wanted.sha1) {
        warn!(path = %local.local_path.display(), "removing release with unexpected checksum");
        if let Err(err) = tokio::fs::remove_file(&local.local_path).await {
            warn!(path = %local.local_path.display(), error = %err, "could not remove corrupt release");
        }
        return Err(SourceError::HashMismatch {
            path: local.local_path.display().to_string(),
            expected: wanted.sha1.clone(),
            actual: local.lock.sha1,
        });
    }
    Ok(local)
}

/// Fill in a missing SHA1 by downloading into `scratch`.
async fn with_checksum(
    sources: &ReleaseSources,
    scratch: &std::path::Path,
    found: ComponentLock,
) -> Result<ComponentLock, SourceError> {
    if !found.sha1.is_empty() {
        return Ok(found);
    }
    let local = sources.download_release(scratch, &found).await?;
    if let Err(err) = tokio::fs::remove_file(&local.local_path).await {
        debug!(path = %local.local_path.display(), error = %err, "scratch release not removed");
    }
    Ok(found.with_sha1(local.lock.sha1))
}
