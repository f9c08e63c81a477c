//! Fetcher behavior against a stub source that serves deterministic bodies.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use kiln_core::{FetchError, FetchOptions, Fetcher, Local, ReleaseSource, ReleaseSources, SourceError};
use kiln_schema::{ComponentLock, ComponentSpec, Kilnfile, KilnfileLock, Sha1Digest, SourceKind, Stemcell};

fn body(name: &str, version: &str) -> String {
    format!("{name}-{version} tarball")
}

fn sha_of(name: &str, version: &str) -> String {
    Sha1Digest::compute(body(name, version).as_bytes()).to_string()
}

/// Serves `body(name, version)` for anything asked of it.
#[derive(Debug, Default)]
struct StubSource {
    delay: Option<Duration>,
    downloads: Arc<AtomicUsize>,
}

#[async_trait]
impl ReleaseSource for StubSource {
    fn id(&self) -> &str {
        "stub"
    }

    fn kind(&self) -> SourceKind {
        SourceKind::BoshIo
    }

    fn publishable(&self) -> bool {
        false
    }

    async fn get_matched_release(&self, spec: &ComponentSpec) -> Result<ComponentLock, SourceError> {
        if spec.name == "missing" {
            return Err(SourceError::NotFound);
        }
        Ok(spec
            .lock()
            .with_remote("stub", format!("/{}", spec.name))
            .with_sha1(sha_of(&spec.name, &spec.version)))
    }

    async fn find_release_version(&self, spec: &ComponentSpec) -> Result<ComponentLock, SourceError> {
        if spec.name == "missing" {
            return Err(SourceError::NotFound);
        }
        // Checksum left blank, like a bucket listing.
        Ok(ComponentSpec::new(spec.name.clone(), "2.0")
            .lock()
            .with_remote("stub", format!("/{}", spec.name)))
    }

    async fn download_release(&self, dir: &Path, lock: &ComponentLock) -> Result<Local, SourceError> {
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.downloads.fetch_add(1, Ordering::SeqCst);
        let local_path = dir.join(lock.tarball_name());
        let content = body(&lock.name, &lock.version);
        tokio::fs::write(&local_path, &content).await?;
        Ok(Local {
            lock: lock.clone().with_sha1(Sha1Digest::compute(content.as_bytes()).to_string()),
            local_path,
        })
    }
}

fn locked(name: &str, version: &str, sha1: &str) -> ComponentLock {
    ComponentSpec::new(name, version)
        .lock()
        .with_remote("stub", format!("/{name}"))
        .with_sha1(sha1)
}

fn fetcher(dir: &Path, source: StubSource, deadline: Option<Duration>) -> Fetcher {
    let sources = ReleaseSources::new(vec![Box::new(source) as Box<dyn ReleaseSource>]);
    Fetcher::new(
        sources,
        FetchOptions {
            releases_dir: dir.to_path_buf(),
            download_threads: 2,
            delete_extras: false,
            deadline,
        },
    )
}

#[tokio::test]
async fn fetch_downloads_only_what_is_missing() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("bpm-1.0.tgz"), body("bpm", "1.0")).unwrap();
    std::fs::write(dir.path().join("old-0.1.tgz"), "stale").unwrap();

    let source = StubSource::default();
    let downloads = Arc::clone(&source.downloads);
    let lock = KilnfileLock {
        releases: vec![
            locked("uaa", "74.0", &sha_of("uaa", "74.0")),
            locked("bpm", "1.0", &sha_of("bpm", "1.0")),
        ],
        stemcell: Stemcell::default(),
    };

    let outcome = fetcher(dir.path(), source, None).fetch(&lock).await.unwrap();

    assert_eq!(downloads.load(Ordering::SeqCst), 1);
    assert_eq!(outcome.downloaded, 1);
    let names: Vec<&str> = outcome.locals.iter().map(|l| l.lock.name.as_str()).collect();
    assert_eq!(names, vec!["uaa", "bpm"]);
    assert_eq!(outcome.extras.len(), 1);
    assert_eq!(outcome.extras[0].lock.name, "old");
    assert!(dir.path().join("old-0.1.tgz").exists());
}

#[tokio::test]
async fn fetch_deletes_extras_when_asked() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("old-0.1.tgz"), "stale").unwrap();

    let fetcher = Fetcher::new(
        ReleaseSources::new(vec![Box::new(StubSource::default()) as Box<dyn ReleaseSource>]),
        FetchOptions {
            releases_dir: dir.path().to_path_buf(),
            delete_extras: true,
            ..FetchOptions::default()
        },
    )
    .with_reporter(Arc::new(kiln_core::NullReporter));
    let lock = KilnfileLock {
        releases: vec![locked("uaa", "74.0", "")],
        stemcell: Stemcell::default(),
    };

    let outcome = fetcher.fetch(&lock).await.unwrap();
    assert!(outcome.extras.is_empty());
    assert!(!dir.path().join("old-0.1.tgz").exists());
    assert!(dir.path().join("uaa-74.0.tgz").exists());
}

#[tokio::test]
async fn checksum_mismatch_fails_and_removes_file() {
    let dir = tempfile::tempdir().unwrap();
    let lock = KilnfileLock {
        releases: vec![locked("uaa", "74.0", &"0".repeat(40))],
        stemcell: Stemcell::default(),
    };

    let err = fetcher(dir.path(), StubSource::default(), None)
        .fetch(&lock)
        .await
        .unwrap_err();

    match err {
        FetchError::Release { name, source, .. } => {
            assert_eq!(name, "uaa");
            assert!(matches!(source, SourceError::HashMismatch { .. }), "{source}");
        }
        other => panic!("unexpected error: {other}"),
    }
    assert!(!dir.path().join("uaa-74.0.tgz").exists());
}

#[tokio::test]
async fn deadline_cuts_fetch_short() {
    let dir = tempfile::tempdir().unwrap();
    let source = StubSource {
        delay: Some(Duration::from_secs(30)),
        ..StubSource::default()
    };
    let lock = KilnfileLock {
        releases: vec![locked("uaa", "74.0", "")],
        stemcell: Stemcell::default(),
    };

    let err = fetcher(dir.path(), source, Some(Duration::from_millis(50)))
        .fetch(&lock)
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::DeadlineExceeded(_)), "{err}");
}

#[tokio::test]
async fn cancelled_token_stops_fetch() {
    let dir = tempfile::tempdir().unwrap();
    let source = StubSource {
        delay: Some(Duration::from_secs(30)),
        ..StubSource::default()
    };
    let fetcher = fetcher(dir.path(), source, None);
    fetcher.cancel_token().cancel();
    let lock = KilnfileLock {
        releases: vec![locked("uaa", "74.0", "")],
        stemcell: Stemcell::default(),
    };

    let err = fetcher.fetch(&lock).await.unwrap_err();
    assert!(matches!(err, FetchError::Cancelled), "{err}");
}

#[tokio::test]
async fn resolve_fills_in_missing_checksums() {
    let dir = tempfile::tempdir().unwrap();
    let kilnfile = Kilnfile {
        releases: vec![ComponentSpec::new("uaa", "*"), ComponentSpec::new("bpm", "*")],
        ..Kilnfile::default()
    };

    let lock = fetcher(dir.path(), StubSource::default(), None)
        .resolve(&kilnfile)
        .await
        .unwrap();

    assert_eq!(lock.releases.len(), 2);
    assert_eq!(lock.releases[0].name, "uaa");
    assert_eq!(lock.releases[0].version, "2.0");
    assert_eq!(lock.releases[0].sha1, sha_of("uaa", "2.0"));
    assert_eq!(lock.releases[1].name, "bpm");
    // Scratch downloads never land in the releases directory.
    assert!(std::fs::read_dir(dir.path()).unwrap().next().is_none());
}

#[tokio::test]
async fn resolve_reports_unresolvable_release() {
    let dir = tempfile::tempdir().unwrap();
    let kilnfile = Kilnfile {
        releases: vec![ComponentSpec::new("missing", "*")],
        ..Kilnfile::default()
    };

    let err = fetcher(dir.path(), StubSource::default(), None)
        .resolve(&kilnfile)
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::NotFound { ref name, .. } if name == "missing"), "{err}");
}

#[tokio::test]
async fn update_release_pins_and_downloads() {
    let dir = tempfile::tempdir().unwrap();
    let mut lock = KilnfileLock {
        releases: vec![locked("uaa", "74.0", &sha_of("uaa", "74.0"))],
        stemcell: Stemcell::default(),
    };

    let updated = fetcher(dir.path(), StubSource::default(), None)
        .update_release(&mut lock, "uaa", "75.0")
        .await
        .unwrap();

    assert_eq!(updated.version, "75.0");
    assert_eq!(lock.releases.len(), 1);
    assert_eq!(lock.releases[0].version, "75.0");
    assert_eq!(lock.releases[0].sha1, sha_of("uaa", "75.0"));
    assert!(dir.path().join("uaa-75.0.tgz").exists());
}

#[tokio::test]
async fn update_release_rejects_unknown_names() {
    let dir = tempfile::tempdir().unwrap();
    let mut lock = KilnfileLock::default();

    let err = fetcher(dir.path(), StubSource::default(), None)
        .update_release(&mut lock, "uaa", "75.0")
        .await
        .unwrap_err();
    assert!(matches!(err, FetchError::NotInLock(ref name) if name == "uaa"));
}
