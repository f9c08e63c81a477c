//! Shared command context.
//!
//! Loads the Kilnfile, builds its release sources, and wires a `Fetcher`
//! to the console reporter and Ctrl-C.

use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context as _, Result};
use kiln_core::{FetchOptions, Fetcher, ReleaseSources, Reporter};
use kiln_schema::{Kilnfile, KilnfileLock};
use tracing::{debug, warn};

use crate::GlobalArgs;
use crate::ui::ConsoleReporter;

/// Everything a command needs from the Kilnfile pair.
pub struct Context {
    /// Parsed Kilnfile.
    pub kilnfile: Kilnfile,
    /// Where the lock lives.
    pub lock_path: PathBuf,
    /// Global flags.
    pub args: GlobalArgs,
    /// Progress output.
    pub reporter: Arc<dyn Reporter>,
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("lock_path", &self.lock_path)
            .field("args", &self.args)
            .finish_non_exhaustive()
    }
}

impl Context {
    /// Read the Kilnfile named by `args`; loading validates it.
    pub fn load(args: GlobalArgs) -> Result<Self> {
        let kilnfile = Kilnfile::load(&args.kilnfile)
            .with_context(|| format!("failed to load {}", args.kilnfile.display()))?;
        Ok(Self {
            lock_path: crate::lock_path(&args.kilnfile),
            kilnfile,
            args,
            reporter: Arc::new(ConsoleReporter::new()),
        })
    }

    /// Read `Kilnfile.lock`.
    pub fn load_lock(&self) -> Result<KilnfileLock> {
        KilnfileLock::load(&self.lock_path)
            .with_context(|| format!("failed to load {}", self.lock_path.display()))
    }

    /// Write `Kilnfile.lock`.
    pub fn save_lock(&self, lock: &KilnfileLock) -> Result<()> {
        lock.save(&self.lock_path)
            .with_context(|| format!("failed to write {}", self.lock_path.display()))
    }

    /// Build the configured release sources, filtered by the publishable flag.
    pub async fn sources(&self) -> Result<ReleaseSources> {
        let sources = ReleaseSources::from_configs(&self.kilnfile.release_sources)
            .await
            .context("failed to configure release sources")?
            .filter(self.args.allow_only_publishable_releases);
        debug!(sources = ?sources.ids(), "release sources ready");
        Ok(sources)
    }

    /// A fetcher that stops on Ctrl-C.
    pub async fn fetcher(&self, delete_extras: bool) -> Result<Fetcher> {
        let options = FetchOptions {
            releases_dir: self.args.releases_directory.clone(),
            download_threads: self.args.download_threads,
            delete_extras,
            deadline: self.args.timeout_secs.map(Duration::from_secs),
        };
        let fetcher = Fetcher::new(self.sources().await?, options).with_reporter(Arc::clone(&self.reporter));

        let cancel = fetcher.cancel_token();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("interrupted, cancelling");
                cancel.cancel();
            }
        });
        Ok(fetcher)
    }
}
