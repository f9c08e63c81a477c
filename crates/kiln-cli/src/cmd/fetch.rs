//! Fetch command
use anyhow::{Context as _, Result};
use kiln_core::{LocalReleaseDirectory, Reporter};

use crate::GlobalArgs;
use crate::context::Context;
use crate::ui;

/// Download every locked release, then offer to delete the ones the lock
/// no longer names.
pub async fn fetch(args: GlobalArgs, no_confirm: bool) -> Result<()> {
    let ctx = Context::load(args)?;
    let lock = ctx.load_lock()?;
    let fetcher = ctx.fetcher(no_confirm).await?;

    let outcome = fetcher.fetch(&lock).await.context("failed to fetch releases")?;

    if outcome.extras.is_empty() {
        return Ok(());
    }
    println!("\nReleases in {} not in Kilnfile.lock:", ctx.args.releases_directory.display());
    for extra in &outcome.extras {
        println!("  - {} {}", extra.lock.name, extra.lock.version);
    }
    if ui::confirm("Delete these releases?")? {
        for extra in &outcome.extras {
            ctx.reporter.removing(extra);
        }
        LocalReleaseDirectory::new().delete_extra_releases(&outcome.extras)?;
    }
    Ok(())
}
