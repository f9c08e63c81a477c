//! Resolve command
use anyhow::{Context as _, Result};

use crate::GlobalArgs;
use crate::context::Context;

/// Resolve every requirement and overwrite `Kilnfile.lock`.
pub async fn resolve(args: GlobalArgs) -> Result<()> {
    let ctx = Context::load(args)?;
    let fetcher = ctx.fetcher(false).await?;

    let lock = fetcher
        .resolve(&ctx.kilnfile)
        .await
        .context("failed to resolve Kilnfile")?;
    ctx.save_lock(&lock)?;
    println!("wrote {} ({} releases)", ctx.lock_path.display(), lock.releases.len());
    Ok(())
}
