//! Update-release command
use anyhow::{Context as _, Result};

use crate::GlobalArgs;
use crate::context::Context;

/// Pin `name` to `version`, download it, and rewrite the lock.
pub async fn update_release(args: GlobalArgs, name: &str, version: &str) -> Result<()> {
    let ctx = Context::load(args)?;
    let mut lock = ctx.load_lock()?;
    let fetcher = ctx.fetcher(false).await?;

    let previous = lock.find_release(name).map(|l| l.version.clone());
    let updated = fetcher
        .update_release(&mut lock, name, version)
        .await
        .with_context(|| format!("failed to update {name} to {version}"))?;
    ctx.save_lock(&lock)?;

    match previous {
        Some(previous) if previous == updated.version => {
            println!("{name} is already at {previous}; refreshed from {}", updated.remote_source);
        }
        Some(previous) => println!("updated {name} from {previous} to {}", updated.version),
        None => println!("added {name} {}", updated.version),
    }
    Ok(())
}
