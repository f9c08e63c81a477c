//! Upload-release command
use anyhow::{Context as _, Result, bail};
use kiln_core::LocalReleaseDirectory;
use tracing::info;

use crate::GlobalArgs;
use crate::context::Context;

/// Upload a release tarball to the publishable source `target_id`.
pub async fn upload_release(args: GlobalArgs, target_id: &str, local_path: &std::path::Path) -> Result<()> {
    let ctx = Context::load(args)?;
    let sources = ctx.sources().await?;
    let uploader = sources.find_release_uploader(target_id)?;

    let Some(local) = LocalReleaseDirectory::new()
        .read_release(local_path)
        .with_context(|| format!("failed to read {}", local_path.display()))?
    else {
        bail!(
            "{} is neither a release tarball with a release.MF nor named <name>-<version>.tgz",
            local_path.display()
        );
    };

    let spec = local.lock.spec();
    let remote_path = uploader.remote_path(&spec)?;
    info!(release = %spec, target = target_id, %remote_path, "uploading release");

    let lock = uploader
        .upload_release(&spec, local_path)
        .await
        .with_context(|| format!("failed to upload {spec} to {target_id}"))?;
    println!("uploaded {} {} to {} ({})", lock.name, lock.version, lock.remote_path, lock.sha1);
    Ok(())
}
