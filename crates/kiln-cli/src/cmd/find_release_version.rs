//! Find-release-version command
use anyhow::{Context as _, Result};
use kiln_schema::{ComponentLock, ComponentSpec};
use serde::Serialize;

use crate::GlobalArgs;
use crate::context::Context;

/// What gets printed, as JSON.
#[derive(Debug, Serialize)]
pub struct ReleaseVersionOutput {
    /// Resolved version.
    pub version: String,
    /// Source-specific path or URL.
    pub remote_path: String,
    /// Id of the source holding it.
    pub source: String,
    /// SHA1, when the source reports one.
    pub sha: String,
}

impl From<ComponentLock> for ReleaseVersionOutput {
    fn from(lock: ComponentLock) -> Self {
        Self {
            version: lock.version,
            remote_path: lock.remote_path,
            source: lock.remote_source,
            sha: lock.sha1,
        }
    }
}

/// Print the newest version of `release` the Kilnfile allows.
///
/// Releases missing from the Kilnfile are looked up without a constraint.
pub async fn find_release_version(args: GlobalArgs, release: &str) -> Result<()> {
    let ctx = Context::load(args)?;
    let spec = ctx
        .kilnfile
        .find_release(release)
        .cloned()
        .unwrap_or_else(|| ComponentSpec::new(release, ""))
        .with_stemcell(&ctx.kilnfile.stemcell_criteria);

    let sources = ctx.sources().await?;
    let found = sources
        .find_release_version(&spec)
        .await
        .with_context(|| format!("failed to find a version of {release}"))?;

    println!("{}", serde_json::to_string(&ReleaseVersionOutput::from(found))?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_uses_short_keys() {
        let lock = ComponentSpec::new("bpm", "1.1.20")
            .lock()
            .with_remote("bosh.io", "https://bosh.io/d/github.com/cloudfoundry/bpm-release?v=1.1.20")
            .with_sha1("abc");
        let json = serde_json::to_value(ReleaseVersionOutput::from(lock)).unwrap();
        assert_eq!(json["version"], "1.1.20");
        assert_eq!(json["source"], "bosh.io");
        assert_eq!(json["sha"], "abc");
    }
}
