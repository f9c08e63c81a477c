//! kiln - fetch and pin the BOSH releases a tile is built from.
//!
//! The `Kilnfile` declares release requirements and where to look for them;
//! `Kilnfile.lock` pins each release to a version, source and SHA1. The
//! commands here read that pair, build the release sources, and hand the
//! work to `kiln_core`.

pub mod cmd;
pub mod context;
pub mod ui;

use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};

/// Command-line interface.
#[derive(Debug, Parser)]
#[command(name = "kiln")]
#[command(author, version, about = "kiln - fetch and pin BOSH releases")]
pub struct Cli {
    /// Options shared by every command.
    #[command(flatten)]
    pub global: GlobalArgs,

    /// What to do.
    #[command(subcommand)]
    pub command: Commands,
}

/// Flags accepted before or after any subcommand.
#[derive(Debug, Clone, Args)]
pub struct GlobalArgs {
    /// Path to the Kilnfile; the lock is read from `<kilnfile>.lock`
    #[arg(long, global = true, env = "KILN_KILNFILE", default_value = "Kilnfile")]
    pub kilnfile: PathBuf,

    /// Directory holding release tarballs
    #[arg(long, global = true, default_value = "releases")]
    pub releases_directory: PathBuf,

    /// Concurrent downloads (and ranged reads per S3 object)
    #[arg(long, global = true, default_value_t = 4)]
    pub download_threads: usize,

    /// Ignore release sources that are not marked publishable
    #[arg(long, global = true)]
    pub allow_only_publishable_releases: bool,

    /// Give up after this many seconds
    #[arg(long, global = true)]
    pub timeout_secs: Option<u64>,
}

/// Subcommands.
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Download every release in Kilnfile.lock into the releases directory
    Fetch {
        /// Delete releases not in the lock without asking
        #[arg(long)]
        no_confirm: bool,
    },
    /// Print the newest release version satisfying the Kilnfile
    FindReleaseVersion {
        /// Release name
        #[arg(long)]
        release: String,
    },
    /// Pin one release to an exact version and download it
    UpdateRelease {
        /// Release name
        #[arg(long)]
        name: String,
        /// Exact version to pin
        #[arg(long)]
        version: String,
    },
    /// Resolve every Kilnfile requirement and rewrite Kilnfile.lock
    Resolve,
    /// Upload a release tarball to a publishable release source
    UploadRelease {
        /// Id of the release source to upload to
        #[arg(long)]
        upload_target_id: String,
        /// Release tarball to upload
        #[arg(long)]
        local_path: PathBuf,
    },
}

/// `Kilnfile` → `Kilnfile.lock`, next to it.
pub fn lock_path(kilnfile: &std::path::Path) -> PathBuf {
    let mut path = kilnfile.as_os_str().to_owned();
    path.push(".lock");
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_path_appends_suffix() {
        assert_eq!(lock_path(std::path::Path::new("Kilnfile")), PathBuf::from("Kilnfile.lock"));
        assert_eq!(
            lock_path(std::path::Path::new("tile/Kilnfile")),
            PathBuf::from("tile/Kilnfile.lock")
        );
    }

    #[test]
    fn parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "kiln",
            "fetch",
            "--kilnfile",
            "tile/Kilnfile",
            "--download-threads",
            "8",
            "--no-confirm",
        ])
        .unwrap();
        assert_eq!(cli.global.kilnfile, PathBuf::from("tile/Kilnfile"));
        assert_eq!(cli.global.download_threads, 8);
        assert!(matches!(cli.command, Commands::Fetch { no_confirm: true }));
    }

    #[test]
    fn update_release_requires_name_and_version() {
        assert!(Cli::try_parse_from(["kiln", "update-release", "--name", "uaa"]).is_err());
        let cli = Cli::try_parse_from(["kiln", "update-release", "--name", "uaa", "--version", "75.0"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::UpdateRelease { ref name, ref version } if name == "uaa" && version == "75.0"
        ));
    }
}
