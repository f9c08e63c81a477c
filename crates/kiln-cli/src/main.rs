//! kiln - fetch and pin BOSH releases

use anyhow::Result;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use kiln_cli::cmd;
use kiln_cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let args = cli.global;

    match cli.command {
        Commands::Fetch { no_confirm } => cmd::fetch::fetch(args, no_confirm).await,
        Commands::FindReleaseVersion { release } => {
            cmd::find_release_version::find_release_version(args, &release).await
        }
        Commands::UpdateRelease { name, version } => {
            cmd::update_release::update_release(args, &name, &version).await
        }
        Commands::Resolve => cmd::resolve::resolve(args).await,
        Commands::UploadRelease {
            upload_target_id,
            local_path,
        } => cmd::upload_release::upload_release(args, &upload_target_id, &local_path).await,
    }
}
