//! One module per subcommand.

pub mod fetch;
pub mod find_release_version;
pub mod resolve;
pub mod update_release;
pub mod upload_release;
