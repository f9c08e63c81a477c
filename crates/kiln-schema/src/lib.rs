//! Shared types and file formats for kiln.
//!
//! Everything here is plain data: the declared requirements (`Kilnfile`),
//! the resolved outcome (`Kilnfile.lock`), release-source configuration,
//! SHA1 identities, and the lenient version rules used to compare BOSH
//! release versions.

pub mod error;
pub mod hash;
pub mod kilnfile;
pub mod types;
pub mod version;

// Re-exports
pub use error::SchemaError;
pub use hash::*;
pub use kilnfile::{Kilnfile, KilnfileLock, ReleaseSourceConfig, SourceKind};
pub use types::*;
pub use version::{VersionConstraint, compare_versions, parse_lenient};
