//! Release-source resolution and fetch engine.
//!
//! A [`ReleaseSources`] holds the configured backends (S3 buckets, bosh.io,
//! GitHub organizations) in declared order and answers "which source has
//! the best match for this requirement". [`Fetcher`] drives it over a whole
//! Kilnfile: resolving a lock, downloading what the lock names, and
//! verifying every tarball's SHA1.

pub mod error;
pub mod fetch;
pub mod io;
pub mod multi;
pub mod path_template;
pub mod reporter;
pub mod sources;

pub use error::{Result, SourceError};
pub use fetch::{FetchError, FetchOptions, FetchOutcome, FetchPlan, Fetcher};
pub use io::local::LocalReleaseDirectory;
pub use multi::ReleaseSources;
pub use path_template::{PathTemplate, TemplateError};
pub use reporter::{NullReporter, Reporter};
pub use sources::{Local, ReleaseSource, ReleaseUploader};

/// User Agent string for outgoing HTTP requests
pub const USER_AGENT: &str = concat!("kiln/", env!("CARGO_PKG_VERSION"));
