//! Error taxonomy shared by every release source and the aggregator.

use thiserror::Error;

use crate::path_template::TemplateError;

/// Errors returned by release sources and [`crate::ReleaseSources`].
///
/// [`SourceError::NotFound`] is not a failure: it tells the caller to try
/// another source. Check for it with [`SourceError::is_not_found`], which
/// also sees through [`SourceError::Scoped`].
#[derive(Error, Debug)]
pub enum SourceError {
    /// The source has no matching release.
    #[error("release not found")]
    NotFound,

    /// The backend answered with a status the request did not expect.
    #[error("response to {method} {url} got status {got} when {wanted} was expected")]
    UnexpectedStatus {
        /// HTTP method of the request.
        method: String,
        /// Requested URL.
        url: String,
        /// Status the caller required.
        wanted: u16,
        /// Status the backend sent.
        got: u16,
    },

    /// Downloaded bytes do not hash to the expected SHA1.
    #[error("downloaded release {path:?} had an incorrect SHA1 - expected {expected:?}, got {actual:?}")]
    HashMismatch {
        /// Artifact that failed verification (already removed).
        path: String,
        /// SHA1 recorded in the lock.
        expected: String,
        /// SHA1 of the downloaded bytes.
        actual: String,
    },

    /// Invalid or incomplete release source configuration.
    #[error("release source configuration: {0}")]
    Config(String),

    /// The path template could not be evaluated for a requirement.
    #[error("unable to evaluate path_template: {0}")]
    Template(#[from] TemplateError),

    /// A lock refers to a source id that is not configured.
    #[error("couldn't find a release source with ID {id:?}. Available choices: {available:?}")]
    UnknownSource {
        /// The requested id.
        id: String,
        /// Every configured id, in declared order.
        available: Vec<String>,
    },

    /// The object disappeared between resolution and download.
    #[error("object {key:?} does not exist")]
    ObjectMissing {
        /// Object key or URL.
        key: String,
    },

    /// The backend rejected a byte range as out of bounds.
    #[error("requested range {range} of object {key:?} is not satisfiable")]
    RangeNotSatisfiable {
        /// Object key.
        key: String,
        /// The `bytes=` range sent.
        range: String,
    },

    /// An error from one source, annotated with that source's id.
    #[error("error from release source {id:?}: {source}")]
    Scoped {
        /// Id of the source that failed.
        id: String,
        /// The source's own error.
        #[source]
        source: Box<SourceError>,
    },

    /// The upload target is not marked publishable.
    #[error("release source {0:?} is not publishable; refusing to upload")]
    NotPublishable(String),

    /// Transport-level HTTP failure.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Local filesystem failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// S3 client failure other than not-found and range errors.
    #[error("S3 error: {0}")]
    S3(String),

    /// Version or schema parsing failure.
    #[error(transparent)]
    Schema(#[from] kiln_schema::SchemaError),

    /// Anything else a source wants to report verbatim.
    #[error("{0}")]
    Other(String),
}

impl SourceError {
    /// Whether this is the not-found condition, possibly wrapped with a source id.
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::NotFound => true,
            Self::Scoped { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// Annotate this error with the id of the source that produced it.
    pub fn scoped(self, id: impl Into<String>) -> Self {
        Self::Scoped {
            id: id.into(),
            source: Box::new(self),
        }
    }

    /// Build an [`SourceError::UnexpectedStatus`] from a response.
    pub fn unexpected_status(method: &reqwest::Method, url: &str, wanted: u16, got: u16) -> Self {
        Self::UnexpectedStatus {
            method: method.to_string(),
            url: url.to_string(),
            wanted,
            got,
        }
    }
}

/// Convenience alias for source results.
pub type Result<T, E = SourceError> = std::result::Result<T, E>;
