use std::path::PathBuf;

/// Errors raised while reading or validating kiln data files.
#[derive(thiserror::Error, Debug)]
pub enum SchemaError {
    /// The YAML document could not be parsed or produced.
    #[error("failed to parse {path}: {source}")]
    Yaml {
        /// File being read or written.
        path: PathBuf,
        /// Underlying parser error.
        #[source]
        source: serde_yaml_ng::Error,
    },

    /// Filesystem failure while reading or writing a kiln file.
    #[error("IO error on {path}: {source}")]
    Io {
        /// File being read or written.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A version string is not a (lenient) semantic version.
    #[error("invalid version {0:?}: expected a semantic version like 1.2.3")]
    InvalidVersion(String),

    /// A version constraint string could not be parsed.
    #[error("invalid version constraint {input:?}: {reason}")]
    InvalidConstraint {
        /// The raw constraint text.
        input: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A SHA1 digest is not 40 hex characters.
    #[error("invalid SHA1 digest {0:?}: expected 40 hex characters")]
    InvalidDigest(String),

    /// A component requirement without a name.
    #[error("release at index {0} has an empty name")]
    EmptyName(usize),
}
