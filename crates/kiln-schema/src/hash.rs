use serde::{Deserialize, Deserializer, Serialize};
use sha1::{Digest, Sha1};
use std::io::Read;

use crate::SchemaError;

/// A validated SHA1 digest (40 lowercase hex characters).
///
/// BOSH release tarballs are identified by SHA1 in both the bosh.io API and
/// `Kilnfile.lock`, so this is the identity every downloaded artifact is
/// checked against.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct Sha1Digest(String);

impl Sha1Digest {
    /// Create a new `Sha1Digest`, validating the input.
    ///
    /// Accepts strings with or without a `sha1:` prefix and normalizes to
    /// lowercase.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::InvalidDigest`] if the hex portion is not
    /// exactly 40 ASCII hex characters.
    pub fn new(s: impl Into<String>) -> Result<Self, SchemaError> {
        let s = s.into();
        let hex = s.strip_prefix("sha1:").unwrap_or(&s);

        if hex.len() != 40 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(SchemaError::InvalidDigest(s));
        }

        Ok(Self(hex.to_lowercase()))
    }

    /// Wrap a finished hasher.
    pub fn from_hasher(hasher: Sha1) -> Self {
        Self(hex::encode(hasher.finalize()))
    }

    /// Compute the SHA1 of an in-memory buffer.
    pub fn compute(data: &[u8]) -> Self {
        let mut hasher = Sha1::new();
        hasher.update(data);
        Self::from_hasher(hasher)
    }

    /// Compute the SHA1 of a file, streaming it in fixed-size blocks.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the file cannot be read.
    pub fn compute_file(path: &std::path::Path) -> std::io::Result<Self> {
        let mut file = std::fs::File::open(path)?;
        let mut hasher = Sha1::new();
        let mut buffer = [0u8; 8192];
        loop {
            let count = file.read(&mut buffer)?;
            if count == 0 {
                break;
            }
            hasher.update(&buffer[..count]);
        }
        Ok(Self::from_hasher(hasher))
    }

    /// Get the digest as a string slice
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<'de> Deserialize<'de> for Sha1Digest {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::new(s).map_err(serde::de::Error::custom)
    }
}

impl std::fmt::Display for Sha1Digest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl AsRef<str> for Sha1Digest {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl PartialEq<str> for Sha1Digest {
    fn eq(&self, other: &str) -> bool {
        self.0.eq_ignore_ascii_case(other)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn compute_matches_known_digest() {
        let digest = Sha1Digest::compute(b"hello world");
        assert_eq!(digest.as_str(), "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed");
    }

    #[test]
    fn new_accepts_prefix_and_uppercase() {
        let digest = Sha1Digest::new("sha1:2AAE6C35C94FCFB415DBE95F408B9CE91EE846ED").unwrap();
        assert_eq!(digest.as_str(), "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed");
    }

    #[test]
    fn new_rejects_wrong_length() {
        assert!(matches!(
            Sha1Digest::new("abc123"),
            Err(SchemaError::InvalidDigest(_))
        ));
    }

    #[test]
    fn compute_file_matches_compute() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        std::fs::write(&path, vec![7u8; 20_000]).unwrap();

        let from_file = Sha1Digest::compute_file(&path).unwrap();
        assert_eq!(from_file, Sha1Digest::compute(&[7u8; 20_000]));
    }
}
