use serde::{Deserialize, Serialize};

/// The OS image releases may be compiled against.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stemcell {
    /// Operating system name (e.g. `ubuntu-jammy`).
    #[serde(default)]
    pub os: String,
    /// Stemcell version or version constraint.
    #[serde(default)]
    pub version: String,
}

impl Stemcell {
    /// Whether both fields are set.
    pub fn is_set(&self) -> bool {
        !self.os.is_empty() && !self.version.is_empty()
    }
}

/// A declared requirement: which release is wanted, and how strictly.
///
/// `version` may be an exact version or a constraint; connectors decide
/// which interpretation applies to the call. The stemcell fields are only
/// populated when a *compiled* release is being matched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentSpec {
    /// BOSH release name.
    pub name: String,

    /// Exact version or constraint string.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub version: String,

    /// GitHub repository URL or `owner/repo` the release is published from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub github_repository: Option<String>,

    /// Target stemcell OS for compiled releases.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stemcell_os: Option<String>,

    /// Target stemcell version for compiled releases.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stemcell_version: Option<String>,
}

impl ComponentSpec {
    /// Build a spec for a built (stemcell-independent) release.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            ..Self::default()
        }
    }

    /// Target a specific stemcell, turning this into a compiled-release spec.
    pub fn with_stemcell(mut self, stemcell: &Stemcell) -> Self {
        if stemcell.is_set() {
            self.stemcell_os = Some(stemcell.os.clone());
            self.stemcell_version = Some(stemcell.version.clone());
        }
        self
    }

    /// Drop the stemcell fields (for sources that only serve built releases).
    pub fn unset_stemcell(mut self) -> Self {
        self.stemcell_os = None;
        self.stemcell_version = None;
        self
    }

    /// Whether this spec describes a compiled release.
    pub fn is_compiled(&self) -> bool {
        self.stemcell_os.is_some() || self.stemcell_version.is_some()
    }

    /// Start a lock for this spec; the remote fields are still empty.
    pub fn lock(&self) -> ComponentLock {
        ComponentLock {
            name: self.name.clone(),
            version: self.version.clone(),
            ..ComponentLock::default()
        }
    }
}

impl std::fmt::Display for ComponentSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.name, self.version)?;
        if let (Some(os), Some(version)) = (&self.stemcell_os, &self.stemcell_version) {
            write!(f, " ({os}/{version})")?;
        }
        Ok(())
    }
}

/// The resolved record for one release.
///
/// `sha1` may be empty while a lock is still being resolved (for sources
/// that cannot report a checksum without downloading the artifact).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComponentLock {
    /// BOSH release name.
    pub name: String,
    /// Exact resolved version.
    pub version: String,
    /// Hex SHA1 of the release tarball.
    #[serde(default)]
    pub sha1: String,
    /// Id of the release source holding the tarball.
    #[serde(default)]
    pub remote_source: String,
    /// Source-specific object key or URL.
    #[serde(default)]
    pub remote_path: String,
}

impl ComponentLock {
    /// Attach the source that holds this release.
    pub fn with_remote(mut self, source_id: impl Into<String>, path: impl Into<String>) -> Self {
        self.remote_source = source_id.into();
        self.remote_path = path.into();
        self
    }

    /// Attach a checksum.
    pub fn with_sha1(mut self, sha1: impl Into<String>) -> Self {
        self.sha1 = sha1.into();
        self
    }

    /// The deterministic local file name for this release.
    pub fn tarball_name(&self) -> String {
        format!("{}-{}.tgz", self.name, self.version)
    }

    /// Recover the requirement that pins exactly this lock.
    pub fn spec(&self) -> ComponentSpec {
        ComponentSpec::new(&self.name, &self.version)
    }
}

impl std::fmt::Display for ComponentLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.name, self.version)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn with_stemcell_ignores_partial_criteria() {
        let spec = ComponentSpec::new("bpm", "1.2.3").with_stemcell(&Stemcell {
            os: "ubuntu-jammy".to_string(),
            version: String::new(),
        });
        assert!(!spec.is_compiled());
    }

    #[test]
    fn lock_carries_name_and_version() {
        let lock = ComponentSpec::new("bpm", "1.2.3")
            .lock()
            .with_remote("bosh.io", "https://bosh.io/d/github.com/cloudfoundry/bpm-release?v=1.2.3");
        assert_eq!(lock.name, "bpm");
        assert_eq!(lock.version, "1.2.3");
        assert_eq!(lock.remote_source, "bosh.io");
        assert_eq!(lock.tarball_name(), "bpm-1.2.3.tgz");
    }
}
