//! `Kilnfile` and `Kilnfile.lock` documents.

use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::types::{ComponentLock, ComponentSpec, Stemcell};
use crate::SchemaError;

/// Backend kind of a configured release source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceKind {
    /// S3 or an S3-compatible object store.
    S3,
    /// The public bosh.io release index.
    BoshIo,
    /// GitHub releases of an organization.
    GitHub,
}

impl SourceKind {
    /// Value used for the `type` key in a Kilnfile.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::S3 => "s3",
            Self::BoshIo => "bosh.io",
            Self::GitHub => "github",
        }
    }
}

impl std::str::FromStr for SourceKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "s3" => Ok(Self::S3),
            "bosh.io" => Ok(Self::BoshIo),
            "github" => Ok(Self::GitHub),
            other => Err(format!(
                "unknown release source type {other:?}; expected one of \"s3\", \"bosh.io\", \"github\""
            )),
        }
    }
}

impl std::fmt::Display for SourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry of `release_sources` in a Kilnfile.
///
/// `kind` is kept as the raw string so that an unknown type is reported by
/// the source factory with the rest of the configuration errors.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseSourceConfig {
    /// `s3`, `bosh.io`, or `github`.
    #[serde(rename = "type")]
    pub kind: String,
    /// Explicit id; see [`ReleaseSourceConfig::id`] for the default.
    #[serde(default, rename = "id", skip_serializing_if = "String::is_empty")]
    pub explicit_id: String,
    /// Whether releases from this source may ship, and whether it accepts uploads.
    #[serde(default)]
    pub publishable: bool,
    /// S3 bucket.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub bucket: String,
    /// S3 region.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub region: String,
    /// S3 access key id.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub access_key_id: String,
    /// S3 secret access key.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub secret_access_key: String,
    /// Template producing the object key for a release.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub path_template: String,
    /// Endpoint override for S3-compatible stores.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub endpoint: String,
    /// GitHub organization.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub org: String,
    /// GitHub API token.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub github_token: String,
}

impl ReleaseSourceConfig {
    /// The source id: explicit when set, otherwise derived from the type.
    pub fn id(&self) -> String {
        if !self.explicit_id.is_empty() {
            return self.explicit_id.clone();
        }
        match self.kind.parse::<SourceKind>() {
            Ok(SourceKind::BoshIo) => SourceKind::BoshIo.as_str().to_string(),
            Ok(SourceKind::S3) => self.bucket.clone(),
            Ok(SourceKind::GitHub) => self.org.clone(),
            Err(_) => String::new(),
        }
    }
}

/// The declared input: where releases may come from and which are required.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Kilnfile {
    /// Ordered source list; order is resolution precedence.
    #[serde(default)]
    pub release_sources: Vec<ReleaseSourceConfig>,
    /// Ordered requirements.
    #[serde(default)]
    pub releases: Vec<ComponentSpec>,
    /// Target stemcell for compiled releases.
    #[serde(default)]
    pub stemcell_criteria: Stemcell,
}

impl Kilnfile {
    /// Read and validate a Kilnfile.
    pub fn load(path: &Path) -> Result<Self, SchemaError> {
        let kilnfile: Self = read_yaml(path)?;
        kilnfile.validate()?;
        Ok(kilnfile)
    }

    /// Check invariants that do not need network access.
    pub fn validate(&self) -> Result<(), SchemaError> {
        for (index, release) in self.releases.iter().enumerate() {
            if release.name.trim().is_empty() {
                return Err(SchemaError::EmptyName(index));
            }
        }
        Ok(())
    }

    /// Find a requirement by name.
    pub fn find_release(&self, name: &str) -> Option<&ComponentSpec> {
        self.releases.iter().find(|r| r.name == name)
    }

    /// Requirements with the stemcell criteria applied, in declared order.
    pub fn specs(&self) -> Vec<ComponentSpec> {
        self.releases
            .iter()
            .map(|r| r.clone().with_stemcell(&self.stemcell_criteria))
            .collect()
    }
}

/// The resolved output: one lock per release, in requirement order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct KilnfileLock {
    /// Resolved releases.
    #[serde(default)]
    pub releases: Vec<ComponentLock>,
    /// Stemcell the releases were resolved for.
    #[serde(default, alias = "stemcell_criteria")]
    pub stemcell: Stemcell,
}

impl KilnfileLock {
    /// Read a lock file.
    pub fn load(path: &Path) -> Result<Self, SchemaError> {
        read_yaml(path)
    }

    /// Write the lock file atomically (temp file in the same directory, then rename).
    pub fn save(&self, path: &Path) -> Result<(), SchemaError> {
        let yaml = serde_yaml_ng::to_string(self).map_err(|source| SchemaError::Yaml {
            path: path.to_path_buf(),
            source,
        })?;

        let io_err = |source| SchemaError::Io {
            path: path.to_path_buf(),
            source,
        };
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
        let mut tmp = tempfile::NamedTempFile::new_in(&dir).map_err(io_err)?;
        tmp.write_all(yaml.as_bytes()).map_err(io_err)?;
        tmp.persist(path).map_err(|e| io_err(e.error))?;
        Ok(())
    }

    /// Find a lock by release name.
    pub fn find_release(&self, name: &str) -> Option<&ComponentLock> {
        self.releases.iter().find(|r| r.name == name)
    }

    /// Replace the lock with the same name, or append it.
    pub fn upsert(&mut self, lock: ComponentLock) {
        match self.releases.iter_mut().find(|r| r.name == lock.name) {
            Some(existing) => *existing = lock,
            None => self.releases.push(lock),
        }
    }
}

fn read_yaml<T: DeserializeOwned>(path: &Path) -> Result<T, SchemaError> {
    let text = std::fs::read_to_string(path).map_err(|source| SchemaError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_yaml_ng::from_str(&text).map_err(|source| SchemaError::Yaml {
        path: path.to_path_buf(),
        source,
    })
}
