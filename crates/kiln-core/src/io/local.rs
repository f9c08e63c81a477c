//! The releases directory: tarballs already on disk from earlier fetches.

use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use kiln_schema::{ComponentLock, Sha1Digest, parse_lenient};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::error::{Result, SourceError};
use crate::sources::Local;

#[derive(Debug, Deserialize)]
struct ReleaseManifest {
    name: String,
    version: String,
}

/// Scans and prunes a directory of release tarballs.
#[derive(Debug, Clone, Default)]
pub struct LocalReleaseDirectory;

impl LocalReleaseDirectory {
    /// Create a scanner.
    pub fn new() -> Self {
        Self
    }

    /// Every `*.tgz` in `dir`, identified and hashed, sorted by path.
    ///
    /// Name and version come from the tarball's `release.MF`; tarballs
    /// without one fall back to the `{name}-{version}.tgz` file name.
    /// Files that match neither are skipped.
    pub fn get_local_releases(&self, dir: &Path) -> Result<Vec<Local>> {
        let entries = std::fs::read_dir(dir).map_err(|e| {
            SourceError::Other(format!("could not find releases in {}: {e}", dir.display()))
        })?;

        let mut paths: Vec<PathBuf> = Vec::new();
        for entry in entries {
            let path = entry?.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "tgz") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut releases = Vec::with_capacity(paths.len());
        for path in paths {
            match self.read_release(&path)? {
                Some(local) => releases.push(local),
                None => warn!(path = %path.display(), "skipping file that is not a recognizable release tarball"),
            }
        }
        Ok(releases)
    }

    /// Identify and hash a single tarball; `None` when it names no release.
    pub fn read_release(&self, path: &Path) -> Result<Option<Local>> {
        let Some((name, version)) = identify(path) else {
            return Ok(None);
        };
        let sha1 = Sha1Digest::compute_file(path)?;
        debug!(path = %path.display(), %sha1, "found local release");
        Ok(Some(Local {
            lock: ComponentLock {
                name,
                version,
                sha1: sha1.to_string(),
                ..ComponentLock::default()
            },
            local_path: path.to_path_buf(),
        }))
    }

    /// Remove releases that are no longer in the lock.
    pub fn delete_extra_releases(&self, extras: &[Local]) -> Result<()> {
        for release in extras {
            std::fs::remove_file(&release.local_path).map_err(|e| {
                SourceError::Other(format!(
                    "failed to delete release {} at {}: {e}",
                    release.lock.name,
                    release.local_path.display()
                ))
            })?;
            info!("removed release {} {}", release.lock.name, release.lock.version);
        }
        Ok(())
    }
}

fn identify(path: &Path) -> Option<(String, String)> {
    match read_manifest(path) {
        Ok(Some(manifest)) => return Some((manifest.name, manifest.version)),
        Ok(None) => {}
        Err(err) => debug!(path = %path.display(), error = %err, "no readable release.MF"),
    }
    let stem = path.file_name()?.to_str()?.strip_suffix(".tgz")?;
    split_name_version(stem)
}

fn read_manifest(path: &Path) -> std::io::Result<Option<ReleaseManifest>> {
    let mut archive = tar::Archive::new(GzDecoder::new(File::open(path)?));
    for entry in archive.entries()? {
        let mut entry = entry?;
        let entry_path = entry.path()?.into_owned();
        let is_manifest = entry_path
            .components()
            .filter(|c| !matches!(c, std::path::Component::CurDir))
            .map(|c| c.as_os_str())
            .eq([std::ffi::OsStr::new("release.MF")]);
        if !is_manifest {
            continue;
        }
        let mut text = String::new();
        entry.read_to_string(&mut text)?;
        let manifest = serde_yaml_ng::from_str(&text)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        return Ok(Some(manifest));
    }
    Ok(None)
}

/// `cf-routing-0.226.0` → (`cf-routing`, `0.226.0`): the first dash after
/// which the rest parses as a version.
fn split_name_version(stem: &str) -> Option<(String, String)> {
    stem.match_indices('-').find_map(|(index, _)| {
        let (name, version) = (&stem[..index], &stem[index + 1..]);
        (!name.is_empty() && parse_lenient(version).is_ok()).then(|| (name.to_string(), version.to_string()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::Compression;
    use flate2::write::GzEncoder;

    fn write_release_tarball(path: &Path, manifest: &str) {
        let gz = GzEncoder::new(File::create(path).unwrap(), Compression::fast());
        let mut builder = tar::Builder::new(gz);
        let mut header = tar::Header::new_gnu();
        header.set_size(manifest.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder
            .append_data(&mut header, "release.MF", manifest.as_bytes())
            .unwrap();
        builder.into_inner().unwrap().finish().unwrap();
    }

    #[test]
    fn splits_names_containing_dashes() {
        assert_eq!(
            split_name_version("cf-routing-0.226.0"),
            Some(("cf-routing".to_string(), "0.226.0".to_string()))
        );
        assert_eq!(
            split_name_version("bpm-1.2.3-rc.1"),
            Some(("bpm".to_string(), "1.2.3-rc.1".to_string()))
        );
        assert_eq!(split_name_version("README"), None);
    }

    #[test]
    fn reads_manifest_then_falls_back_to_file_name() {
        let dir = tempfile::tempdir().unwrap();
        write_release_tarball(
            &dir.path().join("renamed.tgz"),
            "name: uaa\nversion: \"76.0.0\"\ncommit_hash: abc123\n",
        );
        std::fs::write(dir.path().join("bpm-1.1.21.tgz"), b"hello world").unwrap();
        std::fs::write(dir.path().join("notes.txt"), b"ignored").unwrap();
        std::fs::write(dir.path().join("junk.tgz"), b"ignored").unwrap();

        let releases = LocalReleaseDirectory::new().get_local_releases(dir.path()).unwrap();
        let found: Vec<(&str, &str)> = releases
            .iter()
            .map(|r| (r.lock.name.as_str(), r.lock.version.as_str()))
            .collect();
        assert_eq!(found, vec![("bpm", "1.1.21"), ("uaa", "76.0.0")]);
        assert_eq!(releases[0].lock.sha1, "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed");
    }

    #[test]
    fn missing_directory_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = LocalReleaseDirectory::new()
            .get_local_releases(&dir.path().join("nope"))
            .unwrap_err();
        assert!(err.to_string().contains("could not find releases"));
    }

    #[test]
    fn deletes_extras() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bpm-1.0.0.tgz");
        std::fs::write(&path, b"x").unwrap();

        let extra = Local {
            lock: ComponentLock {
                name: "bpm".to_string(),
                version: "1.0.0".to_string(),
                ..ComponentLock::default()
            },
            local_path: path.clone(),
        };
        LocalReleaseDirectory::new().delete_extra_releases(&[extra]).unwrap();
        assert!(!path.exists());
    }
}
