//! Streaming downloads with the SHA1 computed in the same pass as the write.
//!
//! Bytes land in a hidden temp file beside the destination and are renamed
//! to their final name only once the stream has completed and, when a
//! checksum is already known, verified. Dropping a [`StagedFile`] (including
//! when the surrounding future is cancelled) removes the temp file, so a
//! partial artifact is never visible under its final name.

use std::path::{Path, PathBuf};

use futures::StreamExt;
use kiln_schema::Sha1Digest;
use reqwest::{Client, Method, StatusCode};
use sha1::{Digest, Sha1};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tracing::debug;

use crate::error::{Result, SourceError};

/// An in-progress download that has not been given its final name yet.
#[derive(Debug)]
pub struct StagedFile {
    file: File,
    path: tempfile::TempPath,
    hasher: Sha1,
    written: u64,
}

impl StagedFile {
    /// Create a staging file in `dir` for an artifact that will be called `file_name`.
    pub fn create(dir: &Path, file_name: &str) -> Result<Self> {
        let tmp = tempfile::Builder::new()
            .prefix(&format!(".{file_name}."))
            .suffix(".partial")
            .tempfile_in(dir)?;
        let (file, path) = tmp.into_parts();
        Ok(Self {
            file: File::from_std(file),
            path,
            hasher: Sha1::new(),
            written: 0,
        })
    }

    /// Append bytes, feeding the hasher with the same slice.
    pub async fn write_chunk(&mut self, chunk: &[u8]) -> Result<()> {
        self.file.write_all(chunk).await?;
        self.hasher.update(chunk);
        self.written += chunk.len() as u64;
        Ok(())
    }

    /// Drain a response body into the staging file.
    pub async fn write_response(&mut self, response: reqwest::Response) -> Result<()> {
        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            self.write_chunk(&chunk?).await?;
        }
        Ok(())
    }

    /// Number of bytes written so far.
    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Flush, optionally verify, and move the file to `dest`.
    ///
    /// When `expected` is non-empty and differs from the computed SHA1 the
    /// staged file is deleted and [`SourceError::HashMismatch`] is returned.
    pub async fn finish(mut self, dest: &Path, expected: Option<&str>) -> Result<(PathBuf, Sha1Digest)> {
        self.file.flush().await?;
        self.file.sync_all().await?;

        let Self {
            file, path, hasher, ..
        } = self;
        drop(file);

        let actual = Sha1Digest::from_hasher(hasher);
        if let Some(expected) = expected.filter(|e| !e.is_empty()) {
            if actual != *expected {
                return Err(SourceError::HashMismatch {
                    path: dest.display().to_string(),
                    expected: expected.to_string(),
                    actual: actual.to_string(),
                });
            }
        }

        path.persist(dest).map_err(|e| SourceError::Io(e.error))?;
        Ok((dest.to_path_buf(), actual))
    }
}

/// Map a response status to the taxonomy, passing through `200 OK`.
pub fn check_status(response: reqwest::Response, method: &Method) -> Result<reqwest::Response> {
    let url = response.url().to_string();
    match response.status() {
        StatusCode::OK => Ok(response),
        StatusCode::NOT_FOUND => Err(SourceError::ObjectMissing { key: url }),
        StatusCode::RANGE_NOT_SATISFIABLE => Err(SourceError::RangeNotSatisfiable {
            key: url,
            range: String::from("*"),
        }),
        other => Err(SourceError::unexpected_status(
            method,
            &url,
            StatusCode::OK.as_u16(),
            other.as_u16(),
        )),
    }
}

/// GET `url` (following redirects) into `dir/file_name`.
///
/// Returns the final path and the SHA1 of the bytes written there.
pub async fn download_url(
    client: &Client,
    url: &str,
    bearer: Option<&str>,
    dir: &Path,
    file_name: &str,
    expected_sha1: Option<&str>,
) -> Result<(PathBuf, Sha1Digest)> {
    debug!(url, file_name, "GET");

    let mut request = client.get(url).header(reqwest::header::USER_AGENT, crate::USER_AGENT);
    if let Some(token) = bearer.filter(|t| !t.is_empty()) {
        request = request.bearer_auth(token);
    }
    let response = check_status(request.send().await?, &Method::GET)?;

    let mut staged = StagedFile::create(dir, file_name)?;
    staged.write_response(response).await?;
    staged.finish(&dir.join(file_name), expected_sha1).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn finish_persists_and_hashes() {
        let dir = tempfile::tempdir().unwrap();
        let mut staged = StagedFile::create(dir.path(), "bpm-1.0.tgz").unwrap();
        staged.write_chunk(b"hello ").await.unwrap();
        staged.write_chunk(b"world").await.unwrap();
        assert_eq!(staged.bytes_written(), 11);

        let (path, sha1) = staged
            .finish(&dir.path().join("bpm-1.0.tgz"), None)
            .await
            .unwrap();
        assert_eq!(sha1.as_str(), "2aae6c35c94fcfb415dbe95f408b9ce91ee846ed");
        assert_eq!(std::fs::read(&path).unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn mismatch_leaves_nothing_behind() {
        let dir = tempfile::tempdir().unwrap();
        let mut staged = StagedFile::create(dir.path(), "bpm-1.0.tgz").unwrap();
        staged.write_chunk(b"corrupt").await.unwrap();

        let err = staged
            .finish(
                &dir.path().join("bpm-1.0.tgz"),
                Some("2aae6c35c94fcfb415dbe95f408b9ce91ee846ed"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, SourceError::HashMismatch { .. }));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn dropped_stage_is_removed() {
        let dir = tempfile::tempdir().unwrap();
        {
            let mut staged = StagedFile::create(dir.path(), "bpm-1.0.tgz").unwrap();
            staged.write_chunk(b"partial").await.unwrap();
        }
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn download_url_maps_missing_objects() {
        let mut server = mockito::Server::new_async().await;
        let _m = server
            .mock("GET", "/gone.tgz")
            .with_status(404)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let err = download_url(
            &Client::new(),
            &format!("{}/gone.tgz", server.url()),
            None,
            dir.path(),
            "gone.tgz",
            None,
        )
        .await
        .unwrap_err();
        assert!(matches!(err, SourceError::ObjectMissing { .. }));
        assert!(!dir.path().join("gone.tgz").exists());
    }
}
