//! File downloader
//!
//! This module streams remote files to disk with progress tracking,
//! SHA-256 verification and cancellation. It is shared by the managers
//! that fetch artifacts over plain HTTP.

use std::path::Path;
use std::time::{Duration, Instant};

use futures::StreamExt;
use reqwest::{Client, StatusCode};
use sha2::{Digest, Sha256};
use tokio::fs::File;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use common::error::{DownloadError, Error, Result};
use common::models::{DownloadProgress, ModelIdentity};
use common::types::ProgressSink;
use common::utils::format_bytes;

/// Minimum interval between two progress events
const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// Aggregated progress over all files of one model download
pub struct ProgressTracker<'a> {
    /// Model being downloaded
    identity: ModelIdentity,

    /// Receiver of progress events
    sink: &'a dyn ProgressSink,

    /// Current progress
    progress: DownloadProgress,

    /// Time of the last emitted event
    last_emit: Option<Instant>,
}

impl<'a> ProgressTracker<'a> {
    /// Creates a tracker for a download of `total_bytes` (if known)
    pub fn new(identity: ModelIdentity, sink: &'a dyn ProgressSink, total_bytes: Option<u64>) -> Self {
        Self {
            identity,
            sink,
            progress: DownloadProgress {
                status: "starting".to_string(),
                total_bytes,
                downloaded_bytes: 0,
            },
            last_emit: None,
        }
    }

    /// Sets the status line and emits immediately
    pub fn set_status(&mut self, status: impl Into<String>) {
        self.progress.status = status.into();
        self.emit();
    }

    /// Replaces the byte counters, as reported by a backend that tracks them itself
    pub fn set_counts(&mut self, downloaded_bytes: u64, total_bytes: Option<u64>) {
        self.progress.downloaded_bytes = downloaded_bytes;
        if total_bytes.is_some() {
            self.progress.total_bytes = total_bytes;
        }
        self.maybe_emit();
    }

    /// Adds freshly received bytes
    pub fn advance(&mut self, bytes: u64) {
        self.progress.downloaded_bytes += bytes;
        self.maybe_emit();
    }

    /// Emits the final state
    pub fn finish(&mut self) {
        self.progress.status = "complete".to_string();
        self.emit();
    }

    /// Current progress
    pub fn progress(&self) -> &DownloadProgress {
        &self.progress
    }

    fn maybe_emit(&mut self) {
        let due = self
            .last_emit
            .map_or(true, |last| last.elapsed() >= PROGRESS_INTERVAL);
        if due {
            self.emit();
        }
    }

    fn emit(&mut self) {
        self.sink.on_progress(&self.identity, &self.progress);
        self.last_emit = Some(Instant::now());
    }
}

/// Streams files to disk
#[derive(Clone)]
pub struct FileDownloader {
    /// HTTP client
    client: Client,

    /// Bearer token sent with every request
    token: Option<String>,
}

impl FileDownloader {
    /// Creates a downloader sharing the given client
    pub fn new(client: Client, token: Option<String>) -> Self {
        Self { client, token }
    }

    /// Downloads `url` to `dest` and returns the number of bytes written.
    ///
    /// The partial file is removed on failure or cancellation.
    pub async fn fetch(
        &self,
        url: &str,
        dest: &Path,
        expected_sha256: Option<&str>,
        tracker: &mut ProgressTracker<'_>,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let result = self.fetch_inner(url, dest, expected_sha256, tracker, cancel).await;

        if result.is_err() {
            let _ = tokio::fs::remove_file(dest).await;
        }

        result
    }

    async fn fetch_inner(
        &self,
        url: &str,
        dest: &Path,
        expected_sha256: Option<&str>,
        tracker: &mut ProgressTracker<'_>,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        // Create parent directory if it doesn't exist
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(map_io_error)?;
        }

        let mut request = self.client.get(url);
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let resp = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled.into()),
            resp = request.send() => resp.map_err(map_reqwest_error)?,
        };

        match resp.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND | StatusCode::UNAUTHORIZED => {
                return Err(DownloadError::NotFound(url.to_string()).into());
            }
            status => {
                return Err(DownloadError::Network(format!("HTTP {} for {}", status, url)).into());
            }
        }

        let mut file = File::create(dest).await.map_err(map_io_error)?;

        // Create hasher if we need to verify checksum
        let mut hasher = expected_sha256.map(|_| Sha256::new());

        let mut stream = resp.bytes_stream();
        let mut written = 0u64;

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DownloadError::Cancelled.into()),
                chunk = stream.next() => chunk,
            };

            let Some(chunk) = chunk else { break };
            let chunk = chunk.map_err(map_reqwest_error)?;

            file.write_all(&chunk).await.map_err(map_io_error)?;

            if let Some(hasher) = hasher.as_mut() {
                hasher.update(&chunk);
            }

            written += chunk.len() as u64;
            tracker.advance(chunk.len() as u64);
        }

        // Flush and close file
        file.flush().await.map_err(map_io_error)?;
        drop(file);

        if let (Some(hasher), Some(expected)) = (hasher, expected_sha256) {
            let actual = hex::encode(hasher.finalize());

            if !actual.eq_ignore_ascii_case(expected) {
                return Err(DownloadError::ChecksumMismatch {
                    file: dest.display().to_string(),
                    expected: expected.to_string(),
                    actual,
                }
                .into());
            }

            debug!("Checksum verification passed for {}", dest.display());
        }

        debug!("Downloaded {} ({})", url, format_bytes(written));

        Ok(written)
    }
}

/// Maps a transport error to a download error
pub fn map_reqwest_error(err: reqwest::Error) -> Error {
    DownloadError::Network(err.to_string()).into()
}

/// Maps a local IO error, singling out a full disk
pub fn map_io_error(err: std::io::Error) -> Error {
    // ENOSPC on Linux and macOS
    const ENOSPC: i32 = 28;

    if err.raw_os_error() == Some(ENOSPC) {
        DownloadError::DiskSpace(err.to_string()).into()
    } else {
        err.into()
    }
}
