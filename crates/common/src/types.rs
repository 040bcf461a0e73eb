//! Common types for ModelHub
//!
//! This module defines the progress sink capability consumed by the backend
//! managers and the per-source availability report.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::models::{DownloadProgress, ModelIdentity, ModelSource};
use crate::utils::format_bytes;

/// Receiver of download progress events
pub trait ProgressSink: Send + Sync {
    /// Called whenever the backend reports progress
    fn on_progress(&self, identity: &ModelIdentity, progress: &DownloadProgress);
}

/// Shared progress sink
pub type SharedProgressSink = Arc<dyn ProgressSink>;

/// Progress sink that records progress as debug events
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingProgressSink;

impl ProgressSink for TracingProgressSink {
    fn on_progress(&self, identity: &ModelIdentity, progress: &DownloadProgress) {
        debug!(
            model = %identity,
            status = %progress.status,
            downloaded = %format_bytes(progress.downloaded_bytes),
            total = %progress.total_bytes.map(format_bytes).unwrap_or_else(|| "?".to_string()),
            percent = ?progress.fraction().map(|f| (f * 100.0).round()),
            "download progress"
        );
    }
}

/// Availability of one backend source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceStatus {
    /// Source
    pub source: ModelSource,
    /// Whether the backend is reachable
    pub available: bool,
}
