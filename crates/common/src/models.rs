//! Common data models for ModelHub
//!
//! This module defines the model identity, lifecycle state and record types
//! used throughout the ModelHub system.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{Error, Result};

/// Backend a model is sourced from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelSource {
    /// Hosted model hub (Hugging Face)
    #[serde(alias = "huggingface", alias = "hf")]
    Hub,
    /// Locally-run inference daemon (Ollama)
    #[serde(alias = "ollama")]
    Daemon,
}

impl ModelSource {
    /// All known sources
    pub const ALL: [ModelSource; 2] = [ModelSource::Hub, ModelSource::Daemon];

    /// Canonical lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            ModelSource::Hub => "hub",
            ModelSource::Daemon => "daemon",
        }
    }
}

impl fmt::Display for ModelSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelSource {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "hub" | "huggingface" | "hf" => Ok(ModelSource::Hub),
            "daemon" | "ollama" => Ok(ModelSource::Daemon),
            _ => Err(Error::UnknownSource(s.to_string())),
        }
    }
}

/// Composite key identifying a model across backends
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ModelIdentity {
    /// Backend the model belongs to
    pub source: ModelSource,
    /// Backend-specific model name
    pub name: String,
}

impl ModelIdentity {
    /// Creates a new identity
    pub fn new(source: ModelSource, name: impl Into<String>) -> Self {
        Self {
            source,
            name: name.into(),
        }
    }

    /// Parses `source:name`, falling back to `default_source` for a bare name.
    ///
    /// Daemon tags contain a colon themselves (`llama3:8b`), so the prefix is
    /// only treated as a source when it parses as one.
    pub fn parse_with_default(s: &str, default_source: ModelSource) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(Error::Config("empty model identifier".to_string()));
        }

        if let Some((prefix, rest)) = s.split_once(':') {
            if let Ok(source) = prefix.parse::<ModelSource>() {
                if rest.is_empty() {
                    return Err(Error::Config(format!("missing model name in '{}'", s)));
                }
                return Ok(Self::new(source, rest));
            }
        }

        Ok(Self::new(default_source, s))
    }
}

impl fmt::Display for ModelIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.name)
    }
}

impl FromStr for ModelIdentity {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (prefix, rest) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| Error::Config(format!("expected 'source:name', got '{}'", s)))?;
        if rest.is_empty() {
            return Err(Error::Config(format!("missing model name in '{}'", s)));
        }
        Ok(Self::new(prefix.parse()?, rest))
    }
}

/// Lifecycle state of a model
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelState {
    /// Never referenced or not yet probed
    Unknown,
    /// Known but not present locally
    NotDownloaded,
    /// Download in progress
    Downloading,
    /// Artifacts present locally
    Downloaded,
    /// Load in progress
    Loading,
    /// Resident and ready for inference
    Loaded,
    /// Unload in progress
    Unloading,
    /// Removed; the record no longer exists
    Deleted,
}

impl fmt::Display for ModelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModelState::Unknown => "Unknown",
            ModelState::NotDownloaded => "NotDownloaded",
            ModelState::Downloading => "Downloading",
            ModelState::Downloaded => "Downloaded",
            ModelState::Loading => "Loading",
            ModelState::Loaded => "Loaded",
            ModelState::Unloading => "Unloading",
            ModelState::Deleted => "Deleted",
        };
        f.write_str(s)
    }
}

/// Opaque handle to a resident model, issued once per successful load
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ModelHandle {
    /// Unique handle id, never reused
    pub id: Uuid,
    /// Model the handle refers to
    pub identity: ModelIdentity,
    /// Load timestamp
    pub loaded_at: DateTime<Utc>,
}

impl ModelHandle {
    /// Issues a fresh handle for the model
    pub fn issue(identity: ModelIdentity) -> Self {
        Self {
            id: Uuid::new_v4(),
            identity,
            loaded_at: Utc::now(),
        }
    }
}

/// Progress information for a download
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DownloadProgress {
    /// Backend status line or current file
    pub status: String,
    /// Total bytes to download, when known
    pub total_bytes: Option<u64>,
    /// Bytes downloaded so far
    pub downloaded_bytes: u64,
}

impl DownloadProgress {
    /// Completion ratio in `[0, 1]`, when the total is known
    pub fn fraction(&self) -> Option<f64> {
        match self.total_bytes {
            Some(total) if total > 0 => Some((self.downloaded_bytes as f64 / total as f64).min(1.0)),
            _ => None,
        }
    }
}

/// Lifecycle record for one model
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelRecord {
    /// Model identity
    pub identity: ModelIdentity,
    /// Current lifecycle state
    pub state: ModelState,
    /// Size on disk, populated after download
    pub size_bytes: Option<u64>,
    /// Last error message
    pub last_error: Option<String>,
    /// Handle, present iff state is Loaded
    pub loaded_handle: Option<ModelHandle>,
    /// Download progress while Downloading
    pub download_progress: Option<DownloadProgress>,
    /// Timestamp of the last transition
    pub updated_at: DateTime<Utc>,
}

impl ModelRecord {
    /// Creates a record in the given state
    pub fn new(identity: ModelIdentity, state: ModelState) -> Self {
        Self {
            identity,
            state,
            size_bytes: None,
            last_error: None,
            loaded_handle: None,
            download_progress: None,
            updated_at: Utc::now(),
        }
    }

    /// Moves to a state other than Loaded, dropping the handle
    pub fn set_state(&mut self, state: ModelState) {
        debug_assert!(state != ModelState::Loaded, "use set_loaded for the Loaded state");
        self.state = state;
        self.loaded_handle = None;
        if state != ModelState::Downloading {
            self.download_progress = None;
        }
        self.updated_at = Utc::now();
    }

    /// Moves to Loaded with the given handle
    pub fn set_loaded(&mut self, handle: ModelHandle) {
        self.state = ModelState::Loaded;
        self.loaded_handle = Some(handle);
        self.download_progress = None;
        self.updated_at = Utc::now();
    }
}

/// Result of probing a backend for a model
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProbeResult {
    /// Whether the artifacts are present locally
    pub present_locally: bool,
    /// Size on disk, when present
    pub size_bytes: Option<u64>,
    /// Backend-specific metadata
    pub metadata: HashMap<String, String>,
}

impl ProbeResult {
    /// Probe result for an absent model
    pub fn absent() -> Self {
        Self::default()
    }

    /// Probe result for a present model
    pub fn present(size_bytes: u64) -> Self {
        Self {
            present_locally: true,
            size_bytes: Some(size_bytes),
            metadata: HashMap::new(),
        }
    }
}

/// Descriptive metadata about a model, as reported by its source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    /// Model identity
    pub identity: ModelIdentity,
    /// Whether the artifacts are present locally
    pub present_locally: bool,
    /// Size on disk, when present
    pub size_bytes: Option<u64>,
    /// Source-specific metadata, sorted by key
    pub metadata: BTreeMap<String, String>,
}

/// Listing entry for a model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSummary {
    /// Model identity
    pub identity: ModelIdentity,
    /// Size on disk
    pub size_bytes: Option<u64>,
    /// Lifecycle state (registry state when tracked, backend hint otherwise)
    pub state: ModelState,
    /// Last modification timestamp reported by the backend
    pub modified_at: Option<String>,
}

/// Options forwarded to the backend on inference
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct InferenceOptions {
    /// Maximum number of tokens to generate
    pub max_tokens: Option<u32>,
    /// Sampling temperature
    pub temperature: Option<f32>,
    /// Per-request timeout overriding the configured default
    #[serde(skip)]
    pub timeout: Option<Duration>,
    /// Backend-specific options passed through verbatim
    pub extra: serde_json::Map<String, serde_json::Value>,
}

/// Target of an inference call
#[derive(Debug, Clone, Copy)]
pub enum InferenceTarget<'a> {
    /// A resident model
    Handle(&'a ModelHandle),
    /// A model addressed by name (lazy-loading backends)
    Name(&'a str),
}

impl<'a> InferenceTarget<'a> {
    /// Backend model name of the target
    pub fn name(&self) -> &'a str {
        match self {
            InferenceTarget::Handle(handle) => &handle.identity.name,
            InferenceTarget::Name(name) => name,
        }
    }
}
