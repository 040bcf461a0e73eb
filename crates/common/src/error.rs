//! Error types for the common crate
//!
//! This module defines the error taxonomy shared by the backend managers,
//! the process supervisor and the orchestration service. Every error is
//! `Clone` so that the outcome of a coalesced operation can be handed to
//! every waiter.

use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::models::{ModelIdentity, ModelState};

/// Result type for ModelHub operations
pub type Result<T> = std::result::Result<T, Error>;

/// Broad classification of an error, used by callers to decide whether to
/// retry, fix configuration or report a state conflict
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Fatal at startup (unknown source, missing daemon binary)
    Configuration,
    /// Network, disk or timeout trouble; the caller may retry
    Transient,
    /// Operation is invalid for the current lifecycle state
    StateConflict,
    /// Disk space or memory exhaustion
    Resource,
    /// The referenced model or artifact does not exist
    NotFound,
    /// The request itself is malformed
    InvalidInput,
    /// The operation was cancelled by a caller
    Cancelled,
    /// Bug or unexpected condition
    Internal,
}

/// Download failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DownloadError {
    /// Network failure while talking to the backend
    #[error("network error: {0}")]
    Network(String),

    /// Not enough disk space for the artifacts
    #[error("not enough disk space: {0}")]
    DiskSpace(String),

    /// The backend does not know the model
    #[error("model not found: {0}")]
    NotFound(String),

    /// Downloaded content does not match the advertised digest
    #[error("checksum mismatch for {file}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        /// File that failed verification
        file: String,
        /// Expected digest
        expected: String,
        /// Computed digest
        actual: String,
    },

    /// The download was cancelled
    #[error("download cancelled")]
    Cancelled,
}

/// Load failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LoadError {
    /// Not enough memory to make the model resident
    #[error("resources exhausted: {0}")]
    ResourceExhausted(String),

    /// Artifacts exist but cannot be served by this backend
    #[error("incompatible model: {0}")]
    Incompatible(String),

    /// The model has not been downloaded
    #[error("model is not downloaded: {0}")]
    NotDownloaded(String),
}

/// Unload failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum UnloadError {
    /// The handle was already released
    #[error("model already unloaded: {0}")]
    AlreadyUnloaded(String),

    /// The model is not in the Loaded state
    #[error("model is not loaded: {0}")]
    NotLoaded(String),
}

/// Inference failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InferenceError {
    /// The backend did not answer in time
    #[error("inference timed out after {0:?}")]
    Timeout(Duration),

    /// The backend could not be reached
    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    /// The backend rejected the prompt or options
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

/// Delete failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeleteError {
    /// The model is still loaded
    #[error("model is in use: {0}")]
    InUse(String),

    /// Nothing to delete
    #[error("model not found: {0}")]
    NotFound(String),
}

/// Daemon installation failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InstallError {
    /// The installer lacks the required permissions
    #[error("permission denied: {0}")]
    Permission(String),

    /// The installer could not be fetched
    #[error("network error: {0}")]
    Network(String),

    /// Automatic installation is not available on this platform
    #[error("unsupported platform: {0}")]
    UnsupportedPlatform(String),
}

/// Daemon start failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StartError {
    /// A process this supervisor does not own already serves the endpoint
    #[error("daemon already running at {0}")]
    AlreadyRunning(String),

    /// The daemon port is taken by an unrelated process
    #[error("port in use: {0}")]
    PortInUse(String),

    /// The daemon binary could not be found
    #[error("daemon binary missing: {0}")]
    BinaryMissing(String),

    /// The daemon did not become healthy within the startup timeout
    #[error("daemon did not become healthy within {0:?}")]
    Timeout(Duration),

    /// The process could not be spawned
    #[error("failed to spawn daemon: {0}")]
    Spawn(String),
}

/// Daemon stop failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StopError {
    /// There is no supervised daemon process
    #[error("daemon is not running")]
    NotRunning,
}

/// Common error type for ModelHub operations
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// IO error
    #[error("IO error: {0}")]
    Io(Arc<std::io::Error>),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// No manager is registered for the source
    #[error("Unknown model source: {0}")]
    UnknownSource(String),

    /// Download error
    #[error(transparent)]
    Download(#[from] DownloadError),

    /// Load error
    #[error(transparent)]
    Load(#[from] LoadError),

    /// Unload error
    #[error(transparent)]
    Unload(#[from] UnloadError),

    /// Inference error
    #[error(transparent)]
    Inference(#[from] InferenceError),

    /// Delete error
    #[error(transparent)]
    Delete(#[from] DeleteError),

    /// Install error
    #[error(transparent)]
    Install(#[from] InstallError),

    /// Start error
    #[error(transparent)]
    Start(#[from] StartError),

    /// Stop error
    #[error(transparent)]
    Stop(#[from] StopError),

    /// Operation invalid for the model's current lifecycle state
    #[error("cannot {operation} {identity} while {state}")]
    StateConflict {
        /// Model the operation targeted
        identity: ModelIdentity,
        /// Operation name
        operation: &'static str,
        /// State the model was in
        state: ModelState,
    },

    /// Another lifecycle operation is already in flight for the model
    #[error("{operation} rejected: {in_flight} already in progress for {identity}")]
    Conflict {
        /// Model the operation targeted
        identity: ModelIdentity,
        /// Rejected operation
        operation: &'static str,
        /// Operation holding the token
        in_flight: &'static str,
    },

    /// Backend error annotated with the model it concerns
    #[error("{identity}: {source}")]
    Model {
        /// Model the operation targeted
        identity: ModelIdentity,
        /// Underlying error
        #[source]
        source: Box<Error>,
    },

    /// Supervisor error annotated with daemon context
    #[error("daemon: {source}")]
    Daemon {
        /// Underlying error
        #[source]
        source: Box<Error>,
    },

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::Io(Arc::new(err))
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl Error {
    /// Wraps the error with the model it concerns
    pub fn for_model(self, identity: &ModelIdentity) -> Self {
        match self {
            // Already carries its own context
            Error::Model { .. } | Error::StateConflict { .. } | Error::Conflict { .. } => self,
            other => Error::Model {
                identity: identity.clone(),
                source: Box::new(other),
            },
        }
    }

    /// Wraps the error with daemon context
    pub fn for_daemon(self) -> Self {
        match self {
            Error::Daemon { .. } => self,
            other => Error::Daemon {
                source: Box::new(other),
            },
        }
    }

    /// Returns the innermost error, stripping model/daemon annotations
    pub fn root(&self) -> &Error {
        match self {
            Error::Model { source, .. } | Error::Daemon { source } => source.root(),
            other => other,
        }
    }

    /// Classifies the error
    pub fn kind(&self) -> ErrorKind {
        match self.root() {
            Error::Io(_) | Error::Http(_) => ErrorKind::Transient,
            Error::Serialization(_) | Error::Internal(_) => ErrorKind::Internal,
            Error::Config(_) | Error::UnknownSource(_) => ErrorKind::Configuration,
            Error::StateConflict { .. } | Error::Conflict { .. } => ErrorKind::StateConflict,
            Error::Download(e) => match e {
                DownloadError::Network(_) | DownloadError::ChecksumMismatch { .. } => ErrorKind::Transient,
                DownloadError::DiskSpace(_) => ErrorKind::Resource,
                DownloadError::NotFound(_) => ErrorKind::NotFound,
                DownloadError::Cancelled => ErrorKind::Cancelled,
            },
            Error::Load(e) => match e {
                LoadError::ResourceExhausted(_) => ErrorKind::Resource,
                LoadError::Incompatible(_) => ErrorKind::InvalidInput,
                LoadError::NotDownloaded(_) => ErrorKind::StateConflict,
            },
            Error::Unload(_) => ErrorKind::StateConflict,
            Error::Inference(e) => match e {
                InferenceError::Timeout(_) | InferenceError::BackendUnavailable(_) => ErrorKind::Transient,
                InferenceError::InvalidInput(_) => ErrorKind::InvalidInput,
            },
            Error::Delete(e) => match e {
                DeleteError::InUse(_) => ErrorKind::StateConflict,
                DeleteError::NotFound(_) => ErrorKind::NotFound,
            },
            Error::Install(e) => match e {
                InstallError::Network(_) => ErrorKind::Transient,
                InstallError::Permission(_) | InstallError::UnsupportedPlatform(_) => {
                    ErrorKind::Configuration
                }
            },
            Error::Start(e) => match e {
                StartError::BinaryMissing(_) => ErrorKind::Configuration,
                StartError::AlreadyRunning(_) | StartError::PortInUse(_) => ErrorKind::StateConflict,
                StartError::Timeout(_) | StartError::Spawn(_) => ErrorKind::Transient,
            },
            Error::Stop(_) => ErrorKind::StateConflict,
            Error::Model { .. } | Error::Daemon { .. } => ErrorKind::Internal,
        }
    }

    /// Returns true if the error is a state conflict or an in-flight conflict
    pub fn is_state_conflict(&self) -> bool {
        self.kind() == ErrorKind::StateConflict
    }

    /// Returns true if the error is a not found error
    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }

    /// Returns true if the error is a timeout error
    pub fn is_timeout(&self) -> bool {
        matches!(
            self.root(),
            Error::Inference(InferenceError::Timeout(_)) | Error::Start(StartError::Timeout(_))
        )
    }
}
