//! Common utilities and types for ModelHub
//!
//! This crate provides shared functionality used across the ModelHub system,
//! including the error taxonomy, the model lifecycle data model and utility
//! functions.

pub mod error;
pub mod models;
pub mod types;
pub mod utils;

// Re-export commonly used types
pub use error::{
    DeleteError, DownloadError, Error, ErrorKind, InferenceError, InstallError, LoadError, Result,
    StartError, StopError, UnloadError,
};
pub use models::*;
pub use types::*;
