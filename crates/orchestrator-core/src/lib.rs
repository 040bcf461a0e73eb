//! Model lifecycle orchestration for ModelHub
//!
//! This crate ties the backend managers, the daemon supervisor and the model
//! state registry together behind [`OrchestrationService`].

mod inflight;
pub mod service;
pub mod state;
pub mod task;

// Re-export commonly used types
pub use service::{OrchestrationService, ServiceStatus, StartupOutcome};
pub use state::ModelStateRegistry;
pub use task::DownloadTask;
