//! Local inference daemon supervision for ModelHub
//!
//! This crate installs, starts, stops and health-checks the local daemon
//! and restarts it after failures, within bounds.

pub mod driver;
pub mod state;
pub mod supervisor;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

// Re-export commonly used types
pub use driver::{DaemonDriver, DaemonProcess, OllamaDriver};
pub use state::{DaemonProcessState, DaemonStatus};
pub use supervisor::ProcessSupervisor;
