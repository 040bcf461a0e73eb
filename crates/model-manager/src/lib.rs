//! Backend model managers for ModelHub
//!
//! This crate provides the [`BackendManager`] contract, its hub and daemon
//! implementations and the [`ManagerRegistry`] that maps a model source to
//! its manager.

pub mod backend;
pub mod daemon;
pub mod downloader;
pub mod hub;
pub mod registry;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

// Re-export commonly used types
pub use backend::BackendManager;
pub use daemon::DaemonManager;
pub use hub::{HubManager, HubModelInfo};
pub use registry::{ManagerRegistry, ManagerRegistryBuilder, SharedManager};
