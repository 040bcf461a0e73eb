//! Daemon process state
//!
//! This module provides the state representation of the supervised daemon.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of the daemon process
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DaemonStatus {
    /// The daemon binary is not installed
    NotInstalled,

    /// Installed but not running
    InstalledStopped,

    /// Spawned, waiting for the first healthy probe
    Starting,

    /// Running and healthy
    Running,

    /// Shutting down
    Stopping,

    /// Health lost or start failed
    Failed,
}

impl DaemonStatus {
    /// Returns true if the daemon is running
    pub fn is_running(&self) -> bool {
        matches!(self, DaemonStatus::Running)
    }

    /// Returns true if the daemon is installed
    pub fn is_installed(&self) -> bool {
        !matches!(self, DaemonStatus::NotInstalled)
    }
}

impl fmt::Display for DaemonStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DaemonStatus::NotInstalled => "not installed",
            DaemonStatus::InstalledStopped => "stopped",
            DaemonStatus::Starting => "starting",
            DaemonStatus::Running => "running",
            DaemonStatus::Stopping => "stopping",
            DaemonStatus::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// Snapshot of the supervised daemon
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DaemonProcessState {
    /// Current status
    pub status: DaemonStatus,

    /// Process id of the owned child
    pub pid: Option<u32>,

    /// Time of the last successful health check
    pub last_health_check_at: Option<DateTime<Utc>>,

    /// Automatic restarts since the last explicit start
    pub restart_count: u32,

    /// Whether automatic restarts were given up
    pub auto_restart_suspended: bool,

    /// Last failure, if any
    pub last_error: Option<String>,
}

impl DaemonProcessState {
    /// Creates a state with the given status
    pub fn new(status: DaemonStatus) -> Self {
        Self {
            status,
            pid: None,
            last_health_check_at: None,
            restart_count: 0,
            auto_restart_suspended: false,
            last_error: None,
        }
    }

    /// Whether the last successful health check is younger than `staleness`
    pub fn is_fresh(&self, staleness: chrono::Duration) -> bool {
        self.last_health_check_at
            .map_or(false, |at| Utc::now() - at < staleness)
    }
}

impl Default for DaemonProcessState {
    fn default() -> Self {
        Self::new(DaemonStatus::NotInstalled)
    }
}

impl fmt::Display for DaemonProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.status)?;
        if let Some(pid) = self.pid {
            write!(f, " (pid {})", pid)?;
        }
        if self.auto_restart_suspended {
            write!(f, ", auto-restart suspended")?;
        }
        if let Some(error) = &self.last_error {
            write!(f, ": {}", error)?;
        }
        Ok(())
    }
}
