//! ModelHub
//!
//! Wires the configured backend managers, the daemon supervisor and the
//! orchestration service together from [`Settings`].

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use common::error::{Error, Result, StopError};
use hub_config::Settings;
use model_manager::ManagerRegistry;
use orchestrator_core::{OrchestrationService, StartupOutcome};
use process_supervisor::{OllamaDriver, ProcessSupervisor};

pub use common;
pub use hub_config;
pub use orchestrator_core;

/// Assembled ModelHub instance
pub struct ModelHub {
    /// Loaded settings
    settings: Settings,

    /// Orchestration façade
    service: OrchestrationService,

    /// Daemon supervisor, present when a daemon-backed source is enabled
    supervisor: Option<Arc<ProcessSupervisor>>,

    /// Stops the background monitor
    shutdown: CancellationToken,
}

impl ModelHub {
    /// Builds managers, supervisor and service from `settings`
    pub fn new(settings: Settings) -> Result<Self> {
        let managers = Arc::new(ManagerRegistry::from_settings(&settings)?);

        let supervisor = if managers.needs_daemon() {
            let driver = OllamaDriver::new(settings.daemon.clone())?;
            Some(Arc::new(ProcessSupervisor::new(
                Arc::new(driver),
                settings.daemon.clone(),
            )))
        } else {
            None
        };

        let service = OrchestrationService::from_settings(&settings, managers, supervisor.clone())?;

        Ok(Self {
            settings,
            service,
            supervisor,
            shutdown: CancellationToken::new(),
        })
    }

    /// Settings the instance was built from
    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Orchestration service
    pub fn service(&self) -> &OrchestrationService {
        &self.service
    }

    /// Downloads the startup models and starts the daemon health monitor
    pub async fn start(&self) -> (Vec<StartupOutcome>, Option<JoinHandle<()>>) {
        let monitor = self
            .supervisor
            .as_ref()
            .map(|supervisor| supervisor.spawn_monitor(self.shutdown.child_token()));

        let outcomes = self.service.initialize_defaults().await;

        (outcomes, monitor)
    }

    /// Stops the monitor and the daemon, if this process started it
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown.cancel();

        if self.supervisor.is_none() {
            return Ok(());
        }

        match self.service.stop_daemon().await {
            Ok(()) => info!("Daemon stopped"),
            Err(e) if matches!(e.root(), Error::Stop(StopError::NotRunning)) => {}
            Err(e) => {
                warn!("Failed to stop daemon: {}", e);
                return Err(e);
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::models::ModelSource;

    fn hub_only(cache_dir: &std::path::Path) -> Settings {
        Settings {
            cache_dir: cache_dir.to_path_buf(),
            enabled_sources: vec![ModelSource::Hub],
            default_source: ModelSource::Hub,
            ..Settings::default()
        }
    }

    #[tokio::test]
    async fn test_hub_only_instance_has_no_supervisor() {
        let dir = tempfile::tempdir().unwrap();
        let hub = ModelHub::new(hub_only(dir.path())).unwrap();

        assert!(hub.supervisor.is_none());
        assert!(hub.service().daemon_status().await.is_err());

        let status = hub.service().status().await;
        assert!(status.daemon.is_none());
        assert_eq!(status.sources.len(), 1);

        hub.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn test_daemon_source_creates_supervisor() {
        let dir = tempfile::tempdir().unwrap();
        let mut settings = hub_only(dir.path());
        settings.enabled_sources.push(ModelSource::Daemon);
        settings.daemon.endpoint = "http://127.0.0.1:9".to_string();

        let hub = ModelHub::new(settings).unwrap();
        assert!(hub.supervisor.is_some());
        assert!(hub.service().registry().is_empty());

        // Nothing was started, so shutting down is a no-op
        hub.shutdown().await.unwrap();
    }
}
