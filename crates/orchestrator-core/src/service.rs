//! Orchestration service
//!
//! This module provides the façade callers use to drive models through their
//! lifecycle. Every operation resolves the backend manager, takes the
//! model's operation token, calls the backend and records the outcome in the
//! [`ModelStateRegistry`].

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use common::error::{DeleteError, Error, InferenceError, Result, UnloadError};
use common::models::{
    DownloadProgress, InferenceOptions, InferenceTarget, ModelHandle, ModelIdentity, ModelInfo,
    ModelRecord, ModelState, ModelSummary,
};
use common::types::{ProgressSink, SharedProgressSink, SourceStatus, TracingProgressSink};
use common::utils::{execute_with_timeout, format_bytes, truncate_string};
use hub_config::Settings;
use model_manager::{ManagerRegistry, SharedManager};
use process_supervisor::{DaemonProcessState, ProcessSupervisor};

use crate::inflight::{DownloadStart, InFlightTable};
use crate::state::ModelStateRegistry;
use crate::task::DownloadTask;

/// Availability of every source and of the daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    /// Per-source reachability
    pub sources: Vec<SourceStatus>,

    /// Daemon state, when a daemon-backed source is enabled
    pub daemon: Option<DaemonProcessState>,

    /// Number of models the service has seen
    pub tracked_models: usize,
}

/// Outcome of one startup model
#[derive(Debug, Clone)]
pub struct StartupOutcome {
    /// Startup model
    pub identity: ModelIdentity,

    /// Final state, or why it could not be reached
    pub result: Result<ModelState>,
}

/// Façade over managers, supervisor and registry
#[derive(Clone)]
pub struct OrchestrationService {
    /// Lifecycle records
    states: Arc<ModelStateRegistry>,

    /// Operation tokens
    inflight: Arc<InFlightTable>,

    /// Backend managers
    managers: Arc<ManagerRegistry>,

    /// Daemon supervisor
    supervisor: Option<Arc<ProcessSupervisor>>,

    /// Receiver of download progress, in addition to the registry
    progress: SharedProgressSink,

    /// Default inference timeout
    inference_timeout: Duration,

    /// Models to download at startup
    startup_models: Vec<ModelIdentity>,
}

impl OrchestrationService {
    /// Creates a service over the given managers and supervisor
    pub fn new(
        managers: Arc<ManagerRegistry>,
        supervisor: Option<Arc<ProcessSupervisor>>,
        inference_timeout: Duration,
    ) -> Self {
        Self {
            states: Arc::new(ModelStateRegistry::new()),
            inflight: InFlightTable::new(),
            managers,
            supervisor,
            progress: Arc::new(TracingProgressSink),
            inference_timeout,
            startup_models: Vec::new(),
        }
    }

    /// Creates a service configured from settings
    pub fn from_settings(
        settings: &Settings,
        managers: Arc<ManagerRegistry>,
        supervisor: Option<Arc<ProcessSupervisor>>,
    ) -> Result<Self> {
        Ok(Self::new(managers, supervisor, settings.inference_timeout())
            .with_startup_models(settings.startup_identities()?))
    }

    /// Forwards download progress to `sink` as well
    pub fn with_progress_sink(mut self, sink: SharedProgressSink) -> Self {
        self.progress = sink;
        self
    }

    /// Sets the models [`initialize_defaults`](Self::initialize_defaults) downloads
    pub fn with_startup_models(mut self, models: Vec<ModelIdentity>) -> Self {
        self.startup_models = models;
        self
    }

    /// Read access to the lifecycle records
    pub fn registry(&self) -> &ModelStateRegistry {
        &self.states
    }

    /// Record of `identity`
    pub fn model(&self, identity: &ModelIdentity) -> Option<ModelRecord> {
        self.states.get(identity)
    }

    /// State of `identity`
    pub fn state(&self, identity: &ModelIdentity) -> ModelState {
        self.states.state(identity)
    }

    /// Lists local models of every source, merged with the registry.
    ///
    /// Unreachable backends are skipped.
    pub async fn list_models(&self) -> Vec<ModelSummary> {
        let listings = join_all(self.managers.managers().map(|manager| async move {
            (manager.source(), manager.list().await)
        }))
        .await;

        let mut models = Vec::new();
        let mut seen = HashSet::new();

        for (source, listing) in listings {
            match listing {
                Ok(summaries) => {
                    for mut summary in summaries {
                        // A running operation owns the record; report it as is
                        let state = if self.inflight.current(&summary.identity).is_some() {
                            self.states.get(&summary.identity).map(|r| r.state)
                        } else {
                            self.states.observe(&summary)
                        };
                        if let Some(state) = state {
                            summary.state = state;
                        }
                        seen.insert(summary.identity.clone());
                        models.push(summary);
                    }
                }
                Err(e) => warn!("Skipping source {}: {}", source, e),
            }
        }

        // Models the registry knows about that no listing reported
        for record in self.states.snapshot() {
            if seen.contains(&record.identity) || record.state == ModelState::Unknown {
                continue;
            }
            models.push(ModelSummary {
                identity: record.identity,
                size_bytes: record.size_bytes,
                state: record.state,
                modified_at: None,
            });
        }

        models.sort_by(|a, b| a.identity.cmp(&b.identity));
        models
    }

    /// Starts downloading `identity` in the background.
    ///
    /// Concurrent callers share one task. When the model is already present
    /// the returned task is complete and carries the current state.
    pub async fn download(&self, identity: &ModelIdentity) -> Result<DownloadTask> {
        let manager = self.manager(identity)?;
        self.resolve(identity, &manager).await?;

        let start = self.inflight.join_or_start(identity, || {
            let state = self.states.state(identity);
            if !matches!(state, ModelState::NotDownloaded | ModelState::Unknown) {
                return Ok(None);
            }

            self.states.transition(
                identity,
                &[ModelState::NotDownloaded, ModelState::Unknown],
                ModelState::Downloading,
                "download",
            )?;

            Ok(Some(DownloadTask::new(identity.clone())))
        });

        // Another operation holds the token on a model that is already
        // downloaded: there is nothing to download either way
        let start = match start {
            Err(Error::Conflict { .. })
                if !matches!(
                    self.states.state(identity),
                    ModelState::NotDownloaded | ModelState::Unknown
                ) =>
            {
                DownloadStart::NotNeeded
            }
            other => other?,
        };

        match start {
            DownloadStart::Joined(task) => {
                debug!("Joining running download of {}", identity);
                Ok(task)
            }
            DownloadStart::NotNeeded => {
                let state = self.states.state(identity);
                debug!("{} is already {}, nothing to download", identity, state);
                Ok(DownloadTask::completed(identity.clone(), state))
            }
            DownloadStart::Started(task, completer, guard) => {
                info!("Downloading {}", identity);

                let service = self.clone();
                let identity = identity.clone();
                let cancel = task.cancellation_token();

                tokio::spawn(async move {
                    let result = service.run_download(&identity, &manager, cancel).await;
                    drop(guard);
                    completer.complete(result);
                });

                Ok(task)
            }
        }
    }

    /// Describes `identity` as its source reports it. Does not touch the
    /// model's record.
    pub async fn info(&self, identity: &ModelIdentity) -> Result<ModelInfo> {
        let manager = self.manager(identity)?;
        if manager.requires_daemon() {
            self.ensure_daemon()
                .await
                .map_err(|e| e.for_model(identity))?;
        }

        manager
            .info(&identity.name)
            .await
            .map_err(|e| e.for_model(identity))
    }

    /// Cancels the running download of `identity` and waits for it to settle
    pub async fn cancel_download(&self, identity: &ModelIdentity) -> Result<()> {
        let Some(task) = self.inflight.download(identity) else {
            return Err(Error::StateConflict {
                identity: identity.clone(),
                operation: "cancel_download",
                state: self.states.state(identity),
            });
        };

        info!("Cancelling download of {}", identity);
        task.cancel();

        // The outcome is Cancelled unless the download won the race
        let _ = task.wait().await;

        Ok(())
    }

    /// Loads `identity` and returns a fresh handle
    pub async fn load(&self, identity: &ModelIdentity) -> Result<ModelHandle> {
        let manager = self.manager(identity)?;
        let _guard = self.inflight.acquire(identity, "load")?;

        self.resolve(identity, &manager).await?;
        self.states
            .transition(identity, &[ModelState::Downloaded], ModelState::Loading, "load")?;

        info!("Loading {}", identity);

        let result = async {
            if manager.requires_daemon() {
                self.ensure_daemon().await?;
            }
            manager.load(&identity.name).await
        }
        .await;

        match result {
            Ok(handle) => {
                self.states.set_loaded(identity, handle.clone());
                info!(handle = %handle.id, "Loaded {}", identity);
                Ok(handle)
            }
            Err(e) => {
                error!("Failed to load {}: {}", identity, e);
                self.states.revert(identity, ModelState::Downloaded, &e);
                Err(e.for_model(identity))
            }
        }
    }

    /// Unloads `identity`; its artifacts stay on disk
    pub async fn unload(&self, identity: &ModelIdentity) -> Result<()> {
        let manager = self.manager(identity)?;
        let _guard = self.inflight.acquire(identity, "unload")?;

        let previous = self.states.transition(
            identity,
            &[ModelState::Loaded],
            ModelState::Unloading,
            "unload",
        )?;
        let Some(handle) = previous.loaded_handle else {
            // Loaded always carries a handle
            self.states.set_state(identity, ModelState::Downloaded);
            return Ok(());
        };

        info!("Unloading {}", identity);

        match manager.unload(&handle).await {
            Ok(()) => {}
            Err(Error::Unload(UnloadError::AlreadyUnloaded(_))) => {
                warn!("{} was already unloaded by the backend", identity);
            }
            Err(e) => {
                error!("Failed to unload {}: {}", identity, e);
                self.states.revert_loaded(identity, handle, &e);
                return Err(e.for_model(identity));
            }
        }

        self.states.set_state(identity, ModelState::Downloaded);
        info!("Unloaded {}", identity);

        Ok(())
    }

    /// Runs inference on `identity`.
    ///
    /// Backends with deferred-cost loads are loaded implicitly when the model
    /// is downloaded. Failures are recorded but never change the state.
    pub async fn infer(
        &self,
        identity: &ModelIdentity,
        prompt: &str,
        options: &InferenceOptions,
    ) -> Result<String> {
        let manager = self.manager(identity)?;
        let state = self.resolve(identity, &manager).await?;

        let handle = match state {
            ModelState::Loaded => self.states.get(identity).and_then(|r| r.loaded_handle),
            ModelState::Downloaded if manager.lazy_load() => match self.load(identity).await {
                Ok(handle) => Some(handle),
                // Someone else is loading or just loaded it; the backend can
                // serve by name either way
                Err(e) if matches!(e, Error::Conflict { .. } | Error::StateConflict { .. }) => None,
                Err(e) => return Err(e),
            },
            state => {
                return Err(Error::StateConflict {
                    identity: identity.clone(),
                    operation: "infer",
                    state,
                })
            }
        };

        if manager.requires_daemon() {
            self.ensure_daemon().await?;
        }

        let mut options = options.clone();
        let timeout = *options.timeout.get_or_insert(self.inference_timeout);

        let target = match &handle {
            Some(handle) => InferenceTarget::Handle(handle),
            None => InferenceTarget::Name(&identity.name),
        };

        debug!("Running inference on {}: {}", identity, truncate_string(prompt, 80));

        let result = execute_with_timeout(
            manager.infer(target, prompt, &options),
            timeout,
            |elapsed| InferenceError::Timeout(elapsed).into(),
        )
        .await;

        result.map_err(|e| {
            warn!("Inference on {} failed: {}", identity, e);
            self.states.record_error(identity, &e);
            e.for_model(identity)
        })
    }

    /// Deletes the artifacts of `identity` and drops its record
    pub async fn delete(&self, identity: &ModelIdentity) -> Result<()> {
        let manager = self.manager(identity)?;
        let _guard = self.inflight.acquire(identity, "delete")?;

        let state = self.resolve(identity, &manager).await?;

        match state {
            ModelState::Downloaded => {}
            ModelState::NotDownloaded | ModelState::Unknown | ModelState::Deleted => {
                debug!("{} is not downloaded, dropping its record", identity);
                self.states.remove(identity);
                return Ok(());
            }
            state => {
                return Err(Error::StateConflict {
                    identity: identity.clone(),
                    operation: "delete",
                    state,
                })
            }
        }

        if manager.requires_daemon() {
            self.ensure_daemon().await?;
        }

        match manager.delete(&identity.name).await {
            Ok(()) => info!("Deleted {}", identity),
            Err(Error::Delete(DeleteError::NotFound(_))) => {
                warn!("{} was already gone from the backend", identity);
            }
            Err(e) => {
                error!("Failed to delete {}: {}", identity, e);
                self.states.record_error(identity, &e);
                return Err(e.for_model(identity));
            }
        }

        self.states.remove(identity);

        Ok(())
    }

    /// Downloads the configured startup models that are not present yet.
    ///
    /// Failures are logged and reported, never returned as an error.
    pub async fn initialize_defaults(&self) -> Vec<StartupOutcome> {
        if self.startup_models.is_empty() {
            return Vec::new();
        }

        info!("Preparing {} startup models", self.startup_models.len());

        let runs = self.startup_models.iter().map(|identity| async move {
            let result = match self.download(identity).await {
                Ok(task) => task.wait().await,
                Err(e) => Err(e),
            };

            match &result {
                Ok(state) => info!("Startup model {} is {}", identity, state),
                Err(e) => warn!("Startup model {} unavailable: {}", identity, e),
            }

            StartupOutcome {
                identity: identity.clone(),
                result,
            }
        });

        join_all(runs).await
    }

    /// Reachability of every source plus the daemon state
    pub async fn status(&self) -> ServiceStatus {
        let sources = join_all(self.managers.managers().map(|manager| async move {
            SourceStatus {
                source: manager.source(),
                available: manager.available().await,
            }
        }))
        .await;

        let daemon = match &self.supervisor {
            Some(supervisor) => Some(supervisor.refresh().await),
            None => None,
        };

        ServiceStatus {
            sources,
            daemon,
            tracked_models: self.states.len(),
        }
    }

    /// Installs the daemon
    pub async fn install_daemon(&self) -> Result<()> {
        self.supervisor()?
            .install()
            .await
            .map_err(Error::for_daemon)
    }

    /// Starts the daemon
    pub async fn start_daemon(&self) -> Result<()> {
        self.supervisor()?
            .start()
            .await
            .map_err(Error::for_daemon)
    }

    /// Stops the daemon
    pub async fn stop_daemon(&self) -> Result<()> {
        self.supervisor()?
            .stop()
            .await
            .map_err(Error::for_daemon)
    }

    /// Daemon state snapshot
    pub async fn daemon_status(&self) -> Result<DaemonProcessState> {
        Ok(self.supervisor()?.refresh().await)
    }

    fn manager(&self, identity: &ModelIdentity) -> Result<SharedManager> {
        self.managers.get_manager(identity.source)
    }

    fn supervisor(&self) -> Result<&Arc<ProcessSupervisor>> {
        self.supervisor
            .as_ref()
            .ok_or_else(|| Error::Config("no daemon-backed source is enabled".to_string()))
    }

    async fn ensure_daemon(&self) -> Result<()> {
        self.supervisor()?
            .ensure_running()
            .await
            .map_err(Error::for_daemon)
    }

    /// Creates the record on first reference and settles it with a probe
    async fn resolve(&self, identity: &ModelIdentity, manager: &SharedManager) -> Result<ModelState> {
        let state = self.states.ensure(identity);
        if state != ModelState::Unknown {
            return Ok(state);
        }

        if manager.requires_daemon() {
            self.ensure_daemon().await.map_err(|e| e.for_model(identity))?;
        }

        let probe = manager.probe(&identity.name).await.map_err(|e| {
            warn!("Could not probe {}: {}", identity, e);
            e.for_model(identity)
        })?;

        Ok(self.states.resolve(identity, &probe))
    }

    async fn run_download(
        &self,
        identity: &ModelIdentity,
        manager: &SharedManager,
        cancel: tokio_util::sync::CancellationToken,
    ) -> Result<ModelState> {
        let sink = RegistryProgressSink {
            states: &self.states,
            downstream: &self.progress,
        };

        let result = async {
            if manager.requires_daemon() {
                self.ensure_daemon().await?;
            }
            manager.download(&identity.name, &sink, cancel).await
        }
        .await;

        match result {
            Ok(size) => {
                self.states.set_downloaded(identity, size);
                info!("Downloaded {} ({})", identity, format_bytes(size));
                Ok(ModelState::Downloaded)
            }
            Err(e) => {
                if let Err(discard) = manager.discard_partial(&identity.name).await {
                    warn!("Failed to discard partial download of {}: {}", identity, discard);
                }

                self.states.revert(identity, ModelState::NotDownloaded, &e);

                if e.kind() == common::error::ErrorKind::Cancelled {
                    info!("Download of {} cancelled", identity);
                } else {
                    error!("Download of {} failed: {}", identity, e);
                }

                Err(e.for_model(identity))
            }
        }
    }
}

/// Records progress in the registry and forwards it
struct RegistryProgressSink<'a> {
    states: &'a ModelStateRegistry,
    downstream: &'a SharedProgressSink,
}

impl ProgressSink for RegistryProgressSink<'_> {
    fn on_progress(&self, identity: &ModelIdentity, progress: &DownloadProgress) {
        self.states.update_progress(identity, progress);
        self.downstream.on_progress(identity, progress);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::error::{DownloadError, ErrorKind, LoadError};
    use common::models::ModelSource;
    use hub_config::DaemonSettings;
    use model_manager::testing::MockBackend;
    use process_supervisor::testing::MockDriver;
    use process_supervisor::DaemonStatus;

    struct Fixture {
        service: OrchestrationService,
        hub: Arc<MockBackend>,
        daemon: Arc<MockBackend>,
        driver: MockDriver,
    }

    fn fixture(hub: MockBackend, daemon: MockBackend) -> Fixture {
        let hub = Arc::new(hub);
        let daemon = Arc::new(daemon.daemon_backed());

        let managers = ManagerRegistry::builder()
            .register(hub.clone())
            .unwrap()
            .register(daemon.clone())
            .unwrap()
            .build();

        let driver = MockDriver::new();
        let supervisor = ProcessSupervisor::new(
            Arc::new(driver.clone()),
            DaemonSettings {
                startup_timeout_secs: 1,
                stop_timeout_secs: 1,
                health_timeout_ms: 100,
                ..DaemonSettings::default()
            },
        );

        let service = OrchestrationService::new(
            Arc::new(managers),
            Some(Arc::new(supervisor)),
            Duration::from_secs(5),
        );

        Fixture {
            service,
            hub,
            daemon,
            driver,
        }
    }

    fn hub_fixture(hub: MockBackend) -> Fixture {
        fixture(hub, MockBackend::new(ModelSource::Daemon))
    }

    fn hub_model(name: &str) -> ModelIdentity {
        ModelIdentity::new(ModelSource::Hub, name)
    }

    fn daemon_model(name: &str) -> ModelIdentity {
        ModelIdentity::new(ModelSource::Daemon, name)
    }

    #[tokio::test]
    async fn test_gpt2_end_to_end() {
        let f = hub_fixture(MockBackend::new(ModelSource::Hub).with_model("gpt2", 548_000_000));
        let gpt2 = hub_model("gpt2");

        assert_eq!(f.service.state(&gpt2), ModelState::Unknown);

        let task = f.service.download(&gpt2).await.unwrap();
        assert_eq!(task.wait().await.unwrap(), ModelState::Downloaded);
        assert_eq!(f.service.model(&gpt2).unwrap().size_bytes, Some(548_000_000));

        let handle = f.service.load(&gpt2).await.unwrap();
        let record = f.service.model(&gpt2).unwrap();
        assert_eq!(record.state, ModelState::Loaded);
        assert_eq!(record.loaded_handle, Some(handle));

        let text = f
            .service
            .infer(&gpt2, "Hello, my name is", &InferenceOptions::default())
            .await
            .unwrap();
        assert!(!text.is_empty());

        f.service.unload(&gpt2).await.unwrap();
        assert_eq!(f.service.state(&gpt2), ModelState::Downloaded);

        f.service.delete(&gpt2).await.unwrap();
        assert!(f.service.model(&gpt2).is_none());
        assert!(!f.hub.is_local("gpt2"));
        assert_eq!(f.hub.delete_calls(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_downloads_share_one_backend_call() {
        let f = hub_fixture(
            MockBackend::new(ModelSource::Hub)
                .with_model("gpt2", 100)
                .with_download_delay(Duration::from_millis(100)),
        );
        let gpt2 = hub_model("gpt2");

        let (first, second) = tokio::join!(f.service.download(&gpt2), f.service.download(&gpt2));
        let (first, second) = (first.unwrap(), second.unwrap());

        tokio::time::sleep(Duration::from_millis(20)).await;
        let record = f.service.model(&gpt2).unwrap();
        assert_eq!(record.state, ModelState::Downloading);
        assert!(record.download_progress.is_some());

        assert_eq!(first.wait().await.unwrap(), ModelState::Downloaded);
        assert_eq!(second.wait().await.unwrap(), ModelState::Downloaded);
        assert_eq!(f.hub.download_calls(), 1);
        assert!(f.service.model(&gpt2).unwrap().download_progress.is_none());
    }

    #[tokio::test]
    async fn test_download_of_present_model_completes_immediately() {
        let f = hub_fixture(MockBackend::new(ModelSource::Hub).with_local_model("gpt2", 100));
        let gpt2 = hub_model("gpt2");

        let task = f.service.download(&gpt2).await.unwrap();
        assert!(task.is_finished());
        assert_eq!(task.wait().await.unwrap(), ModelState::Downloaded);
        assert_eq!(f.hub.download_calls(), 0);

        f.service.load(&gpt2).await.unwrap();
        let task = f.service.download(&gpt2).await.unwrap();
        assert_eq!(task.wait().await.unwrap(), ModelState::Loaded);
    }

    #[tokio::test]
    async fn test_concurrent_loads_one_wins() {
        let f = hub_fixture(
            MockBackend::new(ModelSource::Hub)
                .with_local_model("gpt2", 100)
                .with_load_delay(Duration::from_millis(50)),
        );
        let gpt2 = hub_model("gpt2");

        let (first, second) = tokio::join!(f.service.load(&gpt2), f.service.load(&gpt2));

        let results = [first, second];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(Error::Conflict { operation: "load", .. }))));
        assert_eq!(f.hub.load_calls(), 1);
        assert_eq!(f.service.state(&gpt2), ModelState::Loaded);
    }

    #[tokio::test]
    async fn test_unload_then_load_issues_fresh_handle() {
        let f = hub_fixture(MockBackend::new(ModelSource::Hub).with_local_model("gpt2", 100));
        let gpt2 = hub_model("gpt2");

        let first = f.service.load(&gpt2).await.unwrap();
        f.service.unload(&gpt2).await.unwrap();
        assert!(f.service.model(&gpt2).unwrap().loaded_handle.is_none());

        let second = f.service.load(&gpt2).await.unwrap();
        assert_ne!(first.id, second.id);
        assert_eq!(f.service.state(&gpt2), ModelState::Loaded);
        assert_eq!(f.hub.live_handles(), 1);
    }

    #[tokio::test]
    async fn test_unload_requires_loaded() {
        let f = hub_fixture(MockBackend::new(ModelSource::Hub).with_local_model("gpt2", 100));
        let gpt2 = hub_model("gpt2");
        f.service.download(&gpt2).await.unwrap().wait().await.unwrap();

        let err = f.service.unload(&gpt2).await.unwrap_err();
        assert!(matches!(
            err,
            Error::StateConflict { operation: "unload", state: ModelState::Downloaded, .. }
        ));
        assert_eq!(f.hub.unload_calls(), 0);
    }

    #[tokio::test]
    async fn test_delete_rules() {
        let f = hub_fixture(
            MockBackend::new(ModelSource::Hub)
                .with_local_model("gpt2", 100)
                .with_model("remote-only", 100)
                .with_download_delay(Duration::from_secs(5)),
        );
        let gpt2 = hub_model("gpt2");

        f.service.load(&gpt2).await.unwrap();
        let err = f.service.delete(&gpt2).await.unwrap_err();
        assert!(matches!(err, Error::StateConflict { state: ModelState::Loaded, .. }));
        assert!(err.is_state_conflict());
        assert_eq!(f.service.state(&gpt2), ModelState::Loaded);
        assert_eq!(f.hub.delete_calls(), 0);

        // Not downloaded: the record is dropped without a backend call
        let remote = hub_model("remote-only");
        let task = f.service.download(&remote).await.unwrap();
        assert_eq!(task.identity(), &remote);
        f.service.cancel_download(&remote).await.unwrap();
        assert_eq!(f.service.state(&remote), ModelState::NotDownloaded);
        f.service.delete(&remote).await.unwrap();
        assert!(f.service.model(&remote).is_none());
        assert_eq!(f.hub.delete_calls(), 0);
    }

    #[tokio::test]
    async fn test_infer_timeout_keeps_model_loaded() {
        let f = hub_fixture(
            MockBackend::new(ModelSource::Hub)
                .with_local_model("gpt2", 100)
                .with_infer_delay(Duration::from_millis(500)),
        );
        let gpt2 = hub_model("gpt2");
        f.service.load(&gpt2).await.unwrap();

        let options = InferenceOptions {
            timeout: Some(Duration::from_millis(50)),
            ..InferenceOptions::default()
        };
        let err = f.service.infer(&gpt2, "hello", &options).await.unwrap_err();

        assert!(err.is_timeout());
        let record = f.service.model(&gpt2).unwrap();
        assert_eq!(record.state, ModelState::Loaded);
        assert!(record.last_error.is_some());
    }

    #[tokio::test]
    async fn test_infer_requires_loaded_for_eager_backends() {
        let f = hub_fixture(MockBackend::new(ModelSource::Hub).with_local_model("gpt2", 100));
        let err = f
            .service
            .infer(&hub_model("gpt2"), "hello", &InferenceOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::StateConflict { operation: "infer", state: ModelState::Downloaded, .. }
        ));
        assert_eq!(f.hub.infer_calls(), 0);
    }

    #[tokio::test]
    async fn test_cancel_download() {
        let f = hub_fixture(
            MockBackend::new(ModelSource::Hub)
                .with_model("gpt2", 100)
                .with_download_delay(Duration::from_secs(5)),
        );
        let gpt2 = hub_model("gpt2");

        let task = f.service.download(&gpt2).await.unwrap();
        f.service.cancel_download(&gpt2).await.unwrap();

        assert_eq!(f.service.state(&gpt2), ModelState::NotDownloaded);
        assert_eq!(f.hub.discard_calls(), 1);
        assert_eq!(task.wait().await.unwrap_err().kind(), ErrorKind::Cancelled);

        // Nothing left to cancel
        assert!(f.service.cancel_download(&gpt2).await.is_err());
    }

    #[tokio::test]
    async fn test_failed_download_reverts_with_error() {
        let f = hub_fixture(MockBackend::new(ModelSource::Hub).with_model("gpt2", 100));
        f.hub.fail_next_download(DownloadError::Network("connection reset".to_string()));
        let gpt2 = hub_model("gpt2");

        let err = f.service.download(&gpt2).await.unwrap().wait().await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Transient);
        assert!(matches!(err, Error::Model { .. }));

        let record = f.service.model(&gpt2).unwrap();
        assert_eq!(record.state, ModelState::NotDownloaded);
        assert!(record.last_error.unwrap().contains("connection reset"));
        assert_eq!(f.hub.discard_calls(), 1);

        // A retry goes through
        let task = f.service.download(&gpt2).await.unwrap();
        assert_eq!(task.wait().await.unwrap(), ModelState::Downloaded);
    }

    #[tokio::test]
    async fn test_unknown_model_download_fails_not_found() {
        let f = hub_fixture(MockBackend::new(ModelSource::Hub));
        let err = f
            .service
            .download(&hub_model("nope"))
            .await
            .unwrap()
            .wait()
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn test_failed_load_reverts_to_downloaded() {
        let f = hub_fixture(MockBackend::new(ModelSource::Hub).with_local_model("gpt2", 100));
        f.hub.fail_next_load(LoadError::ResourceExhausted("out of memory".to_string()));
        let gpt2 = hub_model("gpt2");

        let err = f.service.load(&gpt2).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Resource);

        let record = f.service.model(&gpt2).unwrap();
        assert_eq!(record.state, ModelState::Downloaded);
        assert!(record.loaded_handle.is_none());
        assert!(record.last_error.is_some());
    }

    #[tokio::test]
    async fn test_daemon_model_starts_daemon_and_loads_implicitly() {
        let f = fixture(
            MockBackend::new(ModelSource::Hub),
            MockBackend::new(ModelSource::Daemon).with_local_model("llama3", 4_700_000_000),
        );
        let llama3 = daemon_model("llama3");

        let text = f
            .service
            .infer(&llama3, "Why is the sky blue?", &InferenceOptions::default())
            .await
            .unwrap();

        assert!(!text.is_empty());
        assert_eq!(f.driver.spawn_calls(), 1);
        assert_eq!(f.service.state(&llama3), ModelState::Loaded);
        assert_eq!(f.daemon.load_calls(), 1);

        let daemon = f.service.daemon_status().await.unwrap();
        assert_eq!(daemon.status, DaemonStatus::Running);
    }

    #[tokio::test]
    async fn test_daemon_passthroughs() {
        let f = hub_fixture(MockBackend::new(ModelSource::Hub));

        let err = f.service.stop_daemon().await.unwrap_err();
        assert!(matches!(err, Error::Daemon { .. }));
        assert!(err.is_state_conflict());

        f.service.install_daemon().await.unwrap();
        f.service.start_daemon().await.unwrap();
        f.service.start_daemon().await.unwrap();
        assert_eq!(f.driver.spawn_calls(), 1);

        f.service.stop_daemon().await.unwrap();
        assert_eq!(
            f.service.daemon_status().await.unwrap().status,
            DaemonStatus::InstalledStopped
        );
    }

    #[tokio::test]
    async fn test_initialize_defaults() {
        let f = hub_fixture(MockBackend::new(ModelSource::Hub).with_model("gpt2", 100));
        let service = f
            .service
            .clone()
            .with_startup_models(vec![hub_model("gpt2"), hub_model("missing")]);

        let outcomes = service.initialize_defaults().await;

        assert_eq!(outcomes.len(), 2);
        assert_eq!(outcomes[0].result.as_ref().unwrap(), &ModelState::Downloaded);
        assert!(outcomes[1].result.as_ref().unwrap_err().is_not_found());
        assert_eq!(service.state(&hub_model("gpt2")), ModelState::Downloaded);
    }

    #[tokio::test]
    async fn test_status_and_listing() {
        let f = hub_fixture(MockBackend::new(ModelSource::Hub).with_local_model("gpt2", 100));
        f.daemon.set_available(false);

        let listed = f.service.list_models().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].identity, hub_model("gpt2"));
        assert_eq!(listed[0].state, ModelState::Downloaded);
        // Listing alone does not start tracking a model
        assert_eq!(f.service.state(&hub_model("gpt2")), ModelState::Unknown);

        let status = f.service.status().await;
        assert_eq!(status.sources.len(), 2);
        assert!(status
            .sources
            .iter()
            .any(|s| s.source == ModelSource::Daemon && !s.available));
        assert!(status.daemon.is_some());
        assert_eq!(status.tracked_models, 0);
    }

    #[tokio::test]
    async fn test_listing_reports_tracked_state() {
        let f = hub_fixture(MockBackend::new(ModelSource::Hub).with_local_model("gpt2", 100));
        let gpt2 = hub_model("gpt2");
        f.service.load(&gpt2).await.unwrap();

        let listed = f.service.list_models().await;
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].state, ModelState::Loaded);
        assert_eq!(f.service.status().await.tracked_models, 1);
    }

    #[tokio::test]
    async fn test_listing_does_not_resurrect_deleted_model() {
        let f = hub_fixture(
            MockBackend::new(ModelSource::Hub)
                .with_local_model("gpt2", 100)
                .with_list_delay(Duration::from_millis(100)),
        );
        let gpt2 = hub_model("gpt2");
        f.service.download(&gpt2).await.unwrap().wait().await.unwrap();

        // The listing is taken before the delete and returns after it
        let (_, deleted) = tokio::join!(f.service.list_models(), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            f.service.delete(&gpt2).await
        });
        deleted.unwrap();

        assert!(f.service.model(&gpt2).is_none());
        let err = f.service.load(&gpt2).await.unwrap_err();
        assert!(matches!(
            err,
            Error::StateConflict { operation: "load", state: ModelState::NotDownloaded, .. }
        ));
        assert_eq!(f.hub.load_calls(), 0);

        let task = f.service.download(&gpt2).await.unwrap();
        assert_eq!(task.wait().await.unwrap(), ModelState::Downloaded);
        assert_eq!(f.hub.download_calls(), 1);
    }

    #[tokio::test]
    async fn test_download_during_load_reports_current_state() {
        let f = hub_fixture(
            MockBackend::new(ModelSource::Hub)
                .with_local_model("gpt2", 100)
                .with_load_delay(Duration::from_millis(100)),
        );
        let gpt2 = hub_model("gpt2");

        let (loaded, task) = tokio::join!(f.service.load(&gpt2), async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            f.service.download(&gpt2).await
        });

        let task = task.unwrap();
        assert!(task.is_finished());
        assert_eq!(task.wait().await.unwrap(), ModelState::Loading);
        loaded.unwrap();
        assert_eq!(f.hub.download_calls(), 0);
        assert_eq!(f.service.state(&gpt2), ModelState::Loaded);
    }

    #[tokio::test]
    async fn test_download_during_delete_of_missing_model_conflicts() {
        let f = hub_fixture(MockBackend::new(ModelSource::Hub).with_model("gpt2", 100));
        let gpt2 = hub_model("gpt2");
        let _guard = f.service.inflight.acquire(&gpt2, "delete").unwrap();

        let err = f.service.download(&gpt2).await.unwrap_err();
        assert!(matches!(err, Error::Conflict { operation: "download", .. }));
    }

    #[tokio::test]
    async fn test_info() {
        let f = fixture(
            MockBackend::new(ModelSource::Hub).with_local_model("gpt2", 100),
            MockBackend::new(ModelSource::Daemon).with_model("llama3", 4_700),
        );

        let info = f.service.info(&hub_model("gpt2")).await.unwrap();
        assert_eq!(info.identity, hub_model("gpt2"));
        assert!(info.present_locally);
        assert_eq!(info.size_bytes, Some(100));
        // Describing a model does not start tracking it
        assert!(f.service.model(&hub_model("gpt2")).is_none());

        let info = f.service.info(&daemon_model("llama3")).await.unwrap();
        assert!(!info.present_locally);
        assert_eq!(f.driver.spawn_calls(), 1);
    }

    #[tokio::test]
    async fn test_unregistered_source() {
        let managers = ManagerRegistry::builder()
            .register(Arc::new(MockBackend::new(ModelSource::Hub)))
            .unwrap()
            .build();
        let service = OrchestrationService::new(Arc::new(managers), None, Duration::from_secs(1));

        let err = service.download(&daemon_model("llama3")).await.unwrap_err();
        assert!(matches!(err, Error::UnknownSource(_)));
        assert!(matches!(service.start_daemon().await, Err(Error::Config(_))));
    }
}
