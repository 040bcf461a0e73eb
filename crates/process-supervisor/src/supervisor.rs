//! Process supervisor
//!
//! Owns the daemon child process and drives it through its lifecycle:
//! install, start, stop, health checks and bounded automatic restarts.
//! Transitions are serialized by the mutex guarding the child; health
//! checks never take it.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use parking_lot::{Mutex as SyncMutex, RwLock};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use common::error::{Error, Result, StartError, StopError};
use hub_config::DaemonSettings;

use crate::driver::{DaemonDriver, DaemonProcess};
use crate::state::{DaemonProcessState, DaemonStatus};

/// Interval between health probes while waiting for a fresh daemon
const STARTUP_POLL_INTERVAL: Duration = Duration::from_millis(200);

type ChildSlot = Option<Box<dyn DaemonProcess>>;

/// Supervisor of the local inference daemon
pub struct ProcessSupervisor {
    /// Install/spawn/probe mechanics
    driver: Arc<dyn DaemonDriver>,

    /// Daemon settings
    settings: DaemonSettings,

    /// Observable state
    state: RwLock<DaemonProcessState>,

    /// Owned child process; holding the lock serializes transitions
    child: Mutex<ChildSlot>,

    /// Recent health failures, pruned to the restart window
    failures: SyncMutex<VecDeque<Instant>>,
}

impl ProcessSupervisor {
    /// Creates a supervisor. The installation state is unknown until
    /// [`refresh`](Self::refresh), [`install`](Self::install) or a start.
    pub fn new(driver: Arc<dyn DaemonDriver>, settings: DaemonSettings) -> Self {
        Self {
            driver,
            settings,
            state: RwLock::new(DaemonProcessState::default()),
            child: Mutex::new(None),
            failures: SyncMutex::new(VecDeque::new()),
        }
    }

    /// Daemon endpoint
    pub fn endpoint(&self) -> &str {
        self.driver.endpoint()
    }

    /// Snapshot of the daemon state
    pub fn status(&self) -> DaemonProcessState {
        self.state.read().clone()
    }

    /// Re-detects whether the daemon is installed while it is not running
    pub async fn refresh(&self) -> DaemonProcessState {
        let _child = self.child.lock().await;

        let status = self.state.read().status;
        if matches!(status, DaemonStatus::NotInstalled | DaemonStatus::InstalledStopped) {
            let installed = self.driver.is_installed().await;
            self.update(|s| {
                s.status = if installed {
                    DaemonStatus::InstalledStopped
                } else {
                    DaemonStatus::NotInstalled
                };
            });
        }

        self.status()
    }

    /// Installs the daemon. Succeeds immediately when already installed.
    pub async fn install(&self) -> Result<()> {
        let _child = self.child.lock().await;
        self.install_locked().await
    }

    /// Starts the daemon and waits for it to become healthy.
    ///
    /// A no-op when the owned daemon is already running. An explicit start
    /// resets the restart counter and lifts a suspended auto-restart.
    pub async fn start(&self) -> Result<()> {
        let mut child = self.child.lock().await;

        if self.owns_running(&mut child) {
            debug!("Daemon already running");
            return Ok(());
        }

        self.failures.lock().clear();
        self.update(|s| {
            s.restart_count = 0;
            s.auto_restart_suspended = false;
        });

        self.start_locked(&mut child).await
    }

    /// Stops the owned daemon: SIGTERM, bounded wait, then kill
    pub async fn stop(&self) -> Result<()> {
        let mut child = self.child.lock().await;

        let Some(process) = child.take() else {
            return Err(StopError::NotRunning.into());
        };

        let pid = process.id();
        self.update(|s| s.status = DaemonStatus::Stopping);
        info!(pid = ?pid, "Stopping daemon");

        self.shutdown(process).await;

        self.update(|s| {
            s.status = DaemonStatus::InstalledStopped;
            s.pid = None;
            s.last_health_check_at = None;
        });
        info!("Daemon stopped");

        Ok(())
    }

    /// Probes the daemon endpoint within the health timeout.
    ///
    /// Only records the time of a successful check; never changes status.
    pub async fn health_check(&self) -> bool {
        let timeout = self.settings.health_timeout();
        let healthy = tokio::time::timeout(timeout, self.driver.probe(timeout))
            .await
            .unwrap_or(false);

        if healthy {
            self.state.write().last_health_check_at = Some(Utc::now());
        }

        healthy
    }

    /// Makes sure a healthy daemon serves the endpoint, installing (when
    /// allowed) and starting it if needed
    pub async fn ensure_running(&self) -> Result<()> {
        // Fast path
        if self.is_running_and_fresh() {
            return Ok(());
        }

        if self.health_check().await {
            debug!("Daemon endpoint {} is healthy", self.endpoint());
            return Ok(());
        }

        let mut child = self.child.lock().await;

        // Another caller may have started it while we waited for the lock
        if self.owns_running(&mut child) && self.health_check().await {
            return Ok(());
        }

        if self.state.read().auto_restart_suspended {
            return Err(StartError::Spawn(
                "automatic restart is suspended after repeated failures, start the daemon explicitly"
                    .to_string(),
            )
            .into());
        }

        if !self.driver.is_installed().await {
            if !self.settings.auto_install {
                self.update(|s| s.status = DaemonStatus::NotInstalled);
                return Err(StartError::BinaryMissing(self.settings.binary.display().to_string()).into());
            }
            self.install_locked().await?;
        }

        self.start_locked(&mut child).await
    }

    /// Runs one supervision step: a health check and, on failure, at most
    /// one restart attempt. Gives up after `max_failures` failures within
    /// the restart window.
    pub async fn monitor_tick(&self) -> DaemonProcessState {
        if !self.is_supervised() {
            return self.status();
        }

        if self.health_check().await {
            if self.state.read().status == DaemonStatus::Failed {
                let mut child = self.child.lock().await;
                if child_alive(&mut child) {
                    info!("Daemon recovered");
                    self.update(|s| {
                        s.status = DaemonStatus::Running;
                        s.last_error = None;
                    });
                }
            }
            return self.status();
        }

        let mut child = self.child.lock().await;

        // Stopped or suspended while we waited for the lock
        if !self.is_supervised() {
            return self.status();
        }

        let failures = self.record_failure();

        if failures >= self.settings.max_failures as usize {
            if let Some(process) = child.take() {
                self.shutdown(process).await;
            }

            let message = format!(
                "{} health check failures within {:?}, automatic restart suspended",
                failures,
                self.settings.restart_window()
            );
            self.update(|s| {
                s.status = DaemonStatus::Failed;
                s.pid = None;
                s.auto_restart_suspended = true;
                s.last_error = Some(message.clone());
            });
            error!(failures, "Daemon keeps failing, giving up on automatic restart");

            return self.status();
        }

        let restart_count = {
            let mut state = self.state.write();
            state.status = DaemonStatus::Failed;
            state.last_error = Some("health check failed".to_string());
            state.restart_count += 1;
            state.restart_count
        };
        warn!(restart_count, failures, "Daemon health check failed, restarting");

        if let Err(e) = self.start_locked(&mut child).await {
            warn!(restart_count, "Daemon restart failed: {}", e);
        }

        self.status()
    }

    /// Runs [`monitor_tick`](Self::monitor_tick) every health interval
    /// until `cancel` fires
    pub fn spawn_monitor(self: &Arc<Self>, cancel: CancellationToken) -> JoinHandle<()> {
        let supervisor = Arc::clone(self);
        let interval = self.settings.health_interval();

        tokio::spawn(async move {
            info!("Starting daemon health monitor (every {:?})", interval);

            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {
                        supervisor.monitor_tick().await;
                    }
                }
            }

            info!("Daemon health monitor stopped");
        })
    }

    fn update(&self, f: impl FnOnce(&mut DaemonProcessState)) {
        f(&mut self.state.write());
    }

    fn is_running_and_fresh(&self) -> bool {
        let staleness = chrono::Duration::from_std(self.settings.health_staleness())
            .unwrap_or_else(|_| chrono::Duration::seconds(30));
        let state = self.state.read();
        state.status.is_running() && state.is_fresh(staleness)
    }

    /// Whether the monitor is responsible for the daemon right now
    fn is_supervised(&self) -> bool {
        let state = self.state.read();
        matches!(state.status, DaemonStatus::Running | DaemonStatus::Failed)
            && !state.auto_restart_suspended
    }

    fn owns_running(&self, child: &mut ChildSlot) -> bool {
        self.state.read().status.is_running() && child_alive(child)
    }

    fn record_failure(&self) -> usize {
        let now = Instant::now();
        let window = self.settings.restart_window();

        let mut failures = self.failures.lock();
        failures.push_back(now);
        while let Some(first) = failures.front() {
            if now.duration_since(*first) > window {
                failures.pop_front();
            } else {
                break;
            }
        }

        failures.len()
    }

    fn fail(&self, err: &Error) {
        self.update(|s| {
            s.status = DaemonStatus::Failed;
            s.pid = None;
            s.last_error = Some(err.to_string());
        });
        error!("Daemon failed to start: {}", err);
    }

    async fn install_locked(&self) -> Result<()> {
        if self.driver.is_installed().await {
            debug!("Daemon already installed");
            self.update(|s| {
                if s.status == DaemonStatus::NotInstalled {
                    s.status = DaemonStatus::InstalledStopped;
                }
            });
            return Ok(());
        }

        info!("Installing daemon");

        if let Err(e) = self.driver.install().await {
            error!("Daemon installation failed: {}", e);
            self.update(|s| s.last_error = Some(e.to_string()));
            return Err(e);
        }

        self.update(|s| {
            s.status = DaemonStatus::InstalledStopped;
            s.last_error = None;
        });
        info!("Daemon installed");

        Ok(())
    }

    async fn start_locked(&self, child: &mut ChildSlot) -> Result<()> {
        // Reap a previous child before spawning a new one
        if let Some(process) = child.take() {
            self.shutdown(process).await;
        }

        if !self.driver.is_installed().await {
            self.update(|s| {
                s.status = DaemonStatus::NotInstalled;
                s.pid = None;
            });
            return Err(StartError::BinaryMissing(self.settings.binary.display().to_string()).into());
        }

        // Check if something else already serves the endpoint
        if self.driver.probe(self.settings.health_timeout()).await {
            return Err(StartError::AlreadyRunning(self.endpoint().to_string()).into());
        }

        if self.driver.port_in_use() {
            return Err(StartError::PortInUse(self.endpoint().to_string()).into());
        }

        self.update(|s| {
            s.status = DaemonStatus::Starting;
            s.pid = None;
        });
        info!("Starting daemon at {}", self.endpoint());

        let mut process = match self.driver.spawn().await {
            Ok(process) => process,
            Err(e) => {
                self.fail(&e);
                return Err(e);
            }
        };

        let pid = process.id();
        self.update(|s| s.pid = pid);

        let startup_timeout = self.settings.startup_timeout();
        let deadline = Instant::now() + startup_timeout;

        loop {
            if self.driver.probe(self.settings.health_timeout()).await {
                self.update(|s| {
                    s.status = DaemonStatus::Running;
                    s.last_health_check_at = Some(Utc::now());
                    s.last_error = None;
                });
                *child = Some(process);
                info!(pid = ?pid, "Daemon is running");
                return Ok(());
            }

            if process.has_exited().unwrap_or(false) {
                let err: Error = StartError::Spawn("daemon exited during startup".to_string()).into();
                self.fail(&err);
                return Err(err);
            }

            if Instant::now() >= deadline {
                self.shutdown(process).await;
                let err: Error = StartError::Timeout(startup_timeout).into();
                self.fail(&err);
                return Err(err);
            }

            tokio::time::sleep(STARTUP_POLL_INTERVAL).await;
        }
    }

    async fn shutdown(&self, mut process: Box<dyn DaemonProcess>) {
        if let Err(e) = process.terminate() {
            warn!("Failed to signal daemon: {}", e);
        }

        let stop_timeout = self.settings.stop_timeout();
        match tokio::time::timeout(stop_timeout, process.wait()).await {
            Ok(Ok(())) => debug!("Daemon exited"),
            Ok(Err(e)) => warn!("Failed to wait for daemon: {}", e),
            Err(_) => {
                warn!("Daemon did not exit within {:?}, killing it", stop_timeout);
                if let Err(e) = process.kill() {
                    warn!("Failed to kill daemon: {}", e);
                }
                let _ = process.wait().await;
            }
        }
    }
}

fn child_alive(child: &mut ChildSlot) -> bool {
    child
        .as_mut()
        .map_or(false, |process| !process.has_exited().unwrap_or(true))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockDriver, SpawnBehavior};
    use common::error::InstallError;

    fn settings() -> DaemonSettings {
        DaemonSettings {
            startup_timeout_secs: 1,
            stop_timeout_secs: 1,
            health_timeout_ms: 100,
            ..DaemonSettings::default()
        }
    }

    fn supervisor(driver: &MockDriver) -> ProcessSupervisor {
        ProcessSupervisor::new(Arc::new(driver.clone()), settings())
    }

    #[tokio::test]
    async fn test_start_and_idempotent_start() {
        let driver = MockDriver::new();
        let supervisor = supervisor(&driver);

        assert_eq!(supervisor.refresh().await.status, DaemonStatus::InstalledStopped);

        supervisor.start().await.unwrap();
        let state = supervisor.status();
        assert_eq!(state.status, DaemonStatus::Running);
        assert!(state.pid.is_some());
        assert!(state.last_health_check_at.is_some());

        // Already running: no second spawn
        supervisor.start().await.unwrap();
        assert_eq!(driver.spawn_calls(), 1);
        assert_eq!(supervisor.status().pid, state.pid);
    }

    #[tokio::test]
    async fn test_stop() {
        let driver = MockDriver::new();
        let supervisor = supervisor(&driver);

        let err = supervisor.stop().await.unwrap_err();
        assert!(matches!(err, Error::Stop(StopError::NotRunning)));

        supervisor.start().await.unwrap();
        supervisor.stop().await.unwrap();

        let state = supervisor.status();
        assert_eq!(state.status, DaemonStatus::InstalledStopped);
        assert!(state.pid.is_none());
        assert!(!driver.is_healthy());
    }

    #[tokio::test]
    async fn test_stop_escalates_to_kill() {
        let driver = MockDriver::new();
        driver.set_ignore_terminate(true);
        let supervisor = supervisor(&driver);

        supervisor.start().await.unwrap();
        supervisor.stop().await.unwrap();

        assert_eq!(driver.kill_calls(), 1);
        assert_eq!(supervisor.status().status, DaemonStatus::InstalledStopped);
    }

    #[tokio::test]
    async fn test_foreign_daemon() {
        let driver = MockDriver::new();
        driver.set_healthy(true);
        let supervisor = supervisor(&driver);

        let err = supervisor.start().await.unwrap_err();
        assert!(matches!(err, Error::Start(StartError::AlreadyRunning(_))));

        // A healthy endpoint satisfies ensure_running without a spawn
        supervisor.ensure_running().await.unwrap();
        assert_eq!(driver.spawn_calls(), 0);
    }

    #[tokio::test]
    async fn test_port_in_use() {
        let driver = MockDriver::new();
        driver.set_port_in_use(true);
        let supervisor = supervisor(&driver);

        let err = supervisor.start().await.unwrap_err();
        assert!(matches!(err, Error::Start(StartError::PortInUse(_))));
        assert_eq!(driver.spawn_calls(), 0);
    }

    #[tokio::test]
    async fn test_missing_binary_and_auto_install() {
        let driver = MockDriver::new().not_installed();
        let supervisor = supervisor(&driver);

        let err = supervisor.start().await.unwrap_err();
        assert!(matches!(err, Error::Start(StartError::BinaryMissing(_))));
        assert_eq!(supervisor.status().status, DaemonStatus::NotInstalled);

        let err = supervisor.ensure_running().await.unwrap_err();
        assert!(matches!(err, Error::Start(StartError::BinaryMissing(_))));

        let auto = ProcessSupervisor::new(
            Arc::new(driver.clone()),
            DaemonSettings {
                auto_install: true,
                ..settings()
            },
        );
        auto.ensure_running().await.unwrap();
        assert_eq!(driver.install_calls(), 1);
        assert_eq!(auto.status().status, DaemonStatus::Running);
    }

    #[tokio::test]
    async fn test_install_failure_and_idempotence() {
        let driver = MockDriver::new().not_installed();
        let supervisor = supervisor(&driver);

        driver.fail_install(InstallError::Permission("need root".to_string()));
        let err = supervisor.install().await.unwrap_err();
        assert!(matches!(err, Error::Install(InstallError::Permission(_))));
        assert!(supervisor.status().last_error.is_some());

        supervisor.install().await.unwrap();
        supervisor.install().await.unwrap();
        assert_eq!(driver.install_calls(), 2);
        assert_eq!(supervisor.status().status, DaemonStatus::InstalledStopped);
    }

    #[tokio::test]
    async fn test_startup_timeout_and_crash() {
        let driver = MockDriver::new();
        let supervisor = supervisor(&driver);

        driver.set_spawn_behavior(SpawnBehavior::Unhealthy);
        let err = supervisor.start().await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(supervisor.status().status, DaemonStatus::Failed);

        driver.set_spawn_behavior(SpawnBehavior::Crash);
        let err = supervisor.start().await.unwrap_err();
        assert!(matches!(err, Error::Start(StartError::Spawn(_))));
        assert!(supervisor.status().pid.is_none());
    }

    #[tokio::test]
    async fn test_monitor_restarts_after_failure() {
        let driver = MockDriver::new();
        let supervisor = supervisor(&driver);
        supervisor.start().await.unwrap();

        // Daemon dies
        driver.set_healthy(false);
        let state = supervisor.monitor_tick().await;

        assert_eq!(state.status, DaemonStatus::Running);
        assert_eq!(state.restart_count, 1);
        assert_eq!(driver.spawn_calls(), 2);
    }

    #[tokio::test]
    async fn test_monitor_gives_up_after_repeated_failures() {
        let driver = MockDriver::new();
        let supervisor = supervisor(&driver);
        supervisor.start().await.unwrap();

        driver.set_spawn_behavior(SpawnBehavior::Crash);
        driver.set_healthy(false);

        for _ in 0..3 {
            supervisor.monitor_tick().await;
        }

        let state = supervisor.status();
        assert_eq!(state.status, DaemonStatus::Failed);
        assert!(state.auto_restart_suspended);
        assert_eq!(state.restart_count, 2);

        // Suspended: further ticks do nothing
        let spawns = driver.spawn_calls();
        supervisor.monitor_tick().await;
        assert_eq!(driver.spawn_calls(), spawns);
        assert!(supervisor.ensure_running().await.is_err());

        // An explicit start recovers
        driver.set_spawn_behavior(SpawnBehavior::Healthy);
        supervisor.start().await.unwrap();
        let state = supervisor.status();
        assert_eq!(state.status, DaemonStatus::Running);
        assert_eq!(state.restart_count, 0);
        assert!(!state.auto_restart_suspended);
    }

    #[tokio::test]
    async fn test_health_check_records_timestamp_only() {
        let driver = MockDriver::new();
        let supervisor = supervisor(&driver);

        assert!(!supervisor.health_check().await);
        assert!(supervisor.status().last_health_check_at.is_none());

        driver.set_healthy(true);
        assert!(supervisor.health_check().await);
        let state = supervisor.status();
        assert!(state.last_health_check_at.is_some());
        assert_eq!(state.status, DaemonStatus::NotInstalled);
    }

    #[tokio::test]
    async fn test_monitor_can_be_cancelled() {
        let driver = MockDriver::new();
        let supervisor = Arc::new(supervisor(&driver));
        let cancel = CancellationToken::new();

        let handle = supervisor.spawn_monitor(cancel.clone());
        cancel.cancel();
        handle.await.unwrap();
    }
}
