//! In-memory daemon driver for tests

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use common::error::{InstallError, Result, StartError};

use crate::driver::{DaemonDriver, DaemonProcess};

/// What a freshly spawned mock daemon does
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpawnBehavior {
    /// Answers health probes right away
    Healthy,
    /// Stays alive but never answers
    Unhealthy,
    /// Exits immediately
    Crash,
}

struct MockState {
    installed: AtomicBool,
    healthy: AtomicBool,
    port_in_use: AtomicBool,
    ignore_terminate: AtomicBool,
    behavior: Mutex<SpawnBehavior>,
    install_error: Mutex<Option<InstallError>>,
    next_pid: AtomicU32,
    spawn_calls: AtomicUsize,
    install_calls: AtomicUsize,
    kill_calls: AtomicUsize,
}

/// Scriptable [`DaemonDriver`]
#[derive(Clone)]
pub struct MockDriver {
    state: Arc<MockState>,
}

impl MockDriver {
    /// An installed, stopped daemon whose spawns come up healthy
    pub fn new() -> Self {
        Self {
            state: Arc::new(MockState {
                installed: AtomicBool::new(true),
                healthy: AtomicBool::new(false),
                port_in_use: AtomicBool::new(false),
                ignore_terminate: AtomicBool::new(false),
                behavior: Mutex::new(SpawnBehavior::Healthy),
                install_error: Mutex::new(None),
                next_pid: AtomicU32::new(1000),
                spawn_calls: AtomicUsize::new(0),
                install_calls: AtomicUsize::new(0),
                kill_calls: AtomicUsize::new(0),
            }),
        }
    }

    /// Starts without the daemon binary
    pub fn not_installed(self) -> Self {
        self.state.installed.store(false, Ordering::SeqCst);
        self
    }

    /// Sets whether the endpoint answers health probes
    pub fn set_healthy(&self, healthy: bool) {
        self.state.healthy.store(healthy, Ordering::SeqCst);
    }

    /// Sets what the next spawns do
    pub fn set_spawn_behavior(&self, behavior: SpawnBehavior) {
        *self.state.behavior.lock() = behavior;
    }

    /// Reports the port as taken
    pub fn set_port_in_use(&self, in_use: bool) {
        self.state.port_in_use.store(in_use, Ordering::SeqCst);
    }

    /// Makes spawned processes ignore graceful termination
    pub fn set_ignore_terminate(&self, ignore: bool) {
        self.state.ignore_terminate.store(ignore, Ordering::SeqCst);
    }

    /// Fails the next install with `error`
    pub fn fail_install(&self, error: InstallError) {
        *self.state.install_error.lock() = Some(error);
    }

    pub fn is_healthy(&self) -> bool {
        self.state.healthy.load(Ordering::SeqCst)
    }

    pub fn spawn_calls(&self) -> usize {
        self.state.spawn_calls.load(Ordering::SeqCst)
    }

    pub fn install_calls(&self) -> usize {
        self.state.install_calls.load(Ordering::SeqCst)
    }

    pub fn kill_calls(&self) -> usize {
        self.state.kill_calls.load(Ordering::SeqCst)
    }
}

impl Default for MockDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl DaemonDriver for MockDriver {
    fn endpoint(&self) -> &str {
        "http://127.0.0.1:11434"
    }

    async fn is_installed(&self) -> bool {
        self.state.installed.load(Ordering::SeqCst)
    }

    async fn install(&self) -> Result<()> {
        self.state.install_calls.fetch_add(1, Ordering::SeqCst);

        if let Some(error) = self.state.install_error.lock().take() {
            return Err(error.into());
        }

        self.state.installed.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn spawn(&self) -> Result<Box<dyn DaemonProcess>> {
        self.state.spawn_calls.fetch_add(1, Ordering::SeqCst);

        if !self.state.installed.load(Ordering::SeqCst) {
            return Err(StartError::BinaryMissing("mock".to_string()).into());
        }

        let behavior = *self.state.behavior.lock();
        if behavior == SpawnBehavior::Healthy {
            self.state.healthy.store(true, Ordering::SeqCst);
        }

        Ok(Box::new(MockProcess {
            state: Arc::clone(&self.state),
            pid: self.state.next_pid.fetch_add(1, Ordering::SeqCst),
            exited: behavior == SpawnBehavior::Crash,
        }))
    }

    async fn probe(&self, _timeout: Duration) -> bool {
        self.state.healthy.load(Ordering::SeqCst)
    }

    fn port_in_use(&self) -> bool {
        self.state.port_in_use.load(Ordering::SeqCst)
    }
}

struct MockProcess {
    state: Arc<MockState>,
    pid: u32,
    exited: bool,
}

impl MockProcess {
    fn exit(&mut self) {
        self.exited = true;
        self.state.healthy.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl DaemonProcess for MockProcess {
    fn id(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn terminate(&mut self) -> Result<()> {
        if !self.state.ignore_terminate.load(Ordering::SeqCst) {
            self.exit();
        }
        Ok(())
    }

    fn kill(&mut self) -> Result<()> {
        self.state.kill_calls.fetch_add(1, Ordering::SeqCst);
        self.exit();
        Ok(())
    }

    fn has_exited(&mut self) -> Result<bool> {
        Ok(self.exited)
    }

    async fn wait(&mut self) -> Result<()> {
        if !self.exited {
            std::future::pending::<()>().await;
        }
        Ok(())
    }
}
