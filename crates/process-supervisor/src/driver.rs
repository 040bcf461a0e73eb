//! Daemon driver
//!
//! The supervisor's state machine is independent of how the daemon is
//! installed, spawned and probed. Those mechanics sit behind
//! [`DaemonDriver`]; [`OllamaDriver`] is the production implementation.

use std::net::TcpListener;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, Url};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use common::error::{Error, InstallError, Result, StartError};
use hub_config::DaemonSettings;

/// A spawned daemon process
#[async_trait]
pub trait DaemonProcess: Send + Sync {
    /// OS process id
    fn id(&self) -> Option<u32>;

    /// Requests a graceful shutdown (SIGTERM on Unix)
    fn terminate(&mut self) -> Result<()>;

    /// Kills the process immediately
    fn kill(&mut self) -> Result<()>;

    /// Returns true if the process has exited
    fn has_exited(&mut self) -> Result<bool>;

    /// Waits for the process to exit
    async fn wait(&mut self) -> Result<()>;
}

/// Install/spawn/probe mechanics of one daemon implementation
#[async_trait]
pub trait DaemonDriver: Send + Sync {
    /// Base URL the daemon serves
    fn endpoint(&self) -> &str;

    /// Whether the daemon binary is available
    async fn is_installed(&self) -> bool;

    /// Installs the daemon binary
    async fn install(&self) -> Result<()>;

    /// Spawns the daemon
    async fn spawn(&self) -> Result<Box<dyn DaemonProcess>>;

    /// Probes the daemon endpoint; true when it answers successfully
    async fn probe(&self, timeout: Duration) -> bool;

    /// Whether the daemon port is bound by some other process
    fn port_in_use(&self) -> bool {
        port_in_use(self.endpoint())
    }
}

/// Child process spawned through `tokio::process`
pub struct ChildProcess {
    child: Child,
}

impl ChildProcess {
    pub fn new(child: Child) -> Self {
        Self { child }
    }
}

#[async_trait]
impl DaemonProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    #[cfg(unix)]
    fn terminate(&mut self) -> Result<()> {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        let Some(pid) = self.child.id() else {
            // Already reaped
            return Ok(());
        };

        kill(Pid::from_raw(pid as i32), Signal::SIGTERM)
            .map_err(|e| Error::Internal(format!("failed to signal pid {}: {}", pid, e)))
    }

    #[cfg(not(unix))]
    fn terminate(&mut self) -> Result<()> {
        self.kill()
    }

    fn kill(&mut self) -> Result<()> {
        self.child.start_kill().map_err(Error::from)
    }

    fn has_exited(&mut self) -> Result<bool> {
        Ok(self.child.try_wait()?.is_some())
    }

    async fn wait(&mut self) -> Result<()> {
        let status = self.child.wait().await?;
        debug!("Daemon process exited with {}", status);
        Ok(())
    }
}

/// Driver for the Ollama daemon
pub struct OllamaDriver {
    /// Daemon settings
    settings: DaemonSettings,

    /// Client used for health probes
    client: Client,
}

impl OllamaDriver {
    /// Creates a driver from settings
    pub fn new(settings: DaemonSettings) -> Result<Self> {
        let client = Client::builder()
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self { settings, client })
    }

    /// `host:port` the daemon should bind, as expected in `OLLAMA_HOST`
    fn bind_address(&self) -> Option<String> {
        let url = Url::parse(&self.settings.endpoint).ok()?;
        Some(format!("{}:{}", url.host_str()?, url.port_or_known_default()?))
    }
}

#[async_trait]
impl DaemonDriver for OllamaDriver {
    fn endpoint(&self) -> &str {
        &self.settings.endpoint
    }

    async fn is_installed(&self) -> bool {
        Command::new(&self.settings.binary)
            .arg("--version")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await
            .map_or(false, |status| status.success())
    }

    async fn install(&self) -> Result<()> {
        if !cfg!(target_os = "linux") {
            return Err(InstallError::UnsupportedPlatform(format!(
                "automatic installation is only available on Linux, install {} manually",
                self.settings.binary.display()
            ))
            .into());
        }

        info!("Running daemon installer from {}", self.settings.install_script_url);

        let script = format!("curl -fsSL {} | sh", self.settings.install_script_url);
        let output = Command::new("sh")
            .arg("-c")
            .arg(&script)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::PermissionDenied => InstallError::Permission(e.to_string()),
                std::io::ErrorKind::NotFound => InstallError::UnsupportedPlatform(e.to_string()),
                _ => InstallError::Network(e.to_string()),
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            let lower = stderr.to_lowercase();
            let error = if lower.contains("permission") || lower.contains("sudo") || lower.contains("root") {
                InstallError::Permission(stderr)
            } else {
                InstallError::Network(stderr)
            };
            return Err(error.into());
        }

        if !self.is_installed().await {
            return Err(InstallError::Network(format!(
                "installer finished but {} is still not available",
                self.settings.binary.display()
            ))
            .into());
        }

        Ok(())
    }

    async fn spawn(&self) -> Result<Box<dyn DaemonProcess>> {
        let mut cmd = Command::new(&self.settings.binary);
        cmd.arg("serve")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);

        if let Some(address) = self.bind_address() {
            cmd.env("OLLAMA_HOST", address);
        }

        let child = cmd.spawn().map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => {
                StartError::BinaryMissing(self.settings.binary.display().to_string())
            }
            _ => StartError::Spawn(e.to_string()),
        })?;

        Ok(Box::new(ChildProcess::new(child)))
    }

    async fn probe(&self, timeout: Duration) -> bool {
        let url = format!("{}/api/version", self.settings.endpoint.trim_end_matches('/'));
        match self.client.get(&url).timeout(timeout).send().await {
            Ok(resp) => resp.status().is_success(),
            Err(e) => {
                debug!("Health probe of {} failed: {}", url, e);
                false
            }
        }
    }
}

/// Whether the local port of `endpoint` is already bound.
///
/// Remote endpoints are never reported as in use.
pub fn port_in_use(endpoint: &str) -> bool {
    let Ok(url) = Url::parse(endpoint) else {
        return false;
    };
    let (Some(host), Some(port)) = (url.host_str(), url.port_or_known_default()) else {
        return false;
    };

    match TcpListener::bind((host, port)) {
        Ok(_) => false,
        Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => true,
        Err(e) => {
            warn!("Could not check port {} on {}: {}", port, host, e);
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_port_in_use() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        assert!(port_in_use(&format!("http://127.0.0.1:{}", port)));
        drop(listener);
        assert!(!port_in_use(&format!("http://127.0.0.1:{}", port)));
        assert!(!port_in_use("not a url"));
    }

    #[test]
    fn test_bind_address() {
        let driver = OllamaDriver::new(DaemonSettings {
            endpoint: "http://0.0.0.0:11500".to_string(),
            ..DaemonSettings::default()
        })
        .unwrap();
        assert_eq!(driver.bind_address().as_deref(), Some("0.0.0.0:11500"));
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let driver = OllamaDriver::new(DaemonSettings {
            binary: "/nonexistent/ollama".into(),
            endpoint: "http://127.0.0.1:9".to_string(),
            ..DaemonSettings::default()
        })
        .unwrap();

        assert!(!driver.is_installed().await);
        assert!(!driver.probe(Duration::from_millis(200)).await);

        let err = driver.spawn().await.err().unwrap();
        assert!(matches!(err, Error::Start(StartError::BinaryMissing(_))));
    }
}
