//! Settings structures and defaults
//!
//! Every field has a default so that an empty configuration file (or no file
//! at all) yields a working local setup.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use common::error::{Error, Result};
use common::models::{ModelIdentity, ModelSource};

/// Top-level settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Root directory for downloaded artifacts
    pub cache_dir: PathBuf,

    /// Sources for which a backend manager is constructed
    pub enabled_sources: Vec<ModelSource>,

    /// Source assumed for startup models given without a prefix
    pub default_source: ModelSource,

    /// Models downloaded at startup (`source:name` or bare name)
    pub startup_models: Vec<String>,

    /// Default inference timeout in seconds
    pub inference_timeout_secs: u64,

    /// Hosted hub settings
    pub hub: HubSettings,

    /// Local daemon settings
    pub daemon: DaemonSettings,

    /// Logging settings
    pub logging: LoggingSettings,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            enabled_sources: ModelSource::ALL.to_vec(),
            default_source: ModelSource::Hub,
            startup_models: Vec::new(),
            inference_timeout_secs: 120,
            hub: HubSettings::default(),
            daemon: DaemonSettings::default(),
            logging: LoggingSettings::default(),
        }
    }
}

impl Settings {
    /// Default inference timeout
    pub fn inference_timeout(&self) -> Duration {
        Duration::from_secs(self.inference_timeout_secs)
    }

    /// Parses the startup model list
    pub fn startup_identities(&self) -> Result<Vec<ModelIdentity>> {
        self.startup_models
            .iter()
            .map(|entry| ModelIdentity::parse_with_default(entry, self.default_source))
            .collect()
    }

    /// Checks the settings for values the core cannot work with
    pub fn validate(&self) -> Result<()> {
        if self.enabled_sources.is_empty() {
            return Err(Error::Config("no model sources enabled".to_string()));
        }

        if self.inference_timeout_secs == 0 {
            return Err(Error::Config("inference_timeout_secs must be positive".to_string()));
        }

        if self.daemon.startup_timeout_secs == 0 || self.daemon.health_timeout_ms == 0 {
            return Err(Error::Config("daemon timeouts must be positive".to_string()));
        }

        if self.daemon.max_failures == 0 {
            return Err(Error::Config("daemon.max_failures must be at least 1".to_string()));
        }

        for identity in self.startup_identities()? {
            if !self.enabled_sources.contains(&identity.source) {
                return Err(Error::Config(format!(
                    "startup model {} uses disabled source {}",
                    identity, identity.source
                )));
            }
        }

        Ok(())
    }
}

/// Hosted hub settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HubSettings {
    /// Hub base URL
    pub endpoint: String,

    /// Hosted inference base URL
    pub inference_endpoint: String,

    /// Repository revision to download
    pub revision: String,

    /// Access token
    pub token: Option<String>,

    /// Upper bound on the combined size of resident models
    pub max_resident_bytes: u64,

    /// HTTP request timeout in seconds
    pub request_timeout_secs: u64,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            endpoint: "https://huggingface.co".to_string(),
            inference_endpoint: "https://api-inference.huggingface.co/models".to_string(),
            revision: "main".to_string(),
            token: None,
            max_resident_bytes: 16 * 1024 * 1024 * 1024,
            request_timeout_secs: 300,
        }
    }
}

/// Local inference daemon settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonSettings {
    /// Daemon API base URL
    pub endpoint: String,

    /// Daemon executable
    pub binary: PathBuf,

    /// Whether ensure-running may install the daemon
    pub auto_install: bool,

    /// Installer script URL
    pub install_script_url: String,

    /// Seconds to wait for the daemon to become healthy after spawning
    pub startup_timeout_secs: u64,

    /// Seconds to wait after SIGTERM before killing
    pub stop_timeout_secs: u64,

    /// Health probe timeout in milliseconds
    pub health_timeout_ms: u64,

    /// Seconds between background health checks
    pub health_interval_secs: u64,

    /// Age in seconds after which a successful health check is stale
    pub health_staleness_secs: u64,

    /// Window in seconds over which health failures are counted
    pub restart_window_secs: u64,

    /// Failures within the window after which auto-restart is suspended
    pub max_failures: u32,
}

impl Default for DaemonSettings {
    fn default() -> Self {
        Self {
            endpoint: "http://127.0.0.1:11434".to_string(),
            binary: PathBuf::from("ollama"),
            auto_install: false,
            install_script_url: "https://ollama.com/install.sh".to_string(),
            startup_timeout_secs: 30,
            stop_timeout_secs: 10,
            health_timeout_ms: 2000,
            health_interval_secs: 10,
            health_staleness_secs: 30,
            restart_window_secs: 60,
            max_failures: 3,
        }
    }
}

impl DaemonSettings {
    /// Startup timeout
    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    /// Stop timeout
    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    /// Health probe timeout
    pub fn health_timeout(&self) -> Duration {
        Duration::from_millis(self.health_timeout_ms)
    }

    /// Background health check interval
    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs)
    }

    /// Staleness window for the last successful health check
    pub fn health_staleness(&self) -> Duration {
        Duration::from_secs(self.health_staleness_secs)
    }

    /// Failure counting window
    pub fn restart_window(&self) -> Duration {
        Duration::from_secs(self.restart_window_secs)
    }
}

/// Logging settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    /// Default filter directive, overridden by `RUST_LOG`
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    pub json: bool,

    /// Directory for daily-rolling log files; stderr only when unset
    pub directory: Option<PathBuf>,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            directory: None,
        }
    }
}

fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("modelhub")
}
