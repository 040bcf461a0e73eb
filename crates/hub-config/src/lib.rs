//! Configuration management for ModelHub
//!
//! Settings are layered: built-in defaults, an optional TOML file,
//! `MODELHUB__*` environment variables and finally the legacy `HF_TOKEN`,
//! `HF_CACHE_DIR` and `OLLAMA_HOST` variables.

pub mod settings;

pub use settings::{DaemonSettings, HubSettings, LoggingSettings, Settings};

use std::path::Path;

use config::{Config, Environment, File};
use tracing::debug;

use common::error::{Error, Result};

/// Default configuration file name, looked up in the working directory
pub const DEFAULT_CONFIG_FILE: &str = "modelhub.toml";

/// Loads settings from `path` (required) or from `modelhub.toml` (optional)
pub fn load(path: Option<&Path>) -> Result<Settings> {
    let file = match path {
        Some(path) => File::from(path).required(true),
        None => File::with_name(DEFAULT_CONFIG_FILE).required(false),
    };

    let builder = Config::builder()
        .add_source(file)
        .add_source(
            Environment::with_prefix("MODELHUB")
                .separator("__")
                .try_parsing(true),
        )
        .set_override_option("hub.token", std::env::var("HF_TOKEN").ok())
        .and_then(|b| b.set_override_option("cache_dir", std::env::var("HF_CACHE_DIR").ok()))
        .and_then(|b| {
            b.set_override_option(
                "daemon.endpoint",
                std::env::var("OLLAMA_HOST").ok().map(|host| normalize_endpoint(&host)),
            )
        })
        .map_err(|e| Error::Config(e.to_string()))?;

    let settings: Settings = builder
        .build()
        .and_then(|c| c.try_deserialize())
        .map_err(|e| Error::Config(e.to_string()))?;

    settings.validate()?;

    debug!(
        cache_dir = %settings.cache_dir.display(),
        sources = ?settings.enabled_sources,
        daemon = %settings.daemon.endpoint,
        "configuration loaded"
    );

    Ok(settings)
}

/// Adds a scheme to bare `host:port` daemon addresses
pub fn normalize_endpoint(host: &str) -> String {
    let host = host.trim().trim_end_matches('/');
    if host.starts_with("http://") || host.starts_with("https://") {
        host.to_string()
    } else {
        format!("http://{}", host)
    }
}
