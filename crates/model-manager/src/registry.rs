//! Manager registry
//!
//! Maps every enabled [`ModelSource`] to its backend manager. The registry is
//! built once at startup and read-only afterwards.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use common::error::{Error, Result};
use common::models::ModelSource;
use hub_config::Settings;

use crate::backend::BackendManager;
use crate::daemon::DaemonManager;
use crate::hub::HubManager;

/// Shared backend manager
pub type SharedManager = Arc<dyn BackendManager>;

/// Immutable source -> manager map
#[derive(Clone, Default)]
pub struct ManagerRegistry {
    managers: BTreeMap<ModelSource, SharedManager>,
}

impl ManagerRegistry {
    /// Starts an empty registry builder
    pub fn builder() -> ManagerRegistryBuilder {
        ManagerRegistryBuilder::default()
    }

    /// Builds the production managers for every enabled source
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let mut builder = Self::builder();

        for source in &settings.enabled_sources {
            let manager: SharedManager = match source {
                ModelSource::Hub => Arc::new(HubManager::new(settings.hub.clone(), &settings.cache_dir)?),
                ModelSource::Daemon => Arc::new(DaemonManager::new(&settings.daemon)?),
            };
            builder = builder.register(manager)?;
        }

        let registry = builder.build();
        info!("Registered model sources: {:?}", registry.list_sources());

        Ok(registry)
    }

    /// Manager serving `source`
    pub fn get_manager(&self, source: ModelSource) -> Result<SharedManager> {
        self.managers
            .get(&source)
            .cloned()
            .ok_or_else(|| Error::UnknownSource(source.to_string()))
    }

    /// Enabled sources, in a stable order
    pub fn list_sources(&self) -> Vec<ModelSource> {
        self.managers.keys().copied().collect()
    }

    /// All registered managers
    pub fn managers(&self) -> impl Iterator<Item = &SharedManager> {
        self.managers.values()
    }

    /// Whether any registered manager needs the local daemon
    pub fn needs_daemon(&self) -> bool {
        self.managers.values().any(|m| m.requires_daemon())
    }
}

/// Collects managers before freezing them into a [`ManagerRegistry`]
#[derive(Default)]
pub struct ManagerRegistryBuilder {
    managers: BTreeMap<ModelSource, SharedManager>,
}

impl ManagerRegistryBuilder {
    /// Registers a manager; each source may only be registered once
    pub fn register(mut self, manager: SharedManager) -> Result<Self> {
        let source = manager.source();
        if self.managers.contains_key(&source) {
            return Err(Error::Config(format!("source {} registered twice", source)));
        }
        self.managers.insert(source, manager);
        Ok(self)
    }

    /// Freezes the registry
    pub fn build(self) -> ManagerRegistry {
        ManagerRegistry {
            managers: self.managers,
        }
    }
}
