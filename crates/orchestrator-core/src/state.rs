//! Model state registry
//!
//! This module provides the single source of truth for the lifecycle state
//! of every referenced model. Anyone may read it; only the orchestration
//! service mutates it.

use dashmap::DashMap;

use common::error::{Error, Result};
use common::models::{
    DownloadProgress, ModelHandle, ModelIdentity, ModelRecord, ModelState, ModelSummary,
    ProbeResult,
};

/// In-memory map of model identity to lifecycle record
#[derive(Debug, Default)]
pub struct ModelStateRegistry {
    records: DashMap<ModelIdentity, ModelRecord>,
}

impl ModelStateRegistry {
    /// Creates an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Record of `identity`, if it was ever referenced
    pub fn get(&self, identity: &ModelIdentity) -> Option<ModelRecord> {
        self.records.get(identity).map(|r| r.value().clone())
    }

    /// State of `identity`; `Unknown` when never referenced
    pub fn state(&self, identity: &ModelIdentity) -> ModelState {
        self.records
            .get(identity)
            .map_or(ModelState::Unknown, |r| r.state)
    }

    /// All records, ordered by identity
    pub fn snapshot(&self) -> Vec<ModelRecord> {
        let mut records: Vec<ModelRecord> = self.records.iter().map(|r| r.value().clone()).collect();
        records.sort_by(|a, b| a.identity.cmp(&b.identity));
        records
    }

    /// Number of records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Returns true if no model was referenced yet
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Creates the record if needed and returns its state
    pub(crate) fn ensure(&self, identity: &ModelIdentity) -> ModelState {
        self.records
            .entry(identity.clone())
            .or_insert_with(|| ModelRecord::new(identity.clone(), ModelState::Unknown))
            .state
    }

    /// Settles an `Unknown` record from a probe and returns the state
    pub(crate) fn resolve(&self, identity: &ModelIdentity, probe: &ProbeResult) -> ModelState {
        let mut record = self
            .records
            .entry(identity.clone())
            .or_insert_with(|| ModelRecord::new(identity.clone(), ModelState::Unknown));

        if record.state == ModelState::Unknown {
            if probe.present_locally {
                record.set_state(ModelState::Downloaded);
                record.size_bytes = probe.size_bytes;
            } else {
                record.set_state(ModelState::NotDownloaded);
            }
        }

        record.state
    }

    /// Upgrades an existing record to `Downloaded` when a listing shows the
    /// model locally. Never creates a record.
    pub(crate) fn observe(&self, summary: &ModelSummary) -> Option<ModelState> {
        let mut record = self.records.get_mut(&summary.identity)?;

        if matches!(record.state, ModelState::Unknown | ModelState::NotDownloaded) {
            record.set_state(ModelState::Downloaded);
            record.size_bytes = summary.size_bytes;
        }

        Some(record.state)
    }

    /// Moves the record to `to` if its state is one of `allowed`.
    ///
    /// Returns the record as it was before the transition.
    pub(crate) fn transition(
        &self,
        identity: &ModelIdentity,
        allowed: &[ModelState],
        to: ModelState,
        operation: &'static str,
    ) -> Result<ModelRecord> {
        let mut record = self
            .records
            .entry(identity.clone())
            .or_insert_with(|| ModelRecord::new(identity.clone(), ModelState::Unknown));

        if !allowed.contains(&record.state) {
            return Err(Error::StateConflict {
                identity: identity.clone(),
                operation,
                state: record.state,
            });
        }

        let previous = record.clone();
        record.set_state(to);
        record.last_error = None;

        Ok(previous)
    }

    pub(crate) fn set_downloaded(&self, identity: &ModelIdentity, size_bytes: u64) {
        if let Some(mut record) = self.records.get_mut(identity) {
            record.set_state(ModelState::Downloaded);
            record.size_bytes = Some(size_bytes);
        }
    }

    pub(crate) fn set_state(&self, identity: &ModelIdentity, state: ModelState) {
        if let Some(mut record) = self.records.get_mut(identity) {
            record.set_state(state);
        }
    }

    pub(crate) fn set_loaded(&self, identity: &ModelIdentity, handle: ModelHandle) {
        if let Some(mut record) = self.records.get_mut(identity) {
            record.set_loaded(handle);
        }
    }

    /// Reverts a failed transition to `to`, recording the error
    pub(crate) fn revert(&self, identity: &ModelIdentity, to: ModelState, error: &Error) {
        if let Some(mut record) = self.records.get_mut(identity) {
            record.set_state(to);
            record.last_error = Some(error.to_string());
        }
    }

    /// Reverts a failed unload, restoring the live handle
    pub(crate) fn revert_loaded(&self, identity: &ModelIdentity, handle: ModelHandle, error: &Error) {
        if let Some(mut record) = self.records.get_mut(identity) {
            record.set_loaded(handle);
            record.last_error = Some(error.to_string());
        }
    }

    /// Records an error without changing state
    pub(crate) fn record_error(&self, identity: &ModelIdentity, error: &Error) {
        if let Some(mut record) = self.records.get_mut(identity) {
            record.last_error = Some(error.to_string());
        }
    }

    /// Stores download progress while the record is `Downloading`
    pub(crate) fn update_progress(&self, identity: &ModelIdentity, progress: &DownloadProgress) {
        if let Some(mut record) = self.records.get_mut(identity) {
            if record.state == ModelState::Downloading {
                record.download_progress = Some(progress.clone());
            }
        }
    }

    /// Drops the record
    pub(crate) fn remove(&self, identity: &ModelIdentity) {
        self.records.remove(identity);
    }
}
