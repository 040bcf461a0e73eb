//! Backend manager contract
//!
//! Every model source implements [`BackendManager`]. The orchestration
//! service only ever talks to backends through this trait and consults the
//! capability flags instead of branching on the source.

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use common::error::Result;
use common::models::{
    InferenceOptions, InferenceTarget, ModelHandle, ModelIdentity, ModelInfo, ModelSource,
    ModelSummary, ProbeResult,
};
use common::types::ProgressSink;

/// Capability contract implemented once per model source
#[async_trait]
pub trait BackendManager: Send + Sync {
    /// Source this manager serves
    fn source(&self) -> ModelSource;

    /// Whether operations need the local daemon to be running
    fn requires_daemon(&self) -> bool {
        false
    }

    /// Whether inference can address a downloaded model by name without an
    /// explicit load (load is deferred-cost)
    fn lazy_load(&self) -> bool {
        false
    }

    /// Identity of a model served by this manager
    fn identity(&self, name: &str) -> ModelIdentity {
        ModelIdentity::new(self.source(), name)
    }

    /// Whether the backend is currently reachable
    async fn available(&self) -> bool {
        true
    }

    /// Checks whether the model is present locally. Never mutates state.
    async fn probe(&self, name: &str) -> Result<ProbeResult>;

    /// Describes the model: local presence plus the metadata the source
    /// reports about it
    async fn info(&self, name: &str) -> Result<ModelInfo> {
        let probe = self.probe(name).await?;
        Ok(ModelInfo {
            identity: self.identity(name),
            present_locally: probe.present_locally,
            size_bytes: probe.size_bytes,
            metadata: probe.metadata.into_iter().collect(),
        })
    }

    /// Downloads the model and returns its size on disk.
    ///
    /// Calling this for a model that is already present returns the cached
    /// size without contacting the remote.
    async fn download(
        &self,
        name: &str,
        progress: &dyn ProgressSink,
        cancel: CancellationToken,
    ) -> Result<u64>;

    /// Removes artifacts left behind by a failed or cancelled download
    async fn discard_partial(&self, name: &str) -> Result<()>;

    /// Makes the model resident and returns a fresh handle
    async fn load(&self, name: &str) -> Result<ModelHandle>;

    /// Releases resident resources without touching on-disk artifacts
    async fn unload(&self, handle: &ModelHandle) -> Result<()>;

    /// Runs inference
    async fn infer(
        &self,
        target: InferenceTarget<'_>,
        prompt: &str,
        options: &InferenceOptions,
    ) -> Result<String>;

    /// Deletes on-disk artifacts. Refused while a handle for the model is live.
    async fn delete(&self, name: &str) -> Result<()>;

    /// Lists models present locally
    async fn list(&self) -> Result<Vec<ModelSummary>>;
}
