//! Local daemon backend
//!
//! Talks to an Ollama compatible daemon over its HTTP API. The daemon owns
//! model residency itself, so loading is deferred-cost: a load only checks
//! that the model is present and issues a handle.

use std::io;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use futures::{StreamExt, TryStreamExt};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_util::codec::{FramedRead, LinesCodec};
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use common::error::{
    DeleteError, DownloadError, Error, InferenceError, LoadError, Result, UnloadError,
};
use common::models::{
    InferenceOptions, InferenceTarget, ModelHandle, ModelSource, ModelState, ModelSummary,
    ProbeResult,
};
use common::types::ProgressSink;
use common::utils::truncate_string;
use hub_config::DaemonSettings;

use crate::backend::BackendManager;
use crate::downloader::ProgressTracker;

/// Timeout for metadata requests (tags, show, version)
const METADATA_TIMEOUT: Duration = Duration::from_secs(10);

/// One line of the `/api/pull` progress stream
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PullStatus {
    /// Phase reported by the daemon ("pulling manifest", "success", ...)
    #[serde(default)]
    pub status: String,

    /// Layer digest being fetched
    pub digest: Option<String>,

    /// Layer size
    pub total: Option<u64>,

    /// Bytes fetched of the layer
    pub completed: Option<u64>,

    /// Error message, ends the stream
    pub error: Option<String>,
}

/// A model as reported by `/api/tags`
#[derive(Debug, Clone, Deserialize)]
struct TagEntry {
    name: String,
    #[serde(default)]
    size: u64,
    modified_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<TagEntry>,
}

#[derive(Debug, Default, Deserialize)]
struct ShowDetails {
    format: Option<String>,
    family: Option<String>,
    parameter_size: Option<String>,
    quantization_level: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ShowResponse {
    #[serde(default)]
    details: ShowDetails,
}

#[derive(Debug, Serialize)]
struct GenerateRequest<'a> {
    model: &'a str,
    prompt: &'a str,
    stream: bool,
    #[serde(skip_serializing_if = "serde_json::Map::is_empty")]
    options: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
    error: Option<String>,
}

/// Backend manager for the local daemon
pub struct DaemonManager {
    /// HTTP client
    client: Client,

    /// Daemon base URL
    endpoint: String,

    /// Live handles (handle id -> model name)
    handles: DashMap<Uuid, String>,
}

impl DaemonManager {
    /// Creates a manager for the daemon at `settings.endpoint`
    pub fn new(settings: &DaemonSettings) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            endpoint: settings.endpoint.trim_end_matches('/').to_string(),
            handles: DashMap::new(),
        })
    }

    /// Daemon base URL
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.endpoint, path)
    }

    async fn tags(&self) -> Result<Vec<TagEntry>> {
        let resp = self
            .client
            .get(self.url("/api/tags"))
            .timeout(METADATA_TIMEOUT)
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?
            .error_for_status()
            .map_err(|e| Error::Http(e.to_string()))?;

        let tags: TagsResponse = resp.json().await.map_err(|e| Error::Serialization(e.to_string()))?;

        Ok(tags.models)
    }

    async fn find_tag(&self, name: &str) -> Result<Option<TagEntry>> {
        Ok(self
            .tags()
            .await?
            .into_iter()
            .find(|tag| tag_matches(&tag.name, name)))
    }

    fn has_live_handle(&self, name: &str) -> bool {
        self.handles.iter().any(|entry| tag_matches(entry.value(), name))
    }

    async fn pull(
        &self,
        name: &str,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let request = self
            .client
            .post(self.url("/api/pull"))
            .json(&json!({ "name": name, "stream": true }))
            .send();

        let resp = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled.into()),
            resp = request => resp.map_err(|e| DownloadError::Network(e.to_string()))?,
        };

        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            return Err(pull_failure(name, &format!("HTTP {}: {}", status, body)).into());
        }

        let body = resp
            .bytes_stream()
            .map_err(|e| io::Error::new(io::ErrorKind::Other, e));
        let mut lines = FramedRead::new(StreamReader::new(body), LinesCodec::new());

        let mut tracker = ProgressTracker::new(self.identity(name), progress, None);
        let mut succeeded = false;

        loop {
            let line = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(DownloadError::Cancelled.into()),
                line = lines.next() => line,
            };

            let Some(line) = line else { break };
            let line = line.map_err(|e| DownloadError::Network(e.to_string()))?;
            if line.trim().is_empty() {
                continue;
            }

            let status: PullStatus = serde_json::from_str(&line)?;

            if let Some(error) = status.error {
                return Err(pull_failure(name, &error).into());
            }

            if let Some(completed) = status.completed {
                tracker.set_counts(completed, status.total);
            }
            if status.status != tracker.progress().status {
                tracker.set_status(status.status.clone());
            }

            succeeded = status.status == "success";
        }

        if !succeeded {
            return Err(DownloadError::Network(format!("pull of {} ended early", name)).into());
        }

        tracker.finish();

        Ok(())
    }
}

#[async_trait]
impl BackendManager for DaemonManager {
    fn source(&self) -> ModelSource {
        ModelSource::Daemon
    }

    fn requires_daemon(&self) -> bool {
        true
    }

    fn lazy_load(&self) -> bool {
        true
    }

    async fn available(&self) -> bool {
        self.client
            .get(self.url("/api/version"))
            .timeout(METADATA_TIMEOUT)
            .send()
            .await
            .map_or(false, |resp| resp.status().is_success())
    }

    async fn probe(&self, name: &str) -> Result<ProbeResult> {
        let resp = self
            .client
            .post(self.url("/api/show"))
            .timeout(METADATA_TIMEOUT)
            .json(&json!({ "name": name }))
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Ok(ProbeResult::absent());
        }

        let show: ShowResponse = resp
            .error_for_status()
            .map_err(|e| Error::Http(e.to_string()))?
            .json()
            .await
            .map_err(|e| Error::Serialization(e.to_string()))?;

        let mut result = ProbeResult::absent();
        result.present_locally = true;
        result.size_bytes = self.find_tag(name).await?.map(|tag| tag.size);

        let details = show.details;
        for (key, value) in [
            ("format", details.format),
            ("family", details.family),
            ("parameter_size", details.parameter_size),
            ("quantization_level", details.quantization_level),
        ] {
            if let Some(value) = value {
                result.metadata.insert(key.to_string(), value);
            }
        }

        Ok(result)
    }

    async fn download(
        &self,
        name: &str,
        progress: &dyn ProgressSink,
        cancel: CancellationToken,
    ) -> Result<u64> {
        let present = self
            .find_tag(name)
            .await
            .map_err(|e| DownloadError::Network(e.to_string()))?;
        if let Some(tag) = present {
            debug!("Daemon already has {}, skipping pull", tag.name);
            return Ok(tag.size);
        }

        info!("Pulling daemon model {}", name);

        self.pull(name, progress, &cancel).await?;

        let size = self
            .find_tag(name)
            .await?
            .map(|tag| tag.size)
            .unwrap_or_default();

        Ok(size)
    }

    async fn discard_partial(&self, name: &str) -> Result<()> {
        // The daemon keeps partial layers in its own blob store; removing the
        // model drops its manifest so the next pull starts clean.
        let result = self
            .client
            .delete(self.url("/api/delete"))
            .timeout(METADATA_TIMEOUT)
            .json(&json!({ "name": name }))
            .send()
            .await;

        if let Err(e) = result {
            debug!("Could not discard partial pull of {}: {}", name, e);
        }

        Ok(())
    }

    async fn load(&self, name: &str) -> Result<ModelHandle> {
        if self.find_tag(name).await?.is_none() {
            return Err(LoadError::NotDownloaded(name.to_string()).into());
        }

        let handle = ModelHandle::issue(self.identity(name));
        self.handles.insert(handle.id, name.to_string());

        debug!("Issued handle {} for daemon model {}", handle.id, name);

        Ok(handle)
    }

    async fn unload(&self, handle: &ModelHandle) -> Result<()> {
        let (_, name) = self
            .handles
            .remove(&handle.id)
            .ok_or_else(|| UnloadError::AlreadyUnloaded(handle.identity.name.clone()))?;

        // Ask the daemon to evict the model now instead of at keep-alive expiry
        let result = self
            .client
            .post(self.url("/api/generate"))
            .timeout(METADATA_TIMEOUT)
            .json(&json!({ "model": name, "keep_alive": 0 }))
            .send()
            .await;

        if let Err(e) = result {
            warn!("Daemon did not acknowledge unload of {}: {}", name, e);
        }

        Ok(())
    }

    async fn infer(
        &self,
        target: InferenceTarget<'_>,
        prompt: &str,
        options: &InferenceOptions,
    ) -> Result<String> {
        if let InferenceTarget::Handle(handle) = target {
            if !self.handles.contains_key(&handle.id) {
                return Err(InferenceError::InvalidInput(format!(
                    "handle {} is no longer live",
                    handle.id
                ))
                .into());
            }
        }

        if prompt.trim().is_empty() {
            return Err(InferenceError::InvalidInput("prompt is empty".to_string()).into());
        }

        let request = GenerateRequest {
            model: target.name(),
            prompt,
            stream: false,
            options: generate_options(options),
        };

        let mut builder = self.client.post(self.url("/api/generate")).json(&request);
        if let Some(timeout) = options.timeout {
            builder = builder.timeout(timeout);
        }

        let map_err = |e: reqwest::Error| -> Error {
            if e.is_timeout() {
                InferenceError::Timeout(options.timeout.unwrap_or_default()).into()
            } else {
                InferenceError::BackendUnavailable(e.to_string()).into()
            }
        };

        let resp = builder.send().await.map_err(map_err)?;
        let status = resp.status();
        let text = resp.text().await.map_err(map_err)?;

        let parsed: Option<GenerateResponse> = serde_json::from_str(&text).ok();

        if status == StatusCode::BAD_REQUEST || status == StatusCode::NOT_FOUND {
            let message = parsed
                .and_then(|p| p.error)
                .unwrap_or_else(|| truncate_string(&text, 200));
            return Err(InferenceError::InvalidInput(message).into());
        }
        if !status.is_success() {
            return Err(InferenceError::BackendUnavailable(format!(
                "HTTP {}: {}",
                status,
                truncate_string(&text, 200)
            ))
            .into());
        }

        match parsed {
            Some(GenerateResponse { error: Some(error), .. }) => {
                Err(InferenceError::BackendUnavailable(error).into())
            }
            Some(generated) => Ok(generated.response),
            None => Err(InferenceError::BackendUnavailable("unexpected response".to_string()).into()),
        }
    }

    async fn delete(&self, name: &str) -> Result<()> {
        if self.has_live_handle(name) {
            return Err(DeleteError::InUse(name.to_string()).into());
        }

        let resp = self
            .client
            .delete(self.url("/api/delete"))
            .timeout(METADATA_TIMEOUT)
            .json(&json!({ "name": name }))
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        if resp.status() == StatusCode::NOT_FOUND {
            return Err(DeleteError::NotFound(name.to_string()).into());
        }
        resp.error_for_status()
            .map_err(|e| Error::Http(e.to_string()))?;

        info!("Deleted daemon model {}", name);

        Ok(())
    }

    async fn list(&self) -> Result<Vec<ModelSummary>> {
        let mut models: Vec<ModelSummary> = self
            .tags()
            .await?
            .into_iter()
            .map(|tag| {
                let state = if self.has_live_handle(&tag.name) {
                    ModelState::Loaded
                } else {
                    ModelState::Downloaded
                };
                ModelSummary {
                    identity: self.identity(&tag.name),
                    size_bytes: Some(tag.size),
                    state,
                    modified_at: tag.modified_at,
                }
            })
            .collect();

        models.sort_by(|a, b| a.identity.cmp(&b.identity));

        Ok(models)
    }
}

/// Whether a tag listed by the daemon refers to the requested model name.
/// A bare name means the `latest` tag.
fn tag_matches(listed: &str, requested: &str) -> bool {
    if listed == requested {
        return true;
    }
    match (listed.strip_suffix(":latest"), requested.strip_suffix(":latest")) {
        (Some(base), None) => base == requested,
        (None, Some(base)) => base == listed,
        _ => false,
    }
}

fn pull_failure(name: &str, message: &str) -> DownloadError {
    let lower = message.to_lowercase();
    if lower.contains("not found") || lower.contains("does not exist") {
        DownloadError::NotFound(name.to_string())
    } else if lower.contains("no space left") {
        DownloadError::DiskSpace(message.to_string())
    } else {
        DownloadError::Network(message.to_string())
    }
}

fn generate_options(options: &InferenceOptions) -> serde_json::Map<String, serde_json::Value> {
    let mut map = options.extra.clone();
    if let Some(max_tokens) = options.max_tokens {
        map.insert("num_predict".to_string(), max_tokens.into());
    }
    if let Some(temperature) = options.temperature {
        map.insert("temperature".to_string(), temperature.into());
    }
    map
}
