//! Hosted hub backend
//!
//! Downloads repository snapshots from a Hugging Face compatible hub into the
//! local cache, keeps track of resident sessions and forwards inference to the
//! hosted inference endpoint.

use std::collections::{BTreeMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;
use walkdir::WalkDir;

use common::error::{DeleteError, DownloadError, Error, InferenceError, LoadError, Result, UnloadError};
use common::models::{
    InferenceOptions, InferenceTarget, ModelHandle, ModelInfo, ModelSource, ModelState,
    ModelSummary, ProbeResult,
};
use common::types::ProgressSink;
use common::utils::{format_bytes, truncate_string};
use hub_config::HubSettings;

use crate::backend::BackendManager;
use crate::downloader::{map_io_error, map_reqwest_error, FileDownloader, ProgressTracker};

/// Completion marker written into every finished snapshot
pub const MANIFEST_FILE: &str = ".modelhub.json";

/// Suffix of the staging directory used while downloading
const PARTIAL_SUFFIX: &str = ".partial";

/// Extensions recognised as model weights
const WEIGHT_EXTENSIONS: [&str; 7] = ["safetensors", "bin", "gguf", "pt", "pth", "onnx", "h5"];

/// Snapshot manifest persisted next to the downloaded files
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotManifest {
    /// Repository id
    pub name: String,
    /// Requested revision
    pub revision: String,
    /// Commit sha reported by the hub
    pub sha: Option<String>,
    /// Relative paths of the downloaded files
    pub files: Vec<String>,
    /// Total size on disk
    pub size_bytes: u64,
    /// Completion timestamp
    pub downloaded_at: DateTime<Utc>,
}

/// Repository metadata returned by the hub
#[derive(Debug, Clone, Deserialize)]
struct RepoInfo {
    sha: Option<String>,
    #[serde(default)]
    siblings: Vec<RepoFile>,
}

#[derive(Debug, Clone, Deserialize)]
struct RepoFile {
    rfilename: String,
    size: Option<u64>,
    lfs: Option<LfsInfo>,
}

#[derive(Debug, Clone, Deserialize)]
struct LfsInfo {
    sha256: Option<String>,
    size: Option<u64>,
}

impl RepoFile {
    fn expected_size(&self) -> Option<u64> {
        self.lfs.as_ref().and_then(|l| l.size).or(self.size)
    }
}

/// Public model card metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubModelInfo {
    /// Repository id
    #[serde(alias = "modelId")]
    pub id: String,
    /// Owner
    pub author: Option<String>,
    /// Last modification
    #[serde(rename = "lastModified")]
    pub last_modified: Option<String>,
    /// Tags
    #[serde(default)]
    pub tags: Vec<String>,
    /// Download count
    #[serde(default)]
    pub downloads: u64,
    /// Like count
    #[serde(default)]
    pub likes: u64,
}

/// A model made resident by a load
#[derive(Debug, Clone)]
struct HubSession {
    /// Repository id
    name: String,
    /// Bytes accounted against the resident budget
    size_bytes: u64,
}

/// Backend manager for the hosted hub
pub struct HubManager {
    /// HTTP client
    client: Client,

    /// Streaming downloader
    downloader: FileDownloader,

    /// Hub settings
    settings: HubSettings,

    /// Root of the snapshot cache
    cache_root: PathBuf,

    /// Resident sessions (handle id -> session)
    sessions: DashMap<Uuid, HubSession>,

    /// Bytes currently resident
    resident_bytes: AtomicU64,
}

impl HubManager {
    /// Creates a hub manager caching snapshots under `cache_dir/hub`
    ///
    /// The client carries no total timeout since weight files may stream for
    /// a long time; metadata requests apply `request_timeout_secs` themselves.
    pub fn new(settings: HubSettings, cache_dir: &Path) -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("modelhub/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| Error::Config(format!("failed to build HTTP client: {}", e)))?;

        let cache_root = cache_dir.join("hub");
        std::fs::create_dir_all(&cache_root)?;

        Ok(Self {
            downloader: FileDownloader::new(client.clone(), settings.token.clone()),
            client,
            settings,
            cache_root,
            sessions: DashMap::new(),
            resident_bytes: AtomicU64::new(0),
        })
    }

    /// Directory holding the snapshot of `name`
    pub fn snapshot_dir(&self, name: &str) -> PathBuf {
        self.cache_root
            .join(format!("models--{}", name.replace('/', "--")))
    }

    fn staging_dir(&self, name: &str) -> PathBuf {
        let mut dir = self.snapshot_dir(name).into_os_string();
        dir.push(PARTIAL_SUFFIX);
        PathBuf::from(dir)
    }

    fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.settings.request_timeout_secs)
    }

    /// Bytes currently accounted to resident sessions
    pub fn resident_bytes(&self) -> u64 {
        self.resident_bytes.load(Ordering::SeqCst)
    }

    /// Fetches the public model card
    pub async fn model_info(&self, name: &str) -> Result<HubModelInfo> {
        let url = format!("{}/api/models/{}", self.settings.endpoint, name);
        let resp = self
            .authorized(self.client.get(&url))
            .timeout(self.request_timeout())
            .send()
            .await
            .map_err(|e| Error::Http(e.to_string()))?;

        if matches!(resp.status(), StatusCode::NOT_FOUND | StatusCode::UNAUTHORIZED) {
            return Err(DownloadError::NotFound(name.to_string()).into());
        }

        resp.error_for_status()
            .map_err(|e| Error::Http(e.to_string()))?
            .json::<HubModelInfo>()
            .await
            .map_err(|e| Error::Serialization(e.to_string()))
    }

    fn authorized(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.settings.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn read_manifest(&self, name: &str) -> Option<SnapshotManifest> {
        let path = self.snapshot_dir(name).join(MANIFEST_FILE);
        let bytes = tokio::fs::read(&path).await.ok()?;

        match serde_json::from_slice(&bytes) {
            Ok(manifest) => Some(manifest),
            Err(e) => {
                warn!("Ignoring unreadable manifest {}: {}", path.display(), e);
                None
            }
        }
    }

    async fn fetch_repo_info(&self, name: &str, cancel: &CancellationToken) -> Result<RepoInfo> {
        let url = format!(
            "{}/api/models/{}/revision/{}?blobs=true",
            self.settings.endpoint, name, self.settings.revision
        );

        let request = self
            .authorized(self.client.get(&url))
            .timeout(self.request_timeout())
            .send();
        let resp = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled.into()),
            resp = request => resp.map_err(map_reqwest_error)?,
        };

        match resp.status() {
            status if status.is_success() => {}
            StatusCode::NOT_FOUND | StatusCode::UNAUTHORIZED => {
                return Err(DownloadError::NotFound(name.to_string()).into());
            }
            status => {
                return Err(DownloadError::Network(format!("HTTP {} for {}", status, url)).into());
            }
        }

        resp.json::<RepoInfo>().await.map_err(map_reqwest_error)
    }

    async fn download_snapshot(
        &self,
        name: &str,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<u64> {
        let info = self.fetch_repo_info(name, cancel).await?;
        if info.siblings.is_empty() {
            return Err(DownloadError::NotFound(format!("{} has no files", name)).into());
        }

        let staging = self.staging_dir(name);
        remove_dir_if_exists(&staging).await?;
        tokio::fs::create_dir_all(&staging).await.map_err(map_io_error)?;

        let total: Option<u64> = info.siblings.iter().map(RepoFile::expected_size).sum();
        let mut tracker = ProgressTracker::new(self.identity(name), progress, total);
        let mut files = Vec::with_capacity(info.siblings.len());
        let mut size_bytes = 0u64;

        for file in &info.siblings {
            let relative = safe_relative_path(&file.rfilename).ok_or_else(|| {
                DownloadError::Network(format!("refusing unsafe file name {}", file.rfilename))
            })?;

            tracker.set_status(file.rfilename.clone());

            let url = format!(
                "{}/{}/resolve/{}/{}",
                self.settings.endpoint, name, self.settings.revision, file.rfilename
            );
            let expected = file.lfs.as_ref().and_then(|l| l.sha256.as_deref());

            size_bytes += self
                .downloader
                .fetch(&url, &staging.join(relative), expected, &mut tracker, cancel)
                .await?;
            files.push(file.rfilename.clone());
        }

        let manifest = SnapshotManifest {
            name: name.to_string(),
            revision: self.settings.revision.clone(),
            sha: info.sha,
            files,
            size_bytes,
            downloaded_at: Utc::now(),
        };
        tokio::fs::write(staging.join(MANIFEST_FILE), serde_json::to_vec_pretty(&manifest)?)
            .await
            .map_err(map_io_error)?;

        let target = self.snapshot_dir(name);
        remove_dir_if_exists(&target).await?;
        tokio::fs::rename(&staging, &target).await?;

        tracker.finish();

        Ok(size_bytes)
    }

    fn live_session_for(&self, name: &str) -> bool {
        self.sessions.iter().any(|entry| entry.value().name == name)
    }

    fn reserve(&self, bytes: u64) -> Result<()> {
        let max = self.settings.max_resident_bytes;
        self.resident_bytes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |current| {
                current.checked_add(bytes).filter(|total| *total <= max)
            })
            .map(|_| ())
            .map_err(|current| {
                LoadError::ResourceExhausted(format!(
                    "need {}, {} of {} already resident",
                    format_bytes(bytes),
                    format_bytes(current),
                    format_bytes(max)
                ))
                .into()
            })
    }
}

#[async_trait]
impl BackendManager for HubManager {
    fn source(&self) -> ModelSource {
        ModelSource::Hub
    }

    async fn probe(&self, name: &str) -> Result<ProbeResult> {
        match self.read_manifest(name).await {
            Some(manifest) => {
                let mut result = ProbeResult::present(manifest.size_bytes);
                result.metadata.insert("revision".to_string(), manifest.revision);
                if let Some(sha) = manifest.sha {
                    result.metadata.insert("sha".to_string(), sha);
                }
                Ok(result)
            }
            None => Ok(ProbeResult::absent()),
        }
    }

    async fn info(&self, name: &str) -> Result<ModelInfo> {
        let probe = self.probe(name).await?;
        let mut metadata: BTreeMap<String, String> = probe.metadata.into_iter().collect();

        if probe.present_locally {
            if let Some(architecture) = read_architecture(&self.snapshot_dir(name)).await {
                metadata.insert("architecture".to_string(), architecture);
            }
        }

        match self.model_info(name).await {
            Ok(card) => {
                if let Some(author) = card.author {
                    metadata.insert("author".to_string(), author);
                }
                if let Some(last_modified) = card.last_modified {
                    metadata.insert("last_modified".to_string(), last_modified);
                }
                if !card.tags.is_empty() {
                    metadata.insert("tags".to_string(), card.tags.join(","));
                }
                metadata.insert("downloads".to_string(), card.downloads.to_string());
                metadata.insert("likes".to_string(), card.likes.to_string());
            }
            // A cached snapshot is still worth describing offline
            Err(e) if probe.present_locally => warn!("Model card of {} unavailable: {}", name, e),
            Err(e) => return Err(e),
        }

        Ok(ModelInfo {
            identity: self.identity(name),
            present_locally: probe.present_locally,
            size_bytes: probe.size_bytes,
            metadata,
        })
    }

    async fn download(
        &self,
        name: &str,
        progress: &dyn ProgressSink,
        cancel: CancellationToken,
    ) -> Result<u64> {
        if let Some(manifest) = self.read_manifest(name).await {
            debug!("Model {} already cached, skipping download", name);
            return Ok(manifest.size_bytes);
        }

        info!("Downloading hub model {}", name);

        let result = self.download_snapshot(name, progress, &cancel).await;

        if result.is_err() {
            let _ = remove_dir_if_exists(&self.staging_dir(name)).await;
        }

        result
    }

    async fn discard_partial(&self, name: &str) -> Result<()> {
        remove_dir_if_exists(&self.staging_dir(name)).await
    }

    async fn load(&self, name: &str) -> Result<ModelHandle> {
        let manifest = self
            .read_manifest(name)
            .await
            .ok_or_else(|| LoadError::NotDownloaded(name.to_string()))?;

        let has_weights = manifest.files.iter().any(|file| {
            Path::new(file)
                .extension()
                .and_then(|ext| ext.to_str())
                .map_or(false, |ext| WEIGHT_EXTENSIONS.contains(&ext))
        });
        if !has_weights {
            return Err(LoadError::Incompatible(format!("{} contains no weight files", name)).into());
        }

        let architecture = read_architecture(&self.snapshot_dir(name)).await;

        self.reserve(manifest.size_bytes)?;

        let handle = ModelHandle::issue(self.identity(name));
        self.sessions.insert(
            handle.id,
            HubSession {
                name: name.to_string(),
                size_bytes: manifest.size_bytes,
            },
        );

        info!(
            "Loaded hub model {} ({}, architecture {})",
            name,
            format_bytes(manifest.size_bytes),
            architecture.as_deref().unwrap_or("unknown")
        );

        Ok(handle)
    }

    async fn unload(&self, handle: &ModelHandle) -> Result<()> {
        let (_, session) = self
            .sessions
            .remove(&handle.id)
            .ok_or_else(|| UnloadError::AlreadyUnloaded(handle.identity.name.clone()))?;

        self.resident_bytes.fetch_sub(session.size_bytes, Ordering::SeqCst);

        info!("Unloaded hub model {}", session.name);

        Ok(())
    }

    async fn infer(
        &self,
        target: InferenceTarget<'_>,
        prompt: &str,
        options: &InferenceOptions,
    ) -> Result<String> {
        let resident = match target {
            InferenceTarget::Handle(handle) => self.sessions.contains_key(&handle.id),
            InferenceTarget::Name(name) => self.live_session_for(name),
        };
        if !resident {
            return Err(InferenceError::InvalidInput(format!("{} is not loaded", target.name())).into());
        }

        if prompt.trim().is_empty() {
            return Err(InferenceError::InvalidInput("prompt is empty".to_string()).into());
        }

        let mut parameters = options.extra.clone();
        parameters.insert("return_full_text".to_string(), false.into());
        if let Some(max_tokens) = options.max_tokens {
            parameters.insert("max_new_tokens".to_string(), max_tokens.into());
        }
        if let Some(temperature) = options.temperature {
            parameters.insert("temperature".to_string(), temperature.into());
        }

        let body = serde_json::json!({
            "inputs": prompt,
            "parameters": parameters,
            "options": { "wait_for_model": true },
        });

        let url = format!("{}/{}", self.settings.inference_endpoint, target.name());
        let timeout = options.timeout.unwrap_or_else(|| self.request_timeout());
        let request = self
            .authorized(self.client.post(&url))
            .timeout(timeout)
            .json(&body);

        let resp = request.send().await.map_err(|e| map_inference_error(e, timeout))?;
        let status = resp.status();
        let text = resp.text().await.map_err(|e| map_inference_error(e, timeout))?;

        if status == StatusCode::BAD_REQUEST || status == StatusCode::UNPROCESSABLE_ENTITY {
            return Err(InferenceError::InvalidInput(truncate_string(&text, 200)).into());
        }
        if !status.is_success() {
            return Err(InferenceError::BackendUnavailable(format!(
                "HTTP {}: {}",
                status,
                truncate_string(&text, 200)
            ))
            .into());
        }

        parse_generated_text(&text)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        if self.live_session_for(name) {
            return Err(DeleteError::InUse(name.to_string()).into());
        }

        let dir = self.snapshot_dir(name);
        if !tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            return Err(DeleteError::NotFound(name.to_string()).into());
        }

        tokio::fs::remove_dir_all(&dir).await?;
        remove_dir_if_exists(&self.staging_dir(name)).await?;

        info!("Deleted hub model {}", name);

        Ok(())
    }

    async fn list(&self) -> Result<Vec<ModelSummary>> {
        let mut entries = match tokio::fs::read_dir(&self.cache_root).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let loaded: HashSet<String> = self
            .sessions
            .iter()
            .map(|entry| entry.value().name.clone())
            .collect();

        let mut models = Vec::new();

        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            // Staging directories of running downloads
            if path.to_string_lossy().ends_with(PARTIAL_SUFFIX) {
                continue;
            }

            let manifest_path = path.join(MANIFEST_FILE);
            let Ok(bytes) = tokio::fs::read(&manifest_path).await else {
                continue;
            };
            let manifest: SnapshotManifest = match serde_json::from_slice(&bytes) {
                Ok(manifest) => manifest,
                Err(e) => {
                    warn!("Skipping {}: {}", manifest_path.display(), e);
                    continue;
                }
            };

            let size = tokio::task::spawn_blocking(move || directory_size(&path))
                .await
                .map_err(|e| Error::Internal(e.to_string()))?;

            let state = if loaded.contains(&manifest.name) {
                ModelState::Loaded
            } else {
                ModelState::Downloaded
            };

            models.push(ModelSummary {
                identity: self.identity(&manifest.name),
                size_bytes: Some(size),
                state,
                modified_at: Some(manifest.downloaded_at.to_rfc3339()),
            });
        }

        models.sort_by(|a, b| a.identity.cmp(&b.identity));

        Ok(models)
    }
}

fn map_inference_error(err: reqwest::Error, timeout: Duration) -> Error {
    if err.is_timeout() {
        InferenceError::Timeout(timeout).into()
    } else {
        InferenceError::BackendUnavailable(err.to_string()).into()
    }
}

/// Extracts the generated text from a hosted inference response
fn parse_generated_text(body: &str) -> Result<String> {
    #[derive(Deserialize)]
    struct Generated {
        generated_text: String,
    }

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Response {
        Many(Vec<Generated>),
        One(Generated),
        Failure { error: String },
    }

    match serde_json::from_str::<Response>(body) {
        Ok(Response::Many(items)) => items
            .into_iter()
            .next()
            .map(|g| g.generated_text)
            .ok_or_else(|| InferenceError::BackendUnavailable("empty response".to_string()).into()),
        Ok(Response::One(g)) => Ok(g.generated_text),
        Ok(Response::Failure { error }) => Err(InferenceError::BackendUnavailable(error).into()),
        Err(e) => Err(InferenceError::BackendUnavailable(format!("unexpected response: {}", e)).into()),
    }
}

/// Rejects absolute paths and parent traversal in repository file names
fn safe_relative_path(name: &str) -> Option<PathBuf> {
    let path = Path::new(name);
    let safe = path
        .components()
        .all(|component| matches!(component, Component::Normal(_)));
    (safe && !name.is_empty()).then(|| path.to_path_buf())
}

async fn read_architecture(dir: &Path) -> Option<String> {
    let bytes = tokio::fs::read(dir.join("config.json")).await.ok()?;
    let config: serde_json::Value = serde_json::from_slice(&bytes).ok()?;

    config
        .get("architectures")
        .and_then(|a| a.get(0))
        .or_else(|| config.get("model_type"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
}

async fn remove_dir_if_exists(dir: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

fn directory_size(dir: &Path) -> u64 {
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|meta| meta.len())
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{StubResponse, StubServer};
    use common::types::TracingProgressSink;
    use serde_json::json;
    use sha2::{Digest, Sha256};

    fn manager(dir: &Path, max_resident_bytes: u64) -> HubManager {
        let settings = HubSettings {
            endpoint: "http://127.0.0.1:9".to_string(),
            inference_endpoint: "http://127.0.0.1:9/models".to_string(),
            max_resident_bytes,
            ..HubSettings::default()
        };
        HubManager::new(settings, dir).unwrap()
    }

    fn stub_manager(dir: &Path, server: &StubServer, request_timeout_secs: u64) -> HubManager {
        let settings = HubSettings {
            endpoint: server.endpoint().to_string(),
            inference_endpoint: format!("{}/models", server.endpoint()),
            request_timeout_secs,
            ..HubSettings::default()
        };
        HubManager::new(settings, dir).unwrap()
    }

    fn repo_info(weights: &[u8], weights_sha256: &str) -> StubResponse {
        StubResponse::json(json!({
            "sha": "607a30d783dfa663caf39e06633721c8d4cfcd7e",
            "siblings": [
                { "rfilename": "config.json", "size": 2 },
                {
                    "rfilename": "model.safetensors",
                    "size": weights.len(),
                    "lfs": { "sha256": weights_sha256, "size": weights.len() }
                }
            ]
        }))
    }

    /// Writes a finished snapshot the way a download would
    fn seed_snapshot(manager: &HubManager, name: &str, files: &[(&str, &[u8])]) {
        let dir = manager.snapshot_dir(name);
        std::fs::create_dir_all(&dir).unwrap();
        let mut size = 0;
        for (file, content) in files {
            std::fs::write(dir.join(file), content).unwrap();
            size += content.len() as u64;
        }
        let manifest = SnapshotManifest {
            name: name.to_string(),
            revision: "main".to_string(),
            sha: Some("abc123".to_string()),
            files: files.iter().map(|(f, _)| f.to_string()).collect(),
            size_bytes: size,
            downloaded_at: Utc::now(),
        };
        std::fs::write(dir.join(MANIFEST_FILE), serde_json::to_vec(&manifest).unwrap()).unwrap();
    }

    #[tokio::test]
    async fn test_probe_and_cached_download() {
        let tmp = tempfile::tempdir().unwrap();
        let hub = manager(tmp.path(), u64::MAX);

        assert!(!hub.probe("openai-community/gpt2").await.unwrap().present_locally);

        seed_snapshot(
            &hub,
            "openai-community/gpt2",
            &[("config.json", br#"{"architectures":["GPT2LMHeadModel"]}"#), ("model.safetensors", &[0u8; 64])],
        );

        let probe = hub.probe("openai-community/gpt2").await.unwrap();
        assert!(probe.present_locally);
        assert_eq!(probe.metadata.get("sha").map(String::as_str), Some("abc123"));

        // Already cached: returns without touching the (unreachable) endpoint
        let size = hub
            .download("openai-community/gpt2", &TracingProgressSink, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(size, probe.size_bytes.unwrap());
    }

    #[tokio::test]
    async fn test_load_unload_and_delete() {
        let tmp = tempfile::tempdir().unwrap();
        let hub = manager(tmp.path(), u64::MAX);
        seed_snapshot(&hub, "gpt2", &[("config.json", b"{}"), ("model.safetensors", &[1u8; 32])]);

        let handle = hub.load("gpt2").await.unwrap();
        assert_eq!(hub.resident_bytes(), 34);

        let listed = hub.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].state, ModelState::Loaded);

        let err = hub.delete("gpt2").await.unwrap_err();
        assert!(matches!(err, Error::Delete(DeleteError::InUse(_))));

        hub.unload(&handle).await.unwrap();
        assert_eq!(hub.resident_bytes(), 0);
        let err = hub.unload(&handle).await.unwrap_err();
        assert!(matches!(err, Error::Unload(UnloadError::AlreadyUnloaded(_))));

        hub.delete("gpt2").await.unwrap();
        assert!(hub.list().await.unwrap().is_empty());
        let err = hub.delete("gpt2").await.unwrap_err();
        assert!(matches!(err, Error::Delete(DeleteError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_load_errors() {
        let tmp = tempfile::tempdir().unwrap();
        let hub = manager(tmp.path(), 16);

        let err = hub.load("missing").await.unwrap_err();
        assert!(matches!(err, Error::Load(LoadError::NotDownloaded(_))));

        seed_snapshot(&hub, "tokenizer-only", &[("tokenizer.json", b"{}")]);
        let err = hub.load("tokenizer-only").await.unwrap_err();
        assert!(matches!(err, Error::Load(LoadError::Incompatible(_))));

        seed_snapshot(&hub, "too-big", &[("model.bin", &[0u8; 64])]);
        let err = hub.load("too-big").await.unwrap_err();
        assert!(matches!(err, Error::Load(LoadError::ResourceExhausted(_))));
        assert_eq!(hub.resident_bytes(), 0);
    }

    #[tokio::test]
    async fn test_infer_requires_resident_session() {
        let tmp = tempfile::tempdir().unwrap();
        let hub = manager(tmp.path(), u64::MAX);

        let err = hub
            .infer(InferenceTarget::Name("gpt2"), "hi", &InferenceOptions::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Inference(InferenceError::InvalidInput(_))));
    }

    #[tokio::test]
    async fn test_discard_partial_removes_staging() {
        let tmp = tempfile::tempdir().unwrap();
        let hub = manager(tmp.path(), u64::MAX);

        let staging = hub.staging_dir("org/model");
        std::fs::create_dir_all(&staging).unwrap();
        std::fs::write(staging.join("model.bin"), b"partial").unwrap();

        hub.discard_partial("org/model").await.unwrap();
        assert!(!staging.exists());
        // Idempotent
        hub.discard_partial("org/model").await.unwrap();
    }

    #[tokio::test]
    async fn test_slow_weights_outlast_request_timeout() {
        let weights = [7u8; 30];
        let digest = hex::encode(Sha256::digest(weights));
        let server = StubServer::start(vec![
            ("GET /api/models/gpt2/revision/main", repo_info(&weights, &digest)),
            ("GET /gpt2/resolve/main/config.json", StubResponse::bytes(b"{}")),
            (
                "GET /gpt2/resolve/main/model.safetensors",
                StubResponse::trickle(&weights, 3, Duration::from_millis(150)),
            ),
        ])
        .await;
        let tmp = tempfile::tempdir().unwrap();
        let hub = stub_manager(tmp.path(), &server, 1);

        // The weights take about 1.5s to arrive, past the 1s metadata timeout
        let size = hub
            .download("gpt2", &TracingProgressSink, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(size, 32);

        let probe = hub.probe("gpt2").await.unwrap();
        assert!(probe.present_locally);
        assert_eq!(probe.size_bytes, Some(32));
        assert!(!hub.staging_dir("gpt2").exists());
        assert_eq!(
            std::fs::read(hub.snapshot_dir("gpt2").join("model.safetensors")).unwrap(),
            weights.to_vec()
        );
    }

    #[tokio::test]
    async fn test_checksum_mismatch_discards_staging() {
        let weights = [7u8; 30];
        let server = StubServer::start(vec![
            ("GET /api/models/gpt2/revision/main", repo_info(&weights, &"0".repeat(64))),
            ("GET /gpt2/resolve/main/config.json", StubResponse::bytes(b"{}")),
            ("GET /gpt2/resolve/main/model.safetensors", StubResponse::bytes(&weights)),
        ])
        .await;
        let tmp = tempfile::tempdir().unwrap();
        let hub = stub_manager(tmp.path(), &server, 5);

        let err = hub
            .download("gpt2", &TracingProgressSink, CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Download(DownloadError::ChecksumMismatch { .. })));
        assert!(!hub.staging_dir("gpt2").exists());
        assert!(!hub.snapshot_dir("gpt2").exists());
        assert!(!hub.probe("gpt2").await.unwrap().present_locally);
    }

    #[tokio::test]
    async fn test_list_skips_staging_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let hub = manager(tmp.path(), u64::MAX);
        seed_snapshot(&hub, "gpt2", &[("model.safetensors", &[1u8; 8])]);

        // A download of bert that is about to be renamed into place
        seed_snapshot(&hub, "bert", &[("model.safetensors", &[1u8; 8])]);
        std::fs::rename(hub.snapshot_dir("bert"), hub.staging_dir("bert")).unwrap();

        let listed = hub.list().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].identity.name, "gpt2");
    }

    #[tokio::test]
    async fn test_info_merges_card_and_snapshot() {
        let server = StubServer::start(vec![(
            "GET /api/models/gpt2",
            StubResponse::json(json!({
                "id": "gpt2",
                "author": "openai-community",
                "lastModified": "2024-02-19T10:57:45.000Z",
                "tags": ["pytorch", "text-generation"],
                "downloads": 1200,
                "likes": 42
            })),
        )])
        .await;
        let tmp = tempfile::tempdir().unwrap();
        let hub = stub_manager(tmp.path(), &server, 5);
        seed_snapshot(
            &hub,
            "gpt2",
            &[("config.json", br#"{"architectures":["GPT2LMHeadModel"]}"#)],
        );

        let info = hub.info("gpt2").await.unwrap();
        assert!(info.present_locally);
        assert_eq!(info.metadata.get("author").map(String::as_str), Some("openai-community"));
        assert_eq!(info.metadata.get("tags").map(String::as_str), Some("pytorch,text-generation"));
        assert_eq!(info.metadata.get("architecture").map(String::as_str), Some("GPT2LMHeadModel"));
        assert_eq!(info.metadata.get("sha").map(String::as_str), Some("abc123"));

        // Neither cached nor known remotely
        let err = hub.info("nope").await.unwrap_err();
        assert!(err.is_not_found());

        // Offline: the cached snapshot is still described
        let offline = manager(tmp.path(), u64::MAX);
        let info = offline.info("gpt2").await.unwrap();
        assert!(info.present_locally);
        assert!(!info.metadata.contains_key("author"));
        assert_eq!(info.metadata.get("architecture").map(String::as_str), Some("GPT2LMHeadModel"));
    }

    #[test]
    fn test_parse_generated_text() {
        assert_eq!(parse_generated_text(r#"[{"generated_text":"hello"}]"#).unwrap(), "hello");
        assert_eq!(parse_generated_text(r#"{"generated_text":"hey"}"#).unwrap(), "hey");
        assert!(parse_generated_text(r#"{"error":"Model is loading"}"#).is_err());
        assert!(parse_generated_text("[]").is_err());
    }

    #[test]
    fn test_safe_relative_path() {
        assert!(safe_relative_path("onnx/model.onnx").is_some());
        assert!(safe_relative_path("../etc/passwd").is_none());
        assert!(safe_relative_path("/etc/passwd").is_none());
        assert!(safe_relative_path("").is_none());
    }

    #[test]
    fn test_snapshot_dir_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let hub = manager(tmp.path(), u64::MAX);
        assert!(hub
            .snapshot_dir("openai-community/gpt2")
            .ends_with("hub/models--openai-community--gpt2"));
        assert!(hub
            .staging_dir("gpt2")
            .to_string_lossy()
            .ends_with("models--gpt2.partial"));
    }
}
