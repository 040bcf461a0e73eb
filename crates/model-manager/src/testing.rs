//! In-memory backend for tests
//!
//! [`MockBackend`] keeps a catalog of remote models and the set of local
//! ones in memory, with configurable delays, injected failures and call
//! counters. [`StubServer`] answers canned HTTP responses for exercising
//! the real backends against a local port.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use common::error::{
    DeleteError, DownloadError, InferenceError, LoadError, Result, UnloadError,
};
use common::models::{
    DownloadProgress, InferenceOptions, InferenceTarget, ModelHandle, ModelSource, ModelState,
    ModelSummary, ProbeResult,
};
use common::types::ProgressSink;

use crate::backend::BackendManager;

#[derive(Debug, Clone)]
struct MockModel {
    size_bytes: u64,
    local: bool,
}

/// In-memory [`BackendManager`]
pub struct MockBackend {
    source: ModelSource,
    requires_daemon: bool,
    lazy_load: bool,
    available: AtomicBool,

    models: Mutex<HashMap<String, MockModel>>,
    handles: Mutex<HashMap<Uuid, String>>,

    download_delay: Duration,
    load_delay: Duration,
    infer_delay: Duration,
    list_delay: Duration,

    next_download_error: Mutex<Option<DownloadError>>,
    next_load_error: Mutex<Option<LoadError>>,

    download_calls: AtomicUsize,
    discard_calls: AtomicUsize,
    load_calls: AtomicUsize,
    unload_calls: AtomicUsize,
    infer_calls: AtomicUsize,
    delete_calls: AtomicUsize,
}

impl MockBackend {
    /// Empty backend serving `source`
    pub fn new(source: ModelSource) -> Self {
        Self {
            source,
            requires_daemon: false,
            lazy_load: false,
            available: AtomicBool::new(true),
            models: Mutex::new(HashMap::new()),
            handles: Mutex::new(HashMap::new()),
            download_delay: Duration::ZERO,
            load_delay: Duration::ZERO,
            infer_delay: Duration::ZERO,
            list_delay: Duration::ZERO,
            next_download_error: Mutex::new(None),
            next_load_error: Mutex::new(None),
            download_calls: AtomicUsize::new(0),
            discard_calls: AtomicUsize::new(0),
            load_calls: AtomicUsize::new(0),
            unload_calls: AtomicUsize::new(0),
            infer_calls: AtomicUsize::new(0),
            delete_calls: AtomicUsize::new(0),
        }
    }

    /// Adds a model that exists remotely but not locally
    pub fn with_model(self, name: &str, size_bytes: u64) -> Self {
        self.models.lock().insert(
            name.to_string(),
            MockModel {
                size_bytes,
                local: false,
            },
        );
        self
    }

    /// Adds a model that is already present locally
    pub fn with_local_model(self, name: &str, size_bytes: u64) -> Self {
        self.models.lock().insert(
            name.to_string(),
            MockModel {
                size_bytes,
                local: true,
            },
        );
        self
    }

    /// Marks the backend as daemon-backed with deferred-cost loads
    pub fn daemon_backed(mut self) -> Self {
        self.requires_daemon = true;
        self.lazy_load = true;
        self
    }

    /// Makes every download take `delay`
    pub fn with_download_delay(mut self, delay: Duration) -> Self {
        self.download_delay = delay;
        self
    }

    /// Makes every load take `delay`
    pub fn with_load_delay(mut self, delay: Duration) -> Self {
        self.load_delay = delay;
        self
    }

    /// Makes every inference take `delay`
    pub fn with_infer_delay(mut self, delay: Duration) -> Self {
        self.infer_delay = delay;
        self
    }

    /// Makes every listing wait `delay` after taking its snapshot
    pub fn with_list_delay(mut self, delay: Duration) -> Self {
        self.list_delay = delay;
        self
    }

    /// Fails the next download with `error`
    pub fn fail_next_download(&self, error: DownloadError) {
        *self.next_download_error.lock() = Some(error);
    }

    /// Fails the next load with `error`
    pub fn fail_next_load(&self, error: LoadError) {
        *self.next_load_error.lock() = Some(error);
    }

    /// Sets the reachability reported by `available()`
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Whether `name` is present locally
    pub fn is_local(&self, name: &str) -> bool {
        self.models.lock().get(name).map_or(false, |m| m.local)
    }

    /// Number of live handles
    pub fn live_handles(&self) -> usize {
        self.handles.lock().len()
    }

    pub fn download_calls(&self) -> usize {
        self.download_calls.load(Ordering::SeqCst)
    }

    pub fn discard_calls(&self) -> usize {
        self.discard_calls.load(Ordering::SeqCst)
    }

    pub fn load_calls(&self) -> usize {
        self.load_calls.load(Ordering::SeqCst)
    }

    pub fn unload_calls(&self) -> usize {
        self.unload_calls.load(Ordering::SeqCst)
    }

    pub fn infer_calls(&self) -> usize {
        self.infer_calls.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.delete_calls.load(Ordering::SeqCst)
    }

    fn has_handle_for(&self, name: &str) -> bool {
        self.handles.lock().values().any(|n| n == name)
    }
}

#[async_trait]
impl BackendManager for MockBackend {
    fn source(&self) -> ModelSource {
        self.source
    }

    fn requires_daemon(&self) -> bool {
        self.requires_daemon
    }

    fn lazy_load(&self) -> bool {
        self.lazy_load
    }

    async fn available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    async fn probe(&self, name: &str) -> Result<ProbeResult> {
        Ok(match self.models.lock().get(name) {
            Some(model) if model.local => ProbeResult::present(model.size_bytes),
            _ => ProbeResult::absent(),
        })
    }

    async fn download(
        &self,
        name: &str,
        progress: &dyn ProgressSink,
        cancel: CancellationToken,
    ) -> Result<u64> {
        self.download_calls.fetch_add(1, Ordering::SeqCst);

        let size = match self.models.lock().get(name) {
            Some(model) if model.local => return Ok(model.size_bytes),
            Some(model) => model.size_bytes,
            None => return Err(DownloadError::NotFound(name.to_string()).into()),
        };

        let identity = self.identity(name);
        progress.on_progress(
            &identity,
            &DownloadProgress {
                status: "downloading".to_string(),
                total_bytes: Some(size),
                downloaded_bytes: 0,
            },
        );

        tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(DownloadError::Cancelled.into()),
            _ = tokio::time::sleep(self.download_delay) => {}
        }

        if let Some(error) = self.next_download_error.lock().take() {
            return Err(error.into());
        }

        if let Some(model) = self.models.lock().get_mut(name) {
            model.local = true;
        }

        progress.on_progress(
            &identity,
            &DownloadProgress {
                status: "complete".to_string(),
                total_bytes: Some(size),
                downloaded_bytes: size,
            },
        );

        Ok(size)
    }

    async fn discard_partial(&self, _name: &str) -> Result<()> {
        self.discard_calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn load(&self, name: &str) -> Result<ModelHandle> {
        self.load_calls.fetch_add(1, Ordering::SeqCst);

        tokio::time::sleep(self.load_delay).await;

        if let Some(error) = self.next_load_error.lock().take() {
            return Err(error.into());
        }

        if !self.is_local(name) {
            return Err(LoadError::NotDownloaded(name.to_string()).into());
        }

        let handle = ModelHandle::issue(self.identity(name));
        self.handles.lock().insert(handle.id, name.to_string());

        Ok(handle)
    }

    async fn unload(&self, handle: &ModelHandle) -> Result<()> {
        self.unload_calls.fetch_add(1, Ordering::SeqCst);

        self.handles
            .lock()
            .remove(&handle.id)
            .map(|_| ())
            .ok_or_else(|| UnloadError::AlreadyUnloaded(handle.identity.name.clone()).into())
    }

    async fn infer(
        &self,
        target: InferenceTarget<'_>,
        prompt: &str,
        _options: &InferenceOptions,
    ) -> Result<String> {
        self.infer_calls.fetch_add(1, Ordering::SeqCst);

        let ready = match target {
            InferenceTarget::Handle(handle) => self.handles.lock().contains_key(&handle.id),
            InferenceTarget::Name(name) => {
                self.has_handle_for(name) || (self.lazy_load && self.is_local(name))
            }
        };
        if !ready {
            return Err(InferenceError::InvalidInput(format!("{} is not loaded", target.name())).into());
        }

        if prompt.trim().is_empty() {
            return Err(InferenceError::InvalidInput("prompt is empty".to_string()).into());
        }

        tokio::time::sleep(self.infer_delay).await;

        Ok(format!("[{}] {}", target.name(), prompt))
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);

        if self.has_handle_for(name) {
            return Err(DeleteError::InUse(name.to_string()).into());
        }

        match self.models.lock().get_mut(name) {
            Some(model) if model.local => {
                model.local = false;
                Ok(())
            }
            _ => Err(DeleteError::NotFound(name.to_string()).into()),
        }
    }

    async fn list(&self) -> Result<Vec<ModelSummary>> {
        let live: Vec<String> = self.handles.lock().values().cloned().collect();

        let mut models: Vec<ModelSummary> = self
            .models
            .lock()
            .iter()
            .filter(|(_, model)| model.local)
            .map(|(name, model)| ModelSummary {
                identity: self.identity(name),
                size_bytes: Some(model.size_bytes),
                state: if live.contains(name) {
                    ModelState::Loaded
                } else {
                    ModelState::Downloaded
                },
                modified_at: None,
            })
            .collect();

        models.sort_by(|a, b| a.identity.cmp(&b.identity));

        tokio::time::sleep(self.list_delay).await;

        Ok(models)
    }
}

/// Canned HTTP response served by [`StubServer`]
#[derive(Debug, Clone)]
pub struct StubResponse {
    status: u16,
    content_type: &'static str,
    chunks: Vec<Vec<u8>>,
    chunk_delay: Duration,
}

impl StubResponse {
    /// Empty response with `status`
    pub fn status(status: u16) -> Self {
        Self {
            status,
            content_type: "text/plain",
            chunks: Vec::new(),
            chunk_delay: Duration::ZERO,
        }
    }

    /// 200 with a JSON body
    pub fn json(body: serde_json::Value) -> Self {
        Self {
            content_type: "application/json",
            chunks: vec![body.to_string().into_bytes()],
            ..Self::status(200)
        }
    }

    /// 200 with one JSON document per line, sent line by line
    pub fn ndjson(lines: &[serde_json::Value]) -> Self {
        Self {
            content_type: "application/x-ndjson",
            chunks: lines
                .iter()
                .map(|line| format!("{}\n", line).into_bytes())
                .collect(),
            ..Self::status(200)
        }
    }

    /// 200 with a binary body
    pub fn bytes(body: &[u8]) -> Self {
        Self {
            content_type: "application/octet-stream",
            chunks: vec![body.to_vec()],
            ..Self::status(200)
        }
    }

    /// 200 with a binary body sent in `chunk_size` pieces, `delay` apart
    pub fn trickle(body: &[u8], chunk_size: usize, delay: Duration) -> Self {
        Self {
            content_type: "application/octet-stream",
            chunks: body.chunks(chunk_size.max(1)).map(<[u8]>::to_vec).collect(),
            chunk_delay: delay,
            ..Self::status(200)
        }
    }
}

type StubRoutes = Mutex<HashMap<String, VecDeque<StubResponse>>>;

/// Minimal HTTP/1.1 server answering canned responses on a local port.
///
/// Routes are keyed by `"METHOD /path"` without the query string; anything
/// else gets a 404. A route listed several times answers its responses in
/// order and repeats the last one. Every connection serves one request.
pub struct StubServer {
    endpoint: String,
    requests: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl StubServer {
    /// Binds an ephemeral port and starts serving `routes`
    pub async fn start(routes: Vec<(&str, StubResponse)>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("failed to bind stub server");
        let endpoint = format!(
            "http://{}",
            listener.local_addr().expect("stub server has no address")
        );

        let mut table: HashMap<String, VecDeque<StubResponse>> = HashMap::new();
        for (route, response) in routes {
            table.entry(route.to_string()).or_default().push_back(response);
        }
        let routes = Arc::new(Mutex::new(table));
        let requests = Arc::new(Mutex::new(Vec::new()));

        let task = tokio::spawn({
            let requests = Arc::clone(&requests);
            async move {
                while let Ok((stream, _)) = listener.accept().await {
                    let routes = Arc::clone(&routes);
                    let requests = Arc::clone(&requests);
                    tokio::spawn(async move {
                        let _ = serve_stub(stream, &routes, &requests).await;
                    });
                }
            }
        });

        Self {
            endpoint,
            requests,
            task,
        }
    }

    /// Base URL, without a trailing slash
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Routes requested so far, in arrival order
    pub fn requests(&self) -> Vec<String> {
        self.requests.lock().clone()
    }

    /// Number of requests for `route`
    pub fn hits(&self, route: &str) -> usize {
        self.requests.lock().iter().filter(|r| *r == route).count()
    }
}

impl Drop for StubServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve_stub(
    mut stream: TcpStream,
    routes: &StubRoutes,
    requests: &Mutex<Vec<String>>,
) -> std::io::Result<()> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];

    let header_end = loop {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            return Ok(());
        }
        buf.extend_from_slice(&chunk[..n]);
        if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            break pos + 4;
        }
    };

    let head = String::from_utf8_lossy(&buf[..header_end]).to_string();
    let content_length = head
        .lines()
        .filter_map(|line| line.split_once(':'))
        .find(|(name, _)| name.trim().eq_ignore_ascii_case("content-length"))
        .and_then(|(_, value)| value.trim().parse::<usize>().ok())
        .unwrap_or(0);

    // Drain the body so closing the socket does not reset the connection
    while buf.len() < header_end + content_length {
        let n = stream.read(&mut chunk).await?;
        if n == 0 {
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }

    let mut request_line = head.split_whitespace();
    let method = request_line.next().unwrap_or_default();
    let path = request_line
        .next()
        .unwrap_or_default()
        .split('?')
        .next()
        .unwrap_or_default();
    let route = format!("{} {}", method, path);
    requests.lock().push(route.clone());

    let response = match routes.lock().get_mut(&route) {
        Some(queue) if queue.len() > 1 => queue.pop_front(),
        Some(queue) => queue.front().cloned(),
        None => None,
    }
    .unwrap_or_else(|| StubResponse::status(404));
    let length: usize = response.chunks.iter().map(Vec::len).sum();

    let header = format!(
        "HTTP/1.1 {} Stub\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
        response.status, response.content_type, length
    );
    stream.write_all(header.as_bytes()).await?;
    stream.flush().await?;

    for body in &response.chunks {
        if !response.chunk_delay.is_zero() {
            tokio::time::sleep(response.chunk_delay).await;
        }
        stream.write_all(body).await?;
        stream.flush().await?;
    }

    stream.shutdown().await
}
