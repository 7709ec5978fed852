//! In-memory backend for tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::{self, StreamExt};

use codebox_core::{BackendKind, Error, FileInfo, HealthStatus, KernelMode, Result};

use super::{Backend, ExecOptions};
use crate::decoder::{decode_stream, ChunkDecoder, ChunkStream};
use crate::transfer::{collect_bytes, ByteStream};

/// Backend that replays scripted raw outputs and keeps files in memory.
///
/// Each execution pops the next scripted output (tagged protocol, so
/// decoding is exercised too); an exhausted script yields no output.
pub struct MockBackend {
    id: String,
    pub outputs: Arc<tokio::sync::Mutex<VecDeque<String>>>,
    pub files: Arc<tokio::sync::Mutex<HashMap<String, Bytes>>>,
    /// Executed code, in order.
    pub executed: Arc<tokio::sync::Mutex<Vec<(String, KernelMode)>>>,
    latency: Duration,
    endless: bool,
    running: AtomicBool,
    pub fail_start: AtomicBool,
    pub restart_supported: AtomicBool,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    pub restarts: AtomicUsize,
}

impl MockBackend {
    /// Create a mock backend with predefined raw outputs.
    pub fn new(outputs: Vec<&str>) -> Self {
        Self {
            id: format!("mock-{}", uuid::Uuid::new_v4()),
            outputs: Arc::new(tokio::sync::Mutex::new(
                outputs.into_iter().map(str::to_string).collect(),
            )),
            files: Default::default(),
            executed: Default::default(),
            latency: Duration::ZERO,
            endless: false,
            running: AtomicBool::new(false),
            fail_start: AtomicBool::new(false),
            restart_supported: AtomicBool::new(true),
            starts: AtomicUsize::new(0),
            stops: AtomicUsize::new(0),
            restarts: AtomicUsize::new(0),
        }
    }

    /// Delay every execution's output.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Every execution prints forever and never leaves the poller waiting,
    /// like a tight print loop on a fast pipe.
    pub fn with_endless_output(mut self) -> Self {
        self.endless = true;
        self
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl Backend for MockBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn session_id(&self) -> String {
        self.id.clone()
    }

    async fn start(&self) -> Result<()> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        if self.fail_start.load(Ordering::SeqCst) {
            return Err(Error::startup("mock substrate unreachable"));
        }
        self.running.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn restart(&self) -> Result<()> {
        if !self.restart_supported.load(Ordering::SeqCst) {
            return Err(Error::restart("mock substrate cannot restart in place"));
        }
        self.restarts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn execute(
        &self,
        code: &str,
        mode: KernelMode,
        _options: &ExecOptions,
    ) -> Result<ChunkStream> {
        self.executed.lock().await.push((code.to_string(), mode));
        if self.endless {
            let raw = stream::repeat_with(|| {
                std::thread::sleep(Duration::from_micros(200));
                Ok(Bytes::from_static(b"<txt>.</txt>"))
            })
            .boxed();
            return Ok(decode_stream(raw, ChunkDecoder::tagged()));
        }
        let output = self.outputs.lock().await.pop_front().unwrap_or_default();
        let latency = self.latency;
        let raw = stream::once(async move {
            if !latency.is_zero() {
                tokio::time::sleep(latency).await;
            }
            Ok(Bytes::from(output))
        })
        .boxed();
        Ok(decode_stream(raw, ChunkDecoder::tagged()))
    }

    async fn upload(&self, path: &str, content: ByteStream) -> Result<u64> {
        let content = collect_bytes(content).await?;
        let size = content.len() as u64;
        self.files.lock().await.insert(path.to_string(), content);
        Ok(size)
    }

    async fn download(&self, path: &str) -> Result<ByteStream> {
        let content = self
            .files
            .lock()
            .await
            .get(path)
            .cloned()
            .ok_or_else(|| Error::file_not_found(path))?;
        Ok(stream::once(async move { Ok(content) }).boxed())
    }

    async fn list_files(&self) -> Result<Vec<FileInfo>> {
        let mut files: Vec<FileInfo> = self
            .files
            .lock()
            .await
            .iter()
            .map(|(path, content)| FileInfo {
                path: path.clone(),
                size: Some(content.len() as u64),
            })
            .collect();
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    async fn healthcheck(&self, _timeout: Duration) -> HealthStatus {
        if self.is_running() {
            HealthStatus::Healthy
        } else {
            HealthStatus::Error
        }
    }
}
