//! Blocking facade over the async [`CodeBox`](crate::CodeBox).
//!
//! Each blocking `CodeBox` owns a small Tokio runtime and drives the async
//! implementation on it, so both forms behave identically. Do not use these
//! types from inside an async context; calling them there panics.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use tokio::runtime::Runtime;

use codebox_core::{
    CodeBoxConfig, ExecChunk, ExecResult, HealthStatus, KernelMode, Result, SessionInfo,
    SessionState,
};

use crate::backend::{Backend, ExecOptions};
use crate::codebox::{CodeBox as AsyncCodeBox, KeepAlive};
use crate::stream::ExecStream;
use crate::transfer::{self, ByteStream, UploadSource};

fn runtime() -> Result<Arc<Runtime>> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("codebox-blocking")
        .enable_all()
        .build()?;
    Ok(Arc::new(runtime))
}

/// Blocking code execution sandbox.
#[derive(Clone)]
pub struct CodeBox {
    inner: AsyncCodeBox,
    runtime: Arc<Runtime>,
}

impl CodeBox {
    pub fn new(config: CodeBoxConfig) -> Result<Self> {
        let runtime = runtime()?;
        let inner = {
            let _entered = runtime.enter();
            AsyncCodeBox::new(config)?
        };
        Ok(Self { inner, runtime })
    }

    pub fn from_env() -> Result<Self> {
        Self::new(CodeBoxConfig::load()?)
    }

    pub fn with_backend(backend: Arc<dyn Backend>, config: CodeBoxConfig) -> Result<Self> {
        Ok(Self {
            inner: AsyncCodeBox::with_backend(backend, config),
            runtime: runtime()?,
        })
    }

    pub fn resume(session_id: impl Into<String>, config: CodeBoxConfig) -> Result<Self> {
        let runtime = runtime()?;
        let inner = runtime.block_on(AsyncCodeBox::resume(session_id, config))?;
        Ok(Self { inner, runtime })
    }

    /// The async facade sharing this session.
    pub fn as_async(&self) -> &AsyncCodeBox {
        &self.inner
    }

    pub fn session_id(&self) -> String {
        self.inner.session_id()
    }

    pub fn state(&self) -> SessionState {
        self.inner.state()
    }

    pub fn info(&self) -> SessionInfo {
        self.inner.info()
    }

    pub fn start(&self) -> Result<()> {
        self.runtime.block_on(self.inner.start())
    }

    pub fn stop(&self) -> Result<()> {
        self.runtime.block_on(self.inner.stop())
    }

    pub fn restart(&self) -> Result<()> {
        self.runtime.block_on(self.inner.restart())
    }

    pub fn healthcheck(&self) -> HealthStatus {
        self.runtime.block_on(self.inner.healthcheck())
    }

    pub fn healthcheck_with(&self, timeout: Duration) -> HealthStatus {
        self.runtime.block_on(self.inner.healthcheck_with(timeout))
    }

    pub fn execute(&self, code: &str, mode: KernelMode) -> Result<ExecResult> {
        self.runtime.block_on(self.inner.execute(code, mode))
    }

    pub fn execute_with(&self, code: &str, mode: KernelMode, options: ExecOptions) -> Result<ExecResult> {
        self.runtime
            .block_on(self.inner.execute_with(code, mode, options))
    }

    pub fn execute_file(&self, path: impl AsRef<Path>, mode: KernelMode) -> Result<ExecResult> {
        self.runtime.block_on(self.inner.execute_file(path, mode))
    }

    /// Iterate over chunks as they are produced.
    pub fn stream_execute(&self, code: &str, mode: KernelMode) -> Result<ExecIter> {
        let stream = self.runtime.block_on(self.inner.stream_execute(code, mode))?;
        Ok(ExecIter {
            stream,
            runtime: self.runtime.clone(),
        })
    }

    pub fn upload(&self, path: &str, content: impl Into<UploadSource>) -> Result<RemoteFile> {
        let file = self.runtime.block_on(self.inner.upload(path, content))?;
        Ok(self.wrap(file))
    }

    pub fn upload_with(
        &self,
        path: &str,
        content: impl Into<UploadSource>,
        timeout: Duration,
    ) -> Result<RemoteFile> {
        let file = self
            .runtime
            .block_on(self.inner.upload_with(path, content, timeout))?;
        Ok(self.wrap(file))
    }

    pub fn download(&self, path: &str) -> Result<RemoteFile> {
        let file = self.runtime.block_on(self.inner.download(path))?;
        Ok(self.wrap(file))
    }

    pub fn download_with(&self, path: &str, timeout: Duration) -> Result<RemoteFile> {
        let file = self.runtime.block_on(self.inner.download_with(path, timeout))?;
        Ok(self.wrap(file))
    }

    pub fn file(&self, path: &str) -> RemoteFile {
        self.wrap(self.inner.file(path))
    }

    pub fn stream_download(&self, path: &str) -> Result<ByteIter> {
        let stream = self.runtime.block_on(self.inner.stream_download(path))?;
        Ok(ByteIter {
            stream,
            runtime: self.runtime.clone(),
        })
    }

    pub fn stream_download_with(&self, path: &str, timeout: Duration) -> Result<ByteIter> {
        let stream = self
            .runtime
            .block_on(self.inner.stream_download_with(path, timeout))?;
        Ok(ByteIter {
            stream,
            runtime: self.runtime.clone(),
        })
    }

    pub fn list_files(&self) -> Result<Vec<RemoteFile>> {
        let files = self.runtime.block_on(self.inner.list_files())?;
        Ok(files.into_iter().map(|f| self.wrap(f)).collect())
    }

    pub fn install(&self, packages: &[&str]) -> Result<ExecResult> {
        self.runtime.block_on(self.inner.install(packages))
    }

    pub fn list_packages(&self) -> Result<Vec<String>> {
        self.runtime.block_on(self.inner.list_packages())
    }

    pub fn show_variables(&self) -> Result<BTreeMap<String, String>> {
        self.runtime.block_on(self.inner.show_variables())
    }

    /// Ping the session in the background for `duration`.
    pub fn keep_alive(&self, duration: Duration) -> KeepAlive {
        self.inner.keep_alive_on(self.runtime.handle(), duration)
    }

    fn wrap(&self, inner: transfer::RemoteFile) -> RemoteFile {
        RemoteFile {
            inner,
            runtime: self.runtime.clone(),
        }
    }
}

/// Blocking iterator over a running execution. Dropping it cancels the
/// execution.
pub struct ExecIter {
    stream: ExecStream,
    runtime: Arc<Runtime>,
}

impl ExecIter {
    /// Stop the execution and keep what arrived so far.
    pub fn cancel(self) -> ExecResult {
        let _entered = self.runtime.enter();
        self.stream.cancel()
    }

    /// Aggregate result, once the iterator is exhausted.
    pub fn result(&self) -> Option<ExecResult> {
        self.stream.result()
    }
}

impl Iterator for ExecIter {
    type Item = Result<ExecChunk>;

    fn next(&mut self) -> Option<Self::Item> {
        self.runtime.block_on(self.stream.next())
    }
}

/// Blocking iterator over downloaded file chunks.
pub struct ByteIter {
    stream: ByteStream,
    runtime: Arc<Runtime>,
}

impl Iterator for ByteIter {
    type Item = Result<Bytes>;

    fn next(&mut self) -> Option<Self::Item> {
        self.runtime.block_on(self.stream.next())
    }
}

/// Blocking handle to a file in a session.
#[derive(Debug, Clone)]
pub struct RemoteFile {
    inner: transfer::RemoteFile,
    runtime: Arc<Runtime>,
}

impl RemoteFile {
    pub fn path(&self) -> &str {
        self.inner.path()
    }

    pub fn name(&self) -> &str {
        self.inner.name()
    }

    pub fn size(&self) -> Result<u64> {
        self.runtime.block_on(self.inner.size())
    }

    pub fn content(&self) -> Result<Bytes> {
        self.runtime.block_on(self.inner.content())
    }

    pub fn save(&self, local_path: impl AsRef<Path>) -> Result<u64> {
        self.runtime.block_on(self.inner.save(local_path))
    }

    pub fn as_async(&self) -> &transfer::RemoteFile {
        &self.inner
    }
}

impl std::fmt::Display for RemoteFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(&self.inner, f)
    }
}
