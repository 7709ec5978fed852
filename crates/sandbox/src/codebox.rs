//! The `CodeBox` facade.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::runtime::Handle;
use tokio::task::JoinHandle;

use codebox_core::{
    BackendKind, CodeBoxConfig, Error, ExecResult, HealthStatus, KernelMode, Result, SessionInfo,
    SessionState,
};

use crate::backend::{Backend, DockerBackend, ExecOptions, LocalBackend, RemoteBackend};
use crate::session::Session;
use crate::stream::ExecStream;
use crate::transfer::{collect_bytes, ByteStream, RemoteFile, UploadSource};

/// Prints user variables as one JSON object on the last output line.
const SHOW_VARIABLES: &str = r#"
import json as __codebox_json, types as __codebox_types
print(__codebox_json.dumps({
    __k: repr(__v)[:200]
    for __k, __v in list(globals().items())
    if not __k.startswith("_")
    and __k not in ("In", "Out", "exit", "quit", "get_ipython")
    and not isinstance(__v, (__codebox_types.ModuleType, __codebox_types.FunctionType, type))
}))
"#;

/// A code execution sandbox.
///
/// Cheap to clone; clones share one session. The backend is chosen from the
/// configuration: `api_key = "local"` (or none) runs on the host,
/// `"docker"` in a container, anything else against the remote service.
///
/// ```ignore
/// let codebox = CodeBox::new(CodeBoxConfig::local())?;
/// let result = codebox.execute("print('Hello')", KernelMode::Python).await?;
/// assert_eq!(result.text(), "Hello\n");
/// codebox.stop().await?;
/// ```
#[derive(Clone)]
pub struct CodeBox {
    session: Arc<Session>,
}

impl CodeBox {
    /// Create a session for the configured backend. Nothing is started
    /// until the first operation or an explicit [`start`](Self::start).
    pub fn new(config: CodeBoxConfig) -> Result<Self> {
        config.validate()?;
        let backend: Arc<dyn Backend> = match config.backend_kind() {
            BackendKind::Local => Arc::new(LocalBackend::new(&config)?),
            BackendKind::Docker => Arc::new(DockerBackend::new(&config)?),
            BackendKind::Remote => Arc::new(RemoteBackend::new(&config)?),
        };
        Ok(Self::with_backend(backend, config))
    }

    /// Create from `codebox.toml` and `CODEBOX_*` environment variables.
    pub fn from_env() -> Result<Self> {
        Self::new(CodeBoxConfig::load()?)
    }

    pub fn with_backend(backend: Arc<dyn Backend>, config: CodeBoxConfig) -> Self {
        tracing::debug!(backend = %backend.kind(), "CodeBox created");
        Self {
            session: Session::new(backend, config),
        }
    }

    /// Reattach to an existing session by identifier. Fails with
    /// [`Error::SessionNotFound`] when the substrate no longer exists.
    pub async fn resume(session_id: impl Into<String>, config: CodeBoxConfig) -> Result<Self> {
        let codebox = Self::new(config.with_session_id(session_id))?;
        codebox.start().await?;
        Ok(codebox)
    }

    pub fn session(&self) -> &Arc<Session> {
        &self.session
    }

    pub fn session_id(&self) -> String {
        self.session.id()
    }

    pub fn state(&self) -> SessionState {
        self.session.state()
    }

    pub fn info(&self) -> SessionInfo {
        self.session.info()
    }

    pub async fn start(&self) -> Result<()> {
        self.session.start().await
    }

    pub async fn stop(&self) -> Result<()> {
        self.session.stop().await
    }

    pub async fn restart(&self) -> Result<()> {
        self.session.restart().await
    }

    pub async fn healthcheck(&self) -> HealthStatus {
        self.session.healthcheck().await
    }

    pub async fn healthcheck_with(&self, timeout: Duration) -> HealthStatus {
        self.session.healthcheck_within(timeout).await
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Run code and wait for the aggregated result.
    ///
    /// Errors raised by the executed code come back as `err` chunks of a
    /// normal result; only infrastructure failures are `Err`.
    pub async fn execute(&self, code: &str, mode: KernelMode) -> Result<ExecResult> {
        self.execute_with(code, mode, ExecOptions::default()).await
    }

    pub async fn execute_with(
        &self,
        code: &str,
        mode: KernelMode,
        options: ExecOptions,
    ) -> Result<ExecResult> {
        self.session.execute(code, mode, options).await?.collect().await
    }

    /// Run code and consume chunks as they are produced.
    pub async fn stream_execute(&self, code: &str, mode: KernelMode) -> Result<ExecStream> {
        self.session
            .execute(code, mode, ExecOptions::default())
            .await
    }

    pub async fn stream_execute_with(
        &self,
        code: &str,
        mode: KernelMode,
        options: ExecOptions,
    ) -> Result<ExecStream> {
        self.session.execute(code, mode, options).await
    }

    /// Run the contents of a local source file.
    pub async fn execute_file(&self, path: impl AsRef<Path>, mode: KernelMode) -> Result<ExecResult> {
        let path = path.as_ref();
        let code = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => Error::file_not_found(path.display().to_string()),
                _ => Error::Io(e),
            })?;
        self.execute(&code, mode).await
    }

    // =========================================================================
    // Files
    // =========================================================================

    /// Store content in the session, replacing any file at `path`.
    pub async fn upload(&self, path: &str, content: impl Into<UploadSource>) -> Result<RemoteFile> {
        let size = self.session.upload(path, content.into()).await?;
        Ok(RemoteFile::new(path, &self.session, Some(size)))
    }

    /// [`upload`](Self::upload) bounded by `timeout` instead of the
    /// configured default.
    pub async fn upload_with(
        &self,
        path: &str,
        content: impl Into<UploadSource>,
        timeout: Duration,
    ) -> Result<RemoteFile> {
        let size = self
            .session
            .upload_within(path, content.into(), Some(timeout))
            .await?;
        Ok(RemoteFile::new(path, &self.session, Some(size)))
    }

    /// Fetch a file eagerly; its content is cached on the handle.
    pub async fn download(&self, path: &str) -> Result<RemoteFile> {
        let content = collect_bytes(self.session.download(path).await?).await?;
        Ok(RemoteFile::with_content(path, &self.session, content))
    }

    /// [`download`](Self::download) with the whole transfer bounded by
    /// `timeout`.
    pub async fn download_with(&self, path: &str, timeout: Duration) -> Result<RemoteFile> {
        let stream = self.session.download_within(path, Some(timeout)).await?;
        let content = collect_bytes(stream).await?;
        Ok(RemoteFile::with_content(path, &self.session, content))
    }

    /// Handle to a file without fetching it.
    pub fn file(&self, path: &str) -> RemoteFile {
        RemoteFile::new(path, &self.session, None)
    }

    pub async fn stream_download(&self, path: &str) -> Result<ByteStream> {
        self.session.download(path).await
    }

    /// The stream fails with [`Error::Timeout`] if the body is not fully
    /// read within `timeout`.
    pub async fn stream_download_with(&self, path: &str, timeout: Duration) -> Result<ByteStream> {
        self.session.download_within(path, Some(timeout)).await
    }

    /// Regular files in the working directory, hidden entries excluded.
    pub async fn list_files(&self) -> Result<Vec<RemoteFile>> {
        let files = self.session.list_files().await?;
        Ok(files
            .into_iter()
            .map(|info| RemoteFile::new(info.path, &self.session, info.size))
            .collect())
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    /// Install packages with the session's package manager.
    pub async fn install(&self, packages: &[&str]) -> Result<ExecResult> {
        if packages.is_empty() {
            return Err(Error::invalid_request("no packages to install"));
        }
        let pip = self.session.backend().pip_command();
        let args: Vec<String> = packages.iter().map(|p| shell_quote(p)).collect();
        let command = format!("{} install --quiet {}", pip, args.join(" "));
        tracing::info!(session_id = %self.session_id(), packages = ?packages, "Installing packages");
        self.execute(&command, KernelMode::Bash).await
    }

    /// Installed packages as `name==version` lines.
    pub async fn list_packages(&self) -> Result<Vec<String>> {
        let pip = self.session.backend().pip_command();
        let result = self
            .execute(&format!("{} list --format=freeze", pip), KernelMode::Bash)
            .await?;
        let text = result.text();
        if text.trim().is_empty() && !result.is_ok() {
            return Err(Error::internal(format!(
                "package listing failed: {}",
                result.errors().join("")
            )));
        }
        Ok(text
            .lines()
            .map(str::trim)
            .filter(|line| line.contains("=="))
            .map(str::to_string)
            .collect())
    }

    /// User-defined interpreter variables and a short `repr` of each.
    pub async fn show_variables(&self) -> Result<BTreeMap<String, String>> {
        let result = self.execute(SHOW_VARIABLES, KernelMode::Python).await?;
        if !result.is_ok() {
            return Err(Error::internal(format!(
                "variable listing failed: {}",
                result.errors().join("")
            )));
        }
        let text = result.text();
        let line = text
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .unwrap_or("{}");
        Ok(serde_json::from_str(line)?)
    }

    /// Keep the session from idling out for `duration` by pinging it every
    /// `keep_alive_interval`. Must be called from within a Tokio runtime.
    pub fn keep_alive(&self, duration: Duration) -> Result<KeepAlive> {
        let handle = Handle::try_current()
            .map_err(|e| Error::internal(format!("keep_alive needs a Tokio runtime: {}", e)))?;
        Ok(self.keep_alive_on(&handle, duration))
    }

    pub(crate) fn keep_alive_on(&self, handle: &Handle, duration: Duration) -> KeepAlive {
        let session = Arc::downgrade(&self.session);
        let interval = self.session.config().keep_alive_interval();
        tracing::debug!(session_id = %self.session_id(), ?duration, ?interval, "Keep-alive started");
        KeepAlive {
            task: handle.spawn(keep_alive(session, duration, interval)),
        }
    }
}

async fn keep_alive(session: Weak<Session>, duration: Duration, interval: Duration) {
    let until = tokio::time::Instant::now() + duration;
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if tokio::time::Instant::now() >= until {
            break;
        }
        let Some(session) = session.upgrade() else {
            break;
        };
        if session.state() == SessionState::Stopped {
            break;
        }
        let status = session.healthcheck().await;
        if !status.is_healthy() {
            tracing::warn!(session_id = %session.id(), %status, "Keep-alive ping failed");
        }
    }
    tracing::debug!("Keep-alive finished");
}

/// Background keep-alive task. Dropping the handle stops it.
#[derive(Debug)]
pub struct KeepAlive {
    task: JoinHandle<()>,
}

impl KeepAlive {
    pub fn cancel(&self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for KeepAlive {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_.=,+/:@".contains(c))
    {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}
