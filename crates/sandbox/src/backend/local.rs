//! Local backend: an interpreter process on the host.
//!
//! # Security
//!
//! This backend provides **no isolation**. Executed code runs with the full
//! privileges of the calling user and can read, write and delete anything
//! the user can, open network connections and spawn processes. Use it for
//! development only; run untrusted code through [`DockerBackend`] or
//! [`RemoteBackend`].
//!
//! [`DockerBackend`]: super::DockerBackend
//! [`RemoteBackend`]: super::RemoteBackend

use std::path::{Component, Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, StreamExt};
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

use codebox_core::{
    BackendKind, ChunkKind, CodeBoxConfig, Error, ExecChunk, FileInfo, HealthStatus, KernelMode,
    Result,
};

use super::kernel::{receiver_stream, Interrupts, PythonKernel};
use super::{Backend, ExecOptions};
use crate::decoder::{decode_stream, ChunkDecoder, ChunkStream};
use crate::transfer::{reader_stream, ByteStream};

const SHELL_READ_BUFFER: usize = 8192;

pub struct LocalBackend {
    id: String,
    root: PathBuf,
    python: String,
    chunk_size: usize,
    started: AtomicBool,
    interrupts: Interrupts,
    kernel: Mutex<Option<Arc<PythonKernel>>>,
}

impl LocalBackend {
    pub fn new(config: &CodeBoxConfig) -> Result<Self> {
        let dir = Path::new(&config.working_dir);
        let root = if dir.is_absolute() {
            dir.to_path_buf()
        } else {
            std::env::current_dir()?.join(dir)
        };
        Ok(Self {
            id: format!("local-{}", uuid::Uuid::new_v4()),
            root,
            python: config.python.clone(),
            chunk_size: config.transfer_chunk_size,
            started: AtomicBool::new(false),
            interrupts: Interrupts::new(),
            kernel: Mutex::new(None),
        })
    }

    /// Root directory of the session's files.
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn kernel(&self) -> Option<Arc<PythonKernel>> {
        self.kernel.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn ensure_started(&self) -> Result<()> {
        if self.started.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::SessionClosed(format!("local session {} is not running", self.id)))
        }
    }

    /// Map a session-relative path into the working directory. Absolute
    /// paths and `..` components are rejected.
    fn resolve_within(&self, path: &str) -> Result<PathBuf> {
        let relative = Path::new(path);
        let escapes = relative
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if escapes {
            return Err(Error::invalid_request(format!(
                "path must be relative to the working directory: {:?}",
                path
            )));
        }
        Ok(self.root.join(relative))
    }

    /// Like [`resolve_within`](Self::resolve_within), but the path must name
    /// an entry below the root, not the root itself.
    fn resolve(&self, path: &str) -> Result<PathBuf> {
        let names_entry = Path::new(path)
            .components()
            .any(|c| matches!(c, Component::Normal(_)));
        if !names_entry {
            return Err(Error::invalid_request(format!(
                "path does not name a file in the working directory: {:?}",
                path
            )));
        }
        self.resolve_within(path)
    }

    fn resolve_cwd(&self, cwd: Option<&str>) -> Result<PathBuf> {
        match cwd {
            Some(dir) => self.resolve_within(dir),
            None => Ok(self.root.clone()),
        }
    }

    /// Run one shell command in its own process group. A forwarding task
    /// owns the child; the group is killed when the command finishes, the
    /// output is dropped, or the session is interrupted.
    async fn execute_shell(&self, code: &str, cwd: PathBuf) -> Result<ChunkStream> {
        let shell = which::which("bash").unwrap_or_else(|_| PathBuf::from("sh"));
        let mut child = Command::new(&shell)
            .arg("-c")
            .arg(code)
            .current_dir(&cwd)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true)
            .spawn()?;
        let group = ProcessGroup::of(&child);

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::internal("shell stdout unavailable"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| Error::internal("shell stderr unavailable"))?;
        let output = stream::select(
            decode_stream(
                reader_stream(stdout, SHELL_READ_BUFFER),
                ChunkDecoder::plain(ChunkKind::Text),
            ),
            decode_stream(
                reader_stream(stderr, SHELL_READ_BUFFER),
                ChunkDecoder::plain(ChunkKind::Error),
            ),
        )
        .boxed();

        let (sender, receiver) = mpsc::channel(64);
        let interrupts = self.interrupts.clone();
        let epoch = interrupts.current();
        tokio::spawn(async move {
            let _group = group;
            if forward_shell_output(output, &sender, &interrupts, epoch).await {
                reap(child).await;
            } else {
                tracing::debug!("Shell command cancelled");
            }
        });
        Ok(receiver_stream(receiver))
    }

    async fn write_atomically(&self, target: &Path, mut content: ByteStream) -> Result<u64> {
        let parent = target
            .parent()
            .ok_or_else(|| Error::invalid_request(format!("no parent directory: {}", target.display())))?;
        tokio::fs::create_dir_all(parent).await?;

        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let partial = parent.join(format!(".{}.{}.part", file_name, uuid::Uuid::new_v4()));

        let write = async {
            let mut file = tokio::fs::File::create(&partial).await?;
            let mut written = 0u64;
            while let Some(chunk) = content.next().await {
                let chunk = chunk?;
                file.write_all(&chunk).await?;
                written += chunk.len() as u64;
            }
            file.flush().await?;
            file.sync_all().await?;
            Ok::<u64, Error>(written)
        };

        match write.await {
            Ok(written) => {
                tokio::fs::rename(&partial, target).await?;
                Ok(written)
            }
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                Err(e)
            }
        }
    }
}

#[async_trait]
impl Backend for LocalBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Local
    }

    fn session_id(&self) -> String {
        self.id.clone()
    }

    fn working_dir(&self) -> Option<String> {
        Some(self.root.display().to_string())
    }

    fn pip_command(&self) -> String {
        format!("{} -m pip", self.python)
    }

    async fn start(&self) -> Result<()> {
        tokio::fs::create_dir_all(&self.root).await.map_err(|e| {
            Error::startup(format!(
                "Failed to create working directory {}: {}",
                self.root.display(),
                e
            ))
        })?;

        match which::which(&self.python) {
            Ok(python) => {
                let kernel =
                    PythonKernel::spawn(python, self.root.clone(), self.interrupts.clone()).await?;
                *self.kernel.lock().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(kernel));
            }
            Err(e) => {
                tracing::warn!(python = %self.python, error = %e, "Python interpreter not found, only the bash kernel is available");
            }
        }

        self.started.store(true, Ordering::SeqCst);
        tracing::info!(session_id = %self.id, root = %self.root.display(), "Local session started");
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        self.started.store(false, Ordering::SeqCst);
        self.interrupts.interrupt();
        let kernel = self.kernel.lock().unwrap_or_else(|e| e.into_inner()).take();
        if kernel.is_some() {
            tracing::info!(session_id = %self.id, "Local python kernel stopped");
        }
        Ok(())
    }

    async fn restart(&self) -> Result<()> {
        self.ensure_started()?;
        self.interrupts.interrupt();
        match self.kernel() {
            Some(kernel) => kernel.restart().await,
            None => Ok(()),
        }
    }

    async fn execute(
        &self,
        code: &str,
        mode: KernelMode,
        options: &ExecOptions,
    ) -> Result<ChunkStream> {
        self.ensure_started()?;
        let cwd = self.resolve_cwd(options.cwd.as_deref())?;
        match mode {
            KernelMode::Bash => self.execute_shell(code, cwd).await,
            KernelMode::Python => {
                let kernel = self.kernel().ok_or_else(|| {
                    Error::UnsupportedKernel(format!(
                        "python (interpreter '{}' not found)",
                        self.python
                    ))
                })?;
                let cwd = options.cwd.is_some().then_some(cwd);
                kernel.execute(code, cwd).await
            }
        }
    }

    async fn upload(&self, path: &str, content: ByteStream) -> Result<u64> {
        self.ensure_started()?;
        let target = self.resolve(path)?;
        let written = self.write_atomically(&target, content).await?;
        tracing::debug!(path = %path, bytes = written, "Stored file");
        Ok(written)
    }

    async fn download(&self, path: &str) -> Result<ByteStream> {
        self.ensure_started()?;
        let target = self.resolve(path)?;
        let file = tokio::fs::File::open(&target).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::file_not_found(path),
            _ => Error::Io(e),
        })?;
        if file.metadata().await?.is_dir() {
            return Err(Error::invalid_request(format!("{} is a directory", path)));
        }
        Ok(reader_stream(file, self.chunk_size))
    }

    async fn list_files(&self) -> Result<Vec<FileInfo>> {
        self.ensure_started()?;
        let mut files = Vec::new();
        let mut pending = vec![self.root.clone()];
        while let Some(dir) = pending.pop() {
            let mut entries = tokio::fs::read_dir(&dir).await?;
            while let Some(entry) = entries.next_entry().await? {
                if entry.file_name().to_string_lossy().starts_with('.') {
                    continue;
                }
                let file_type = entry.file_type().await?;
                let path = entry.path();
                if file_type.is_dir() {
                    pending.push(path);
                } else if file_type.is_file() {
                    let size = entry.metadata().await?.len();
                    let relative = path
                        .strip_prefix(&self.root)
                        .unwrap_or(&path)
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().into_owned())
                        .collect::<Vec<_>>()
                        .join("/");
                    files.push(FileInfo {
                        path: relative,
                        size: Some(size),
                    });
                }
            }
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    async fn healthcheck(&self, _timeout: Duration) -> HealthStatus {
        if !self.started.load(Ordering::SeqCst) {
            return HealthStatus::Error;
        }
        match self.kernel() {
            Some(kernel) if !kernel.is_alive() => HealthStatus::Error,
            _ => HealthStatus::Healthy,
        }
    }
}

// =============================================================================
// Shell Processes
// =============================================================================

/// Kills a shell command's process group, background jobs included, when
/// dropped.
struct ProcessGroup(Option<Pid>);

impl ProcessGroup {
    fn of(child: &Child) -> Self {
        Self(child.id().map(|id| Pid::from_raw(id as i32)))
    }
}

impl Drop for ProcessGroup {
    fn drop(&mut self) {
        let Some(group) = self.0 else {
            return;
        };
        match killpg(group, Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(errno) => tracing::warn!(pgid = %group, %errno, "Failed to kill shell process group"),
        }
    }
}

/// Forward chunks until the output ends. Returns false when the receiver
/// went away or the session was interrupted first.
async fn forward_shell_output(
    mut output: ChunkStream,
    sender: &mpsc::Sender<Result<ExecChunk>>,
    interrupts: &Interrupts,
    epoch: u64,
) -> bool {
    loop {
        let item = tokio::select! {
            item = output.next() => item,
            _ = sender.closed() => return false,
            _ = interrupts.wait(epoch) => return false,
        };
        let Some(item) = item else {
            return true;
        };
        let sent = tokio::select! {
            sent = sender.send(item) => sent.is_ok(),
            _ = interrupts.wait(epoch) => false,
        };
        if !sent {
            return false;
        }
    }
}

async fn reap(mut child: Child) {
    match child.wait().await {
        Ok(status) => tracing::debug!(%status, "Shell command finished"),
        Err(e) => tracing::warn!(error = %e, "Failed to reap shell command"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(dir: &Path) -> LocalBackend {
        let config = CodeBoxConfig::local().with_working_dir(dir.display().to_string());
        LocalBackend::new(&config).unwrap()
    }

    #[test]
    fn test_resolve_rejects_escapes() {
        let tmp = tempfile::tempdir().unwrap();
        let local = backend(tmp.path());
        assert!(local.resolve("data/file.csv").is_ok());
        assert!(local.resolve("./file.csv").is_ok());
        assert!(matches!(local.resolve("../etc/passwd"), Err(Error::InvalidRequest(_))));
        assert!(matches!(local.resolve("/etc/passwd"), Err(Error::InvalidRequest(_))));
        assert!(matches!(local.resolve(""), Err(Error::InvalidRequest(_))));
        assert!(matches!(local.resolve("."), Err(Error::InvalidRequest(_))));
        assert!(matches!(local.resolve("./"), Err(Error::InvalidRequest(_))));
        assert!(local.resolve_cwd(Some(".")).is_ok());
    }

    #[tokio::test]
    async fn test_upload_to_root_is_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let local = backend(tmp.path());
        local.start().await.unwrap();

        let content = stream::once(async { Ok(bytes::Bytes::from_static(b"x")) }).boxed();
        let err = local.upload(".", content).await.unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
        assert!(tmp.path().is_dir());
        local.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_operations_require_start() {
        let tmp = tempfile::tempdir().unwrap();
        let local = backend(tmp.path());
        let err = local.download("x").await.err().unwrap();
        assert!(matches!(err, Error::SessionClosed(_)));
        assert_eq!(local.healthcheck(Duration::from_secs(1)).await, HealthStatus::Error);
    }
}
