//! One execution session: a backend driven through the state machine.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use tokio::time::Instant;

use codebox_core::{
    BackendKind, CodeBoxConfig, Error, FileInfo, HealthStatus, KernelMode, Result, SessionInfo,
    SessionState,
};

use crate::backend::{Backend, ExecOptions};
use crate::state::{RestartPlan, StateMachine};
use crate::stream::ExecStream;
use crate::transfer::{with_deadline, ByteStream, UploadSource};

/// An isolated execution context bound to one backend instance.
///
/// All lifecycle changes (`start`, `stop`, `restart`) are serialized. At most
/// one execution is in flight; file transfers do not take the execution slot
/// and may run next to it. Any operation on an uninitialized session starts
/// it first.
pub struct Session {
    backend: Arc<dyn Backend>,
    state: Arc<StateMachine>,
    config: CodeBoxConfig,
    lifecycle: tokio::sync::Mutex<()>,
}

impl Session {
    pub fn new(backend: Arc<dyn Backend>, config: CodeBoxConfig) -> Arc<Self> {
        Arc::new(Self {
            backend,
            state: StateMachine::new(),
            config,
            lifecycle: tokio::sync::Mutex::new(()),
        })
    }

    pub fn id(&self) -> String {
        self.backend.session_id()
    }

    pub fn kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub fn state(&self) -> SessionState {
        self.state.state()
    }

    pub fn config(&self) -> &CodeBoxConfig {
        &self.config
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id(),
            backend: self.kind(),
            state: self.state(),
            created_at: self.state.created_at(),
            last_activity: self.state.last_activity(),
            working_dir: self.backend.working_dir(),
        }
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Bring the substrate up. A no-op on a live session.
    pub async fn start(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if !self.state.begin_start()? {
            return Ok(());
        }
        self.start_backend().await
    }

    /// Release all substrate resources. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        if !self.state.begin_stop() {
            tracing::debug!(session_id = %self.id(), "Session already stopped");
            return Ok(());
        }
        match self.backend.stop().await {
            Ok(()) => {
                self.state.set(SessionState::Stopped);
                tracing::info!(session_id = %self.id(), backend = %self.kind(), "Session stopped");
                Ok(())
            }
            Err(e) => {
                tracing::warn!(session_id = %self.id(), error = %e, "Failed to release session");
                self.state.set(SessionState::Error);
                Err(e)
            }
        }
    }

    /// Reset interpreter state, cancelling any in-flight execution. Falls
    /// back to stop and start when the substrate cannot restart in place and
    /// a cold start keeps the session's files; otherwise the
    /// [`Error::Restart`] is returned and the session stays as it was.
    pub async fn restart(&self) -> Result<()> {
        let _lifecycle = self.lifecycle.lock().await;
        let plan = self.state.begin_restart()?;
        tracing::info!(session_id = %self.id(), ?plan, "Restarting session");

        if plan == RestartPlan::InPlace {
            let timeout = self.config.startup_timeout();
            let outcome = tokio::time::timeout(timeout, self.backend.restart())
                .await
                .unwrap_or_else(|_| {
                    Err(Error::timeout(format!(
                        "restart did not finish within {:?}",
                        timeout
                    )))
                });
            match outcome {
                Ok(()) => {
                    self.state.set(SessionState::Ready);
                    return Ok(());
                }
                Err(Error::Restart(reason)) if self.backend.cold_restart_keeps_files() => {
                    tracing::warn!(session_id = %self.id(), %reason, "In-place restart unsupported, falling back to stop and start");
                }
                Err(e @ Error::Restart(_)) => {
                    let health = self
                        .backend
                        .healthcheck(self.config.health_timeout())
                        .await;
                    tracing::warn!(session_id = %self.id(), error = %e, ?health, "In-place restart failed, keeping the session");
                    self.state.set(if health == HealthStatus::Healthy {
                        SessionState::Ready
                    } else {
                        SessionState::Error
                    });
                    return Err(e);
                }
                Err(e) => {
                    self.state.set(if e.is_fatal() {
                        SessionState::Error
                    } else {
                        SessionState::Ready
                    });
                    return Err(e);
                }
            }
        }

        if let Err(e) = self.backend.stop().await {
            tracing::warn!(session_id = %self.id(), error = %e, "Stop during restart failed");
        }
        self.start_backend().await
    }

    /// Start the backend from `STARTING`, ending in `READY` or `ERROR`.
    async fn start_backend(&self) -> Result<()> {
        let timeout = self.config.startup_timeout();
        tracing::info!(backend = %self.kind(), "Starting session");

        let outcome = tokio::time::timeout(timeout, self.backend.start())
            .await
            .unwrap_or_else(|_| {
                Err(Error::startup(format!(
                    "substrate not ready within {:?}",
                    timeout
                )))
            });

        match outcome {
            Ok(()) => {
                self.state.set(SessionState::Ready);
                if self.config.show_info {
                    tracing::info!(session_id = %self.id(), backend = %self.kind(), "Session ready");
                }
                Ok(())
            }
            Err(e) => {
                tracing::warn!(backend = %self.kind(), error = %e, "Session failed to start");
                self.state.set(SessionState::Error);
                if let Err(release) = self.backend.stop().await {
                    tracing::debug!(error = %release, "Cleanup after failed start failed");
                }
                Err(startup_error(e))
            }
        }
    }

    async fn ensure_started(&self) -> Result<()> {
        if self.state.state() == SessionState::Uninitialized {
            self.start().await?;
        }
        Ok(())
    }

    /// Move to `ERROR` when a failure means the substrate is gone.
    fn observe<T>(&self, result: Result<T>) -> Result<T> {
        if let Err(e) = &result {
            if e.is_fatal() {
                tracing::warn!(session_id = %self.id(), error = %e, "Session lost its substrate");
                self.state.set(SessionState::Error);
            }
        }
        result
    }

    async fn bounded<T>(
        &self,
        operation: &str,
        timeout: Option<Duration>,
        fut: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        match timeout {
            Some(timeout) => tokio::time::timeout(timeout, fut).await.unwrap_or_else(|_| {
                Err(Error::timeout(format!(
                    "{} did not finish within {:?}",
                    operation, timeout
                )))
            }),
            None => fut.await,
        }
    }

    // =========================================================================
    // Execution
    // =========================================================================

    /// Start one execution. Fails with [`Error::SessionBusy`] while another
    /// one is in flight.
    pub async fn execute(
        &self,
        code: &str,
        mode: KernelMode,
        mut options: ExecOptions,
    ) -> Result<ExecStream> {
        self.ensure_started().await?;
        let id = self.id();
        let (guard, registration) = self.state.begin_execute(&id)?;

        options.timeout = options.timeout.or_else(|| self.config.timeout());
        let deadline = options.timeout.map(|t| Instant::now() + t);
        tracing::debug!(session_id = %id, kernel = %mode, bytes = code.len(), "Executing code");

        if code.trim().is_empty() {
            return Ok(ExecStream::new(
                stream::empty().boxed(),
                registration,
                None,
                guard,
            ));
        }

        let opening = self.backend.execute(code, mode, &options);
        let opened = match deadline {
            Some(deadline) => tokio::time::timeout_at(deadline, opening)
                .await
                .unwrap_or_else(|_| Err(Error::timeout("execution did not start in time"))),
            None => opening.await,
        };

        match opened {
            Ok(chunks) => Ok(ExecStream::new(chunks, registration, deadline, guard)),
            Err(e) => {
                tracing::warn!(session_id = %id, error = %e, "Execution failed to start");
                if e.is_fatal() {
                    guard.fault();
                }
                Err(e)
            }
        }
    }

    // =========================================================================
    // Files
    // =========================================================================

    /// Store content at `path`, replacing any existing file.
    pub async fn upload(&self, path: &str, source: UploadSource) -> Result<u64> {
        self.upload_within(path, source, self.config.timeout()).await
    }

    /// [`upload`](Self::upload) under its own timeout instead of the
    /// configured one.
    pub async fn upload_within(
        &self,
        path: &str,
        source: UploadSource,
        timeout: Option<Duration>,
    ) -> Result<u64> {
        self.ensure_started().await?;
        let id = self.id();
        self.state.check_usable("upload", &id)?;

        let chunks = source.into_chunks(self.config.transfer_chunk_size, self.config.max_file_size);
        let result = self
            .bounded("upload", timeout, self.backend.upload(path, chunks))
            .await;
        let written = self.observe(result)?;
        self.state.touch();
        tracing::debug!(session_id = %id, path = %path, bytes = written, "Uploaded file");
        Ok(written)
    }

    /// Open a file for streaming download.
    pub async fn download(&self, path: &str) -> Result<ByteStream> {
        self.download_within(path, self.config.timeout()).await
    }

    /// Open a file for streaming download. The timeout covers opening the
    /// file and every chunk of its body.
    pub async fn download_within(&self, path: &str, timeout: Option<Duration>) -> Result<ByteStream> {
        self.ensure_started().await?;
        self.state.check_usable("download", &self.id())?;
        let deadline = timeout.map(|t| Instant::now() + t);
        let result = self
            .bounded("download", timeout, self.backend.download(path))
            .await;
        let stream = self.observe(result)?;
        self.state.touch();
        Ok(match deadline {
            Some(deadline) => with_deadline(stream, deadline, format!("download of {}", path)),
            None => stream,
        })
    }

    pub async fn list_files(&self) -> Result<Vec<FileInfo>> {
        self.ensure_started().await?;
        self.state.check_usable("list files", &self.id())?;
        let result = self
            .bounded("list files", self.config.timeout(), self.backend.list_files())
            .await;
        self.observe(result)
    }

    /// Lightweight round trip. Does not change state; a session that is not
    /// live is never healthy.
    pub async fn healthcheck(&self) -> HealthStatus {
        self.healthcheck_within(self.config.health_timeout()).await
    }

    pub async fn healthcheck_within(&self, timeout: Duration) -> HealthStatus {
        if !self.state.state().is_live() {
            return HealthStatus::Error;
        }
        tokio::time::timeout(timeout, self.backend.healthcheck(timeout))
            .await
            .unwrap_or(HealthStatus::Error)
    }
}

/// Substrate failures during start surface as [`Error::Startup`]; service
/// classifications such as authentication are kept.
fn startup_error(e: Error) -> Error {
    match e {
        Error::Transport(msg) | Error::Timeout(msg) | Error::Docker(msg) => Error::Startup(msg),
        Error::Io(io) => Error::Startup(io.to_string()),
        other => other,
    }
}
