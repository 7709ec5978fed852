//! Persistent Python interpreter for the local backend.
//!
//! One actor task owns the interpreter process and serves requests one at a
//! time. The process runs a small driver that reads JSON requests from stdin
//! and answers in the tagged chunk protocol with entity-escaped payloads,
//! terminating every execution with `<end/>`. Dropping the chunk receiver
//! interrupts the running code with SIGINT; a process that ignores the
//! interrupt is killed and lazily respawned on the next request. Bumping the
//! [`Interrupts`] epoch kills the interpreter outright, even while nobody is
//! reading the output.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use futures::stream::{self, StreamExt};
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use serde_json::json;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use codebox_core::{Error, ExecChunk, Result};

use crate::decoder::{ChunkDecoder, ChunkStream};

const DRIVER: &str = include_str!("driver.py");
const INTERRUPT_GRACE: Duration = Duration::from_secs(2);
const READ_BUFFER: usize = 8192;

type ChunkSender = mpsc::Sender<Result<ExecChunk>>;

/// Epoch counter shared by a session's executions. Bumping it interrupts
/// every execution started under an earlier epoch.
#[derive(Clone)]
pub(crate) struct Interrupts {
    epoch: Arc<watch::Sender<u64>>,
}

impl Interrupts {
    pub(crate) fn new() -> Self {
        Self {
            epoch: Arc::new(watch::channel(0).0),
        }
    }

    pub(crate) fn current(&self) -> u64 {
        *self.epoch.borrow()
    }

    pub(crate) fn interrupt(&self) {
        self.epoch.send_modify(|epoch| *epoch += 1);
    }

    /// Resolves once the epoch has moved past `epoch`.
    pub(crate) async fn wait(&self, epoch: u64) {
        let mut epochs = self.epoch.subscribe();
        if epochs.wait_for(|current| *current != epoch).await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Output channel of one execution as a chunk stream.
pub(crate) fn receiver_stream(receiver: mpsc::Receiver<Result<ExecChunk>>) -> ChunkStream {
    stream::unfold(receiver, |mut receiver| async move {
        receiver.recv().await.map(|item| (item, receiver))
    })
    .boxed()
}

enum Request {
    Exec {
        code: String,
        cwd: Option<PathBuf>,
        epoch: u64,
        chunks: ChunkSender,
    },
    Restart {
        done: oneshot::Sender<Result<()>>,
    },
}

/// Handle to the kernel actor. Dropping it kills the interpreter.
pub(crate) struct PythonKernel {
    requests: mpsc::Sender<Request>,
    interrupts: Interrupts,
    task: JoinHandle<()>,
}

impl PythonKernel {
    /// Spawn the interpreter and wait for its readiness handshake.
    pub(crate) async fn spawn(
        python: PathBuf,
        root: PathBuf,
        interrupts: Interrupts,
    ) -> Result<Self> {
        let process = KernelProcess::spawn(&python, &root).await?;
        let (requests, inbox) = mpsc::channel(8);
        let actor = KernelActor {
            python,
            root,
            interrupts: interrupts.clone(),
            process: Some(process),
        };
        Ok(Self {
            requests,
            interrupts,
            task: tokio::spawn(actor.run(inbox)),
        })
    }

    pub(crate) async fn execute(&self, code: &str, cwd: Option<PathBuf>) -> Result<ChunkStream> {
        let (chunks, receiver) = mpsc::channel(64);
        self.requests
            .send(Request::Exec {
                code: code.to_string(),
                cwd,
                epoch: self.interrupts.current(),
                chunks,
            })
            .await
            .map_err(|_| Error::SessionClosed("python kernel has shut down".into()))?;
        Ok(receiver_stream(receiver))
    }

    /// Replace the interpreter with a fresh one. Callers bump the
    /// [`Interrupts`] epoch first so a running execution cannot hold the
    /// request up.
    pub(crate) async fn restart(&self) -> Result<()> {
        let (done, result) = oneshot::channel();
        self.requests
            .send(Request::Restart { done })
            .await
            .map_err(|_| Error::restart("python kernel has shut down"))?;
        result
            .await
            .map_err(|_| Error::restart("python kernel dropped the restart request"))?
    }

    pub(crate) fn is_alive(&self) -> bool {
        !self.task.is_finished()
    }
}

impl Drop for PythonKernel {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// =============================================================================
// Interpreter Process
// =============================================================================

struct KernelProcess {
    child: Child,
    stdin: ChildStdin,
    stdout: ChildStdout,
}

impl KernelProcess {
    async fn spawn(python: &Path, root: &Path) -> Result<Self> {
        let mut child = Command::new(python)
            .arg("-u")
            .arg("-c")
            .arg(DRIVER)
            .current_dir(root)
            .env("PYTHONUNBUFFERED", "1")
            .env("PYTHONIOENCODING", "utf-8")
            .env("MPLBACKEND", "Agg")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::startup(format!("Failed to spawn {}: {}", python.display(), e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::startup("python kernel stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::startup("python kernel stdout unavailable"))?;
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(%line, "python kernel stderr");
                }
            });
        }

        let mut process = Self {
            child,
            stdin,
            stdout,
        };
        process.handshake().await?;
        tracing::info!(pid = ?process.child.id(), python = %python.display(), "Python kernel started");
        Ok(process)
    }

    async fn handshake(&mut self) -> Result<()> {
        let mut decoder = ChunkDecoder::escaped();
        let mut buf = vec![0u8; READ_BUFFER];
        while !decoder.is_finished() {
            let n = self.stdout.read(&mut buf).await?;
            if n == 0 {
                return Err(Error::startup("python kernel exited during startup"));
            }
            for chunk in decoder.feed(&buf[..n]) {
                tracing::debug!(content = %chunk.content, "python kernel startup output");
            }
        }
        Ok(())
    }

    fn interrupt(&self) -> bool {
        let Some(pid) = self.child.id() else {
            return false;
        };
        match kill(Pid::from_raw(pid as i32), Signal::SIGINT) {
            Ok(()) => true,
            Err(errno) => {
                tracing::warn!(pid, %errno, "Failed to interrupt python kernel");
                false
            }
        }
    }

    /// Interrupt the running code and read until its `<end/>`. Returns
    /// false when the process has to be killed instead.
    async fn abandon(&mut self, decoder: &mut ChunkDecoder) -> bool {
        if !self.interrupt() {
            return false;
        }
        let stdout = &mut self.stdout;
        let drained = tokio::time::timeout(INTERRUPT_GRACE, async {
            let mut buf = vec![0u8; READ_BUFFER];
            while !decoder.is_finished() {
                match stdout.read(&mut buf).await {
                    Ok(0) | Err(_) => return false,
                    Ok(n) => {
                        decoder.feed(&buf[..n]);
                    }
                }
            }
            true
        })
        .await;
        matches!(drained, Ok(true))
    }
}

// =============================================================================
// Actor
// =============================================================================

enum Outcome {
    Completed,
    Abandoned { recovered: bool },
    Interrupted,
    Exited,
}

struct KernelActor {
    python: PathBuf,
    root: PathBuf,
    interrupts: Interrupts,
    process: Option<KernelProcess>,
}

impl KernelActor {
    async fn run(mut self, mut inbox: mpsc::Receiver<Request>) {
        while let Some(request) = inbox.recv().await {
            match request {
                Request::Exec {
                    code,
                    cwd,
                    epoch,
                    chunks,
                } => self.exec(code, cwd, epoch, chunks).await,
                Request::Restart { done } => {
                    let _ = done.send(self.respawn().await);
                }
            }
        }
        tracing::debug!("Python kernel actor stopped");
    }

    async fn respawn(&mut self) -> Result<()> {
        self.process = None;
        let process = KernelProcess::spawn(&self.python, &self.root)
            .await
            .map_err(|e| Error::restart(e.to_string()))?;
        self.process = Some(process);
        Ok(())
    }

    async fn exec(&mut self, code: String, cwd: Option<PathBuf>, epoch: u64, chunks: ChunkSender) {
        if chunks.is_closed() || self.interrupts.current() != epoch {
            return;
        }
        match self.run_exec(&code, cwd, epoch, &chunks).await {
            Ok(Outcome::Completed) => {}
            Ok(Outcome::Interrupted) => {
                tracing::debug!("Execution interrupted, killing python kernel");
                self.process = None;
            }
            Ok(Outcome::Abandoned { recovered: true }) => {
                tracing::debug!("Execution interrupted");
            }
            Ok(Outcome::Abandoned { recovered: false }) => {
                tracing::warn!("Python kernel ignored the interrupt, killing it");
                self.process = None;
            }
            Ok(Outcome::Exited) => {
                tracing::warn!("Python kernel exited during execution");
                self.process = None;
                let _ = chunks
                    .send(Ok(ExecChunk::error(
                        "python kernel exited unexpectedly; interpreter state was lost",
                    )))
                    .await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Python kernel failed");
                self.process = None;
                let _ = chunks.send(Err(e)).await;
            }
        }
    }

    async fn run_exec(
        &mut self,
        code: &str,
        cwd: Option<PathBuf>,
        epoch: u64,
        chunks: &ChunkSender,
    ) -> Result<Outcome> {
        let interrupts = self.interrupts.clone();
        if self.process.is_none() {
            tracing::info!("Respawning python kernel");
            self.process = Some(KernelProcess::spawn(&self.python, &self.root).await?);
        }
        let Some(process) = self.process.as_mut() else {
            return Err(Error::internal("python kernel process missing"));
        };

        let cwd = cwd.map(|dir| dir.to_string_lossy().into_owned());
        let mut line = serde_json::to_string(&json!({ "code": code, "cwd": cwd }))?;
        line.push('\n');
        process.stdin.write_all(line.as_bytes()).await?;
        process.stdin.flush().await?;

        let mut decoder = ChunkDecoder::escaped();
        let mut buf = vec![0u8; READ_BUFFER];
        loop {
            let n = tokio::select! {
                read = process.stdout.read(&mut buf) => read?,
                _ = chunks.closed() => {
                    let recovered = process.abandon(&mut decoder).await;
                    return Ok(Outcome::Abandoned { recovered });
                }
                _ = interrupts.wait(epoch) => return Ok(Outcome::Interrupted),
            };
            if n == 0 {
                return Ok(Outcome::Exited);
            }
            for chunk in decoder.feed(&buf[..n]) {
                let sent = tokio::select! {
                    sent = chunks.send(Ok(chunk)) => sent,
                    _ = interrupts.wait(epoch) => return Ok(Outcome::Interrupted),
                };
                if sent.is_err() {
                    let recovered = process.abandon(&mut decoder).await;
                    return Ok(Outcome::Abandoned { recovered });
                }
            }
            if decoder.is_finished() {
                return Ok(Outcome::Completed);
            }
        }
    }
}
