//! Backend adapters.
//!
//! Every substrate implements the same [`Backend`] capability set. The
//! session drives the lifecycle and guards the state machine; backends only
//! perform the raw operation against their substrate.

use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;

use codebox_core::{BackendKind, ChunkKind, Error, FileInfo, HealthStatus, KernelMode, Result};

use crate::decoder::ChunkStream;
use crate::transfer::ByteStream;

pub mod docker;
mod http;
pub mod local;
pub mod mock;
pub mod remote;

mod kernel;

pub use docker::DockerBackend;
pub use local::LocalBackend;
pub use mock::MockBackend;
pub use remote::RemoteBackend;

/// Per-call execution options.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Overrides the configured execution timeout.
    pub timeout: Option<Duration>,
    /// Working directory for this call, relative to the session root.
    pub cwd: Option<String>,
}

impl ExecOptions {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_cwd(mut self, cwd: impl Into<String>) -> Self {
        self.cwd = Some(cwd.into());
        self
    }
}

/// Listing used by backends without native filesystem access. Prints one
/// `size<TAB>path` line per regular file, hidden entries excluded.
pub(crate) const LIST_FILES_SCRIPT: &str =
    "find . -type f -not -path '*/.*' -exec stat -c '%s\t%n' {} + 2>/dev/null | sort -k2";

// =============================================================================
// Backend Trait
// =============================================================================

/// Capability set of one execution substrate.
///
/// Implementations must tolerate `stop` being called in any state and more
/// than once.
#[async_trait]
pub trait Backend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Session identifier. For resumable backends this is all a fresh client
    /// needs to reattach.
    fn session_id(&self) -> String;

    /// Working directory of the substrate, when it has a meaningful one.
    fn working_dir(&self) -> Option<String> {
        None
    }

    /// Command prefix used to manage Python packages.
    fn pip_command(&self) -> String {
        "pip".to_string()
    }

    /// Bring the substrate up (or reattach to it) and wait until it accepts
    /// work. The caller bounds this with the startup timeout.
    async fn start(&self) -> Result<()>;

    /// Release every substrate resource.
    async fn stop(&self) -> Result<()>;

    /// Reset interpreter state in place. [`Error::Restart`] means the
    /// substrate cannot, and the caller should stop and start instead.
    async fn restart(&self) -> Result<()>;

    /// Whether `stop` followed by `start` keeps the session identifier and
    /// the stored files. When it does not, a failed in-place restart is
    /// reported to the caller instead of falling back.
    fn cold_restart_keeps_files(&self) -> bool {
        true
    }

    /// Start one execution and return its decoded output. Dropping the
    /// stream must cancel the execution on the substrate.
    async fn execute(
        &self,
        code: &str,
        mode: KernelMode,
        options: &ExecOptions,
    ) -> Result<ChunkStream>;

    /// Store `content` at `path`, replacing any existing file. Returns the
    /// number of bytes written.
    async fn upload(&self, path: &str, content: ByteStream) -> Result<u64>;

    async fn download(&self, path: &str) -> Result<ByteStream>;

    async fn list_files(&self) -> Result<Vec<FileInfo>> {
        let mut output = self
            .execute(LIST_FILES_SCRIPT, KernelMode::Bash, &ExecOptions::default())
            .await?;
        let mut listing = String::new();
        while let Some(chunk) = output.next().await {
            let chunk = chunk?;
            match chunk.kind {
                ChunkKind::Text => listing.push_str(&chunk.content),
                ChunkKind::Error => {
                    return Err(Error::internal(format!(
                        "file listing failed: {}",
                        chunk.content.trim()
                    )))
                }
                ChunkKind::Image => {}
            }
        }
        Ok(parse_listing(&listing))
    }

    /// Lightweight round trip. Never changes session state.
    async fn healthcheck(&self, timeout: Duration) -> HealthStatus;
}

/// Parse `size<TAB>path` lines.
pub(crate) fn parse_listing(listing: &str) -> Vec<FileInfo> {
    listing
        .lines()
        .filter_map(|line| {
            let (size, path) = line.split_once('\t')?;
            let path = path.trim().trim_start_matches("./");
            if path.is_empty() {
                return None;
            }
            Some(FileInfo {
                path: path.to_string(),
                size: size.trim().parse().ok(),
            })
        })
        .collect()
}
