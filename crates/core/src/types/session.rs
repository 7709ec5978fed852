use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;

// =============================================================================
// Session & State Types
// =============================================================================

/// Lifecycle state of one execution session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    /// Created but never started.
    Uninitialized,
    /// Substrate is being brought up.
    Starting,
    /// Idle and accepting work.
    Ready,
    /// One execution is in flight.
    Executing,
    /// Substrate is being released.
    Stopping,
    /// Substrate released.
    Stopped,
    /// Unrecoverable backend failure; `start` or `restart` may recover.
    Error,
}

impl SessionState {
    /// Whether the substrate is up and reachable.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Ready | Self::Executing)
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Uninitialized => "uninitialized",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Executing => "executing",
            Self::Stopping => "stopping",
            Self::Stopped => "stopped",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Substrate a session runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Interpreter process on the host. Grants full host access.
    Local,
    /// One container per session.
    #[serde(alias = "containerized", alias = "container")]
    Docker,
    /// Remote execution service.
    Remote,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Local => "local",
            Self::Docker => "docker",
            Self::Remote => "remote",
        };
        f.write_str(s)
    }
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "docker" | "container" | "containerized" => Ok(Self::Docker),
            "remote" => Ok(Self::Remote),
            other => Err(Error::invalid_request(format!("unknown backend: {other}"))),
        }
    }
}

/// Interpreter context selected for one execution.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum KernelMode {
    /// Persistent Python interpreter.
    #[default]
    #[serde(rename = "ipython", alias = "python")]
    Python,
    /// One-shot shell command in the session's working directory.
    #[serde(rename = "bash", alias = "sh", alias = "shell")]
    Bash,
}

impl KernelMode {
    /// Name sent over the wire.
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::Python => "ipython",
            Self::Bash => "bash",
        }
    }
}

impl fmt::Display for KernelMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Python => f.write_str("python"),
            Self::Bash => f.write_str("bash"),
        }
    }
}

impl FromStr for KernelMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "python" | "ipython" | "python3" => Ok(Self::Python),
            "bash" | "sh" | "shell" => Ok(Self::Bash),
            other => Err(Error::UnsupportedKernel(other.to_string())),
        }
    }
}

/// Outcome of a health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Error,
}

impl HealthStatus {
    pub fn is_healthy(self) -> bool {
        self == Self::Healthy
    }
}

impl fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Healthy => f.write_str("healthy"),
            Self::Error => f.write_str("error"),
        }
    }
}

/// Snapshot of a session's identity and lifecycle.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfo {
    /// Unique session ID (container name suffix or server-side token).
    pub id: String,

    /// Backend the session runs on.
    pub backend: BackendKind,

    /// Current lifecycle state.
    pub state: SessionState,

    /// Creation timestamp.
    pub created_at: DateTime<Utc>,

    /// Last interaction timestamp.
    pub last_activity: DateTime<Utc>,

    /// Working directory inside the substrate, when known.
    pub working_dir: Option<String>,
}

/// A file entry as reported by a backend listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
    /// Path relative to the session's working directory.
    pub path: String,
    /// Size in bytes, when the backend reports it.
    pub size: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kernel_mode_parsing() {
        assert_eq!("python".parse::<KernelMode>().unwrap(), KernelMode::Python);
        assert_eq!("IPython".parse::<KernelMode>().unwrap(), KernelMode::Python);
        assert_eq!("bash".parse::<KernelMode>().unwrap(), KernelMode::Bash);

        let err = "ruby".parse::<KernelMode>().unwrap_err();
        assert!(matches!(err, Error::UnsupportedKernel(ref k) if k == "ruby"));
    }

    #[test]
    fn test_kernel_mode_wire_names() {
        assert_eq!(serde_json::to_value(KernelMode::Python).unwrap(), "ipython");
        assert_eq!(serde_json::to_value(KernelMode::Bash).unwrap(), "bash");
        let parsed: KernelMode = serde_json::from_str("\"python\"").unwrap();
        assert_eq!(parsed, KernelMode::Python);
    }

    #[test]
    fn test_backend_kind_aliases() {
        assert_eq!("containerized".parse::<BackendKind>().unwrap(), BackendKind::Docker);
        assert_eq!(BackendKind::Remote.to_string(), "remote");
        assert!("k8s".parse::<BackendKind>().is_err());
    }

    #[test]
    fn test_live_states() {
        assert!(SessionState::Ready.is_live());
        assert!(SessionState::Executing.is_live());
        assert!(!SessionState::Stopped.is_live());
        assert_eq!(SessionState::Uninitialized.to_string(), "uninitialized");
    }
}
