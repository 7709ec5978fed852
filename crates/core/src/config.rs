use std::path::Path;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use secrecy::{ExposeSecret, Secret};
use serde::Deserialize;

use crate::types::BackendKind;

/// Resolved options for one CodeBox session.
///
/// Read once when a session is created and never mutated afterwards.
#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CodeBoxConfig {
    /// `"local"`, `"docker"`, or a credential for the remote service.
    pub api_key: Option<Secret<String>>,
    /// Explicit backend selector; overrides the api-key convention.
    pub backend: Option<BackendKind>,
    pub base_url: String,
    /// Prebuilt environment for remote sessions.
    pub factory_id: String,
    /// Session to resume instead of creating a new one.
    pub session_id: Option<String>,

    pub image: String,
    /// Port the kernel API listens on inside the container.
    pub container_port: u16,
    pub memory_limit: i64,
    pub cpu_quota: i64,

    /// Working directory of local sessions.
    pub working_dir: String,
    /// Interpreter used by local sessions.
    pub python: String,

    /// Default execution timeout; 0 disables it.
    pub timeout_secs: u64,
    pub startup_timeout_secs: u64,
    pub health_timeout_secs: u64,
    pub keep_alive_interval_secs: u64,

    /// Upper bound on one file transfer chunk.
    pub transfer_chunk_size: usize,
    pub max_file_size: u64,

    pub debug: bool,
    pub show_info: bool,
}

impl CodeBoxConfig {
    /// Load from `codebox.{toml,json,yaml}` (or `CODEBOX_CONFIG_FILE`) and
    /// `CODEBOX_*` environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        let file = std::env::var("CODEBOX_CONFIG_FILE").unwrap_or_else(|_| "codebox".into());
        Self::load_from(Path::new(&file))
    }

    pub fn load_from(file: &Path) -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name(&file.to_string_lossy()).required(false))
            // Map CODEBOX_TIMEOUT_SECS=30 to timeout_secs
            .add_source(Environment::with_prefix("CODEBOX").try_parsing(true))
            .build()?;

        let config: Self = s.try_deserialize()?;
        config.validate()?;
        tracing::debug!(file = %file.display(), backend = %config.backend_kind(), "Configuration loaded");
        Ok(config)
    }

    pub fn local() -> Self {
        Self {
            backend: Some(BackendKind::Local),
            ..Default::default()
        }
    }

    pub fn docker() -> Self {
        Self {
            backend: Some(BackendKind::Docker),
            ..Default::default()
        }
    }

    pub fn remote(api_key: impl Into<String>) -> Self {
        Self {
            backend: Some(BackendKind::Remote),
            api_key: Some(Secret::new(api_key.into())),
            ..Default::default()
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn with_session_id(mut self, id: impl Into<String>) -> Self {
        self.session_id = Some(id.into());
        self
    }

    pub fn with_factory_id(mut self, id: impl Into<String>) -> Self {
        self.factory_id = id.into();
        self
    }

    pub fn with_image(mut self, image: impl Into<String>) -> Self {
        self.image = image.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout_secs = timeout.map_or(0, |d| d.as_secs().max(1));
        self
    }

    pub fn with_startup_timeout(mut self, timeout: Duration) -> Self {
        self.startup_timeout_secs = timeout.as_secs().max(1);
        self
    }

    pub fn with_transfer_chunk_size(mut self, size: usize) -> Self {
        self.transfer_chunk_size = size;
        self
    }

    /// Which backend this configuration selects.
    pub fn backend_kind(&self) -> BackendKind {
        if let Some(kind) = self.backend {
            return kind;
        }
        match self.api_key.as_ref().map(|k| k.expose_secret().as_str()) {
            None | Some("") | Some("local") => BackendKind::Local,
            Some("docker") => BackendKind::Docker,
            Some(_) => BackendKind::Remote,
        }
    }

    /// Credential sent to the remote service; selector keywords are not credentials.
    pub fn credential(&self) -> Option<&str> {
        self.api_key
            .as_ref()
            .map(|k| k.expose_secret().as_str())
            .filter(|k| !matches!(*k, "" | "local" | "docker"))
    }

    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_secs > 0).then(|| Duration::from_secs(self.timeout_secs))
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_secs(self.keep_alive_interval_secs.max(1))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.transfer_chunk_size == 0 {
            return Err(ConfigError::Message(
                "transfer_chunk_size must be greater than zero".into(),
            ));
        }
        if self.transfer_chunk_size as u64 > self.max_file_size {
            return Err(ConfigError::Message(format!(
                "transfer_chunk_size ({}) exceeds max_file_size ({})",
                self.transfer_chunk_size, self.max_file_size
            )));
        }
        if self.backend_kind() == BackendKind::Remote {
            url::Url::parse(&self.base_url).map_err(|e| {
                ConfigError::Message(format!("invalid base_url '{}': {}", self.base_url, e))
            })?;
        }
        Ok(())
    }
}

impl Default for CodeBoxConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            backend: None,
            base_url: "https://codeboxapi.com/api/v2".into(),
            factory_id: "default".into(),
            session_id: None,
            image: "shroominic/codebox:latest".into(),
            container_port: 8069,
            memory_limit: 1024 * 1024 * 1024, // 1GB
            cpu_quota: 100_000,               // 1 CPU core
            working_dir: ".codebox".into(),
            python: "python3".into(),
            timeout_secs: 60,
            startup_timeout_secs: 60,
            health_timeout_secs: 5,
            keep_alive_interval_secs: 60,
            transfer_chunk_size: 64 * 1024,
            max_file_size: 1024 * 1024 * 1024,
            debug: false,
            show_info: true,
        }
    }
}
