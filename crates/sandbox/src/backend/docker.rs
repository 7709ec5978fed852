//! Container backend using the `bollard` crate.
//!
//! One container per session. The container runs the kernel API image and
//! publishes its port on an ephemeral loopback port of the host; all
//! execution and file traffic goes through that port. The container name is
//! the session identifier, so a fresh client can reattach by name.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;
use std::time::Duration;

use async_trait::async_trait;
use bollard::container::{
    Config, CreateContainerOptions, InspectContainerOptions, RemoveContainerOptions,
    RestartContainerOptions, StopContainerOptions,
};
use bollard::image::CreateImageOptions;
use bollard::models::{ContainerInspectResponse, HostConfig, PortBinding, ResourcesUlimits};
use futures::StreamExt;
use url::Url;

use codebox_core::{BackendKind, CodeBoxConfig, Error, HealthStatus, KernelMode, Result};

use super::http::{build_client, KernelClient};
use super::{Backend, ExecOptions};
use crate::decoder::ChunkStream;
use crate::transfer::ByteStream;

const READY_POLL_INTERVAL: Duration = Duration::from_millis(250);
const MANAGED_BY: &str = "codebox";

pub struct DockerBackend {
    docker: bollard::Docker,
    http: reqwest::Client,
    name: String,
    image: String,
    container_port: u16,
    memory_limit: i64,
    cpu_quota: i64,
    restart_timeout: Duration,
    /// Reattach instead of creating on the first start.
    resume_pending: AtomicBool,
    kernel: RwLock<Option<KernelClient>>,
}

impl DockerBackend {
    /// Connect to the local Docker daemon.
    pub fn new(config: &CodeBoxConfig) -> Result<Self> {
        let docker = bollard::Docker::connect_with_local_defaults().map_err(|e| {
            Error::docker(format!(
                "Failed to connect to Docker daemon: {}. Is Docker running?",
                e
            ))
        })?;
        Self::from_client(docker, config)
    }

    /// Create from an existing bollard client.
    pub fn from_client(docker: bollard::Docker, config: &CodeBoxConfig) -> Result<Self> {
        let name = config
            .session_id
            .clone()
            .unwrap_or_else(|| format!("codebox-{}", uuid::Uuid::new_v4()));
        Ok(Self {
            docker,
            http: build_client(config.health_timeout())?,
            name,
            image: config.image.clone(),
            container_port: config.container_port,
            memory_limit: config.memory_limit,
            cpu_quota: config.cpu_quota,
            restart_timeout: config.startup_timeout(),
            resume_pending: AtomicBool::new(config.session_id.is_some()),
            kernel: RwLock::new(None),
        })
    }

    fn port_key(&self) -> String {
        format!("{}/tcp", self.container_port)
    }

    fn kernel(&self) -> Result<KernelClient> {
        self.kernel
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .ok_or_else(|| Error::SessionClosed(format!("container {} is not running", self.name)))
    }

    async fn inspect(&self) -> Result<Option<ContainerInspectResponse>> {
        match self
            .docker
            .inspect_container(&self.name, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => Ok(Some(info)),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(None),
            Err(e) => Err(Error::docker(format!(
                "Failed to inspect container {}: {}",
                self.name, e
            ))),
        }
    }

    /// Pull the image unless it is already present.
    async fn ensure_image(&self) -> Result<()> {
        if self.docker.inspect_image(&self.image).await.is_ok() {
            return Ok(());
        }
        tracing::info!(image = %self.image, "Pulling container image");
        let options = CreateImageOptions {
            from_image: self.image.as_str(),
            ..Default::default()
        };
        let mut pull = self.docker.create_image(Some(options), None, None);
        while let Some(progress) = pull.next().await {
            let progress = progress
                .map_err(|e| Error::startup(format!("Failed to pull image {}: {}", self.image, e)))?;
            if let Some(status) = progress.status {
                tracing::debug!(image = %self.image, %status, "Pull progress");
            }
        }
        Ok(())
    }

    async fn create(&self) -> Result<()> {
        let port_key = self.port_key();

        let host_config = HostConfig {
            memory: Some(self.memory_limit),
            cpu_quota: Some(self.cpu_quota),
            cpu_period: Some(100_000), // standard 100ms period
            // Ephemeral host port, loopback only
            port_bindings: Some(HashMap::from([(
                port_key.clone(),
                Some(vec![PortBinding {
                    host_ip: Some("127.0.0.1".to_string()),
                    host_port: Some(String::new()),
                }]),
            )])),
            security_opt: Some(vec!["no-new-privileges:true".to_string()]),
            pids_limit: Some(256),
            ulimits: Some(vec![ResourcesUlimits {
                name: Some("nofile".to_string()),
                soft: Some(1024),
                hard: Some(2048),
            }]),
            ..Default::default()
        };

        let container_config = Config {
            image: Some(self.image.clone()),
            exposed_ports: Some(HashMap::from([(port_key, HashMap::new())])),
            env: Some(vec![format!("PORT={}", self.container_port)]),
            host_config: Some(host_config),
            labels: Some(HashMap::from([(
                "managed-by".to_string(),
                MANAGED_BY.to_string(),
            )])),
            ..Default::default()
        };

        let options = CreateContainerOptions {
            name: self.name.as_str(),
            platform: None,
        };

        self.docker
            .create_container(Some(options), container_config)
            .await
            .map_err(|e| Error::startup(format!("Failed to create container {}: {}", self.name, e)))?;

        tracing::info!(session_id = %self.name, image = %self.image, "Container created");
        Ok(())
    }

    async fn start_container(&self) -> Result<()> {
        self.docker
            .start_container::<String>(&self.name, None)
            .await
            .map_err(|e| Error::startup(format!("Failed to start container {}: {}", self.name, e)))
    }

    /// Read the published port and wait for the kernel API behind it.
    async fn attach(&self) -> Result<()> {
        let info = self
            .inspect()
            .await?
            .ok_or_else(|| Error::SessionNotFound(self.name.clone()))?;
        let host_port = info
            .network_settings
            .and_then(|settings| settings.ports)
            .and_then(|mut ports| ports.remove(&self.port_key()))
            .flatten()
            .and_then(|bindings| bindings.into_iter().find_map(|b| b.host_port))
            .and_then(|port| port.parse::<u16>().ok())
            .ok_or_else(|| {
                Error::startup(format!(
                    "container {} does not publish port {}",
                    self.name, self.container_port
                ))
            })?;

        let url = Url::parse(&format!("http://127.0.0.1:{}/", host_port))
            .map_err(|e| Error::internal(format!("Invalid kernel URL: {}", e)))?;
        let kernel = KernelClient::new(self.http.clone(), url, None);
        kernel.wait_ready(READY_POLL_INTERVAL).await?;

        tracing::debug!(session_id = %self.name, host_port, "Kernel API reachable");
        *self.kernel.write().unwrap_or_else(|e| e.into_inner()) = Some(kernel);
        Ok(())
    }
}

#[async_trait]
impl Backend for DockerBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Docker
    }

    fn session_id(&self) -> String {
        self.name.clone()
    }

    async fn start(&self) -> Result<()> {
        let resume = self.resume_pending.swap(false, Ordering::SeqCst);
        match self.inspect().await? {
            Some(info) => {
                let running = info.state.and_then(|s| s.running).unwrap_or(false);
                if !running {
                    self.start_container().await?;
                }
                tracing::info!(session_id = %self.name, was_running = running, "Reattached to container");
            }
            None if resume => return Err(Error::SessionNotFound(self.name.clone())),
            None => {
                self.ensure_image().await?;
                self.create().await?;
                self.start_container().await?;
            }
        }
        self.attach().await
    }

    async fn stop(&self) -> Result<()> {
        *self.kernel.write().unwrap_or_else(|e| e.into_inner()) = None;

        // Stop the container (with 5s grace period)
        let _ = self
            .docker
            .stop_container(&self.name, Some(StopContainerOptions { t: 5 }))
            .await;

        match self
            .docker
            .remove_container(
                &self.name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => {
                tracing::info!(session_id = %self.name, "Container destroyed");
                Ok(())
            }
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(()),
            Err(e) => Err(Error::docker(format!(
                "Failed to remove container {}: {}",
                self.name, e
            ))),
        }
    }

    /// A fresh start allocates a new substrate; the old files are gone.
    fn cold_restart_keeps_files(&self) -> bool {
        false
    }

    async fn restart(&self) -> Result<()> {
        match self.kernel()?.restart(self.restart_timeout).await {
            Err(Error::Restart(reason)) => {
                tracing::warn!(session_id = %self.name, %reason, "Kernel restart unsupported, restarting container");
            }
            other => return other,
        }

        *self.kernel.write().unwrap_or_else(|e| e.into_inner()) = None;
        self.docker
            .restart_container(&self.name, Some(RestartContainerOptions { t: 5 }))
            .await
            .map_err(|e| Error::restart(format!("Failed to restart container {}: {}", self.name, e)))?;
        // The published port may change across a container restart.
        self.attach().await
    }

    async fn execute(
        &self,
        code: &str,
        mode: KernelMode,
        options: &ExecOptions,
    ) -> Result<ChunkStream> {
        self.kernel()?.exec(code, mode, options).await
    }

    async fn upload(&self, path: &str, content: ByteStream) -> Result<u64> {
        self.kernel()?.upload(path, content).await
    }

    async fn download(&self, path: &str) -> Result<ByteStream> {
        self.kernel()?.download(path).await
    }

    async fn healthcheck(&self, timeout: Duration) -> HealthStatus {
        let Ok(kernel) = self.kernel() else {
            return HealthStatus::Error;
        };
        match kernel.ping(timeout).await {
            Ok(super::http::Readiness::Ready) => HealthStatus::Healthy,
            _ => HealthStatus::Error,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(config: &CodeBoxConfig) -> DockerBackend {
        let docker = bollard::Docker::connect_with_local_defaults().unwrap();
        DockerBackend::from_client(docker, config).unwrap()
    }

    #[tokio::test]
    async fn test_container_naming() {
        let fresh = backend(&CodeBoxConfig::docker());
        assert!(fresh.session_id().starts_with("codebox-"));
        assert!(!fresh.resume_pending.load(Ordering::SeqCst));

        let resumed = backend(&CodeBoxConfig::docker().with_session_id("codebox-abc"));
        assert_eq!(resumed.session_id(), "codebox-abc");
        assert!(resumed.resume_pending.load(Ordering::SeqCst));
        assert_eq!(resumed.port_key(), "8069/tcp");
    }

    #[tokio::test]
    async fn test_operations_before_start_are_closed() {
        let docker = backend(&CodeBoxConfig::docker());
        let err = docker.download("x").await.err().unwrap();
        assert!(matches!(err, Error::SessionClosed(_)));
        assert_eq!(docker.healthcheck(Duration::from_secs(1)).await, HealthStatus::Error);
    }
}
