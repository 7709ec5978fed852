//! Remote execution service backend.
//!
//! A session is a server-side allocation addressed by an opaque token. The
//! token is all a fresh client needs to reattach (see
//! [`CodeBoxConfig::session_id`]).

use std::sync::{Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Method;
use serde::Deserialize;
use serde_json::json;
use url::Url;

use codebox_core::{
    ApiScope, BackendKind, CodeBoxConfig, Error, HealthStatus, KernelMode, Result,
};

use super::http::{build_client, check, map_reqwest, KernelClient, Readiness};
use super::{Backend, ExecOptions};
use crate::decoder::ChunkStream;
use crate::transfer::ByteStream;

const READY_POLL_INTERVAL: Duration = Duration::from_millis(250);

#[derive(Debug, Deserialize)]
struct CreatedSession {
    id: String,
}

struct Attached {
    id: String,
    kernel: KernelClient,
}

pub struct RemoteBackend {
    http: reqwest::Client,
    base: Url,
    credential: Option<String>,
    factory_id: String,
    restart_timeout: Duration,
    /// Token to reattach to on the first start.
    resume: Mutex<Option<String>>,
    attached: RwLock<Option<Attached>>,
}

impl RemoteBackend {
    pub fn new(config: &CodeBoxConfig) -> Result<Self> {
        let base = Url::parse(&config.base_url)
            .map_err(|e| Error::invalid_request(format!("invalid base_url '{}': {}", config.base_url, e)))?;
        Ok(Self {
            http: build_client(config.health_timeout())?,
            base,
            credential: config.credential().map(str::to_string),
            factory_id: config.factory_id.clone(),
            restart_timeout: config.startup_timeout(),
            resume: Mutex::new(config.session_id.clone()),
            attached: RwLock::new(None),
        })
    }

    fn service_url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| Error::invalid_request(format!("not a base URL: {}", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> reqwest::RequestBuilder {
        let builder = self.http.request(method, url);
        match &self.credential {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    fn kernel_for(&self, id: &str) -> Result<KernelClient> {
        Ok(KernelClient::new(
            self.http.clone(),
            self.service_url(&["codebox", id])?,
            self.credential.clone(),
        ))
    }

    fn kernel(&self) -> Result<KernelClient> {
        let attached = self.attached.read().unwrap_or_else(|e| e.into_inner());
        attached
            .as_ref()
            .map(|a| a.kernel.clone())
            .ok_or_else(|| Error::SessionClosed("remote session is not attached".into()))
    }

    /// `POST {base}/codebox`.
    async fn allocate(&self) -> Result<String> {
        let response = self
            .request(Method::POST, self.service_url(&["codebox"])?)
            .json(&json!({ "factory_id": self.factory_id }))
            .send()
            .await
            .map_err(map_reqwest)?;
        let created: CreatedSession = check(response, ApiScope::Session)
            .await?
            .json()
            .await
            .map_err(map_reqwest)?;
        Ok(created.id)
    }
}

#[async_trait]
impl Backend for RemoteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Remote
    }

    fn session_id(&self) -> String {
        if let Some(attached) = self
            .attached
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .as_ref()
        {
            return attached.id.clone();
        }
        self.resume
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
            .unwrap_or_default()
    }

    async fn start(&self) -> Result<()> {
        // The resume token is kept until an attach succeeds, so a transient
        // failure retries the same session instead of allocating a new one.
        let resume = self.resume.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let (id, resumed) = match resume {
            Some(id) => (id, true),
            None => (self.allocate().await?, false),
        };
        let kernel = self.kernel_for(&id)?;
        kernel.wait_ready(READY_POLL_INTERVAL).await?;

        tracing::info!(session_id = %id, resumed, url = %kernel.base(), "Remote session attached");
        self.resume.lock().unwrap_or_else(|e| e.into_inner()).take();
        *self.attached.write().unwrap_or_else(|e| e.into_inner()) = Some(Attached { id, kernel });
        Ok(())
    }

    async fn stop(&self) -> Result<()> {
        let attached = self
            .attached
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let Some(attached) = attached else {
            return Ok(());
        };

        let response = self
            .request(Method::DELETE, self.service_url(&["codebox", &attached.id])?)
            .send()
            .await
            .map_err(map_reqwest)?;
        match check(response, ApiScope::Session).await {
            Ok(_) | Err(Error::SessionNotFound(_)) | Err(Error::SessionExpired(_)) => {
                tracing::info!(session_id = %attached.id, "Remote session released");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// A fresh start allocates a new substrate; the old files are gone.
    fn cold_restart_keeps_files(&self) -> bool {
        false
    }

    async fn restart(&self) -> Result<()> {
        self.kernel()?.restart(self.restart_timeout).await
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
            Ok(Readiness::Ready) => HealthStatus::Healthy,
            Ok(Readiness::Starting) => HealthStatus::Error,
            Err(e) => {
                tracing::debug!(error = %e, "Remote healthcheck failed");
                HealthStatus::Error
            }
        }
    }
}
