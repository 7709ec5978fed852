//! HTTP client for the kernel API served by the container image and by the
//! remote service.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{StreamExt, TryStreamExt};
use reqwest::{Method, RequestBuilder, Response};
use serde::Deserialize;
use serde_json::json;
use url::Url;

use codebox_core::{ApiError, ApiScope, Error, KernelMode, Result};

use super::ExecOptions;
use crate::decoder::{decode_stream, ChunkDecoder, ChunkStream};
use crate::transfer::ByteStream;

#[derive(Debug, Deserialize)]
struct StatusBody {
    #[serde(default)]
    status: String,
}

/// Readiness as reported by `GET /`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Readiness {
    Ready,
    Starting,
}

/// Build the shared HTTP client.
pub(crate) fn build_client(connect_timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(connect_timeout)
        .build()
        .map_err(|e| Error::internal(format!("Failed to build HTTP client: {}", e)))
}

pub(crate) fn map_reqwest(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::timeout(e.to_string())
    } else {
        Error::transport(e.to_string())
    }
}

/// Turn a non-success response into a classified error.
pub(crate) async fn check(response: Response, scope: ApiScope) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let headers: BTreeMap<String, String> = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
        })
        .collect();
    let body = response.bytes().await.unwrap_or_default();
    let api = ApiError::from_raw(status.as_u16(), &body, headers);
    tracing::debug!(status = api.status, message = %api.message(), "Kernel API returned an error");
    Err(Error::from_api(api, scope))
}

/// Client bound to one kernel API root.
#[derive(Clone)]
pub(crate) struct KernelClient {
    http: reqwest::Client,
    base: Url,
    credential: Option<String>,
}

impl KernelClient {
    pub(crate) fn new(http: reqwest::Client, base: Url, credential: Option<String>) -> Self {
        Self {
            http,
            base: with_trailing_slash(base),
            credential,
        }
    }

    pub(crate) fn base(&self) -> &Url {
        &self.base
    }

    fn url(&self, segments: &[&str]) -> Result<Url> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| Error::invalid_request(format!("not a base URL: {}", self.base)))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }

    fn request(&self, method: Method, url: Url) -> RequestBuilder {
        let builder = self.http.request(method, url);
        match &self.credential {
            Some(key) => builder.bearer_auth(key),
            None => builder,
        }
    }

    /// `GET /`.
    pub(crate) async fn ping(&self, timeout: Duration) -> Result<Readiness> {
        let response = self
            .request(Method::GET, self.base.clone())
            .timeout(timeout)
            .send()
            .await
            .map_err(map_reqwest)?;
        let body: StatusBody = check(response, ApiScope::Session)
            .await?
            .json()
            .await
            .map_err(map_reqwest)?;
        match body.status.as_str() {
            "starting" => Ok(Readiness::Starting),
            _ => Ok(Readiness::Ready),
        }
    }

    /// Poll `GET /` until the kernel reports ready. Connection failures are
    /// retried; the caller bounds the total wait.
    pub(crate) async fn wait_ready(&self, interval: Duration) -> Result<()> {
        loop {
            match self.ping(interval.max(Duration::from_secs(1))).await {
                Ok(Readiness::Ready) => return Ok(()),
                Ok(Readiness::Starting) => {
                    tracing::debug!(url = %self.base, "Kernel still starting");
                }
                Err(Error::Transport(msg)) | Err(Error::Timeout(msg)) => {
                    tracing::debug!(url = %self.base, error = %msg, "Kernel not reachable yet");
                }
                Err(e) => return Err(e),
            }
            tokio::time::sleep(interval).await;
        }
    }

    /// `POST /exec`, streamed back in the tagged protocol.
    pub(crate) async fn exec(
        &self,
        code: &str,
        mode: KernelMode,
        options: &ExecOptions,
    ) -> Result<ChunkStream> {
        let body = json!({
            "code": code,
            "kernel": mode.wire_name(),
            "timeout": options.timeout.map(|t| t.as_secs()),
            "cwd": options.cwd,
        });
        let response = self
            .request(Method::POST, self.url(&["exec"])?)
            .json(&body)
            .send()
            .await
            .map_err(map_reqwest)?;
        let response = check(response, ApiScope::Session).await?;
        let raw = response.bytes_stream().map_err(map_reqwest).boxed();
        Ok(decode_stream(raw, ChunkDecoder::tagged()))
    }

    /// `POST /restart`.
    pub(crate) async fn restart(&self, timeout: Duration) -> Result<()> {
        let response = self
            .request(Method::POST, self.url(&["restart"])?)
            .timeout(timeout)
            .send()
            .await
            .map_err(map_reqwest)?;
        check(response, ApiScope::Restart).await?;
        Ok(())
    }

    /// `POST /files/upload` with a streamed multipart body.
    pub(crate) async fn upload(&self, path: &str, content: ByteStream) -> Result<u64> {
        let sent = Arc::new(AtomicU64::new(0));
        let counter = Arc::clone(&sent);
        let body = reqwest::Body::wrap_stream(content.inspect_ok(move |chunk| {
            counter.fetch_add(chunk.len() as u64, Ordering::Relaxed);
        }));
        let part = reqwest::multipart::Part::stream(body)
            .file_name(path.to_string())
            .mime_str("application/octet-stream")
            .map_err(map_reqwest)?;
        let form = reqwest::multipart::Form::new().part("file", part);

        let response = self
            .request(Method::POST, self.url(&["files", "upload"])?)
            .multipart(form)
            .send()
            .await
            .map_err(upload_error)?;
        check(response, ApiScope::File).await?;
        Ok(sent.load(Ordering::Relaxed))
    }

    /// `GET /files/download/{path}`.
    pub(crate) async fn download(&self, path: &str) -> Result<ByteStream> {
        let mut segments = vec!["files", "download"];
        segments.extend(path.split('/').filter(|s| !s.is_empty()));
        let response = self
            .request(Method::GET, self.url(&segments)?)
            .send()
            .await
            .map_err(map_reqwest)?;
        let response = check(response, ApiScope::File).await?;
        Ok(response.bytes_stream().map_err(map_reqwest).boxed())
    }
}

/// A body stream error (e.g. a size limit hit mid-upload) surfaces from
/// reqwest as a request error; recover the original when possible.
fn upload_error(e: reqwest::Error) -> Error {
    let mut source = std::error::Error::source(&e);
    while let Some(err) = source {
        if let Some(Error::FileTooLarge { size, limit }) = err.downcast_ref::<Error>() {
            return Error::FileTooLarge {
                size: *size,
                limit: *limit,
            };
        }
        source = err.source();
    }
    map_reqwest(e)
}

fn with_trailing_slash(mut url: Url) -> Url {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    url
}
