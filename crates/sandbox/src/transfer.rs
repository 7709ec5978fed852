//! File transfer layer shared by all backends.
//!
//! Uploads are always handed to a backend as a bounded-chunk [`ByteStream`],
//! whatever the caller supplied, so no backend ever buffers a whole file.

use std::fmt;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::sync::{Arc, Weak};
use std::task::{Context, Poll};

use bytes::Bytes;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::OnceCell;
use tokio::time::{Instant, Sleep};

use codebox_core::{Error, Result};

use crate::session::Session;

/// Lazy, finite, non-restartable sequence of byte chunks.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

// =============================================================================
// Upload Sources
// =============================================================================

/// Content for an upload: an in-memory buffer or an incremental source.
pub enum UploadSource {
    Buffer(Bytes),
    Reader(Box<dyn AsyncRead + Send + Unpin>),
    Stream(ByteStream),
}

impl UploadSource {
    pub fn reader(reader: impl AsyncRead + Send + Unpin + 'static) -> Self {
        Self::Reader(Box::new(reader))
    }

    pub fn stream(stream: ByteStream) -> Self {
        Self::Stream(stream)
    }

    /// Stream a local file.
    pub async fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = tokio::fs::File::open(path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::file_not_found(path.display().to_string()),
            _ => Error::Io(e),
        })?;
        Ok(Self::reader(file))
    }

    /// Known size, for in-memory buffers.
    pub fn len_hint(&self) -> Option<u64> {
        match self {
            Self::Buffer(bytes) => Some(bytes.len() as u64),
            _ => None,
        }
    }

    /// Split into chunks of at most `chunk_size` bytes, failing with
    /// [`Error::FileTooLarge`] once more than `limit` bytes have been seen.
    pub fn into_chunks(self, chunk_size: usize, limit: u64) -> ByteStream {
        let chunk_size = chunk_size.max(1);
        match self {
            Self::Buffer(bytes) => {
                if bytes.len() as u64 > limit {
                    let err = Error::FileTooLarge {
                        size: bytes.len() as u64,
                        limit,
                    };
                    return stream::once(async move { Err(err) }).boxed();
                }
                let pieces: Vec<Result<Bytes>> = (0..bytes.len())
                    .step_by(chunk_size)
                    .map(|start| Ok(bytes.slice(start..(start + chunk_size).min(bytes.len()))))
                    .collect();
                stream::iter(pieces).boxed()
            }
            Self::Reader(reader) => bounded(reader_stream(reader, chunk_size), chunk_size, limit),
            Self::Stream(inner) => bounded(inner, chunk_size, limit),
        }
    }
}

impl From<Bytes> for UploadSource {
    fn from(bytes: Bytes) -> Self {
        Self::Buffer(bytes)
    }
}

impl From<Vec<u8>> for UploadSource {
    fn from(bytes: Vec<u8>) -> Self {
        Self::Buffer(Bytes::from(bytes))
    }
}

impl From<&[u8]> for UploadSource {
    fn from(bytes: &[u8]) -> Self {
        Self::Buffer(Bytes::copy_from_slice(bytes))
    }
}

impl From<String> for UploadSource {
    fn from(text: String) -> Self {
        Self::Buffer(Bytes::from(text))
    }
}

impl From<&str> for UploadSource {
    fn from(text: &str) -> Self {
        Self::Buffer(Bytes::copy_from_slice(text.as_bytes()))
    }
}

impl fmt::Debug for UploadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buffer(bytes) => write!(f, "UploadSource::Buffer({} bytes)", bytes.len()),
            Self::Reader(_) => f.write_str("UploadSource::Reader"),
            Self::Stream(_) => f.write_str("UploadSource::Stream"),
        }
    }
}

/// Read `reader` to the end in pieces of at most `chunk_size` bytes.
pub fn reader_stream<R>(reader: R, chunk_size: usize) -> ByteStream
where
    R: AsyncRead + Send + Unpin + 'static,
{
    let chunk_size = chunk_size.max(1);
    stream::unfold(Some(reader), move |state| async move {
        let mut reader = state?;
        let mut buf = vec![0u8; chunk_size];
        match reader.read(&mut buf).await {
            Ok(0) => None,
            Ok(n) => {
                buf.truncate(n);
                Some((Ok(Bytes::from(buf)), Some(reader)))
            }
            Err(e) => Some((Err(Error::Io(e)), None)),
        }
    })
    .boxed()
}

/// Re-chunk `inner` to `chunk_size` and enforce the size limit.
fn bounded(inner: ByteStream, chunk_size: usize, limit: u64) -> ByteStream {
    let mut total = 0u64;
    inner
        .flat_map(move |item| {
            let pieces: Vec<Result<Bytes>> = match item {
                Ok(bytes) => {
                    total += bytes.len() as u64;
                    if total > limit {
                        vec![Err(Error::FileTooLarge { size: total, limit })]
                    } else {
                        (0..bytes.len())
                            .step_by(chunk_size)
                            .map(|start| {
                                Ok(bytes.slice(start..(start + chunk_size).min(bytes.len())))
                            })
                            .collect()
                    }
                }
                Err(e) => vec![Err(e)],
            };
            stream::iter(pieces)
        })
        .boxed()
}

/// Drain a byte stream into one buffer.
pub async fn collect_bytes(mut stream: ByteStream) -> Result<Bytes> {
    let mut buf = Vec::new();
    while let Some(chunk) = stream.next().await {
        buf.extend_from_slice(&chunk?);
    }
    Ok(Bytes::from(buf))
}

/// Fail `stream` with [`Error::Timeout`] once `deadline` passes, however
/// far into the body it is.
pub fn with_deadline(stream: ByteStream, deadline: Instant, operation: impl Into<String>) -> ByteStream {
    Deadline {
        inner: Some(stream),
        sleep: Box::pin(tokio::time::sleep_until(deadline)),
        deadline,
        operation: operation.into(),
    }
    .boxed()
}

struct Deadline {
    inner: Option<ByteStream>,
    sleep: Pin<Box<Sleep>>,
    deadline: Instant,
    operation: String,
}

impl Stream for Deadline {
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };
        if Instant::now() >= this.deadline || this.sleep.as_mut().poll(cx).is_ready() {
            this.inner = None;
            tracing::warn!(operation = %this.operation, "Transfer deadline passed");
            return Poll::Ready(Some(Err(Error::timeout(format!(
                "{} did not finish in time",
                this.operation
            )))));
        }
        match inner.poll_next_unpin(cx) {
            Poll::Ready(None) => {
                this.inner = None;
                Poll::Ready(None)
            }
            other => other,
        }
    }
}

// =============================================================================
// Remote File Handle
// =============================================================================

/// A file living in a session's storage.
///
/// Holds a non-owning reference to its session: stopping or dropping the
/// session is never blocked by outstanding handles, after which content
/// fetches fail with [`Error::SessionClosed`]. Size and content are cached
/// once fetched; call [`refresh`](Self::refresh) for a new handle.
#[derive(Debug, Clone)]
pub struct RemoteFile {
    path: String,
    session: Weak<Session>,
    size: Option<u64>,
    content: OnceCell<Bytes>,
}

impl RemoteFile {
    pub(crate) fn new(path: impl Into<String>, session: &Arc<Session>, size: Option<u64>) -> Self {
        Self {
            path: path.into(),
            session: Arc::downgrade(session),
            size,
            content: OnceCell::new(),
        }
    }

    pub(crate) fn with_content(path: impl Into<String>, session: &Arc<Session>, content: Bytes) -> Self {
        let size = Some(content.len() as u64);
        Self {
            path: path.into(),
            session: Arc::downgrade(session),
            size,
            content: OnceCell::new_with(Some(content)),
        }
    }

    /// Path relative to the session's working directory.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Final path component.
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }

    /// Cached size, without a round trip.
    pub fn cached_size(&self) -> Option<u64> {
        self.size
            .or_else(|| self.content.get().map(|c| c.len() as u64))
    }

    /// Size in bytes, fetching the content if no size is known.
    pub async fn size(&self) -> Result<u64> {
        match self.cached_size() {
            Some(size) => Ok(size),
            None => Ok(self.content().await?.len() as u64),
        }
    }

    /// Whole content, fetched once and cached.
    pub async fn content(&self) -> Result<Bytes> {
        let content = self
            .content
            .get_or_try_init(|| async {
                let session = self.session()?;
                collect_bytes(session.download(&self.path).await?).await
            })
            .await?;
        Ok(content.clone())
    }

    /// Content as a chunk stream, bypassing the cache.
    pub async fn stream(&self) -> Result<ByteStream> {
        if let Some(content) = self.content.get() {
            let content = content.clone();
            return Ok(stream::once(async move { Ok(content) }).boxed());
        }
        self.session()?.download(&self.path).await
    }

    /// Stream the content into a local file.
    pub async fn save(&self, local_path: impl AsRef<Path>) -> Result<u64> {
        let local_path = local_path.as_ref();
        let mut stream = self.stream().await?;
        let mut file = tokio::fs::File::create(local_path).await?;
        let mut written = 0u64;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk?;
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
        }
        file.flush().await?;
        tracing::debug!(path = %self.path, local = %local_path.display(), bytes = written, "Saved remote file");
        Ok(written)
    }

    /// A fresh handle to the same path with nothing cached.
    pub fn refresh(&self) -> Self {
        Self {
            path: self.path.clone(),
            session: self.session.clone(),
            size: None,
            content: OnceCell::new(),
        }
    }

    fn session(&self) -> Result<Arc<Session>> {
        self.session.upgrade().ok_or_else(|| {
            Error::SessionClosed(format!("session owning '{}' has been dropped", self.path))
        })
    }
}

impl fmt::Display for RemoteFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.cached_size() {
            Some(size) => write!(f, "{} ({} bytes)", self.path, size),
            None => f.write_str(&self.path),
        }
    }
}
