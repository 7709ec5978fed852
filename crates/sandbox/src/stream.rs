//! Result aggregation over a live chunk stream.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use futures::stream::{AbortRegistration, Abortable, Stream, StreamExt};
use tokio::time::{Instant, Sleep};

use codebox_core::{Error, ExecChunk, ExecResult, Result};

use crate::decoder::ChunkStream;
use crate::state::ExecutionGuard;

/// A running execution.
///
/// Poll it as a [`Stream`] to consume chunks at your own pace, or call
/// [`collect`](Self::collect) to drain it into one [`ExecResult`]. Every chunk
/// handed out is also recorded, so [`result`](Self::result) gives the
/// aggregate once the stream has ended.
///
/// The session stays `EXECUTING` until the stream ends, is cancelled, or is
/// dropped. Dropping a running stream cancels the execution.
pub struct ExecStream {
    inner: Option<Abortable<ChunkStream>>,
    chunks: Vec<ExecChunk>,
    deadline: Option<Pin<Box<Sleep>>>,
    expires_at: Option<Instant>,
    timeout: Option<Duration>,
    cancelled: bool,
    guard: Option<ExecutionGuard>,
}

impl ExecStream {
    pub(crate) fn new(
        inner: ChunkStream,
        registration: AbortRegistration,
        deadline: Option<Instant>,
        guard: ExecutionGuard,
    ) -> Self {
        let timeout = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        Self {
            inner: Some(Abortable::new(inner, registration)),
            chunks: Vec::new(),
            deadline: deadline.map(|d| Box::pin(tokio::time::sleep_until(d))),
            expires_at: deadline,
            timeout,
            cancelled: false,
            guard: Some(guard),
        }
    }

    /// Drain the stream into one result.
    ///
    /// A timeout surfaces as [`Error::Timeout`]; chunks received before it
    /// are discarded.
    pub async fn collect(mut self) -> Result<ExecResult> {
        while let Some(item) = self.next().await {
            item?;
        }
        Ok(self.snapshot())
    }

    /// Stop the execution and return what was received so far, marked as
    /// cancelled. On an already finished stream this is the full result.
    pub fn cancel(mut self) -> ExecResult {
        if !self.is_finished() {
            tracing::debug!(chunks = self.chunks.len(), "Cancelling execution");
            self.cancelled = true;
        }
        self.finish();
        self.snapshot()
    }

    /// The aggregate, available once the stream has ended.
    pub fn result(&self) -> Option<ExecResult> {
        self.is_finished().then(|| self.snapshot())
    }

    /// Chunks received so far.
    pub fn chunks(&self) -> &[ExecChunk] {
        &self.chunks
    }

    pub fn is_finished(&self) -> bool {
        self.inner.is_none()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled
    }

    fn snapshot(&self) -> ExecResult {
        ExecResult {
            chunks: self.chunks.clone(),
            cancelled: self.cancelled,
        }
    }

    /// Release the substrate side and the execution slot.
    fn finish(&mut self) {
        self.inner = None;
        self.deadline = None;
        self.expires_at = None;
        self.guard = None;
    }

    /// Checked on every poll: an inner stream that is always ready would
    /// otherwise never let the timer fire.
    fn expired(&mut self, cx: &mut Context<'_>) -> bool {
        if self.expires_at.is_some_and(|at| Instant::now() >= at) {
            return true;
        }
        match self.deadline.as_mut() {
            Some(sleep) => sleep.as_mut().poll(cx).is_ready(),
            None => false,
        }
    }

    fn time_out(&mut self) -> Poll<Option<Result<ExecChunk>>> {
        let timeout = self.timeout.unwrap_or_default();
        tracing::warn!(?timeout, "Execution timed out");
        self.finish();
        Poll::Ready(Some(Err(Error::timeout(format!(
            "execution did not finish within {:?}",
            timeout
        )))))
    }
}

impl Stream for ExecStream {
    type Item = Result<ExecChunk>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();

        if this.inner.is_none() {
            return Poll::Ready(None);
        }
        if this.expired(cx) {
            return this.time_out();
        }
        let Some(inner) = this.inner.as_mut() else {
            return Poll::Ready(None);
        };

        let next = inner.poll_next_unpin(cx);
        let aborted = inner.is_aborted();
        match next {
            Poll::Ready(Some(Ok(chunk))) => {
                this.chunks.push(chunk.clone());
                Poll::Ready(Some(Ok(chunk)))
            }
            Poll::Ready(Some(Err(e))) => {
                tracing::warn!(error = %e, "Execution stream failed");
                if e.is_fatal() {
                    if let Some(guard) = this.guard.take() {
                        guard.fault();
                    }
                }
                this.finish();
                Poll::Ready(Some(Err(e)))
            }
            Poll::Ready(None) => {
                if aborted {
                    this.cancelled = true;
                }
                this.finish();
                Poll::Ready(None)
            }
            Poll::Pending => Poll::Pending,
        }
    }
}
