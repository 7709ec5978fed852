//! Incremental decoder for raw execution output.
//!
//! Kernels emit a byte stream of tagged frames:
//!
//! ```text
//! <txt>hello\n</txt><img>iVBORw0...</img><err>Traceback ...</err><end/>
//! ```
//!
//! Bytes outside any frame are text. `<end/>` outside a frame terminates one
//! execution on a persistent channel. Text is emitted as soon as a complete
//! UTF-8 prefix is available; images and errors are emitted when their frame
//! closes. Chunks are never reordered.
//!
//! Producers that cannot guarantee their payloads are free of protocol tags
//! escape `&`, `<` and `>` as `&amp;`, `&lt;` and `&gt;`; decode their output
//! with [`ChunkDecoder::escaped`].

use std::collections::VecDeque;

use bytes::Bytes;
use codebox_core::{ChunkKind, ExecChunk, Result};
use futures::stream::{self, BoxStream, StreamExt};

/// Raw output bytes as produced by a substrate.
pub type RawStream = BoxStream<'static, Result<Bytes>>;

/// Decoded chunks, lazily produced, finite and not restartable.
pub type ChunkStream = BoxStream<'static, Result<ExecChunk>>;

const END_MARKER: &[u8] = b"<end/>";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Framing {
    Tagged,
    Plain(ChunkKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Position {
    Outside,
    Inside(ChunkKind),
}

/// Stateful decoder. Feed it bytes as they arrive, then call [`finish`].
///
/// [`finish`]: ChunkDecoder::finish
#[derive(Debug)]
pub struct ChunkDecoder {
    framing: Framing,
    /// Frame payloads are entity-escaped.
    escaped: bool,
    position: Position,
    buf: Vec<u8>,
    /// Payload of an open `img`/`err` frame.
    pending: Vec<u8>,
    finished: bool,
}

impl ChunkDecoder {
    /// Decoder for the tagged protocol.
    pub fn tagged() -> Self {
        Self::with_framing(Framing::Tagged)
    }

    /// Decoder for the tagged protocol whose payloads are entity-escaped.
    pub fn escaped() -> Self {
        Self {
            escaped: true,
            ..Self::tagged()
        }
    }

    /// Decoder that classifies every byte as `kind` (shell stdout/stderr).
    pub fn plain(kind: ChunkKind) -> Self {
        Self::with_framing(Framing::Plain(kind))
    }

    fn with_framing(framing: Framing) -> Self {
        Self {
            framing,
            escaped: false,
            position: Position::Outside,
            buf: Vec::new(),
            pending: Vec::new(),
            finished: false,
        }
    }

    /// True once the `<end/>` marker has been seen.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Consume newly arrived bytes and return every chunk they complete.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<ExecChunk> {
        let mut out = Vec::new();
        if self.finished {
            return out;
        }
        self.buf.extend_from_slice(bytes);
        match self.framing {
            Framing::Plain(kind) => {
                let n = utf8_prefix_len(&self.buf);
                if n > 0 {
                    let text: Vec<u8> = self.buf.drain(..n).collect();
                    out.push(ExecChunk::new(kind, String::from_utf8_lossy(&text)));
                }
            }
            Framing::Tagged => self.decode_tagged(&mut out),
        }
        out
    }

    /// Flush at end of stream. Anything left over is malformed and becomes a
    /// single terminal error chunk.
    pub fn finish(&mut self) -> Option<ExecChunk> {
        if self.finished {
            return None;
        }
        self.finished = true;
        let leftover = std::mem::take(&mut self.buf);
        match self.position {
            Position::Inside(kind) => {
                let size = self.pending.len() + leftover.len();
                self.pending.clear();
                tracing::warn!(frame = %kind, bytes = size, "Output ended inside an open frame");
                Some(ExecChunk::error(format!(
                    "output stream ended inside an unterminated <{}> frame ({} bytes discarded)",
                    kind.tag(),
                    size
                )))
            }
            Position::Outside if !leftover.is_empty() => {
                tracing::warn!(bytes = leftover.len(), "Output ended with a partial payload");
                Some(ExecChunk::error(format!(
                    "output stream ended with a partial payload: {:?}",
                    String::from_utf8_lossy(&leftover)
                )))
            }
            Position::Outside => None,
        }
    }

    fn decode_tagged(&mut self, out: &mut Vec<ExecChunk>) {
        loop {
            match self.position {
                Position::Outside => {
                    if !self.decode_outside(out) {
                        return;
                    }
                }
                Position::Inside(kind) => {
                    if !self.decode_inside(kind, out) {
                        return;
                    }
                }
            }
            if self.finished {
                return;
            }
        }
    }

    /// Returns false when more input is needed.
    fn decode_outside(&mut self, out: &mut Vec<ExecChunk>) -> bool {
        if self.buf.is_empty() {
            return false;
        }
        if self.buf[0] != b'<' {
            let end = self
                .buf
                .iter()
                .position(|&b| b == b'<')
                .unwrap_or(self.buf.len());
            let n = utf8_prefix_len(&self.buf[..end]);
            if n == 0 {
                return false;
            }
            push_text(out, self.buf.drain(..n).collect());
            return true;
        }

        if self.buf.starts_with(END_MARKER) {
            self.buf.drain(..END_MARKER.len());
            self.finished = true;
            return false;
        }
        for kind in [ChunkKind::Text, ChunkKind::Image, ChunkKind::Error] {
            let open = open_tag(kind);
            if self.buf.starts_with(open.as_bytes()) {
                self.buf.drain(..open.len());
                self.position = Position::Inside(kind);
                return true;
            }
        }
        if could_be_tag_prefix(&self.buf) {
            return false;
        }
        // A literal '<' that opens no frame.
        let end = self.buf[1..]
            .iter()
            .position(|&b| b == b'<')
            .map_or(self.buf.len(), |p| p + 1);
        let n = utf8_prefix_len(&self.buf[..end]).max(1);
        push_text(out, self.buf.drain(..n).collect());
        true
    }

    /// Returns false when more input is needed.
    fn decode_inside(&mut self, kind: ChunkKind, out: &mut Vec<ExecChunk>) -> bool {
        let close = close_tag(kind);
        if let Some(p) = find(&self.buf, close.as_bytes()) {
            let payload: Vec<u8> = self.buf.drain(..p).collect();
            self.buf.drain(..close.len());
            self.position = Position::Outside;
            match kind {
                ChunkKind::Text => push_text(out, self.payload(payload)),
                _ => {
                    self.pending.extend_from_slice(&payload);
                    let pending = std::mem::take(&mut self.pending);
                    let content = String::from_utf8_lossy(&self.payload(pending)).into_owned();
                    out.push(ExecChunk::new(kind, content));
                }
            }
            return true;
        }

        // Keep back anything that might be the start of the closing tag.
        let held = partial_suffix_len(&self.buf, close.as_bytes());
        let safe = self.buf.len() - held;
        match kind {
            ChunkKind::Text => {
                let mut end = safe;
                if self.escaped {
                    end -= incomplete_entity_len(&self.buf[..safe]);
                }
                let n = utf8_prefix_len(&self.buf[..end]);
                if n > 0 {
                    let text: Vec<u8> = self.buf.drain(..n).collect();
                    push_text(out, self.payload(text));
                }
            }
            _ => {
                self.pending.extend(self.buf.drain(..safe));
            }
        }
        false
    }

    fn payload(&self, bytes: Vec<u8>) -> Vec<u8> {
        if self.escaped {
            unescape(bytes)
        } else {
            bytes
        }
    }
}

/// Decode a raw byte stream lazily.
pub fn decode_stream(raw: RawStream, decoder: ChunkDecoder) -> ChunkStream {
    struct State {
        raw: RawStream,
        decoder: ChunkDecoder,
        ready: VecDeque<ExecChunk>,
        done: bool,
    }

    let state = State {
        raw,
        decoder,
        ready: VecDeque::new(),
        done: false,
    };

    stream::unfold(state, |mut st| async move {
        loop {
            if let Some(chunk) = st.ready.pop_front() {
                return Some((Ok(chunk), st));
            }
            if st.done {
                return None;
            }
            if st.decoder.is_finished() {
                st.done = true;
                continue;
            }
            match st.raw.next().await {
                Some(Ok(bytes)) => st.ready.extend(st.decoder.feed(&bytes)),
                Some(Err(e)) => {
                    st.done = true;
                    return Some((Err(e), st));
                }
                None => {
                    st.done = true;
                    st.ready.extend(st.decoder.finish());
                }
            }
        }
    })
    .boxed()
}

fn open_tag(kind: ChunkKind) -> String {
    format!("<{}>", kind.tag())
}

fn close_tag(kind: ChunkKind) -> String {
    format!("</{}>", kind.tag())
}

fn push_text(out: &mut Vec<ExecChunk>, bytes: Vec<u8>) {
    if !bytes.is_empty() {
        out.push(ExecChunk::text(String::from_utf8_lossy(&bytes)));
    }
}

const ENTITIES: [(&[u8], u8); 3] = [(b"&lt;", b'<'), (b"&gt;", b'>'), (b"&amp;", b'&')];

fn unescape(bytes: Vec<u8>) -> Vec<u8> {
    if !bytes.contains(&b'&') {
        return bytes;
    }
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        let entity = ENTITIES
            .iter()
            .find(|(entity, _)| bytes[i..].starts_with(entity));
        match entity {
            Some((entity, ch)) => {
                out.push(*ch);
                i += entity.len();
            }
            None => {
                out.push(bytes[i]);
                i += 1;
            }
        }
    }
    out
}

/// Length of a trailing `&...` that may still grow into an entity.
fn incomplete_entity_len(buf: &[u8]) -> usize {
    let longest = ENTITIES.iter().map(|(e, _)| e.len()).max().unwrap_or(0);
    match buf.iter().rposition(|&b| b == b'&') {
        Some(pos) if buf.len() - pos < longest && !buf[pos..].contains(&b';') => buf.len() - pos,
        _ => 0,
    }
}

fn could_be_tag_prefix(buf: &[u8]) -> bool {
    let candidates = [b"<txt>".as_slice(), b"<img>", b"<err>", END_MARKER];
    candidates
        .iter()
        .any(|tag| buf.len() < tag.len() && tag.starts_with(buf))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Length of the longest suffix of `buf` that is a proper prefix of `tag`.
fn partial_suffix_len(buf: &[u8], tag: &[u8]) -> usize {
    (1..tag.len().min(buf.len() + 1))
        .rev()
        .find(|&n| buf.ends_with(&tag[..n]))
        .unwrap_or(0)
}

/// Length of the prefix that can be decoded now. An incomplete multi-byte
/// sequence at the end is held back; invalid bytes elsewhere are passed on
/// and replaced during lossy decoding.
fn utf8_prefix_len(bytes: &[u8]) -> usize {
    match std::str::from_utf8(bytes) {
        Ok(_) => bytes.len(),
        Err(e) if e.error_len().is_none() => e.valid_up_to(),
        Err(_) => bytes.len(),
    }
}
