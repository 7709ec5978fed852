use base64::Engine;
use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// Execution Output Types
// =============================================================================

/// Kind of an output chunk. Serialized with the short wire tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChunkKind {
    /// Printed text or the value of a trailing expression.
    #[serde(rename = "txt")]
    Text,
    /// A rendered image, base64 encoded PNG.
    #[serde(rename = "img")]
    Image,
    /// A raised exception or anything written to stderr.
    #[serde(rename = "err")]
    Error,
}

impl ChunkKind {
    /// Wire tag used by the tagged chunk protocol.
    pub fn tag(self) -> &'static str {
        match self {
            Self::Text => "txt",
            Self::Image => "img",
            Self::Error => "err",
        }
    }

    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "txt" => Some(Self::Text),
            "img" => Some(Self::Image),
            "err" => Some(Self::Error),
            _ => None,
        }
    }
}

impl fmt::Display for ChunkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// One typed unit of execution output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecChunk {
    #[serde(rename = "type")]
    pub kind: ChunkKind,
    pub content: String,
}

impl ExecChunk {
    pub fn new(kind: ChunkKind, content: impl Into<String>) -> Self {
        Self {
            kind,
            content: content.into(),
        }
    }

    pub fn text(content: impl Into<String>) -> Self {
        Self::new(ChunkKind::Text, content)
    }

    pub fn image(content: impl Into<String>) -> Self {
        Self::new(ChunkKind::Image, content)
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self::new(ChunkKind::Error, content)
    }

    pub fn is_error(&self) -> bool {
        self.kind == ChunkKind::Error
    }
}

impl fmt::Display for ExecChunk {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.content)
    }
}

/// Ordered output of one execution.
///
/// `cancelled` marks a result that was cut short by the caller; its chunks
/// are the ones received before cancellation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecResult {
    pub chunks: Vec<ExecChunk>,
    #[serde(default)]
    pub cancelled: bool,
}

impl ExecResult {
    pub fn new(chunks: Vec<ExecChunk>) -> Self {
        Self {
            chunks,
            cancelled: false,
        }
    }

    /// A truncated result of a cancelled execution.
    pub fn truncated(chunks: Vec<ExecChunk>) -> Self {
        Self {
            chunks,
            cancelled: true,
        }
    }

    /// All text chunks concatenated in emission order.
    pub fn text(&self) -> String {
        self.of_kind(ChunkKind::Text).collect()
    }

    /// Base64 payloads of all image chunks in emission order.
    pub fn images(&self) -> Vec<&str> {
        self.of_kind(ChunkKind::Image).collect()
    }

    /// Contents of all error chunks in emission order.
    pub fn errors(&self) -> Vec<&str> {
        self.of_kind(ChunkKind::Error).collect()
    }

    /// True when the executed code raised nothing.
    pub fn is_ok(&self) -> bool {
        !self.chunks.iter().any(ExecChunk::is_error)
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    /// Decoded image bytes.
    pub fn image_bytes(&self) -> Result<Vec<Vec<u8>>, base64::DecodeError> {
        self.of_kind(ChunkKind::Image)
            .map(|b64| base64::engine::general_purpose::STANDARD.decode(b64.trim()))
            .collect()
    }

    fn of_kind(&self, kind: ChunkKind) -> impl Iterator<Item = &str> {
        self.chunks
            .iter()
            .filter(move |c| c.kind == kind)
            .map(|c| c.content.as_str())
    }
}

impl FromIterator<ExecChunk> for ExecResult {
    fn from_iter<I: IntoIterator<Item = ExecChunk>>(iter: I) -> Self {
        Self::new(iter.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_result_is_success() {
        let result = ExecResult::default();
        assert_eq!(result.text(), "");
        assert!(result.images().is_empty());
        assert!(result.errors().is_empty());
        assert!(result.is_ok());
        assert!(!result.cancelled);
    }

    #[test]
    fn test_views_preserve_emission_order() {
        let result: ExecResult = vec![
            ExecChunk::text("a"),
            ExecChunk::image("aW1n"),
            ExecChunk::text("b"),
            ExecChunk::error("boom"),
        ]
        .into_iter()
        .collect();

        assert_eq!(result.text(), "ab");
        assert_eq!(result.images(), vec!["aW1n"]);
        assert_eq!(result.errors(), vec!["boom"]);
        assert!(!result.is_ok());
        assert_eq!(result.image_bytes().unwrap(), vec![b"img".to_vec()]);
    }

    #[test]
    fn test_chunk_wire_format() {
        let chunk = ExecChunk::error("ZeroDivisionError");
        let json = serde_json::to_value(&chunk).unwrap();
        assert_eq!(json["type"], "err");
        assert_eq!(json["content"], "ZeroDivisionError");

        let back: ExecChunk = serde_json::from_str(r#"{"type":"txt","content":"hi"}"#).unwrap();
        assert_eq!(back, ExecChunk::text("hi"));
    }
}
