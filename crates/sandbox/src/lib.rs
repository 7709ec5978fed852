//! Client-side execution session engine for CodeBox.
//!
//! A `CodeBox` runs Python or shell code in an isolated session and streams
//! its output back as typed chunks. The same session API sits on top of
//! three interchangeable backends.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────┐
//! │  CodeBox / blocking::CodeBox (facade)  │
//! │    ↓ execute, files, lifecycle         │
//! ├────────────────────────────────────────┤
//! │  Session (state machine, one slot)     │
//! │    ↓ ExecStream aggregates chunks      │
//! ├────────────────────────────────────────┤
//! │  Backend trait                         │
//! │    Local  │ Docker (bollard) │ Remote  │
//! ├────────────────────────────────────────┤
//! │  Chunk decoder (<txt> <img> <err>)     │
//! └────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use codebox_sandbox::{CodeBox, CodeBoxConfig, KernelMode};
//!
//! let codebox = CodeBox::new(CodeBoxConfig::local())?;
//! let result = codebox.execute("x = 21 * 2\nprint(x)", KernelMode::Python).await?;
//! assert_eq!(result.text(), "42\n");
//!
//! codebox.upload("data.csv", "a,b\n1,2\n").await?;
//! for file in codebox.list_files().await? {
//!     println!("{file}");
//! }
//! codebox.stop().await?;
//! ```

pub mod backend;
pub mod blocking;
mod codebox;
pub mod decoder;
pub mod session;
mod state;
pub mod stream;
pub mod transfer;

pub use backend::{
    Backend, DockerBackend, ExecOptions, LocalBackend, MockBackend, RemoteBackend,
};
pub use codebox::{CodeBox, KeepAlive};
pub use decoder::{ChunkDecoder, ChunkStream};
pub use session::Session;
pub use stream::ExecStream;
pub use transfer::{ByteStream, RemoteFile, UploadSource};

pub use codebox_core::{
    BackendKind, ChunkKind, CodeBoxConfig, Error, ExecChunk, ExecResult, FileInfo, HealthStatus,
    KernelMode, Result, SessionInfo, SessionState,
};
