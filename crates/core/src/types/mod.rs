//! Core type definitions for CodeBox.
//!
//! Execution output (chunks and results) and session lifecycle types shared
//! by every backend.

pub mod chunk;
pub mod session;

pub use chunk::*;
pub use session::*;
