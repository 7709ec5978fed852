//! Core types, configuration, and error definitions for CodeBox.
//!
//! This crate provides the building blocks shared by the execution engine and
//! the runner binary: the chunk and result model, session lifecycle types,
//! the backend-agnostic error taxonomy, and configuration loading.

pub mod config;
pub mod error;
pub mod telemetry;
pub mod types;

pub use config::CodeBoxConfig;
pub use error::{ApiError, ApiScope, Error, Result};
pub use types::*;
