//! Error types for Archivist.
//!
//! Library crates use [`ArchivistError`] via `thiserror`.
//! The CLI wraps this with `color-eyre` for rich diagnostics.

use std::path::PathBuf;

/// Top-level error type for all Archivist operations.
#[derive(Debug, thiserror::Error)]
pub enum ArchivistError {
    /// Configuration loading or validation error (fatal at construction).
    #[error("config error: {message}")]
    Config { message: String },

    /// Network/HTTP error talking to the archive or the judge.
    #[error("network error: {0}")]
    Network(String),

    /// Malformed response or judge output that could not be decoded.
    #[error("parse error: {message}")]
    Parse { message: String },

    /// Database or storage layer error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Judge (LLM) call failed or is not supported in the requested mode.
    #[error("judge error: {0}")]
    Judge(String),

    /// Filesystem I/O error.
    #[error("I/O error at {path:?}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    /// Data validation error (unknown identifier, unsafe file name, etc.).
    #[error("validation error: {message}")]
    Validation { message: String },

    /// A pipeline stage kept failing after every allowed attempt.
    #[error("{stage} stage failed after {attempts} attempt(s): {message}")]
    Stage {
        stage: String,
        attempts: u32,
        message: String,
    },
}

/// Convenience alias used throughout the codebase.
pub type Result<T> = std::result::Result<T, ArchivistError>;

impl ArchivistError {
    /// Create a config error from any displayable message.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a parse error from any displayable message.
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
        }
    }

    /// Create a validation error from any displayable message.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            message: msg.into(),
        }
    }

    /// Create a stage failure for the named stage.
    pub fn stage(stage: impl ToString, attempts: u32, msg: impl Into<String>) -> Self {
        Self::Stage {
            stage: stage.to_string(),
            attempts,
            message: msg.into(),
        }
    }

    /// Wrap a `std::io::Error` with a path for context.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}
