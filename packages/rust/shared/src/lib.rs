//! Shared types, error model, and configuration for Archivist.
//!
//! This crate is the foundation depended on by all other Archivist crates.
//! It provides:
//! - The unified error type, [`ArchivistError`]
//! - Domain types ([`PipelineState`], [`StateUpdate`], [`ItemMetadata`], [`ArchiveFile`])
//! - Configuration ([`AppConfig`], config loading)

pub mod config;
pub mod error;
pub mod types;

// Re-export public API at crate root for ergonomic imports.
pub use config::{
    AppConfig, ArchiveConfig, DefaultsConfig, JudgeConfig, JudgeProviderKind, RetryConfig,
    config_dir, config_file_path, expand_home, init_config, load_config, load_config_from,
    validate_api_key,
};
pub use error::{ArchivistError, Result};
pub use types::{ArchiveFile, ItemMetadata, PipelineState, StateUpdate};
