//! Application configuration for Archivist.
//!
//! User config lives at `~/.archivist/archivist.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{ArchivistError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "archivist.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".archivist";

// ---------------------------------------------------------------------------
// Config structs (matching archivist.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults (directories, database).
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Internet Archive client settings.
    #[serde(default)]
    pub archive: ArchiveConfig,

    /// Relevance judge (LLM) settings.
    #[serde(default)]
    pub judge: JudgeConfig,

    /// Per-stage retry policy.
    #[serde(default)]
    pub retry: RetryConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Root directory for stage snapshots.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: String,

    /// Directory downloaded files are written into.
    #[serde(default = "default_download_dir")]
    pub download_dir: String,

    /// Path to the run-history database.
    #[serde(default = "default_database_path")]
    pub database_path: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            download_dir: default_download_dir(),
            database_path: default_database_path(),
        }
    }
}

fn default_cache_dir() -> String {
    "~/.archivist/cache".into()
}
fn default_download_dir() -> String {
    "~/.archivist/downloads".into()
}
fn default_database_path() -> String {
    "~/.archivist/archivist.db".into()
}

/// `[archive]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArchiveConfig {
    /// Base URL of the archive API.
    #[serde(default = "default_archive_url")]
    pub base_url: String,

    /// Maximum number of candidates kept from a search (`k`).
    #[serde(default = "default_max_results")]
    pub max_results: usize,

    /// Text appended to every search query (e.g. `mediatype:texts`).
    #[serde(default)]
    pub query_suffix: String,

    /// HTTP timeout in seconds.
    #[serde(default = "default_archive_timeout")]
    pub timeout_secs: u64,
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            base_url: default_archive_url(),
            max_results: default_max_results(),
            query_suffix: String::new(),
            timeout_secs: default_archive_timeout(),
        }
    }
}

fn default_archive_url() -> String {
    "https://archive.org".into()
}
fn default_max_results() -> usize {
    100
}
fn default_archive_timeout() -> u64 {
    30
}

/// Which chat API the judge speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JudgeProviderKind {
    Ollama,
    OpenAi,
}

/// `[judge]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JudgeConfig {
    /// Chat API flavour.
    #[serde(default = "default_provider")]
    pub provider: JudgeProviderKind,

    /// Base URL of the chat API.
    #[serde(default = "default_judge_url")]
    pub base_url: String,

    /// Model identifier.
    #[serde(default = "default_model")]
    pub model: String,

    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// HTTP timeout in seconds.
    #[serde(default = "default_judge_timeout")]
    pub timeout_secs: u64,
}

impl Default for JudgeConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            base_url: default_judge_url(),
            model: default_model(),
            api_key_env: default_api_key_env(),
            timeout_secs: default_judge_timeout(),
        }
    }
}

fn default_provider() -> JudgeProviderKind {
    JudgeProviderKind::Ollama
}
fn default_judge_url() -> String {
    "http://localhost:11434".into()
}
fn default_model() -> String {
    "llama3.2:3b".into()
}
fn default_api_key_env() -> String {
    "OPENAI_API_KEY".into()
}
fn default_judge_timeout() -> u64 {
    120
}

/// `[retry]` section, applied to every stage node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Total attempts per stage (1 = no retry).
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Pause between attempts in milliseconds.
    #[serde(default)]
    pub backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: 0,
        }
    }
}

fn default_max_attempts() -> u32 {
    1
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.archivist/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| ArchivistError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.archivist/archivist.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| ArchivistError::io(path, e))?;

    toml::from_str(&content).map_err(|e| {
        ArchivistError::config(format!("failed to parse {}: {e}", path.display()))
    })
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| ArchivistError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| ArchivistError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| ArchivistError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Expand a leading `~` to the user's home directory.
pub fn expand_home(path: &str) -> Result<PathBuf> {
    match path.strip_prefix('~') {
        Some(rest) => {
            let home = dirs::home_dir()
                .ok_or_else(|| ArchivistError::config("could not determine home directory"))?;
            Ok(home.join(rest.trim_start_matches(['/', '\\'])))
        }
        None => Ok(PathBuf::from(path)),
    }
}

/// Check that the judge API key env var is set when the provider needs one.
pub fn validate_api_key(config: &AppConfig) -> Result<()> {
    if config.judge.provider != JudgeProviderKind::OpenAi {
        return Ok(());
    }
    let var_name = &config.judge.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(()),
        _ => Err(ArchivistError::config(format!(
            "judge API key not found. Set the {var_name} environment variable."
        ))),
    }
}
