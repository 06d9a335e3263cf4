//! Application configuration for boxoffice.
//!
//! User config lives at `~/.boxoffice/boxoffice.toml`.
//! CLI flags override config file values, which override defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{BoxOfficeError, Result};
use crate::types::TableName;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "boxoffice.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".boxoffice";

// ---------------------------------------------------------------------------
// Config structs (matching boxoffice.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Store location and connection policy.
    #[serde(default)]
    pub database: DatabaseConfig,

    /// Incremental loader tables.
    #[serde(default)]
    pub loader: LoaderConfig,

    /// Enrichment scheduling.
    #[serde(default)]
    pub enrichment: EnrichmentConfig,

    /// Metadata API settings.
    #[serde(default)]
    pub omdb: OmdbConfig,
}

/// `[database]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the libSQL database file.
    #[serde(default = "default_db_path")]
    pub path: String,

    /// Connection attempts before the store is reported unavailable.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Base delay between connection attempts, doubled after each failure.
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
        }
    }
}

fn default_db_path() -> String {
    "var/boxoffice.db".into()
}
fn default_max_retries() -> u32 {
    3
}
fn default_retry_delay_ms() -> u64 {
    1000
}

/// `[loader]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderConfig {
    /// Daily revenue feed table.
    #[serde(default = "default_source_table")]
    pub source_table: String,

    /// Raw table the feed is appended into.
    #[serde(default = "default_target_table")]
    pub target_table: String,
}

impl Default for LoaderConfig {
    fn default() -> Self {
        Self {
            source_table: default_source_table(),
            target_table: default_target_table(),
        }
    }
}

fn default_source_table() -> String {
    "revenues_per_day".into()
}
fn default_target_table() -> String {
    "raw_revenues_per_day".into()
}

/// `[enrichment]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnrichmentConfig {
    /// Maximum concurrent in-flight metadata requests.
    #[serde(default = "default_concurrency")]
    pub concurrency: u32,

    /// Days after which a fetched or failed entity becomes eligible again.
    #[serde(default = "default_stale_after_days")]
    pub stale_after_days: u32,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            stale_after_days: default_stale_after_days(),
        }
    }
}

fn default_concurrency() -> u32 {
    10
}
fn default_stale_after_days() -> u32 {
    7
}

/// `[omdb]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OmdbConfig {
    /// Name of the env var holding the API key (never store the key itself).
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,

    /// API endpoint.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Per-request timeout.
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
}

impl Default for OmdbConfig {
    fn default() -> Self {
        Self {
            api_key_env: default_api_key_env(),
            base_url: default_base_url(),
            timeout_secs: default_timeout_secs(),
        }
    }
}

fn default_api_key_env() -> String {
    "OMDB_API_KEY".into()
}
fn default_base_url() -> String {
    "http://www.omdbapi.com/".into()
}
fn default_timeout_secs() -> u64 {
    10
}

// ---------------------------------------------------------------------------
// Runtime configs (merged from config file + CLI flags)
// ---------------------------------------------------------------------------

/// Runtime store configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Database file path.
    pub path: PathBuf,
    /// Connection attempts before giving up.
    pub max_retries: u32,
    /// Base backoff delay.
    pub retry_delay: Duration,
}

impl StoreConfig {
    /// Store config for `path` with default retry policy.
    pub fn at(path: impl Into<PathBuf>) -> Self {
        let defaults = DatabaseConfig::default();
        Self {
            path: path.into(),
            max_retries: defaults.max_retries,
            retry_delay: Duration::from_millis(defaults.retry_delay_ms),
        }
    }
}

impl From<&AppConfig> for StoreConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            path: PathBuf::from(&config.database.path),
            max_retries: config.database.max_retries,
            retry_delay: Duration::from_millis(config.database.retry_delay_ms),
        }
    }
}

/// Runtime loader configuration with validated table names.
#[derive(Debug, Clone)]
pub struct LoadConfig {
    pub source_table: TableName,
    pub target_table: TableName,
}

impl TryFrom<&AppConfig> for LoadConfig {
    type Error = BoxOfficeError;

    fn try_from(config: &AppConfig) -> Result<Self> {
        Ok(Self {
            source_table: config.loader.source_table.parse()?,
            target_table: config.loader.target_table.parse()?,
        })
    }
}

/// Runtime enrichment configuration.
#[derive(Debug, Clone)]
pub struct EnrichConfig {
    /// Hard ceiling on concurrently in-flight metadata requests.
    pub concurrency: usize,
    /// Staleness window for the backlog selector.
    pub stale_after_days: u32,
}

impl Default for EnrichConfig {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for EnrichConfig {
    fn from(config: &AppConfig) -> Self {
        Self {
            concurrency: config.enrichment.concurrency.max(1) as usize,
            stale_after_days: config.enrichment.stale_after_days,
        }
    }
}

/// Runtime metadata client configuration.
#[derive(Debug, Clone)]
pub struct MetadataConfig {
    /// Resolved API key.
    pub api_key: String,
    /// API endpoint.
    pub base_url: Url,
    /// Per-request timeout.
    pub timeout: Duration,
}

impl MetadataConfig {
    /// Build from the app config, resolving the API key from the environment.
    pub fn from_app(config: &AppConfig) -> Result<Self> {
        let api_key = resolve_api_key(config)?;
        let base_url = Url::parse(&config.omdb.base_url).map_err(|e| {
            BoxOfficeError::config(format!("invalid omdb.base_url '{}': {e}", config.omdb.base_url))
        })?;
        Ok(Self {
            api_key,
            base_url,
            timeout: Duration::from_secs(config.omdb.timeout_secs),
        })
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.boxoffice/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| BoxOfficeError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.boxoffice/boxoffice.toml`).
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
    let content = std::fs::read_to_string(path).map_err(|e| BoxOfficeError::io(path, e))?;

    toml::from_str(&content).map_err(|e| {
        BoxOfficeError::config(format!("failed to parse {}: {e}", path.display()))
    })
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| BoxOfficeError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| BoxOfficeError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| BoxOfficeError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Read the metadata API key from the env var named in the config.
pub fn resolve_api_key(config: &AppConfig) -> Result<String> {
    let var_name = &config.omdb.api_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(val),
        _ => Err(BoxOfficeError::config(format!(
            "metadata API key not found. Set the {var_name} environment variable."
        ))),
    }
}
