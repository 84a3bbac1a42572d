//! Configuration loading and root folder resolution
//!
//! The TOML file carries the service-wide sections (`root_folder`, `[logging]`,
//! `[catalog]`, `[ceremony]`). Engine tunables (`[admission]`, `[import]`) are
//! kept as raw tables here and deserialized by the ingest crate into its own
//! parameter types.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Environment variable overriding the root folder
pub const ROOT_FOLDER_ENV: &str = "MARQUEE_ROOT";

/// Database file name inside the root folder
pub const DATABASE_FILE: &str = "marquee.db";

/// Logging section of the TOML config
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Default tracing filter when RUST_LOG is unset
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Connection settings for one external source
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SourceConfig {
    /// Base URL of the source API
    #[serde(default)]
    pub base_url: Option<String>,
    /// API key sent with every request
    #[serde(default)]
    pub api_key: Option<String>,
    /// Sustained request rate shared by all workers
    #[serde(default = "default_requests_per_second")]
    pub requests_per_second: u32,
    /// Burst size of the token bucket
    #[serde(default = "default_burst")]
    pub burst: u32,
    /// Local directory with JSON payloads (ceremony files)
    #[serde(default)]
    pub payload_dir: Option<PathBuf>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            api_key: None,
            requests_per_second: default_requests_per_second(),
            burst: default_burst(),
            payload_dir: None,
        }
    }
}

fn default_requests_per_second() -> u32 {
    4
}

fn default_burst() -> u32 {
    1
}

/// Parsed `marquee.toml`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TomlConfig {
    /// Root folder holding the database
    #[serde(default)]
    pub root_folder: Option<PathBuf>,
    #[serde(default)]
    pub logging: LoggingConfig,
    /// Movie/person catalog source
    #[serde(default)]
    pub catalog: SourceConfig,
    /// Award ceremony source
    #[serde(default)]
    pub ceremony: SourceConfig,
    /// Admission thresholds (typed by the ingest crate)
    #[serde(default)]
    pub admission: toml::Table,
    /// Import parameters (typed by the ingest crate)
    #[serde(default)]
    pub import: toml::Table,
}

impl TomlConfig {
    /// Deserialize one of the raw engine sections into a typed struct
    ///
    /// Missing keys fall back to the target type's serde defaults.
    pub fn section<T>(table: &toml::Table) -> Result<T>
    where
        T: serde::de::DeserializeOwned,
    {
        toml::Value::Table(table.clone())
            .try_into()
            .map_err(|e| Error::Config(format!("Invalid config section: {}", e)))
    }
}

/// Default config file location: `<config_dir>/marquee/marquee.toml`
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("marquee").join("marquee.toml"))
}

/// Load the TOML config
///
/// A missing file is not an error: defaults are returned and a warning logged.
/// A file that exists but does not parse is a configuration error.
pub fn load_toml_config(path: Option<&Path>) -> Result<TomlConfig> {
    let path = match path.map(Path::to_path_buf).or_else(default_config_path) {
        Some(p) => p,
        None => {
            warn!("Could not determine config directory, using defaults");
            return Ok(TomlConfig::default());
        }
    };

    if !path.exists() {
        warn!(path = %path.display(), "Config file not found, using defaults");
        return Ok(TomlConfig::default());
    }

    let content = std::fs::read_to_string(&path)?;
    let config: TomlConfig = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Parse {} failed: {}", path.display(), e)))?;

    debug!(path = %path.display(), "Loaded TOML config");
    Ok(config)
}

/// Write the TOML config atomically (temp file + rename)
pub fn write_toml_config(config: &TomlConfig, path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let content = toml::to_string_pretty(config)
        .map_err(|e| Error::Config(format!("Serialize TOML failed: {}", e)))?;

    let tmp_path = path.with_extension("toml.tmp");
    std::fs::write(&tmp_path, content)?;
    std::fs::rename(&tmp_path, path)?;

    Ok(())
}

/// Root folder resolution in priority order:
/// 1. Command-line argument
/// 2. `MARQUEE_ROOT` environment variable
/// 3. `root_folder` from the TOML config
/// 4. OS-dependent default
pub struct RootFolderResolver<'a> {
    cli_arg: Option<&'a Path>,
    toml: Option<&'a TomlConfig>,
}

impl<'a> RootFolderResolver<'a> {
    pub fn new(cli_arg: Option<&'a Path>, toml: Option<&'a TomlConfig>) -> Self {
        Self { cli_arg, toml }
    }

    pub fn resolve(&self) -> PathBuf {
        if let Some(path) = self.cli_arg {
            return path.to_path_buf();
        }

        if let Ok(path) = std::env::var(ROOT_FOLDER_ENV) {
            if !path.trim().is_empty() {
                return PathBuf::from(path);
            }
        }

        if let Some(path) = self.toml.and_then(|t| t.root_folder.clone()) {
            return path;
        }

        default_root_folder()
    }
}

/// OS-dependent default root folder
pub fn default_root_folder() -> PathBuf {
    dirs::data_local_dir()
        .map(|d| d.join("marquee"))
        .unwrap_or_else(|| PathBuf::from("./marquee_data"))
}

/// Creates the root folder and derives paths inside it
pub struct RootFolderInitializer {
    root_folder: PathBuf,
}

impl RootFolderInitializer {
    pub fn new(root_folder: PathBuf) -> Self {
        Self { root_folder }
    }

    pub fn ensure_directory_exists(&self) -> Result<()> {
        std::fs::create_dir_all(&self.root_folder)?;
        Ok(())
    }

    pub fn database_path(&self) -> PathBuf {
        self.root_folder.join(DATABASE_FILE)
    }

    pub fn root_folder(&self) -> &Path {
        &self.root_folder
    }
}
