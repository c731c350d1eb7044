//! Configuration loading and types

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use eyre::{WrapErr, bail};
use serde::{Deserialize, Serialize};
use vminer_core::EngineConfig;
use vminer_session::ConnectionDescriptor;
use vminer_store::Source;

/// Top-level configuration for vminer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Process settings
    #[serde(default)]
    pub daemon: DaemonConfig,
    /// Record store settings
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Sync engine settings
    #[serde(default)]
    pub engine: EngineConfig,
    /// Configured sources
    #[serde(default)]
    pub source: Vec<SourceConfig>,
}

/// Process settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Log output format
    #[serde(default)]
    pub log_format: LogFormat,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

/// Record store settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database file
    #[serde(default = "default_database_path")]
    pub path: PathBuf,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_database_path(),
        }
    }
}

fn default_database_path() -> PathBuf {
    dirs::data_dir()
        .map(|p| p.join("vminer/inventory.db"))
        .unwrap_or_else(|| PathBuf::from("vminer.db"))
}

/// One `[[source]]` entry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    /// Source id
    pub id: String,
    /// Endpoint host name or base URL
    pub endpoint: String,
    /// Login user
    pub username: String,
    /// Inline password
    #[serde(default)]
    pub password: Option<String>,
    /// Environment variable holding the password
    #[serde(default)]
    pub password_env: Option<String>,
    /// Skip TLS certificate verification
    #[serde(default)]
    pub accept_invalid_certs: bool,
    /// Included in `vminer sync` without `--source`
    #[serde(default = "default_active")]
    pub active: bool,
}

fn default_active() -> bool {
    true
}

impl SourceConfig {
    /// Registry entry for this source
    #[must_use]
    pub fn to_source(&self) -> Source {
        let descriptor = ConnectionDescriptor {
            endpoint: self.endpoint.clone(),
            username: self.username.clone(),
            password: self.password.clone(),
            password_env: self.password_env.clone(),
            accept_invalid_certs: self.accept_invalid_certs,
        };

        let source = Source::new(self.id.as_str(), descriptor);
        if self.active { source } else { source.inactive() }
    }
}

impl Config {
    /// Load configuration from file
    ///
    /// # Errors
    /// Returns error if file cannot be read, parsed or validated
    pub fn load(path: &Path) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)
            .wrap_err_with(|| format!("failed to read {}", path.display()))?;
        let config: Config = toml::from_str(&content)
            .wrap_err_with(|| format!("failed to parse {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from default paths or use defaults
    ///
    /// # Errors
    /// Returns error if a found file cannot be loaded
    pub fn load_default() -> eyre::Result<Self> {
        if let Ok(path) = std::env::var("VMINER_CONFIG") {
            return Self::load(&PathBuf::from(path));
        }

        let paths = [
            Some(PathBuf::from("vminer.toml")),
            Some(PathBuf::from("/etc/vminer/vminer.toml")),
            dirs::config_dir().map(|p| p.join("vminer/vminer.toml")),
        ];

        for path in paths.into_iter().flatten() {
            if path.exists() {
                return Self::load(&path);
            }
        }

        tracing::warn!("no config file found, using defaults");
        Ok(Config::default())
    }

    /// Check engine settings and source entries
    ///
    /// # Errors
    /// Returns error describing the first invalid value
    pub fn validate(&self) -> eyre::Result<()> {
        self.engine.validate()?;

        let mut ids = HashSet::new();
        for source in &self.source {
            if source.id.trim().is_empty() {
                bail!("source with endpoint {} has an empty id", source.endpoint);
            }
            if !ids.insert(source.id.as_str()) {
                bail!("duplicate source id: {}", source.id);
            }
            if source.password.is_none() && source.password_env.is_none() {
                bail!("source {} has neither password nor password_env", source.id);
            }
        }

        Ok(())
    }
}
