use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use engine_logging::LogDestination;
use log::LevelFilter;
use serde::Deserialize;
use thiserror::Error;

/// Names the RON configuration file.
pub const CONFIG_ENV: &str = "PDFBATCH_CONFIG";
/// Overrides `temp_root` from the configuration file.
pub const TEMP_ENV: &str = "PDFBATCH_TEMP";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path:?}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("invalid config: {0}")]
    Parse(#[from] ron::error::SpannedError),
    #[error("invalid bind address {0:?}")]
    BindAddress(String),
    #[error("invalid log level {0:?}")]
    LogLevel(String),
}

/// Server settings. Every field is optional in the file.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind: String,
    pub temp_root: PathBuf,
    pub worker_count: usize,
    pub sub_batch_size: usize,
    pub session_batch_size: usize,
    pub progress_interval_ms: u64,
    pub cleanup_max_age_secs: u64,
    pub log_destination: LogDestination,
    pub log_file: PathBuf,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: "127.0.0.1:5000".to_string(),
            temp_root: PathBuf::from("./tmp"),
            worker_count: 5,
            sub_batch_size: 20,
            session_batch_size: 100,
            progress_interval_ms: 300,
            cleanup_max_age_secs: 3600,
            log_destination: LogDestination::Terminal,
            log_file: PathBuf::from("./pdfbatch.log"),
            log_level: "info".to_string(),
        }
    }
}

impl ServerConfig {
    /// Reads the file named by `PDFBATCH_CONFIG` (defaults when unset) and
    /// applies `PDFBATCH_TEMP`.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = match std::env::var_os(CONFIG_ENV) {
            Some(path) => Self::from_file(Path::new(&path))?,
            None => Self::default(),
        };
        if let Some(temp_root) = std::env::var_os(TEMP_ENV) {
            config.temp_root = PathBuf::from(temp_root);
        }
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_ron(&content)
    }

    pub fn from_ron(content: &str) -> Result<Self, ConfigError> {
        Ok(ron::from_str(content)?)
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.bind
            .parse()
            .map_err(|_| ConfigError::BindAddress(self.bind.clone()))
    }

    pub fn level_filter(&self) -> Result<LevelFilter, ConfigError> {
        self.log_level
            .parse()
            .map_err(|_| ConfigError::LogLevel(self.log_level.clone()))
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms.max(1))
    }

    pub fn cleanup_max_age(&self) -> Duration {
        Duration::from_secs(self.cleanup_max_age_secs)
    }
}
