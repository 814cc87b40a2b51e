use std::env;
use std::fs;
use std::num::NonZeroUsize;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

use crate::core::store::JournalConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub max_queued_messages: NonZeroUsize,
    pub journal_path: String,
    pub fsync_every_n: Option<usize>,
    pub fsync_interval_ms: Option<u64>,
    pub log_level: String,
}

#[derive(Debug, Deserialize, Clone, Default)]
struct FileConfig {
    pub max_queued_messages: Option<usize>,
    pub journal_path: Option<String>,
    pub fsync_every_n: Option<usize>,
    pub fsync_interval_ms: Option<u64>,
    pub log_level: Option<String>,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("config parse error: {0}")]
    Parse(String),
}

impl Config {
    fn load_file<P: AsRef<Path>>(path: P) -> Result<FileConfig, ConfigError> {
        let path_ref = path.as_ref();
        let raw = fs::read_to_string(path_ref)?;
        let ext = path_ref
            .extension()
            .and_then(|s| s.to_str())
            .unwrap_or("toml")
            .to_ascii_lowercase();

        if ext == "yaml" || ext == "yml" {
            let cfg: FileConfig = serde_yaml::from_str(&raw)?;
            Ok(cfg)
        } else {
            let cfg: FileConfig = toml::from_str(&raw)?;
            Ok(cfg)
        }
    }

    /// Load configuration from an optional file path and environment variables.
    ///
    /// Precedence: file values provide defaults, environment variables override.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        Self::from_sources(path, |name| env::var(name).ok())
    }

    /// Like [`Config::load`], reading variables through `lookup` instead of the
    /// process environment.
    pub fn from_sources<F>(path: Option<&str>, lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let effective_path = path.map(|s| s.to_string()).or(lookup("SESSIONQ_CONFIG"));

        let file_cfg = if let Some(p) = effective_path {
            Self::load_file(p)?
        } else {
            FileConfig::default()
        };

        // File defaults.
        let mut max_queued_messages = file_cfg.max_queued_messages.unwrap_or(1000);
        let mut journal_path = file_cfg
            .journal_path
            .unwrap_or_else(|| "sessionq.journal".to_string());
        let mut fsync_every_n = file_cfg.fsync_every_n.or(Some(64));
        let mut fsync_interval_ms = file_cfg.fsync_interval_ms;
        let mut log_level = file_cfg.log_level.unwrap_or_else(|| "info".to_string());

        // Env overrides.
        if let Some(v) = lookup("SESSIONQ_MAX_QUEUED_MESSAGES") {
            max_queued_messages = v
                .parse()
                .map_err(|e| ConfigError::Parse(format!("SESSIONQ_MAX_QUEUED_MESSAGES: {e}")))?;
        }

        if let Some(v) = lookup("SESSIONQ_JOURNAL_PATH") {
            journal_path = v;
        }

        if let Some(v) = lookup("SESSIONQ_FSYNC_EVERY_N") {
            let n: usize = v
                .parse()
                .map_err(|e| ConfigError::Parse(format!("SESSIONQ_FSYNC_EVERY_N: {e}")))?;
            fsync_every_n = (n > 0).then_some(n);
        }

        if let Some(v) = lookup("SESSIONQ_FSYNC_INTERVAL_MS") {
            fsync_interval_ms = Some(
                v.parse()
                    .map_err(|e| ConfigError::Parse(format!("SESSIONQ_FSYNC_INTERVAL_MS: {e}")))?,
            );
        }

        if let Some(v) = lookup("SESSIONQ_LOG_LEVEL") {
            log_level = v;
        }

        let max_queued_messages = NonZeroUsize::new(max_queued_messages).ok_or_else(|| {
            ConfigError::Parse("max_queued_messages must be greater than 0".to_string())
        })?;

        Ok(Config {
            max_queued_messages,
            journal_path,
            fsync_every_n: fsync_every_n.filter(|n| *n > 0),
            fsync_interval_ms,
            log_level,
        })
    }

    pub fn journal_config(&self) -> JournalConfig {
        JournalConfig {
            fsync_every_n: self.fsync_every_n,
            fsync_interval: self.fsync_interval_ms.map(Duration::from_millis),
        }
    }
}
