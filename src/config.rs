//! Configuration management module.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Configuration load result.
#[derive(Debug)]
pub enum ConfigLoadResult {
    /// Config loaded successfully.
    Loaded(AppConfig),
    /// Config file missing (first run).
    Missing,
    /// Config file exists but invalid.
    Invalid(ConfigError),
}

/// Configuration errors.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Validation failed: {0}")]
    Validation(String),
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub delivery: DeliveryConfig,
    pub conversion: ConversionConfig,
    pub logging: LoggingConfig,
}

/// Device-facing TCP listener settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_address: String,
    pub port: u16,
    /// Runtime worker threads (0 = one per core).
    pub worker_threads: usize,
    /// Time allowed for connections to wind down on shutdown.
    pub shutdown_timeout_secs: u64,
}

/// Content delivery pacing and backpressure.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// Delay between bulk frames when realtime pacing is requested.
    pub realtime_pacing_ms: u64,
    /// Outbound backlog (bytes) above which a connection counts as not writable.
    pub write_high_water_mark: usize,
    /// Sleep between writability polls while streaming.
    pub backpressure_poll_ms: u64,
    /// Polls before a streaming transfer proceeds regardless.
    pub backpressure_max_spins: u32,
    /// Longest a single frame write may block before the connection is dropped.
    pub write_timeout_secs: u64,
    /// Content name used when the caller provides none.
    pub default_content_name: String,
}

/// Admission gate in front of audio conversion.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConversionConfig {
    pub max_concurrent: usize,
    pub acquire_timeout_secs: u64,
}

/// Log output settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Directory for daily rolling log files; console only when unset.
    pub directory: Option<PathBuf>,
    pub file_prefix: String,
}

impl AppConfig {
    /// Get config file path in the platform config directory.
    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("com", "nptechon", "smartamp")
            .map(|dirs| dirs.config_dir().join("config.toml"))
            .unwrap_or_else(|| PathBuf::from("config.toml"))
    }

    /// Attempt to load config with detailed result.
    pub fn try_load(path: &Path) -> ConfigLoadResult {
        if !path.exists() {
            return ConfigLoadResult::Missing;
        }

        match std::fs::read_to_string(path) {
            Ok(content) => match toml::from_str::<AppConfig>(&content) {
                Ok(config) => match config.validate() {
                    Ok(()) => ConfigLoadResult::Loaded(config),
                    Err(e) => ConfigLoadResult::Invalid(e),
                },
                Err(e) => ConfigLoadResult::Invalid(ConfigError::Parse(e)),
            },
            Err(e) => ConfigLoadResult::Invalid(ConfigError::Read(e)),
        }
    }

    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.bind_address.trim().is_empty() {
            return Err(ConfigError::Validation("Bind address cannot be empty".to_string()));
        }
        if self.server.port == 0 {
            return Err(ConfigError::Validation("Server port must be greater than 0".to_string()));
        }
        if self.delivery.write_high_water_mark == 0 {
            return Err(ConfigError::Validation(
                "Write high-water mark must be greater than 0".to_string(),
            ));
        }
        if self.delivery.backpressure_max_spins > 10_000 {
            return Err(ConfigError::Validation(
                "Backpressure spins cannot exceed 10000".to_string(),
            ));
        }
        if self.delivery.write_timeout_secs == 0 {
            return Err(ConfigError::Validation(
                "Write timeout must be greater than 0".to_string(),
            ));
        }
        if self.conversion.max_concurrent == 0 {
            return Err(ConfigError::Validation(
                "Conversion concurrency must be at least 1".to_string(),
            ));
        }
        Ok(())
    }

    /// Save configuration to file.
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}

impl ServerConfig {
    /// Socket address string for the listener.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.bind_address, self.port)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl DeliveryConfig {
    /// Inter-frame delay for bulk delivery.
    pub fn pacing(&self, realtime: bool) -> Duration {
        if realtime {
            Duration::from_millis(self.realtime_pacing_ms)
        } else {
            Duration::ZERO
        }
    }

    pub fn backpressure_poll(&self) -> Duration {
        Duration::from_millis(self.backpressure_poll_ms)
    }

    pub fn write_timeout(&self) -> Duration {
        Duration::from_secs(self.write_timeout_secs)
    }
}

impl ConversionConfig {
    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 9000,
            worker_threads: 0,
            shutdown_timeout_secs: 5,
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            realtime_pacing_ms: 2,
            write_high_water_mark: 64 * 1024,
            backpressure_poll_ms: 2,
            backpressure_max_spins: 50,
            write_timeout_secs: 30,
            default_content_name: "audio.mp3".to_string(),
        }
    }
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 1,
            acquire_timeout_secs: 10,
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            directory: None,
            file_prefix: "smartamp.log".to_string(),
        }
    }
}
