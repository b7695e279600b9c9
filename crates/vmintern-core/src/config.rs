use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{info, warn};

/// Largest bucket array any table may grow to (2^30 buckets).
pub const MAX_TABLE_SIZE_LOG2: u32 = 30;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Config file not found: {0}")]
    NotFound(String),

    #[error("Failed to read config: {0}")]
    ReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

/// Main configuration for a vmintern runtime
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct RuntimeConfig {
    /// Identifier (symbol) table sizing and arena settings
    #[serde(default)]
    pub identifiers: IdentifierTableConfig,

    /// Text table sizing and dead-row heuristics
    #[serde(default)]
    pub text: TextTableConfig,

    /// Background maintenance service
    #[serde(default)]
    pub maintenance: MaintenanceConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Sizing policy handed to a concurrent intern table.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TableSizing {
    pub initial_size_log2: u32,
    pub max_size_log2: u32,
    /// Preferred average chain length; growth is due above it
    pub target_load_factor: f64,
    /// A chain longer than this marks the table for rehashing
    pub runaway_chain_length: usize,
}

impl Default for TableSizing {
    fn default() -> Self {
        Self {
            initial_size_log2: default_initial_size_log2(),
            max_size_log2: default_max_size_log2(),
            target_load_factor: default_text_load_factor(),
            runaway_chain_length: default_runaway_chain_length(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IdentifierTableConfig {
    /// Initial bucket count as a power of two
    #[serde(default = "default_initial_size_log2")]
    pub initial_size_log2: u32,

    /// Bucket count ceiling as a power of two
    #[serde(default = "default_max_size_log2")]
    pub max_size_log2: u32,

    /// Average chain length above which the table grows
    #[serde(default = "default_identifier_load_factor")]
    pub target_load_factor: f64,

    /// Chain length that triggers a rehash with a fresh seed
    #[serde(default = "default_runaway_chain_length")]
    pub runaway_chain_length: usize,

    /// Size of each chunk carved out for permanent identifiers
    #[serde(default = "default_arena_chunk_bytes")]
    pub arena_chunk_bytes: usize,

    /// Optional ceiling on permanent arena bytes
    #[serde(default)]
    pub arena_limit_bytes: Option<usize>,
}

impl Default for IdentifierTableConfig {
    fn default() -> Self {
        Self {
            initial_size_log2: default_initial_size_log2(),
            max_size_log2: default_max_size_log2(),
            target_load_factor: default_identifier_load_factor(),
            runaway_chain_length: default_runaway_chain_length(),
            arena_chunk_bytes: default_arena_chunk_bytes(),
            arena_limit_bytes: None,
        }
    }
}

impl IdentifierTableConfig {
    pub fn sizing(&self) -> TableSizing {
        TableSizing {
            initial_size_log2: self.initial_size_log2,
            max_size_log2: self.max_size_log2,
            target_load_factor: self.target_load_factor,
            runaway_chain_length: self.runaway_chain_length,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TextTableConfig {
    #[serde(default = "default_initial_size_log2")]
    pub initial_size_log2: u32,

    #[serde(default = "default_max_size_log2")]
    pub max_size_log2: u32,

    #[serde(default = "default_text_load_factor")]
    pub target_load_factor: f64,

    #[serde(default = "default_runaway_chain_length")]
    pub runaway_chain_length: usize,

    /// Dead rows per bucket above which a cleanup is scheduled
    #[serde(default = "default_dead_high_water_mark")]
    pub dead_high_water_mark: f64,
}

impl Default for TextTableConfig {
    fn default() -> Self {
        Self {
            initial_size_log2: default_initial_size_log2(),
            max_size_log2: default_max_size_log2(),
            target_load_factor: default_text_load_factor(),
            runaway_chain_length: default_runaway_chain_length(),
            dead_high_water_mark: default_dead_high_water_mark(),
        }
    }
}

impl TextTableConfig {
    pub fn sizing(&self) -> TableSizing {
        TableSizing {
            initial_size_log2: self.initial_size_log2,
            max_size_log2: self.max_size_log2,
            target_load_factor: self.target_load_factor,
            runaway_chain_length: self.runaway_chain_length,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MaintenanceConfig {
    /// Run table maintenance on a background thread
    #[serde(default = "default_maintenance_background")]
    pub background: bool,

    /// Buckets processed per incremental step before yielding
    #[serde(default = "default_step_buckets")]
    pub step_buckets: usize,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            background: default_maintenance_background(),
            step_buckets: default_step_buckets(),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    #[default]
    Pretty,
    Compact,
    Json,
}

impl std::str::FromStr for LogFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "pretty" => Ok(Self::Pretty),
            "compact" => Ok(Self::Compact),
            "json" => Ok(Self::Json),
            other => Err(ConfigError::ValidationError(format!(
                "Invalid log format: {}. Must be one of: pretty, compact, json",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingConfig {
    /// Log level: "trace", "debug", "info", "warn", "error"
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format: pretty, compact or json
    #[serde(default)]
    pub format: LogFormat,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: LogFormat::default(),
        }
    }
}

fn default_initial_size_log2() -> u32 {
    10
}
fn default_max_size_log2() -> u32 {
    24
}
fn default_identifier_load_factor() -> f64 {
    2.0
}
fn default_text_load_factor() -> f64 {
    2.0
}
fn default_runaway_chain_length() -> usize {
    100
}
fn default_arena_chunk_bytes() -> usize {
    16 * 1024
}
fn default_dead_high_water_mark() -> f64 {
    0.5
}
fn default_maintenance_background() -> bool {
    true
}
fn default_step_buckets() -> usize {
    128
}
fn default_log_level() -> String {
    "info".to_string()
}

/// Configuration manager: file, then environment, then validation
pub struct ConfigManager {
    config: RuntimeConfig,
    config_path: Option<PathBuf>,
}

impl ConfigManager {
    /// Load configuration with the following precedence:
    /// 1. Environment variables (`VMINTERN_*`)
    /// 2. Config file (`./.vmintern.toml`)
    /// 3. Defaults
    pub fn load() -> Result<Self, ConfigError> {
        let local_config = Path::new(".vmintern.toml");
        if local_config.exists() {
            return Self::load_from(local_config);
        }
        info!("No config file found, using defaults");
        Self::finish(RuntimeConfig::default(), None)
    }

    /// Load an explicit config file; a missing file is an error here.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Err(ConfigError::NotFound(path.display().to_string()));
        }
        let config = Self::read_toml_file(path)?;
        Self::finish(config, Some(path.to_path_buf()))
    }

    fn finish(config: RuntimeConfig, config_path: Option<PathBuf>) -> Result<Self, ConfigError> {
        let config = Self::apply_overrides(config, |key| std::env::var(key).ok());
        Self::validate_config(&config)?;

        info!(
            identifier_buckets_log2 = config.identifiers.initial_size_log2,
            text_buckets_log2 = config.text.initial_size_log2,
            background_maintenance = config.maintenance.background,
            "Configuration loaded"
        );
        if let Some(ref path) = config_path {
            info!("Config file: {}", path.display());
        }

        Ok(Self {
            config,
            config_path,
        })
    }

    fn read_toml_file(path: &Path) -> Result<RuntimeConfig, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError(e.to_string()))?;

        toml::from_str(&content).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Apply environment overrides read through `lookup`.
    pub fn apply_overrides<F>(mut config: RuntimeConfig, lookup: F) -> RuntimeConfig
    where
        F: Fn(&str) -> Option<String>,
    {
        fn parsed<T: std::str::FromStr>(value: Option<String>, key: &str) -> Option<T> {
            let raw = value?;
            match raw.parse() {
                Ok(parsed) => Some(parsed),
                Err(_) => {
                    warn!("Ignoring unparsable {}={}", key, raw);
                    None
                }
            }
        }

        if let Some(log2) = parsed(
            lookup("VMINTERN_IDENTIFIER_MAX_SIZE_LOG2"),
            "VMINTERN_IDENTIFIER_MAX_SIZE_LOG2",
        ) {
            config.identifiers.max_size_log2 = log2;
        }
        if let Some(limit) = parsed(
            lookup("VMINTERN_ARENA_LIMIT_BYTES"),
            "VMINTERN_ARENA_LIMIT_BYTES",
        ) {
            config.identifiers.arena_limit_bytes = Some(limit);
        }
        if let Some(log2) = parsed(
            lookup("VMINTERN_TEXT_MAX_SIZE_LOG2"),
            "VMINTERN_TEXT_MAX_SIZE_LOG2",
        ) {
            config.text.max_size_log2 = log2;
        }
        if let Some(mark) = parsed(
            lookup("VMINTERN_TEXT_DEAD_HIGH_WATER_MARK"),
            "VMINTERN_TEXT_DEAD_HIGH_WATER_MARK",
        ) {
            config.text.dead_high_water_mark = mark;
        }
        if let Some(background) = lookup("VMINTERN_MAINTENANCE_BACKGROUND") {
            config.maintenance.background =
                background.to_lowercase() == "true" || background == "1";
        }
        if let Some(step) = parsed(
            lookup("VMINTERN_MAINTENANCE_STEP_BUCKETS"),
            "VMINTERN_MAINTENANCE_STEP_BUCKETS",
        ) {
            config.maintenance.step_buckets = step;
        }

        // Logging
        if let Some(level) = lookup("VMINTERN_LOG_LEVEL") {
            config.logging.level = level;
        }
        if let Some(format) = parsed(lookup("VMINTERN_LOG_FORMAT"), "VMINTERN_LOG_FORMAT") {
            config.logging.format = format;
        }

        config
    }

    pub fn validate_config(config: &RuntimeConfig) -> Result<(), ConfigError> {
        Self::validate_sizing("identifiers", &config.identifiers.sizing())?;
        Self::validate_sizing("text", &config.text.sizing())?;

        if config.identifiers.arena_chunk_bytes == 0 {
            return Err(ConfigError::ValidationError(
                "identifiers.arena_chunk_bytes must be greater than zero".to_string(),
            ));
        }
        if !(config.text.dead_high_water_mark > 0.0) {
            return Err(ConfigError::ValidationError(format!(
                "text.dead_high_water_mark must be positive, got {}",
                config.text.dead_high_water_mark
            )));
        }
        if config.maintenance.step_buckets == 0 {
            return Err(ConfigError::ValidationError(
                "maintenance.step_buckets must be greater than zero".to_string(),
            ));
        }

        match config.logging.level.as_str() {
            "trace" | "debug" | "info" | "warn" | "error" => {}
            other => {
                return Err(ConfigError::ValidationError(format!(
                    "Invalid log level: {}. Must be one of: trace, debug, info, warn, error",
                    other
                )))
            }
        }

        Ok(())
    }

    fn validate_sizing(section: &str, sizing: &TableSizing) -> Result<(), ConfigError> {
        if sizing.initial_size_log2 == 0 || sizing.initial_size_log2 > sizing.max_size_log2 {
            return Err(ConfigError::ValidationError(format!(
                "{}: initial_size_log2 ({}) must be in 1..={}",
                section, sizing.initial_size_log2, sizing.max_size_log2
            )));
        }
        if sizing.max_size_log2 > MAX_TABLE_SIZE_LOG2 {
            return Err(ConfigError::ValidationError(format!(
                "{}: max_size_log2 ({}) exceeds {}",
                section, sizing.max_size_log2, MAX_TABLE_SIZE_LOG2
            )));
        }
        if !(sizing.target_load_factor > 0.0) {
            return Err(ConfigError::ValidationError(format!(
                "{}: target_load_factor must be positive",
                section
            )));
        }
        if sizing.runaway_chain_length < 2 {
            return Err(ConfigError::ValidationError(format!(
                "{}: runaway_chain_length must be at least 2",
                section
            )));
        }
        Ok(())
    }

    /// Get the loaded configuration
    pub fn config(&self) -> &RuntimeConfig {
        &self.config
    }

    pub fn into_config(self) -> RuntimeConfig {
        self.config
    }

    /// Get the path to the config file that was loaded, if any
    pub fn config_path(&self) -> Option<&Path> {
        self.config_path.as_deref()
    }

    /// Create a default config file
    pub fn create_default_config(path: &Path) -> Result<(), ConfigError> {
        let config = RuntimeConfig::default();
        let toml_str =
            toml::to_string_pretty(&config).map_err(|e| ConfigError::ParseError(e.to_string()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::ReadError(e.to_string()))?;
        }

        std::fs::write(path, toml_str).map_err(|e| ConfigError::ReadError(e.to_string()))?;

        Ok(())
    }
}
