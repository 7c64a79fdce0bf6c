//! Configuration loading and environment variable handling

use crate::domains::ReallyConfig;
use crate::error::{ConfigError, ConfigResult};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Configuration loader with environment variable support
pub struct ConfigLoader {
    /// Environment variable prefix
    prefix: String,
}

impl ConfigLoader {
    /// Create a new config loader with default prefix
    pub fn new() -> Self {
        Self {
            prefix: "REALLY".to_string(),
        }
    }

    /// Create a new config loader with custom prefix
    pub fn with_prefix(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Load configuration from a YAML file with environment overrides
    pub fn from_file(&self, path: impl AsRef<Path>) -> ConfigResult<ReallyConfig> {
        let content = std::fs::read_to_string(path)?;
        let mut config: ReallyConfig = serde_yaml::from_str(&content)?;

        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;

        Ok(config)
    }

    /// Load configuration from environment variables only
    pub fn from_env(&self) -> ConfigResult<ReallyConfig> {
        let mut config = ReallyConfig::default();
        self.apply_env_overrides(&mut config)?;
        config.validate_all()?;
        Ok(config)
    }

    /// Load configuration with fallback chain
    pub fn load(&self, config_path: Option<impl AsRef<Path>>) -> ConfigResult<ReallyConfig> {
        match config_path {
            Some(path) => self.from_file(path),
            None => self.from_env(),
        }
    }

    /// Apply environment variable overrides to configuration
    fn apply_env_overrides(&self, config: &mut ReallyConfig) -> ConfigResult<()> {
        self.apply_pool_overrides(&mut config.pool)?;
        self.apply_logging_overrides(&mut config.logging)?;
        Ok(())
    }

    /// Apply pool config overrides
    fn apply_pool_overrides(
        &self,
        config: &mut crate::domains::pool::PoolConfig,
    ) -> ConfigResult<()> {
        if let Ok(script) = self.get_env_var("POOL_SCRIPT") {
            config.script = PathBuf::from(script);
        }

        if let Ok(workers) = self.get_env_var("POOL_WORKERS") {
            config.workers_count = workers
                .parse()
                .map_err(|e| ConfigError::EnvError(format!("Invalid POOL_WORKERS: {}", e)))?;
        }

        if let Ok(concurrency) = self.get_env_var("POOL_CONCURRENCY") {
            config.concurrency_level = concurrency
                .parse()
                .map_err(|e| ConfigError::EnvError(format!("Invalid POOL_CONCURRENCY: {}", e)))?;
        }

        if let Ok(transport) = self.get_env_var("POOL_TRANSPORT") {
            config.transport = crate::domains::pool::TransportKind::from_str(&transport)
                .map_err(|_| ConfigError::EnvError(format!("Invalid POOL_TRANSPORT: {}", transport)))?;
        }

        Ok(())
    }

    /// Apply logging config overrides
    fn apply_logging_overrides(
        &self,
        config: &mut crate::domains::logging::LoggingConfig,
    ) -> ConfigResult<()> {
        if let Ok(log_level) = self.get_env_var("LOG_LEVEL") {
            config.level = crate::domains::logging::LogLevel::from_str(&log_level)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_LEVEL: {}", log_level)))?;
        }

        if let Ok(format) = self.get_env_var("LOG_FORMAT") {
            config.format = crate::domains::logging::LogFormat::from_str(&format)
                .map_err(|_| ConfigError::EnvError(format!("Invalid LOG_FORMAT: {}", format)))?;
        }

        Ok(())
    }

    /// Get environment variable with prefix
    fn get_env_var(&self, name: &str) -> Result<String, std::env::VarError> {
        std::env::var(format!("{}_{}", self.prefix, name))
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}
