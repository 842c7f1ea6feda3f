//! Configuration management for bandpoints
//!
//! Centralized configuration with:
//! - Environment-based loading (dev, staging, prod)
//! - Environment variable overrides
//! - Runtime validation

use crate::error::{Error, Result};
use crate::rules::RewardRule;
use serde::{Deserialize, Serialize};
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub app: AppConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub heartbeat: HeartbeatConfig,
    #[serde(default)]
    pub reward: RewardRule,
    #[serde(default)]
    pub caps: CapsConfig,
    #[serde(default)]
    pub conversion: ConversionConfig,
    #[serde(default)]
    pub rollup: RollupConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub name: String,
    pub environment: Environment,
    pub listen_address: String,
    pub listen_port: u16,
    pub log_level: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            name: "bandpoints".to_string(),
            environment: Environment::Development,
            listen_address: "127.0.0.1".to_string(),
            listen_port: 8090,
            log_level: "info".to_string(),
        }
    }
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub connection_timeout_secs: u64,
    pub busy_timeout_secs: u64,
    pub enable_wal: bool,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: "bandpoints.db".to_string(),
            max_connections: 8,
            connection_timeout_secs: 10,
            busy_timeout_secs: 30,
            enable_wal: true,
        }
    }
}

/// Shared-secret gates for the HTTP surface. Tokens are opaque strings
/// compared in constant time; an unset token disables that surface.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AuthConfig {
    pub api_key: Option<String>,
    pub cron_key: Option<String>,
    pub verifier_key: Option<String>,
    pub node_key: Option<String>,
}

/// Heartbeat verification tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeartbeatConfig {
    /// Max |now - timestamp| for heartbeats, seconds.
    pub max_drift_secs: i64,
    /// Max |now - timestamp| for registrations, seconds.
    pub register_max_drift_secs: i64,
    /// Fixed credit per verified heartbeat minute.
    pub uptime_points_per_minute: i64,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            max_drift_secs: 120,
            register_max_drift_secs: 300,
            uptime_points_per_minute: 1,
        }
    }
}

/// Earn caps applied inside the award transaction
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapsConfig {
    /// Max total earned points per account per UTC day.
    pub daily_cap: i64,
}

impl Default for CapsConfig {
    fn default() -> Self {
        Self { daily_cap: 5000 }
    }
}

/// Points-to-token conversion settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConversionConfig {
    /// Global switch; conversions are rejected when off.
    pub enabled: bool,
    /// Points per whole token.
    pub rate: i64,
    /// Smallest convertible request.
    pub min_points: i64,
}

impl Default for ConversionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            rate: 1000,
            min_points: 1,
        }
    }
}

/// Rollup scheduler settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollupConfig {
    /// Run the in-process ticker that drives hourly/daily jobs.
    pub enable_scheduler: bool,
    /// Ticker period, seconds.
    pub tick_secs: u64,
}

impl Default for RollupConfig {
    fn default() -> Self {
        Self {
            enable_scheduler: true,
            tick_secs: 60,
        }
    }
}

/// Environment enumeration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    #[default]
    Development,
    Testing,
    Staging,
    Production,
}

impl Config {
    /// Load configuration from file and environment
    pub fn load() -> Result<Self> {
        let env = env::var("BANDPOINTS_ENV").unwrap_or_else(|_| "development".to_string());

        let environment = match env.to_lowercase().as_str() {
            "production" | "prod" => Environment::Production,
            "staging" | "stage" => Environment::Staging,
            "testing" | "test" => Environment::Testing,
            _ => Environment::Development,
        };

        let config_path = Self::get_config_path(&environment);
        let mut config = if config_path.exists() {
            Self::load_from_file(&config_path)?
        } else if environment == Environment::Development || environment == Environment::Testing {
            log::warn!(
                "Config file {} not found, using defaults",
                config_path.display()
            );
            Config {
                app: AppConfig {
                    environment: environment.clone(),
                    ..AppConfig::default()
                },
                ..Config::default()
            }
        } else {
            return Err(Error::Config(format!(
                "Config file not found: {}",
                config_path.display()
            )));
        };

        config.app.environment = environment;
        config.override_from_env();
        config.validate()?;

        Ok(config)
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = toml::from_str(&contents)
            .map_err(|e| Error::Config(format!("Failed to parse config: {}", e)))?;

        Ok(config)
    }

    /// Get configuration file path based on environment
    fn get_config_path(environment: &Environment) -> PathBuf {
        let base_path = env::var("BANDPOINTS_CONFIG_PATH").unwrap_or_else(|_| "config".to_string());

        let filename = match environment {
            Environment::Production => "production.toml",
            Environment::Staging => "staging.toml",
            Environment::Testing => "testing.toml",
            Environment::Development => "development.toml",
        };

        PathBuf::from(base_path).join(filename)
    }

    /// Override selected settings from environment variables
    fn override_from_env(&mut self) {
        if let Ok(url) = env::var("BANDPOINTS_DB_URL") {
            self.database.url = url;
        }
        if let Ok(addr) = env::var("BANDPOINTS_LISTEN_ADDRESS") {
            self.app.listen_address = addr;
        }
        if let Ok(port) = env::var("BANDPOINTS_LISTEN_PORT") {
            if let Ok(port) = port.parse() {
                self.app.listen_port = port;
            }
        }
        if let Ok(key) = env::var("BANDPOINTS_API_KEY") {
            self.auth.api_key = Some(key);
        }
        if let Ok(key) = env::var("BANDPOINTS_CRON_KEY") {
            self.auth.cron_key = Some(key);
        }
        if let Ok(key) = env::var("BANDPOINTS_VERIFIER_KEY") {
            self.auth.verifier_key = Some(key);
        }
        if let Ok(key) = env::var("BANDPOINTS_NODE_KEY") {
            self.auth.node_key = Some(key);
        }
        if let Ok(enabled) = env::var("BANDPOINTS_CONVERSION_ENABLED") {
            self.conversion.enabled = matches!(enabled.as_str(), "1" | "true" | "yes");
        }
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.database.max_connections == 0 {
            return Err(Error::Config("max_connections must be at least 1".into()));
        }
        if self.heartbeat.max_drift_secs <= 0 || self.heartbeat.register_max_drift_secs <= 0 {
            return Err(Error::Config("drift limits must be positive".into()));
        }
        if self.heartbeat.uptime_points_per_minute <= 0 {
            return Err(Error::Config(
                "uptime_points_per_minute must be positive".into(),
            ));
        }
        if self.caps.daily_cap <= 0 {
            return Err(Error::Config("daily_cap must be positive".into()));
        }
        if self.conversion.rate <= 0 {
            return Err(Error::Config("conversion rate must be positive".into()));
        }
        if self.conversion.min_points <= 0 {
            return Err(Error::Config("conversion min_points must be positive".into()));
        }
        if self.rollup.tick_secs == 0 {
            return Err(Error::Config("rollup tick_secs must be positive".into()));
        }
        self.reward.validate().map_err(Error::Config)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let config = Config::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_invalid_rate_rejected() {
        let mut config = Config::default();
        config.conversion.rate = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = Config::default();
        let toml = toml::to_string(&config).unwrap();
        let parsed: Config = toml::from_str(&toml).unwrap();
        assert_eq!(parsed.app.listen_port, config.app.listen_port);
        assert_eq!(parsed.conversion.rate, config.conversion.rate);
        assert_eq!(parsed.reward.base_points_per_hour, config.reward.base_points_per_hour);
    }
}
