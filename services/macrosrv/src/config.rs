//! Service configuration
//!
//! Layered: built-in defaults, then an optional YAML file, then
//! `MACROSRV_`-prefixed environment variables (double underscore for
//! nesting, e.g. `MACROSRV_API__PORT=6010`).

use std::path::Path;

use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{MacrosrvError, Result};

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub api: ApiConfig,

    pub database: DatabaseConfig,

    pub engine: EngineConfig,

    /// JSON file holding the macro definitions loaded at startup
    #[serde(default)]
    pub definitions_file: Option<String>,

    /// Work-item service the engine mutates items through
    pub work_items: EndpointConfig,

    /// Notification service for channel messages
    pub notifications: EndpointConfig,

    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// HTTP listener configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_api_host")]
    pub host: String,

    #[serde(default = "default_api_port")]
    pub port: u16,

    /// Bearer token required on /api routes; unset disables the check
    #[serde(default)]
    pub token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite URL for executions and schedule state
    #[serde(default = "default_database_url")]
    pub url: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Default rate-limit bucket capacity per (macro, origin)
    #[serde(default = "default_rate_capacity")]
    pub rate_capacity: u32,

    /// Default rate-limit refill in tokens per second
    #[serde(default = "default_rate_refill")]
    pub rate_refill_per_sec: f64,

    /// Scheduler tick interval
    #[serde(default = "default_tick_ms")]
    pub scheduler_tick_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointConfig {
    #[serde(default)]
    pub base_url: String,

    #[serde(default = "default_endpoint_timeout")]
    pub timeout_seconds: u64,
}

impl Config {
    /// Load configuration, optionally from an explicit YAML path
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(Config::default()));

        match path {
            Some(path) => {
                if !path.exists() {
                    return Err(MacrosrvError::Config(format!(
                        "config file not found: {}",
                        path.display()
                    )));
                }
                figment = figment.merge(Yaml::file(path));
            },
            None => {
                for candidate in ["config/macrosrv.yaml", "macrosrv.yaml"] {
                    if Path::new(candidate).exists() {
                        figment = figment.merge(Yaml::file(candidate));
                        break;
                    }
                }
            },
        }

        figment
            .merge(Env::prefixed("MACROSRV_").split("__"))
            .extract()
            .map_err(|e| MacrosrvError::Config(format!("failed to load config: {e}")))
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.api.host, self.api.port)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            api: ApiConfig::default(),
            database: DatabaseConfig { url: default_database_url() },
            engine: EngineConfig::default(),
            definitions_file: None,
            work_items: EndpointConfig::default(),
            notifications: EndpointConfig::default(),
            log_level: default_log_level(),
        }
    }
}

impl Default for ApiConfig {
    fn default() -> Self {
        ApiConfig { host: default_api_host(), port: default_api_port(), token: None }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            rate_capacity: default_rate_capacity(),
            rate_refill_per_sec: default_rate_refill(),
            scheduler_tick_ms: default_tick_ms(),
        }
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        EndpointConfig { base_url: String::new(), timeout_seconds: default_endpoint_timeout() }
    }
}

// Default value functions
fn default_api_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    6010
}

fn default_database_url() -> String {
    "sqlite://data/macrosrv.db?mode=rwc".to_string()
}

fn default_rate_capacity() -> u32 {
    10
}

fn default_rate_refill() -> f64 {
    1.0
}

fn default_tick_ms() -> u64 {
    1000
}

fn default_endpoint_timeout() -> u64 {
    30
}

fn default_log_level() -> String {
    "info".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = Config::default();
        assert_eq!(config.api.port, 6010);
        assert_eq!(config.engine.rate_capacity, 10);
        assert_eq!(config.engine.scheduler_tick_ms, 1000);
        assert!(config.api.token.is_none());
        assert_eq!(config.bind_addr(), "0.0.0.0:6010");
    }

    #[test]
    fn test_yaml_overrides_defaults() {
        let mut file = tempfile::Builder::new().suffix(".yaml").tempfile().unwrap();
        writeln!(
            file,
            "api:\n  port: 7000\nengine:\n  rate_capacity: 3\nwork_items:\n  base_url: http://items.local"
        )
        .unwrap();

        let config = Config::load(Some(file.path())).unwrap();
        assert_eq!(config.api.port, 7000);
        assert_eq!(config.engine.rate_capacity, 3);
        assert_eq!(config.work_items.base_url, "http://items.local");
        // Untouched fields keep defaults
        assert_eq!(config.api.host, "0.0.0.0");
    }

    #[test]
    fn test_missing_explicit_file_errors() {
        let err = Config::load(Some(Path::new("/nonexistent/macrosrv.yaml"))).unwrap_err();
        assert!(matches!(err, MacrosrvError::Config(_)));
    }
}
