//! Configuration loaded from environment variables.
//!
//! - `REDIS_URL` - Store connection string. Defaults to `redis://localhost:6379/0`.
//! - `KEYHIVE_HOST` - Server bind host. Defaults to `127.0.0.1`.
//! - `KEYHIVE_PORT` - Server bind port. Defaults to `8000`.
//! - `KEYHIVE_HEALTH_WEIGHT` - Router weight for credential health. Defaults to `0.4`.
//! - `KEYHIVE_CAPACITY_WEIGHT` - Router weight for remaining capacity. Defaults to `0.6`.
//! - `KEYHIVE_RETRY_ATTEMPTS` - Advisory retry budget surfaced to admin tooling. Defaults to `3`.
//! - `KEYHIVE_LOG_LEVEL` - Default tracing level when `RUST_LOG` is unset. Defaults to `info`.
//!
//! Values stored in the admin `config` hash override the environment at
//! startup (see `api::routes::serve`).

use thiserror::Error;

use crate::router::{DEFAULT_CAPACITY_WEIGHT, DEFAULT_HEALTH_WEIGHT};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Gateway configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Store connection URL
    pub redis_url: String,

    /// Server host
    pub host: String,

    /// Server port
    pub port: u16,

    /// Router weight for credential health (should sum to 1.0 with
    /// `capacity_weight`)
    pub health_weight: f64,

    /// Router weight for remaining capacity
    pub capacity_weight: f64,

    /// Advisory retry budget shown in the admin config view
    pub retry_attempts: u32,

    /// Default log level
    pub log_level: String,
}

fn env_parsed<T: std::str::FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|e| ConfigError::InvalidValue(name.to_string(), format!("{e}"))),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            redis_url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://localhost:6379/0".to_string()),
            host: std::env::var("KEYHIVE_HOST").unwrap_or_else(|_| "127.0.0.1".to_string()),
            port: env_parsed("KEYHIVE_PORT", 8000)?,
            health_weight: env_parsed("KEYHIVE_HEALTH_WEIGHT", DEFAULT_HEALTH_WEIGHT)?,
            capacity_weight: env_parsed("KEYHIVE_CAPACITY_WEIGHT", DEFAULT_CAPACITY_WEIGHT)?,
            retry_attempts: env_parsed("KEYHIVE_RETRY_ATTEMPTS", 3)?,
            log_level: std::env::var("KEYHIVE_LOG_LEVEL").unwrap_or_else(|_| "info".to_string()),
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379/0".to_string(),
            host: "127.0.0.1".to_string(),
            port: 8000,
            health_weight: DEFAULT_HEALTH_WEIGHT,
            capacity_weight: DEFAULT_CAPACITY_WEIGHT,
            retry_attempts: 3,
            log_level: "info".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.port, 8000);
        assert!((config.health_weight + config.capacity_weight - 1.0).abs() < f64::EPSILON);
    }
}
