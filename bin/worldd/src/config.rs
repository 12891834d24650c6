//! Centralized daemon configuration.
//!
//! Strongly-typed configuration loaded via the `config` crate from
//! environment variables (`__` separates nesting, e.g. `NATS__URL`).

use serde::Deserialize;

/// Top-level worldd configuration.
#[derive(Debug, Deserialize)]
pub struct WorlddConfig {
    /// PostgreSQL database connection URL.
    pub database_url: String,

    /// Maximum connections in the database pool.
    #[serde(default = "default_max_connections")]
    pub database_max_connections: u32,

    /// Identity of this deployment, used for consumer naming and logging.
    #[serde(default = "default_deployment_id")]
    pub deployment_id: String,

    /// NATS configuration.
    #[serde(default)]
    pub nats: NatsSettings,
}

/// NATS connection settings.
#[derive(Debug, Clone, Deserialize)]
pub struct NatsSettings {
    /// NATS server URL.
    #[serde(default = "default_nats_url")]
    pub url: String,
}

fn default_max_connections() -> u32 {
    5
}

fn default_deployment_id() -> String {
    "worldd".to_string()
}

fn default_nats_url() -> String {
    "nats://localhost:4222".to_string()
}

impl Default for NatsSettings {
    fn default() -> Self {
        Self {
            url: default_nats_url(),
        }
    }
}

impl WorlddConfig {
    /// Loads configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns an error if required configuration is missing or invalid.
    pub fn from_env() -> Result<Self, config::ConfigError> {
        config::Config::builder()
            .add_source(
                config::Environment::default()
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nats_settings_default_to_localhost() {
        let settings = NatsSettings::default();
        assert_eq!(settings.url, "nats://localhost:4222");
    }

    #[test]
    fn defaults_are_sane() {
        assert_eq!(default_max_connections(), 5);
        assert_eq!(default_deployment_id(), "worldd");
    }
}
