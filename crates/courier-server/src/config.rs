//! Host configuration with layered loading.

use std::path::{Path, PathBuf};

use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::Deserialize;
use thiserror::Error;

/// Environment variable naming the configuration file.
pub const CONFIG_PATH_VAR: &str = "COURIER_CONFIG";

const DEFAULT_CONFIG_PATH: &str = "courier.toml";

/// Errors that can occur when loading or parsing host configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Error from the Figment configuration library.
    #[error("configuration error: {0}")]
    Figment(Box<figment::Error>),

    /// The specified configuration file was not found.
    #[error("configuration file not found: {0}")]
    FileNotFound(String),
}

impl From<figment::Error> for ConfigError {
    fn from(err: figment::Error) -> Self {
        Self::Figment(Box::new(err))
    }
}

/// Top-level host configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Streaming store connection settings.
    pub broker: BrokerConfig,
    /// PostgreSQL connection settings.
    pub postgres: PostgresConfig,
    /// Migration runner settings.
    pub migration: MigrationConfig,
}

/// Streaming store connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Connection URL.
    pub url: String,
    /// Maximum pool connections.
    pub pool_size: usize,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            url: "redis://localhost:6379".to_owned(),
            pool_size: 10,
        }
    }
}

/// PostgreSQL connection settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PostgresConfig {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub password: String,
    pub dbname: String,
    pub sslmode: String,
    /// Maximum pool connections.
    pub max_conns: u32,
    /// Connections kept open when idle.
    pub min_conns: u32,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_owned(),
            port: 5432,
            user: "postgres".to_owned(),
            password: String::new(),
            dbname: "courier".to_owned(),
            sslmode: "disable".to_owned(),
            max_conns: 10,
            min_conns: 1,
        }
    }
}

impl PostgresConfig {
    /// Connection string for the pool.
    #[must_use]
    pub fn dsn(&self) -> String {
        format!(
            "postgres://{}:{}@{}:{}/{}?sslmode={}",
            self.user, self.password, self.host, self.port, self.dbname, self.sslmode
        )
    }
}

/// Migration runner settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Directory holding the SQL migrations.
    pub dir: PathBuf,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("migrations"),
        }
    }
}

impl Config {
    /// Loads configuration from the file named by `COURIER_CONFIG`
    /// (default `courier.toml`).
    pub fn load() -> Result<Self, ConfigError> {
        let path =
            std::env::var(CONFIG_PATH_VAR).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_owned());
        Self::load_from(path)
    }

    /// Loads configuration from the specified file path.
    ///
    /// Environment variables prefixed with `COURIER_` override file
    /// settings.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(ConfigError::FileNotFound(path.display().to_string()));
        }

        let figment = Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed("COURIER_").split("__"));

        figment.extract::<Self>().map_err(ConfigError::from)
    }

    /// Parses configuration from a TOML string.
    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let figment = Figment::new().merge(Toml::string(content));
        figment.extract::<Self>().map_err(ConfigError::from)
    }
}
