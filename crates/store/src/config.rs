// Database configuration
//
// The surrounding engine builds this from its own configuration file; it can
// also be read from POSTGRES_* environment variables (and a .env file).

use std::env;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use sqlx::postgres::PgConnectOptions;

use crate::error::StoreError;

/// Default connection timeout in seconds
pub const DEFAULT_TIMEOUT_SECS: u64 = 20;

/// Default maximum number of pooled connections
pub const DEFAULT_MAX_CONNECTIONS: u32 = 10;

/// Default PostgreSQL port
pub const DEFAULT_PORT: u16 = 5432;

/// Connection parameters consumed when the pool is created
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    /// Database name
    pub dbname: String,

    /// Host name of the PostgreSQL server
    pub hostname: String,

    /// Port of the PostgreSQL server
    pub port: u16,

    pub username: String,

    pub password: String,

    /// Connection and acquisition timeout, in seconds
    pub timeout: u64,

    /// Maximum number of outstanding connections
    #[serde(alias = "maxConnections")]
    pub max_connections: u32,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            dbname: "lineage".to_string(),
            hostname: "127.0.0.1".to_string(),
            port: DEFAULT_PORT,
            username: "lineage".to_string(),
            password: String::new(),
            timeout: DEFAULT_TIMEOUT_SECS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

impl DatabaseConfig {
    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `POSTGRES_DB`: database name (default: lineage)
    /// - `POSTGRES_HOST`: server host (default: 127.0.0.1)
    /// - `POSTGRES_PORT`: server port (default: 5432)
    /// - `POSTGRES_USER`: user name (default: lineage)
    /// - `POSTGRES_PASSWORD`: password (default: empty)
    /// - `POSTGRES_TIMEOUT`: timeout in seconds (default: 20)
    /// - `POSTGRES_MAX_CONNECTIONS`: pool size (default: 10)
    pub fn from_env() -> Self {
        // A missing .env file is fine
        let _ = dotenvy::dotenv();

        let defaults = Self::default();
        Self {
            dbname: env::var("POSTGRES_DB").unwrap_or(defaults.dbname),
            hostname: env::var("POSTGRES_HOST").unwrap_or(defaults.hostname),
            port: env::var("POSTGRES_PORT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.port),
            username: env::var("POSTGRES_USER").unwrap_or(defaults.username),
            password: env::var("POSTGRES_PASSWORD").unwrap_or(defaults.password),
            timeout: env::var("POSTGRES_TIMEOUT")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.timeout),
            max_connections: env::var("POSTGRES_MAX_CONNECTIONS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_connections),
        }
    }

    /// Check the parameters before any connection is attempted
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.dbname.is_empty() {
            return Err(StoreError::Config("dbname must not be empty".to_string()));
        }
        if self.hostname.is_empty() {
            return Err(StoreError::Config("hostname must not be empty".to_string()));
        }
        if self.max_connections == 0 {
            return Err(StoreError::Config(
                "max_connections must be > 0".to_string(),
            ));
        }
        if self.timeout == 0 {
            return Err(StoreError::Config("timeout must be > 0".to_string()));
        }
        Ok(())
    }

    /// Timeout as a [`Duration`]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// sqlx connection options for these parameters
    pub fn connect_options(&self) -> PgConnectOptions {
        PgConnectOptions::new()
            .host(&self.hostname)
            .port(self.port)
            .database(&self.dbname)
            .username(&self.username)
            .password(&self.password)
            .application_name("lineage-store")
    }
}

impl fmt::Debug for DatabaseConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseConfig")
            .field("dbname", &self.dbname)
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("timeout", &self.timeout)
            .field("max_connections", &self.max_connections)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = DatabaseConfig::default();
        assert_eq!(config.timeout, 20);
        assert_eq!(config.max_connections, 10);
        assert_eq!(config.port, 5432);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_deserialize_with_original_key_names() {
        let config: DatabaseConfig = serde_json::from_value(serde_json::json!({
            "dbname": "wf",
            "hostname": "db.local",
            "username": "user",
            "password": "secret",
            "maxConnections": 4
        }))
        .unwrap();

        assert_eq!(config.dbname, "wf");
        assert_eq!(config.hostname, "db.local");
        assert_eq!(config.max_connections, 4);
        assert_eq!(config.timeout, DEFAULT_TIMEOUT_SECS);
    }

    #[test]
    fn test_validate_rejects_zero_pool_size() {
        let config = DatabaseConfig {
            max_connections: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(StoreError::Config(_))));

        let config = DatabaseConfig {
            timeout: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = DatabaseConfig {
            dbname: String::new(),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_debug_redacts_password() {
        let config = DatabaseConfig {
            password: "hunter2".to_string(),
            ..Default::default()
        };
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("hunter2"));
        assert!(rendered.contains("<redacted>"));
    }
}
