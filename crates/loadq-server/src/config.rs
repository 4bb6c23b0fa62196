//! Configuration management

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::coordinator::DEFAULT_MAX_COALESCE;
use crate::db::DbConfig;
use crate::dispatch::retry::{DEFAULT_RETRY_ATTEMPTS, DEFAULT_RETRY_BASE_MS};
use crate::dispatch::{
    DispatchSettings, RetryPolicy, DEFAULT_MAX_STATEMENT_RETRIES,
    DEFAULT_STATEMENT_RETRY_WAIT_SECS,
};
use crate::storage::config::{StorageConfig, DEFAULT_S3_REGION};
use crate::warehouse::{WarehouseConfig, DEFAULT_DB_USER};

// ============================================================================
// Server Configuration Constants
// ============================================================================

/// Default server host binding.
pub const DEFAULT_SERVER_HOST: &str = "127.0.0.1";

/// Default server port.
pub const DEFAULT_SERVER_PORT: u16 = 8000;

/// Default shutdown timeout in seconds.
pub const DEFAULT_SHUTDOWN_TIMEOUT_SECS: u64 = 30;

/// Default database URL for local development.
pub const DEFAULT_DATABASE_URL: &str = "postgresql://localhost/loadq";

/// Default maximum database connections in the pool.
pub const DEFAULT_DATABASE_MAX_CONNECTIONS: u32 = 10;

/// Default minimum database connections in the pool.
pub const DEFAULT_DATABASE_MIN_CONNECTIONS: u32 = 2;

/// Default database connection timeout in seconds.
pub const DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS: u64 = 10;

/// Default database idle timeout in seconds (10 minutes).
pub const DEFAULT_DATABASE_IDLE_TIMEOUT_SECS: u64 = 600;

/// Default key prefix for manifests written by the loader.
pub const DEFAULT_MANIFEST_PREFIX: &str = "manifests/";

/// Default key prefix of per-queue loader configs.
pub const DEFAULT_CONFIG_PREFIX: &str = "config/";

/// Server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub storage: StorageConfig,
    pub warehouse: WarehouseConfig,
    pub loader: LoaderSettings,
}

/// Server-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub shutdown_timeout_secs: u64,
}

/// Database configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
    pub min_connections: u32,
    pub connect_timeout_secs: u64,
    pub idle_timeout_secs: u64,
}

impl DatabaseConfig {
    pub fn pool_config(&self) -> DbConfig {
        DbConfig {
            url: self.url.clone(),
            max_connections: self.max_connections,
            min_connections: self.min_connections,
            connect_timeout_secs: self.connect_timeout_secs,
            idle_timeout_secs: Some(self.idle_timeout_secs),
            max_lifetime_secs: None,
        }
    }
}

/// Where tracking records live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Postgres,
    /// Process memory; state is lost on restart
    Memory,
}

impl FromStr for StoreBackend {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "postgres" | "postgresql" => Ok(StoreBackend::Postgres),
            "memory" => Ok(StoreBackend::Memory),
            other => anyhow::bail!("Unknown store backend '{}'", other),
        }
    }
}

/// Load coordination and dispatch settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoaderSettings {
    pub store_backend: StoreBackend,
    pub manifest_bucket: String,
    pub manifest_prefix: String,
    pub config_bucket: String,
    pub config_prefix: String,
    pub max_coalesce: usize,
    pub retry_attempts: u32,
    pub retry_base_ms: u64,
    pub statement_retry_wait_secs: u64,
    pub max_statement_retries: u32,
    pub db_user: String,
    pub copy_iam_role_arn: Option<String>,
}

impl LoaderSettings {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retry_attempts, Duration::from_millis(self.retry_base_ms))
    }

    pub fn dispatch_settings(&self) -> DispatchSettings {
        DispatchSettings {
            db_user: self.db_user.clone(),
            fallback_role_arn: self.copy_iam_role_arn.clone(),
            statement_retry_wait: Duration::from_secs(self.statement_retry_wait_secs),
            max_statement_retries: self.max_statement_retries,
        }
    }
}

/// Make a key prefix end with `/` unless it is empty.
pub fn normalize_prefix(prefix: &str) -> String {
    if prefix.is_empty() || prefix.ends_with('/') {
        prefix.to_string()
    } else {
        format!("{}/", prefix)
    }
}

fn parsed<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T {
    lookup(key).and_then(|s| s.parse().ok()).unwrap_or(default)
}

impl Config {
    /// Load configuration from environment and defaults
    pub fn load() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self::from_lookup(|key| std::env::var(key).ok())?;
        config.validate()?;

        Ok(config)
    }

    /// Build configuration from an arbitrary variable source.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let store_backend = match lookup("LOADQ_STORE_BACKEND") {
            Some(raw) => raw.parse()?,
            None => StoreBackend::Postgres,
        };

        Ok(Config {
            server: ServerConfig {
                host: lookup("LOADQ_HOST").unwrap_or_else(|| DEFAULT_SERVER_HOST.to_string()),
                port: parsed(&lookup, "LOADQ_PORT", DEFAULT_SERVER_PORT),
                shutdown_timeout_secs: parsed(
                    &lookup,
                    "LOADQ_SHUTDOWN_TIMEOUT",
                    DEFAULT_SHUTDOWN_TIMEOUT_SECS,
                ),
            },
            database: DatabaseConfig {
                url: lookup("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
                max_connections: parsed(
                    &lookup,
                    "DATABASE_MAX_CONNECTIONS",
                    DEFAULT_DATABASE_MAX_CONNECTIONS,
                ),
                min_connections: parsed(
                    &lookup,
                    "DATABASE_MIN_CONNECTIONS",
                    DEFAULT_DATABASE_MIN_CONNECTIONS,
                ),
                connect_timeout_secs: parsed(
                    &lookup,
                    "DATABASE_CONNECT_TIMEOUT",
                    DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                ),
                idle_timeout_secs: parsed(
                    &lookup,
                    "DATABASE_IDLE_TIMEOUT",
                    DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
                ),
            },
            storage: StorageConfig::from_lookup(&lookup),
            warehouse: WarehouseConfig::from_lookup(&lookup),
            loader: LoaderSettings {
                store_backend,
                manifest_bucket: lookup("MANIFEST_BUCKET").unwrap_or_default(),
                manifest_prefix: normalize_prefix(
                    &lookup("MANIFEST_PREFIX").unwrap_or_else(|| DEFAULT_MANIFEST_PREFIX.to_string()),
                ),
                config_bucket: lookup("CONFIG_BUCKET").unwrap_or_default(),
                config_prefix: normalize_prefix(
                    &lookup("CONFIG_PREFIX").unwrap_or_else(|| DEFAULT_CONFIG_PREFIX.to_string()),
                ),
                max_coalesce: parsed(&lookup, "LOADQ_MAX_COALESCE", DEFAULT_MAX_COALESCE),
                retry_attempts: parsed(&lookup, "LOADQ_RETRY_ATTEMPTS", DEFAULT_RETRY_ATTEMPTS),
                retry_base_ms: parsed(&lookup, "LOADQ_RETRY_BASE_MS", DEFAULT_RETRY_BASE_MS),
                statement_retry_wait_secs: parsed(
                    &lookup,
                    "STATEMENT_RETRY_WAIT_SECS",
                    DEFAULT_STATEMENT_RETRY_WAIT_SECS,
                ),
                max_statement_retries: parsed(
                    &lookup,
                    "MAX_STATEMENT_RETRIES",
                    DEFAULT_MAX_STATEMENT_RETRIES,
                ),
                db_user: lookup("REDSHIFT_DB_USER").unwrap_or_else(|| DEFAULT_DB_USER.to_string()),
                copy_iam_role_arn: lookup("COPY_IAM_ROLE_ARN"),
            },
        })
    }

    /// Validate configuration
    pub fn validate(&self) -> anyhow::Result<()> {
        // Validate port
        if self.server.port == 0 {
            anyhow::bail!("Server port must be greater than 0");
        }

        if self.loader.store_backend == StoreBackend::Postgres {
            if self.database.url.is_empty() {
                anyhow::bail!("Database URL cannot be empty");
            }

            if self.database.max_connections == 0 {
                anyhow::bail!("Database max_connections must be greater than 0");
            }

            if self.database.min_connections > self.database.max_connections {
                anyhow::bail!(
                    "Database min_connections ({}) cannot be greater than max_connections ({})",
                    self.database.min_connections,
                    self.database.max_connections
                );
            }
        }

        if self.loader.manifest_bucket.is_empty() {
            anyhow::bail!("MANIFEST_BUCKET must be set");
        }

        if self.loader.config_bucket.is_empty() {
            anyhow::bail!("CONFIG_BUCKET must be set");
        }

        if self.loader.max_coalesce == 0 {
            anyhow::bail!("LOADQ_MAX_COALESCE must be greater than 0");
        }

        if self.loader.store_backend == StoreBackend::Memory {
            tracing::warn!("Using the in-memory state store; tracking state is lost on restart");
        }

        if self.loader.copy_iam_role_arn.is_none() {
            tracing::debug!("COPY_IAM_ROLE_ARN not set; statement retries rely on loader config");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: DEFAULT_SERVER_HOST.to_string(),
                port: DEFAULT_SERVER_PORT,
                shutdown_timeout_secs: DEFAULT_SHUTDOWN_TIMEOUT_SECS,
            },
            database: DatabaseConfig {
                url: DEFAULT_DATABASE_URL.to_string(),
                max_connections: DEFAULT_DATABASE_MAX_CONNECTIONS,
                min_connections: DEFAULT_DATABASE_MIN_CONNECTIONS,
                connect_timeout_secs: DEFAULT_DATABASE_CONNECT_TIMEOUT_SECS,
                idle_timeout_secs: DEFAULT_DATABASE_IDLE_TIMEOUT_SECS,
            },
            storage: StorageConfig::for_aws(DEFAULT_S3_REGION),
            warehouse: WarehouseConfig::default(),
            loader: LoaderSettings {
                store_backend: StoreBackend::Postgres,
                manifest_bucket: String::new(),
                manifest_prefix: DEFAULT_MANIFEST_PREFIX.to_string(),
                config_bucket: String::new(),
                config_prefix: DEFAULT_CONFIG_PREFIX.to_string(),
                max_coalesce: DEFAULT_MAX_COALESCE,
                retry_attempts: DEFAULT_RETRY_ATTEMPTS,
                retry_base_ms: DEFAULT_RETRY_BASE_MS,
                statement_retry_wait_secs: DEFAULT_STATEMENT_RETRY_WAIT_SECS,
                max_statement_retries: DEFAULT_MAX_STATEMENT_RETRIES,
                db_user: DEFAULT_DB_USER.to_string(),
                copy_iam_role_arn: None,
            },
        }
    }
}
