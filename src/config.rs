//! Client configuration.

use crate::error::{Result, VecsError};
use crate::retry::RetryPolicy;
use crate::schema::{validate_collection_name, validate_text_search_config};
use std::time::Duration;

/// Environment variable holding the connection string.
pub const DATABASE_URL_ENV: &str = "DATABASE_URL";

/// Environment variable overriding the schema collections live in.
pub const SCHEMA_ENV: &str = "PGVECS_SCHEMA";

/// Connection and behaviour settings for a [`crate::Client`].
#[derive(Debug, Clone, PartialEq)]
pub struct ClientConfig {
    /// Postgres connection string
    pub database_url: String,

    /// Schema holding one table per collection
    pub schema: String,

    /// Maximum number of pooled connections
    pub max_connections: u32,

    /// Minimum number of pooled connections
    pub min_connections: u32,

    /// Seconds to wait for a free connection
    pub acquire_timeout_secs: u64,

    /// Text search configuration used to derive `fts` and parse search text
    pub text_search_config: String,

    /// Backoff for index builds racing other DDL
    pub retry: RetryPolicy,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            database_url: "postgres://postgres@localhost:5432/postgres".to_string(),
            schema: "vecs".to_string(),
            max_connections: 10,
            min_connections: 0,
            acquire_timeout_secs: 30,
            text_search_config: "english".to_string(),
            retry: RetryPolicy::default(),
        }
    }
}

impl ClientConfig {
    pub fn new(database_url: impl Into<String>) -> Self {
        Self {
            database_url: database_url.into(),
            ..Default::default()
        }
    }

    /// Read `DATABASE_URL` (required) and `PGVECS_SCHEMA` (optional).
    pub fn from_env() -> Result<Self> {
        let database_url = std::env::var(DATABASE_URL_ENV)
            .map_err(|_| VecsError::arg(format!("{} is not set", DATABASE_URL_ENV)))?;
        let mut config = Self::new(database_url);
        if let Ok(schema) = std::env::var(SCHEMA_ENV) {
            config.schema = schema;
        }
        Ok(config)
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    pub fn with_min_connections(mut self, min: u32) -> Self {
        self.min_connections = min;
        self
    }

    pub fn with_acquire_timeout_secs(mut self, secs: u64) -> Self {
        self.acquire_timeout_secs = secs;
        self
    }

    pub fn with_text_search_config(mut self, config: impl Into<String>) -> Self {
        self.text_search_config = config.into();
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_secs(self.acquire_timeout_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.database_url.is_empty() {
            return Err(VecsError::arg("database_url must not be empty"));
        }
        validate_collection_name(&self.schema)
            .map_err(|_| VecsError::arg(format!("invalid schema name: {:?}", self.schema)))?;
        validate_text_search_config(&self.text_search_config)?;
        if self.max_connections == 0 {
            return Err(VecsError::arg("max_connections must be >= 1"));
        }
        if self.min_connections > self.max_connections {
            return Err(VecsError::arg(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        Ok(())
    }
}
