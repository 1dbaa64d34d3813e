//! Entry point: owns the pool and hands out collections.

use crate::collection::Collection;
use crate::config::ClientConfig;
use crate::error::{Result, SchemaError};
use crate::schema::{quote_ident, validate_collection_name, SchemaManager};
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::{info, instrument};

/// A connection to one Postgres schema holding collections.
#[derive(Debug, Clone)]
pub struct Client {
    pool: PgPool,
    config: ClientConfig,
    schemas: SchemaManager,
}

impl Client {
    /// Open the pool and make sure the `vector` extension and the schema exist.
    #[instrument(skip(config), fields(schema = %config.schema))]
    pub async fn connect(config: ClientConfig) -> Result<Self> {
        config.validate()?;
        let pool = PgPoolOptions::new()
            .max_connections(config.max_connections)
            .min_connections(config.min_connections)
            .acquire_timeout(config.acquire_timeout())
            .connect(&config.database_url)
            .await?;

        sqlx::query("CREATE EXTENSION IF NOT EXISTS vector")
            .execute(&pool)
            .await?;
        sqlx::query(&format!(
            "CREATE SCHEMA IF NOT EXISTS {}",
            quote_ident(&config.schema)
        ))
        .execute(&pool)
        .await?;

        info!(
            max_connections = config.max_connections,
            "connected to database"
        );
        Ok(Self::with_pool(pool, config))
    }

    /// Wrap an existing pool. Assumes the extension and schema are in place.
    pub fn with_pool(pool: PgPool, config: ClientConfig) -> Self {
        let schemas = SchemaManager::new(pool.clone(), config.schema.clone())
            .with_text_search_config(config.text_search_config.clone());
        Self {
            pool,
            config,
            schemas,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn schemas(&self) -> &SchemaManager {
        &self.schemas
    }

    fn handle(&self, name: &str, dimension: usize) -> Collection {
        Collection::new(
            self.pool.clone(),
            self.config.schema.clone(),
            name,
            dimension,
            self.config.retry.clone(),
        )
        .with_text_search_config(self.config.text_search_config.clone())
    }

    /// Create a new collection; fails if the name is taken.
    pub async fn create_collection(&self, name: &str, dimension: usize) -> Result<Collection> {
        self.schemas.create_exclusive(name, dimension).await?;
        Ok(self.handle(name, dimension))
    }

    /// Create the collection unless it exists with the same dimension.
    pub async fn get_or_create_collection(&self, name: &str, dimension: usize) -> Result<Collection> {
        self.schemas.create_if_not_exists(name, dimension).await?;
        Ok(self.handle(name, dimension))
    }

    /// An existing collection, with its dimension read from the catalog.
    pub async fn get_collection(&self, name: &str) -> Result<Collection> {
        validate_collection_name(name)?;
        match self.schemas.stored_dimension(name).await? {
            Some(dimension) => Ok(self.handle(name, dimension)),
            None => Err(SchemaError::CollectionNotFound {
                name: name.to_string(),
            }
            .into()),
        }
    }

    pub async fn list_collections(&self) -> Result<Vec<String>> {
        self.schemas.list().await
    }

    /// Drop a collection with all its records and indexes. Absent names are ignored.
    pub async fn delete_collection(&self, name: &str) -> Result<()> {
        self.schemas.drop(name).await
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}
