//! Physical layout of a collection.
//!
//! [`CollectionSchema`] describes the table; the `*_ddl` functions turn that
//! description into SQL; [`SchemaManager`] runs it against the store.

use crate::error::{Result, SchemaError, VecsError};
use sqlx::PgPool;
use tracing::{debug, info, instrument};

/// Longest accepted collection name. Index names append up to 15 bytes and
/// Postgres truncates identifiers past 63.
pub const MAX_NAME_LEN: usize = 48;

/// Largest dimension pgvector accepts for the `vector` type.
pub const MAX_DIMENSION: usize = 16_000;

/// Quote an identifier for interpolation into SQL.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

pub fn validate_collection_name(name: &str) -> Result<()> {
    if name.is_empty() || name.len() > MAX_NAME_LEN {
        return Err(VecsError::arg(format!(
            "collection name must be 1..={} characters, got {:?}",
            MAX_NAME_LEN, name
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(VecsError::arg(format!(
            "collection name may only contain [A-Za-z0-9_-], got {:?}",
            name
        )));
    }
    Ok(())
}

fn validate_dimension(dimension: usize) -> Result<()> {
    if dimension == 0 {
        return Err(VecsError::arg("dimension is required and must be > 0"));
    }
    if dimension > MAX_DIMENSION {
        return Err(VecsError::arg(format!(
            "dimension must be <= {}, got {}",
            MAX_DIMENSION, dimension
        )));
    }
    Ok(())
}

pub(crate) fn validate_text_search_config(config: &str) -> Result<()> {
    if config.is_empty() || !config.chars().all(|c| c.is_ascii_lowercase() || c == '_') {
        return Err(VecsError::arg(format!(
            "invalid text search configuration: {:?}",
            config
        )));
    }
    Ok(())
}

/// Key for a named advisory lock scoped to one collection.
pub(crate) fn advisory_key(schema: &str, name: &str, purpose: &str) -> String {
    format!("pgvecs:{}:{}.{}", purpose, schema, name)
}

/// One column of the collection table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnSpec {
    pub name: &'static str,
    pub sql_type: String,
    pub constraints: String,
}

impl ColumnSpec {
    fn new(name: &'static str, sql_type: impl Into<String>, constraints: impl Into<String>) -> Self {
        Self {
            name,
            sql_type: sql_type.into(),
            constraints: constraints.into(),
        }
    }
}

/// Everything needed to create one collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionSchema {
    pub schema: String,
    pub name: String,
    pub dimension: usize,
    pub text_search_config: String,
}

impl CollectionSchema {
    pub fn new(schema: impl Into<String>, name: impl Into<String>, dimension: usize) -> Result<Self> {
        let name = name.into();
        validate_collection_name(&name)?;
        validate_dimension(dimension)?;
        Ok(Self {
            schema: schema.into(),
            name,
            dimension,
            text_search_config: "english".to_string(),
        })
    }

    pub fn with_text_search_config(mut self, config: impl Into<String>) -> Result<Self> {
        let config = config.into();
        validate_text_search_config(&config)?;
        self.text_search_config = config;
        Ok(self)
    }

    /// `"schema"."name"`, ready for interpolation.
    pub fn qualified_name(&self) -> String {
        qualified_name(&self.schema, &self.name)
    }

    pub fn columns(&self) -> Vec<ColumnSpec> {
        vec![
            ColumnSpec::new("fragment_id", "UUID", "PRIMARY KEY"),
            ColumnSpec::new("extraction_id", "UUID", "NOT NULL"),
            ColumnSpec::new("document_id", "UUID", "NOT NULL"),
            ColumnSpec::new("user_id", "UUID", "NOT NULL"),
            ColumnSpec::new("group_ids", "UUID[]", "NOT NULL DEFAULT '{}'"),
            ColumnSpec::new("vector", format!("vector({})", self.dimension), "NOT NULL"),
            ColumnSpec::new("text", "TEXT", ""),
            ColumnSpec::new(
                "metadata",
                "JSONB",
                "NOT NULL DEFAULT '{}'::jsonb CHECK (jsonb_typeof(metadata) = 'object')",
            ),
            ColumnSpec::new(
                "fts",
                "TSVECTOR",
                format!(
                    "GENERATED ALWAYS AS (to_tsvector('{}'::regconfig, COALESCE(text, ''))) STORED",
                    self.text_search_config
                ),
            ),
        ]
    }

    pub fn index_name(&self, suffix: &str) -> String {
        format!("ix_{}_{}", self.name, suffix)
    }
}

pub(crate) fn qualified_name(schema: &str, name: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(name))
}

pub fn create_table_ddl(schema: &CollectionSchema) -> String {
    let columns: Vec<String> = schema
        .columns()
        .iter()
        .map(|c| {
            if c.constraints.is_empty() {
                format!("    {} {}", c.name, c.sql_type)
            } else {
                format!("    {} {} {}", c.name, c.sql_type, c.constraints)
            }
        })
        .collect();
    format!(
        "CREATE TABLE IF NOT EXISTS {} (\n{}\n)",
        schema.qualified_name(),
        columns.join(",\n")
    )
}

/// Auxiliary indexes: metadata containment, lexical search, document lookups.
pub fn auxiliary_index_ddl(schema: &CollectionSchema) -> Vec<String> {
    let table = schema.qualified_name();
    vec![
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} USING GIN (metadata jsonb_path_ops)",
            quote_ident(&schema.index_name("metadata")),
            table
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} USING GIN (fts)",
            quote_ident(&schema.index_name("fts")),
            table
        ),
        format!(
            "CREATE INDEX IF NOT EXISTS {} ON {} (document_id)",
            quote_ident(&schema.index_name("document_id")),
            table
        ),
    ]
}

/// The full statement list creating a collection, in execution order.
pub fn create_collection_ddl(schema: &CollectionSchema) -> Vec<String> {
    let mut statements = vec![create_table_ddl(schema)];
    statements.extend(auxiliary_index_ddl(schema));
    statements
}

/// Drops the table; its indexes go with it.
pub fn drop_collection_ddl(schema: &str, name: &str) -> String {
    format!("DROP TABLE IF EXISTS {} CASCADE", qualified_name(schema, name))
}

/// Creates, inspects and drops collection tables.
#[derive(Debug, Clone)]
pub struct SchemaManager {
    pool: PgPool,
    schema: String,
    text_search_config: String,
}

impl SchemaManager {
    pub fn new(pool: PgPool, schema: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
            text_search_config: "english".to_string(),
        }
    }

    pub fn with_text_search_config(mut self, config: impl Into<String>) -> Self {
        self.text_search_config = config.into();
        self
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    fn describe(&self, name: &str, dimension: usize) -> Result<CollectionSchema> {
        CollectionSchema::new(self.schema.clone(), name, dimension)?
            .with_text_search_config(self.text_search_config.clone())
    }

    /// Dimension of an existing collection, read from the column's type modifier.
    pub async fn stored_dimension(&self, name: &str) -> Result<Option<usize>> {
        let mut conn = self.pool.acquire().await?;
        stored_dimension_in(&mut conn, &self.schema, name).await
    }

    /// Create the collection, or check an existing one has `dimension`.
    #[instrument(skip(self), fields(schema = %self.schema))]
    pub async fn create_if_not_exists(&self, name: &str, dimension: usize) -> Result<()> {
        self.create(name, dimension, false).await
    }

    /// Create the collection, failing if the name is taken.
    #[instrument(skip(self), fields(schema = %self.schema))]
    pub async fn create_exclusive(&self, name: &str, dimension: usize) -> Result<()> {
        self.create(name, dimension, true).await
    }

    async fn create(&self, name: &str, dimension: usize, exclusive: bool) -> Result<()> {
        let description = self.describe(name, dimension)?;

        // concurrent creators of the same name serialize here
        let mut tx = self.pool.begin().await?;
        sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
            .bind(advisory_key(&self.schema, name, "schema"))
            .execute(&mut *tx)
            .await?;

        if let Some(stored) = stored_dimension_in(&mut *tx, &self.schema, name).await? {
            tx.rollback().await?;
            if exclusive {
                return Err(SchemaError::CollectionAlreadyExists {
                    name: name.to_string(),
                }
                .into());
            }
            if stored != dimension {
                return Err(SchemaError::MismatchedDimension {
                    name: name.to_string(),
                    stored,
                    requested: dimension,
                }
                .into());
            }
            debug!(collection = name, dimension, "collection already exists");
            return Ok(());
        }

        for statement in create_collection_ddl(&description) {
            debug!(sql = %statement, "executing DDL");
            sqlx::query(&statement).execute(&mut *tx).await?;
        }
        tx.commit().await?;
        info!(collection = name, dimension, "created collection");
        Ok(())
    }

    /// Remove the table and every index on it. Absent collections are ignored.
    #[instrument(skip(self), fields(schema = %self.schema))]
    pub async fn drop(&self, name: &str) -> Result<()> {
        validate_collection_name(name)?;
        sqlx::query(&drop_collection_ddl(&self.schema, name))
            .execute(&self.pool)
            .await?;
        info!(collection = name, "dropped collection");
        Ok(())
    }

    /// Names of all collections in the schema.
    pub async fn list(&self) -> Result<Vec<String>> {
        let names: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT c.relname::text
            FROM pg_class c
            JOIN pg_namespace n ON n.oid = c.relnamespace
            JOIN pg_attribute a ON a.attrelid = c.oid
            JOIN pg_type t ON t.oid = a.atttypid
            WHERE n.nspname = $1 AND c.relkind = 'r'
              AND a.attname = 'vector' AND t.typname = 'vector'
              AND NOT a.attisdropped
            ORDER BY c.relname
            "#,
        )
        .bind(&self.schema)
        .fetch_all(&self.pool)
        .await?;
        Ok(names)
    }
}

async fn stored_dimension_in(
    conn: &mut sqlx::PgConnection,
    schema: &str,
    name: &str,
) -> Result<Option<usize>> {
    // relation names are unique per schema, so this sees tables, views and
    // indexes alike
    let row: Option<(String, Option<String>, Option<i32>)> = sqlx::query_as(
        r#"
        SELECT c.relkind::text, t.typname::text, a.atttypmod
        FROM pg_class c
        JOIN pg_namespace n ON n.oid = c.relnamespace
        LEFT JOIN pg_attribute a
          ON a.attrelid = c.oid AND a.attname = 'vector' AND NOT a.attisdropped
        LEFT JOIN pg_type t ON t.oid = a.atttypid
        WHERE n.nspname = $1 AND c.relname = $2
        "#,
    )
    .bind(schema)
    .bind(name)
    .fetch_optional(conn)
    .await?;
    row.map(|(relkind, typname, typmod)| {
        collection_dimension(name, &relkind, typname.as_deref(), typmod)
    })
    .transpose()
}

/// Dimension of an existing relation, which must be a table with a
/// fixed-width `vector` column.
fn collection_dimension(
    name: &str,
    relkind: &str,
    typname: Option<&str>,
    typmod: Option<i32>,
) -> Result<usize> {
    match (relkind, typname, typmod.and_then(|t| usize::try_from(t).ok())) {
        ("r", Some("vector"), Some(dimension)) if dimension > 0 => Ok(dimension),
        _ => Err(SchemaError::NotACollection {
            name: name.to_string(),
        }
        .into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn docs() -> CollectionSchema {
        CollectionSchema::new("vecs", "docs", 3).unwrap()
    }

    #[test]
    fn test_quote_ident() {
        assert_eq!(quote_ident("docs"), "\"docs\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
    }

    #[test]
    fn test_name_validation() {
        assert!(validate_collection_name("docs_v2-en").is_ok());
        assert!(validate_collection_name("").unwrap_err().is_arg_error());
        assert!(validate_collection_name("docs; DROP TABLE x").is_err());
        assert!(validate_collection_name(&"a".repeat(MAX_NAME_LEN + 1)).is_err());
    }

    #[test]
    fn test_missing_dimension() {
        let err = CollectionSchema::new("vecs", "docs", 0).unwrap_err();
        assert!(err.is_arg_error());
        assert!(CollectionSchema::new("vecs", "docs", MAX_DIMENSION + 1).is_err());
    }

    #[test]
    fn test_create_table_ddl() {
        let ddl = create_table_ddl(&docs());
        assert!(ddl.starts_with("CREATE TABLE IF NOT EXISTS \"vecs\".\"docs\" ("));
        assert!(ddl.contains("fragment_id UUID PRIMARY KEY"));
        assert!(ddl.contains("vector vector(3) NOT NULL"));
        assert!(ddl.contains("metadata JSONB NOT NULL DEFAULT '{}'::jsonb"));
        assert!(ddl.contains(
            "fts TSVECTOR GENERATED ALWAYS AS (to_tsvector('english'::regconfig, COALESCE(text, ''))) STORED"
        ));
        assert!(ddl.contains("    text TEXT,\n"));
    }

    #[test]
    fn test_auxiliary_indexes() {
        let ddl = auxiliary_index_ddl(&docs());
        assert_eq!(ddl.len(), 3);
        assert!(ddl[0].contains("USING GIN (metadata jsonb_path_ops)"));
        assert!(ddl[1].contains("\"ix_docs_fts\""));
        assert!(ddl[1].contains("USING GIN (fts)"));
    }

    #[test]
    fn test_collection_ddl_order() {
        let ddl = create_collection_ddl(&docs());
        assert!(ddl[0].starts_with("CREATE TABLE"));
        assert!(ddl[1..].iter().all(|s| s.starts_with("CREATE INDEX")));
    }

    #[test]
    fn test_text_search_config() {
        let schema = docs().with_text_search_config("simple").unwrap();
        assert!(create_table_ddl(&schema).contains("'simple'::regconfig"));
        assert!(docs().with_text_search_config("english'); --").is_err());
    }

    #[test]
    fn test_collection_dimension_from_catalog() {
        assert_eq!(collection_dimension("docs", "r", Some("vector"), Some(384)).unwrap(), 384);

        for (relkind, typname, typmod) in [
            ("r", Some("int4"), Some(-1)),
            ("r", None, None),
            ("r", Some("vector"), Some(-1)),
            ("v", Some("vector"), Some(3)),
            ("i", None, None),
        ] {
            let err = collection_dimension("docs", relkind, typname, typmod).unwrap_err();
            assert!(
                matches!(err, VecsError::Schema(SchemaError::NotACollection { .. })),
                "{} {:?} {:?} should not count as a collection",
                relkind,
                typname,
                typmod
            );
        }
    }

    #[test]
    fn test_drop_ddl() {
        assert_eq!(
            drop_collection_ddl("vecs", "docs"),
            "DROP TABLE IF EXISTS \"vecs\".\"docs\" CASCADE"
        );
    }
}
