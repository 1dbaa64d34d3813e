//! ANN index lifecycle for one collection.
//!
//! A collection has zero or one ANN index. Builds and drops take a
//! collection-scoped advisory lock inside their transaction and are retried with backoff when Postgres reports a
//! concurrent catalog update.

use crate::distance::DistanceMeasure;
use crate::error::{IndexBuildError, Result, VecsError};
use crate::retry::{retry_with_backoff, RetryError, RetryPolicy};
use crate::schema::{advisory_key, qualified_name, quote_ident};
use serde::{Deserialize, Serialize};
use sqlx::{Connection, PgConnection, PgPool};
use std::fmt;
use std::str::FromStr;
use tracing::{debug, info, instrument};

/// First pgvector release shipping HNSW.
const HNSW_MIN_VERSION: (u32, u32, u32) = (0, 5, 0);

/// Index method. `Auto` picks HNSW when the engine has it, IVFFlat otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IndexMethod {
    #[default]
    Auto,
    #[serde(rename = "ivfflat")]
    IvfFlat,
    Hnsw,
}

impl IndexMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            IndexMethod::Auto => "auto",
            IndexMethod::IvfFlat => "ivfflat",
            IndexMethod::Hnsw => "hnsw",
        }
    }
}

impl fmt::Display for IndexMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for IndexMethod {
    type Err = VecsError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "auto" => Ok(IndexMethod::Auto),
            "ivfflat" => Ok(IndexMethod::IvfFlat),
            "hnsw" => Ok(IndexMethod::Hnsw),
            other => Err(VecsError::arg(format!("unknown index method: {}", other))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IvfFlatArgs {
    pub n_lists: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HnswArgs {
    pub m: u32,
    pub ef_construction: u32,
}

impl Default for HnswArgs {
    fn default() -> Self {
        Self {
            m: 16,
            ef_construction: 64,
        }
    }
}

/// Method-specific build parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum IndexArgs {
    #[serde(rename = "ivfflat")]
    IvfFlat(IvfFlatArgs),
    Hnsw(HnswArgs),
}

impl IndexArgs {
    pub fn method(&self) -> IndexMethod {
        match self {
            IndexArgs::IvfFlat(_) => IndexMethod::IvfFlat,
            IndexArgs::Hnsw(_) => IndexMethod::Hnsw,
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            IndexArgs::IvfFlat(args) => {
                if !(1..=32_768).contains(&args.n_lists) {
                    return Err(VecsError::arg(format!(
                        "n_lists must be in 1..=32768, got {}",
                        args.n_lists
                    )));
                }
            }
            IndexArgs::Hnsw(args) => {
                if !(2..=100).contains(&args.m) {
                    return Err(VecsError::arg(format!("m must be in 2..=100, got {}", args.m)));
                }
                if !(4..=1000).contains(&args.ef_construction) || args.ef_construction < 2 * args.m {
                    return Err(VecsError::arg(format!(
                        "ef_construction must be in 4..=1000 and >= 2 * m, got {}",
                        args.ef_construction
                    )));
                }
            }
        }
        Ok(())
    }

    fn with_clause(&self) -> String {
        match self {
            IndexArgs::IvfFlat(args) => format!("WITH (lists = {})", args.n_lists),
            IndexArgs::Hnsw(args) => format!(
                "WITH (m = {}, ef_construction = {})",
                args.m, args.ef_construction
            ),
        }
    }
}

/// The active ANN index of a collection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexInfo {
    pub name: String,
    pub method: IndexMethod,
    pub measure: DistanceMeasure,
}

/// Checks that need no store access: explicit parameters need an explicit,
/// matching method.
pub fn validate_build_args(method: IndexMethod, args: Option<&IndexArgs>) -> Result<()> {
    let Some(args) = args else {
        return Ok(());
    };
    if method == IndexMethod::Auto {
        return Err(VecsError::arg(
            "build_args require an explicit index method, not auto",
        ));
    }
    if args.method() != method {
        return Err(VecsError::arg(format!(
            "build_args for {} do not match index method {}",
            args.method(),
            method
        )));
    }
    args.validate()
}

/// Pick the concrete method given what the engine supports.
pub fn resolve_method(method: IndexMethod, hnsw_supported: bool) -> Result<IndexMethod> {
    match method {
        IndexMethod::Auto if hnsw_supported => Ok(IndexMethod::Hnsw),
        IndexMethod::Auto => Ok(IndexMethod::IvfFlat),
        IndexMethod::Hnsw if !hnsw_supported => Err(VecsError::arg(
            "hnsw requested but the installed pgvector does not support it",
        )),
        other => Ok(other),
    }
}

/// IVFFlat list count for a table of `row_count` rows.
pub fn default_n_lists(row_count: u64) -> u32 {
    let lists = if row_count < 1_000_000 {
        (row_count / 1000).max(30)
    } else {
        (row_count as f64).sqrt() as u64
    };
    lists.min(32_768) as u32
}

/// Whether a pgvector `extversion` string includes HNSW.
pub fn version_supports_hnsw(version: &str) -> bool {
    let mut parts = version
        .split(|c: char| c == '.' || c == '-')
        .map(|p| p.parse::<u32>().unwrap_or(0));
    let parsed = (
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
        parts.next().unwrap_or(0),
    );
    parsed >= HNSW_MIN_VERSION
}

/// Errors Postgres raises when concurrent DDL touches the same catalog rows.
pub fn is_transient_catalog_error(err: &VecsError) -> bool {
    let VecsError::Database(sqlx::Error::Database(db)) = err else {
        return false;
    };
    if matches!(db.code().as_deref(), Some("40001") | Some("40P01")) {
        return true;
    }
    let message = db.message();
    message.contains("tuple concurrently updated")
        || message.contains("tuple concurrently deleted")
        || message.contains("pg_class_relname_nsp_index")
}

fn measure_tag(measure: DistanceMeasure) -> &'static str {
    match measure {
        DistanceMeasure::Cosine => "cos",
        DistanceMeasure::L2 => "l2",
        DistanceMeasure::InnerProduct => "ip",
    }
}

pub fn index_name(collection: &str, method: IndexMethod, measure: DistanceMeasure) -> String {
    format!("ix_{}_{}_{}", collection, method, measure_tag(measure))
}

pub fn create_index_ddl(
    schema: &str,
    collection: &str,
    measure: DistanceMeasure,
    args: &IndexArgs,
) -> String {
    format!(
        "CREATE INDEX {} ON {} USING {} (vector {}) {}",
        quote_ident(&index_name(collection, args.method(), measure)),
        qualified_name(schema, collection),
        args.method(),
        measure.opclass(),
        args.with_clause()
    )
}

#[derive(Debug, sqlx::FromRow)]
struct IndexRow {
    name: String,
    method: String,
    opclass: String,
}

const ANN_INDEX_QUERY: &str = r#"
    SELECT ic.relname::text AS name, am.amname::text AS method, opc.opcname::text AS opclass
    FROM pg_index i
    JOIN pg_class ic ON ic.oid = i.indexrelid
    JOIN pg_class tc ON tc.oid = i.indrelid
    JOIN pg_namespace n ON n.oid = tc.relnamespace
    JOIN pg_am am ON am.oid = ic.relam
    JOIN pg_opclass opc ON opc.oid = i.indclass[0]
    WHERE n.nspname = $1 AND tc.relname = $2 AND am.amname IN ('ivfflat', 'hnsw')
    ORDER BY ic.relname
"#;

async fn ann_indexes(conn: &mut PgConnection, schema: &str, name: &str) -> Result<Vec<IndexRow>> {
    let rows = sqlx::query_as::<_, IndexRow>(ANN_INDEX_QUERY)
        .bind(schema)
        .bind(name)
        .fetch_all(conn)
        .await?;
    Ok(rows)
}

fn to_info(row: IndexRow) -> Option<IndexInfo> {
    Some(IndexInfo {
        method: row.method.parse().ok()?,
        measure: DistanceMeasure::from_opclass(&row.opclass)?,
        name: row.name,
    })
}

/// Creates, inspects and drops the ANN index of one collection.
#[derive(Debug, Clone)]
pub struct IndexManager {
    pool: PgPool,
    schema: String,
    collection: String,
    retry: RetryPolicy,
}

impl IndexManager {
    pub fn new(pool: PgPool, schema: impl Into<String>, collection: impl Into<String>) -> Self {
        Self {
            pool,
            schema: schema.into(),
            collection: collection.into(),
            retry: RetryPolicy::default(),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Whether the installed pgvector provides HNSW.
    pub async fn engine_supports_hnsw(&self) -> Result<bool> {
        let version: Option<String> =
            sqlx::query_scalar("SELECT extversion FROM pg_extension WHERE extname = 'vector'")
                .fetch_optional(&self.pool)
                .await?;
        Ok(version.as_deref().map(version_supports_hnsw).unwrap_or(false))
    }

    /// The active ANN index, if any.
    pub async fn current(&self) -> Result<Option<IndexInfo>> {
        let mut conn = self.pool.acquire().await?;
        let rows = ann_indexes(&mut conn, &self.schema, &self.collection).await?;
        Ok(rows.into_iter().find_map(to_info))
    }

    /// Whether an ANN index can serve queries ordered by `measure`.
    pub async fn is_indexed_for(&self, measure: DistanceMeasure) -> Result<bool> {
        Ok(self
            .current()
            .await?
            .map(|info| info.measure == measure)
            .unwrap_or(false))
    }

    /// Build an ANN index for `measure`.
    ///
    /// With `replace`, an existing index is dropped in the same transaction
    /// that builds the new one. If that build fails the transaction rolls
    /// back and the old index stays in place and keeps serving queries; the
    /// collection only ends up without an index when a first build fails.
    /// Without `replace`, an existing index is an argument error.
    #[instrument(skip(self, build_args), fields(collection = %self.collection))]
    pub async fn create_index(
        &self,
        measure: DistanceMeasure,
        method: IndexMethod,
        build_args: Option<IndexArgs>,
        replace: bool,
    ) -> Result<IndexInfo> {
        validate_build_args(method, build_args.as_ref())?;
        let method = resolve_method(method, self.engine_supports_hnsw().await?)?;

        let args = match build_args {
            Some(args) => args,
            None if method == IndexMethod::Hnsw => IndexArgs::Hnsw(HnswArgs::default()),
            None => IndexArgs::IvfFlat(IvfFlatArgs {
                n_lists: default_n_lists(self.row_count().await?),
            }),
        };
        let create = create_index_ddl(&self.schema, &self.collection, measure, &args);
        debug!(sql = %create, "planned index build");

        let outcome = retry_with_backoff(&self.retry, is_transient_catalog_error, |attempt| {
            let create = &create;
            async move {
                debug!(attempt, "attempting index build");
                self.build_locked(create, replace).await
            }
        })
        .await;

        match outcome {
            Ok(()) => {
                let info = IndexInfo {
                    name: index_name(&self.collection, method, measure),
                    method,
                    measure,
                };
                info!(index = %info.name, method = %method, measure = %measure, "built index");
                Ok(info)
            }
            Err(RetryError::Fatal(err)) => Err(err),
            Err(RetryError::Exhausted { attempts, last }) => Err(IndexBuildError::RetriesExhausted {
                collection: self.collection.clone(),
                attempts,
                last_error: last.to_string(),
            }
            .into()),
        }
    }

    /// Remove the ANN index. Does nothing if there is none.
    #[instrument(skip(self), fields(collection = %self.collection))]
    pub async fn drop_index(&self) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        let mut tx = conn.begin().await?;
        lock_for_ddl(&mut tx, self).await?;
        drop_all(&mut tx, self).await?;
        tx.commit().await?;
        Ok(())
    }

    async fn row_count(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(&format!(
            "SELECT count(*) FROM {}",
            qualified_name(&self.schema, &self.collection)
        ))
        .fetch_one(&self.pool)
        .await?;
        Ok(count.max(0) as u64)
    }

    async fn build_locked(&self, create: &str, replace: bool) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        build(&mut conn, self, create, replace).await
    }
}

/// Key of the advisory lock serializing index DDL on one collection.
pub(crate) fn index_lock_key(schema: &str, collection: &str) -> String {
    advisory_key(schema, collection, "index")
}

/// Held until the enclosing transaction commits or rolls back.
async fn lock_for_ddl(conn: &mut PgConnection, manager: &IndexManager) -> Result<()> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1))")
        .bind(index_lock_key(&manager.schema, &manager.collection))
        .execute(conn)
        .await?;
    Ok(())
}

async fn build(conn: &mut PgConnection, manager: &IndexManager, create: &str, replace: bool) -> Result<()> {
    let mut tx = conn.begin().await?;
    lock_for_ddl(&mut tx, manager).await?;

    let existing = ann_indexes(&mut tx, &manager.schema, &manager.collection).await?;
    if !existing.is_empty() && !replace {
        return Err(VecsError::arg(format!(
            "collection {} already has index {}; pass replace to rebuild it",
            manager.collection, existing[0].name
        )));
    }

    for row in &existing {
        sqlx::query(&format!(
            "DROP INDEX IF EXISTS {}",
            qualified_name(&manager.schema, &row.name)
        ))
        .execute(&mut *tx)
        .await?;
    }
    sqlx::query(create).execute(&mut *tx).await?;
    tx.commit().await?;
    Ok(())
}

async fn drop_all(conn: &mut PgConnection, manager: &IndexManager) -> Result<()> {
    let existing = ann_indexes(conn, &manager.schema, &manager.collection).await?;
    for row in existing {
        sqlx::query(&format!(
            "DROP INDEX IF EXISTS {}",
            qualified_name(&manager.schema, &row.name)
        ))
        .execute(&mut *conn)
        .await?;
        info!(index = %row.name, "dropped index");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ivfflat(n_lists: u32) -> IndexArgs {
        IndexArgs::IvfFlat(IvfFlatArgs { n_lists })
    }

    #[test]
    fn test_auto_resolution() {
        assert_eq!(resolve_method(IndexMethod::Auto, true).unwrap(), IndexMethod::Hnsw);
        assert_eq!(resolve_method(IndexMethod::Auto, false).unwrap(), IndexMethod::IvfFlat);
        assert_eq!(resolve_method(IndexMethod::IvfFlat, true).unwrap(), IndexMethod::IvfFlat);
    }

    #[test]
    fn test_hnsw_unsupported_is_arg_error() {
        assert!(resolve_method(IndexMethod::Hnsw, false).unwrap_err().is_arg_error());
    }

    #[test]
    fn test_mismatched_build_args() {
        let err = validate_build_args(IndexMethod::Hnsw, Some(&ivfflat(100))).unwrap_err();
        assert!(err.is_arg_error());
        let err = validate_build_args(
            IndexMethod::IvfFlat,
            Some(&IndexArgs::Hnsw(HnswArgs::default())),
        )
        .unwrap_err();
        assert!(err.is_arg_error());
    }

    #[test]
    fn test_build_args_need_explicit_method() {
        let err = validate_build_args(IndexMethod::Auto, Some(&ivfflat(100))).unwrap_err();
        assert!(err.is_arg_error());
        assert!(validate_build_args(IndexMethod::Auto, None).is_ok());
        assert!(validate_build_args(IndexMethod::IvfFlat, Some(&ivfflat(100))).is_ok());
    }

    #[test]
    fn test_build_args_ranges() {
        assert!(validate_build_args(IndexMethod::IvfFlat, Some(&ivfflat(0))).is_err());
        let weak = IndexArgs::Hnsw(HnswArgs {
            m: 32,
            ef_construction: 40,
        });
        assert!(validate_build_args(IndexMethod::Hnsw, Some(&weak)).is_err());
    }

    #[test]
    fn test_default_n_lists() {
        assert_eq!(default_n_lists(0), 30);
        assert_eq!(default_n_lists(29_999), 30);
        assert_eq!(default_n_lists(120_000), 120);
        assert_eq!(default_n_lists(999_999), 999);
        assert_eq!(default_n_lists(1_000_000), 1000);
        assert_eq!(default_n_lists(4_000_000), 2000);
    }

    #[test]
    fn test_version_supports_hnsw() {
        assert!(!version_supports_hnsw("0.4.4"));
        assert!(version_supports_hnsw("0.5.0"));
        assert!(version_supports_hnsw("0.7.4"));
        assert!(version_supports_hnsw("1.0"));
    }

    #[test]
    fn test_create_index_ddl() {
        let ddl = create_index_ddl("vecs", "docs", DistanceMeasure::Cosine, &ivfflat(30));
        assert_eq!(
            ddl,
            "CREATE INDEX \"ix_docs_ivfflat_cos\" ON \"vecs\".\"docs\" USING ivfflat (vector vector_cosine_ops) WITH (lists = 30)"
        );
        let ddl = create_index_ddl(
            "vecs",
            "docs",
            DistanceMeasure::InnerProduct,
            &IndexArgs::Hnsw(HnswArgs::default()),
        );
        assert!(ddl.contains("USING hnsw (vector vector_ip_ops) WITH (m = 16, ef_construction = 64)"));
    }

    #[test]
    fn test_index_name_fits_identifier_limit() {
        let name = "n".repeat(crate::schema::MAX_NAME_LEN);
        assert!(index_name(&name, IndexMethod::IvfFlat, DistanceMeasure::InnerProduct).len() <= 63);
    }

    #[test]
    fn test_non_database_errors_are_not_transient() {
        assert!(!is_transient_catalog_error(&VecsError::arg("x")));
        assert!(!is_transient_catalog_error(&VecsError::Database(sqlx::Error::RowNotFound)));
    }

    #[derive(Debug)]
    struct PgError {
        code: &'static str,
        message: &'static str,
    }

    impl fmt::Display for PgError {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            write!(f, "{}", self.message)
        }
    }

    impl std::error::Error for PgError {}

    impl sqlx::error::DatabaseError for PgError {
        fn message(&self) -> &str {
            self.message
        }

        fn code(&self) -> Option<std::borrow::Cow<'_, str>> {
            Some(self.code.into())
        }

        fn as_error(&self) -> &(dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn as_error_mut(&mut self) -> &mut (dyn std::error::Error + Send + Sync + 'static) {
            self
        }

        fn into_error(self: Box<Self>) -> Box<dyn std::error::Error + Send + Sync + 'static> {
            self
        }

        fn kind(&self) -> sqlx::error::ErrorKind {
            sqlx::error::ErrorKind::Other
        }
    }

    fn db_error(code: &'static str, message: &'static str) -> VecsError {
        VecsError::Database(sqlx::Error::Database(Box::new(PgError { code, message })))
    }

    #[test]
    fn test_catalog_races_are_transient() {
        assert!(is_transient_catalog_error(&db_error("40001", "could not serialize access")));
        assert!(is_transient_catalog_error(&db_error("40P01", "deadlock detected")));
        assert!(is_transient_catalog_error(&db_error("XX000", "tuple concurrently updated")));
        assert!(is_transient_catalog_error(&db_error("XX000", "tuple concurrently deleted")));
        assert!(is_transient_catalog_error(&db_error(
            "23505",
            "duplicate key value violates unique constraint \"pg_class_relname_nsp_index\""
        )));
    }

    #[test]
    fn test_other_database_errors_are_fatal() {
        assert!(!is_transient_catalog_error(&db_error("42P01", "relation does not exist")));
        assert!(!is_transient_catalog_error(&db_error(
            "23505",
            "duplicate key value violates unique constraint \"docs_pkey\""
        )));
    }

    #[test]
    fn test_index_lock_key_is_collection_scoped() {
        assert_eq!(index_lock_key("vecs", "docs"), advisory_key("vecs", "docs", "index"));
        assert_ne!(index_lock_key("vecs", "docs"), index_lock_key("vecs", "other"));
        assert_ne!(index_lock_key("vecs", "docs"), advisory_key("vecs", "docs", "schema"));
    }

    #[test]
    fn test_index_args_serde() {
        let args: IndexArgs =
            serde_json::from_str(r#"{"method": "hnsw", "m": 8, "ef_construction": 32}"#).unwrap();
        assert_eq!(
            args,
            IndexArgs::Hnsw(HnswArgs {
                m: 8,
                ef_construction: 32
            })
        );
    }
}
