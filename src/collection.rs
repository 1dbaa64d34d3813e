//! Record-level CRUD and similarity queries against one collection.

use crate::distance::DistanceMeasure;
use crate::error::{Result, VecsError};
use crate::filter::Filter;
use crate::hybrid::{HybridSearchEngine, HybridSearchResult, HybridSearchSettings};
use crate::index::{IndexArgs, IndexInfo, IndexManager, IndexMethod};
use crate::record::{DeletedFragment, Metadata, QueryOptions, QueryResult, Record, RecordRow};
use crate::retry::RetryPolicy;
use crate::schema::qualified_name;
use crate::vector::Vector;
use sqlx::types::Json;
use sqlx::{PgPool, Postgres, QueryBuilder};
use std::collections::HashMap;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Rows written per upsert transaction.
pub const UPSERT_CHUNK_SIZE: usize = 512;

/// Ids looked up per fetch statement.
pub const FETCH_CHUNK_SIZE: usize = 12;

/// Ids removed per delete statement.
pub const DELETE_CHUNK_SIZE: usize = 512;

const RECORD_COLUMNS: &str =
    "fragment_id, extraction_id, document_id, user_id, group_ids, vector::text AS vector, text, metadata";

const DELETED_COLUMNS: &str = "fragment_id, document_id, extraction_id, text";

/// A named vector space of fixed dimension.
#[derive(Debug, Clone)]
pub struct Collection {
    pool: PgPool,
    schema: String,
    name: String,
    dimension: usize,
    text_search_config: String,
    indexes: IndexManager,
}

#[derive(Debug, sqlx::FromRow)]
struct QueryRow {
    fragment_id: Uuid,
    extraction_id: Uuid,
    document_id: Uuid,
    user_id: Uuid,
    group_ids: Vec<Uuid>,
    text: Option<String>,
    distance: f64,
    metadata: Json<Metadata>,
}

impl Collection {
    pub(crate) fn new(
        pool: PgPool,
        schema: impl Into<String>,
        name: impl Into<String>,
        dimension: usize,
        retry: RetryPolicy,
    ) -> Self {
        let schema = schema.into();
        let name = name.into();
        let indexes = IndexManager::new(pool.clone(), schema.clone(), name.clone()).with_retry_policy(retry);
        Self {
            pool,
            schema,
            name,
            dimension,
            text_search_config: "english".to_string(),
            indexes,
        }
    }

    /// Must match the configuration the `fts` column was generated with.
    pub(crate) fn with_text_search_config(mut self, config: impl Into<String>) -> Self {
        self.text_search_config = config.into();
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn schema(&self) -> &str {
        &self.schema
    }

    pub fn dimension(&self) -> usize {
        self.dimension
    }

    pub fn text_search_config(&self) -> &str {
        &self.text_search_config
    }

    pub(crate) fn pool(&self) -> &PgPool {
        &self.pool
    }

    pub(crate) fn table(&self) -> String {
        qualified_name(&self.schema, &self.name)
    }

    pub fn indexes(&self) -> &IndexManager {
        &self.indexes
    }

    /// Number of stored fragments.
    pub async fn len(&self) -> Result<u64> {
        let count: i64 = sqlx::query_scalar(&format!("SELECT count(*) FROM {}", self.table()))
            .fetch_one(&self.pool)
            .await?;
        Ok(count.max(0) as u64)
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.len().await? == 0)
    }

    /// Insert or replace records keyed by `fragment_id`.
    ///
    /// Every vector is checked against the collection dimension before
    /// anything is written. Records are then written in chunks, one
    /// transaction per chunk. When the same id appears more than once the
    /// last occurrence wins.
    #[instrument(skip(self, records), fields(collection = %self.name, count = records.len()))]
    pub async fn upsert(&self, records: &[Record]) -> Result<()> {
        for record in records {
            record.vector.check_dimension(self.dimension)?;
        }
        let records = last_write_wins(records);

        for (i, chunk) in records.chunks(UPSERT_CHUNK_SIZE).enumerate() {
            let mut qb = upsert_query(&self.table(), chunk);
            let mut tx = self.pool.begin().await?;
            qb.build().execute(&mut *tx).await?;
            tx.commit().await?;
            debug!(chunk = i, rows = chunk.len(), "upserted chunk");
        }
        Ok(())
    }

    /// Records for the given ids, in no particular order. Unknown ids are skipped.
    #[instrument(skip(self, fragment_ids), fields(collection = %self.name, count = fragment_ids.len()))]
    pub async fn fetch(&self, fragment_ids: &[Uuid]) -> Result<Vec<Record>> {
        let sql = format!(
            "SELECT {} FROM {} WHERE fragment_id = ANY($1)",
            RECORD_COLUMNS,
            self.table()
        );
        let mut records = Vec::with_capacity(fragment_ids.len());
        for chunk in fragment_ids.chunks(FETCH_CHUNK_SIZE) {
            let rows: Vec<RecordRow> = sqlx::query_as(&sql)
                .bind(chunk.to_vec())
                .fetch_all(&self.pool)
                .await?;
            for row in rows {
                records.push(Record::try_from(row)?);
            }
        }
        Ok(records)
    }

    /// Delete by ids or by filter; exactly one selector must be given.
    ///
    /// Returns what each removed row looked like so callers can reconcile
    /// whatever they derived from it.
    #[instrument(skip(self, fragment_ids, filters), fields(collection = %self.name))]
    pub async fn delete(
        &self,
        fragment_ids: Option<&[Uuid]>,
        filters: Option<&Filter>,
    ) -> Result<HashMap<Uuid, DeletedFragment>> {
        match (fragment_ids, filters) {
            (Some(ids), None) => self.delete_by_ids(ids).await,
            (None, Some(filter)) => self.delete_by_filter(filter).await,
            (Some(_), Some(_)) => Err(VecsError::arg("pass either fragment ids or filters to delete, not both")),
            (None, None) => Err(VecsError::arg("delete needs fragment ids or filters")),
        }
    }

    async fn delete_by_ids(&self, fragment_ids: &[Uuid]) -> Result<HashMap<Uuid, DeletedFragment>> {
        let sql = format!(
            "DELETE FROM {} WHERE fragment_id = ANY($1) RETURNING {}",
            self.table(),
            DELETED_COLUMNS
        );
        let mut deleted = HashMap::new();
        for chunk in fragment_ids.chunks(DELETE_CHUNK_SIZE) {
            let rows: Vec<DeletedFragment> = sqlx::query_as(&sql)
                .bind(chunk.to_vec())
                .fetch_all(&self.pool)
                .await?;
            deleted.extend(rows.into_iter().map(|row| (row.fragment_id, row)));
        }
        debug!(rows = deleted.len(), "deleted by id");
        Ok(deleted)
    }

    async fn delete_by_filter(&self, filter: &Filter) -> Result<HashMap<Uuid, DeletedFragment>> {
        if filter.matches_all() {
            return Err(VecsError::arg(
                "filter matches every record; drop the collection instead",
            ));
        }
        let mut qb = delete_query(&self.table(), filter);
        let rows: Vec<DeletedFragment> = qb.build_query_as().fetch_all(&self.pool).await?;
        debug!(rows = rows.len(), "deleted by filter");
        Ok(rows.into_iter().map(|row| (row.fragment_id, row)).collect())
    }

    /// Nearest neighbours of `vector` under `options.measure`.
    ///
    /// `probes` and `ef_search` are set for the executing transaction only.
    /// Without an index for the measure the store falls back to an exact
    /// scan, which is logged as a warning.
    #[instrument(skip(self, vector, options), fields(collection = %self.name, limit = options.limit))]
    pub async fn query(&self, vector: &Vector, options: &QueryOptions) -> Result<Vec<QueryResult>> {
        options.validate()?;
        vector.check_dimension(self.dimension)?;

        if !self.indexes.is_indexed_for(options.measure).await? {
            warn!(
                collection = %self.name,
                measure = %options.measure,
                "no index for measure, query will use an exact scan"
            );
        }

        let mut tx = self.pool.begin().await?;
        set_search_params(&mut tx, options.probes, options.ef_search).await?;
        let mut qb = similarity_query(
            &self.table(),
            vector,
            options.measure,
            options.filters.as_ref(),
            options.limit,
        );
        let rows: Vec<QueryRow> = qb.build_query_as().fetch_all(&mut *tx).await?;
        tx.commit().await?;

        Ok(rows
            .into_iter()
            .map(|row| QueryResult {
                fragment_id: row.fragment_id,
                extraction_id: row.extraction_id,
                document_id: row.document_id,
                user_id: row.user_id,
                group_ids: row.group_ids,
                text: row.text,
                score: options.include_value.then(|| options.measure.score(row.distance)),
                metadata: options.include_metadata.then_some(row.metadata.0),
            })
            .collect())
    }

    /// Fused lexical and semantic ranking; see [`HybridSearchEngine`].
    pub async fn search(
        &self,
        text: &str,
        vector: &Vector,
        limit: usize,
        settings: &HybridSearchSettings,
        filters: Option<&Filter>,
    ) -> Result<Vec<HybridSearchResult>> {
        HybridSearchEngine::new(self)
            .search(text, vector, limit, settings, filters)
            .await
    }

    pub async fn create_index(
        &self,
        measure: DistanceMeasure,
        method: IndexMethod,
        build_args: Option<IndexArgs>,
        replace: bool,
    ) -> Result<IndexInfo> {
        self.indexes.create_index(measure, method, build_args, replace).await
    }

    pub async fn drop_index(&self) -> Result<()> {
        self.indexes.drop_index().await
    }

    pub async fn is_indexed_for(&self, measure: DistanceMeasure) -> Result<bool> {
        self.indexes.is_indexed_for(measure).await
    }

    /// The active ANN index, if any.
    pub async fn index(&self) -> Result<Option<IndexInfo>> {
        self.indexes.current().await
    }
}

/// Scope ANN tuning to the current transaction.
pub(crate) async fn set_search_params(
    tx: &mut sqlx::Transaction<'_, Postgres>,
    probes: u32,
    ef_search: u32,
) -> Result<()> {
    sqlx::query("SELECT set_config('ivfflat.probes', $1, true), set_config('hnsw.ef_search', $2, true)")
        .bind(probes.to_string())
        .bind(ef_search.to_string())
        .execute(&mut **tx)
        .await?;
    Ok(())
}

/// Keep the last occurrence of each fragment id, in first-seen order.
/// A single INSERT .. ON CONFLICT cannot touch the same row twice.
fn last_write_wins(records: &[Record]) -> Vec<&Record> {
    let mut position: HashMap<Uuid, usize> = HashMap::with_capacity(records.len());
    let mut out: Vec<&Record> = Vec::with_capacity(records.len());
    for record in records {
        match position.get(&record.fragment_id) {
            Some(&i) => out[i] = record,
            None => {
                position.insert(record.fragment_id, out.len());
                out.push(record);
            }
        }
    }
    out
}

fn upsert_query<'a>(table: &str, chunk: &[&'a Record]) -> QueryBuilder<'a, Postgres> {
    let mut qb = QueryBuilder::new(format!(
        "INSERT INTO {} (fragment_id, extraction_id, document_id, user_id, group_ids, vector, text, metadata) ",
        table
    ));
    qb.push_values(chunk.iter().copied(), |mut row, record| {
        row.push_bind(record.fragment_id)
            .push_bind(record.extraction_id)
            .push_bind(record.document_id)
            .push_bind(record.user_id)
            .push_bind(record.group_ids.clone())
            .push_bind(record.vector.to_pg_literal())
            .push_unseparated("::vector")
            .push_bind(record.text.clone())
            .push_bind(Json(record.metadata.clone()));
    });
    qb.push(
        " ON CONFLICT (fragment_id) DO UPDATE SET \
         extraction_id = EXCLUDED.extraction_id, \
         document_id = EXCLUDED.document_id, \
         user_id = EXCLUDED.user_id, \
         group_ids = EXCLUDED.group_ids, \
         vector = EXCLUDED.vector, \
         text = EXCLUDED.text, \
         metadata = EXCLUDED.metadata",
    );
    qb
}

fn delete_query<'a>(table: &str, filter: &Filter) -> QueryBuilder<'a, Postgres> {
    let mut qb = QueryBuilder::new(format!("DELETE FROM {} WHERE ", table));
    filter.push_sql(&mut qb);
    qb.push(format!(" RETURNING {}", DELETED_COLUMNS));
    qb
}

fn similarity_query<'a>(
    table: &str,
    vector: &Vector,
    measure: DistanceMeasure,
    filter: Option<&Filter>,
    limit: usize,
) -> QueryBuilder<'a, Postgres> {
    let literal = vector.to_pg_literal();
    let op = measure.operator();

    let mut qb = QueryBuilder::new(
        "SELECT fragment_id, extraction_id, document_id, user_id, group_ids, text, metadata, (vector ",
    );
    qb.push(op);
    qb.push(" ");
    qb.push_bind(literal.clone());
    qb.push(format!("::vector) AS distance FROM {} WHERE ", table));
    match filter {
        Some(filter) => filter.push_sql(&mut qb),
        None => {
            qb.push("TRUE");
        }
    }
    qb.push(format!(" ORDER BY vector {} ", op));
    qb.push_bind(literal);
    qb.push("::vector LIMIT ");
    qb.push_bind(limit as i64);
    qb
}
