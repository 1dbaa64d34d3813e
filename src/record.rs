//! Stored fragments and the projections returned by reads

use crate::distance::DistanceMeasure;
use crate::error::{Result, VecsError};
use crate::filter::Filter;
use crate::vector::Vector;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

/// Open key/value metadata attached to a fragment. Always a JSON object.
pub type Metadata = Map<String, Value>;

/// One stored vector fragment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub fragment_id: Uuid,
    pub extraction_id: Uuid,
    pub document_id: Uuid,
    pub user_id: Uuid,
    #[serde(default)]
    pub group_ids: Vec<Uuid>,
    pub vector: Vector,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Record {
    /// Create a record with a fresh fragment id and no groups, text or metadata.
    pub fn new(extraction_id: Uuid, document_id: Uuid, user_id: Uuid, vector: Vector) -> Self {
        Self {
            fragment_id: Uuid::new_v4(),
            extraction_id,
            document_id,
            user_id,
            group_ids: Vec::new(),
            vector,
            text: None,
            metadata: Metadata::new(),
        }
    }

    pub fn with_fragment_id(mut self, fragment_id: Uuid) -> Self {
        self.fragment_id = fragment_id;
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_metadata(mut self, metadata: Metadata) -> Self {
        self.metadata = metadata;
        self
    }

    pub fn with_group_ids(mut self, group_ids: Vec<Uuid>) -> Self {
        self.group_ids = group_ids;
        self
    }
}

/// Raw row shape; the vector column is selected as `vector::text`.
#[derive(Debug, sqlx::FromRow)]
pub(crate) struct RecordRow {
    pub fragment_id: Uuid,
    pub extraction_id: Uuid,
    pub document_id: Uuid,
    pub user_id: Uuid,
    pub group_ids: Vec<Uuid>,
    pub vector: String,
    pub text: Option<String>,
    pub metadata: sqlx::types::Json<Metadata>,
}

impl TryFrom<RecordRow> for Record {
    type Error = VecsError;

    fn try_from(row: RecordRow) -> Result<Self> {
        Ok(Record {
            fragment_id: row.fragment_id,
            extraction_id: row.extraction_id,
            document_id: row.document_id,
            user_id: row.user_id,
            group_ids: row.group_ids,
            vector: Vector::from_pg_literal(&row.vector)?,
            text: row.text,
            metadata: row.metadata.0,
        })
    }
}

/// What `delete` reports for every removed row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct DeletedFragment {
    pub fragment_id: Uuid,
    pub document_id: Uuid,
    pub extraction_id: Uuid,
    pub text: Option<String>,
}

/// A single row returned by a similarity query.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueryResult {
    pub fragment_id: Uuid,
    pub extraction_id: Uuid,
    pub document_id: Uuid,
    pub user_id: Uuid,
    pub group_ids: Vec<Uuid>,
    pub text: Option<String>,
    /// `1 - distance` for cosine, the raw distance otherwise. Set when `include_value`.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Metadata>,
}

/// Hard cap on `limit` for raw similarity queries.
pub const MAX_QUERY_LIMIT: usize = 1000;

/// Parameters of `Collection::query`.
#[derive(Debug, Clone)]
pub struct QueryOptions {
    pub filters: Option<Filter>,
    pub measure: DistanceMeasure,
    pub limit: usize,
    pub include_value: bool,
    pub include_metadata: bool,
    /// IVFFlat lists probed; applies to the executing transaction only.
    pub probes: u32,
    /// HNSW candidate list size; applies to the executing transaction only.
    pub ef_search: u32,
}

impl Default for QueryOptions {
    fn default() -> Self {
        Self {
            filters: None,
            measure: DistanceMeasure::Cosine,
            limit: 10,
            include_value: false,
            include_metadata: false,
            probes: 10,
            ef_search: 40,
        }
    }
}

impl QueryOptions {
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = limit;
        self
    }

    pub fn with_measure(mut self, measure: DistanceMeasure) -> Self {
        self.measure = measure;
        self
    }

    pub fn with_filters(mut self, filters: Filter) -> Self {
        self.filters = Some(filters);
        self
    }

    pub fn include_value(mut self, include: bool) -> Self {
        self.include_value = include;
        self
    }

    pub fn include_metadata(mut self, include: bool) -> Self {
        self.include_metadata = include;
        self
    }

    pub fn with_probes(mut self, probes: u32) -> Self {
        self.probes = probes;
        self
    }

    pub fn with_ef_search(mut self, ef_search: u32) -> Self {
        self.ef_search = ef_search;
        self
    }

    /// Checks that need no round trip to the store.
    pub fn validate(&self) -> Result<()> {
        if self.limit > MAX_QUERY_LIMIT {
            return Err(VecsError::arg(format!(
                "limit must be <= {}, got {}",
                MAX_QUERY_LIMIT, self.limit
            )));
        }
        if self.probes == 0 {
            return Err(VecsError::arg("probes must be >= 1"));
        }
        if !(1..=1000).contains(&self.ef_search) {
            return Err(VecsError::arg(format!(
                "ef_search must be in 1..=1000, got {}",
                self.ef_search
            )));
        }
        Ok(())
    }
}
