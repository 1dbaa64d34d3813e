//! Hybrid search: reciprocal rank fusion of a lexical and a semantic ranking.
//!
//! Both rankings are computed independently in the store, restricted to the
//! same filter, and fused here. Each list contributes
//! `weight / (rrf_k + rank)` for every candidate it contains (1-based rank),
//! nothing for candidates it lacks.

use crate::collection::{set_search_params, Collection};
use crate::distance::DistanceMeasure;
use crate::error::{Result, VecsError};
use crate::filter::Filter;
use crate::record::{Metadata, MAX_QUERY_LIMIT};
use crate::vector::Vector;
use serde::{Deserialize, Serialize};
use sqlx::types::Json;
use sqlx::{Postgres, QueryBuilder};
use std::cmp::Ordering;
use std::collections::HashMap;
use tracing::{debug, instrument, warn};
use uuid::Uuid;

/// Candidates pulled from each ranking are `min(limit, MAX_CANDIDATE_LIMIT) * 2`.
pub const MAX_CANDIDATE_LIMIT: usize = 30;

/// Fusion weights and query-time tuning for [`HybridSearchEngine::search`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HybridSearchSettings {
    pub full_text_weight: f64,
    pub semantic_weight: f64,
    pub rrf_k: u32,
    pub measure: DistanceMeasure,
    pub probes: u32,
    pub ef_search: u32,
}

impl Default for HybridSearchSettings {
    fn default() -> Self {
        Self {
            full_text_weight: 1.0,
            semantic_weight: 5.0,
            rrf_k: 50,
            measure: DistanceMeasure::Cosine,
            probes: 10,
            ef_search: 40,
        }
    }
}

impl HybridSearchSettings {
    pub fn with_weights(mut self, full_text_weight: f64, semantic_weight: f64) -> Self {
        self.full_text_weight = full_text_weight;
        self.semantic_weight = semantic_weight;
        self
    }

    pub fn with_rrf_k(mut self, rrf_k: u32) -> Self {
        self.rrf_k = rrf_k;
        self
    }

    pub fn with_measure(mut self, measure: DistanceMeasure) -> Self {
        self.measure = measure;
        self
    }

    pub fn validate(&self) -> Result<()> {
        for (name, weight) in [
            ("full_text_weight", self.full_text_weight),
            ("semantic_weight", self.semantic_weight),
        ] {
            if !weight.is_finite() || weight < 0.0 {
                return Err(VecsError::arg(format!(
                    "{} must be a finite, non-negative number, got {}",
                    name, weight
                )));
            }
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

/// One fused candidate, before its row is loaded.
#[derive(Debug, Clone, PartialEq)]
pub struct FusedCandidate {
    pub fragment_id: Uuid,
    pub score: f64,
    pub lexical_rank: Option<usize>,
    pub semantic_rank: Option<usize>,
}

/// A row of a hybrid search, in fused order.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HybridSearchResult {
    pub fragment_id: Uuid,
    pub extraction_id: Uuid,
    pub document_id: Uuid,
    pub user_id: Uuid,
    pub group_ids: Vec<Uuid>,
    pub text: Option<String>,
    pub metadata: Metadata,
    pub score: f64,
    pub lexical_rank: Option<usize>,
    pub semantic_rank: Option<usize>,
}

/// Number of candidates pulled from each ranking for a given `limit`.
pub fn candidate_count(limit: usize) -> usize {
    limit.min(MAX_CANDIDATE_LIMIT) * 2
}

/// Reciprocal rank fusion of two ranked id lists.
///
/// Ties are broken by semantic rank, then lexical rank (absent ranks last),
/// then id, so a zero weight on either side reproduces the other side's order.
pub fn rrf_fuse(
    lexical: &[Uuid],
    semantic: &[Uuid],
    full_text_weight: f64,
    semantic_weight: f64,
    rrf_k: f64,
    limit: usize,
) -> Vec<FusedCandidate> {
    let mut fused: HashMap<Uuid, FusedCandidate> = HashMap::with_capacity(lexical.len() + semantic.len());

    for (i, id) in lexical.iter().enumerate() {
        let entry = fused.entry(*id).or_insert_with(|| empty_candidate(*id));
        if entry.lexical_rank.is_none() {
            let rank = i + 1;
            entry.lexical_rank = Some(rank);
            entry.score += full_text_weight / (rrf_k + rank as f64);
        }
    }
    for (i, id) in semantic.iter().enumerate() {
        let entry = fused.entry(*id).or_insert_with(|| empty_candidate(*id));
        if entry.semantic_rank.is_none() {
            let rank = i + 1;
            entry.semantic_rank = Some(rank);
            entry.score += semantic_weight / (rrf_k + rank as f64);
        }
    }

    let mut results: Vec<FusedCandidate> = fused.into_values().collect();
    results.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| rank_order(a.semantic_rank, b.semantic_rank))
            .then_with(|| rank_order(a.lexical_rank, b.lexical_rank))
            .then_with(|| a.fragment_id.cmp(&b.fragment_id))
    });
    results.truncate(limit);
    results
}

fn empty_candidate(fragment_id: Uuid) -> FusedCandidate {
    FusedCandidate {
        fragment_id,
        score: 0.0,
        lexical_rank: None,
        semantic_rank: None,
    }
}

fn rank_order(a: Option<usize>, b: Option<usize>) -> Ordering {
    match (a, b) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
}

#[derive(Debug, sqlx::FromRow)]
struct HitRow {
    fragment_id: Uuid,
    extraction_id: Uuid,
    document_id: Uuid,
    user_id: Uuid,
    group_ids: Vec<Uuid>,
    text: Option<String>,
    metadata: Json<Metadata>,
}

/// Runs hybrid searches against one collection.
pub struct HybridSearchEngine<'a> {
    collection: &'a Collection,
}

impl<'a> HybridSearchEngine<'a> {
    pub fn new(collection: &'a Collection) -> Self {
        Self { collection }
    }

    /// Top `limit` fragments by fused lexical and semantic rank.
    #[instrument(skip(self, text, vector, settings, filters), fields(collection = %self.collection.name()))]
    pub async fn search(
        &self,
        text: &str,
        vector: &Vector,
        limit: usize,
        settings: &HybridSearchSettings,
        filters: Option<&Filter>,
    ) -> Result<Vec<HybridSearchResult>> {
        settings.validate()?;
        if limit > MAX_QUERY_LIMIT {
            return Err(VecsError::arg(format!(
                "limit must be <= {}, got {}",
                MAX_QUERY_LIMIT, limit
            )));
        }
        vector.check_dimension(self.collection.dimension())?;
        if limit == 0 {
            return Ok(Vec::new());
        }

        if !self.collection.is_indexed_for(settings.measure).await? {
            warn!(
                collection = %self.collection.name(),
                measure = %settings.measure,
                "no index for measure, semantic ranking will use an exact scan"
            );
        }

        let table = self.collection.table();
        let candidates = candidate_count(limit);
        let text_search_config = self.collection.text_search_config();

        let mut tx = self.collection.pool().begin().await?;
        set_search_params(&mut tx, settings.probes, settings.ef_search).await?;

        let lexical: Vec<Uuid> = lexical_query(&table, text_search_config, text, filters, candidates)
            .build_query_scalar()
            .fetch_all(&mut *tx)
            .await?;
        let semantic: Vec<Uuid> = semantic_query(&table, vector, settings.measure, filters, candidates)
            .build_query_scalar()
            .fetch_all(&mut *tx)
            .await?;
        debug!(lexical = lexical.len(), semantic = semantic.len(), "ranked candidates");

        let fused = rrf_fuse(
            &lexical,
            &semantic,
            settings.full_text_weight,
            settings.semantic_weight,
            settings.rrf_k as f64,
            limit,
        );
        let ids: Vec<Uuid> = fused.iter().map(|c| c.fragment_id).collect();
        let rows: Vec<HitRow> = sqlx::query_as(&format!(
            "SELECT fragment_id, extraction_id, document_id, user_id, group_ids, text, metadata \
             FROM {} WHERE fragment_id = ANY($1)",
            table
        ))
        .bind(ids)
        .fetch_all(&mut *tx)
        .await?;
        tx.commit().await?;

        let mut rows: HashMap<Uuid, HitRow> = rows.into_iter().map(|row| (row.fragment_id, row)).collect();
        Ok(fused
            .into_iter()
            .filter_map(|candidate| {
                let row = rows.remove(&candidate.fragment_id)?;
                Some(HybridSearchResult {
                    fragment_id: row.fragment_id,
                    extraction_id: row.extraction_id,
                    document_id: row.document_id,
                    user_id: row.user_id,
                    group_ids: row.group_ids,
                    text: row.text,
                    metadata: row.metadata.0,
                    score: candidate.score,
                    lexical_rank: candidate.lexical_rank,
                    semantic_rank: candidate.semantic_rank,
                })
            })
            .collect())
    }
}

fn push_filter(qb: &mut QueryBuilder<'_, Postgres>, filter: Option<&Filter>) {
    if let Some(filter) = filter {
        qb.push(" AND ");
        filter.push_sql(qb);
    }
}

/// Ids ranked by lexical relevance of `fts` against a web-search style query.
fn lexical_query<'a>(
    table: &str,
    text_search_config: &str,
    text: &str,
    filter: Option<&Filter>,
    candidates: usize,
) -> QueryBuilder<'a, Postgres> {
    let mut qb = QueryBuilder::new("SELECT fragment_id FROM ");
    qb.push(table);
    qb.push(" WHERE fts @@ websearch_to_tsquery(");
    qb.push_bind(text_search_config.to_string());
    qb.push("::regconfig, ");
    qb.push_bind(text.to_string());
    qb.push(")");
    push_filter(&mut qb, filter);
    qb.push(" ORDER BY ts_rank_cd(fts, websearch_to_tsquery(");
    qb.push_bind(text_search_config.to_string());
    qb.push("::regconfig, ");
    qb.push_bind(text.to_string());
    qb.push(")) DESC, fragment_id LIMIT ");
    qb.push_bind(candidates as i64);
    qb
}

/// Ids ranked by ascending distance to `vector`.
fn semantic_query<'a>(
    table: &str,
    vector: &Vector,
    measure: DistanceMeasure,
    filter: Option<&Filter>,
    candidates: usize,
) -> QueryBuilder<'a, Postgres> {
    let mut qb = QueryBuilder::new("SELECT fragment_id FROM ");
    qb.push(table);
    qb.push(" WHERE TRUE");
    push_filter(&mut qb, filter);
    qb.push(" ORDER BY vector ");
    qb.push(measure.operator());
    qb.push(" ");
    qb.push_bind(vector.to_pg_literal());
    qb.push("::vector LIMIT ");
    qb.push_bind(candidates as i64);
    qb
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;
    use serde_json::json;

    fn ids(n: usize) -> Vec<Uuid> {
        (0..n).map(|i| Uuid::from_u128(i as u128 + 1)).collect()
    }

    fn order(fused: &[FusedCandidate]) -> Vec<Uuid> {
        fused.iter().map(|c| c.fragment_id).collect()
    }

    #[test]
    fn test_candidate_count() {
        assert_eq!(candidate_count(1), 2);
        assert_eq!(candidate_count(30), 60);
        assert_eq!(candidate_count(500), 60);
    }

    #[test]
    fn test_rrf_scores() {
        let v = ids(3);
        let lexical = vec![v[1], v[0]];
        let semantic = vec![v[1], v[2]];
        let fused = rrf_fuse(&lexical, &semantic, 1.0, 1.0, 50.0, 10);

        assert_eq!(fused[0].fragment_id, v[1]);
        assert_relative_eq!(fused[0].score, 2.0 / 51.0, epsilon = 1e-12);
        assert_eq!(fused[0].lexical_rank, Some(1));
        assert_eq!(fused[0].semantic_rank, Some(1));
        assert_relative_eq!(fused[1].score, 1.0 / 52.0, epsilon = 1e-12);
        // equal single-list scores: the semantic hit sorts first
        assert_eq!(fused[1].fragment_id, v[2]);
        assert_eq!(fused[2].fragment_id, v[0]);
    }

    #[test]
    fn test_rrf_empty_inputs() {
        assert!(rrf_fuse(&[], &[], 1.0, 5.0, 50.0, 10).is_empty());
    }

    #[test]
    fn test_rrf_truncates_to_limit() {
        let v = ids(10);
        let fused = rrf_fuse(&v[..5], &v[5..], 1.0, 1.0, 50.0, 3);
        assert_eq!(fused.len(), 3);
    }

    #[test]
    fn test_rrf_zero_text_weight_is_semantic_order() {
        let v = ids(6);
        let lexical = vec![v[5], v[4], v[0]];
        let semantic = vec![v[0], v[1], v[2], v[3]];
        let fused = rrf_fuse(&lexical, &semantic, 0.0, 5.0, 50.0, 4);
        assert_eq!(order(&fused), semantic);
    }

    #[test]
    fn test_rrf_zero_semantic_weight_is_lexical_order() {
        let v = ids(6);
        let lexical = vec![v[5], v[4], v[0]];
        let semantic = vec![v[0], v[1], v[2], v[3]];
        let fused = rrf_fuse(&lexical, &semantic, 1.0, 0.0, 50.0, 3);
        assert_eq!(order(&fused), lexical);
    }

    #[test]
    fn test_settings_validation() {
        assert!(HybridSearchSettings::default().validate().is_ok());
        assert!(HybridSearchSettings::default()
            .with_weights(-1.0, 1.0)
            .validate()
            .is_err());
        assert!(HybridSearchSettings::default()
            .with_weights(1.0, f64::NAN)
            .validate()
            .is_err());
    }

    #[test]
    fn test_settings_deserialize_partial() {
        let settings: HybridSearchSettings = serde_json::from_value(json!({"rrf_k": 60})).unwrap();
        assert_eq!(settings.rrf_k, 60);
        assert_relative_eq!(settings.semantic_weight, 5.0);
    }

    #[test]
    fn test_lexical_sql() {
        let filter = Filter::compile(&json!({"topic": "rust"})).unwrap();
        let qb = lexical_query(r#""vecs"."docs""#, "english", "borrow checker", Some(&filter), 20);
        assert_eq!(
            qb.sql(),
            r#"SELECT fragment_id FROM "vecs"."docs" WHERE fts @@ websearch_to_tsquery($1::regconfig, $2) AND (metadata #>> $3) = $4 ORDER BY ts_rank_cd(fts, websearch_to_tsquery($5::regconfig, $6)) DESC, fragment_id LIMIT $7"#
        );
    }

    #[test]
    fn test_semantic_sql() {
        let qb = semantic_query(
            r#""vecs"."docs""#,
            &Vector::new(vec![0.5, 0.5]),
            DistanceMeasure::InnerProduct,
            None,
            20,
        );
        assert_eq!(
            qb.sql(),
            r#"SELECT fragment_id FROM "vecs"."docs" WHERE TRUE ORDER BY vector <#> $1::vector LIMIT $2"#
        );
    }

    proptest! {
        #[test]
        fn prop_zero_weight_keeps_single_signal_order(
            n in 1usize..40,
            lexical_picks in proptest::collection::vec(0usize..40, 0..40),
            limit in 1usize..40,
        ) {
            let v = ids(40);
            let semantic: Vec<Uuid> = v[..n].to_vec();
            let mut lexical: Vec<Uuid> = Vec::new();
            for i in lexical_picks {
                if !lexical.contains(&v[i]) {
                    lexical.push(v[i]);
                }
            }

            let fused = rrf_fuse(&lexical, &semantic, 0.0, 1.0, 50.0, limit);
            let expected: Vec<Uuid> = semantic.iter().take(limit).copied().collect();
            prop_assert_eq!(&order(&fused)[..expected.len()], &expected[..]);

            let fused = rrf_fuse(&lexical, &semantic, 1.0, 0.0, 50.0, limit);
            let expected: Vec<Uuid> = lexical.iter().take(limit).copied().collect();
            prop_assert_eq!(&order(&fused)[..expected.len()], &expected[..]);
        }

        #[test]
        fn prop_scores_descending(
            lexical_len in 0usize..30,
            semantic_start in 0usize..30,
            semantic_len in 0usize..30,
        ) {
            let v = ids(60);
            let lexical = &v[..lexical_len];
            let semantic = &v[semantic_start..semantic_start + semantic_len];
            let fused = rrf_fuse(lexical, semantic, 1.0, 5.0, 50.0, 60);
            for pair in fused.windows(2) {
                prop_assert!(pair[0].score >= pair[1].score);
            }
        }
    }
}
