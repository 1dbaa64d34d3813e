//! Filter compilation.
//!
//! A filter arrives as a JSON object such as
//!
//! ```json
//! {"$and": [{"document_id": {"$eq": "…"}}, {"year": {"$gte": 2020}}]}
//! ```
//!
//! and is compiled once into a typed [`Filter`] tree. Every operator/key
//! combination is checked during compilation, so a compiled filter always
//! renders to a valid SQL predicate and can be reused for queries and deletes.
//!
//! Keys naming a first-class column (`fragment_id`, `extraction_id`,
//! `document_id`, `user_id`, `group_ids`) compare against that column.
//! Any other key is a path into `metadata`; dots separate nested keys.

use crate::error::{Result, VecsError};
use serde_json::{Map, Value};
use sqlx::{Postgres, QueryBuilder};
use uuid::Uuid;

/// Comparison operators accepted in a filter leaf.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operator {
    Eq,
    Ne,
    Gt,
    Gte,
    Lt,
    Lte,
    In,
    Nin,
}

impl Operator {
    pub fn parse(token: &str) -> Result<Self> {
        match token {
            "$eq" => Ok(Operator::Eq),
            "$ne" => Ok(Operator::Ne),
            "$gt" => Ok(Operator::Gt),
            "$gte" => Ok(Operator::Gte),
            "$lt" => Ok(Operator::Lt),
            "$lte" => Ok(Operator::Lte),
            "$in" => Ok(Operator::In),
            "$nin" => Ok(Operator::Nin),
            other => Err(VecsError::filter(format!("unsupported operator: {}", other))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operator::Eq => "$eq",
            Operator::Ne => "$ne",
            Operator::Gt => "$gt",
            Operator::Gte => "$gte",
            Operator::Lt => "$lt",
            Operator::Lte => "$lte",
            Operator::In => "$in",
            Operator::Nin => "$nin",
        }
    }
}

/// UUID-typed first-class columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdColumn {
    FragmentId,
    ExtractionId,
    DocumentId,
    UserId,
}

impl IdColumn {
    fn from_key(key: &str) -> Option<Self> {
        match key {
            "fragment_id" => Some(IdColumn::FragmentId),
            "extraction_id" => Some(IdColumn::ExtractionId),
            "document_id" => Some(IdColumn::DocumentId),
            "user_id" => Some(IdColumn::UserId),
            _ => None,
        }
    }

    pub fn column(&self) -> &'static str {
        match self {
            IdColumn::FragmentId => "fragment_id",
            IdColumn::ExtractionId => "extraction_id",
            IdColumn::DocumentId => "document_id",
            IdColumn::UserId => "user_id",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum IdPredicate {
    Eq(Uuid),
    Ne(Uuid),
    In(Vec<Uuid>),
    Nin(Vec<Uuid>),
}

/// Predicates over the multi-valued `group_ids` column.
#[derive(Debug, Clone, PartialEq)]
pub enum GroupPredicate {
    /// `$eq`: the group list contains the id.
    Contains(Uuid),
    /// `$ne`: the group list does not contain the id.
    Excludes(Uuid),
    /// `$in`: the group list shares at least one id.
    Overlaps(Vec<Uuid>),
    /// `$nin`: the group list shares no id.
    Disjoint(Vec<Uuid>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    Gt,
    Gte,
    Lt,
    Lte,
}

impl Comparison {
    fn sql(&self) -> &'static str {
        match self {
            Comparison::Gt => ">",
            Comparison::Gte => ">=",
            Comparison::Lt => "<",
            Comparison::Lte => "<=",
        }
    }
}

/// Predicates over a metadata path. Equality and membership compare the
/// text form of the value; comparisons only match JSON numbers.
#[derive(Debug, Clone, PartialEq)]
pub enum MetadataPredicate {
    /// `None` matches a missing key or JSON null.
    Eq(Option<String>),
    Ne(Option<String>),
    Compare(Comparison, f64),
    In(Vec<String>),
    Nin(Vec<String>),
}

/// A compiled filter tree.
#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    And(Vec<Filter>),
    Or(Vec<Filter>),
    Id {
        column: IdColumn,
        predicate: IdPredicate,
    },
    Groups(GroupPredicate),
    Metadata {
        path: Vec<String>,
        predicate: MetadataPredicate,
    },
}

impl Default for Filter {
    fn default() -> Self {
        Filter::And(Vec::new())
    }
}

impl Filter {
    /// Compile a JSON filter expression.
    pub fn compile(expr: &Value) -> Result<Self> {
        match expr {
            Value::Object(map) => compile_object(map),
            other => Err(VecsError::filter(format!(
                "filter must be an object, got {}",
                other
            ))),
        }
    }

    /// True when the filter matches every row: `{}`, and any `$and` or
    /// `$or` that reduces to it, such as `{"$or": [{}]}`.
    pub fn matches_all(&self) -> bool {
        match self {
            Filter::And(children) => children.iter().all(Filter::matches_all),
            Filter::Or(children) => children.iter().any(Filter::matches_all),
            _ => false,
        }
    }

    /// Append this predicate to `qb`, binding every operand.
    pub fn push_sql(&self, qb: &mut QueryBuilder<'_, Postgres>) {
        match self {
            Filter::And(children) => push_group(qb, children, " AND ", "TRUE"),
            Filter::Or(children) => push_group(qb, children, " OR ", "FALSE"),
            Filter::Id { column, predicate } => push_id(qb, column.column(), predicate),
            Filter::Groups(predicate) => push_groups(qb, predicate),
            Filter::Metadata { path, predicate } => push_metadata(qb, path, predicate),
        }
    }
}

fn compile_object(map: &Map<String, Value>) -> Result<Filter> {
    let mut clauses = Vec::with_capacity(map.len());
    for (key, value) in map {
        match key.as_str() {
            "$and" => clauses.push(Filter::And(compile_list(key, value)?)),
            "$or" => clauses.push(Filter::Or(compile_list(key, value)?)),
            k if k.starts_with('$') => {
                return Err(VecsError::filter(format!("unsupported logical operator: {}", k)))
            }
            field => clauses.push(compile_field(field, value)?),
        }
    }
    if clauses.len() == 1 {
        Ok(clauses.remove(0))
    } else {
        Ok(Filter::And(clauses))
    }
}

fn compile_list(op: &str, value: &Value) -> Result<Vec<Filter>> {
    let items = value
        .as_array()
        .ok_or_else(|| VecsError::filter(format!("{} expects a list of filters", op)))?;
    items.iter().map(Filter::compile).collect()
}

fn compile_field(field: &str, value: &Value) -> Result<Filter> {
    let ops: Vec<(Operator, &Value)> = match value {
        Value::Object(map) => {
            if map.is_empty() {
                return Err(VecsError::filter(format!("empty condition for {}", field)));
            }
            map.iter()
                .map(|(op, operand)| Ok((Operator::parse(op)?, operand)))
                .collect::<Result<_>>()?
        }
        scalar => vec![(Operator::Eq, scalar)],
    };

    let mut leaves = ops
        .into_iter()
        .map(|(op, operand)| compile_leaf(field, op, operand))
        .collect::<Result<Vec<_>>>()?;
    if leaves.len() == 1 {
        Ok(leaves.remove(0))
    } else {
        Ok(Filter::And(leaves))
    }
}

fn compile_leaf(field: &str, op: Operator, operand: &Value) -> Result<Filter> {
    if let Some(column) = IdColumn::from_key(field) {
        let predicate = match op {
            Operator::Eq => IdPredicate::Eq(parse_uuid(field, operand)?),
            Operator::Ne => IdPredicate::Ne(parse_uuid(field, operand)?),
            Operator::In => IdPredicate::In(parse_uuid_list(field, op, operand)?),
            Operator::Nin => IdPredicate::Nin(parse_uuid_list(field, op, operand)?),
            _ => return Err(unsupported(field, op)),
        };
        return Ok(Filter::Id { column, predicate });
    }

    if field == "group_ids" {
        let predicate = match op {
            Operator::Eq => GroupPredicate::Contains(parse_uuid(field, operand)?),
            Operator::Ne => GroupPredicate::Excludes(parse_uuid(field, operand)?),
            Operator::In => GroupPredicate::Overlaps(parse_uuid_list(field, op, operand)?),
            Operator::Nin => GroupPredicate::Disjoint(parse_uuid_list(field, op, operand)?),
            _ => return Err(unsupported(field, op)),
        };
        return Ok(Filter::Groups(predicate));
    }

    let path = metadata_path(field)?;
    let predicate = match op {
        Operator::Eq => MetadataPredicate::Eq(normalize_scalar(field, operand)?),
        Operator::Ne => MetadataPredicate::Ne(normalize_scalar(field, operand)?),
        Operator::Gt => MetadataPredicate::Compare(Comparison::Gt, parse_number(field, op, operand)?),
        Operator::Gte => MetadataPredicate::Compare(Comparison::Gte, parse_number(field, op, operand)?),
        Operator::Lt => MetadataPredicate::Compare(Comparison::Lt, parse_number(field, op, operand)?),
        Operator::Lte => MetadataPredicate::Compare(Comparison::Lte, parse_number(field, op, operand)?),
        Operator::In => MetadataPredicate::In(normalize_list(field, op, operand)?),
        Operator::Nin => MetadataPredicate::Nin(normalize_list(field, op, operand)?),
    };
    Ok(Filter::Metadata { path, predicate })
}

fn unsupported(field: &str, op: Operator) -> VecsError {
    VecsError::filter(format!("operator {} is not supported for {}", op.as_str(), field))
}

fn metadata_path(field: &str) -> Result<Vec<String>> {
    let path: Vec<String> = field.split('.').map(str::to_string).collect();
    if path.iter().any(|segment| segment.is_empty()) {
        return Err(VecsError::filter(format!("invalid metadata key: {:?}", field)));
    }
    Ok(path)
}

fn parse_uuid(field: &str, value: &Value) -> Result<Uuid> {
    value
        .as_str()
        .and_then(|s| Uuid::parse_str(s).ok())
        .ok_or_else(|| VecsError::filter(format!("{} expects a UUID string, got {}", field, value)))
}

fn parse_uuid_list(field: &str, op: Operator, value: &Value) -> Result<Vec<Uuid>> {
    let items = value.as_array().ok_or_else(|| {
        VecsError::filter(format!("{} on {} expects a list", op.as_str(), field))
    })?;
    items.iter().map(|item| parse_uuid(field, item)).collect()
}

fn parse_number(field: &str, op: Operator, value: &Value) -> Result<f64> {
    value.as_f64().ok_or_else(|| {
        VecsError::filter(format!(
            "{} on {} expects a number, got {}",
            op.as_str(),
            field,
            value
        ))
    })
}

/// Text form of a scalar, matching what `#>>` extracts from jsonb.
fn normalize_scalar(field: &str, value: &Value) -> Result<Option<String>> {
    match value {
        Value::Null => Ok(None),
        Value::String(s) => Ok(Some(s.clone())),
        Value::Number(n) => Ok(Some(n.to_string())),
        Value::Bool(b) => Ok(Some(b.to_string())),
        other => Err(VecsError::filter(format!(
            "{} expects a scalar value, got {}",
            field, other
        ))),
    }
}

fn normalize_list(field: &str, op: Operator, value: &Value) -> Result<Vec<String>> {
    let items = value.as_array().ok_or_else(|| {
        VecsError::filter(format!("{} on {} expects a list", op.as_str(), field))
    })?;
    items
        .iter()
        .map(|item| {
            normalize_scalar(field, item)?.ok_or_else(|| {
                VecsError::filter(format!("{} on {} does not accept null", op.as_str(), field))
            })
        })
        .collect()
}

fn push_group(qb: &mut QueryBuilder<'_, Postgres>, children: &[Filter], joiner: &str, empty: &str) {
    if children.is_empty() {
        qb.push(empty);
        return;
    }
    qb.push("(");
    for (i, child) in children.iter().enumerate() {
        if i > 0 {
            qb.push(joiner);
        }
        child.push_sql(qb);
    }
    qb.push(")");
}

fn push_id(qb: &mut QueryBuilder<'_, Postgres>, column: &str, predicate: &IdPredicate) {
    match predicate {
        IdPredicate::Eq(id) => {
            qb.push(column).push(" = ").push_bind(*id);
        }
        IdPredicate::Ne(id) => {
            qb.push(column).push(" <> ").push_bind(*id);
        }
        IdPredicate::In(ids) => {
            qb.push(column).push(" = ANY(").push_bind(ids.clone()).push(")");
        }
        IdPredicate::Nin(ids) => {
            qb.push("NOT (")
                .push(column)
                .push(" = ANY(")
                .push_bind(ids.clone())
                .push("))");
        }
    }
}

fn push_groups(qb: &mut QueryBuilder<'_, Postgres>, predicate: &GroupPredicate) {
    match predicate {
        GroupPredicate::Contains(id) => {
            qb.push("group_ids @> ").push_bind(vec![*id]);
        }
        GroupPredicate::Excludes(id) => {
            qb.push("NOT (group_ids @> ").push_bind(vec![*id]).push(")");
        }
        GroupPredicate::Overlaps(ids) => {
            qb.push("group_ids && ").push_bind(ids.clone());
        }
        GroupPredicate::Disjoint(ids) => {
            qb.push("NOT (group_ids && ").push_bind(ids.clone()).push(")");
        }
    }
}

fn push_path(qb: &mut QueryBuilder<'_, Postgres>, path: &[String]) {
    qb.push("(metadata #>> ").push_bind(path.to_vec()).push(")");
}

fn push_metadata(qb: &mut QueryBuilder<'_, Postgres>, path: &[String], predicate: &MetadataPredicate) {
    match predicate {
        MetadataPredicate::Eq(None) => {
            push_path(qb, path);
            qb.push(" IS NULL");
        }
        MetadataPredicate::Eq(Some(value)) => {
            push_path(qb, path);
            qb.push(" = ").push_bind(value.clone());
        }
        MetadataPredicate::Ne(None) => {
            push_path(qb, path);
            qb.push(" IS NOT NULL");
        }
        MetadataPredicate::Ne(Some(value)) => {
            push_path(qb, path);
            qb.push(" IS DISTINCT FROM ").push_bind(value.clone());
        }
        MetadataPredicate::Compare(cmp, value) => {
            // strings, booleans and objects under the key compare as NULL
            qb.push("(CASE WHEN jsonb_typeof(metadata #> ")
                .push_bind(path.to_vec())
                .push(") = 'number' THEN ");
            push_path(qb, path);
            qb.push("::double precision END ")
                .push(cmp.sql())
                .push(" ")
                .push_bind(*value)
                .push(")");
        }
        MetadataPredicate::In(values) => {
            push_path(qb, path);
            qb.push(" = ANY(").push_bind(values.clone()).push(")");
        }
        MetadataPredicate::Nin(values) => {
            // a missing key is "not in" any list
            qb.push("(");
            push_path(qb, path);
            qb.push(" IS NULL OR NOT (");
            push_path(qb, path);
            qb.push(" = ANY(").push_bind(values.clone()).push(")))");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    const DOC_A: &str = "0b4d3a9e-2f6c-4c3a-9f11-8e7d6c5b4a39";
    const DOC_B: &str = "1c9e8d7f-6a5b-4c3d-2e1f-0a9b8c7d6e5f";

    fn render(filter: &Filter) -> String {
        let mut qb = QueryBuilder::<Postgres>::new("");
        filter.push_sql(&mut qb);
        qb.sql().to_string()
    }

    fn compile(value: serde_json::Value) -> Filter {
        Filter::compile(&value).unwrap()
    }

    #[test]
    fn test_empty_filter_matches_all() {
        let filter = compile(json!({}));
        assert!(filter.matches_all());
        assert_eq!(render(&filter), "TRUE");
    }

    #[test]
    fn test_nested_empty_groups_match_all() {
        assert!(compile(json!({"$or": [{}]})).matches_all());
        assert!(compile(json!({"$and": [{}]})).matches_all());
        assert!(compile(json!({"$and": [{"$or": [{}]}, {}]})).matches_all());
        assert!(compile(json!({"$or": [{"lang": "en"}, {"$and": []}]})).matches_all());

        assert!(!compile(json!({"$or": []})).matches_all());
        assert!(!compile(json!({"$or": [{"lang": "en"}]})).matches_all());
        assert!(!compile(json!({"$and": [{}, {"lang": "en"}]})).matches_all());
    }

    #[test]
    fn test_reserved_field_eq() {
        let filter = compile(json!({"document_id": {"$eq": DOC_A}}));
        assert_eq!(
            filter,
            Filter::Id {
                column: IdColumn::DocumentId,
                predicate: IdPredicate::Eq(Uuid::parse_str(DOC_A).unwrap()),
            }
        );
        assert_eq!(render(&filter), "document_id = $1");
    }

    #[test]
    fn test_bare_value_is_eq_sugar() {
        assert_eq!(
            compile(json!({"document_id": DOC_A})),
            compile(json!({"document_id": {"$eq": DOC_A}}))
        );
        assert_eq!(
            compile(json!({"lang": "en"})),
            compile(json!({"lang": {"$eq": "en"}}))
        );
    }

    #[test]
    fn test_reserved_field_membership() {
        let filter = compile(json!({"document_id": {"$in": [DOC_A, DOC_B]}}));
        assert_eq!(render(&filter), "document_id = ANY($1)");
        let filter = compile(json!({"user_id": {"$nin": [DOC_A]}}));
        assert_eq!(render(&filter), "NOT (user_id = ANY($1))");
    }

    #[test]
    fn test_reserved_field_rejects_comparison() {
        let err = Filter::compile(&json!({"document_id": {"$gt": DOC_A}})).unwrap_err();
        assert!(err.is_filter_error());
        let err = Filter::compile(&json!({"group_ids": {"$lte": DOC_A}})).unwrap_err();
        assert!(err.is_filter_error());
    }

    #[test]
    fn test_reserved_field_requires_uuid() {
        let err = Filter::compile(&json!({"fragment_id": "not-a-uuid"})).unwrap_err();
        assert!(err.is_filter_error());
    }

    #[test]
    fn test_group_predicates() {
        assert_eq!(render(&compile(json!({"group_ids": DOC_A}))), "group_ids @> $1");
        assert_eq!(
            render(&compile(json!({"group_ids": {"$in": [DOC_A, DOC_B]}}))),
            "group_ids && $1"
        );
        assert_eq!(
            render(&compile(json!({"group_ids": {"$nin": [DOC_A]}}))),
            "NOT (group_ids && $1)"
        );
    }

    #[test]
    fn test_metadata_numeric_comparison_guards_type() {
        let filter = compile(json!({"year": {"$gte": 2020}}));
        assert_eq!(
            filter,
            Filter::Metadata {
                path: vec!["year".to_string()],
                predicate: MetadataPredicate::Compare(Comparison::Gte, 2020.0),
            }
        );
        assert_eq!(
            render(&filter),
            "(CASE WHEN jsonb_typeof(metadata #> $1) = 'number' THEN (metadata #>> $2)::double precision END >= $3)"
        );
    }

    #[test]
    fn test_metadata_comparison_requires_number() {
        let err = Filter::compile(&json!({"year": {"$lt": "2020"}})).unwrap_err();
        assert!(err.is_filter_error());
    }

    #[test]
    fn test_metadata_equality_is_string_normalized() {
        let filter = compile(json!({"published": true, "pages": 12}));
        let Filter::And(children) = filter else {
            panic!("expected AND of two leaves");
        };
        let values: Vec<_> = children
            .iter()
            .map(|c| match c {
                Filter::Metadata {
                    predicate: MetadataPredicate::Eq(v),
                    ..
                } => v.clone(),
                other => panic!("unexpected leaf {:?}", other),
            })
            .collect();
        assert!(values.contains(&Some("true".to_string())));
        assert!(values.contains(&Some("12".to_string())));
    }

    #[test]
    fn test_metadata_null_equality() {
        assert_eq!(render(&compile(json!({"tag": null}))), "(metadata #>> $1) IS NULL");
        assert_eq!(
            render(&compile(json!({"tag": {"$ne": null}}))),
            "(metadata #>> $1) IS NOT NULL"
        );
    }

    #[test]
    fn test_nested_metadata_path() {
        let filter = compile(json!({"source.kind": "pdf"}));
        assert_eq!(
            filter,
            Filter::Metadata {
                path: vec!["source".to_string(), "kind".to_string()],
                predicate: MetadataPredicate::Eq(Some("pdf".to_string())),
            }
        );
        assert!(Filter::compile(&json!({"source..kind": "pdf"})).is_err());
    }

    #[test]
    fn test_metadata_nin_includes_missing_keys() {
        assert_eq!(
            render(&compile(json!({"lang": {"$nin": ["en", "fr"]}}))),
            "((metadata #>> $1) IS NULL OR NOT ((metadata #>> $2) = ANY($3)))"
        );
    }

    #[test]
    fn test_and_or_nesting() {
        let filter = compile(json!({
            "$or": [
                {"document_id": DOC_A},
                {"$and": [{"lang": "en"}, {"year": {"$lt": 2000}}]}
            ]
        }));
        assert_eq!(
            render(&filter),
            "(document_id = $1 OR ((metadata #>> $2) = $3 AND (CASE WHEN jsonb_typeof(metadata #> $4) = 'number' THEN (metadata #>> $5)::double precision END < $6)))"
        );
    }

    #[test]
    fn test_empty_or_matches_nothing() {
        assert_eq!(render(&compile(json!({"$or": []}))), "FALSE");
    }

    #[test]
    fn test_multiple_operators_on_one_key() {
        let filter = compile(json!({"year": {"$gt": 1990, "$lte": 2000}}));
        assert!(matches!(&filter, Filter::And(children) if children.len() == 2));
    }

    #[test]
    fn test_malformed_filters() {
        for bad in [
            json!("document_id"),
            json!({"$and": {"lang": "en"}}),
            json!({"$not": [{"lang": "en"}]}),
            json!({"lang": {"$like": "e%"}}),
            json!({"lang": {}}),
            json!({"lang": {"$in": "en"}}),
            json!({"lang": {"$in": ["en", null]}}),
            json!({"lang": {"$eq": ["en"]}}),
        ] {
            let err = Filter::compile(&bad).unwrap_err();
            assert!(err.is_filter_error(), "{} should be a filter error", bad);
        }
    }

    proptest! {
        #[test]
        fn prop_metadata_eq_binds_path_and_value(key in "[a-z][a-z0-9_]{0,12}", value in "[ -~]{0,24}") {
            let mut map = Map::new();
            map.insert(key.clone(), Value::String(value.clone()));
            let filter = Filter::compile(&Value::Object(map)).unwrap();
            prop_assert_eq!(
                &filter,
                &Filter::Metadata {
                    path: vec![key],
                    predicate: MetadataPredicate::Eq(Some(value)),
                }
            );
            prop_assert_eq!(render(&filter), "(metadata #>> $1) = $2");
        }

        #[test]
        fn prop_or_of_n_leaves_binds_each(n in 1usize..8) {
            let leaves: Vec<_> = (0..n).map(|i| json!({"rank": {"$gt": i}})).collect();
            let filter = Filter::compile(&json!({"$or": leaves})).unwrap();
            let sql = render(&filter);
            prop_assert_eq!(sql.matches(" OR ").count(), n - 1);
            let last = format!("${}", 3 * n);
            let past_last = format!("${}", 3 * n + 1);
            prop_assert!(sql.contains(&last), "missing {} in {}", last, sql);
            prop_assert!(!sql.contains(&past_last), "unexpected {} in {}", past_last, sql);
        }
    }
}
