//! Query Evaluator
//!
//! Resolves the candidate document set for a [`DocumentQuery`] (scope
//! walk plus collection-group recursion), validates it against the same
//! combinability and range rules a real Firestore backend enforces, and
//! tests each visible candidate against the query's filter tree.
//!
//! Ordering, cursors, offset, and projection are caller concerns — this
//! module only ever returns the unordered candidate set (save for
//! `find_nearest`, whose distance sort and limit are intrinsic to the
//! operator itself, not a generic output modifier).
//!
//! # Reference
//! A filter-operator/direction shape (`FilterOperator`, `Direction`)
//! evaluated in-process against the Structural Store, rather than built
//! into a request sent over the wire.

use crate::error::FirestoreError;
use crate::firestore::commit::{MAX_ARRAY_OPERAND_LEN, MAX_VECTOR_DIMENSION};
use crate::firestore::meta_document::MetaDocument;
use crate::firestore::path::Path;
use crate::firestore::store::StructuralStore;
use crate::firestore::timestamp::Timestamp;
use crate::firestore::value::{compare_values, values_equal, Value, ValueKind, ValueMap};
use std::cmp::Ordering;
use std::collections::BTreeSet;

/// Sort direction named by an explicit ordering, used only for the
/// inequality-field-ordering validation rule — the evaluator never sorts
/// output itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Ascending order.
    Ascending,
    /// Descending order.
    Descending,
}

/// A field filter's comparison operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOperator {
    /// `==`
    Equal,
    /// `!=`
    NotEqual,
    /// `<`
    LessThan,
    /// `<=`
    LessThanOrEqual,
    /// `>`
    GreaterThan,
    /// `>=`
    GreaterThanOrEqual,
    /// Array field contains the operand value.
    ArrayContains,
    /// Array field contains any of the operand values.
    ArrayContainsAny,
    /// Field equals any of the operand values.
    In,
    /// Field equals none of the operand values.
    NotIn,
    /// Field is present and `Value::Null`.
    IsNull,
    /// Field is present and not `Value::Null`.
    IsNotNull,
    /// Field is present and the floating-point NaN.
    IsNan,
    /// Field is present, numeric, and not NaN.
    IsNotNan,
}

/// The operand of a field filter.
#[derive(Debug, Clone)]
pub enum FilterOperand {
    /// A single-value operand (`==`, `!=`, range, `array_contains`).
    Value(Value),
    /// A multi-value operand, 1-10 elements (`in`, `not_in`,
    /// `array_contains_any`).
    Values(Vec<Value>),
    /// No operand (the unary `IS_*` operators).
    None,
}

/// One field comparison.
#[derive(Debug, Clone)]
pub struct FieldFilter {
    /// Dotted field path, e.g. `"address.city"`.
    pub field_path: String,
    /// The comparison operator.
    pub operator: FilterOperator,
    /// The operator's operand.
    pub operand: FilterOperand,
}

/// A predicate tree combining field filters with boolean composition.
#[derive(Debug, Clone)]
pub enum Filter {
    /// A single field comparison.
    Field(FieldFilter),
    /// All of the nested filters must match.
    And(Vec<Filter>),
    /// Any of the nested filters must match.
    Or(Vec<Filter>),
}

/// Vector distance function for `find_nearest`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DistanceMeasure {
    /// Straight-line distance.
    Euclidean,
    /// `1 - cosine similarity`.
    Cosine,
    /// Negated dot product, so that smaller is still "closer".
    DotProduct,
}

/// A `find_nearest` vector search.
#[derive(Debug, Clone)]
pub struct VectorQuery {
    /// Dotted path to the document's vector field.
    pub field_path: String,
    /// The query vector to compare against.
    pub query_vector: Vec<f64>,
    /// Maximum number of results to return, 1-1000.
    pub limit: usize,
    /// Distance function; defaults to [`DistanceMeasure::Euclidean`].
    pub distance_measure: Option<DistanceMeasure>,
    /// Candidates whose distance exceeds this are excluded.
    pub distance_threshold: Option<f64>,
}

/// The out-of-band read consistency a query is evaluated under. Exactly
/// one variant applies — unlike the wire protocol's three separate
/// optional fields, this type makes the mutual exclusivity structural.
#[derive(Debug, Clone)]
pub enum ReadConsistency {
    /// Evaluate against the current state.
    Current,
    /// Evaluate against the state as of this historical time.
    ReadTime(Timestamp),
    /// Evaluate under an existing transaction's read time.
    Transaction(Vec<u8>),
    /// Request a new transaction be opened for this query (validated here,
    /// actually opened by the caller).
    NewTransaction,
}

/// A fully-specified query against the structural store.
#[derive(Debug, Clone)]
pub struct DocumentQuery {
    /// The document (or root) the scope walk starts from.
    pub parent: Path,
    /// Whether to recurse into every descendant collection, not only
    /// `parent`'s immediate children.
    pub all_descendants: bool,
    /// Restrict matches to collections with this ID; `None` matches any.
    pub collection_id: Option<String>,
    /// The filter predicate, if any.
    pub filter: Option<Filter>,
    /// Explicit orderings, used only to validate the inequality-first-field
    /// rule and `find_nearest` incompatibility; the evaluator does not sort
    /// by these.
    pub explicit_order_by: Vec<(String, Direction)>,
    /// A `find_nearest` vector search, if any.
    pub find_nearest: Option<VectorQuery>,
    /// Read consistency.
    pub consistency: ReadConsistency,
}

/// Validate `query` against every combinability and range rule, without
/// touching the store.
pub fn validate(query: &DocumentQuery) -> Result<(), FirestoreError> {
    if let ReadConsistency::Transaction(bytes) = &query.consistency {
        if bytes.is_empty() {
            return Err(FirestoreError::InvalidArgument(
                "a transaction handle must not be empty".into(),
            ));
        }
    }

    let filters = query
        .filter
        .as_ref()
        .map(flatten_filters)
        .unwrap_or_default();

    let mut in_count = 0u32;
    let mut not_in_count = 0u32;
    let mut array_contains_any_count = 0u32;
    let mut array_contains_count = 0u32;
    let mut not_equal_count = 0u32;
    let mut inequality_fields: BTreeSet<&str> = BTreeSet::new();

    for f in &filters {
        match f.operator {
            FilterOperator::In => in_count += 1,
            FilterOperator::NotIn => {
                not_in_count += 1;
                inequality_fields.insert(f.field_path.as_str());
            }
            FilterOperator::ArrayContainsAny => array_contains_any_count += 1,
            FilterOperator::ArrayContains => array_contains_count += 1,
            FilterOperator::NotEqual => {
                not_equal_count += 1;
                inequality_fields.insert(f.field_path.as_str());
            }
            FilterOperator::LessThan
            | FilterOperator::LessThanOrEqual
            | FilterOperator::GreaterThan
            | FilterOperator::GreaterThanOrEqual => {
                inequality_fields.insert(f.field_path.as_str());
            }
            _ => {}
        }

        if let FilterOperand::Values(values) = &f.operand {
            validate_array_operand(values, f.operator == FilterOperator::ArrayContainsAny)?;
        }
    }

    if in_count > 1 {
        return Err(FirestoreError::InvalidArgument(
            "at most one IN filter is allowed".into(),
        ));
    }
    if not_in_count > 1 {
        return Err(FirestoreError::InvalidArgument(
            "at most one NOT_IN filter is allowed".into(),
        ));
    }
    if array_contains_any_count > 1 {
        return Err(FirestoreError::InvalidArgument(
            "at most one ARRAY_CONTAINS_ANY filter is allowed".into(),
        ));
    }
    if array_contains_count > 1 {
        return Err(FirestoreError::InvalidArgument(
            "at most one ARRAY_CONTAINS filter is allowed".into(),
        ));
    }

    let disjunctive_families =
        [in_count > 0, not_in_count > 0, array_contains_any_count > 0]
            .iter()
            .filter(|present| **present)
            .count();
    if disjunctive_families > 1 {
        return Err(FirestoreError::InvalidArgument(
            "at most one of IN, NOT_IN, ARRAY_CONTAINS_ANY may be used in a single query".into(),
        ));
    }
    if not_in_count > 0 && (in_count > 0 || array_contains_any_count > 0 || not_equal_count > 0) {
        return Err(FirestoreError::InvalidArgument(
            "NOT_IN cannot be combined with IN, ARRAY_CONTAINS_ANY, or !=".into(),
        ));
    }

    if inequality_fields.len() > 10 {
        return Err(FirestoreError::InvalidArgument(
            "at most 10 distinct inequality fields are allowed".into(),
        ));
    }
    if !inequality_fields.is_empty() {
        if let Some((first_field, _)) = query.explicit_order_by.first() {
            if !inequality_fields.contains(first_field.as_str()) {
                return Err(FirestoreError::InvalidArgument(
                    "the first explicit ordering must name an inequality field".into(),
                ));
            }
        }
    }

    if let Some(vq) = &query.find_nearest {
        if vq.query_vector.is_empty() || vq.query_vector.len() > MAX_VECTOR_DIMENSION {
            return Err(FirestoreError::InvalidArgument(format!(
                "find_nearest query_vector dimension {} out of range [1, {MAX_VECTOR_DIMENSION}]",
                vq.query_vector.len()
            )));
        }
        if vq.query_vector.iter().any(|d| !d.is_finite()) {
            return Err(FirestoreError::InvalidArgument(
                "find_nearest query_vector must contain only finite numbers".into(),
            ));
        }
        if vq.limit == 0 || vq.limit > 1000 {
            return Err(FirestoreError::InvalidArgument(
                "find_nearest limit must be in range [1, 1000]".into(),
            ));
        }
        if let Some(threshold) = vq.distance_threshold {
            if !threshold.is_finite() || threshold < 0.0 {
                return Err(FirestoreError::InvalidArgument(
                    "find_nearest distance_threshold must be a non-negative finite number".into(),
                ));
            }
        }
        if !query.explicit_order_by.is_empty() {
            return Err(FirestoreError::InvalidArgument(
                "find_nearest cannot be combined with an explicit ordering".into(),
            ));
        }
        if inequality_fields.contains(vq.field_path.as_str()) {
            return Err(FirestoreError::InvalidArgument(
                "find_nearest vector field may not also appear in an inequality filter".into(),
            ));
        }
    }

    Ok(())
}

fn validate_array_operand(values: &[Value], allow_mixed_kinds: bool) -> Result<(), FirestoreError> {
    if values.is_empty() || values.len() > MAX_ARRAY_OPERAND_LEN {
        return Err(FirestoreError::InvalidArgument(format!(
            "array operand length {} out of range [1, {MAX_ARRAY_OPERAND_LEN}]",
            values.len()
        )));
    }
    for v in values {
        if matches!(v, Value::Null) || v.is_nan() {
            return Err(FirestoreError::InvalidArgument(
                "array operand may not contain null or NaN".into(),
            ));
        }
    }
    if !allow_mixed_kinds {
        let mut kind: Option<ValueKind> = None;
        for v in values {
            match kind {
                None => kind = Some(v.kind()),
                Some(existing) if existing != v.kind() => {
                    return Err(FirestoreError::InvalidArgument(
                        "array operand values must share the same kind".into(),
                    ));
                }
                _ => {}
            }
        }
    }
    let mut database: Option<&str> = None;
    for v in values {
        if let Value::Reference(r) = v {
            match database {
                None => database = Some(r.database.as_str()),
                Some(existing) if existing != r.database => {
                    return Err(FirestoreError::InvalidArgument(
                        "reference operands must share the same database".into(),
                    ));
                }
                _ => {}
            }
        }
    }
    Ok(())
}

fn flatten_filters(filter: &Filter) -> Vec<&FieldFilter> {
    let mut out = Vec::new();
    flatten_into(filter, &mut out);
    out
}

fn flatten_into<'a>(filter: &'a Filter, out: &mut Vec<&'a FieldFilter>) {
    match filter {
        Filter::Field(f) => out.push(f),
        Filter::And(fs) | Filter::Or(fs) => {
            for f in fs {
                flatten_into(f, out);
            }
        }
    }
}

/// Walk the tree from `query.parent`, collecting every document path that
/// belongs to a collection matching `query.collection_id` (or any
/// collection, if `None`), recursing into every descendant collection
/// when `query.all_descendants` is set.
fn resolve_candidates(store: &StructuralStore, query: &DocumentQuery) -> Vec<Path> {
    let mut out = Vec::new();
    collect_candidates(store, &query.parent, query, &mut out);
    out
}

fn collect_candidates(store: &StructuralStore, parent: &Path, query: &DocumentQuery, out: &mut Vec<Path>) {
    for collection_id in store.collection_ids_under(parent) {
        let collection_path = parent.child(&collection_id);
        let matches = query
            .collection_id
            .as_deref()
            .is_none_or(|id| id == collection_id.as_ref());
        if matches {
            for doc_id in store.document_ids_under(&collection_path) {
                out.push(collection_path.child(&doc_id));
            }
        }
        if query.all_descendants {
            for doc_id in store.document_ids_under(&collection_path) {
                let doc_path = collection_path.child(&doc_id);
                collect_candidates(store, &doc_path, query, out);
            }
        }
    }
}

/// Evaluate `query` against `store`, resolving each candidate's
/// visibility at `server_time` (and, if `query.consistency` pins a read
/// time, under MVCC history) and testing the survivors against the
/// filter tree.
pub fn evaluate(
    store: &StructuralStore,
    server_time: Timestamp,
    query: &DocumentQuery,
) -> Result<Vec<MetaDocument>, FirestoreError> {
    validate(query)?;

    let read_time = match &query.consistency {
        ReadConsistency::ReadTime(t) => Some(*t),
        _ => None,
    };

    let mut matched: Vec<(MetaDocument, f64)> = Vec::new();
    for path in resolve_candidates(store, query) {
        let Some(node) = store.get_document(&path) else {
            continue;
        };
        let state = match read_time {
            Some(rt) => node.resolve_at(server_time, rt),
            None => node.current_state(),
        };
        if !state.exists {
            continue;
        }
        let data = state.data.as_ref().expect("exists implies data is present");

        if let Some(filter) = &query.filter {
            if !eval_filter(filter, data) {
                continue;
            }
        }

        let distance = match &query.find_nearest {
            Some(vq) => match vector_distance(data, vq) {
                Some(d) if passes_threshold(d, vq.distance_threshold) => d,
                _ => continue,
            },
            None => 0.0,
        };

        matched.push((MetaDocument::from_state(path, server_time, &state), distance));
    }

    if let Some(vq) = &query.find_nearest {
        matched.sort_by(|a, b| a.1.partial_cmp(&b.1).unwrap_or(Ordering::Equal));
        matched.truncate(vq.limit);
    }

    Ok(matched.into_iter().map(|(doc, _)| doc).collect())
}

/// Whether `doc`'s final state belongs to `query`'s watched scope: same
/// parent/collection-id restriction `resolve_candidates` would apply, and
/// (for a document that still exists) the filter tree.
///
/// A deleted document is reported in-scope as long as its path falls under
/// the watched scope, regardless of the filter, since ceasing to exist is
/// itself the change a filtered watcher needs to see as a removal.
pub fn matches_watch(query: &DocumentQuery, doc: &MetaDocument) -> bool {
    if !path_in_scope(&doc.path, query) {
        return false;
    }
    if !doc.exists {
        return true;
    }
    match (&query.filter, &doc.data) {
        (Some(filter), Some(data)) => eval_filter(filter, data),
        (Some(_), None) => false,
        (None, _) => true,
    }
}

fn path_in_scope(path: &Path, query: &DocumentQuery) -> bool {
    let Some(collection) = path.parent() else {
        return false;
    };
    if let Some(id) = &query.collection_id {
        if collection.last_segment() != Some(id.as_str()) {
            return false;
        }
    }
    if query.all_descendants {
        collection_under(&collection, &query.parent)
    } else {
        collection.parent().as_ref() == Some(&query.parent)
    }
}

/// Whether `collection` is `root` itself or nested under it at any depth.
fn collection_under(collection: &Path, root: &Path) -> bool {
    match collection.parent() {
        Some(owner) if owner == *root => true,
        Some(owner) => match owner.parent() {
            Some(grandparent) => collection_under(&grandparent, root),
            None => false,
        },
        None => false,
    }
}

fn eval_filter(filter: &Filter, data: &ValueMap) -> bool {
    match filter {
        Filter::Field(f) => eval_field_filter(f, data),
        Filter::And(fs) => fs.iter().all(|f| eval_filter(f, data)),
        Filter::Or(fs) => fs.iter().any(|f| eval_filter(f, data)),
    }
}

fn eval_field_filter(filter: &FieldFilter, data: &ValueMap) -> bool {
    let value = field_value(data, &filter.field_path);
    match (filter.operator, &filter.operand) {
        (FilterOperator::IsNull, _) => matches!(value, Some(Value::Null)),
        (FilterOperator::IsNotNull, _) => matches!(value, Some(v) if !matches!(v, Value::Null)),
        (FilterOperator::IsNan, _) => value.is_some_and(Value::is_nan),
        (FilterOperator::IsNotNan, _) => {
            matches!(value, Some(v) if matches!(v.kind(), ValueKind::Number) && !v.is_nan())
        }
        (FilterOperator::Equal, FilterOperand::Value(operand)) => {
            value.is_some_and(|v| values_equal(v, operand))
        }
        (FilterOperator::NotEqual, FilterOperand::Value(operand)) => {
            value.is_some_and(|v| !values_equal(v, operand))
        }
        (FilterOperator::LessThan, FilterOperand::Value(operand)) => {
            range_cmp(value, operand, Ordering::Less, false)
        }
        (FilterOperator::LessThanOrEqual, FilterOperand::Value(operand)) => {
            range_cmp(value, operand, Ordering::Less, true)
        }
        (FilterOperator::GreaterThan, FilterOperand::Value(operand)) => {
            range_cmp(value, operand, Ordering::Greater, false)
        }
        (FilterOperator::GreaterThanOrEqual, FilterOperand::Value(operand)) => {
            range_cmp(value, operand, Ordering::Greater, true)
        }
        (FilterOperator::ArrayContains, FilterOperand::Value(operand)) => {
            matches!(value, Some(Value::Array(items)) if items.iter().any(|v| values_equal(v, operand)))
        }
        (FilterOperator::ArrayContainsAny, FilterOperand::Values(operands)) => {
            matches!(value, Some(Value::Array(items)) if items.iter().any(|v| operands.iter().any(|o| values_equal(v, o))))
        }
        (FilterOperator::In, FilterOperand::Values(operands)) => {
            value.is_some_and(|v| operands.iter().any(|o| values_equal(v, o)))
        }
        (FilterOperator::NotIn, FilterOperand::Values(operands)) => {
            value.is_some_and(|v| !operands.iter().any(|o| values_equal(v, o)))
        }
        _ => false,
    }
}

fn range_cmp(value: Option<&Value>, operand: &Value, want: Ordering, allow_equal: bool) -> bool {
    let Some(v) = value else { return false };
    if v.kind() != operand.kind() || !v.is_range_comparable() || !operand.is_range_comparable() {
        return false;
    }
    let ord = compare_values(v, operand);
    ord == want || (allow_equal && ord == Ordering::Equal)
}

fn field_value<'a>(data: &'a ValueMap, field_path: &str) -> Option<&'a Value> {
    let segments: Vec<&str> = field_path.split('.').collect();
    let (last, ancestors) = segments.split_last()?;
    let mut current = data;
    for seg in ancestors {
        match current.get(*seg) {
            Some(Value::Map(nested)) => current = nested,
            _ => return None,
        }
    }
    current.get(*last)
}

/// Distance between a document's vector field and the query vector, or
/// `None` if the field is missing, not a vector, or dimension-mismatched.
///
/// `DotProduct` is negated so that, consistently with the other two
/// measures, a smaller distance always means "closer".
fn vector_distance(data: &ValueMap, query: &VectorQuery) -> Option<f64> {
    let value = field_value(data, &query.field_path)?;
    let dims = match value {
        Value::Vector(d) => d,
        _ => return None,
    };
    if dims.len() != query.query_vector.len() {
        return None;
    }
    let measure = query.distance_measure.unwrap_or(DistanceMeasure::Euclidean);
    Some(match measure {
        DistanceMeasure::Euclidean => dims
            .iter()
            .zip(&query.query_vector)
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f64>()
            .sqrt(),
        DistanceMeasure::Cosine => {
            let dot: f64 = dims.iter().zip(&query.query_vector).map(|(a, b)| a * b).sum();
            let norm_a: f64 = dims.iter().map(|a| a * a).sum::<f64>().sqrt();
            let norm_b: f64 = query.query_vector.iter().map(|b| b * b).sum::<f64>().sqrt();
            if norm_a == 0.0 || norm_b == 0.0 {
                1.0
            } else {
                1.0 - dot / (norm_a * norm_b)
            }
        }
        DistanceMeasure::DotProduct => {
            let dot: f64 = dims.iter().zip(&query.query_vector).map(|(a, b)| a * b).sum();
            -dot
        }
    })
}

fn passes_threshold(distance: f64, threshold: Option<f64>) -> bool {
    threshold.map_or(true, |t| distance <= t)
}
