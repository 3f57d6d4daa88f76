//! Commit Engine
//!
//! Applies a batch of normalized writes to the structural store, either
//! atomically (all-or-nothing) or serially (independent per-op status),
//! with full precondition checking, merge-granularity application, field
//! transforms, and size/depth/vector validation.
//!
//! # Reference
//! An enum-of-ops write shape (`Set`/`Delete`) applied in-process rather
//! than sent over the wire, using `error.rs`'s classification for how
//! validation failures surface.

use crate::error::FirestoreError;
use crate::firestore::clock::TimeSource;
use crate::firestore::meta_document::MetaDocument;
use crate::firestore::path::{Path, PathKind};
use crate::firestore::stats::Statistics;
use crate::firestore::store::{DocumentState, StructuralStore};
use crate::firestore::timestamp::Timestamp;
use crate::firestore::value::{values_equal, Value, ValueMap};

/// Maximum serialized document size, in bytes.
pub const MAX_DOCUMENT_SIZE_BYTES: usize = 1_048_576;
/// Maximum nested map depth.
pub const MAX_MAP_DEPTH: u32 = 20;
/// Maximum array operand length for `in`/`not_in`/`array_contains_any`.
pub const MAX_ARRAY_OPERAND_LEN: usize = 10;
/// Maximum vector dimension.
pub const MAX_VECTOR_DIMENSION: usize = 2048;

/// How a `Set` write's data combines with the document's prior state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeGranularity {
    /// Replace the document's data entirely.
    Root,
    /// Recursively merge maps; scalars, arrays, and kind mismatches are
    /// replaced; unspecified top-level keys are retained.
    Branch,
    /// Apply each explicit field path individually; a field mapped to
    /// `None` in `field_updates` deletes that field; siblings unaffected.
    Node,
}

/// A write precondition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Precondition {
    /// No precondition.
    #[default]
    None,
    /// The document must (`true`) or must not (`false`) exist.
    Exists(bool),
    /// The document's current `update_time` must equal this value
    /// exactly.
    LastUpdateTime(Timestamp),
}

/// A server-side field transform, applied against the field's prior value
/// using the commit's server time.
#[derive(Debug, Clone)]
pub enum FieldTransform {
    /// Replace the field with the commit's server time.
    ServerTime,
    /// Add `n` to the field's prior numeric value (0 if absent).
    Increment(Value),
    /// Append each value not already present (by canonical equality),
    /// preserving existing order.
    ArrayUnion(Vec<Value>),
    /// Remove every element equal (by canonical equality) to any of
    /// these values.
    ArrayRemove(Vec<Value>),
}

/// One field transform, addressed by a dotted field path.
#[derive(Debug, Clone)]
pub struct TransformOp {
    /// Dotted field path, e.g. `"stats.views"`.
    pub field_path: String,
    /// The transform to apply.
    pub transform: FieldTransform,
}

/// A `Set` write.
#[derive(Debug, Clone)]
pub struct NormalizedSet {
    /// Target document path.
    pub path: Path,
    /// Merge granularity.
    pub merge: MergeGranularity,
    /// Full replacement/merge data, used for `Root`/`Branch` merges.
    pub data: ValueMap,
    /// Dotted field path -> new value (`None` deletes the field), used
    /// for `Node` merges.
    pub field_updates: Vec<(String, Option<Value>)>,
    /// Write precondition.
    pub precondition: Precondition,
    /// Field transforms, applied after the merge.
    pub transforms: Vec<TransformOp>,
}

/// One write in a batch.
#[derive(Debug, Clone)]
pub enum NormalizedWrite {
    /// Create or update a document.
    Set(NormalizedSet),
    /// Delete a document.
    Delete {
        /// Target document path.
        path: Path,
        /// Write precondition.
        precondition: Precondition,
    },
}

impl NormalizedWrite {
    fn path(&self) -> &Path {
        match self {
            NormalizedWrite::Set(set) => &set.path,
            NormalizedWrite::Delete { path, .. } => path,
        }
    }
}

/// Atomic (all-or-nothing) or serial (independent per-op status) commit
/// semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Discard every buffered change on the first failure.
    Atomic,
    /// Apply each op independently, recording a status per position.
    Serial,
}

/// The outcome of one write within a serial-mode batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteStatus {
    /// A short status code, e.g. `"OK"` or `"NotFound"`.
    pub code: &'static str,
    /// A descriptive message, absent for `"OK"`.
    pub message: Option<String>,
}

impl WriteStatus {
    fn ok() -> WriteStatus {
        WriteStatus {
            code: "OK",
            message: None,
        }
    }

    fn from_error(err: &FirestoreError) -> WriteStatus {
        WriteStatus {
            code: err.code(),
            message: Some(err.to_string()),
        }
    }
}

/// The result of a commit.
#[derive(Debug, Clone)]
pub struct WriteResult {
    /// The server time assigned to every write in this commit.
    pub server_time: Timestamp,
    /// The resulting document snapshot for every successfully applied
    /// write, in input order.
    pub documents: Vec<MetaDocument>,
    /// Present only in `Serial` mode: one status per input position.
    pub status: Option<Vec<WriteStatus>>,
}

/// Apply `writes` to `store` under `mode`, assigning one commit version
/// and server time (from `clock`) to the whole batch, and updating `stats`
/// accordingly.
pub fn commit(
    store: &mut StructuralStore,
    stats: &mut Statistics,
    clock: &TimeSource,
    writes: Vec<NormalizedWrite>,
    mode: WriteMode,
) -> Result<WriteResult, FirestoreError> {
    for write in &writes {
        write.path().assert_kind(&[PathKind::Document])?;
    }

    let version_before = store.db_version();
    let version = store.next_version();
    let server_time = clock.now();

    let mut buffer: std::collections::HashMap<Path, DocumentState> = std::collections::HashMap::new();
    let mut buffered_state = |store: &StructuralStore, buffer: &mut std::collections::HashMap<Path, DocumentState>, path: &Path| -> DocumentState {
        buffer
            .entry(path.clone())
            .or_insert_with(|| {
                store
                    .get_document(path)
                    .map(|d| d.current_state())
                    .unwrap_or_else(DocumentState::absent)
            })
            .clone()
    };

    match mode {
        WriteMode::Atomic => {
            let mut planned: Vec<(Path, DocumentState, DocumentState)> = Vec::new();
            for write in &writes {
                let path = write.path().clone();
                let current = buffered_state(store, &mut buffer, &path);
                match apply_op(write, &current, server_time, version) {
                    Ok(next) => {
                        buffer.insert(path.clone(), next.clone());
                        planned.push((path, current, next));
                    }
                    Err(err) => {
                        store.force_version(version_before);
                        return Err(err);
                    }
                }
            }

            let mut documents = Vec::with_capacity(planned.len());
            for (path, prior, next) in planned {
                let (applied_prior, applied) = store.apply_write(
                    &path,
                    version,
                    server_time,
                    next.exists,
                    next.data.clone(),
                );
                debug_assert_eq!(applied_prior.exists, prior.exists);
                record_stats(stats, &prior, &applied);
                documents.push(MetaDocument::from_commit(path, server_time, &prior, &applied));
            }
            stats.invalidate_structural();

            Ok(WriteResult {
                server_time,
                documents,
                status: None,
            })
        }
        WriteMode::Serial => {
            let mut documents = Vec::new();
            let mut status = Vec::with_capacity(writes.len());
            for write in &writes {
                let path = write.path().clone();
                let current = buffered_state(store, &mut buffer, &path);
                match apply_op(write, &current, server_time, version) {
                    Ok(next) => {
                        buffer.insert(path.clone(), next.clone());
                        let (_, applied) = store.apply_write(
                            &path,
                            version,
                            server_time,
                            next.exists,
                            next.data.clone(),
                        );
                        record_stats(stats, &current, &applied);
                        documents.push(MetaDocument::from_commit(path, server_time, &current, &applied));
                        status.push(WriteStatus::ok());
                    }
                    Err(err) => {
                        status.push(WriteStatus::from_error(&err));
                    }
                }
            }
            stats.invalidate_structural();

            Ok(WriteResult {
                server_time,
                documents,
                status: Some(status),
            })
        }
    }
}

fn record_stats(stats: &mut Statistics, prior: &DocumentState, applied: &DocumentState) {
    let changed = prior.exists != applied.exists || !data_equal(&prior.data, &applied.data);
    if applied.exists {
        if changed {
            stats.record_write();
        } else {
            stats.record_noop_write();
        }
    } else if prior.exists {
        stats.record_delete();
    } else {
        stats.record_noop_delete();
    }
}

fn data_equal(a: &Option<ValueMap>, b: &Option<ValueMap>) -> bool {
    match (a, b) {
        (None, None) => true,
        (Some(a), Some(b)) => {
            a.len() == b.len()
                && a.iter()
                    .all(|(k, v)| b.get(k).is_some_and(|bv| values_equal(v, bv)))
        }
        _ => false,
    }
}

/// Evaluate one op's precondition and compute its resulting buffered
/// state, without touching the store.
fn apply_op(
    write: &NormalizedWrite,
    current: &DocumentState,
    server_time: Timestamp,
    version: u64,
) -> Result<DocumentState, FirestoreError> {
    match write {
        NormalizedWrite::Set(set) => {
            check_precondition(&set.precondition, current)?;
            let merged = merge_data(current, set)?;
            let transformed = apply_transforms(merged, current, &set.transforms, server_time);
            validate_document(&set.path, &transformed)?;
            Ok(DocumentState {
                exists: true,
                create_time: current.create_time.or(Some(server_time)),
                update_time: server_time,
                version,
                data: Some(transformed),
            })
        }
        NormalizedWrite::Delete { precondition, .. } => {
            check_precondition(precondition, current)?;
            if !current.exists {
                return Ok(current.clone());
            }
            Ok(DocumentState {
                exists: false,
                create_time: None,
                update_time: server_time,
                version,
                data: None,
            })
        }
    }
}

fn check_precondition(precondition: &Precondition, current: &DocumentState) -> Result<(), FirestoreError> {
    match precondition {
        Precondition::None => Ok(()),
        Precondition::Exists(true) => {
            if current.exists {
                Ok(())
            } else {
                Err(FirestoreError::NotFound(
                    "precondition exists=true failed".into(),
                ))
            }
        }
        Precondition::Exists(false) => {
            if current.exists {
                Err(FirestoreError::AlreadyExists(
                    "precondition exists=false failed".into(),
                ))
            } else {
                Ok(())
            }
        }
        Precondition::LastUpdateTime(expected) => {
            if current.update_time == *expected {
                Ok(())
            } else {
                Err(FirestoreError::FailedPrecondition(
                    "last_update_time precondition mismatch".into(),
                ))
            }
        }
    }
}

fn merge_data(current: &DocumentState, set: &NormalizedSet) -> Result<ValueMap, FirestoreError> {
    match set.merge {
        MergeGranularity::Root => Ok(set.data.clone()),
        MergeGranularity::Branch => {
            let base = current.data.clone().unwrap_or_default();
            Ok(merge_branch(&base, &set.data))
        }
        MergeGranularity::Node => {
            let mut result = current.data.clone().unwrap_or_default();
            for (dotted, value) in &set.field_updates {
                let segments: Vec<&str> = dotted.split('.').collect();
                match value {
                    Some(v) => set_at_path(&mut result, &segments, v.clone()),
                    None => {
                        delete_at_path(&mut result, &segments);
                    }
                }
            }
            Ok(result)
        }
    }
}

fn merge_branch(base: &ValueMap, overlay: &ValueMap) -> ValueMap {
    let mut result = base.clone();
    for (key, new_value) in overlay {
        match (result.get(key), new_value) {
            (Some(Value::Map(old_nested)), Value::Map(new_nested)) => {
                result.insert(key.clone(), Value::Map(merge_branch(old_nested, new_nested)));
            }
            _ => {
                result.insert(key.clone(), new_value.clone());
            }
        }
    }
    result
}

fn set_at_path(map: &mut ValueMap, segments: &[&str], value: Value) {
    if segments.is_empty() {
        return;
    }
    if segments.len() == 1 {
        map.insert(segments[0].to_string(), value);
        return;
    }
    let head = segments[0];
    let entry = map
        .entry(head.to_string())
        .or_insert_with(|| Value::Map(ValueMap::new()));
    if !matches!(entry, Value::Map(_)) {
        *entry = Value::Map(ValueMap::new());
    }
    if let Value::Map(nested) = entry {
        set_at_path(nested, &segments[1..], value);
    }
}

fn delete_at_path(map: &mut ValueMap, segments: &[&str]) {
    if segments.is_empty() {
        return;
    }
    if segments.len() == 1 {
        map.remove(segments[0]);
        return;
    }
    if let Some(Value::Map(nested)) = map.get_mut(segments[0]) {
        delete_at_path(nested, &segments[1..]);
    }
}

fn get_at_path<'a>(map: &'a ValueMap, segments: &[&str]) -> Option<&'a Value> {
    if segments.is_empty() {
        return None;
    }
    let value = map.get(segments[0])?;
    if segments.len() == 1 {
        return Some(value);
    }
    match value {
        Value::Map(nested) => get_at_path(nested, &segments[1..]),
        _ => None,
    }
}

fn apply_transforms(
    mut data: ValueMap,
    current: &DocumentState,
    transforms: &[TransformOp],
    server_time: Timestamp,
) -> ValueMap {
    let empty = ValueMap::new();
    let prior_data = current.data.as_ref().unwrap_or(&empty);
    for op in transforms {
        let segments: Vec<&str> = op.field_path.split('.').collect();
        let prior_value = get_at_path(prior_data, &segments).cloned();
        let new_value = match &op.transform {
            FieldTransform::ServerTime => Value::Timestamp(server_time),
            FieldTransform::Increment(delta) => apply_increment(prior_value.as_ref(), delta),
            FieldTransform::ArrayUnion(values) => apply_array_union(prior_value.as_ref(), values),
            FieldTransform::ArrayRemove(values) => apply_array_remove(prior_value.as_ref(), values),
        };
        set_at_path(&mut data, &segments, new_value);
    }
    data
}

fn apply_increment(prior: Option<&Value>, delta: &Value) -> Value {
    let prior_is_double = matches!(prior, Some(Value::Double(_)));
    let delta_is_double = matches!(delta, Value::Double(_));
    let prior_num = match prior {
        Some(Value::Integer(i)) => *i as f64,
        Some(Value::Double(d)) => *d,
        _ => 0.0,
    };
    let delta_num = match delta {
        Value::Integer(i) => *i as f64,
        Value::Double(d) => *d,
        _ => 0.0,
    };
    if prior_is_double || delta_is_double {
        Value::Double(prior_num + delta_num)
    } else {
        let prior_int = match prior {
            Some(Value::Integer(i)) => *i,
            _ => 0,
        };
        let delta_int = match delta {
            Value::Integer(i) => *i,
            _ => 0,
        };
        Value::Integer(prior_int.wrapping_add(delta_int))
    }
}

fn apply_array_union(prior: Option<&Value>, values: &[Value]) -> Value {
    let mut result: Vec<Value> = match prior {
        Some(Value::Array(items)) => items.clone(),
        _ => Vec::new(),
    };
    for v in values {
        if !result.iter().any(|existing| values_equal(existing, v)) {
            result.push(v.clone());
        }
    }
    Value::Array(result)
}

fn apply_array_remove(prior: Option<&Value>, values: &[Value]) -> Value {
    let result: Vec<Value> = match prior {
        Some(Value::Array(items)) => items
            .iter()
            .filter(|existing| !values.iter().any(|v| values_equal(existing, v)))
            .cloned()
            .collect(),
        _ => Vec::new(),
    };
    Value::Array(result)
}

fn validate_document(path: &Path, data: &ValueMap) -> Result<(), FirestoreError> {
    let depth = map_depth(data);
    if depth > MAX_MAP_DEPTH {
        return Err(FirestoreError::InvalidArgument(format!(
            "nested map depth {depth} exceeds the maximum of {MAX_MAP_DEPTH}"
        )));
    }
    validate_vectors(data)?;
    let size = document_size(path, data);
    if size > MAX_DOCUMENT_SIZE_BYTES {
        return Err(FirestoreError::InvalidArgument(format!(
            "serialized document size {size} exceeds the maximum of {MAX_DOCUMENT_SIZE_BYTES} bytes"
        )));
    }
    Ok(())
}

fn map_depth(data: &ValueMap) -> u32 {
    1 + data.values().map(value_depth).max().unwrap_or(0)
}

fn value_depth(value: &Value) -> u32 {
    match value {
        Value::Map(nested) => map_depth(nested),
        Value::Array(items) => items.iter().map(value_depth).max().unwrap_or(0),
        _ => 0,
    }
}

fn validate_vectors(data: &ValueMap) -> Result<(), FirestoreError> {
    for value in data.values() {
        validate_value_vectors(value)?;
    }
    Ok(())
}

fn validate_value_vectors(value: &Value) -> Result<(), FirestoreError> {
    match value {
        Value::Vector(dims) => {
            if dims.is_empty() || dims.len() > MAX_VECTOR_DIMENSION {
                return Err(FirestoreError::InvalidArgument(format!(
                    "vector dimension {} out of range [1, {MAX_VECTOR_DIMENSION}]",
                    dims.len()
                )));
            }
            if dims.iter().any(|d| !d.is_finite()) {
                return Err(FirestoreError::InvalidArgument(
                    "vector values must be finite".into(),
                ));
            }
            Ok(())
        }
        Value::Map(nested) => validate_vectors(nested),
        Value::Array(items) => {
            for item in items {
                validate_value_vectors(item)?;
            }
            Ok(())
        }
        _ => Ok(()),
    }
}

/// Approximate serialized size: document name + 32-byte overhead, plus
/// each field's name and value size, with vectors costed as `8 * dim`
/// (advisory, not a guarantee of exact wire-size parity) and references
/// as their path's byte length.
fn document_size(path: &Path, data: &ValueMap) -> usize {
    path.as_str().len() + 32 + data.iter().map(|(k, v)| k.len() + value_size(v)).sum::<usize>()
}

fn value_size(value: &Value) -> usize {
    match value {
        Value::Null => 1,
        Value::Boolean(_) => 1,
        Value::Integer(_) => 8,
        Value::Double(_) => 8,
        Value::String(s) => s.len(),
        Value::Bytes(b) => b.len(),
        Value::Timestamp(_) => 8,
        Value::GeoPoint(_) => 16,
        Value::Reference(r) => r.path.as_str().len(),
        Value::Array(items) => items.iter().map(value_size).sum(),
        Value::Vector(dims) => 8 * dims.len(),
        Value::Map(nested) => nested.iter().map(|(k, v)| k.len() + value_size(v)).sum(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::clock::TimeSource;

    fn path(s: &str) -> Path {
        Path::parse(s).unwrap()
    }

    fn set(path_str: &str, field: &str, n: i64) -> NormalizedWrite {
        let mut data = ValueMap::new();
        data.insert(field.to_string(), Value::Integer(n));
        NormalizedWrite::Set(NormalizedSet {
            path: path(path_str),
            merge: MergeGranularity::Root,
            data,
            field_updates: Vec::new(),
            precondition: Precondition::None,
            transforms: Vec::new(),
        })
    }

    #[test]
    fn scenario_1_repeat_write_then_change_tracks_noop_and_write_counts() {
        let mut store = StructuralStore::new();
        let mut stats = Statistics::new();
        let clock = TimeSource::constant(Timestamp::new(0, 0).unwrap());

        commit(&mut store, &mut stats, &clock, vec![set("users/u1", "n", 1)], WriteMode::Atomic).unwrap();
        commit(&mut store, &mut stats, &clock, vec![set("users/u1", "n", 1)], WriteMode::Atomic).unwrap();
        commit(&mut store, &mut stats, &clock, vec![set("users/u1", "n", 2)], WriteMode::Atomic).unwrap();

        let ops = stats.operational();
        assert_eq!(ops.writes, 2);
        assert_eq!(ops.noop_writes, 1);
        assert_eq!(store.get_document(&path("users/u1")).unwrap().current_state().version, 3);
    }

    #[test]
    fn scenario_2_atomic_failure_leaves_version_and_state_unchanged() {
        let mut store = StructuralStore::new();
        let mut stats = Statistics::new();
        let clock = TimeSource::constant(Timestamp::new(0, 0).unwrap());

        let writes = vec![
            set("users/u1", "a", 1),
            NormalizedWrite::Delete {
                path: path("users/u2"),
                precondition: Precondition::Exists(true),
            },
        ];
        let version_before = store.db_version();
        let result = commit(&mut store, &mut stats, &clock, writes, WriteMode::Atomic);
        assert!(matches!(result, Err(FirestoreError::NotFound(_))));
        assert_eq!(store.db_version(), version_before);
        assert!(!store.get_document(&path("users/u1")).unwrap().exists());
    }

    #[test]
    fn scenario_3_serial_batch_records_per_op_status() {
        let mut store = StructuralStore::new();
        let mut stats = Statistics::new();
        let clock = TimeSource::constant(Timestamp::new(0, 0).unwrap());

        let mut second_data = ValueMap::new();
        second_data.insert("b".to_string(), Value::Integer(2));
        let writes = vec![
            set("users/u1", "a", 1),
            NormalizedWrite::Set(NormalizedSet {
                path: path("users/u1"),
                merge: MergeGranularity::Root,
                data: second_data,
                field_updates: Vec::new(),
                precondition: Precondition::Exists(false),
                transforms: Vec::new(),
            }),
        ];
        let result = commit(&mut store, &mut stats, &clock, writes, WriteMode::Serial).unwrap();
        let status = result.status.unwrap();
        assert_eq!(status[0].code, "OK");
        assert_eq!(status[1].code, "AlreadyExists");

        let final_doc = store.get_document(&path("users/u1")).unwrap().current_state();
        let expected: ValueMap = {
            let mut m = ValueMap::new();
            m.insert("a".to_string(), Value::Integer(1));
            m
        };
        assert!(data_equal(&final_doc.data, &Some(expected)));
    }

    #[test]
    fn branch_merge_retains_unspecified_sibling_keys() {
        let mut store = StructuralStore::new();
        let mut stats = Statistics::new();
        let clock = TimeSource::constant(Timestamp::new(0, 0).unwrap());

        commit(&mut store, &mut stats, &clock, vec![set("users/u1", "a", 1)], WriteMode::Atomic).unwrap();

        let mut overlay = ValueMap::new();
        overlay.insert("b".to_string(), Value::Integer(2));
        let writes = vec![NormalizedWrite::Set(NormalizedSet {
            path: path("users/u1"),
            merge: MergeGranularity::Branch,
            data: overlay,
            field_updates: Vec::new(),
            precondition: Precondition::None,
            transforms: Vec::new(),
        })];
        commit(&mut store, &mut stats, &clock, writes, WriteMode::Atomic).unwrap();

        let final_data = store.get_document(&path("users/u1")).unwrap().current_state().data.unwrap();
        assert!(matches!(final_data.get("a"), Some(Value::Integer(1))));
        assert!(matches!(final_data.get("b"), Some(Value::Integer(2))));
    }

    #[test]
    fn node_merge_deletes_only_the_named_field() {
        let mut store = StructuralStore::new();
        let mut stats = Statistics::new();
        let clock = TimeSource::constant(Timestamp::new(0, 0).unwrap());

        let mut initial = ValueMap::new();
        initial.insert("a".to_string(), Value::Integer(1));
        initial.insert("b".to_string(), Value::Integer(2));
        commit(
            &mut store,
            &mut stats,
            &clock,
            vec![NormalizedWrite::Set(NormalizedSet {
                path: path("users/u1"),
                merge: MergeGranularity::Root,
                data: initial,
                field_updates: Vec::new(),
                precondition: Precondition::None,
                transforms: Vec::new(),
            })],
            WriteMode::Atomic,
        )
        .unwrap();

        commit(
            &mut store,
            &mut stats,
            &clock,
            vec![NormalizedWrite::Set(NormalizedSet {
                path: path("users/u1"),
                merge: MergeGranularity::Node,
                data: ValueMap::new(),
                field_updates: vec![("a".to_string(), None)],
                precondition: Precondition::None,
                transforms: Vec::new(),
            })],
            WriteMode::Atomic,
        )
        .unwrap();

        let final_data = store.get_document(&path("users/u1")).unwrap().current_state().data.unwrap();
        assert!(final_data.get("a").is_none());
        assert!(matches!(final_data.get("b"), Some(Value::Integer(2))));
    }

    #[test]
    fn increment_transform_adds_to_prior_value() {
        let mut store = StructuralStore::new();
        let mut stats = Statistics::new();
        let clock = TimeSource::constant(Timestamp::new(0, 0).unwrap());

        commit(&mut store, &mut stats, &clock, vec![set("users/u1", "n", 5)], WriteMode::Atomic).unwrap();

        let writes = vec![NormalizedWrite::Set(NormalizedSet {
            path: path("users/u1"),
            merge: MergeGranularity::Branch,
            data: ValueMap::new(),
            field_updates: Vec::new(),
            precondition: Precondition::None,
            transforms: vec![TransformOp {
                field_path: "n".to_string(),
                transform: FieldTransform::Increment(Value::Integer(3)),
            }],
        })];
        commit(&mut store, &mut stats, &clock, writes, WriteMode::Atomic).unwrap();

        let final_data = store.get_document(&path("users/u1")).unwrap().current_state().data.unwrap();
        assert!(matches!(final_data.get("n"), Some(Value::Integer(8))));
    }

    #[test]
    fn array_union_deduplicates_and_preserves_order() {
        let prior = Value::Array(vec![Value::Integer(1), Value::Integer(2)]);
        let result = apply_array_union(Some(&prior), &[Value::Integer(2), Value::Integer(3)]);
        match result {
            Value::Array(items) => {
                assert_eq!(items.len(), 3);
                assert!(matches!(items[0], Value::Integer(1)));
                assert!(matches!(items[2], Value::Integer(3)));
            }
            _ => panic!("expected array"),
        }
    }

    #[test]
    fn document_size_boundary_is_enforced() {
        let path = path("d/x");
        let mut data = ValueMap::new();
        // path "d/x" is 3 bytes, overhead 32, field name "s" is 1 byte:
        // budget for the string value is 1_048_576 - 3 - 32 - 1.
        let budget = MAX_DOCUMENT_SIZE_BYTES - path.as_str().len() - 32 - 1;
        data.insert("s".to_string(), Value::String("a".repeat(budget)));
        assert!(validate_document(&path, &data).is_ok());

        let mut too_big = ValueMap::new();
        too_big.insert("s".to_string(), Value::String("a".repeat(budget + 1)));
        assert!(validate_document(&path, &too_big).is_err());
    }

    #[test]
    fn map_depth_boundary_is_enforced() {
        fn nest(depth: u32) -> Value {
            if depth == 0 {
                Value::Integer(1)
            } else {
                let mut m = ValueMap::new();
                m.insert("n".to_string(), nest(depth - 1));
                Value::Map(m)
            }
        }
        let p = path("d/x");

        let mut ok = ValueMap::new();
        ok.insert("n".to_string(), nest(19));
        assert!(validate_document(&p, &ok).is_ok());

        let mut too_deep = ValueMap::new();
        too_deep.insert("n".to_string(), nest(20));
        assert!(validate_document(&p, &too_deep).is_err());
    }
}
