//! Value Model & Comparator
//!
//! `Value` is the in-memory field value type every stored document, query
//! filter literal, and transform operand is built from. `compare_values`
//! implements Firestore's total order across heterogeneous value kinds;
//! `values_equal` implements the separate equality relation used by the
//! `eq`/`!=`/array-membership operators and by map-key comparison.
//!
//! # Reference
//! An owned, comparator-bearing value type built around `timestamp.rs`
//! and `geo_point.rs`, rather than a thin protobuf re-export.

use crate::firestore::geo_point::GeoPoint;
use crate::firestore::path::Path;
use crate::firestore::timestamp::Timestamp;
use std::cmp::Ordering;
use std::collections::BTreeMap;

/// A document reference value: a path plus the database it belongs to.
///
/// Kept distinct from `Path` (the structural-store address type) because a
/// reference value, unlike a path, also carries cross-database identity.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ReferenceValue {
    /// Identifier of the owning database, e.g. `"(default)"`.
    pub database: String,
    /// Path to the referenced document.
    pub path: Path,
}

/// An ordered map of field values.
///
/// Backed by `BTreeMap` so iteration and comparison both see keys in
/// ascending order, matching the map-comparison rule in [`compare_values`].
pub type ValueMap = BTreeMap<String, Value>;

/// A field value.
///
/// Variants are grouped into "kinds" for ordering purposes: `Integer` and
/// `Double` are both the `number` kind; everything else is its own kind.
#[derive(Debug, Clone)]
pub enum Value {
    /// The absence of a meaningful value, distinct from a field being
    /// unset entirely.
    Null,
    /// A boolean.
    Boolean(bool),
    /// A 64-bit signed integer.
    Integer(i64),
    /// A 64-bit float, including `NaN` and signed infinities.
    Double(f64),
    /// A UTF-8 string, compared byte-wise (Unicode code point order).
    String(String),
    /// Opaque bytes, compared byte-wise.
    Bytes(Vec<u8>),
    /// A timestamp.
    Timestamp(Timestamp),
    /// A geographic point, compared by latitude then longitude.
    GeoPoint(GeoPoint),
    /// A document reference.
    Reference(ReferenceValue),
    /// An ordered list of values, compared element-wise.
    Array(Vec<Value>),
    /// A fixed-length numeric vector used for nearest-neighbor queries.
    Vector(Vec<f64>),
    /// A nested map of field values.
    Map(ValueMap),
}

/// The kind bucket a `Value` falls into for total-ordering purposes.
///
/// Ordered ascending to match the Firestore value-kind total order:
/// `null < boolean < number < timestamp < string < bytes < reference <
/// geopoint < array < vector < map`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ValueKind {
    /// `Value::Null`.
    Null,
    /// `Value::Boolean`.
    Boolean,
    /// `Value::Integer` or `Value::Double`.
    Number,
    /// `Value::Timestamp`.
    Timestamp,
    /// `Value::String`.
    String,
    /// `Value::Bytes`.
    Bytes,
    /// `Value::Reference`.
    Reference,
    /// `Value::GeoPoint`.
    GeoPoint,
    /// `Value::Array`.
    Array,
    /// `Value::Vector`.
    Vector,
    /// `Value::Map`.
    Map,
}

impl Value {
    /// The ordering kind this value belongs to.
    pub fn kind(&self) -> ValueKind {
        match self {
            Value::Null => ValueKind::Null,
            Value::Boolean(_) => ValueKind::Boolean,
            Value::Integer(_) | Value::Double(_) => ValueKind::Number,
            Value::Timestamp(_) => ValueKind::Timestamp,
            Value::String(_) => ValueKind::String,
            Value::Bytes(_) => ValueKind::Bytes,
            Value::Reference(_) => ValueKind::Reference,
            Value::GeoPoint(_) => ValueKind::GeoPoint,
            Value::Array(_) => ValueKind::Array,
            Value::Vector(_) => ValueKind::Vector,
            Value::Map(_) => ValueKind::Map,
        }
    }

    /// Whether this value is the floating-point NaN.
    pub fn is_nan(&self) -> bool {
        matches!(self, Value::Double(d) if d.is_nan())
    }

    /// Whether this kind participates in range operators (`<`, `<=`, `>`,
    /// `>=`). Null and NaN values are excluded even though `Null` and
    /// `Number` are themselves orderable kinds.
    pub fn is_range_comparable(&self) -> bool {
        !matches!(self, Value::Null) && !self.is_nan()
    }
}

fn compare_numbers(a: f64, b: f64) -> Ordering {
    if a.is_nan() && b.is_nan() {
        return Ordering::Equal;
    }
    if a.is_nan() {
        return Ordering::Less;
    }
    if b.is_nan() {
        return Ordering::Greater;
    }
    // IEEE 754 equality already treats +0.0 and -0.0 as equal, so a plain
    // partial_cmp gives the right answer for signed zero without special
    // casing.
    a.partial_cmp(&b).expect("non-NaN floats are totally ordered")
}

fn number_as_f64(v: &Value) -> f64 {
    match v {
        Value::Integer(i) => *i as f64,
        Value::Double(d) => *d,
        _ => unreachable!("number_as_f64 called on a non-number value"),
    }
}

/// Compare two values under Firestore's total order.
///
/// Values of different kinds compare by kind rank first. Within the same
/// kind, `Integer` and `Double` numbers compare numerically regardless of
/// which variant they're stored as.
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    let (ka, kb) = (a.kind(), b.kind());
    if ka != kb {
        return ka.cmp(&kb);
    }
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Boolean(x), Value::Boolean(y)) => x.cmp(y),
        (Value::Integer(x), Value::Integer(y)) => x.cmp(y),
        (Value::Integer(_), Value::Double(_)) | (Value::Double(_), Value::Integer(_)) => {
            compare_numbers(number_as_f64(a), number_as_f64(b))
        }
        (Value::Double(x), Value::Double(y)) => compare_numbers(*x, *y),
        (Value::Timestamp(x), Value::Timestamp(y)) => x.cmp(y),
        (Value::String(x), Value::String(y)) => x.cmp(y),
        (Value::Bytes(x), Value::Bytes(y)) => x.cmp(y),
        (Value::Reference(x), Value::Reference(y)) => compare_references(x, y),
        (Value::GeoPoint(x), Value::GeoPoint(y)) => (x.latitude, x.longitude)
            .partial_cmp(&(y.latitude, y.longitude))
            .unwrap_or(Ordering::Equal),
        (Value::Array(x), Value::Array(y)) => compare_sequences(x, y),
        (Value::Vector(x), Value::Vector(y)) => compare_number_slices(x, y),
        (Value::Map(x), Value::Map(y)) => compare_maps(x, y),
        _ => unreachable!("kind equality already matched the variant pair"),
    }
}

/// Reference comparison: path segments compare left to right, with the
/// numeric sentinel `__id<n>__` sorting before any ordinary string segment
/// at the same depth. Shorter paths sort before their extensions.
fn compare_references(a: &ReferenceValue, b: &ReferenceValue) -> Ordering {
    match a.database.cmp(&b.database) {
        Ordering::Equal => {}
        other => return other,
    }
    let (sa, sb) = (a.path.segments(), b.path.segments());
    for (x, y) in sa.iter().zip(sb.iter()) {
        let ord = compare_path_segments(x, y);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    sa.len().cmp(&sb.len())
}

fn numeric_id_sentinel(segment: &str) -> Option<i64> {
    let inner = segment.strip_prefix("__id")?.strip_suffix("__")?;
    inner.parse::<i64>().ok()
}

fn compare_path_segments(a: &str, b: &str) -> Ordering {
    match (numeric_id_sentinel(a), numeric_id_sentinel(b)) {
        (Some(x), Some(y)) => x.cmp(&y),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => a.cmp(b),
    }
}

fn compare_sequences(a: &[Value], b: &[Value]) -> Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        let ord = compare_values(x, y);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

fn compare_number_slices(a: &[f64], b: &[f64]) -> Ordering {
    for (x, y) in a.iter().zip(b.iter()) {
        let ord = compare_numbers(*x, *y);
        if ord != Ordering::Equal {
            return ord;
        }
    }
    a.len().cmp(&b.len())
}

/// Map comparison: keys already iterate in ascending order via `BTreeMap`;
/// compare key/value pairs in lockstep, falling back to entry count on a
/// tie (the shorter map sorts first).
fn compare_maps(a: &ValueMap, b: &ValueMap) -> Ordering {
    for ((ka, va), (kb, vb)) in a.iter().zip(b.iter()) {
        let key_ord = ka.cmp(kb);
        if key_ord != Ordering::Equal {
            return key_ord;
        }
        let val_ord = compare_values(va, vb);
        if val_ord != Ordering::Equal {
            return val_ord;
        }
    }
    a.len().cmp(&b.len())
}

/// Equality relation used by `eq`/`!=` filters, `array_contains`/`in`
/// membership, and map-key deduplication.
///
/// Differs from `compare_values(..) == Ordering::Equal` in exactly one
/// way: values of different kinds are never equal, matching a strict
/// type-mismatch-is-inequality rule, whereas the comparator above still
/// needs *some* order between differing kinds for sort purposes.
pub fn values_equal(a: &Value, b: &Value) -> bool {
    if a.kind() != b.kind() {
        return false;
    }
    compare_values(a, b) == Ordering::Equal
}
