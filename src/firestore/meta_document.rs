//! MetaDocument: the frozen snapshot returned to every external caller.
//!
//! # Reference
//! A plain value type (`exists`/`data`/metadata, in the shape of a
//! `DocumentSnapshot`) rather than a response wrapper tied to a live
//! connection; the commit engine, query evaluator, and dispatch layer all
//! produce and pass it around directly.

use crate::firestore::path::Path;
use crate::firestore::store::DocumentState;
use crate::firestore::timestamp::Timestamp;
use crate::firestore::value::{values_equal, ValueMap};

/// Deep-equality over two optional field-data maps, using the same
/// equality relation as query filters (`values_equal`) rather than
/// `Value`'s ordinary comparator, since `Value` has no blanket
/// `PartialEq` (NaN/type-mismatch equality is context-dependent).
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

/// A deeply-immutable snapshot of one document's state, handed to callers
/// across the commit, query, and dispatch surfaces.
///
/// `data` is never mutated in place; [`MetaDocument::clone_data`] is the
/// only way to get an owned, independently-mutable copy.
#[derive(Debug, Clone)]
pub struct MetaDocument {
    /// The document's parent collection path.
    pub parent: Path,
    /// The document's full path.
    pub path: Path,
    /// The document's ID (its path's last segment).
    pub id: String,
    /// Whether the document currently exists.
    pub exists: bool,
    /// The server time of the operation that produced this snapshot.
    pub server_time: Timestamp,
    /// The time of the most recent change visible in this snapshot.
    pub update_time: Timestamp,
    /// The commit version that produced this snapshot.
    pub version: u64,
    /// Time of first creation, present iff the document has ever existed.
    pub create_time: Option<Timestamp>,
    /// Field data, present iff `exists`.
    pub data: Option<ValueMap>,
    /// Whether this snapshot's data differs from the state immediately
    /// prior to the producing operation.
    pub has_changes: bool,
    /// The document's state immediately prior to the producing operation.
    /// Present only when `has_changes` is true.
    pub previous: Option<Box<MetaDocument>>,
}

impl MetaDocument {
    /// Build a `MetaDocument` from a resolved [`DocumentState`].
    pub fn from_state(path: Path, server_time: Timestamp, state: &DocumentState) -> MetaDocument {
        let id = path.last_segment().unwrap_or_default().to_string();
        let parent = path.parent().unwrap_or_else(Path::root);
        MetaDocument {
            parent,
            path,
            id,
            exists: state.exists,
            server_time,
            update_time: state.update_time,
            version: state.version,
            create_time: state.create_time,
            data: state.data.clone(),
            has_changes: false,
            previous: None,
        }
    }

    /// Build a `MetaDocument` representing a commit result, comparing
    /// `applied` against `prior` to determine `has_changes` via deep
    /// equality of the data maps (and the existence flag).
    pub fn from_commit(
        path: Path,
        server_time: Timestamp,
        prior: &DocumentState,
        applied: &DocumentState,
    ) -> MetaDocument {
        let has_changes = prior.exists != applied.exists || !data_equal(&prior.data, &applied.data);
        let mut doc = MetaDocument::from_state(path.clone(), server_time, applied);
        doc.has_changes = has_changes;
        if has_changes {
            let mut previous = MetaDocument::from_state(path, server_time, prior);
            previous.has_changes = false;
            doc.previous = Some(Box::new(previous));
        }
        doc
    }

    /// An owned, independently-mutable copy of this document's field
    /// data.
    pub fn clone_data(&self) -> Option<ValueMap> {
        self.data.clone()
    }
}
