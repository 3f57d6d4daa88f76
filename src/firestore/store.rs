//! Structural Store & MVCC/History
//!
//! Owns every `MasterDocument` and `InternalCollection` node the database
//! has ever lazily created, plus each document's bounded history chain.
//! This module has no notion of transactions, preconditions, or commit
//! ordering — the Commit Engine drives it; it only enforces the
//! active/stub counter invariants and the historical-window read rule.
//!
//! # Reference
//! A plain, lock-free struct owning its registry of nodes directly,
//! rather than a singleton behind a global lock; the controller wraps the
//! whole thing in a single `tokio::sync::Mutex`.

use crate::firestore::path::{Path, PathKind};
use crate::firestore::timestamp::Timestamp;
use crate::firestore::value::ValueMap;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// A single historical snapshot of a document, captured the instant
/// before an overwriting change.
#[derive(Debug, Clone)]
pub struct HistoricDocument {
    /// Commit version that produced this snapshot.
    pub version: u64,
    /// `create_time` at the moment this snapshot was captured.
    pub create_time: Option<Timestamp>,
    /// `update_time` at the moment this snapshot was captured.
    pub update_time: Timestamp,
    /// Whether the document existed at this snapshot.
    pub exists: bool,
    /// The document's field data at this snapshot, if it existed.
    pub data: Option<ValueMap>,
}

/// An owned view of a document's state at some point in time, returned by
/// both current-state and historical lookups.
#[derive(Debug, Clone)]
pub struct DocumentState {
    /// Whether the document exists at this state.
    pub exists: bool,
    /// Time the document was first created, if it has ever existed.
    pub create_time: Option<Timestamp>,
    /// Time of the most recent change visible at this state.
    pub update_time: Timestamp,
    /// Commit version that produced this state.
    pub version: u64,
    /// Field data, present iff `exists`.
    pub data: Option<ValueMap>,
}

impl DocumentState {
    /// The canonical "never existed" state: zero version, zero time, no
    /// data.
    pub fn absent() -> DocumentState {
        DocumentState {
            exists: false,
            create_time: None,
            update_time: Timestamp::new(0, 0).expect("0 nanoseconds is always valid"),
            version: 0,
            data: None,
        }
    }
}

/// The structural node owning one document path's current state and
/// history, plus the set of child collection IDs rooted at it.
pub struct MasterDocument {
    exists: bool,
    create_time: Option<Timestamp>,
    update_time: Timestamp,
    version: u64,
    data: Option<ValueMap>,
    history: Vec<HistoricDocument>,
    /// Immediate child collection IDs (a collection ID may exist here
    /// whether or not that collection currently holds any active
    /// documents).
    child_collection_ids: BTreeSet<Arc<str>>,
    /// Active + stub existing documents at or below this node.
    leaf_count: u64,
}

impl MasterDocument {
    fn new_absent() -> MasterDocument {
        MasterDocument {
            exists: false,
            create_time: None,
            update_time: Timestamp::new(0, 0).expect("0 nanoseconds is always valid"),
            version: 0,
            data: None,
            history: Vec::new(),
            child_collection_ids: BTreeSet::new(),
            leaf_count: 0,
        }
    }

    /// Whether the document currently exists.
    pub fn exists(&self) -> bool {
        self.exists
    }

    /// Active + stub leaf documents at or below this node.
    pub fn leaf_count(&self) -> u64 {
        self.leaf_count
    }

    /// A document is a *stub* iff it doesn't exist but anchors existing
    /// descendants.
    pub fn is_stub(&self) -> bool {
        !self.exists && self.leaf_count > 0
    }

    /// The current document state as an owned snapshot.
    pub fn current_state(&self) -> DocumentState {
        DocumentState {
            exists: self.exists,
            create_time: self.create_time,
            update_time: self.update_time,
            version: self.version,
            data: self.data.clone(),
        }
    }

    /// Immediate child collection IDs.
    pub fn child_collection_ids(&self) -> impl Iterator<Item = &str> {
        self.child_collection_ids.iter().map(|s| s.as_ref())
    }

    /// Resolve this document's visible state as of `read_time`, given the
    /// current `server_time`.
    ///
    /// - If `read_time >= update_time`, the current state is visible.
    /// - If the historical window (60s) has been exceeded, returns the
    ///   absent state rather than an error.
    /// - Otherwise scans history newest-first for the first snapshot whose
    ///   `update_time <= read_time`.
    pub fn resolve_at(&self, server_time: Timestamp, read_time: Timestamp) -> DocumentState {
        if read_time >= self.update_time {
            return self.current_state();
        }
        if seconds_between(server_time, read_time) > HISTORICAL_WINDOW_SECONDS {
            return DocumentState::absent();
        }
        for entry in self.history.iter().rev() {
            if entry.update_time <= read_time {
                return DocumentState {
                    exists: entry.exists,
                    create_time: entry.create_time,
                    update_time: entry.update_time,
                    version: entry.version,
                    data: entry.data.clone(),
                };
            }
        }
        DocumentState::absent()
    }
}

/// The historical read window: a snapshot older than this relative to
/// `now` is no longer addressable via `read_time`.
pub const HISTORICAL_WINDOW_SECONDS: i64 = 60;

fn seconds_between(later: Timestamp, earlier: Timestamp) -> i64 {
    later.seconds - earlier.seconds
        + if later.nanoseconds < earlier.nanoseconds {
            -1
        } else {
            0
        }
}

/// The structural node owning one collection path's immediate document
/// IDs and their aggregate counters.
pub struct InternalCollection {
    /// Every document ID ever ensured under this collection (active or
    /// stub).
    document_ids: BTreeSet<Arc<str>>,
    /// Immediate children that currently exist.
    active_doc_count: u64,
    /// Existing documents at any depth beneath this collection.
    leaf_count: u64,
}

impl InternalCollection {
    fn new() -> InternalCollection {
        InternalCollection {
            document_ids: BTreeSet::new(),
            active_doc_count: 0,
            leaf_count: 0,
        }
    }

    /// Immediate document IDs (existing or stub).
    pub fn document_ids(&self) -> impl Iterator<Item = &str> {
        self.document_ids.iter().map(|s| s.as_ref())
    }

    /// Immediate existing children.
    pub fn active_doc_count(&self) -> u64 {
        self.active_doc_count
    }

    /// Existing documents at any depth beneath this collection.
    pub fn leaf_count(&self) -> u64 {
        self.leaf_count
    }

    /// A collection is *active* iff it has at least one existing
    /// immediate child.
    pub fn is_active(&self) -> bool {
        self.active_doc_count > 0
    }

    /// A collection is a *stub* iff it has no existing immediate child
    /// but anchors existing descendants.
    pub fn is_stub(&self) -> bool {
        self.active_doc_count == 0 && self.leaf_count > 0
    }
}

/// Owns every document and collection node the database has ever lazily
/// created, and the monotonic commit version counter.
pub struct StructuralStore {
    documents: HashMap<Path, MasterDocument>,
    collections: HashMap<Path, InternalCollection>,
    db_version: u64,
}

impl Default for StructuralStore {
    fn default() -> Self {
        Self::new()
    }
}

impl StructuralStore {
    /// An empty store: no nodes, version zero.
    pub fn new() -> StructuralStore {
        let mut store = StructuralStore {
            documents: HashMap::new(),
            collections: HashMap::new(),
            db_version: 0,
        };
        // The root is a synthetic MasterDocument: it never exists, but it
        // owns the set of top-level collection IDs.
        store.documents.insert(Path::root(), MasterDocument::new_absent());
        store
    }

    /// The current database version.
    pub fn db_version(&self) -> u64 {
        self.db_version
    }

    /// Allocate and return the next commit version.
    pub fn next_version(&mut self) -> u64 {
        self.db_version += 1;
        self.db_version
    }

    /// Roll the version counter back to `value`.
    ///
    /// Used by the commit engine's atomic mode: a version is allocated
    /// optimistically before per-op validation runs, then rolled back if
    /// the batch fails as a whole, so a failed atomic commit leaves
    /// `db_version` exactly as it found it.
    pub fn force_version(&mut self, value: u64) {
        self.db_version = value;
    }

    /// Clear every node and reset the version counter to zero.
    pub fn reset(&mut self) {
        *self = StructuralStore::new();
    }

    /// Clear every node but preserve the version counter.
    pub fn clear_structure(&mut self) {
        let version = self.db_version;
        self.documents.clear();
        self.collections.clear();
        self.documents
            .insert(Path::root(), MasterDocument::new_absent());
        self.db_version = version;
    }

    /// Look up a document node without creating it.
    pub fn get_document(&self, path: &Path) -> Option<&MasterDocument> {
        self.documents.get(path)
    }

    /// Look up a collection node without creating it.
    pub fn get_collection(&self, path: &Path) -> Option<&InternalCollection> {
        self.collections.get(path)
    }

    /// Lazily create every ancestor node on the way to `path` (a document
    /// path), returning the now-guaranteed-present document node's path.
    ///
    /// Does not change `exists`; a freshly-ensured document starts absent.
    pub fn ensure_document(&mut self, path: &Path) {
        debug_assert_eq!(path.kind(), PathKind::Document);
        self.ensure_chain(path);
        self.documents
            .entry(path.clone())
            .or_insert_with(MasterDocument::new_absent);
    }

    fn ensure_chain(&mut self, path: &Path) {
        let mut current = path.clone();
        let mut child_segment: Option<Arc<str>> = None;
        loop {
            match current.kind() {
                PathKind::Document => {
                    self.documents
                        .entry(current.clone())
                        .or_insert_with(MasterDocument::new_absent);
                    if let Some(seg) = &child_segment {
                        self.collections
                            .entry(current.clone())
                            .or_insert_with(InternalCollection::new)
                            .document_ids
                            .insert(seg.clone());
                    }
                }
                PathKind::Collection => {
                    self.collections
                        .entry(current.clone())
                        .or_insert_with(InternalCollection::new);
                    if let Some(seg) = &child_segment {
                        self.documents
                            .entry(current.clone())
                            .or_insert_with(MasterDocument::new_absent)
                            .child_collection_ids
                            .insert(seg.clone());
                    }
                }
                PathKind::Root => {
                    if let Some(seg) = &child_segment {
                        self.documents
                            .get_mut(&Path::root())
                            .expect("root always present")
                            .child_collection_ids
                            .insert(seg.clone());
                    }
                    break;
                }
            }
            child_segment = current.last_segment().map(Arc::from);
            match current.parent() {
                Some(parent) => current = parent,
                None => break,
            }
        }
    }

    /// Apply a document write (`new_exists`/`new_data`), recording history
    /// if the prior visible state is being overwritten, and propagating
    /// `leaf_count`/`active_doc_count` changes to every ancestor.
    ///
    /// Returns the prior state (for `has_changes` comparison by the
    /// commit engine) and the applied state.
    pub fn apply_write(
        &mut self,
        path: &Path,
        version: u64,
        server_time: Timestamp,
        new_exists: bool,
        new_data: Option<ValueMap>,
    ) -> (DocumentState, DocumentState) {
        self.ensure_document(path);
        let node = self
            .documents
            .get_mut(path)
            .expect("ensure_document just inserted this node");

        let prior = node.current_state();
        let was_active = node.exists;

        if !new_exists && !node.exists {
            return (prior.clone(), prior);
        }

        node.history.push(HistoricDocument {
            version: node.version,
            create_time: node.create_time,
            update_time: node.update_time,
            exists: node.exists,
            data: node.data.clone(),
        });

        node.exists = new_exists;
        node.version = version;
        node.update_time = server_time;
        if new_exists {
            if node.create_time.is_none() {
                node.create_time = Some(server_time);
            }
            node.data = new_data;
        } else {
            node.create_time = None;
            node.data = None;
        }

        let now_active = node.exists;
        let applied = node.current_state();

        if was_active != now_active {
            let delta: i64 = if now_active { 1 } else { -1 };
            self.propagate_leaf_count(path, delta);
        }

        (prior, applied)
    }

    fn propagate_leaf_count(&mut self, doc_path: &Path, delta: i64) {
        let mut current = doc_path.clone();
        let mut first = true;
        loop {
            match current.parent() {
                Some(parent) => {
                    let collection = self
                        .collections
                        .get_mut(&parent)
                        .expect("ensure_document already created this collection node");
                    apply_leaf_delta(&mut collection.leaf_count, delta);
                    if first {
                        apply_active_delta(&mut collection.active_doc_count, delta);
                    }
                    current = match parent.parent() {
                        Some(grandparent) => grandparent,
                        None => return,
                    };
                }
                None => return,
            }
            first = false;
            if let Some(owning_doc) = self.documents.get_mut(&current) {
                apply_leaf_delta(&mut owning_doc.leaf_count, delta);
            }
        }
    }

    /// Every document ID immediately under `collection_path`.
    pub fn document_ids_under(&self, collection_path: &Path) -> Vec<Arc<str>> {
        self.collections
            .get(collection_path)
            .map(|c| c.document_ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Every collection ID immediately under `document_path` (or under the
    /// root, when `document_path` is `Path::root()`).
    pub fn collection_ids_under(&self, document_path: &Path) -> Vec<Arc<str>> {
        self.documents
            .get(document_path)
            .map(|d| d.child_collection_ids.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Iterate every document node currently tracked, for structural-stats
    /// recomputation and for listener initial-event synthesis (in path
    /// order).
    pub fn iter_documents(&self) -> impl Iterator<Item = (&Path, &MasterDocument)> {
        let mut entries: Vec<_> = self.documents.iter().collect();
        entries.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()));
        entries.into_iter()
    }

    /// Iterate every collection node currently tracked.
    pub fn iter_collections(&self) -> impl Iterator<Item = (&Path, &InternalCollection)> {
        self.collections.iter()
    }
}

fn apply_leaf_delta(counter: &mut u64, delta: i64) {
    if delta > 0 {
        *counter += delta as u64;
    } else {
        *counter = counter.saturating_sub((-delta) as u64);
    }
}

fn apply_active_delta(counter: &mut u64, delta: i64) {
    apply_leaf_delta(counter, delta);
}
