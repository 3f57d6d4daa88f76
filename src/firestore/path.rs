//! Path Index
//!
//! Parses and classifies canonical `/`-separated document/collection paths,
//! provides parent navigation, and caches parsed paths so repeated lookups
//! of the same string don't re-validate and re-allocate.
//!
//! # Reference
//! A standalone, allocation-light path type (parent navigation, last-segment
//! extraction) shared by the structural store, commit engine, and query
//! evaluator.

use crate::error::FirestoreError;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

/// Classification of a canonical path by its segment count.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PathKind {
    /// Zero segments — the database root.
    Root,
    /// Odd segment count — addresses a collection.
    Collection,
    /// Positive even segment count — addresses a document.
    Document,
}

impl fmt::Display for PathKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PathKind::Root => "root",
            PathKind::Collection => "collection",
            PathKind::Document => "document",
        };
        f.write_str(s)
    }
}

struct PathInner {
    raw: String,
    segments: Vec<Arc<str>>,
    kind: PathKind,
}

/// An immutable, interned path such as `users/u1` or `blogs/b1/posts/p1`.
///
/// Cloning a `Path` is cheap: it's a reference-counted pointer to shared,
/// immutable segment data.
#[derive(Clone)]
pub struct Path(Arc<PathInner>);

impl Path {
    /// The synthetic root path (zero segments).
    pub fn root() -> Path {
        Path(Arc::new(PathInner {
            raw: String::new(),
            segments: Vec::new(),
            kind: PathKind::Root,
        }))
    }

    /// Parse and classify a canonical path string, without consulting any
    /// cache.
    ///
    /// A valid path is either empty (root) or a `/`-separated sequence of
    /// non-empty segments with no leading, trailing, or doubled slash.
    pub fn parse(raw: &str) -> Result<Path, FirestoreError> {
        if raw.is_empty() {
            return Ok(Path::root());
        }
        if raw.starts_with('/') || raw.ends_with('/') {
            return Err(FirestoreError::InvalidArgument(format!(
                "path '{raw}' must not have leading or trailing slashes"
            )));
        }
        let mut segments = Vec::new();
        for part in raw.split('/') {
            if part.is_empty() {
                return Err(FirestoreError::InvalidArgument(format!(
                    "path '{raw}' contains an empty segment"
                )));
            }
            segments.push(Arc::from(part));
        }
        let kind = classify(segments.len());
        Ok(Path(Arc::new(PathInner {
            raw: raw.to_string(),
            segments,
            kind,
        })))
    }

    /// Canonical string form, e.g. `"users/u1"` (empty string for root).
    pub fn as_str(&self) -> &str {
        &self.0.raw
    }

    /// `root`, `collection`, or `document`.
    pub fn kind(&self) -> PathKind {
        self.0.kind
    }

    /// Ordered path segments.
    pub fn segments(&self) -> &[Arc<str>] {
        &self.0.segments
    }

    /// Depth (number of segments).
    pub fn depth(&self) -> usize {
        self.0.segments.len()
    }

    /// The last segment (document ID or collection ID), or `None` at root.
    pub fn last_segment(&self) -> Option<&str> {
        self.0.segments.last().map(|s| s.as_ref())
    }

    /// The parent path: a document's parent is always a collection; a
    /// collection's parent is a document, or root if the collection is
    /// top-level. Root has no parent.
    pub fn parent(&self) -> Option<Path> {
        if self.0.segments.is_empty() {
            return None;
        }
        let parent_segments = &self.0.segments[..self.0.segments.len() - 1];
        if parent_segments.is_empty() {
            return Some(Path::root());
        }
        let raw = parent_segments
            .iter()
            .map(|s| s.as_ref())
            .collect::<Vec<_>>()
            .join("/");
        Some(Path(Arc::new(PathInner {
            kind: classify(parent_segments.len()),
            segments: parent_segments.to_vec(),
            raw,
        })))
    }

    /// A child path formed by appending one segment.
    pub fn child(&self, segment: &str) -> Path {
        let mut segments = self.0.segments.clone();
        segments.push(Arc::from(segment));
        let raw = segments
            .iter()
            .map(|s| s.as_ref())
            .collect::<Vec<_>>()
            .join("/");
        Path(Arc::new(PathInner {
            kind: classify(segments.len()),
            segments,
            raw,
        }))
    }

    /// Validate that this path's kind is one of `allowed`, returning an
    /// `InvalidArgument` error describing the mismatch otherwise.
    pub fn assert_kind(&self, allowed: &[PathKind]) -> Result<(), FirestoreError> {
        if allowed.contains(&self.0.kind) {
            Ok(())
        } else {
            Err(FirestoreError::InvalidArgument(format!(
                "path '{}' is a {} path; expected one of {:?}",
                self.0.raw, self.0.kind, allowed
            )))
        }
    }
}

impl PartialEq for Path {
    fn eq(&self, other: &Self) -> bool {
        self.0.raw == other.0.raw
    }
}
impl Eq for Path {}

impl std::hash::Hash for Path {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.0.raw.hash(state);
    }
}

impl fmt::Debug for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Path").field(&self.0.raw).finish()
    }
}

impl fmt::Display for Path {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.raw)
    }
}

fn classify(segment_count: usize) -> PathKind {
    if segment_count == 0 {
        PathKind::Root
    } else if segment_count % 2 == 1 {
        PathKind::Collection
    } else {
        PathKind::Document
    }
}

/// Caches parsed `Path`s keyed by their raw string so repeated lookups of
/// the same path don't re-validate or re-allocate segment storage.
pub struct PathIndex {
    cache: Mutex<HashMap<String, Path>>,
}

impl Default for PathIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl PathIndex {
    /// Create an empty cache.
    pub fn new() -> Self {
        PathIndex {
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Parse `raw`, returning the cached `Path` if this exact string has
    /// been interned before.
    pub fn intern(&self, raw: &str) -> Result<Path, FirestoreError> {
        {
            let cache = self.cache.lock().expect("path cache poisoned");
            if let Some(path) = cache.get(raw) {
                return Ok(path.clone());
            }
        }
        let path = Path::parse(raw)?;
        let mut cache = self.cache.lock().expect("path cache poisoned");
        cache.insert(raw.to_string(), path.clone());
        Ok(path)
    }

    /// Number of distinct path strings currently cached.
    pub fn len(&self) -> usize {
        self.cache.lock().expect("path cache poisoned").len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all cached entries.
    pub fn clear(&self) {
        self.cache.lock().expect("path cache poisoned").clear();
    }
}

/// One token of a parsed route template: either a literal segment that
/// must match exactly, or a named parameter that captures any single
/// segment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TemplatePart {
    /// A literal segment, e.g. `items` in `items/{id}`.
    Literal(String),
    /// A named parameter, e.g. `id` in `items/{id}`.
    Param(String),
}

/// Parse a route template such as `"items/{id}"` into its ordered parts.
pub fn parse_template(template: &str) -> Vec<TemplatePart> {
    if template.is_empty() {
        return Vec::new();
    }
    template
        .split('/')
        .map(|part| {
            if let Some(name) = part.strip_prefix('{').and_then(|p| p.strip_suffix('}')) {
                TemplatePart::Param(name.to_string())
            } else {
                TemplatePart::Literal(part.to_string())
            }
        })
        .collect()
}

/// Match `path` against a route template, returning the captured
/// parameters on success.
///
/// Returns `None` on any segment mismatch or length mismatch — a template
/// never partially matches.
pub fn match_template(template_parts: &[TemplatePart], path: &Path) -> Option<HashMap<String, String>> {
    let segments = path.segments();
    if segments.len() != template_parts.len() {
        return None;
    }
    let mut params = HashMap::new();
    for (part, segment) in template_parts.iter().zip(segments.iter()) {
        match part {
            TemplatePart::Literal(lit) => {
                if lit.as_str() != segment.as_ref() {
                    return None;
                }
            }
            TemplatePart::Param(name) => {
                params.insert(name.clone(), segment.to_string());
            }
        }
    }
    Some(params)
}
