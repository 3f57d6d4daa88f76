//! Statistics
//!
//! Operational counters are updated explicitly by the Commit Engine as it
//! applies writes; structural counters are derived from the Structural
//! Store's node maps and recomputed lazily whenever the store has changed
//! since the last read.
//!
//! # Reference
//! A plain-struct, no-locking counter type, in the same shape used
//! elsewhere in this crate for small bits of owned state (e.g.
//! `ControllerOptions`). A read counts once it yields an existing
//! document; an empty query or a direct miss counts as exactly one no-op
//! read, never one per candidate considered.

use crate::firestore::store::StructuralStore;

/// Operational counters: reads/writes/deletes and their no-op variants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OperationalStats {
    /// Writes that produced an effective mutation.
    pub writes: u64,
    /// Set operations that yielded an identical state (`has_changes ==
    /// false`).
    pub noop_writes: u64,
    /// Deletes of a previously-existing document.
    pub deletes: u64,
    /// Deletes of an already-nonexistent document.
    pub noop_deletes: u64,
    /// Reads that delivered an existing document.
    pub reads: u64,
    /// Reads that yielded nothing — one per direct miss, and exactly one
    /// per empty query result, not per candidate considered.
    pub noop_reads: u64,
}

/// Structural counters, aggregated across every node in the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StructuralStats {
    /// Collections with at least one existing immediate child.
    pub active_collections: u64,
    /// Collections with no existing immediate child but existing
    /// descendants.
    pub stub_collections: u64,
    /// Documents that currently exist.
    pub active_documents: u64,
    /// Documents that don't exist but anchor existing descendants.
    pub stub_documents: u64,
}

impl StructuralStats {
    /// Recompute from scratch by walking every node the store currently
    /// tracks.
    pub fn compute(store: &StructuralStore) -> StructuralStats {
        let mut stats = StructuralStats::default();
        for (_, collection) in store.iter_collections() {
            if collection.is_active() {
                stats.active_collections += 1;
            } else if collection.is_stub() {
                stats.stub_collections += 1;
            }
        }
        for (path, document) in store.iter_documents() {
            if path.as_str().is_empty() {
                // The synthetic root is not a real document.
                continue;
            }
            if document.exists() {
                stats.active_documents += 1;
            } else if document.is_stub() {
                stats.stub_documents += 1;
            }
        }
        stats
    }
}

/// Operational and structural counters for one controller instance.
///
/// Structural counters are cached and invalidated on every mutating store
/// operation rather than recomputed on every read.
pub struct Statistics {
    operational: OperationalStats,
    structural_cache: Option<StructuralStats>,
}

impl Default for Statistics {
    fn default() -> Self {
        Self::new()
    }
}

impl Statistics {
    /// Zeroed operational counters, no cached structural snapshot.
    pub fn new() -> Statistics {
        Statistics {
            operational: OperationalStats::default(),
            structural_cache: None,
        }
    }

    /// Current operational counters.
    pub fn operational(&self) -> OperationalStats {
        self.operational
    }

    /// Structural counters, recomputing against `store` only if the cache
    /// has been invalidated since the last call.
    pub fn structural(&mut self, store: &StructuralStore) -> StructuralStats {
        if self.structural_cache.is_none() {
            self.structural_cache = Some(StructuralStats::compute(store));
        }
        self.structural_cache.expect("just populated above")
    }

    /// Mark the structural cache stale; the next `structural()` call will
    /// recompute it.
    pub fn invalidate_structural(&mut self) {
        self.structural_cache = None;
    }

    /// Record an effective write.
    pub fn record_write(&mut self) {
        self.operational.writes += 1;
    }

    /// Record a Set that produced no visible change.
    pub fn record_noop_write(&mut self) {
        self.operational.noop_writes += 1;
    }

    /// Record a delete of a previously-existing document.
    pub fn record_delete(&mut self) {
        self.operational.deletes += 1;
    }

    /// Record a delete of an already-nonexistent document.
    pub fn record_noop_delete(&mut self) {
        self.operational.noop_deletes += 1;
    }

    /// Record a read that delivered an existing document.
    pub fn record_read(&mut self) {
        self.operational.reads += 1;
    }

    /// Record a read (direct or query) that yielded nothing.
    pub fn record_noop_read(&mut self) {
        self.operational.noop_reads += 1;
    }

    /// Zero every operational counter and drop the structural cache,
    /// used by `reset()`.
    pub fn reset(&mut self) {
        self.operational = OperationalStats::default();
        self.structural_cache = None;
    }

    /// Drop the structural cache but preserve operational counters, used
    /// by `clear()`.
    pub fn clear(&mut self) {
        self.structural_cache = None;
    }
}
