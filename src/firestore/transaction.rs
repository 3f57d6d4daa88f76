//! Transaction Manager
//!
//! Read-only and read-write transactions with snapshot isolation,
//! retry tokens, and idle/lifetime timeouts. Unlike a real client SDK's
//! `Transaction`, this manager doesn't hold a gRPC stream — it tracks a
//! read set per transaction and validates it against the structural
//! store's current state at commit time.
//!
//! # Reference
//! A registry/read-set shape (`reads: HashMap<...>`, `writes:
//! Vec<TransactionWrite>`, enum-of-ops write buffer) over a base64-keyed
//! registry, generalized from a single in-flight transaction object into
//! a manager owning many concurrently open ones.

use crate::error::FirestoreError;
use crate::firestore::clock::TimeSource;
use crate::firestore::commit::{commit, NormalizedWrite, WriteMode, WriteResult};
use crate::firestore::path::Path;
use crate::firestore::stats::Statistics;
use crate::firestore::store::StructuralStore;
use crate::firestore::timestamp::Timestamp;
use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand::RngCore;
use std::collections::{HashMap, HashSet};

/// Maximum total transaction lifetime, in seconds.
pub const MAX_LIFETIME_SECONDS: i64 = 270;
/// Maximum idle time since the transaction was last touched, in seconds.
pub const MAX_IDLE_SECONDS: i64 = 60;

/// A transaction's terminal or in-progress state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Open for reads and (if read-write) writes.
    Active,
    /// Committed successfully; no longer tracked by the manager.
    Committed,
    /// Aborted, either explicitly or due to conflict/timeout. Terminal,
    /// but retained in the registry so a `retry_transaction` token can
    /// still reference it.
    Aborted,
}

/// Options passed to [`TransactionManager::begin`].
#[derive(Debug, Clone, Default)]
pub struct TransactionOptions {
    /// Open a read-only transaction instead of the read-write default.
    pub read_only: bool,
    /// Read-only transactions may pin an explicit read time.
    pub read_time: Option<Timestamp>,
    /// Read-write transactions may reference a previously aborted attempt
    /// to retry.
    pub retry_transaction: Option<Vec<u8>>,
}

struct TransactionEntry {
    id: Vec<u8>,
    read_only: bool,
    state: TransactionState,
    read_time: Timestamp,
    read_set: HashSet<Path>,
    created_at: Timestamp,
    last_touched: Timestamp,
}

/// Owns every open (or recently-aborted) transaction, keyed by the
/// base64 encoding of its opaque 256-bit ID.
pub struct TransactionManager {
    transactions: HashMap<String, TransactionEntry>,
}

impl Default for TransactionManager {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionManager {
    /// An empty registry.
    pub fn new() -> TransactionManager {
        TransactionManager {
            transactions: HashMap::new(),
        }
    }

    /// Drop every tracked transaction, used by `reset()`/`clear()`.
    pub fn clear(&mut self) {
        self.transactions.clear();
    }

    fn registry_key(id: &[u8]) -> String {
        STANDARD.encode(id)
    }

    /// Evict transactions that have exceeded their total lifetime or idle
    /// budget, rolling back any that are still `Active`.
    pub fn flush(&mut self, now: Timestamp) {
        let mut to_remove = Vec::new();
        for (key, entry) in self.transactions.iter_mut() {
            let lifetime_expired = seconds_between(now, entry.created_at) > MAX_LIFETIME_SECONDS;
            let idle_expired = seconds_between(now, entry.last_touched) > MAX_IDLE_SECONDS;
            if entry.state == TransactionState::Active && (lifetime_expired || idle_expired) {
                entry.state = TransactionState::Aborted;
            }
            if entry.state != TransactionState::Active
                && seconds_between(now, entry.created_at) > MAX_LIFETIME_SECONDS
            {
                to_remove.push(key.clone());
            }
        }
        for key in to_remove {
            self.transactions.remove(&key);
        }
    }

    /// Begin a new transaction, returning its opaque 256-bit ID.
    pub fn begin(&mut self, options: TransactionOptions, clock: &TimeSource) -> Result<Vec<u8>, FirestoreError> {
        let now = clock.now();
        self.flush(now);

        if let Some(retry_id) = &options.retry_transaction {
            if options.read_only {
                return Err(FirestoreError::InvalidArgument(
                    "read-only transactions may not supply a retry token".into(),
                ));
            }
            let key = Self::registry_key(retry_id);
            match self.transactions.get(&key) {
                Some(entry) if !entry.read_only && entry.state == TransactionState::Aborted => {}
                _ => {
                    return Err(FirestoreError::InvalidArgument(
                        "retry_transaction does not reference a known aborted read-write transaction".into(),
                    ))
                }
            }
        }

        let mut id = vec![0u8; 32];
        rand::thread_rng().fill_bytes(&mut id);
        let key = Self::registry_key(&id);

        let read_time = if options.read_only {
            options.read_time.unwrap_or(now)
        } else {
            now
        };

        self.transactions.insert(
            key,
            TransactionEntry {
                id: id.clone(),
                read_only: options.read_only,
                state: TransactionState::Active,
                read_time,
                read_set: HashSet::new(),
                created_at: now,
                last_touched: now,
            },
        );
        Ok(id)
    }

    fn fetch_mut(&mut self, id: &[u8]) -> Result<&mut TransactionEntry, FirestoreError> {
        let key = Self::registry_key(id);
        self.transactions
            .get_mut(&key)
            .ok_or_else(|| FirestoreError::InvalidArgument("unknown transaction".into()))
    }

    /// Look up a transaction's read time without mutating its idle timer.
    pub fn read_time_of(&self, id: &[u8]) -> Result<Timestamp, FirestoreError> {
        let key = Self::registry_key(id);
        self.transactions
            .get(&key)
            .map(|e| e.read_time)
            .ok_or_else(|| FirestoreError::InvalidArgument("unknown transaction".into()))
    }

    /// Record that `path` was read under transaction `id`, touching its
    /// idle timer. Fails if the transaction is unknown or not active.
    pub fn record_read(&mut self, id: &[u8], path: Path, clock: &TimeSource) -> Result<(), FirestoreError> {
        let now = clock.now();
        let entry = self.fetch_mut(id)?;
        if entry.state != TransactionState::Active {
            return Err(FirestoreError::Aborted("transaction already completed".into()));
        }
        entry.read_set.insert(path);
        entry.last_touched = now;
        Ok(())
    }

    /// Touch transaction `id`'s idle timer without adding anything to its
    /// read-set. Used for a query read that matched no documents: it still
    /// counts as activity against the idle timeout even though there's no
    /// path to watch for conflicts.
    pub fn touch(&mut self, id: &[u8], clock: &TimeSource) -> Result<(), FirestoreError> {
        let now = clock.now();
        let entry = self.fetch_mut(id)?;
        if entry.state != TransactionState::Active {
            return Err(FirestoreError::Aborted("transaction already completed".into()));
        }
        entry.last_touched = now;
        Ok(())
    }

    /// Roll back an active transaction.
    pub fn rollback(&mut self, id: &[u8]) -> Result<(), FirestoreError> {
        let entry = self.fetch_mut(id)?;
        if entry.state == TransactionState::Committed {
            return Err(FirestoreError::Aborted("transaction already completed".into()));
        }
        entry.state = TransactionState::Aborted;
        Ok(())
    }

    /// Commit a transaction.
    ///
    /// Read-only transactions reject any supplied writes. Read-write
    /// transactions with writes are validated for snapshot conflicts
    /// first: if any read-set path has changed since `read_time`, the
    /// transaction aborts.
    pub fn commit(
        &mut self,
        id: &[u8],
        writes: Option<Vec<NormalizedWrite>>,
        store: &mut StructuralStore,
        stats: &mut Statistics,
        clock: &TimeSource,
    ) -> Result<WriteResult, FirestoreError> {
        let key = Self::registry_key(id);
        let (read_only, read_time, read_set) = {
            let entry = self
                .transactions
                .get(&key)
                .ok_or_else(|| FirestoreError::InvalidArgument("unknown transaction".into()))?;
            if entry.state != TransactionState::Active {
                return Err(FirestoreError::Aborted("transaction already completed".into()));
            }
            (entry.read_only, entry.read_time, entry.read_set.clone())
        };

        if read_only {
            if writes.as_ref().is_some_and(|w| !w.is_empty()) {
                return Err(FirestoreError::InvalidArgument(
                    "read-only transactions may not write".into(),
                ));
            }
            self.transactions.remove(&key);
            return Ok(WriteResult {
                server_time: clock.now(),
                documents: Vec::new(),
                status: None,
            });
        }

        let writes = match writes {
            Some(w) if !w.is_empty() => w,
            _ => {
                self.transactions.remove(&key);
                return Ok(WriteResult {
                    server_time: clock.now(),
                    documents: Vec::new(),
                    status: None,
                });
            }
        };

        for path in &read_set {
            if let Some(node) = store.get_document(path) {
                let current = node.current_state();
                if current.update_time > read_time {
                    if let Some(entry) = self.transactions.get_mut(&key) {
                        entry.state = TransactionState::Aborted;
                    }
                    let reason = if current.exists {
                        "concurrent update to a read document"
                    } else {
                        "concurrent deletion of a read document"
                    };
                    return Err(FirestoreError::Aborted(reason.into()));
                }
            }
        }

        match commit(store, stats, clock, writes, WriteMode::Atomic) {
            Ok(result) => {
                self.transactions.remove(&key);
                Ok(result)
            }
            Err(err) => {
                if let Some(entry) = self.transactions.get_mut(&key) {
                    entry.state = TransactionState::Aborted;
                }
                Err(err)
            }
        }
    }
}

fn seconds_between(later: Timestamp, earlier: Timestamp) -> i64 {
    later.seconds - earlier.seconds
        + if later.nanoseconds < earlier.nanoseconds {
            -1
        } else {
            0
        }
}
