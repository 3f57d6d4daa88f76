//! Controller: the top-level, owned orchestration object.
//!
//! # Reference
//! An `Arc<Inner>` plus interior-lock handle, the same shape a `Firestore`
//! client handle uses, but without a process-wide instance registry keyed
//! by app name: each `Controller` here is an explicit, independently-owned
//! instance whose lifecycle the caller owns outright.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use rand::distributions::Alphanumeric;
use rand::Rng;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::{FirestoreError, Result};

use super::clock::TimeSource;
use super::commit::{self, MergeGranularity, NormalizedSet, NormalizedWrite, Precondition, WriteMode, WriteResult};
use super::dispatch::{
    ChangeCallback, ChangeEventStream, Dispatcher, RegistrationId, Scheduler, TokioScheduler, TriggerCallback,
};
use super::meta_document::MetaDocument;
use super::path::{Path, PathKind};
use super::query::{self, DocumentQuery, ReadConsistency};
use super::stats::{OperationalStats, Statistics, StructuralStats};
use super::store::{DocumentState, StructuralStore};
use super::transaction::{TransactionManager, TransactionOptions};
use super::value::ValueMap;

const AUTO_ID_LEN: usize = 20;

/// Identifies the logical database a [`Controller`] stands in for, and how
/// its paths serialize into fully-qualified resource names.
///
/// Defaults mirror a hosted project's defaults exactly, so a controller
/// built with `ControllerOptions::default()` produces the same resource
/// names a real default-configured client would.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControllerOptions {
    /// GCP project ID.
    pub project_id: String,
    /// Firestore database ID within the project.
    pub database_id: String,
    /// Database location, informational only (no multi-region behavior is
    /// modeled).
    pub location: String,
    /// Logical namespace, informational only.
    pub namespace: String,
}

impl Default for ControllerOptions {
    fn default() -> Self {
        ControllerOptions {
            project_id: "default-project".to_string(),
            database_id: "(default)".to_string(),
            location: "nam5".to_string(),
            namespace: "(default)".to_string(),
        }
    }
}

impl ControllerOptions {
    /// The `projects/{project_id}/databases/{database_id}/documents` prefix
    /// every document resource name is rooted at.
    pub fn documents_root(&self) -> String {
        format!(
            "projects/{}/databases/{}/documents",
            self.project_id, self.database_id
        )
    }

    /// The fully-qualified resource name for `path`.
    pub fn document_name(&self, path: &Path) -> String {
        format!("{}/{}", self.documents_root(), path.as_str())
    }
}

/// Every mutable piece of state a controller owns, behind one lock.
///
/// There is no parallel execution within the core: all mutation and
/// dispatch run against one logical, single-threaded view of the world,
/// so a single mutex serializing every operation is the direct
/// implementation of that guarantee rather than an optimization shortcut.
struct ControllerState {
    store: StructuralStore,
    stats: Statistics,
    transactions: TransactionManager,
    dispatcher: Dispatcher,
    closed: bool,
}

impl ControllerState {
    fn new() -> ControllerState {
        ControllerState {
            store: StructuralStore::new(),
            stats: Statistics::new(),
            transactions: TransactionManager::new(),
            dispatcher: Dispatcher::new(),
            closed: false,
        }
    }

    fn assert_open(&self) -> Result<()> {
        if self.closed {
            Err(FirestoreError::Unavailable(
                "operation on a closed controller".to_string(),
            ))
        } else {
            Ok(())
        }
    }
}

struct ControllerInner {
    options: ControllerOptions,
    clock: TimeSource,
    scheduler: Arc<dyn Scheduler>,
    state: Mutex<ControllerState>,
}

/// The in-memory mock of a hosted Firestore database: owns the structural
/// store, transaction registry, change/trigger dispatcher, statistics, and
/// time source, and is the sole entry point external callers use to read,
/// write, query, subscribe, and manage transactions.
///
/// Cheap to clone; every clone shares the same underlying state via `Arc`.
#[derive(Clone)]
pub struct Controller {
    inner: Arc<ControllerInner>,
}

impl Default for Controller {
    fn default() -> Self {
        Controller::new(ControllerOptions::default())
    }
}

impl Controller {
    /// A controller backed by the system clock and a real `tokio`
    /// scheduler.
    pub fn new(options: ControllerOptions) -> Controller {
        Controller::with_clock(options, TimeSource::system())
    }

    /// A controller with an injected clock (e.g. [`TimeSource::constant`]
    /// for deterministic tests) but a real `tokio` scheduler.
    pub fn with_clock(options: ControllerOptions, clock: TimeSource) -> Controller {
        Controller::build(options, clock, Arc::new(TokioScheduler))
    }

    /// A controller with both an injected clock and an injected scheduler
    /// (e.g. a `VirtualScheduler`), for tests that need to drain dispatch
    /// queues by hand rather than waiting on a real `tokio` runtime.
    pub fn with_scheduler(options: ControllerOptions, clock: TimeSource, scheduler: Arc<dyn Scheduler>) -> Controller {
        Controller::build(options, clock, scheduler)
    }

    fn build(options: ControllerOptions, clock: TimeSource, scheduler: Arc<dyn Scheduler>) -> Controller {
        Controller {
            inner: Arc::new(ControllerInner {
                options,
                clock,
                scheduler,
                state: Mutex::new(ControllerState::new()),
            }),
        }
    }

    /// This controller's configured options.
    pub fn options(&self) -> &ControllerOptions {
        &self.inner.options
    }

    /// The fully-qualified resource name for `path` under this
    /// controller's project/database.
    pub fn document_name(&self, path: &Path) -> String {
        self.inner.options.document_name(path)
    }

    /// Mark the controller closed. Every subsequent operation fails with
    /// `Unavailable` until a `reset()`. Idempotent.
    pub async fn close(&self) {
        self.inner.state.lock().await.closed = true;
        debug!(project_id = %self.inner.options.project_id, "controller closed");
    }

    /// Return the controller to its just-constructed state: structural
    /// store, statistics, transactions, and dispatcher registrations are
    /// all dropped, and a prior `close()` is undone.
    ///
    /// Intended for test-harness use between cases.
    pub async fn reset(&self) {
        let mut state = self.inner.state.lock().await;
        state.store.reset();
        state.stats.reset();
        state.transactions.clear();
        state.dispatcher.clear();
        state.closed = false;
    }

    /// Wipe stored document data while preserving operational statistics
    /// and the commit version counter.
    ///
    /// Open transactions are dropped since their read-sets can no longer
    /// be meaningfully checked against wiped document history; watcher and
    /// trigger registrations are left in place, since they hold no
    /// reference to the documents being cleared.
    pub async fn clear(&self) {
        let mut state = self.inner.state.lock().await;
        state.store.clear_structure();
        state.stats.clear();
        state.transactions.clear();
    }

    /// Operational read/write/delete counters (and their no-op variants).
    pub async fn operational_stats(&self) -> OperationalStats {
        self.inner.state.lock().await.stats.operational()
    }

    /// Structural counters (active/stub collection and document counts).
    pub async fn structural_stats(&self) -> StructuralStats {
        let mut state = self.inner.state.lock().await;
        state.stats.structural(&state.store)
    }

    /// Apply `writes` as one commit, assigning a single version and server
    /// time, and schedule change/trigger dispatch for every document whose
    /// data actually changed.
    pub async fn commit(&self, writes: Vec<NormalizedWrite>, mode: WriteMode) -> Result<WriteResult> {
        let mut state = self.inner.state.lock().await;
        state.assert_open()?;
        state.transactions.flush(self.inner.clock.now());

        let result = commit::commit(&mut state.store, &mut state.stats, &self.inner.clock, writes, mode)?;

        let changed: Vec<MetaDocument> = result
            .documents
            .iter()
            .filter(|doc| doc.has_changes)
            .cloned()
            .collect();
        let changed_count = changed.len();
        if !changed.is_empty() {
            state
                .dispatcher
                .dispatch_commit(result.server_time, changed, self.inner.scheduler.as_ref());
        }

        debug!(server_time = ?result.server_time, documents_changed = changed_count, "commit applied");
        Ok(result)
    }

    /// Create a new document in `collection` under an auto-generated
    /// 20-character alphanumeric ID, as a single `Root`-merge `Set` with no
    /// transforms.
    pub async fn add(&self, collection: Path, data: ValueMap) -> Result<WriteResult> {
        collection.assert_kind(&[PathKind::Collection])?;
        let doc_path = collection.child(&generate_auto_id());
        let write = NormalizedWrite::Set(NormalizedSet {
            path: doc_path,
            merge: MergeGranularity::Root,
            data,
            field_updates: Vec::new(),
            precondition: Precondition::None,
            transforms: Vec::new(),
        });
        self.commit(vec![write], WriteMode::Atomic).await
    }

    /// Resolve a single document's current (or, under `consistency`,
    /// historical/transactional) state.
    pub async fn get(&self, path: Path, consistency: ReadConsistency) -> Result<MetaDocument> {
        path.assert_kind(&[PathKind::Document])?;
        let mut state = self.inner.state.lock().await;
        state.assert_open()?;
        state.transactions.flush(self.inner.clock.now());

        let now = self.inner.clock.now();
        let read_time = match &consistency {
            ReadConsistency::ReadTime(t) => *t,
            ReadConsistency::Transaction(id) => state.transactions.read_time_of(id)?,
            ReadConsistency::Current | ReadConsistency::NewTransaction => now,
        };

        let doc_state = state
            .store
            .get_document(&path)
            .map(|master| master.resolve_at(now, read_time))
            .unwrap_or_else(DocumentState::absent);

        if doc_state.exists {
            state.stats.record_read();
        } else {
            state.stats.record_noop_read();
        }

        if let ReadConsistency::Transaction(id) = &consistency {
            state.transactions.record_read(id, path.clone(), &self.inner.clock)?;
        }

        Ok(MetaDocument::from_state(path, now, &doc_state))
    }

    /// Evaluate a structured query against the current (or historical, or
    /// transactional) store.
    pub async fn run_query(&self, query: DocumentQuery) -> Result<Vec<MetaDocument>> {
        let mut state = self.inner.state.lock().await;
        state.assert_open()?;
        state.transactions.flush(self.inner.clock.now());

        if let ReadConsistency::Transaction(id) = &query.consistency {
            // `read_time_of` also confirms the transaction is still active.
            state.transactions.read_time_of(id)?;
        }

        let server_time = self.inner.clock.now();
        let results = query::evaluate(&state.store, server_time, &query)?;

        if results.is_empty() {
            state.stats.record_noop_read();
        } else {
            for _ in &results {
                state.stats.record_read();
            }
        }

        if let ReadConsistency::Transaction(id) = &query.consistency {
            if results.is_empty() {
                state.transactions.touch(id, &self.inner.clock)?;
            } else {
                for doc in &results {
                    state.transactions.record_read(id, doc.path.clone(), &self.inner.clock)?;
                }
            }
        }

        Ok(results)
    }

    /// Count the documents a query would return, without materializing
    /// them for the caller.
    pub async fn count(&self, query: DocumentQuery) -> Result<u64> {
        Ok(self.run_query(query).await?.len() as u64)
    }

    /// Register a change watcher scoped to `query`. The callback first
    /// receives an initial event synthesized from the query's current
    /// results, then a delta event after every future commit that changes
    /// a document the query would match.
    ///
    /// The initial event's documents are delivered in the structural
    /// store's path order (see [`StructuralStore::iter_documents`]), since
    /// the evaluator itself makes no ordering guarantee.
    pub async fn watch(&self, query: DocumentQuery, callback: ChangeCallback) -> Result<RegistrationId> {
        let mut state = self.inner.state.lock().await;
        state.assert_open()?;

        let server_time = self.inner.clock.now();
        let mut initial = query::evaluate(&state.store, server_time, &query)?;
        initial.sort_by(|a, b| a.path.as_str().cmp(b.path.as_str()));

        Ok(state
            .dispatcher
            .register_watcher(query, callback, initial, server_time, self.inner.scheduler.as_ref()))
    }

    /// Stop delivering future events to a previously registered watcher.
    /// Idempotent; an unknown ID is silently ignored.
    pub async fn unwatch(&self, id: RegistrationId) {
        self.inner.state.lock().await.dispatcher.unregister_watcher(id);
    }

    /// [`watch`](Self::watch), but yielding a [`ChangeEventStream`] instead
    /// of taking a callback. Dropping the stream unregisters the watcher.
    pub async fn watch_stream(&self, query: DocumentQuery) -> Result<ChangeEventStream> {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let id = self
            .watch(query, Box::new(move |event| {
                let _ = tx.send(event);
            }))
            .await?;

        let (cancel_tx, cancel_rx) = tokio::sync::oneshot::channel();
        let controller = self.clone();
        tokio::spawn(async move {
            let _ = cancel_rx.await;
            controller.unwatch(id).await;
        });

        Ok(ChangeEventStream {
            inner: tokio_stream::wrappers::UnboundedReceiverStream::new(rx),
            cancel_tx: Some(cancel_tx),
        })
    }

    /// Register a trigger against a route template such as `"items/{id}"`.
    pub async fn on_trigger(&self, route: &str, callback: TriggerCallback) -> Result<RegistrationId> {
        let mut state = self.inner.state.lock().await;
        state.assert_open()?;
        state.dispatcher.register_trigger(route, callback)
    }

    /// Stop firing a previously registered trigger. Idempotent; an unknown
    /// ID is silently ignored.
    pub async fn remove_trigger(&self, id: RegistrationId) {
        self.inner.state.lock().await.dispatcher.unregister_trigger(id);
    }

    /// Open a new transaction, returning its opaque ID.
    pub async fn begin_transaction(&self, options: TransactionOptions) -> Result<Vec<u8>> {
        let mut state = self.inner.state.lock().await;
        state.assert_open()?;
        state.transactions.flush(self.inner.clock.now());
        let id = state.transactions.begin(options, &self.inner.clock)?;
        debug!(transaction_id = %STANDARD.encode(&id), "transaction begun");
        Ok(id)
    }

    /// Commit a transaction, optionally with a final write batch, applied
    /// atomically. Dispatches change/trigger events exactly as `commit`
    /// does.
    pub async fn commit_transaction(&self, id: &[u8], writes: Option<Vec<NormalizedWrite>>) -> Result<WriteResult> {
        let mut state = self.inner.state.lock().await;
        state.assert_open()?;

        let result = state
            .transactions
            .commit(id, writes, &mut state.store, &mut state.stats, &self.inner.clock)?;

        let changed: Vec<MetaDocument> = result
            .documents
            .iter()
            .filter(|doc| doc.has_changes)
            .cloned()
            .collect();
        let changed_count = changed.len();
        if !changed.is_empty() {
            state
                .dispatcher
                .dispatch_commit(result.server_time, changed, self.inner.scheduler.as_ref());
        }

        debug!(
            transaction_id = %STANDARD.encode(id),
            documents_changed = changed_count,
            "transaction committed"
        );
        Ok(result)
    }

    /// Abort a transaction explicitly.
    pub async fn rollback_transaction(&self, id: &[u8]) -> Result<()> {
        let mut state = self.inner.state.lock().await;
        state.assert_open()?;
        state.transactions.rollback(id)?;
        debug!(transaction_id = %STANDARD.encode(id), "transaction rolled back");
        Ok(())
    }
}

fn generate_auto_id() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(AUTO_ID_LEN)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::firestore::dispatch::VirtualScheduler;
    use crate::firestore::query::Direction;
    use crate::firestore::timestamp::Timestamp;
    use crate::firestore::value::Value;
    use std::sync::Mutex as StdMutex;

    fn data(pairs: &[(&str, Value)]) -> ValueMap {
        let mut m = ValueMap::new();
        for (k, v) in pairs {
            m.insert(k.to_string(), v.clone());
        }
        m
    }

    fn set(path: &str, pairs: &[(&str, Value)]) -> NormalizedWrite {
        NormalizedWrite::Set(NormalizedSet {
            path: Path::parse(path).unwrap(),
            merge: MergeGranularity::Root,
            data: data(pairs),
            field_updates: Vec::new(),
            precondition: Precondition::None,
            transforms: Vec::new(),
        })
    }

    fn query_for(collection: &str) -> DocumentQuery {
        DocumentQuery {
            parent: Path::root(),
            all_descendants: false,
            collection_id: Some(collection.to_string()),
            filter: None,
            explicit_order_by: Vec::new(),
            find_nearest: None,
            consistency: ReadConsistency::Current,
        }
    }

    fn test_controller() -> Controller {
        let (controller, _scheduler) = test_controller_with_scheduler();
        controller
    }

    fn test_controller_with_scheduler() -> (Controller, Arc<VirtualScheduler>) {
        let scheduler = Arc::new(VirtualScheduler::new());
        let controller = Controller::with_scheduler(
            ControllerOptions::default(),
            TimeSource::constant(Timestamp::new(1_000, 0).unwrap()),
            scheduler.clone(),
        );
        (controller, scheduler)
    }

    #[test]
    fn default_options_match_hosted_defaults() {
        let opts = ControllerOptions::default();
        assert_eq!(opts.project_id, "default-project");
        assert_eq!(opts.database_id, "(default)");
        assert_eq!(opts.location, "nam5");
        assert_eq!(opts.namespace, "(default)");
        assert_eq!(
            opts.document_name(&Path::parse("users/u1").unwrap()),
            "projects/default-project/databases/(default)/documents/users/u1"
        );
    }

    #[tokio::test]
    async fn commit_then_get_round_trips_data() {
        let controller = test_controller();
        controller
            .commit(vec![set("users/u1", &[("n", Value::Integer(1))])], WriteMode::Atomic)
            .await
            .unwrap();

        let doc = controller
            .get(Path::parse("users/u1").unwrap(), ReadConsistency::Current)
            .await
            .unwrap();
        assert!(doc.exists);
        assert!(matches!(doc.data.unwrap().get("n"), Some(Value::Integer(1))));

        let stats = controller.operational_stats().await;
        assert_eq!(stats.writes, 1);
        assert_eq!(stats.reads, 1);
    }

    #[tokio::test]
    async fn get_of_missing_document_is_a_noop_read() {
        let controller = test_controller();
        let doc = controller
            .get(Path::parse("users/missing").unwrap(), ReadConsistency::Current)
            .await
            .unwrap();
        assert!(!doc.exists);
        assert_eq!(controller.operational_stats().await.noop_reads, 1);
    }

    #[tokio::test]
    async fn add_generates_a_fresh_id_each_time() {
        let controller = test_controller();
        let a = controller
            .add(Path::parse("users").unwrap(), data(&[("n", Value::Integer(1))]))
            .await
            .unwrap();
        let b = controller
            .add(Path::parse("users").unwrap(), data(&[("n", Value::Integer(2))]))
            .await
            .unwrap();
        assert_ne!(a.documents[0].path.as_str(), b.documents[0].path.as_str());
        assert_eq!(controller.count(query_for("users")).await.unwrap(), 2);
    }

    #[tokio::test]
    async fn watcher_receives_initial_then_delta_events() {
        let (controller, scheduler) = test_controller_with_scheduler();
        controller
            .commit(vec![set("items/a", &[("n", Value::Integer(1))])], WriteMode::Atomic)
            .await
            .unwrap();

        let seen: Arc<StdMutex<Vec<bool>>> = Arc::new(StdMutex::new(Vec::new()));
        let seen_clone = seen.clone();
        controller
            .watch(
                query_for("items"),
                Box::new(move |event| seen_clone.lock().unwrap().push(event.is_initial())),
            )
            .await
            .unwrap();

        // Nothing fires until the virtual scheduler is drained.
        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(scheduler.pending_microtasks(), 1);
        scheduler.drain_microtasks();
        assert_eq!(seen.lock().unwrap().as_slice(), [true]);

        controller
            .commit(vec![set("items/b", &[("n", Value::Integer(2))])], WriteMode::Atomic)
            .await
            .unwrap();

        assert_eq!(scheduler.pending_microtasks(), 1);
        scheduler.drain_microtasks();
        assert_eq!(seen.lock().unwrap().as_slice(), [true, false]);
    }

    #[tokio::test]
    async fn watch_stream_delivers_events_and_drop_unregisters() {
        use futures::StreamExt;

        let controller = Controller::new(ControllerOptions::default());
        controller
            .commit(vec![set("items/a", &[("n", Value::Integer(1))])], WriteMode::Atomic)
            .await
            .unwrap();

        let mut stream = controller.watch_stream(query_for("items")).await.unwrap();
        let initial = stream.next().await.unwrap();
        assert!(initial.is_initial());

        controller
            .commit(vec![set("items/b", &[("n", Value::Integer(2))])], WriteMode::Atomic)
            .await
            .unwrap();
        let delta = stream.next().await.unwrap();
        assert!(!delta.is_initial());

        drop(stream);
        // Gives the cancellation task a chance to run; nothing asserts on
        // it directly since `unwatch` is idempotent and side-effect free
        // to observe from here.
        tokio::task::yield_now().await;
    }

    #[tokio::test]
    async fn closed_controller_rejects_further_operations() {
        let controller = test_controller();
        controller.close().await;
        let err = controller
            .get(Path::parse("users/u1").unwrap(), ReadConsistency::Current)
            .await
            .unwrap_err();
        assert_eq!(err.code(), "Unavailable");

        controller.reset().await;
        controller
            .get(Path::parse("users/u1").unwrap(), ReadConsistency::Current)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn clear_preserves_operational_counters_but_drops_documents() {
        let controller = test_controller();
        controller
            .commit(vec![set("users/u1", &[("n", Value::Integer(1))])], WriteMode::Atomic)
            .await
            .unwrap();
        controller.clear().await;

        let doc = controller
            .get(Path::parse("users/u1").unwrap(), ReadConsistency::Current)
            .await
            .unwrap();
        assert!(!doc.exists);
        assert_eq!(controller.operational_stats().await.writes, 1);
    }

    #[tokio::test]
    async fn transaction_commit_applies_buffered_write() {
        let controller = test_controller();
        let txn = controller
            .begin_transaction(TransactionOptions::default())
            .await
            .unwrap();
        controller
            .commit_transaction(&txn, Some(vec![set("users/u1", &[("n", Value::Integer(7))])]))
            .await
            .unwrap();

        let doc = controller
            .get(Path::parse("users/u1").unwrap(), ReadConsistency::Current)
            .await
            .unwrap();
        assert!(matches!(doc.data.unwrap().get("n"), Some(Value::Integer(7))));
    }

    #[tokio::test]
    async fn explicit_order_by_field_is_carried_through_validation() {
        let controller = test_controller();
        let mut q = query_for("items");
        q.explicit_order_by = vec![("n".to_string(), Direction::Ascending)];
        // No inequality filter is present, so an arbitrary first ordering
        // field is legal.
        assert!(controller.run_query(q).await.is_ok());
    }

    #[tokio::test]
    async fn empty_result_query_under_a_transaction_touches_its_idle_timer() {
        use std::sync::atomic::{AtomicI64, Ordering as AtomicOrdering};

        let seconds = Arc::new(AtomicI64::new(1_000));
        let seconds_clone = seconds.clone();
        let clock = TimeSource::custom(Box::new(move || {
            Timestamp::new(seconds_clone.load(AtomicOrdering::SeqCst), 0).unwrap()
        }));
        let controller = Controller::with_clock(ControllerOptions::default(), clock);

        let txn = controller.begin_transaction(TransactionOptions::default()).await.unwrap();

        seconds.fetch_add(50, AtomicOrdering::SeqCst);
        let mut empty_query = query_for("items");
        empty_query.consistency = ReadConsistency::Transaction(txn.clone());
        let results = controller.run_query(empty_query).await.unwrap();
        assert!(results.is_empty());

        // Triggers a `flush`. Without the touch above, 100s of idleness
        // since `begin_transaction` would abort the transaction here.
        seconds.fetch_add(50, AtomicOrdering::SeqCst);
        controller
            .get(Path::parse("users/u1").unwrap(), ReadConsistency::Current)
            .await
            .unwrap();

        assert!(controller.commit_transaction(&txn, None).await.is_ok());
    }
}
