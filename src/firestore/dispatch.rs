//! Change & Trigger Dispatch
//!
//! Change watchers receive an initial event synthesized from whatever
//! currently exists, then one delta event per subsequent commit, scoped to
//! the query the watcher was registered with — a watcher only ever sees
//! documents its own query matches, never another watcher's. Triggers
//! match a document path against a route template (`"items/{id}"`) and
//! fire once per distinct path touched by a commit, coalesced so a path
//! written twice in one atomic batch only fires its trigger once, for the
//! final state.
//!
//! Scheduling is abstracted behind [`Scheduler`] rather than spawned
//! directly: production code drives it from a Tokio runtime, tests drive
//! it from a [`VirtualScheduler`] they can inspect and advance by hand.
//!
//! # Reference
//! An opaque-handle-plus-cancellation shape (`ListenerRegistration`-style)
//! over an in-process commit observer rather than a gRPC response stream.
//! The explicit `Scheduler` trait replaces hard-coded `tokio::spawn` calls
//! so tests can step delivery by hand instead of racing a real runtime.

use crate::error::FirestoreError;
use crate::firestore::meta_document::MetaDocument;
use crate::firestore::path::{match_template, parse_template, TemplatePart};
use crate::firestore::query::{matches_watch, DocumentQuery};
use crate::firestore::timestamp::Timestamp;
use futures::Stream as _;
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

/// A unit of deferred work a [`Scheduler`] is asked to run.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Where scheduled work actually runs.
///
/// `schedule_microtask` models same-tick delivery (change-watcher
/// fan-out); `schedule_delayed` models the minimum latency a trigger's
/// resulting write must wait before it is attributed to the next commit.
pub trait Scheduler: Send + Sync {
    /// Run `task` as soon as the current unit of work yields.
    fn schedule_microtask(&self, task: Task);

    /// Run `task` no sooner than `min_delay_ms` from now.
    fn schedule_delayed(&self, min_delay_ms: u64, task: Task);
}

/// Schedules onto the ambient Tokio runtime.
///
/// Microtasks are spawned with no delay; delayed tasks sleep for
/// `min_delay_ms` first. Both run on whatever runtime is current when
/// the task executes, not when it's scheduled.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioScheduler;

impl Scheduler for TokioScheduler {
    fn schedule_microtask(&self, task: Task) {
        tokio::spawn(async move { task() });
    }

    fn schedule_delayed(&self, min_delay_ms: u64, task: Task) {
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(min_delay_ms)).await;
            task();
        });
    }
}

/// Queues tasks instead of running them, so tests can assert on the
/// pending queue and drain it deterministically.
#[derive(Default)]
pub struct VirtualScheduler {
    microtasks: std::sync::Mutex<Vec<Task>>,
    delayed: std::sync::Mutex<Vec<(u64, Task)>>,
}

impl VirtualScheduler {
    pub fn new() -> VirtualScheduler {
        VirtualScheduler::default()
    }

    /// Number of microtasks queued but not yet drained.
    pub fn pending_microtasks(&self) -> usize {
        self.microtasks.lock().expect("microtask queue poisoned").len()
    }

    /// Number of delayed tasks queued but not yet drained.
    pub fn pending_delayed(&self) -> usize {
        self.delayed.lock().expect("delayed queue poisoned").len()
    }

    /// Run every currently-queued microtask, in scheduling order.
    pub fn drain_microtasks(&self) {
        let tasks = std::mem::take(&mut *self.microtasks.lock().expect("microtask queue poisoned"));
        for task in tasks {
            task();
        }
    }

    /// Run every currently-queued delayed task, in scheduling order,
    /// regardless of its requested delay.
    pub fn drain_delayed(&self) {
        let tasks = std::mem::take(&mut *self.delayed.lock().expect("delayed queue poisoned"));
        for (_, task) in tasks {
            task();
        }
    }
}

impl Scheduler for VirtualScheduler {
    fn schedule_microtask(&self, task: Task) {
        self.microtasks.lock().expect("microtask queue poisoned").push(task);
    }

    fn schedule_delayed(&self, min_delay_ms: u64, task: Task) {
        self.delayed
            .lock()
            .expect("delayed queue poisoned")
            .push((min_delay_ms, task));
    }
}

/// The minimum delay, in milliseconds, between a trigger observing a
/// commit and the write it produces landing as its own, later commit.
pub const TRIGGER_MIN_DELAY_MS: u64 = 3;

/// An event delivered to a change watcher: either the initial snapshot at
/// registration time, or the delta produced by one subsequent commit.
///
/// The path-to-document map is materialized lazily and only once, the
/// first time [`ChangeEvent::changes`] is called on any clone of this
/// event.
#[derive(Clone)]
pub struct ChangeEvent {
    server_time: Timestamp,
    is_initial: bool,
    docs: Arc<Vec<MetaDocument>>,
    materialized: Arc<OnceCell<HashMap<String, MetaDocument>>>,
}

impl ChangeEvent {
    fn new(server_time: Timestamp, is_initial: bool, docs: Vec<MetaDocument>) -> ChangeEvent {
        ChangeEvent {
            server_time,
            is_initial,
            docs: Arc::new(docs),
            materialized: Arc::new(OnceCell::new()),
        }
    }

    /// The server time of the commit (or, for the initial event, the
    /// time the watcher was registered).
    pub fn server_time(&self) -> Timestamp {
        self.server_time
    }

    /// Whether this is the initial snapshot delivered at registration,
    /// as opposed to a delta from a later commit.
    pub fn is_initial(&self) -> bool {
        self.is_initial
    }

    /// Path-to-document map, materialized on first access and cached for
    /// every subsequent call (including on clones of this event).
    pub fn changes(&self) -> &HashMap<String, MetaDocument> {
        self.materialized.get_or_init(|| {
            self.docs
                .iter()
                .cloned()
                .map(|doc| (doc.path.as_str().to_string(), doc))
                .collect()
        })
    }
}

/// An event delivered to a trigger: the captured route parameters and the
/// document's final state for one coalesced path in a commit.
#[derive(Debug, Clone)]
pub struct TriggerEvent {
    /// Named parameters captured from the route template, e.g. `{"id":
    /// "a1"}` for template `"items/{id}"`.
    pub params: HashMap<String, String>,
    /// The document's state after the commit.
    pub doc: MetaDocument,
}

/// A change watcher callback. Accepts a plain `Box` at registration time;
/// internally it's promoted to an `Arc` so one callback can be shared
/// across however many deliveries it receives.
pub type ChangeCallback = Box<dyn Fn(ChangeEvent) + Send + Sync>;
/// A trigger callback. See [`ChangeCallback`].
pub type TriggerCallback = Box<dyn Fn(TriggerEvent) + Send + Sync>;

/// Opaque handle identifying a registered watcher or trigger, returned by
/// [`Dispatcher::register_watcher`] / [`Dispatcher::register_trigger`] and
/// accepted by the matching `unregister_*` method.
pub type RegistrationId = u64;

struct TriggerRegistration {
    template: Vec<TemplatePart>,
    callback: Arc<dyn Fn(TriggerEvent) + Send + Sync>,
}

struct WatcherRegistration {
    query: DocumentQuery,
    callback: Arc<dyn Fn(ChangeEvent) + Send + Sync>,
}

/// Owns every currently-registered change watcher and trigger, and fans
/// out commit results to them.
///
/// Unregistering only affects future dispatches: a callback already
/// handed to a [`Scheduler`] runs to completion even if its registration
/// is removed before the scheduler gets to it, since the callback is
/// captured by value at dispatch time rather than looked up again later.
#[derive(Default)]
pub struct Dispatcher {
    next_id: RegistrationId,
    watchers: HashMap<RegistrationId, WatcherRegistration>,
    triggers: HashMap<RegistrationId, TriggerRegistration>,
}

impl Dispatcher {
    pub fn new() -> Dispatcher {
        Dispatcher::default()
    }

    /// Drop every registration, as if none had ever been made.
    pub fn clear(&mut self) {
        self.watchers.clear();
        self.triggers.clear();
    }

    fn allocate_id(&mut self) -> RegistrationId {
        self.next_id += 1;
        self.next_id
    }

    /// Register a change watcher scoped to `query` and schedule delivery
    /// of its initial event, synthesized from `initial_docs` (every
    /// document currently matching `query`).
    pub fn register_watcher(
        &mut self,
        query: DocumentQuery,
        callback: ChangeCallback,
        initial_docs: Vec<MetaDocument>,
        server_time: Timestamp,
        scheduler: &dyn Scheduler,
    ) -> RegistrationId {
        let id = self.allocate_id();
        let event = ChangeEvent::new(server_time, true, initial_docs);
        let callback: Arc<dyn Fn(ChangeEvent) + Send + Sync> = Arc::from(callback);
        let callback_ref = Arc::clone(&callback);
        self.watchers.insert(id, WatcherRegistration { query, callback });
        scheduler.schedule_microtask(Box::new(move || callback_ref(event)));
        id
    }

    /// Stop delivering future events to this watcher.
    pub fn unregister_watcher(&mut self, id: RegistrationId) {
        self.watchers.remove(&id);
    }

    /// Register a trigger against a route template such as `"items/{id}"`.
    pub fn register_trigger(
        &mut self,
        route: &str,
        callback: TriggerCallback,
    ) -> Result<RegistrationId, FirestoreError> {
        let template = parse_template(route);
        let id = self.allocate_id();
        let callback: Arc<dyn Fn(TriggerEvent) + Send + Sync> = Arc::from(callback);
        self.triggers.insert(id, TriggerRegistration { template, callback });
        Ok(id)
    }

    /// Stop firing this trigger for future commits.
    pub fn unregister_trigger(&mut self, id: RegistrationId) {
        self.triggers.remove(&id);
    }

    /// Fan out one commit's changed documents to every currently
    /// registered watcher and matching trigger.
    ///
    /// Each watcher only receives the subset of `changes` its own query
    /// scopes over (see [`matches_watch`]); a watcher with no relevant
    /// changes in this commit receives nothing.
    ///
    /// `changes` must be in the order the commit engine applied its
    /// operations; a path appearing more than once (written twice in one
    /// atomic batch) is coalesced down to its last occurrence before
    /// triggers are matched, so a trigger fires exactly once per distinct
    /// path touched, for that path's final state.
    pub fn dispatch_commit(
        &self,
        server_time: Timestamp,
        changes: Vec<MetaDocument>,
        scheduler: &dyn Scheduler,
    ) {
        for registration in self.watchers.values() {
            let relevant: Vec<MetaDocument> = changes
                .iter()
                .filter(|doc| matches_watch(&registration.query, doc))
                .cloned()
                .collect();
            if relevant.is_empty() {
                continue;
            }
            let event = ChangeEvent::new(server_time, false, relevant);
            let callback_ref = Arc::clone(&registration.callback);
            scheduler.schedule_microtask(Box::new(move || callback_ref(event)));
        }

        if self.triggers.is_empty() {
            return;
        }
        for doc in coalesce_changes(&changes) {
            for registration in self.triggers.values() {
                if let Some(params) = match_template(&registration.template, &doc.path) {
                    let callback_ref = Arc::clone(&registration.callback);
                    let event = TriggerEvent {
                        params,
                        doc: doc.clone(),
                    };
                    scheduler.schedule_delayed(TRIGGER_MIN_DELAY_MS, Box::new(move || callback_ref(event)));
                }
            }
        }
    }
}

/// Deduplicate `changes` by path, keeping only each path's last
/// occurrence, in ascending order of that occurrence's original index.
fn coalesce_changes(changes: &[MetaDocument]) -> Vec<&MetaDocument> {
    let mut last_index: HashMap<&str, usize> = HashMap::new();
    for (index, doc) in changes.iter().enumerate() {
        last_index.insert(doc.path.as_str(), index);
    }
    let mut indices: Vec<usize> = last_index.into_values().collect();
    indices.sort_unstable();
    indices.into_iter().map(|index| &changes[index]).collect()
}

/// A pollable stream of [`ChangeEvent`]s backed by a watcher registration.
///
/// Wraps the delivery channel in a [`tokio_stream::wrappers::UnboundedReceiverStream`].
/// Dropping the stream cancels the underlying watcher via a oneshot
/// cancellation signal picked up by a background task.
pub struct ChangeEventStream {
    pub(crate) inner: tokio_stream::wrappers::UnboundedReceiverStream<ChangeEvent>,
    pub(crate) cancel_tx: Option<tokio::sync::oneshot::Sender<()>>,
}

impl futures::Stream for ChangeEventStream {
    type Item = ChangeEvent;

    fn poll_next(
        self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        let this = self.get_mut();
        std::pin::Pin::new(&mut this.inner).poll_next(cx)
    }
}

impl Drop for ChangeEventStream {
    fn drop(&mut self) {
        if let Some(tx) = self.cancel_tx.take() {
            let _ = tx.send(());
        }
    }
}
