//! Firestore mock: storage engine and query evaluator core.
//!
//! Module layout, each one component from the design:
//! - `path` — Path Index: parsing, classification, interning, route templates.
//! - `value` — Value Model & Comparator: the `Value` type and its total order.
//! - `store` — Structural Store: the flat path-keyed document/collection graph.
//! - `meta_document` — the frozen snapshot type returned across every surface.
//! - `commit` — Commit Engine: atomic/serial batch writes, merges, transforms.
//! - `transaction` — Transaction Manager: isolation, snapshot conflicts, timeouts.
//! - `query` — Query Evaluator: scope resolution, filter validation and tests.
//! - `dispatch` — Change & Trigger Dispatch: listeners, route triggers, scheduling.
//! - `stats` — Statistics: operational and structural counters.
//! - `clock` — Time Source: system, constant, offset, and custom clocks.
//! - `controller` — the owned top-level object wiring every component together.
//!
//! `timestamp` and `geo_point` are simple value types used as-is by
//! [`value::Value`].

pub mod clock;
pub mod commit;
pub mod controller;
pub mod dispatch;
pub mod geo_point;
pub mod meta_document;
pub mod path;
pub mod query;
pub mod stats;
pub mod store;
pub mod timestamp;
pub mod transaction;
pub mod value;

pub use clock::TimeSource;
pub use commit::{
    FieldTransform, MergeGranularity, NormalizedSet, NormalizedWrite, Precondition, TransformOp, WriteMode,
    WriteResult, WriteStatus,
};
pub use controller::{Controller, ControllerOptions};
pub use dispatch::{
    ChangeCallback, ChangeEvent, ChangeEventStream, Dispatcher, RegistrationId, Scheduler, TokioScheduler,
    TriggerCallback, TriggerEvent, VirtualScheduler,
};
pub use geo_point::GeoPoint;
pub use meta_document::MetaDocument;
pub use path::{Path, PathKind};
pub use query::{
    DistanceMeasure, DocumentQuery, Filter, FilterOperand, FilterOperator, FieldFilter, Direction, ReadConsistency,
    VectorQuery,
};
pub use stats::{OperationalStats, Statistics, StructuralStats};
pub use store::{DocumentState, MasterDocument, StructuralStore};
pub use timestamp::Timestamp;
pub use transaction::{TransactionManager, TransactionOptions, TransactionState};
pub use value::{compare_values, values_equal, ReferenceValue, Value, ValueKind, ValueMap};
