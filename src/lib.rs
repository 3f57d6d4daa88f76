//! firestore-admin-mock
//!
//! An in-memory, high-fidelity mock of a hosted Firestore database: the
//! storage engine and query evaluator a test suite needs to drive
//! application code without emulators or network I/O.
//!
//! # Example
//! ```no_run
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! use firestore_admin_mock::{Controller, ControllerOptions, NormalizedWrite, NormalizedSet, MergeGranularity, Precondition, Path, WriteMode, ValueMap, Value};
//!
//! let controller = Controller::new(ControllerOptions::default());
//! let mut data = ValueMap::new();
//! data.insert("name".to_string(), Value::String("ada".to_string()));
//! let write = NormalizedWrite::Set(NormalizedSet {
//!     path: Path::parse("users/u1")?,
//!     merge: MergeGranularity::Root,
//!     data,
//!     field_updates: Vec::new(),
//!     precondition: Precondition::None,
//!     transforms: Vec::new(),
//! });
//! controller.commit(vec![write], WriteMode::Atomic).await?;
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod error;
pub mod firestore;

pub use error::{FirestoreError, Result};

pub use firestore::{
    ChangeCallback, ChangeEvent, ChangeEventStream, Controller, ControllerOptions, Dispatcher, Direction,
    DistanceMeasure, DocumentQuery, DocumentState, FieldFilter, FieldTransform, Filter, FilterOperand,
    FilterOperator, GeoPoint, MasterDocument, MergeGranularity, MetaDocument, NormalizedSet, NormalizedWrite,
    OperationalStats, Path, PathKind, Precondition, ReadConsistency, ReferenceValue, RegistrationId, Scheduler,
    Statistics, StructuralStats, StructuralStore, TimeSource, Timestamp, TokioScheduler, TransactionManager,
    TransactionOptions, TransactionState, TransformOp, TriggerCallback, TriggerEvent, Value, ValueKind, ValueMap,
    VectorQuery, VirtualScheduler, WriteMode, WriteResult, WriteStatus,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_controller_options_are_reachable_from_the_crate_root() {
        let opts = ControllerOptions::default();
        assert_eq!(opts.project_id, "default-project");
    }
}
