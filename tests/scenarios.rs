//! End-to-end scenarios driving the full `Controller` surface: commit
//! accounting, atomic vs. serial batch semantics, collection-group queries,
//! transactional snapshot conflicts, and trigger/listener coalescing.

use std::sync::{Arc, Mutex};

use firestore_admin_mock::{
    Controller, ControllerOptions, DocumentQuery, FirestoreError, MergeGranularity, NormalizedSet, NormalizedWrite,
    Path, Precondition, ReadConsistency, TransactionOptions, Value, ValueMap, WriteMode,
};

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

fn set_with_precondition(path: &str, pairs: &[(&str, Value)], precondition: Precondition) -> NormalizedWrite {
    let write = set(path, pairs);
    match write {
        NormalizedWrite::Set(mut s) => {
            s.precondition = precondition;
            NormalizedWrite::Set(s)
        }
        _ => unreachable!(),
    }
}

fn delete_with_precondition(path: &str, precondition: Precondition) -> NormalizedWrite {
    NormalizedWrite::Delete {
        path: Path::parse(path).unwrap(),
        precondition,
    }
}

/// Scenario 1: repeated writes to the same document track no-op writes and
/// leave the read counters untouched.
#[tokio::test]
async fn repeated_and_changed_writes_are_counted_correctly() {
    let controller = Controller::new(ControllerOptions::default());

    controller
        .commit(vec![set("users/u1", &[("n", Value::Integer(1))])], WriteMode::Atomic)
        .await
        .unwrap();
    controller
        .commit(vec![set("users/u1", &[("n", Value::Integer(1))])], WriteMode::Atomic)
        .await
        .unwrap();
    controller
        .commit(vec![set("users/u1", &[("n", Value::Integer(2))])], WriteMode::Atomic)
        .await
        .unwrap();

    let stats = controller.operational_stats().await;
    assert_eq!(stats.writes, 2);
    assert_eq!(stats.noop_writes, 1);
    assert_eq!(stats.reads, 0);
}

/// Scenario 2: an atomic batch where one op fails a precondition applies
/// nothing and reports the precondition's error.
#[tokio::test]
async fn atomic_batch_rolls_back_entirely_on_failure() {
    let controller = Controller::new(ControllerOptions::default());

    let err = controller
        .commit(
            vec![
                set("users/u1", &[("a", Value::Integer(1))]),
                delete_with_precondition("users/u2", Precondition::Exists(true)),
            ],
            WriteMode::Atomic,
        )
        .await
        .unwrap_err();
    assert!(matches!(err, FirestoreError::NotFound(_)));

    let doc = controller
        .get(Path::parse("users/u1").unwrap(), ReadConsistency::Current)
        .await
        .unwrap();
    assert!(!doc.exists);
}

/// Scenario 3: a serial batch applies each write independently and reports
/// one status per input position.
#[tokio::test]
async fn serial_batch_applies_independently_with_per_write_status() {
    let controller = Controller::new(ControllerOptions::default());

    let result = controller
        .commit(
            vec![
                set("users/u1", &[("a", Value::Integer(1))]),
                set_with_precondition(
                    "users/u1",
                    &[("b", Value::Integer(2))],
                    Precondition::Exists(false),
                ),
            ],
            WriteMode::Serial,
        )
        .await
        .unwrap();

    let statuses = result.status.unwrap();
    assert_eq!(statuses[0].code, "OK");
    assert_eq!(statuses[1].code, "AlreadyExists");

    let doc = controller
        .get(Path::parse("users/u1").unwrap(), ReadConsistency::Current)
        .await
        .unwrap();
    assert!(matches!(doc.data.unwrap().get("a"), Some(Value::Integer(1))));
}

/// Scenario 4: a collection-group query at the root finds every `posts`
/// document regardless of its ancestor blog, but not other collections.
#[tokio::test]
async fn collection_group_query_crosses_ancestor_boundaries() {
    let controller = Controller::new(ControllerOptions::default());
    controller
        .commit(
            vec![
                set("blogs/b1/posts/p1", &[("title", Value::String("one".into()))]),
                set("blogs/b2/posts/p2", &[("title", Value::String("two".into()))]),
                set("blogs/b1/other/x", &[("title", Value::String("ignored".into()))]),
            ],
            WriteMode::Atomic,
        )
        .await
        .unwrap();

    let results = controller
        .run_query(DocumentQuery {
            parent: Path::root(),
            all_descendants: true,
            collection_id: Some("posts".to_string()),
            filter: None,
            explicit_order_by: Vec::new(),
            find_nearest: None,
            consistency: ReadConsistency::Current,
        })
        .await
        .unwrap();

    let mut ids: Vec<&str> = results.iter().map(|d| d.id.as_str()).collect();
    ids.sort();
    assert_eq!(ids, ["p1", "p2"]);
}

/// Scenario 5: an external write between a transaction's read and its
/// commit aborts the transaction on snapshot conflict.
#[tokio::test]
async fn transaction_aborts_on_conflicting_external_write() {
    let controller = Controller::new(ControllerOptions::default());
    controller
        .commit(vec![set("users/u1", &[("n", Value::Integer(1))])], WriteMode::Atomic)
        .await
        .unwrap();

    let txn = controller
        .begin_transaction(TransactionOptions::default())
        .await
        .unwrap();
    controller
        .get(
            Path::parse("users/u1").unwrap(),
            ReadConsistency::Transaction(txn.clone()),
        )
        .await
        .unwrap();

    controller
        .commit(vec![set("users/u1", &[("n", Value::Integer(2))])], WriteMode::Atomic)
        .await
        .unwrap();

    let err = controller
        .commit_transaction(
            &txn,
            Some(vec![set("users/u1", &[("n", Value::Integer(3))])]),
        )
        .await
        .unwrap_err();
    assert!(matches!(err, FirestoreError::Aborted(_)));
}

/// Scenario 6: a trigger registered on a route template fires once per
/// distinct document in a batch, coalesced to each document's final state.
#[tokio::test]
async fn trigger_fires_once_per_document_coalesced_to_final_state() {
    let controller = Controller::new(ControllerOptions::default());

    let seen: Arc<Mutex<Vec<(String, i64)>>> = Arc::new(Mutex::new(Vec::new()));
    let seen_clone = seen.clone();
    controller
        .on_trigger(
            "items/{id}",
            Box::new(move |event| {
                let v = match event.doc.data.as_ref().and_then(|d| d.get("v")) {
                    Some(Value::Integer(n)) => *n,
                    _ => -1,
                };
                seen_clone.lock().unwrap().push((event.params["id"].clone(), v));
            }),
        )
        .await
        .unwrap();

    controller
        .commit(
            vec![
                set("items/a", &[("v", Value::Integer(1))]),
                set("items/a", &[("v", Value::Integer(2))]),
                set("items/b", &[("v", Value::Integer(1))]),
            ],
            WriteMode::Atomic,
        )
        .await
        .unwrap();

    // Trigger dispatch is scheduled with a minimum delay; give the runtime
    // a moment to actually run it.
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let mut fired = seen.lock().unwrap().clone();
    fired.sort();
    assert_eq!(fired, [("a".to_string(), 2), ("b".to_string(), 1)]);
}
