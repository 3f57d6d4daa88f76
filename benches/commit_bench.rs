//! Commit throughput benchmarks.
//!
//! Measures batch-commit latency against an in-memory controller at a few
//! batch sizes. No network, no auth phase: everything this crate does is
//! local, so there's nothing else to exclude from the timing.
//!
//! ```bash
//! cargo bench --bench commit_bench
//! ```

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use firestore_admin_mock::{
    Controller, ControllerOptions, MergeGranularity, NormalizedSet, NormalizedWrite, Path, Precondition, Value,
    ValueMap, WriteMode,
};
use once_cell::sync::Lazy;
use tokio::runtime::Runtime;

static RUNTIME: Lazy<Runtime> = Lazy::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .expect("failed to build runtime")
});

fn write_for(n: usize) -> NormalizedWrite {
    let mut data = ValueMap::new();
    data.insert("n".to_string(), Value::Integer(n as i64));
    data.insert("label".to_string(), Value::String(format!("item-{n}")));
    NormalizedWrite::Set(NormalizedSet {
        path: Path::parse(&format!("bench/doc-{n}")).unwrap(),
        merge: MergeGranularity::Root,
        data,
        field_updates: Vec::new(),
        precondition: Precondition::None,
        transforms: Vec::new(),
    })
}

fn bench_commit(c: &mut Criterion) {
    let mut group = c.benchmark_group("atomic_commit");
    for batch_size in [1usize, 16, 64, 256] {
        group.throughput(Throughput::Elements(batch_size as u64));
        group.bench_with_input(BenchmarkId::from_parameter(batch_size), &batch_size, |b, &batch_size| {
            let controller = Controller::new(ControllerOptions::default());
            b.to_async(&*RUNTIME).iter(|| {
                let controller = controller.clone();
                async move {
                    let writes: Vec<NormalizedWrite> = (0..batch_size).map(write_for).collect();
                    black_box(controller.commit(writes, WriteMode::Atomic).await.unwrap());
                }
            });
        });
    }
    group.finish();
}

fn bench_get(c: &mut Criterion) {
    let controller = RUNTIME.block_on(async {
        let controller = Controller::new(ControllerOptions::default());
        let writes: Vec<NormalizedWrite> = (0..1000).map(write_for).collect();
        controller.commit(writes, WriteMode::Atomic).await.unwrap();
        controller
    });

    c.bench_function("get_existing_document", |b| {
        b.to_async(&*RUNTIME).iter(|| {
            let controller = controller.clone();
            async move {
                let doc = controller
                    .get(
                        Path::parse("bench/doc-500").unwrap(),
                        firestore_admin_mock::ReadConsistency::Current,
                    )
                    .await
                    .unwrap();
                black_box(doc);
            }
        });
    });
}

criterion_group!(benches, bench_commit, bench_get);
criterion_main!(benches);
