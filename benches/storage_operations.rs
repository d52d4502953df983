use annotation_store::core::StorageConfig;
use annotation_store::storage::{AccessMode, AnnotationStorageService, UpgradeMode};
use annotation_store::types::{AnnotationGraph, DocumentKey, FeatureValue};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

fn sample_graph() -> AnnotationGraph {
    let mut graph = AnnotationGraph::new(0);
    for i in 0..500u32 {
        let id = graph.add_annotation("token", i * 6, i * 6 + 5);
        graph.set_feature(id, "lemma", FeatureValue::Text(format!("word{}", i)));
    }
    graph
}

fn criterion_benchmark(c: &mut Criterion) {
    let dir = tempfile::tempdir().unwrap();
    let service = AnnotationStorageService::new(&StorageConfig::with_data_dir(dir.path())).unwrap();
    let key = DocumentKey::from_parts(1, 1, "bench").unwrap();
    {
        let session = service.open_session(false).unwrap();
        service
            .read_or_create(&session, &key, UpgradeMode::Auto, AccessMode::ExclusiveWrite, || Ok(sample_graph()))
            .unwrap();
    }

    c.bench_function("acquire_cached", |b| {
        b.iter(|| {
            let session = service.open_session(false).unwrap();
            let handle = service.read(&session, &key, AccessMode::SharedReadOnly).unwrap();
            let len = handle.read().unwrap().len();
            black_box(len)
        })
    });

    c.bench_function("acquire_from_disk", |b| {
        b.iter(|| {
            let session = service.open_session(false).unwrap();
            let handle = service.read(&session, &key, AccessMode::UnmanagedNonInitializing).unwrap();
            let len = handle.read().unwrap().len();
            black_box(len)
        })
    });

    c.bench_function("write_with_backup", |b| {
        b.iter(|| {
            let session = service.open_session(false).unwrap();
            let mut handle = service.read(&session, &key, AccessMode::ExclusiveWrite).unwrap();
            handle.write().unwrap().set_feature(0, "seen", FeatureValue::Bool(true));
            black_box(service.write(&session, &handle).unwrap())
        })
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
