use std::fs::{self, File};
use std::path::Path;
use std::time::{Duration, SystemTime};
use annotation_store::core::logging::init_test_logging;
use annotation_store::core::{CodecKind, StorageConfig};
use annotation_store::storage::{AccessMode, AnnotationStorageService, UpgradeMode};
use annotation_store::types::{
    AnnotationGraph, ContractViolation, DocumentKey, Error, FeatureValue, Result,
};
use proptest::prelude::*;
use tempfile::{tempdir, TempDir};

fn service() -> (TempDir, AnnotationStorageService) {
    init_test_logging();
    let dir = tempdir().unwrap();
    let service = AnnotationStorageService::new(&StorageConfig::with_data_dir(dir.path())).unwrap();
    (dir, service)
}

fn key() -> DocumentKey {
    DocumentKey::from_parts(10, 20, "anna").unwrap()
}

fn tokens() -> Result<AnnotationGraph> {
    let mut graph = AnnotationGraph::new(0);
    graph.add_annotation("token", 0, 4);
    graph.add_annotation("token", 5, 9);
    Ok(graph)
}

fn mtime(path: &Path) -> SystemTime {
    fs::metadata(path).unwrap().modified().unwrap()
}

fn create(service: &AnnotationStorageService) {
    let session = service.open_session(false).unwrap();
    service
        .read_or_create(&session, &key(), UpgradeMode::Auto, AccessMode::ExclusiveWrite, tokens)
        .unwrap();
}

#[test]
fn external_timestamp_change_rejects_write_and_leaves_disk_alone() {
    let (_dir, service) = service();
    let session = service.open_session(false).unwrap();
    let mut handle = service
        .read_or_create(&session, &key(), UpgradeMode::Auto, AccessMode::ExclusiveWrite, tokens)
        .unwrap();
    handle.write().unwrap().add_annotation("pos", 0, 4);

    // An external tool touches the file after we loaded it
    let path = service.driver().graph_path(&key());
    let bumped = mtime(&path) + Duration::from_secs(30);
    File::options().write(true).open(&path).unwrap().set_modified(bumped).unwrap();
    let bytes_before = fs::read(&path).unwrap();

    let err = service.write(&session, &handle).unwrap_err();
    assert!(err.is_concurrent_modification());
    assert!(!err.is_retryable());
    assert_eq!(fs::read(&path).unwrap(), bytes_before);
    assert_eq!(mtime(&path), bumped);
    assert!(!service.driver().backup_path(&key()).exists());
}

#[test]
fn unserializable_graph_keeps_previous_file() {
    let (_dir, service) = service();
    let path = service.driver().graph_path(&key());
    {
        let session = service.open_session(false).unwrap();
        let mut handle = service
            .read_or_create(&session, &key(), UpgradeMode::Auto, AccessMode::ExclusiveWrite, tokens)
            .unwrap();
        let before = fs::metadata(&path).unwrap();

        handle.write().unwrap().add_annotation("token", 12, 3);
        let err = service.write(&session, &handle).unwrap_err();
        assert!(matches!(err, Error::Serialization(_)));

        let after = fs::metadata(&path).unwrap();
        assert_eq!(after.len(), before.len());
        assert_eq!(after.modified().unwrap(), before.modified().unwrap());
        assert!(!service.driver().backup_path(&key()).exists());
    }

    // The failed modification was dropped from the cache with the session
    let session = service.open_session(false).unwrap();
    let handle = service.read(&session, &key(), AccessMode::SharedReadOnly).unwrap();
    assert_eq!(handle.read().unwrap().len(), 2);
}

#[test]
fn delete_removes_file_and_cache_entry() {
    let (_dir, service) = service();
    create(&service);
    assert!(service.exists(&key()));

    {
        let session = service.open_session(false).unwrap();
        assert!(service.delete(&session, &key()).unwrap());
        assert!(!service.delete(&session, &key()).unwrap());
    }
    assert!(!service.exists(&key()));
    assert_eq!(service.timestamp(&key()).unwrap(), None);

    let session = service.open_session(false).unwrap();
    let err = service.read(&session, &key(), AccessMode::SharedReadOnly).unwrap_err();
    assert!(err.is_not_found());
}

#[test]
fn deleted_graph_is_initialized_again() {
    let (_dir, service) = service();
    create(&service);
    {
        let session = service.open_session(false).unwrap();
        service.delete(&session, &key()).unwrap();
    }

    let session = service.open_session(false).unwrap();
    let handle = service
        .read_or_create(&session, &key(), UpgradeMode::Auto, AccessMode::ExclusiveWrite, || {
            Ok(AnnotationGraph::new(0))
        })
        .unwrap();
    assert!(handle.read().unwrap().is_empty());
    assert!(service.exists(&key()));
}

#[test]
fn handles_fail_fast_after_their_session_closed() {
    let (_dir, service) = service();
    let mut session = service.open_session(false).unwrap();
    let mut handle = service
        .read_or_create(&session, &key(), UpgradeMode::Auto, AccessMode::ExclusiveWrite, tokens)
        .unwrap();
    session.close();

    let err = handle.read().unwrap_err();
    assert!(matches!(err, Error::Contract(ContractViolation::SessionClosed { .. })));
    assert!(handle.write().unwrap_err().is_contract_violation());
    assert!(service.write(&session, &handle).unwrap_err().is_contract_violation());
}

#[test]
fn handles_from_another_session_are_refused() {
    let (_dir, service) = service();
    let handle = {
        let session = service.open_session(false).unwrap();
        service
            .read_or_create(&session, &key(), UpgradeMode::Auto, AccessMode::Unmanaged, tokens)
            .unwrap()
    };
    let session = service.open_session(false).unwrap();
    // The first session is closed, which is detected before ownership
    assert!(service.write(&session, &handle).unwrap_err().is_contract_violation());
}

#[test]
fn sessions_of_another_service_are_refused() {
    let (_dir, service) = service();
    let (_other_dir, other) = self::service();
    let session = other.open_session(false).unwrap();
    let err = service.read(&session, &key(), AccessMode::SharedReadOnly).unwrap_err();
    assert!(matches!(err, Error::Contract(ContractViolation::ForeignSession { .. })));
}

#[test]
fn two_services_hold_sessions_on_one_thread() {
    let (_dir, service) = service();
    let (_other_dir, other) = self::service();
    create(&service);
    create(&other);

    let session = service.open_session(false).unwrap();
    let other_session = other.open_session(false).unwrap();
    assert_ne!(session.id(), other_session.id());
    assert_eq!(service.current_session_id(), Some(session.id()));
    assert_eq!(other.current_session_id(), Some(other_session.id()));

    let mine = service.read(&session, &key(), AccessMode::ExclusiveWrite).unwrap();
    let theirs = other.read(&other_session, &key(), AccessMode::ExclusiveWrite).unwrap();
    assert_eq!(mine.read().unwrap().len(), 2);
    assert_eq!(theirs.read().unwrap().len(), 2);

    drop(other_session);
    assert_eq!(other.current_session_id(), None);
    assert!(mine.read().is_ok());
}

#[test]
fn nested_sessions_share_acquisitions() {
    let (_dir, service) = service();
    let outer = service.open_session(false).unwrap();
    let first = service
        .read_or_create(&outer, &key(), UpgradeMode::Auto, AccessMode::ExclusiveWrite, tokens)
        .unwrap();
    {
        let inner = service.open_session(true).unwrap();
        assert_eq!(inner.id(), outer.id());
        // Re-entering the exclusive lock does not block and yields the same graph
        let again = service.read(&inner, &key(), AccessMode::ExclusiveWrite).unwrap();
        assert!(again.same_instance(&first));
        let shared = service.read(&inner, &key(), AccessMode::SharedReadOnly).unwrap();
        assert!(shared.same_instance(&first));
    }
    assert!(first.read().is_ok());
    assert_eq!(service.current_session_id(), Some(outer.id()));
}

#[test]
fn shared_then_exclusive_in_one_session_is_a_contract_violation() {
    let (_dir, service) = service();
    create(&service);
    let session = service.open_session(false).unwrap();
    service.read(&session, &key(), AccessMode::SharedReadOnly).unwrap();
    let err = service.read(&session, &key(), AccessMode::ExclusiveWrite).unwrap_err();
    assert!(matches!(err, Error::Contract(ContractViolation::LockUpgrade { .. })));
}

#[test]
fn unmanaged_acquisitions_bypass_the_cache() {
    let (_dir, service) = service();
    create(&service);

    let session = service.open_session(false).unwrap();
    let shared = service.read(&session, &key(), AccessMode::SharedReadOnly).unwrap();
    let entries = service.cache_stats().entries;
    let private = service.read(&session, &key(), AccessMode::UnmanagedNonInitializing).unwrap();
    assert!(!private.same_instance(&shared));
    assert_eq!(service.cache_stats().entries, entries);
}

#[test]
fn unmanaged_non_initializing_reports_missing_graph() {
    let (_dir, service) = service();
    let session = service.open_session(false).unwrap();
    let err = service
        .read_or_create(&session, &key(), UpgradeMode::Auto, AccessMode::UnmanagedNonInitializing, || {
            panic!("must not initialize")
        })
        .unwrap_err();
    assert!(err.is_not_found());
    assert!(!service.exists(&key()));
}

#[test]
fn unmanaged_write_is_seen_by_the_next_managed_acquisition() {
    let (_dir, service) = service();
    create(&service);
    {
        let session = service.open_session(false).unwrap();
        service.read(&session, &key(), AccessMode::SharedReadOnly).unwrap();
    }
    {
        let session = service.open_session(false).unwrap();
        let mut handle = service.read(&session, &key(), AccessMode::Unmanaged).unwrap();
        handle.write().unwrap().add_annotation("sentence", 0, 9);
        service.write(&session, &handle).unwrap();
    }

    let session = service.open_session(false).unwrap();
    let handle = service.read(&session, &key(), AccessMode::SharedReadOnly).unwrap();
    assert_eq!(handle.read().unwrap().select("sentence").count(), 1);
}

#[test]
fn writer_with_stale_graph_loses_against_earlier_commit() {
    let (_dir, service) = service();
    create(&service);

    let session = service.open_session(false).unwrap();
    let mut stale = service.read(&session, &key(), AccessMode::ExclusiveWrite).unwrap();

    // A lock-free writer commits in between
    let mut racer = service.read(&session, &key(), AccessMode::Unmanaged).unwrap();
    racer.write().unwrap().add_annotation("pos", 0, 4);
    service.write(&session, &racer).unwrap();

    stale.write().unwrap().add_annotation("lemma", 0, 4);
    assert!(service.write(&session, &stale).unwrap_err().is_concurrent_modification());
    assert_eq!(service.inspect(&key()).unwrap().select("pos").count(), 1);
    assert_eq!(service.inspect(&key()).unwrap().select("lemma").count(), 0);
}

#[test]
fn leftover_backup_is_restored_on_start() {
    let dir = tempdir().unwrap();
    let config = StorageConfig::with_data_dir(dir.path());
    {
        let service = AnnotationStorageService::new(&config).unwrap();
        create(&service);
        // Simulate a crash after the primary file was moved aside
        let driver = service.driver();
        fs::rename(driver.graph_path(&key()), driver.backup_path(&key())).unwrap();
        assert!(!service.exists(&key()));
    }

    let service = AnnotationStorageService::new(&config).unwrap();
    assert!(service.exists(&key()));
    assert!(!service.driver().backup_path(&key()).exists());
    assert_eq!(service.inspect(&key()).unwrap().len(), 2);
}

#[test]
fn json_codec_writes_readable_files() {
    let dir = tempdir().unwrap();
    let mut config = StorageConfig::with_data_dir(dir.path());
    config.codec = CodecKind::Json;
    let service = AnnotationStorageService::new(&config).unwrap();
    create(&service);

    let path = service.driver().graph_path(&key());
    assert_eq!(path.extension().unwrap(), "json");
    let text = fs::read_to_string(path).unwrap();
    assert!(text.contains("\"token\""));
}

#[test]
fn json_write_of_non_finite_float_keeps_previous_file() {
    let dir = tempdir().unwrap();
    let mut config = StorageConfig::with_data_dir(dir.path());
    config.codec = CodecKind::Json;
    let service = AnnotationStorageService::new(&config).unwrap();
    create(&service);
    let path = service.driver().graph_path(&key());
    let bytes_before = fs::read(&path).unwrap();
    let mtime_before = mtime(&path);

    for value in [f64::NAN, f64::INFINITY, f64::NEG_INFINITY] {
        let session = service.open_session(false).unwrap();
        let mut handle = service.read(&session, &key(), AccessMode::ExclusiveWrite).unwrap();
        {
            let mut graph = handle.write().unwrap();
            let id = graph.add_annotation("score", 0, 4);
            graph.set_feature(id, "value", FeatureValue::Float(value));
        }
        let err = service.write(&session, &handle).unwrap_err();
        assert!(matches!(err, Error::Serialization(_)), "{}", value);
        assert_eq!(fs::read(&path).unwrap(), bytes_before);
        assert_eq!(mtime(&path), mtime_before);
        assert!(!service.driver().backup_path(&key()).exists());
    }
    assert_eq!(service.inspect(&key()).unwrap().len(), 2);
}

#[test]
fn same_size_rewrite_within_one_tick_is_not_served_from_cache() {
    let dir = tempdir().unwrap();
    let mut config = StorageConfig::with_data_dir(dir.path());
    config.codec = CodecKind::Json;
    let service = AnnotationStorageService::new(&config).unwrap();
    create(&service);
    let cached = {
        let session = service.open_session(false).unwrap();
        service.read(&session, &key(), AccessMode::SharedReadOnly).unwrap()
    };

    // An external editor rewrites the file in place without moving the clock
    let path = service.driver().graph_path(&key());
    let original = mtime(&path);
    let text = fs::read_to_string(&path).unwrap();
    let edited = text.replace("\"token\"", "\"tokem\"");
    assert_eq!(edited.len(), text.len());
    fs::write(&path, edited).unwrap();
    File::options().write(true).open(&path).unwrap().set_modified(original).unwrap();

    let session = service.open_session(false).unwrap();
    let handle = service.read(&session, &key(), AccessMode::SharedReadOnly).unwrap();
    assert!(!handle.same_instance(&cached));
    assert_eq!(handle.read().unwrap().select("tokem").count(), 2);
    assert_eq!(handle.read().unwrap().select("token").count(), 0);
}

fn feature_value() -> impl Strategy<Value = FeatureValue> {
    prop_oneof![
        any::<bool>().prop_map(FeatureValue::Bool),
        any::<i64>().prop_map(FeatureValue::Int),
        any::<f64>().prop_map(FeatureValue::Float),
        "[a-zA-Z ]{0,12}".prop_map(FeatureValue::Text),
        (0u64..50).prop_map(FeatureValue::Ref),
    ]
}

fn has_non_finite(graph: &AnnotationGraph) -> bool {
    graph.annotations().iter().any(|annotation| {
        annotation
            .features
            .values()
            .any(|value| matches!(value, FeatureValue::Float(f) if !f.is_finite()))
    })
}

fn graph_strategy() -> impl Strategy<Value = AnnotationGraph> {
    let annotation = (
        prop::sample::select(vec!["token", "pos", "lemma", "named-entity"]),
        0u32..10_000,
        0u32..100,
        prop::collection::vec(("[a-z]{1,6}", feature_value()), 0..4),
    );
    prop::collection::vec(annotation, 0..40).prop_map(|annotations| {
        let mut graph = AnnotationGraph::new(0);
        for (layer, begin, len, features) in annotations {
            let id = graph.add_annotation(layer, begin, begin + len);
            for (name, value) in features {
                graph.set_feature(id, name, value);
            }
        }
        graph
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn written_graphs_read_back_unchanged(
        graph in graph_strategy(),
        extra in any::<f64>(),
        codec in prop::sample::select(vec![CodecKind::Bincode, CodecKind::Json, CodecKind::MessagePack]),
    ) {
        let dir = tempdir().unwrap();
        let mut config = StorageConfig::with_data_dir(dir.path());
        config.codec = codec;
        let service = AnnotationStorageService::new(&config).unwrap();
        let persistable = !has_non_finite(&graph);
        let mut expected = graph.clone();

        // Initial persistence through the initializer
        let created = {
            let session = service.open_session(false).unwrap();
            service
                .read_or_create(&session, &key(), UpgradeMode::Auto, AccessMode::ExclusiveWrite, move || Ok(graph))
                .map(|_| ())
        };
        if !persistable {
            prop_assert!(matches!(created, Err(Error::Serialization(_))));
            prop_assert!(!service.exists(&key()));
        } else {
            prop_assert!(created.is_ok());
            prop_assert_eq!(service.inspect(&key()).unwrap(), expected.clone());

            // Overwrite through the backup-and-restore write path
            {
                let session = service.open_session(false).unwrap();
                let mut handle = service.read(&session, &key(), AccessMode::ExclusiveWrite).unwrap();
                {
                    let mut graph = handle.write().unwrap();
                    let id = graph.add_annotation("score", 0, 1);
                    graph.set_feature(id, "value", FeatureValue::Float(extra));
                }
                let written = service.write(&session, &handle);
                if extra.is_finite() {
                    prop_assert!(written.is_ok());
                    expected = handle.read().unwrap().clone();
                } else {
                    prop_assert!(matches!(written, Err(Error::Serialization(_))));
                }
            }
            prop_assert_eq!(service.inspect(&key()).unwrap(), expected);
            prop_assert!(!service.driver().backup_path(&key()).exists());
        }
    }
}
