use std::collections::HashMap;
use std::fs;
use std::thread;

use assert_matches::assert_matches;
use camino::{Utf8Path, Utf8PathBuf};
use chrono::Utc;
use mobility_db::domain::DatasetRecord;
use mobility_db::error::MobilityError;
use mobility_db::metadata::{METADATA_FILE_NAME, MetadataStore, MissingPathPolicy};

fn base_dir(dir: &tempfile::TempDir) -> Utf8PathBuf {
    Utf8PathBuf::from_path_buf(dir.path().to_path_buf()).unwrap()
}

/// Build a record and create its storage directory so the store considers it
/// valid on read.
fn record(base: &Utf8Path, provider: &str, dataset: &str, hash: &str) -> DatasetRecord {
    let storage = Utf8PathBuf::from(format!("{provider}_Test_Provider")).join(dataset);
    fs::create_dir_all(base.join(&storage).as_std_path()).unwrap();
    DatasetRecord {
        provider_id: provider.parse().unwrap(),
        provider_name: "Test Provider".to_string(),
        dataset_id: dataset.to_string(),
        download_timestamp: Utc::now(),
        source_url: "https://example.com/gtfs.zip".to_string(),
        is_direct_source: false,
        catalog_provided_hash: None,
        content_hash: hash.to_string(),
        storage_path: storage,
        feed_validity_start: None,
        feed_validity_end: None,
        bounding_box: None,
    }
}

#[test]
fn missing_backing_file_is_an_empty_store() {
    let dir = tempfile::tempdir().unwrap();
    let store = MetadataStore::open(base_dir(&dir)).unwrap();
    assert!(store.load().unwrap().is_empty());
}

#[test]
fn empty_backing_file_is_an_empty_store() {
    let dir = tempfile::tempdir().unwrap();
    let base = base_dir(&dir);
    fs::write(base.join(METADATA_FILE_NAME).as_std_path(), "").unwrap();
    let store = MetadataStore::open(&base).unwrap();
    assert!(store.load().unwrap().is_empty());
}

#[test]
fn end_to_end_upsert_load_remove_provider() {
    let dir = tempfile::tempdir().unwrap();
    let base = base_dir(&dir);
    let mut store = MetadataStore::open(&base).unwrap();

    let record_a = record(&base, "x-1", "20240101", "aaa");
    store.upsert(record_a.clone()).unwrap();
    let loaded = store.load().unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded["20240101"], record_a);

    let record_b = record(&base, "x-1", "20240102", "bbb");
    store.upsert(record_b.clone()).unwrap();
    let loaded = store.load().unwrap();
    assert_eq!(loaded.len(), 2);
    assert_eq!(loaded["20240102"], record_b);

    let dir_a = base.join(&record_a.storage_path);
    let dir_b = base.join(&record_b.storage_path);
    assert!(dir_a.as_std_path().exists());
    assert!(dir_b.as_std_path().exists());

    let removed = store.remove_provider(&"x-1".parse().unwrap()).unwrap();
    assert_eq!(removed.len(), 2);
    assert!(store.load().unwrap().is_empty());
    assert!(!dir_a.as_std_path().exists());
    assert!(!dir_b.as_std_path().exists());
    // Both dataset dirs shared one provider dir, which must be gone too.
    assert!(!dir_a.parent().unwrap().as_std_path().exists());
}

#[test]
fn concurrent_upserts_of_disjoint_keys_both_survive() {
    let dir = tempfile::tempdir().unwrap();
    let base = base_dir(&dir);

    thread::scope(|scope| {
        for i in 0..8 {
            let base = base.clone();
            scope.spawn(move || {
                let mut store = MetadataStore::open(&base).unwrap();
                let rec = record(&base, "x-1", &format!("ds-{i}"), &format!("hash-{i}"));
                store.upsert(rec).unwrap();
            });
        }
    });

    let store = MetadataStore::open(&base).unwrap();
    let loaded = store.load().unwrap();
    assert_eq!(loaded.len(), 8);
    for i in 0..8 {
        assert_eq!(loaded[&format!("ds-{i}")].content_hash, format!("hash-{i}"));
    }
}

#[test]
fn concurrent_upserts_of_the_same_key_leave_one_valid_record() {
    let dir = tempfile::tempdir().unwrap();
    let base = base_dir(&dir);

    thread::scope(|scope| {
        for i in 0..8 {
            let base = base.clone();
            scope.spawn(move || {
                let mut store = MetadataStore::open(&base).unwrap();
                let rec = record(&base, "x-1", "contested", &format!("hash-{i}"));
                store.upsert(rec).unwrap();
            });
        }
    });

    // Exactly one value survives and it is one of the written candidates,
    // never an interleaved record.
    let store = MetadataStore::open(&base).unwrap();
    let loaded = store.load().unwrap();
    assert_eq!(loaded.len(), 1);
    let hash = &loaded["contested"].content_hash;
    assert!((0..8).any(|i| hash == &format!("hash-{i}")));
}

#[test]
fn stale_snapshot_detects_external_write() {
    let dir = tempfile::tempdir().unwrap();
    let base = base_dir(&dir);

    let mut reader = MetadataStore::open(&base).unwrap();
    assert!(reader.get("20240101").is_none());

    let mut writer = MetadataStore::open(&base).unwrap();
    writer.upsert(record(&base, "x-1", "20240101", "aaa")).unwrap();

    assert!(reader.ensure_current().unwrap());
    assert!(reader.get("20240101").is_some());
}

#[test]
fn reload_without_external_write_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    let base = base_dir(&dir);
    let mut store = MetadataStore::open(&base).unwrap();
    store.upsert(record(&base, "x-1", "20240101", "aaa")).unwrap();

    assert!(!store.reload(false).unwrap());
    assert!(!store.reload(false).unwrap());
    assert!(store.reload(true).unwrap());
}

#[test]
fn remove_keeps_provider_dir_with_foreign_file() {
    let dir = tempfile::tempdir().unwrap();
    let base = base_dir(&dir);
    let mut store = MetadataStore::open(&base).unwrap();
    let rec = record(&base, "x-1", "20240101", "aaa");
    store.upsert(rec.clone()).unwrap();

    let provider_dir = base.join("x-1_Test_Provider");
    fs::write(provider_dir.join("notes.txt").as_std_path(), "mine").unwrap();

    store.remove("20240101").unwrap();
    assert!(!base.join(&rec.storage_path).as_std_path().exists());
    // The caller's file protects the provider directory from deletion.
    assert!(provider_dir.as_std_path().exists());
    assert!(provider_dir.join("notes.txt").as_std_path().exists());
}

#[test]
fn remove_deletes_empty_provider_dir() {
    let dir = tempfile::tempdir().unwrap();
    let base = base_dir(&dir);
    let mut store = MetadataStore::open(&base).unwrap();
    let rec = record(&base, "x-1", "20240101", "aaa");
    store.upsert(rec.clone()).unwrap();

    store.remove("20240101").unwrap();
    assert!(!base.join("x-1_Test_Provider").as_std_path().exists());
}

#[test]
fn remove_unknown_dataset_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let mut store = MetadataStore::open(base_dir(&dir)).unwrap();
    assert_matches!(
        store.remove("nope"),
        Err(MobilityError::RecordNotFound(_))
    );
    assert_matches!(
        store.remove_provider(&"x-9".parse().unwrap()),
        Err(MobilityError::RecordNotFound(_))
    );
}

#[test]
fn corrupt_backing_file_surfaces_and_degrades() {
    let dir = tempfile::tempdir().unwrap();
    let base = base_dir(&dir);
    let mut store = MetadataStore::open(&base).unwrap();
    store.upsert(record(&base, "x-1", "20240101", "aaa")).unwrap();

    fs::write(base.join(METADATA_FILE_NAME).as_std_path(), "{ not json").unwrap();

    assert_matches!(store.load(), Err(MobilityError::CorruptMetadata { .. }));
    // The opportunistic listing degrades to empty instead of raising.
    assert!(store.records().is_empty());
    // Opening a new store on the corrupt directory propagates the error.
    assert_matches!(
        MetadataStore::open(&base),
        Err(MobilityError::CorruptMetadata { .. })
    );
}

#[test]
fn leftover_temp_file_does_not_shadow_previous_data() {
    let dir = tempfile::tempdir().unwrap();
    let base = base_dir(&dir);
    let mut store = MetadataStore::open(&base).unwrap();
    store.upsert(record(&base, "x-1", "20240101", "aaa")).unwrap();

    // A writer that died between temp write and rename leaves a stray temp
    // file; the backing file itself still parses to the previous data.
    fs::write(
        base.join(".datasets_metadata-interrupted").as_std_path(),
        "{\"half\": ",
    )
    .unwrap();

    let loaded = store.load().unwrap();
    assert_eq!(loaded.len(), 1);
    assert!(loaded.contains_key("20240101"));
}

#[test]
fn missing_storage_path_flagged_or_pruned_by_policy() {
    let dir = tempfile::tempdir().unwrap();
    let base = base_dir(&dir);
    let mut store = MetadataStore::open(&base).unwrap();
    let rec = record(&base, "x-1", "20240101", "aaa");
    store.upsert(rec.clone()).unwrap();

    fs::remove_dir_all(base.join(&rec.storage_path).as_std_path()).unwrap();

    // Flag (default): record stays visible.
    let flagged = MetadataStore::open(&base).unwrap();
    assert_eq!(flagged.load().unwrap().len(), 1);

    // Prune: record disappears from the in-memory view but the backing file
    // is not rewritten.
    let pruned = MetadataStore::open_with_policy(&base, MissingPathPolicy::Prune).unwrap();
    assert!(pruned.load().unwrap().is_empty());
    let raw = fs::read_to_string(base.join(METADATA_FILE_NAME).as_std_path()).unwrap();
    assert!(raw.contains("20240101"));
}

#[test]
fn save_replaces_contents_and_updates_the_snapshot() {
    let dir = tempfile::tempdir().unwrap();
    let base = base_dir(&dir);
    let mut store = MetadataStore::open(&base).unwrap();
    store.upsert(record(&base, "x-1", "20240101", "aaa")).unwrap();

    let replacement = record(&base, "y-2", "20240201", "bbb");
    let mut records = HashMap::new();
    records.insert(replacement.dataset_id.clone(), replacement.clone());
    store.save(records).unwrap();

    // Cache and signal reflect the saved mapping: no reload is needed, and
    // the replaced entry is gone from this instance's view.
    assert!(store.get("20240101").is_none());
    assert!(store.get("20240201").is_some());
    assert!(!store.reload(false).unwrap());

    let other = MetadataStore::open(&base).unwrap();
    let loaded = other.load().unwrap();
    assert_eq!(loaded.len(), 1);
    assert_eq!(loaded["20240201"], replacement);
}

#[test]
fn failed_save_surfaces_storage_write_and_keeps_prior_state() {
    let dir = tempfile::tempdir().unwrap();
    let base = base_dir(&dir);
    let mut store = MetadataStore::open(&base).unwrap();
    let kept = record(&base, "x-1", "20240101", "aaa");
    store.upsert(kept.clone()).unwrap();

    // A directory squatting on the backing file's path makes the atomic
    // rename fail after the temp write succeeded.
    let file_path = base.join(METADATA_FILE_NAME);
    fs::remove_file(file_path.as_std_path()).unwrap();
    fs::create_dir(file_path.as_std_path()).unwrap();

    let next = record(&base, "x-1", "20240102", "bbb");
    let mut records = HashMap::new();
    records.insert(next.dataset_id.clone(), next);
    assert_matches!(store.save(records), Err(MobilityError::StorageWrite(_)));

    // The failed save must not poison the instance's cached state.
    assert_eq!(store.get("20240101"), Some(&kept));
    assert!(store.get("20240102").is_none());
}

#[test]
fn interleaved_writers_stay_current_afterwards() {
    let dir = tempfile::tempdir().unwrap();
    let base = base_dir(&dir);

    // Two long-lived instances alternate writes under contention. Each
    // mutation must capture the signal of its own write while still holding
    // the lock; a signal probed after release can belong to the other writer
    // and silently mask that writer's records from ensure_current.
    let handles: Vec<_> = (0..2)
        .map(|writer| {
            let base = base.clone();
            thread::spawn(move || {
                let mut store = MetadataStore::open(&base).unwrap();
                for i in 0..25 {
                    let rec = record(&base, "x-1", &format!("w{writer}-{i}"), "h");
                    store.upsert(rec).unwrap();
                }
                store
            })
        })
        .collect();
    let stores: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    for mut store in stores {
        store.ensure_current().unwrap();
        for writer in 0..2 {
            for i in 0..25 {
                assert!(store.get(&format!("w{writer}-{i}")).is_some());
            }
        }
    }
}

#[test]
fn prune_policy_applies_to_mutation_cached_state() {
    let dir = tempfile::tempdir().unwrap();
    let base = base_dir(&dir);
    let mut store = MetadataStore::open_with_policy(&base, MissingPathPolicy::Prune).unwrap();
    let gone = record(&base, "x-1", "20240101", "aaa");
    store.upsert(gone.clone()).unwrap();
    fs::remove_dir_all(base.join(&gone.storage_path).as_std_path()).unwrap();

    let kept = record(&base, "x-1", "20240102", "bbb");
    store.upsert(kept).unwrap();

    // The cache agrees with what load() would prune...
    assert!(store.get("20240101").is_none());
    assert!(store.get("20240102").is_some());
    // ...while the backing file is never rewritten to drop the record.
    let raw = fs::read_to_string(base.join(METADATA_FILE_NAME).as_std_path()).unwrap();
    assert!(raw.contains("20240101"));
    assert!(raw.contains("20240102"));
}

#[test]
fn remove_all_clears_the_store() {
    let dir = tempfile::tempdir().unwrap();
    let base = base_dir(&dir);
    let mut store = MetadataStore::open(&base).unwrap();
    store.upsert(record(&base, "x-1", "a", "1")).unwrap();
    store.upsert(record(&base, "y-2", "b", "2")).unwrap();

    let removed = store.remove_all().unwrap();
    assert_eq!(removed.len(), 2);
    assert!(store.load().unwrap().is_empty());

    // Clearing an already empty store is a no-op.
    assert!(store.remove_all().unwrap().is_empty());
}
