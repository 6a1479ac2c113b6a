//! End-to-end lifecycle tests against the JSON file store
//!
//! Everything here goes through the public API exactly the way an embedding
//! application would: a [`JsonStore`] on disk, contexts created and
//! reloaded by id, runs driven with progress callbacks.

use copysnap::{
    CopyKind, CopySnapError, JsonStore, ProgressTracker, SnapshotContext, SnapshotStore,
};
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn setup(dir: &Path) -> (PathBuf, PathBuf, JsonStore) {
    let source = dir.join("projects");
    fs::create_dir(&source).unwrap();
    fs::create_dir(source.join("docs")).unwrap();
    fs::write(source.join("docs/readme.md"), b"# notes").unwrap();
    fs::write(source.join("main.rs"), b"fn main() {}").unwrap();
    let home_parent = dir.join("backups");
    fs::create_dir(&home_parent).unwrap();
    let store = JsonStore::new(dir.join("store"));
    (source, home_parent, store)
}

#[cfg(unix)]
#[test]
fn full_lifecycle_with_json_store() {
    let dir = TempDir::new().unwrap();
    let (source, home_parent, store) = setup(dir.path());

    let mut context = SnapshotContext::create(&source, &home_parent, &store).unwrap();
    assert!(context
        .home_path()
        .file_name()
        .unwrap()
        .to_string_lossy()
        .starts_with("CopySnap-"));

    // baseline run with a progress callback
    let mut updates = 0u32;
    {
        let mut tracker = ProgressTracker::with_sink(|_| updates += 1);
        let report = context
            .plain_copy_and_save("baseline", &store, &mut tracker)
            .unwrap();
        assert!(report.is_clean(), "{report}");
    }
    assert!(updates > 0);

    // incremental run after touching one file
    fs::write(source.join("main.rs"), b"fn main() { run() }").unwrap();
    let report = context
        .snapshot_and_save("incremental", &store, &mut ProgressTracker::silent())
        .unwrap();
    assert!(report.is_clean(), "{report}");

    let run1 = context.records()[0].run_directory().to_path_buf();
    let run2 = context.latest_record().unwrap().run_directory().to_path_buf();
    assert_eq!(context.latest_record().unwrap().kind(), CopyKind::Snapshot);
    // unchanged subtree deduplicated as one directory link
    assert!(fs::symlink_metadata(run2.join("projects/docs"))
        .unwrap()
        .is_symlink());
    assert_eq!(
        fs::read_link(run2.join("projects/docs")).unwrap(),
        run1.join("projects/docs")
    );
    // changed file materialised
    assert_eq!(
        fs::read(run2.join("projects/main.rs")).unwrap(),
        b"fn main() { run() }"
    );

    // a separate store handle over the same directory sees the history
    let reopened_store = JsonStore::new(dir.path().join("store"));
    let reloaded = SnapshotContext::load(&reopened_store, context.id()).unwrap();
    assert_eq!(reloaded.records().len(), 2);
    assert_eq!(reloaded, context);

    // deleting the baseline removes its directory and record
    let baseline_id = reloaded.records()[0].id().to_string();
    let mut reloaded = reloaded;
    reloaded
        .delete_snapshot_and_save(&baseline_id, &reopened_store)
        .unwrap();
    assert!(!run1.exists());
    assert_eq!(reloaded.records().len(), 1);
    let listed = reopened_store.list().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].run_count, 1);
}

#[test]
fn store_listing_and_last_used_pointer() {
    let dir = TempDir::new().unwrap();
    let (source, home_parent, store) = setup(dir.path());

    let first = SnapshotContext::create(&source, &home_parent, &store).unwrap();
    let second = SnapshotContext::create(&source, &home_parent, &store).unwrap();

    let listed = store.list().unwrap();
    assert_eq!(listed.len(), 2);
    // the most recently created/loaded context is remembered
    assert_eq!(store.last_used().unwrap().as_deref(), Some(second.id()));

    SnapshotContext::load(&store, first.id()).unwrap();
    assert_eq!(store.last_used().unwrap().as_deref(), Some(first.id()));

    // deleting the pointed-at context clears the pointer
    let first_id = first.id().to_string();
    first.delete(&store).unwrap();
    assert_eq!(store.last_used().unwrap(), None);
    assert!(store.load(&first_id).unwrap().is_none());
    assert_eq!(store.list().unwrap().len(), 1);
}

#[test]
fn load_unknown_context_fails() {
    let dir = TempDir::new().unwrap();
    let store = JsonStore::new(dir.path().join("store"));
    let err = SnapshotContext::load(&store, "0000-unknown").unwrap_err();
    assert!(matches!(err, CopySnapError::ContextNotFound(_)));
}

#[cfg(unix)]
#[test]
fn reconstruct_survives_store_loss() {
    let dir = TempDir::new().unwrap();
    let (source, home_parent, store) = setup(dir.path());
    let mut context = SnapshotContext::create(&source, &home_parent, &store).unwrap();
    context
        .plain_copy_and_save("baseline", &store, &mut ProgressTracker::silent())
        .unwrap();
    let home = context.home_path().to_path_buf();

    // wipe the structured store entirely
    fs::remove_dir_all(dir.path().join("store")).unwrap();
    let fresh_store = JsonStore::new(dir.path().join("store"));

    let restored = SnapshotContext::reconstruct(&home, &fresh_store, &mut |_| {}).unwrap();
    assert_eq!(restored.source_path(), source.as_path());
    assert_eq!(restored.records().len(), 1);
    assert_eq!(restored.records()[0].kind(), CopyKind::Restored);
    assert!(fresh_store.load(restored.id()).unwrap().is_some());
}
