mod common;

use std::sync::Arc;

use common::{FakeCatalog, engine, snapshot};
use photosync::sync::store::DB_FILE;
use photosync::sync::{ListingKind, MediaStatus, RunSummary, SyncOptions};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tempfile::tempdir;
use time::macros::datetime;

fn library() -> FakeCatalog {
    let catalog = FakeCatalog::new(2);
    catalog.put_item("a", "A.jpg", datetime!(2023-01-10 08:00 UTC), b"alpha");
    catalog.put_item("b", "B.jpg", datetime!(2023-02-11 09:00 UTC), b"bravo");
    catalog.put_item("c", "C.mp4", datetime!(2023-02-12 10:00 UTC), b"charlie");
    catalog.put_album("t", "Trip", &["a", "b"]);
    catalog
}

#[tokio::test]
async fn second_run_without_remote_changes_writes_nothing() {
    let dir = tempdir().unwrap();
    let catalog = Arc::new(library());
    let engine = engine(dir.path(), catalog.clone()).await;

    let mut first = RunSummary::default();
    engine.sync(&SyncOptions::default(), &mut first).await.unwrap();
    assert_eq!(first.downloaded, 3);
    assert_eq!(first.links_created, 2);
    assert!(first.failures.is_empty());

    let fetches = catalog.fetches();
    let mut second = RunSummary::default();
    engine.sync(&SyncOptions::default(), &mut second).await.unwrap();
    assert_eq!(second.fs_writes(), 0, "{second}");
    assert_eq!(second.indexed_items, 3);
    assert_eq!(catalog.fetches(), fetches);
}

#[tokio::test]
async fn album_entries_resolve_to_canonical_content() {
    let dir = tempdir().unwrap();
    let catalog = Arc::new(library());
    let engine = engine(dir.path(), catalog).await;
    engine
        .sync(&SyncOptions::default(), &mut RunSummary::default())
        .await
        .unwrap();

    let album = dir.path().join("albums/Trip");
    let mut names: Vec<_> = std::fs::read_dir(&album)
        .unwrap()
        .map(|e| e.unwrap().file_name().into_string().unwrap())
        .collect();
    names.sort();
    assert_eq!(names, vec!["A.jpg", "B.jpg"]);
    assert_eq!(std::fs::read(album.join("A.jpg")).unwrap(), b"alpha");
    assert_eq!(std::fs::read(album.join("B.jpg")).unwrap(), b"bravo");
}

#[tokio::test]
async fn interrupted_runs_converge_to_the_uninterrupted_state() {
    let reference_dir = tempdir().unwrap();
    let reference = engine(reference_dir.path(), Arc::new(library())).await;
    reference
        .sync(&SyncOptions::default(), &mut RunSummary::default())
        .await
        .unwrap();
    let expected = snapshot(reference_dir.path());

    let dir = tempdir().unwrap();
    let catalog = Arc::new(library());
    let engine = engine(dir.path(), catalog.clone()).await;

    // Listing breaks after the first page.
    catalog.interrupt_media_listing_at(2);
    assert!(
        engine
            .sync(&SyncOptions::default(), &mut RunSummary::default())
            .await
            .is_err()
    );
    // Stop again after the download phase.
    let mut summary = RunSummary::default();
    engine.index(&Default::default(), &mut summary).await.unwrap();
    engine.download(&mut summary).await.unwrap();

    let mut last = RunSummary::default();
    engine.sync(&SyncOptions::default(), &mut last).await.unwrap();

    assert_eq!(snapshot(dir.path()), expected);
    assert_eq!(catalog.fetches(), 3, "no item is fetched twice");
}

#[tokio::test]
async fn changed_checksum_replaces_file_only_after_successful_download() {
    let dir = tempdir().unwrap();
    let catalog = Arc::new(library());
    let engine = engine(dir.path(), catalog.clone()).await;
    engine
        .sync(&SyncOptions::default(), &mut RunSummary::default())
        .await
        .unwrap();
    let canonical = dir.path().join("items/2023/01/A.jpg");

    catalog.put_item("a", "A.jpg", datetime!(2023-01-10 08:00 UTC), b"alpha v2");
    catalog.fail_fetches("a", 1);
    let mut failed = RunSummary::default();
    engine.sync(&SyncOptions::default(), &mut failed).await.unwrap();
    assert_eq!(failed.replaced_items, 1);
    assert_eq!(failed.failures.len(), 1);
    assert_eq!(std::fs::read(&canonical).unwrap(), b"alpha");
    assert_eq!(
        std::fs::read(dir.path().join("albums/Trip/A.jpg")).unwrap(),
        b"alpha"
    );

    let mut retried = RunSummary::default();
    engine.sync(&SyncOptions::default(), &mut retried).await.unwrap();
    assert_eq!(retried.downloaded, 1);
    assert_eq!(std::fs::read(&canonical).unwrap(), b"alpha v2");
    assert_eq!(
        std::fs::read(dir.path().join("albums/Trip/A.jpg")).unwrap(),
        b"alpha v2"
    );
    let record = engine.store().get_media("a").await.unwrap().unwrap();
    assert_eq!(record.status, MediaStatus::Downloaded);
    assert_eq!(record.canonical_path.as_deref(), Some("items/2023/01/A.jpg"));
}

#[tokio::test]
async fn ignored_items_are_never_fetched_and_lose_their_files() {
    let dir = tempdir().unwrap();
    let catalog = Arc::new(library());
    let engine = engine(dir.path(), catalog.clone()).await;

    engine.ignore_set(&["c".into()]).await.unwrap();
    let mut first = RunSummary::default();
    engine.sync(&SyncOptions::default(), &mut first).await.unwrap();
    assert_eq!(first.downloaded, 2);
    assert_eq!(catalog.fetches(), 2);
    assert!(!dir.path().join("items/2023/02/C.mp4").exists());

    engine.ignore_set(&["b".into()]).await.unwrap();
    let mut second = RunSummary::default();
    engine.sync(&SyncOptions::default(), &mut second).await.unwrap();
    assert_eq!(second.deleted_files, 1);
    assert!(!dir.path().join("items/2023/02/B.jpg").exists());
    assert!(!dir.path().join("albums/Trip/B.jpg").exists());
    assert!(dir.path().join("albums/Trip/A.jpg").exists());
    assert_eq!(catalog.fetches(), 2);

    engine.ignore_reset().await.unwrap();
    let mut third = RunSummary::default();
    engine.sync(&SyncOptions::default(), &mut third).await.unwrap();
    assert_eq!(third.downloaded, 2);
    assert_eq!(std::fs::read(dir.path().join("albums/Trip/B.jpg")).unwrap(), b"bravo");
}

#[tokio::test]
async fn incomplete_listing_never_deletes() {
    let dir = tempdir().unwrap();
    let catalog = Arc::new(library());
    let engine = engine(dir.path(), catalog.clone()).await;
    engine
        .sync(&SyncOptions::default(), &mut RunSummary::default())
        .await
        .unwrap();

    // "c" disappears, but the pass that would notice never finishes.
    catalog.remove_item("c");
    catalog.interrupt_media_listing_at(0);
    assert!(
        engine
            .sync(&SyncOptions::default(), &mut RunSummary::default())
            .await
            .is_err()
    );
    let mut summary = RunSummary::default();
    engine.delete_obsolete(false, &mut summary).await.unwrap();
    assert_eq!(summary.fs_writes(), 0);
    engine.delete_obsolete(true, &mut summary).await.unwrap();
    assert_eq!(summary.deleted_files, 0);
    assert!(dir.path().join("items/2023/02/C.mp4").exists());

    let mut complete = RunSummary::default();
    engine.sync(&SyncOptions::default(), &mut complete).await.unwrap();
    assert_eq!(complete.deleted_items, 1);
    assert!(!dir.path().join("items/2023/02/C.mp4").exists());
}

#[tokio::test]
async fn unrecorded_entries_survive_a_resumed_pass() {
    let dir = tempdir().unwrap();
    let catalog = Arc::new(library());
    let engine = engine(dir.path(), catalog.clone()).await;
    engine
        .sync(&SyncOptions::default(), &mut RunSummary::default())
        .await
        .unwrap();
    let canonical_a = dir.path().join("items/2023/01/A.jpg");

    // A second connection makes every update of "a" fail.
    let side = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(SqliteConnectOptions::new().filename(dir.path().join(DB_FILE)))
        .await
        .unwrap();
    sqlx::query(
        "CREATE TRIGGER refuse_a BEFORE UPDATE OF last_seen_epoch ON media_items
         WHEN NEW.remote_id = 'a'
         BEGIN SELECT RAISE(ABORT, 'disk full'); END",
    )
    .execute(&side)
    .await
    .unwrap();

    // The first page records only "b", then the listing breaks.
    catalog.interrupt_media_listing_at(2);
    let mut broken = RunSummary::default();
    assert!(engine.sync(&SyncOptions::default(), &mut broken).await.is_err());
    assert_eq!(broken.warnings.len(), 1, "{broken}");
    let cursor = engine.store().get_cursor(ListingKind::MediaItems).await.unwrap();
    assert_eq!(cursor.unrecorded, 1);

    sqlx::query("DROP TRIGGER refuse_a").execute(&side).await.unwrap();
    side.close().await;

    // Resuming finishes the listing but cannot vouch for "a".
    let mut resumed = RunSummary::default();
    engine.sync(&SyncOptions::default(), &mut resumed).await.unwrap();
    let cursor = engine.store().get_cursor(ListingKind::MediaItems).await.unwrap();
    assert!(!cursor.complete);
    assert_eq!(cursor.completed_epoch, 1);
    assert_eq!(resumed.deleted_items, 0);
    assert_eq!(resumed.deleted_files, 0);
    assert!(canonical_a.exists());

    let mut fresh = RunSummary::default();
    engine.sync(&SyncOptions::default(), &mut fresh).await.unwrap();
    assert!(engine.store().get_cursor(ListingKind::MediaItems).await.unwrap().complete);
    assert_eq!(fresh.deleted_items, 0);
    assert_eq!(std::fs::read(&canonical_a).unwrap(), b"alpha");
}

#[tokio::test]
async fn album_membership_and_listing_removal_walkthrough() {
    let dir = tempdir().unwrap();
    let catalog = Arc::new(FakeCatalog::new(10));
    catalog.put_item("A", "A.jpg", datetime!(2023-01-05 12:00 UTC), b"A");
    catalog.put_item("B", "B.jpg", datetime!(2023-02-06 12:00 UTC), b"B");
    catalog.put_album("trip", "Trip", &["A"]);
    let engine = engine(dir.path(), catalog.clone()).await;
    let canonical_a = dir.path().join("items/2023/01/A.jpg");
    let link_a = dir.path().join("albums/Trip/A.jpg");

    engine
        .sync(&SyncOptions::default(), &mut RunSummary::default())
        .await
        .unwrap();
    assert!(canonical_a.exists());
    assert!(dir.path().join("items/2023/02/B.jpg").exists());
    assert_eq!(std::fs::read(&link_a).unwrap(), b"A");

    catalog.put_album("trip", "Trip", &[]);
    engine
        .sync(&SyncOptions::default(), &mut RunSummary::default())
        .await
        .unwrap();
    assert!(std::fs::symlink_metadata(&link_a).is_err());
    assert!(canonical_a.exists());

    catalog.remove_item("A");
    let mut summary = RunSummary::default();
    engine.sync(&SyncOptions::default(), &mut summary).await.unwrap();
    assert_eq!(summary.deleted_files, 1);
    assert!(!canonical_a.exists());
    assert!(dir.path().join("items/2023/02/B.jpg").exists());
}

#[tokio::test]
async fn album_only_members_are_hydrated_and_downloaded() {
    let dir = tempdir().unwrap();
    let catalog = Arc::new(FakeCatalog::new(10));
    catalog.put_item("x", "X.jpg", datetime!(2024-06-01 00:00 UTC), b"x");
    catalog.put_album("al", "Shared", &["x"]);
    let engine = engine(dir.path(), catalog.clone()).await;

    // Albums first, so "x" starts out as a placeholder.
    let mut summary = RunSummary::default();
    engine
        .index(
            &photosync::sync::indexer::IndexOptions {
                scope: photosync::sync::indexer::IndexScope::AlbumsOnly,
                ..Default::default()
            },
            &mut summary,
        )
        .await
        .unwrap();
    assert_eq!(summary.placeholders, 1);
    engine.download(&mut summary).await.unwrap();
    engine.materialize_albums(&mut summary).await.unwrap();

    assert_eq!(summary.downloaded, 1);
    assert_eq!(
        std::fs::read(dir.path().join("items/2024/06/X.jpg")).unwrap(),
        b"x"
    );
    assert_eq!(
        std::fs::read(dir.path().join("albums/Shared/X.jpg")).unwrap(),
        b"x"
    );
}
