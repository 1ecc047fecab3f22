//! File API integration tests: listing, search, directory and rename
//! operations, permanent delete, and favorites.

mod common;

use std::time::Duration;

use common::{WAIT, fixture, fixture_with, lp};
use hearth_kernel::{ChangeFlow, ChangeKind};
use hearth_types::{ErrorCode, FileKind, FileOperation, LogicalPath};

fn names(listing: &hearth_types::DirectoryListing) -> Vec<&str> {
    listing.files.iter().map(|f| f.name.as_str()).collect()
}

// ============================================================================
// Listing and status
// ============================================================================

#[tokio::test]
async fn test_root_lists_base_directories() {
    let fx = fixture().await;
    let listing = fx.hearth.files().list(&LogicalPath::root()).await.unwrap();

    let mut found = names(&listing);
    found.sort_unstable();
    assert_eq!(found, vec!["Apps", "Backups", "External", "Home", "Network", "Trash"]);
    assert!(listing.directory.allowed_operations.is_empty());
    assert!(listing.files.iter().all(|f| f.kind == FileKind::Directory));

    let home = listing.files.iter().find(|f| f.name == "Home").unwrap();
    assert!(home.allows(FileOperation::Writable));
    assert!(!home.allows(FileOperation::Trash));
}

#[tokio::test]
async fn test_listing_hides_and_sorts() {
    let fx = fixture().await;
    fx.write("/Home/b.txt", b"bb");
    fx.write("/Home/a.txt", b"a");
    fx.write("/Home/.DS_Store", b"");
    fx.write("/Home/movie.mkv.hearth-upload", b"partial");
    fx.mkdir("/Home/Dir");

    let listing = fx.hearth.files().list(&lp("/Home")).await.unwrap();
    assert_eq!(names(&listing), vec!["Dir", "a.txt", "b.txt"]);
    assert!(listing.truncated_at.is_none());
    assert_eq!(listing.directory.path, lp("/Home"));

    let dir = &listing.files[0];
    assert_eq!(dir.kind, FileKind::Directory);
    assert_eq!(dir.size, 0);
    assert!(dir.mime_type.is_none());
    assert!(dir.allows(FileOperation::Favorite));

    let b = &listing.files[2];
    assert_eq!(b.path, lp("/Home/b.txt"));
    assert_eq!(b.size, 2);
    assert_eq!(b.mime_type.as_deref(), Some("text/plain"));
    assert!(b.modified_at > 0);
    assert!(b.allows(FileOperation::Trash));
    assert!(!b.allows(FileOperation::Delete));
}

#[tokio::test]
async fn test_listing_truncates_large_directories() {
    let fx = fixture_with(|c| c.max_directory_listing = 3).await;
    for i in 0..5 {
        fx.write(&format!("/Home/Many/file-{i}.txt"), b"x");
    }

    let listing = fx.hearth.files().list(&lp("/Home/Many")).await.unwrap();
    assert_eq!(listing.files.len(), 3);
    assert_eq!(listing.truncated_at, Some(3));
}

#[tokio::test]
async fn test_status_and_list_errors() {
    let fx = fixture().await;
    fx.write("/Home/a.txt", b"x");

    let err = fx.hearth.files().status(&lp("/Home/nope")).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::DoesNotExist);

    let err = fx.hearth.files().list(&lp("/Home/a.txt")).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidPath);

    let err = fx.hearth.files().list(&lp("/Nowhere")).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidBase);

    // `..` cannot climb out of a base: it normalizes to an unmapped root.
    let err = fx.hearth.files().status(&lp("/Home/../../etc/passwd")).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidBase);
}

#[tokio::test]
async fn test_symlinks_are_reported_not_followed() {
    let fx = fixture().await;
    fx.mkdir("/Home/Real");
    std::os::unix::fs::symlink(fx.physical("/Home/Real"), fx.physical("/Home/alias")).unwrap();

    let item = fx.hearth.files().status(&lp("/Home/alias")).await.unwrap();
    assert_eq!(item.kind, FileKind::Symlink);
}

#[tokio::test]
async fn test_allowed_operations_follow_policy() {
    let fx = fixture().await;
    fx.mkdir("/Home/Downloads");

    let downloads = fx.hearth.files().allowed_operations(&lp("/Home/Downloads")).await.unwrap();
    assert!(!downloads.contains(&FileOperation::Rename));
    assert!(downloads.contains(&FileOperation::Copy));

    let backups = fx.hearth.files().allowed_operations(&lp("/Backups/r1")).await.unwrap();
    assert!(!backups.contains(&FileOperation::Writable));
    assert!(!backups.contains(&FileOperation::Trash));

    assert!(fx.hearth.files().allowed_operations(&LogicalPath::root()).await.unwrap().is_empty());
}

// ============================================================================
// Search
// ============================================================================

#[tokio::test]
async fn test_search_is_case_insensitive_and_bounded() {
    let fx = fixture().await;
    fx.write("/Home/Docs/Report-2024.pdf", b"pdf");
    fx.write("/Home/Photos/report.png", b"png");
    fx.write("/Home/other.txt", b"txt");
    fx.write("/Home/Docs/.DS_Store", b"");

    let mut hits: Vec<String> = fx
        .hearth
        .files()
        .search(&lp("/Home"), "REPORT", None)
        .await
        .unwrap()
        .into_iter()
        .map(|item| item.path.to_string())
        .collect();
    hits.sort();
    assert_eq!(hits, vec!["/Home/Docs/Report-2024.pdf", "/Home/Photos/report.png"]);

    let limited = fx.hearth.files().search(&lp("/Home"), "report", Some(1)).await.unwrap();
    assert_eq!(limited.len(), 1);

    let everywhere = fx.hearth.files().search(&LogicalPath::root(), "other", None).await.unwrap();
    assert_eq!(everywhere.len(), 1);
    assert_eq!(everywhere[0].path, lp("/Home/other.txt"));

    assert!(fx.hearth.files().search(&lp("/Home"), "  ", None).await.unwrap().is_empty());
    assert!(fx.hearth.files().search(&lp("/Home"), "ds_store", None).await.unwrap().is_empty());
}

// ============================================================================
// Create, rename, delete
// ============================================================================

#[tokio::test]
async fn test_create_directory() {
    let fx = fixture().await;
    fx.write("/Home/a.txt", b"x");
    let files = fx.hearth.files();

    assert_eq!(files.create_directory(&lp("/Home/New")).await.unwrap(), lp("/Home/New"));
    // Already there as a directory: still success.
    assert_eq!(files.create_directory(&lp("/Home/New")).await.unwrap(), lp("/Home/New"));

    let err = files.create_directory(&lp("/Home/a.txt")).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::DestinationAlreadyExists);

    let err = files.create_directory(&lp("/Home/missing/child")).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ParentNotExist);

    let err = files.create_directory(&lp("/Home/a.txt/child")).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::ParentNotDirectory);

    let err = files.create_directory(&lp("/External/usb")).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::OperationNotAllowed);
}

#[tokio::test]
async fn test_rename() {
    let fx = fixture().await;
    fx.write("/Home/a.txt", b"x");
    fx.write("/Home/taken.txt", b"y");
    fx.mkdir("/Home/Downloads");
    let files = fx.hearth.files();

    assert_eq!(files.rename(&lp("/Home/a.txt"), "b.txt").await.unwrap(), lp("/Home/b.txt"));
    assert!(!fx.exists("/Home/a.txt"));
    assert_eq!(fx.read("/Home/b.txt"), b"x");

    assert_eq!(files.rename(&lp("/Home/b.txt"), "b.txt").await.unwrap(), lp("/Home/b.txt"));

    let err = files.rename(&lp("/Home/b.txt"), "taken.txt").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::DestinationAlreadyExists);

    for bad in ["", "..", "x/y"] {
        let err = files.rename(&lp("/Home/b.txt"), bad).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidFilename, "name {bad:?}");
    }

    let err = files.rename(&lp("/Home/Downloads"), "Stuff").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::OperationNotAllowed);

    let err = files.rename(&lp("/Home/ghost"), "x").await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::SourceNotExists);
}

#[tokio::test]
async fn test_delete_only_where_allowed() {
    let fx = fixture().await;
    fx.write("/Home/a.txt", b"x");

    let err = fx.hearth.files().delete(&lp("/Home/a.txt")).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::OperationNotAllowed);

    let job = fx.hearth.files().trash(vec![lp("/Home/a.txt")]).await.unwrap();
    fx.wait(job.id).await;
    let meta = fx.hearth.config().trash_meta_dir().join("a.txt.json");
    assert!(meta.exists());

    assert!(fx.hearth.files().delete(&lp("/Trash/a.txt")).await.unwrap());
    assert!(!fx.exists("/Trash/a.txt"));
    assert!(!meta.exists());

    let err = fx.hearth.files().delete(&lp("/Trash/a.txt")).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::DoesNotExist);
}

#[tokio::test]
async fn test_delete_on_removable_storage() {
    let fx = fixture().await;
    fx.write("/External/usb/old.iso", b"iso");

    let ops = fx.hearth.files().allowed_operations(&lp("/External/usb/old.iso")).await.unwrap();
    assert!(!ops.contains(&FileOperation::Trash));
    assert!(fx.hearth.files().delete(&lp("/External/usb/old.iso")).await.unwrap());
    assert!(!fx.exists("/External/usb/old.iso"));
}

#[tokio::test]
async fn test_empty_trash() {
    let fx = fixture().await;
    fx.write("/Home/a.txt", b"a");
    fx.write("/Home/Dir/b.txt", b"b");
    let job = fx
        .hearth
        .files()
        .trash(vec![lp("/Home/a.txt"), lp("/Home/Dir")])
        .await
        .unwrap();
    assert_eq!(fx.wait(job.id).await.results, vec![lp("/Trash/a.txt"), lp("/Trash/Dir")]);

    assert!(fx.hearth.files().empty_trash().await.unwrap());
    assert!(fx.hearth.files().list(&lp("/Trash")).await.unwrap().files.is_empty());
    let records = std::fs::read_dir(fx.hearth.config().trash_meta_dir()).unwrap().count();
    assert_eq!(records, 0);
}

// ============================================================================
// Favorites
// ============================================================================

#[tokio::test]
async fn test_favorites() {
    let fx = fixture().await;
    let favorites = fx.hearth.favorites();

    // Defaults only show once they exist.
    assert!(favorites.list().await.unwrap().is_empty());
    fx.mkdir("/Home/Documents");
    assert_eq!(favorites.list().await.unwrap(), vec![lp("/Home/Documents")]);

    fx.mkdir("/Home/Projects");
    assert!(favorites.add(&lp("/Home/Projects")).await.unwrap());
    assert!(!favorites.add(&lp("/Home/Projects")).await.unwrap());
    assert_eq!(
        favorites.list().await.unwrap(),
        vec![lp("/Home/Documents"), lp("/Home/Projects")]
    );

    fx.write("/Home/a.txt", b"x");
    let err = favorites.add(&lp("/Home/a.txt")).await.unwrap_err();
    assert_eq!(err.code(), ErrorCode::OperationNotAllowed);

    assert!(favorites.remove(&lp("/Home/Documents")).await.unwrap());
    assert!(!favorites.remove(&lp("/Home/Documents")).await.unwrap());
    assert_eq!(favorites.list().await.unwrap(), vec![lp("/Home/Projects")]);
}

#[tokio::test]
async fn test_deleted_favorites_are_forgotten() {
    let fx = fixture().await;
    fx.mkdir("/Home/Projects/hearth");
    fx.mkdir("/Home/Music");
    let favorites = fx.hearth.favorites();
    favorites.add(&lp("/Home/Projects/hearth")).await.unwrap();
    favorites.add(&lp("/Home/Music")).await.unwrap();

    let removed = favorites
        .handle_change(&ChangeFlow { path: lp("/Home/Projects"), kind: ChangeKind::Deleted })
        .await
        .unwrap();
    assert_eq!(removed, 1);

    let ignored = favorites
        .handle_change(&ChangeFlow { path: lp("/Home/Music"), kind: ChangeKind::Modified })
        .await
        .unwrap();
    assert_eq!(ignored, 0);
}

#[tokio::test]
async fn test_watcher_drops_deleted_favorite() {
    let fx = fixture().await;
    fx.mkdir("/Home/Projects");
    let favorites_file = fx.hearth.config().favorites_path();
    fx.hearth.favorites().add(&lp("/Home/Projects")).await.unwrap();

    let notifier = fx.hearth.start_notifier().unwrap();
    assert!(notifier.watched().contains(&lp("/Home")));
    let tasks = fx.hearth.spawn_background();

    std::fs::remove_dir_all(fx.physical("/Home/Projects")).unwrap();

    tokio::time::timeout(WAIT, async {
        loop {
            let raw = std::fs::read(&favorites_file).unwrap();
            let stored: Vec<LogicalPath> = serde_json::from_slice(&raw).unwrap();
            if !stored.contains(&lp("/Home/Projects")) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    })
    .await
    .expect("favorite was never dropped");

    fx.hearth.shutdown();
    notifier.stop();
    for task in tasks {
        tokio::time::timeout(WAIT, task).await.unwrap().unwrap();
    }
}
