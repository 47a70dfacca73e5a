//! Sync reconciliation and recovery-supervisor behavior.

mod common;

use common::{drain, drive_file, harness, harness_with, test_config};

use drivelens::error::Error;
use drivelens::ingest::{self, IngestRequest};
use drivelens::models::{Status, IMAGE_QUEUE};
use drivelens::recovery::{self, RetryTarget};
use drivelens::store::memory::MemoryStore;
use drivelens::sync::sync_folder;
use std::sync::Arc;
use uuid::Uuid;

const FA_URL: &str = "https://drive.google.com/drive/folders/FA";

fn request() -> IngestRequest {
    IngestRequest {
        folder_url: FA_URL.to_string(),
        user_id: None,
        credential: None,
    }
}

#[tokio::test]
async fn sync_round_trip_restores_pre_state() {
    let h = harness();
    let base = vec![
        drive_file("A", "a.jpg", "image/jpeg"),
        drive_file("B", "b.jpg", "image/jpeg"),
    ];
    h.drive.set_listing("FA", "Album", base.clone());

    let snapshot = ingest::submit(&h.ctx, request()).await.unwrap();
    drain(&h.ctx).await;

    // Drive-side add of X…
    let mut with_x = base.clone();
    with_x.push(drive_file("X", "x.jpg", "image/jpeg"));
    h.drive.set_listing("FA", "Album", with_x);

    let report = sync_folder(&h.ctx, snapshot.id, None).await.unwrap();
    assert_eq!(report.added, 1);
    assert_eq!(report.removed, 0);
    assert_eq!(report.status, Status::Processing);
    assert_eq!(report.total_images, 3);
    drain(&h.ctx).await;

    // …followed by a drive-side delete of X.
    h.drive.set_listing("FA", "Album", base);
    let report = sync_folder(&h.ctx, snapshot.id, None).await.unwrap();
    assert_eq!(report.added, 0);
    assert_eq!(report.removed, 1);

    // Back to the pre-state, completed in the same pass.
    assert_eq!(report.total_images, 2);
    assert_eq!(report.processed_images, 2);
    assert_eq!(report.status, Status::Completed);

    let names: Vec<String> = h
        .ctx
        .store
        .list_images(snapshot.id)
        .await
        .unwrap()
        .iter()
        .map(|i| i.name.clone())
        .collect();
    assert_eq!(names, vec!["a.jpg", "b.jpg"]);
}

#[tokio::test]
async fn sync_with_no_changes_is_a_noop() {
    let h = harness();
    h.drive.set_listing(
        "FA",
        "Static",
        vec![drive_file("A", "a.jpg", "image/jpeg")],
    );
    let snapshot = ingest::submit(&h.ctx, request()).await.unwrap();
    drain(&h.ctx).await;

    let before = h.ctx.store.get_folder(snapshot.id).await.unwrap().unwrap();
    let report = sync_folder(&h.ctx, snapshot.id, None).await.unwrap();
    assert_eq!(report.added, 0);
    assert_eq!(report.removed, 0);
    assert_eq!(report.status, Status::Completed);

    // No jobs were queued by the empty diff.
    assert_eq!(h.ctx.queue.counts(IMAGE_QUEUE).await.unwrap().pending, 0);

    let after = h.ctx.store.get_folder(snapshot.id).await.unwrap().unwrap();
    assert_eq!(before.total_images, after.total_images);
    assert_eq!(before.processed_images, after.processed_images);
}

#[tokio::test]
async fn sync_respects_the_folder_cap() {
    let mut config = test_config();
    config.workers.max_images_per_folder = 2;
    let h = harness_with(config, Arc::new(MemoryStore::new()));

    h.drive.set_listing(
        "FA",
        "Growing",
        vec![drive_file("A", "a.jpg", "image/jpeg")],
    );
    let snapshot = ingest::submit(&h.ctx, request()).await.unwrap();
    drain(&h.ctx).await;

    h.drive.set_listing(
        "FA",
        "Growing",
        vec![
            drive_file("A", "a.jpg", "image/jpeg"),
            drive_file("B", "b.jpg", "image/jpeg"),
            drive_file("C", "c.jpg", "image/jpeg"),
        ],
    );

    let err = sync_folder(&h.ctx, snapshot.id, None).await.unwrap_err();
    assert!(matches!(err, Error::FolderCapExceeded { found: 3, cap: 2 }));

    // Aborted before mutation: the corpus still has one image.
    assert_eq!(h.ctx.store.list_images(snapshot.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn sync_of_unknown_folder_is_not_found() {
    let h = harness();
    let err = sync_folder(&h.ctx, Uuid::new_v4(), None).await.unwrap_err();
    assert!(matches!(err, Error::NotFound(_)));
}

#[tokio::test]
async fn stuck_processing_row_is_recovered_and_completes() {
    let h = harness();
    h.drive.set_listing(
        "FA",
        "Stuck",
        vec![drive_file("A", "a.jpg", "image/jpeg")],
    );
    let snapshot = ingest::submit(&h.ctx, request()).await.unwrap();

    // Claim the row as a worker would, then vanish: the folder job is gone
    // and the row sits in `processing` with no one driving it.
    let image = &h.ctx.store.list_images(snapshot.id).await.unwrap()[0];
    assert!(h.ctx.store.set_image_processing(image.id).await.unwrap());
    h.ctx.queue.purge(drivelens::models::FOLDER_QUEUE).await.unwrap();

    // The harness runs with a zero stall threshold, so the sweep sees the
    // row as stale immediately.
    let report = recovery::run_sweep(&h.ctx).await.unwrap();
    assert_eq!(report.reset_images, 1);
    assert!(report.requeued_batches >= 1);

    let row = h.ctx.store.get_image(image.id).await.unwrap().unwrap();
    assert_eq!(row.status, Status::Pending);
    assert!(row.error.is_none());

    // One batch cycle later the image completes and progress advances.
    drain(&h.ctx).await;
    let folder = h.ctx.store.get_folder(snapshot.id).await.unwrap().unwrap();
    assert_eq!(folder.status, Status::Completed);
    assert_eq!(folder.processed_images, 1);
}

#[tokio::test]
async fn retry_folder_resets_failed_and_pending_rows_once() {
    let h = harness();
    h.drive.set_listing(
        "FA",
        "Retryable",
        vec![
            drive_file("A", "a.jpg", "image/jpeg"),
            drive_file("B", "b.jpg", "image/jpeg"),
            drive_file("C", "c.jpg", "image/jpeg"),
        ],
    );
    h.drive.fail_download("B");

    let snapshot = ingest::submit(&h.ctx, request()).await.unwrap();
    drain(&h.ctx).await;

    let images = h.ctx.store.list_images(snapshot.id).await.unwrap();
    let failed: Vec<_> = images.iter().filter(|i| i.status == Status::Failed).collect();
    assert_eq!(failed.len(), 1);

    let queued = recovery::retry(&h.ctx, RetryTarget::Folder(snapshot.id))
        .await
        .unwrap();
    assert_eq!(queued, 1, "one failed row re-queued");

    // Every previously failed|pending row is pending with error nulled.
    for image in h.ctx.store.list_images(snapshot.id).await.unwrap() {
        if image.drive_file_id == "B" {
            assert_eq!(image.status, Status::Pending);
            assert!(image.error.is_none());
        } else {
            assert_eq!(image.status, Status::Completed, "completed rows untouched");
        }
    }

    // Enqueued exactly once per version token: an immediate second retry
    // dedups against the still-pending job.
    let again = recovery::retry(&h.ctx, RetryTarget::Folder(snapshot.id))
        .await
        .unwrap();
    assert_eq!(again, 0);

    // The scripted download failure persists, so the retried row fails
    // again and stays observable.
    drain(&h.ctx).await;
    let row = h
        .ctx
        .store
        .list_images(snapshot.id)
        .await
        .unwrap()
        .into_iter()
        .find(|i| i.drive_file_id == "B")
        .unwrap();
    assert_eq!(row.status, Status::Failed);
}

#[tokio::test]
async fn retry_single_image_from_completed() {
    let h = harness();
    h.drive.set_listing(
        "FA",
        "Redo",
        vec![drive_file("A", "a.jpg", "image/jpeg")],
    );
    let snapshot = ingest::submit(&h.ctx, request()).await.unwrap();
    drain(&h.ctx).await;

    let image = h.ctx.store.list_images(snapshot.id).await.unwrap().remove(0);
    assert_eq!(image.status, Status::Completed);

    let queued = recovery::retry(&h.ctx, RetryTarget::Image(image.id))
        .await
        .unwrap();
    assert_eq!(queued, 1);

    let row = h.ctx.store.get_image(image.id).await.unwrap().unwrap();
    assert_eq!(row.status, Status::Pending);
    assert!(row.caption.is_none() && row.tags.is_none() && row.caption_vec.is_none());

    drain(&h.ctx).await;
    let row = h.ctx.store.get_image(image.id).await.unwrap().unwrap();
    assert_eq!(row.status, Status::Completed);
}

#[tokio::test]
async fn retry_unknown_targets_are_not_found() {
    let h = harness();
    assert!(matches!(
        recovery::retry(&h.ctx, RetryTarget::Image(Uuid::new_v4())).await,
        Err(Error::NotFound(_))
    ));
    assert!(matches!(
        recovery::retry(&h.ctx, RetryTarget::Folder(Uuid::new_v4())).await,
        Err(Error::NotFound(_))
    ));
}

#[tokio::test]
async fn sweep_requeues_orphaned_pending_folders() {
    let h = harness();
    h.drive.set_listing(
        "FA",
        "Orphan",
        vec![drive_file("A", "a.jpg", "image/jpeg")],
    );
    let snapshot = ingest::submit(&h.ctx, request()).await.unwrap();

    // Drop the folder job: pending rows now have nothing driving them.
    h.ctx.queue.purge(drivelens::models::FOLDER_QUEUE).await.unwrap();

    let report = recovery::run_sweep(&h.ctx).await.unwrap();
    assert_eq!(report.requeued_folders, 1);

    let folder = h.ctx.store.get_folder(snapshot.id).await.unwrap().unwrap();
    assert_eq!(folder.status, Status::Processing);

    drain(&h.ctx).await;
    let folder = h.ctx.store.get_folder(snapshot.id).await.unwrap().unwrap();
    assert_eq!(folder.status, Status::Completed);
}

#[tokio::test]
async fn sweep_is_safe_to_run_concurrently_with_a_drained_system() {
    let h = harness();
    h.drive.set_listing(
        "FA",
        "Quiet",
        vec![drive_file("A", "a.jpg", "image/jpeg")],
    );
    let snapshot = ingest::submit(&h.ctx, request()).await.unwrap();
    drain(&h.ctx).await;

    // Against a fully completed corpus the sweep takes no action.
    let report = recovery::run_sweep(&h.ctx).await.unwrap();
    assert_eq!(report.reset_images, 0);
    assert_eq!(report.requeued_folders, 0);
    assert_eq!(report.requeued_batches, 0);

    let folder = h.ctx.store.get_folder(snapshot.id).await.unwrap().unwrap();
    assert_eq!(folder.status, Status::Completed);
}
