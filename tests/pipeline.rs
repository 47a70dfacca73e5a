//! End-to-end pipeline scenarios: ingest through workers to completed rows.

mod common;

use common::{drain, drive_file, harness, harness_with, test_config};

use drivelens::error::Error;
use drivelens::image_worker::{run_image_batch, BatchOutcome};
use drivelens::ingest::{self, IngestRequest};
use drivelens::models::{ImageRecord, Status};
use drivelens::store::memory::MemoryStore;
use std::sync::Arc;

fn request(url: &str) -> IngestRequest {
    IngestRequest {
        folder_url: url.to_string(),
        user_id: None,
        credential: None,
    }
}

const FA_URL: &str = "https://drive.google.com/drive/folders/FA";

#[tokio::test]
async fn fresh_ingest_processes_supported_images_only() {
    let h = harness();
    h.drive.set_listing(
        "FA",
        "Vacation",
        vec![
            drive_file("J1", "J1.jpeg", "image/jpeg"),
            drive_file("P1", "P1.png", "image/png"),
            drive_file("H1", "H1.heic", "image/heic"),
        ],
    );

    let snapshot = ingest::submit(&h.ctx, request(FA_URL)).await.unwrap();
    assert_eq!(snapshot.total_images, 2, "heic is skipped at listing time");
    assert_eq!(snapshot.status, Status::Pending);
    assert_eq!(snapshot.name.as_deref(), Some("Vacation"));

    drain(&h.ctx).await;

    let folder = h.ctx.store.get_folder(snapshot.id).await.unwrap().unwrap();
    assert_eq!(folder.status, Status::Completed);
    assert_eq!(folder.processed_images, 2);
    assert_eq!(folder.total_images, 2);

    for image in h.ctx.store.list_images(snapshot.id).await.unwrap() {
        assert_eq!(image.status, Status::Completed);
        assert!(image.caption.is_some());
        assert!(image.tags.is_some());
        assert!(image.caption_vec.is_some());
        assert!(image.error.is_none());
    }
}

#[tokio::test]
async fn folder_cap_rejects_before_creating_rows() {
    let mut config = test_config();
    config.workers.max_images_per_folder = 2;
    let h = harness_with(config, Arc::new(MemoryStore::new()));

    h.drive.set_listing(
        "FA",
        "Big",
        vec![
            drive_file("A", "a.jpg", "image/jpeg"),
            drive_file("B", "b.jpg", "image/jpeg"),
            drive_file("C", "c.jpg", "image/jpeg"),
        ],
    );

    let err = ingest::submit(&h.ctx, request(FA_URL)).await.unwrap_err();
    assert!(matches!(
        err,
        Error::FolderCapExceeded { found: 3, cap: 2 }
    ));

    // No folder row was created.
    assert!(h
        .ctx
        .store
        .get_folder_by_drive_id("FA")
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn empty_folder_is_rejected() {
    let h = harness();
    h.drive.set_listing("FA", "Empty", vec![]);

    let err = ingest::submit(&h.ctx, request(FA_URL)).await.unwrap_err();
    assert!(matches!(err, Error::EmptyFolder));
}

#[tokio::test]
async fn malformed_url_is_rejected_without_network() {
    let h = harness();
    let err = ingest::submit(&h.ctx, request("https://example.com/folders/FA"))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::InvalidUrl(_)));
}

#[tokio::test]
async fn private_folder_surfaces_permission_denied() {
    let h = harness();
    // No listing registered for FA: the scripted drive denies access.
    let err = ingest::submit(&h.ctx, request(FA_URL)).await.unwrap_err();
    assert!(matches!(err, Error::PermissionDenied(_)));
}

#[tokio::test]
async fn ingest_is_idempotent() {
    let h = harness();
    h.drive.set_listing(
        "FA",
        "Stable",
        vec![
            drive_file("A", "a.jpg", "image/jpeg"),
            drive_file("B", "b.jpg", "image/jpeg"),
        ],
    );

    let first = ingest::submit(&h.ctx, request(FA_URL)).await.unwrap();
    drain(&h.ctx).await;

    let second = ingest::submit(&h.ctx, request(FA_URL)).await.unwrap();
    assert_eq!(first.id, second.id, "same folder row on re-submission");
    assert_eq!(second.total_images, 2);

    let images = h.ctx.store.list_images(first.id).await.unwrap();
    assert_eq!(images.len(), 2, "re-ingest creates no new image rows");
    assert_eq!(second.status, Status::Completed);
}

#[tokio::test]
async fn batch_isolates_member_failures() {
    let h = harness();
    h.drive.set_listing(
        "FA",
        "Mixed",
        vec![
            drive_file("A", "a.jpg", "image/jpeg"),
            drive_file("B", "b.jpg", "image/jpeg"),
            drive_file("D", "d.jpg", "image/jpeg"),
            drive_file("E", "e.jpg", "image/jpeg"),
        ],
    );

    let snapshot = ingest::submit(&h.ctx, request(FA_URL)).await.unwrap();

    // A legacy row with an unsupported MIME type sits in the middle of the
    // batch; such rows predate listing-time filtering.
    let heic = ImageRecord::pending(
        snapshot.id,
        &drive_file("C", "c.heic", "image/heic"),
    );
    h.ctx.store.create_images_bulk(&[heic.clone()]).await.unwrap();

    let mut ids: Vec<_> = h
        .ctx
        .store
        .list_images(snapshot.id)
        .await
        .unwrap()
        .iter()
        .map(|i| i.id)
        .collect();
    ids.sort();

    let outcome = run_image_batch(&h.ctx, &ids, None).await.unwrap();
    assert_eq!(
        outcome,
        BatchOutcome {
            processed: 4,
            failed: 1
        }
    );

    let failed = h.ctx.store.get_image(heic.id).await.unwrap().unwrap();
    assert_eq!(failed.status, Status::Failed);
    assert!(failed
        .error
        .as_deref()
        .unwrap()
        .contains("Unsupported MIME type"));

    let folder = h.ctx.store.get_folder(snapshot.id).await.unwrap().unwrap();
    assert_eq!(folder.processed_images, 4);
    assert_eq!(folder.total_images, 5);
    assert_ne!(folder.status, Status::Completed);
}

#[tokio::test]
async fn download_failure_is_recorded_per_row() {
    let h = harness();
    h.drive.set_listing(
        "FA",
        "Flaky",
        vec![
            drive_file("A", "a.jpg", "image/jpeg"),
            drive_file("B", "b.jpg", "image/jpeg"),
        ],
    );
    h.drive.fail_download("B");

    let snapshot = ingest::submit(&h.ctx, request(FA_URL)).await.unwrap();
    drain(&h.ctx).await;

    let images = h.ctx.store.list_images(snapshot.id).await.unwrap();
    let a = images.iter().find(|i| i.name == "a.jpg").unwrap();
    let b = images.iter().find(|i| i.name == "b.jpg").unwrap();
    assert_eq!(a.status, Status::Completed);
    assert_eq!(b.status, Status::Failed);
    assert!(b.error.as_deref().unwrap().contains("download failed"));

    let folder = h.ctx.store.get_folder(snapshot.id).await.unwrap().unwrap();
    assert_eq!(folder.processed_images, 1);
    assert!(folder.processed_images <= folder.total_images);
}

#[tokio::test]
async fn captioning_auth_failure_returns_batch_members_to_pending() {
    let h = harness();
    h.drive.set_listing(
        "FA",
        "Locked out",
        vec![
            drive_file("A", "a.jpg", "image/jpeg"),
            drive_file("B", "b.jpg", "image/jpeg"),
            drive_file("C", "c.jpg", "image/jpeg"),
        ],
    );
    h.captioner.break_auth();

    let snapshot = ingest::submit(&h.ctx, request(FA_URL)).await.unwrap();
    drain(&h.ctx).await;

    // Nothing failed permanently: every member went back to pending so it
    // retries once credentials recover.
    let images = h.ctx.store.list_images(snapshot.id).await.unwrap();
    for image in &images {
        assert_eq!(image.status, Status::Pending, "{} not pending", image.name);
        assert!(image.error.is_none());
    }

    let folder = h.ctx.store.get_folder(snapshot.id).await.unwrap().unwrap();
    assert_eq!(folder.processed_images, 0);
}

#[tokio::test]
async fn folder_job_error_propagates_for_queue_retry() {
    let h = harness();
    // A job against a folder the store no longer has must rethrow so the
    // queue applies its retry policy rather than silently completing.
    let missing = uuid::Uuid::new_v4();
    let result = drivelens::folder_worker::run_folder_job(&h.ctx, missing, None).await;
    assert!(result.is_err());
}
