//! Recovery supervisor.
//!
//! The periodic sweep that makes the pipeline self-healing:
//!
//! 1. Images stuck in `processing` past the stall threshold are reset to
//!    `pending` with their error cleared.
//! 2. Every `processing` folder has its persisted counts reconciled against
//!    the live rows.
//! 3. Folders holding pending images but not marked `processing` are marked
//!    and re-queued.
//! 4. Queue jobs active past the stall threshold are declared stalled.
//! 5. Pending images of every non-completed folder are re-queued in batches
//!    of five.
//!
//! The sweep runs at worker startup and then every minute. It is safe under
//! concurrent execution with the workers: every write goes through the same
//! status guards the workers use, so a racing claim simply wins.
//!
//! Manual retry (the `Retry` surface) lives here too — it shares the reset
//! and re-queue machinery.

use chrono::{Duration as ChronoDuration, Utc};
use rand::Rng;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use uuid::Uuid;

use crate::app::AppContext;
use crate::error::{Error, Result};
use crate::folder_worker::BATCH_SIZE;
use crate::models::{
    batch_job_id, folder_job_id, image_job_id, JobPayload, Status, FOLDER_QUEUE, IMAGE_QUEUE,
};
use crate::store::ResetScope;

const SWEEP_EVERY: std::time::Duration = std::time::Duration::from_secs(60);
/// Retention horizons applied on each sweep.
const COMPLETED_RETENTION_MINUTES: i64 = 60;
const FAILED_RETENTION_HOURS: i64 = 24;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub reset_images: usize,
    pub reconciled_folders: usize,
    pub requeued_folders: usize,
    pub stalled_jobs: usize,
    pub requeued_batches: usize,
}

/// One full sweep; see module docs for the five steps.
pub async fn run_sweep(ctx: &AppContext) -> Result<SweepReport> {
    let cutoff = ctx.stall_cutoff();
    let mut report = SweepReport::default();

    // 1. Stuck rows back to pending.
    let stuck = ctx.store.stuck_processing_images(cutoff).await?;
    if !stuck.is_empty() {
        let ids: Vec<Uuid> = stuck.iter().map(|i| i.id).collect();
        let reset = ctx
            .store
            .reset_images_to_pending(ResetScope::Images(ids))
            .await?;
        report.reset_images = reset.len();
    }

    // 2. Reconcile processing folders against committed rows.
    for folder in ctx.store.list_folders(Some(Status::Processing)).await? {
        let updated = ctx.store.update_folder_progress(folder.id).await?;
        ctx.progress
            .update(folder.id, updated.total_images, updated.processed_images);
        report.reconciled_folders += 1;
    }

    // 3. Folders with pending work that nothing is driving.
    for folder in ctx.store.folders_with_pending_images().await? {
        if folder.status != Status::Processing {
            ctx.store
                .set_folder_status(folder.id, Status::Processing)
                .await?;
            let job_id = folder_job_id(&folder.drive_folder_id, Utc::now().timestamp_millis());
            ctx.queue
                .enqueue(
                    FOLDER_QUEUE,
                    &job_id,
                    JobPayload::Folder {
                        folder_id: folder.id,
                        credential: None,
                    },
                )
                .await?;
            report.requeued_folders += 1;
        }
    }

    // 4. Stalled queue jobs.
    report.stalled_jobs = ctx.queue.recover_stalled(cutoff).await?.len();

    // 5. Re-queue pending images of non-completed folders.
    for folder in ctx.store.list_folders(None).await? {
        if folder.status == Status::Completed {
            continue;
        }
        let pending = ctx.store.list_pending_images(folder.id, i64::MAX).await?;
        for chunk in pending.chunks(BATCH_SIZE) {
            let job_id = batch_job_id(
                folder.id,
                Utc::now().timestamp_millis(),
                rand::thread_rng().gen(),
            );
            ctx.queue
                .enqueue(
                    IMAGE_QUEUE,
                    &job_id,
                    JobPayload::ImageBatch {
                        folder_id: folder.id,
                        image_ids: chunk.iter().map(|i| i.id).collect(),
                        credential: None,
                    },
                )
                .await?;
            report.requeued_batches += 1;
        }
    }

    // Bounded retention: completed jobs go quickly, failed stick around.
    let now = Utc::now();
    ctx.queue
        .prune(
            now - ChronoDuration::minutes(COMPLETED_RETENTION_MINUTES),
            now - ChronoDuration::hours(FAILED_RETENTION_HOURS),
        )
        .await?;

    if report != SweepReport::default() {
        info!(
            reset_images = report.reset_images,
            requeued_folders = report.requeued_folders,
            stalled_jobs = report.stalled_jobs,
            requeued_batches = report.requeued_batches,
            "recovery sweep acted"
        );
    }

    Ok(report)
}

/// Supervisor loop: sweep on start, then every minute until shutdown.
pub async fn run_loop(ctx: Arc<AppContext>, shutdown: CancellationToken) {
    loop {
        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(SWEEP_EVERY) => {}
        }
        if let Err(e) = run_sweep(&ctx).await {
            warn!(error = %e, "recovery sweep failed");
        }
    }
}

/// Target of a manual retry: exactly one of an image or a whole folder.
#[derive(Debug, Clone, Copy)]
pub enum RetryTarget {
    Image(Uuid),
    Folder(Uuid),
}

/// Resets the targeted rows to `pending` and enqueues one image job per
/// version token (the idempotency key dedups re-submissions).
/// Returns how many jobs were newly queued.
pub async fn retry(ctx: &AppContext, target: RetryTarget) -> Result<u64> {
    let reset = match target {
        RetryTarget::Image(id) => {
            if ctx.store.get_image(id).await?.is_none() {
                return Err(Error::NotFound(format!("image {id}")));
            }
            ctx.store
                .reset_images_to_pending(ResetScope::Image(id))
                .await?
        }
        RetryTarget::Folder(id) => {
            if ctx.store.get_folder(id).await?.is_none() {
                return Err(Error::NotFound(format!("folder {id}")));
            }
            ctx.store
                .reset_images_to_pending(ResetScope::FolderRetryable(id))
                .await?
        }
    };

    let mut queued = 0u64;
    for image in &reset {
        let job_id = image_job_id(&image.drive_file_id, image.version.as_deref());
        if ctx
            .queue
            .enqueue(
                IMAGE_QUEUE,
                &job_id,
                JobPayload::Image {
                    image_id: image.id,
                    credential: None,
                },
            )
            .await?
        {
            queued += 1;
        }
    }

    if let RetryTarget::Folder(folder_id) = target {
        if queued > 0 {
            ctx.store
                .set_folder_status(folder_id, Status::Processing)
                .await?;
        }
    }

    info!(?target, queued, "retry queued");
    Ok(queued)
}
