//! Folder job handler.
//!
//! Turns a folder job into image-batch jobs:
//!
//! 1. Mark the folder `processing`.
//! 2. Read every pending image.
//! 3. Initialize the in-memory progress entry.
//! 4. Partition into batches of five and enqueue each as an image-batch job
//!    carrying the optional user credential.
//! 5. Recompute counts; a folder whose counts already match flips to
//!    `completed` inside the recompute transaction.
//!
//! On any failure the folder is marked `failed` and the error rethrown so
//! the queue applies its retry policy.

use chrono::Utc;
use rand::Rng;
use tracing::{info, warn};
use uuid::Uuid;

use crate::app::AppContext;
use crate::error::Result;
use crate::models::{batch_job_id, JobPayload, Status, IMAGE_QUEUE};

/// Images per batch job. Batch members fan out in parallel inside the image
/// worker, so this also bounds per-job fan-out.
pub const BATCH_SIZE: usize = 5;

pub async fn run_folder_job(
    ctx: &AppContext,
    folder_id: Uuid,
    credential: Option<&str>,
) -> Result<()> {
    match process_folder(ctx, folder_id, credential).await {
        Ok(()) => Ok(()),
        Err(e) => {
            warn!(%folder_id, error = %e, "folder job failed");
            if let Err(mark) = ctx.store.set_folder_status(folder_id, Status::Failed).await {
                warn!(%folder_id, error = %mark, "could not mark folder failed");
            }
            Err(e)
        }
    }
}

async fn process_folder(
    ctx: &AppContext,
    folder_id: Uuid,
    credential: Option<&str>,
) -> Result<()> {
    ctx.store
        .set_folder_status(folder_id, Status::Processing)
        .await?;

    let pending = ctx.store.list_pending_images(folder_id, i64::MAX).await?;

    let counts = ctx.store.count_images_by_status(folder_id).await?;
    ctx.progress
        .begin(folder_id, counts.total(), counts.completed);

    let mut batch_jobs = Vec::new();
    for chunk in pending.chunks(BATCH_SIZE) {
        let job_id = batch_job_id(
            folder_id,
            Utc::now().timestamp_millis(),
            rand::thread_rng().gen(),
        );
        batch_jobs.push((
            job_id,
            JobPayload::ImageBatch {
                folder_id,
                image_ids: chunk.iter().map(|i| i.id).collect(),
                credential: credential.map(str::to_string),
            },
        ));
    }
    let enqueued = ctx.queue.enqueue_batch(IMAGE_QUEUE, batch_jobs).await?;

    info!(
        %folder_id,
        pending = pending.len(),
        batches = enqueued,
        "folder fan-out complete"
    );

    let folder = ctx.store.update_folder_progress(folder_id).await?;
    ctx.progress
        .update(folder_id, folder.total_images, folder.processed_images);
    if folder.status == Status::Completed {
        ctx.progress.finish(folder_id);
    }

    Ok(())
}
