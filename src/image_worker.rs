//! Image job handler — the hot path.
//!
//! Batch members fan out in parallel; each runs [`process_one`]:
//!
//! 1. Reject unsupported MIME types immediately (no API quota consumed).
//! 2. Take the row's `pending → processing` transition as the lock.
//! 3. Acquire the captioning limiter.
//! 4. Download the bytes (the drive adapter acquires the drive limiter).
//! 5. Caption, then embed the caption+tags.
//! 6. One atomic write: `completed`, caption, tags, vector.
//! 7. Recompute folder progress from committed rows.
//!
//! # Failure semantics
//!
//! One member's failure never fails the batch: adapter errors are recorded
//! on the row and the member reports `Failed`. The batch job itself succeeds
//! iff every member executed; only store/queue failures propagate so the
//! queue retries the batch (members that already completed are protected by
//! the processing-transition guard on re-run).
//!
//! A quota-auth failure from the captioning service (`PermissionDenied`) is
//! fatal to the whole batch's quota: it trips a shared flag, and members that
//! have not yet passed the flag check put themselves back to `pending` so
//! they are retried once credentials recover.

use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::join_all;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::app::AppContext;
use crate::error::{Error, Result};
use crate::models::{is_supported_mime, ImageRecord};
use crate::store::ResetScope;

/// Per-member outcome; the batch aggregates these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemberOutcome {
    Completed,
    Failed,
    /// Not processed this run: row already owned, already terminal, gone,
    /// or returned to `pending` by the quota short-circuit.
    Skipped,
}

/// Batch job return value.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BatchOutcome {
    pub processed: usize,
    pub failed: usize,
}

pub async fn run_image_batch(
    ctx: &AppContext,
    image_ids: &[Uuid],
    credential: Option<&str>,
) -> Result<BatchOutcome> {
    let quota_down = AtomicBool::new(false);

    let results = join_all(
        image_ids
            .iter()
            .map(|&id| process_one(ctx, id, credential, &quota_down)),
    )
    .await;

    let mut outcome = BatchOutcome::default();
    for result in results {
        match result? {
            MemberOutcome::Completed => outcome.processed += 1,
            MemberOutcome::Failed => outcome.failed += 1,
            MemberOutcome::Skipped => {}
        }
    }
    Ok(outcome)
}

pub async fn run_single_image(
    ctx: &AppContext,
    image_id: Uuid,
    credential: Option<&str>,
) -> Result<()> {
    let quota_down = AtomicBool::new(false);
    process_one(ctx, image_id, credential, &quota_down).await?;
    Ok(())
}

/// Processes one image end to end. Returns `Err` only for store failures;
/// upstream adapter errors become row writes.
pub async fn process_one(
    ctx: &AppContext,
    image_id: Uuid,
    credential: Option<&str>,
    quota_down: &AtomicBool,
) -> Result<MemberOutcome> {
    let Some(image) = ctx.store.get_image(image_id).await? else {
        // Removed by sync between enqueue and execution.
        return Ok(MemberOutcome::Skipped);
    };

    if !is_supported_mime(&image.mime_type) {
        ctx.store
            .set_image_failed(
                image.id,
                &format!("Unsupported MIME type: {}", image.mime_type),
            )
            .await?;
        bump_progress(ctx, &image).await?;
        return Ok(MemberOutcome::Failed);
    }

    if quota_down.load(Ordering::SeqCst) {
        ctx.store
            .reset_images_to_pending(ResetScope::Image(image.id))
            .await?;
        return Ok(MemberOutcome::Skipped);
    }

    if !ctx.store.set_image_processing(image.id).await? {
        debug!(image_id = %image.id, "row not pending, another worker owns it");
        return Ok(MemberOutcome::Skipped);
    }

    ctx.caption_limiter.acquire().await;

    if quota_down.load(Ordering::SeqCst) {
        ctx.store
            .reset_images_to_pending(ResetScope::Image(image.id))
            .await?;
        return Ok(MemberOutcome::Skipped);
    }

    let bytes = match ctx
        .drive
        .download_bytes(&image.drive_file_id, credential)
        .await
    {
        Ok(bytes) => bytes,
        Err(e) => return fail_row(ctx, &image, &format!("download failed: {e}")).await,
    };

    let captioned = match ctx.captioner.caption(&bytes, &image.mime_type).await {
        Ok(c) => c,
        Err(Error::PermissionDenied(_)) => {
            // The captioning key is bad for everyone; stop burning quota and
            // let the remaining members retry once credentials recover.
            warn!(image_id = %image.id, "captioning auth failure, short-circuiting batch");
            quota_down.store(true, Ordering::SeqCst);
            ctx.store
                .reset_images_to_pending(ResetScope::Image(image.id))
                .await?;
            return Ok(MemberOutcome::Skipped);
        }
        Err(e) => return fail_row(ctx, &image, &format!("captioning failed: {e}")).await,
    };

    let vector = match ctx
        .captioner
        .embed_caption(&captioned.caption, &captioned.tags)
        .await
    {
        Ok(v) => v,
        Err(e) => return fail_row(ctx, &image, &format!("embedding failed: {e}")).await,
    };

    ctx.store
        .set_image_completed(
            image.id,
            &captioned.caption,
            &captioned.tags.join(","),
            &vector,
        )
        .await?;

    bump_progress(ctx, &image).await?;
    debug!(image_id = %image.id, name = %image.name, "image completed");
    Ok(MemberOutcome::Completed)
}

async fn fail_row(
    ctx: &AppContext,
    image: &ImageRecord,
    message: &str,
) -> Result<MemberOutcome> {
    warn!(image_id = %image.id, name = %image.name, error = message, "image failed");
    ctx.store.set_image_failed(image.id, message).await?;
    bump_progress(ctx, image).await?;
    Ok(MemberOutcome::Failed)
}

async fn bump_progress(ctx: &AppContext, image: &ImageRecord) -> Result<()> {
    let folder = ctx.store.update_folder_progress(image.folder_id).await?;
    ctx.progress
        .update(folder.id, folder.total_images, folder.processed_images);
    if folder.status == crate::models::Status::Completed {
        ctx.progress.finish(folder.id);
    }
    Ok(())
}
